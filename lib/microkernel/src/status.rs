// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Allocation state shared by every lifecycle object.
///
/// ```text
///               allocate
///  Deallocated ----------> Allocated
///       ^                   |  |
///       +-------------------+  | failed teardown
///            deallocate        v
///                           Zombie
/// ```
///
/// `Zombie` is absorbing: only `release` is accepted, and it leaves the
/// object where it is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum AllocatedStatus {
    #[default]
    Deallocated,
    Allocated,
    Zombie,
}
