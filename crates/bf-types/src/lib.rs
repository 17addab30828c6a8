// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by both sides of the microkernel syscall ABI.

pub mod consts;
mod id;
mod reg;
mod status;
pub mod syscall;

pub use id::*;
pub use reg::*;
pub use status::BfStatus;
