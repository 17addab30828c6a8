// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

/// Sentinel shared by every identifier space.
pub const BF_INVALID_ID: u16 = 0xFFFF;

/// The bootstrap physical processor.
pub const BF_BS_PPID: u16 = 0;

/// The VM the root OS runs in. It exists from boot and is never destroyed.
pub const BF_ROOT_VMID: u16 = 0;

// Define a newtype for one of the 16-bit identifier spaces carried across the
// syscall boundary. The raw value is deliberately public through `new`/`get`:
// ids arrive from untrusted registers and are only meaningful once a pool has
// checked them.
//
// This macro takes syntax matching the newtype definition primarily so that
// grepping for the newtype like `struct VpId` finds corresponding macro
// invocations.
macro_rules! define_id {
    {
        $(#[$meta_items:meta])*
        pub struct $id_name:ident(u16);
    } => {
        $(#[$meta_items])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $id_name(u16);

        impl $id_name {
            pub const INVALID: $id_name = $id_name(BF_INVALID_ID);

            pub const fn new(raw: u16) -> Self {
                $id_name(raw)
            }

            pub const fn get(self) -> u16 {
                self.0
            }

            /// Slot index for pool storage.
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            pub const fn is_valid(self) -> bool {
                self.0 != BF_INVALID_ID
            }

            pub const fn is_invalid(self) -> bool {
                self.0 == BF_INVALID_ID
            }

            /// `None` for the sentinel, `Some(self)` otherwise.
            pub const fn valid(self) -> Option<Self> {
                if self.is_valid() {
                    Some(self)
                } else {
                    None
                }
            }

            /// Build an id from the low 16 bits of a register, rejecting
            /// values that do not fit.
            pub fn from_reg(reg: u64) -> Option<Self> {
                u16::try_from(reg).ok().map($id_name)
            }
        }

        impl Default for $id_name {
            fn default() -> Self {
                Self::INVALID
            }
        }

        impl From<u16> for $id_name {
            fn from(raw: u16) -> Self {
                $id_name(raw)
            }
        }

        impl From<$id_name> for u16 {
            fn from(id: $id_name) -> u16 {
                id.0
            }
        }

        impl From<$id_name> for u64 {
            fn from(id: $id_name) -> u64 {
                u64::from(id.0)
            }
        }

        impl fmt::Display for $id_name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#06x}", self.0)
            }
        }
    }
}

define_id! {
    /// Identifies a virtual machine.
    pub struct VmId(u16);
}
define_id! {
    /// Identifies a virtual processor.
    pub struct VpId(u16);
}
define_id! {
    /// Identifies a virtual CPU state.
    pub struct VsId(u16);
}
define_id! {
    /// Identifies a physical processor.
    pub struct PpId(u16);
}
define_id! {
    /// Identifies a loaded extension.
    pub struct ExtId(u16);
}

impl VmId {
    pub const ROOT: VmId = VmId(BF_ROOT_VMID);

    pub const fn is_root(self) -> bool {
        self.0 == BF_ROOT_VMID
    }
}

impl PpId {
    pub const BS: PpId = PpId(BF_BS_PPID);
}

/// Replace the low 16 bits of `reg` with `id`, the way ids are returned in
/// `reg0`.
pub const fn merge_reg_with_id(reg: u64, id: u16) -> u64 {
    (reg & !0xFFFF) | id as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sentinel() {
        assert!(VpId::INVALID.is_invalid());
        assert!(!VpId::INVALID.is_valid());
        assert_eq!(VpId::default(), VpId::INVALID);
        assert_eq!(VpId::INVALID.valid(), None);
        assert_eq!(VpId::new(3).valid(), Some(VpId::new(3)));
    }

    #[test]
    fn from_reg() {
        const TEST_CASES: &[(u64, Option<u16>)] = &[
            (0, Some(0)),
            (0xFFFE, Some(0xFFFE)),
            (0xFFFF, Some(0xFFFF)),
            (0x1_0000, None),
            (u64::MAX, None),
        ];
        for (reg, expected) in TEST_CASES {
            assert_eq!(VsId::from_reg(*reg).map(VsId::get), *expected);
        }
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(VmId::new(0x1a).to_string(), "0x001a");
        assert_eq!(PpId::INVALID.to_string(), "0xffff");
    }

    #[test]
    fn merge_keeps_upper_bits() {
        assert_eq!(
            merge_reg_with_id(0xAAAA_BBBB_CCCC_DDDD, 7),
            0xAAAA_BBBB_CCCC_0007
        );
        assert!(VmId::ROOT.is_root());
        assert!(!VmId::new(1).is_root());
    }

    proptest! {
        #[test]
        fn merged_id_reads_back(reg in any::<u64>(), id in any::<u16>()) {
            let merged = merge_reg_with_id(reg, id);
            let low = VmId::from_reg(merged & 0xFFFF);
            prop_assert_eq!(low, Some(VmId::new(id)));
            prop_assert_eq!(merged >> 16, reg >> 16);
        }
    }
}
