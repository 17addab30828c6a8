// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

/// Status returned by every syscall.
///
/// The encoding is part of the ABI: failures carry `0xDEAD` in the upper 16
/// bits, a one-hot detail in bits 16..48 and a class in the low 16 bits
/// (`1` = failure, `2` = permission, `3` = invalid register).
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    strum::FromRepr,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u64)]
pub enum BfStatus {
    Success = 0,
    FailureUnknown = 0xDEAD_0000_0001_0001,
    FailureInvalidHandle = 0xDEAD_0000_0002_0001,
    FailureUnsupported = 0xDEAD_0000_0004_0001,
    InvalidPermDenied = 0xDEAD_0000_0001_0002,
    InvalidInputReg0 = 0xDEAD_0000_0001_0003,
    InvalidInputReg1 = 0xDEAD_0000_0002_0003,
    InvalidInputReg2 = 0xDEAD_0000_0004_0003,
    InvalidInputReg3 = 0xDEAD_0000_0008_0003,
    InvalidInputReg4 = 0xDEAD_0000_0010_0003,
    InvalidInputReg5 = 0xDEAD_0000_0020_0003,
    InvalidOutputReg0 = 0xDEAD_0000_0040_0003,
    InvalidOutputReg1 = 0xDEAD_0000_0080_0003,
    InvalidOutputReg2 = 0xDEAD_0000_0100_0003,
    InvalidOutputReg3 = 0xDEAD_0000_0200_0003,
    InvalidOutputReg4 = 0xDEAD_0000_0400_0003,
    InvalidOutputReg5 = 0xDEAD_0000_0800_0003,
}

impl BfStatus {
    pub const fn raw(self) -> u64 {
        self as u64
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        Self::from_repr(raw)
    }

    pub const fn is_success(self) -> bool {
        matches!(self, BfStatus::Success)
    }

    /// The `INVALID_INPUT_REGn` status for input register `n`.
    pub const fn invalid_input(n: u8) -> Self {
        match n {
            0 => BfStatus::InvalidInputReg0,
            1 => BfStatus::InvalidInputReg1,
            2 => BfStatus::InvalidInputReg2,
            3 => BfStatus::InvalidInputReg3,
            4 => BfStatus::InvalidInputReg4,
            5 => BfStatus::InvalidInputReg5,
            _ => panic!("there are only six input registers"),
        }
    }

    pub fn name(self) -> &'static str {
        self.into()
    }
}

impl fmt::Display for BfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BF_STATUS_{} ({:#018x})", self.name(), self.raw())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn wire_values() {
        const TEST_CASES: &[(BfStatus, u64)] = &[
            (BfStatus::Success, 0),
            (BfStatus::FailureUnknown, 0xDEAD000000010001),
            (BfStatus::FailureInvalidHandle, 0xDEAD000000020001),
            (BfStatus::FailureUnsupported, 0xDEAD000000040001),
            (BfStatus::InvalidPermDenied, 0xDEAD000000010002),
            (BfStatus::InvalidInputReg1, 0xDEAD000000020003),
            (BfStatus::InvalidInputReg3, 0xDEAD000000080003),
            (BfStatus::InvalidOutputReg5, 0xDEAD000008000003),
        ];
        for (status, raw) in TEST_CASES {
            assert_eq!(status.raw(), *raw, "{status:?}");
            assert_eq!(BfStatus::from_raw(*raw), Some(*status));
        }
    }

    #[test]
    fn unknown_raw_values() {
        assert_eq!(BfStatus::from_raw(1), None);
        assert_eq!(BfStatus::from_raw(0xDEAD000000000003), None);
    }

    #[test]
    fn invalid_input_matches_register() {
        for n in 0..6u8 {
            let status = BfStatus::invalid_input(n);
            assert_eq!((status.raw() >> 16) & 0xFFFF_FFFF, 1 << n);
        }
        assert_eq!(BfStatus::iter().count(), 17);
    }

    #[test]
    fn display() {
        assert_eq!(
            BfStatus::InvalidPermDenied.to_string(),
            "BF_STATUS_INVALID_PERM_DENIED (0xdead000000010002)"
        );
    }
}
