// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Layout of the syscall word.
//!
//! ```text
//!  63      48 47      32 31      16 15       0
//! +----------+----------+----------+----------+
//! |  0x6642  |  flags   |  family  |  index   |
//! +----------+----------+----------+----------+
//! ```

pub const BF_SYSCALL_SIG_VAL: u64 = 0x6642_0000_0000_0000;
pub const BF_SYSCALL_SIG_MASK: u64 = 0xFFFF_0000_0000_0000;
pub const BF_SYSCALL_FLAGS_MASK: u64 = 0x0000_FFFF_0000_0000;
pub const BF_SYSCALL_OPCODE_MASK: u64 = 0xFFFF_0000_FFFF_0000;
pub const BF_SYSCALL_OPCODE_NOSIG_MASK: u64 = 0x0000_0000_FFFF_0000;
pub const BF_SYSCALL_INDEX_MASK: u64 = 0x0000_0000_0000_FFFF;

pub const fn signature(word: u64) -> u64 {
    word & BF_SYSCALL_SIG_MASK
}

pub const fn flags(word: u64) -> u64 {
    word & BF_SYSCALL_FLAGS_MASK
}

pub const fn opcode(word: u64) -> u64 {
    word & BF_SYSCALL_OPCODE_MASK
}

pub const fn opcode_nosig(word: u64) -> u64 {
    word & BF_SYSCALL_OPCODE_NOSIG_MASK
}

pub const fn index(word: u64) -> u16 {
    (word & BF_SYSCALL_INDEX_MASK) as u16
}

/// Opcode families, selected by bits 16..32 of the syscall word.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::FromRepr, strum::EnumIter,
)]
#[repr(u16)]
pub enum OpFamily {
    Control = 0,
    Handle = 1,
    Debug = 2,
    Callback = 3,
    Vm = 4,
    Vp = 5,
    Vs = 6,
    Intrinsic = 7,
    Mem = 8,
}

impl OpFamily {
    /// Signed opcode, e.g. `0x6642_0000_0004_0000` for [OpFamily::Vm].
    pub const fn opcode(self) -> u64 {
        BF_SYSCALL_SIG_VAL | ((self as u64) << 16)
    }

    pub const fn opcode_nosig(self) -> u64 {
        (self as u64) << 16
    }

    /// Decode the family of a syscall word. Words without the signature
    /// belong to no family.
    pub fn decode(word: u64) -> Option<Self> {
        if signature(word) != BF_SYSCALL_SIG_VAL {
            return None;
        }
        Self::from_repr((opcode_nosig(word) >> 16) as u16)
    }
}

/// An operation within one opcode family.
pub trait SyscallOp: Copy + Sized {
    const FAMILY: OpFamily;

    fn index(self) -> u16;

    fn from_index(index: u16) -> Option<Self>;

    /// Full syscall word for this operation, with no flags set.
    fn word(self) -> u64 {
        Self::FAMILY.opcode() | u64::from(self.index())
    }
}

macro_rules! define_ops {
    {
        $(#[$meta:meta])*
        pub enum $name:ident : $family:ident {
            $($variant:ident = $val:expr,)*
        }
    } => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash,
            strum::FromRepr, strum::EnumIter,
        )]
        #[repr(u16)]
        pub enum $name {
            $($variant = $val,)*
        }

        impl SyscallOp for $name {
            const FAMILY: OpFamily = OpFamily::$family;

            fn index(self) -> u16 {
                self as u16
            }

            fn from_index(index: u16) -> Option<Self> {
                Self::from_repr(index)
            }
        }
    };
}

define_ops! {
    pub enum ControlOp: Control {
        Exit = 0,
        Wait = 1,
    }
}

define_ops! {
    pub enum HandleOp: Handle {
        OpenHandle = 0,
        CloseHandle = 1,
    }
}

define_ops! {
    /// Debug output and dump requests. The kernel model answers all of these
    /// as unsupported.
    pub enum DebugOp: Debug {
        Out = 0,
        DumpVm = 1,
        DumpVp = 2,
        DumpVs = 3,
        DumpVmexitLog = 4,
        WriteC = 5,
        WriteStr = 6,
        DumpExt = 7,
        DumpPagePool = 8,
        DumpHugePool = 9,
    }
}

define_ops! {
    pub enum CallbackOp: Callback {
        RegisterBootstrap = 0,
        RegisterVmexit = 1,
        RegisterFail = 2,
    }
}

define_ops! {
    pub enum VmOp: Vm {
        CreateVm = 0,
        DestroyVm = 1,
        MapDirect = 2,
        UnmapDirect = 3,
        UnmapDirectBroadcast = 4,
        TlbFlush = 5,
    }
}

define_ops! {
    pub enum VpOp: Vp {
        CreateVp = 0,
        DestroyVp = 1,
    }
}

define_ops! {
    pub enum VsOp: Vs {
        CreateVs = 0,
        DestroyVs = 1,
        InitAsRoot = 2,
        Read = 3,
        Write = 4,
        Run = 5,
        RunCurrent = 6,
        AdvanceIpAndRun = 7,
        AdvanceIpAndRunCurrent = 8,
        Promote = 9,
        Clear = 0xA,
        Migrate = 0xB,
        SetActive = 0xC,
        AdvanceIpAndSetActive = 0xD,
        TlbFlush = 0xE,
    }
}

define_ops! {
    pub enum IntrinsicOp: Intrinsic {
        Rdmsr = 0,
        Wrmsr = 1,
    }
}

define_ops! {
    pub enum MemOp: Mem {
        AllocPage = 0,
        FreePage = 1,
        AllocHuge = 2,
        FreeHuge = 3,
    }
}
