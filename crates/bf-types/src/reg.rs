// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register selectors understood by `bf_vs_op_read`/`bf_vs_op_write`, and the
//! extension TLS block layout.

/// A register of a virtual CPU state, numbered as on the wire (x64/Intel).
///
/// Value `0` is reserved for [BfReg::Unsupported]; everything at or above
/// [BF_MAX_REG_T] is rejected.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::FromRepr, strum::EnumIter,
)]
#[repr(u64)]
pub enum BfReg {
    Unsupported = 0,
    Rax = 1,
    Rbx = 2,
    Rcx = 3,
    Rdx = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    GuestCr2 = 16,
    GuestDr6 = 17,
    GuestStar = 18,
    GuestLstar = 19,
    GuestCstar = 20,
    GuestFmask = 21,
    GuestKernelGsBase = 22,
    VirtualProcessorIdentifier = 23,
    PostedInterruptNotificationVector = 24,
    EptpIndex = 25,
    GuestEsSelector = 26,
    GuestCsSelector = 27,
    GuestSsSelector = 28,
    GuestDsSelector = 29,
    GuestFsSelector = 30,
    GuestGsSelector = 31,
    GuestLdtrSelector = 32,
    GuestTrSelector = 33,
    GuestInterruptStatus = 34,
    PmlIndex = 35,
    AddressOfIoBitmapA = 36,
    AddressOfIoBitmapB = 37,
    AddressOfMsrBitmaps = 38,
    VmexitMsrStoreAddress = 39,
    VmexitMsrLoadAddress = 40,
    VmentryMsrLoadAddress = 41,
    ExecutiveVmcsPointer = 42,
    PmlAddress = 43,
    TscOffset = 44,
    VirtualApicAddress = 45,
    ApicAccessAddress = 46,
    PostedInterruptDescriptorAddress = 47,
    VmFunctionControls = 48,
    EptPointer = 49,
    EoiExitBitmap0 = 50,
    EoiExitBitmap1 = 51,
    EoiExitBitmap2 = 52,
    EoiExitBitmap3 = 53,
    EptpListAddress = 54,
    VmreadBitmapAddress = 55,
    VmwriteBitmapAddress = 56,
    VirtExceptionInformationAddress = 57,
    XssExitingBitmap = 58,
    EnclsExitingBitmap = 59,
    SubPagePermissionTablePointer = 60,
    TlsMultiplier = 61,
    GuestPhysicalAddress = 62,
    VmcsLinkPointer = 63,
    GuestDebugctl = 64,
    GuestPat = 65,
    GuestEfer = 66,
    GuestPerfGlobalCtrl = 67,
    GuestPdpte0 = 68,
    GuestPdpte1 = 69,
    GuestPdpte2 = 70,
    GuestPdpte3 = 71,
    GuestBndcfgs = 72,
    GuestRtitCtl = 73,
    PinBasedVmExecutionCtls = 74,
    PrimaryProcBasedVmExecutionCtls = 75,
    ExceptionBitmap = 76,
    PageFaultErrorCodeMask = 77,
    PageFaultErrorCodeMatch = 78,
    Cr3TargetCount = 79,
    VmexitCtls = 80,
    VmexitMsrStoreCount = 81,
    VmexitMsrLoadCount = 82,
    VmentryCtls = 83,
    VmentryMsrLoadCount = 84,
    VmentryInterruptInformationField = 85,
    VmentryExceptionErrorCode = 86,
    VmentryInstructionLength = 87,
    TprThreshold = 88,
    SecondaryProcBasedVmExecutionCtls = 89,
    PleGap = 90,
    PleWindow = 91,
    VmInstructionError = 92,
    ExitReason = 93,
    VmexitInterruptionInformation = 94,
    VmexitInterruptionErrorCode = 95,
    IdtVectoringInformationField = 96,
    IdtVectoringErrorCode = 97,
    VmexitInstructionLength = 98,
    VmexitInstructionInformation = 99,
    GuestEsLimit = 100,
    GuestCsLimit = 101,
    GuestSsLimit = 102,
    GuestDsLimit = 103,
    GuestFsLimit = 104,
    GuestGsLimit = 105,
    GuestLdtrLimit = 106,
    GuestTrLimit = 107,
    GuestGdtrLimit = 108,
    GuestIdtrLimit = 109,
    GuestEsAccessRights = 110,
    GuestCsAccessRights = 111,
    GuestSsAccessRights = 112,
    GuestDsAccessRights = 113,
    GuestFsAccessRights = 114,
    GuestGsAccessRights = 115,
    GuestLdtrAccessRights = 116,
    GuestTrAccessRights = 117,
    GuestInterruptibilityState = 118,
    GuestActivityState = 119,
    GuestSmbase = 120,
    GuestSysenterCs = 121,
    VmxPreemptionTimerValue = 122,
    Cr0GuestHostMask = 123,
    Cr4GuestHostMask = 124,
    Cr0ReadShadow = 125,
    Cr4ReadShadow = 126,
    Cr3TargetValue0 = 127,
    Cr3TargetValue1 = 128,
    Cr3TargetValue2 = 129,
    Cr3TargetValue3 = 130,
    ExitQualification = 131,
    IoRcx = 132,
    IoRsi = 133,
    IoRdi = 134,
    IoRip = 135,
    GuestLinearAddress = 136,
    GuestCr0 = 137,
    GuestCr3 = 138,
    GuestCr4 = 139,
    GuestEsBase = 140,
    GuestCsBase = 141,
    GuestSsBase = 142,
    GuestDsBase = 143,
    GuestFsBase = 144,
    GuestGsBase = 145,
    GuestLdtrBase = 146,
    GuestTrBase = 147,
    GuestGdtrBase = 148,
    GuestIdtrBase = 149,
    GuestDr7 = 150,
    GuestRsp = 151,
    GuestRip = 152,
    GuestRflags = 153,
    GuestPendingDebugExceptions = 154,
    GuestSysenterEsp = 155,
    GuestSysenterEip = 156,
}

/// One past the largest valid [BfReg] encoding.
pub const BF_MAX_REG_T: u64 = 157;

impl BfReg {
    /// Decode a wire value, refusing [BfReg::Unsupported] and anything out of
    /// range.
    pub fn decode(raw: u64) -> Option<Self> {
        if raw >= BF_MAX_REG_T {
            return None;
        }
        match Self::from_repr(raw)? {
            BfReg::Unsupported => None,
            reg => Some(reg),
        }
    }

    pub const fn raw(self) -> u64 {
        self as u64
    }

    /// Index into a register file sized [BF_MAX_REG_T].
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// General purpose registers mirrored into the extension's TLS block.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::EnumIter, strum::FromRepr,
)]
#[repr(u8)]
pub enum TlsReg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub const NUM_TLS_REGS: usize = 15;

impl TlsReg {
    /// Byte offset of the register inside the extension TLS block.
    pub const fn offset(self) -> u64 {
        0x800 + (self as u64) * 8
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    /// The TLS slot that mirrors `reg`, if it is a general purpose register.
    pub fn from_bf_reg(reg: BfReg) -> Option<Self> {
        match reg.raw() {
            raw @ 1..=15 => Self::from_repr((raw - 1) as u8),
            _ => None,
        }
    }
}

/// 16-bit identity fields at the tail of the extension TLS block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum TlsId {
    ActiveExtId,
    ActiveVmId,
    ActiveVpId,
    ActiveVsId,
    ActivePpId,
    OnlinePps,
}

impl TlsId {
    pub const fn offset(self) -> u64 {
        match self {
            TlsId::ActiveExtId => 0xFF0,
            TlsId::ActiveVmId => 0xFF2,
            TlsId::ActiveVpId => 0xFF4,
            TlsId::ActiveVsId => 0xFF6,
            TlsId::ActivePpId => 0xFF8,
            TlsId::OnlinePps => 0xFFA,
        }
    }
}
