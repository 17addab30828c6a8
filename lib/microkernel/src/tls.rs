// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-PP kernel state.
//!
//! Every physical processor owns exactly one [Tls]. Nothing else writes to
//! it: the dispatcher receives it by `&mut` for the duration of a syscall on
//! that PP, which is how the single-writer rule is expressed.

use bf_types::consts::HYPERVISOR_MAX_PPS;
use bf_types::{BfReg, ExtId, PpId, TlsReg, VmId, VpId, VsId, NUM_TLS_REGS};

/// Registers captured from the root OS when the microkernel was started on a
/// PP. `init_as_root` seeds a VS from it and `promote` writes it back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateSave {
    regs: Vec<(BfReg, u64)>,
}

impl StateSave {
    /// Registers carried by a state save.
    pub const REGS: &'static [BfReg] = &[
        BfReg::Rax,
        BfReg::Rbx,
        BfReg::Rcx,
        BfReg::Rdx,
        BfReg::Rbp,
        BfReg::Rsi,
        BfReg::Rdi,
        BfReg::R8,
        BfReg::R9,
        BfReg::R10,
        BfReg::R11,
        BfReg::R12,
        BfReg::R13,
        BfReg::R14,
        BfReg::R15,
        BfReg::GuestRip,
        BfReg::GuestRsp,
        BfReg::GuestRflags,
        BfReg::GuestCr0,
        BfReg::GuestCr3,
        BfReg::GuestCr4,
        BfReg::GuestDr7,
        BfReg::GuestEfer,
        BfReg::GuestPat,
        BfReg::GuestCsSelector,
        BfReg::GuestSsSelector,
        BfReg::GuestDsSelector,
        BfReg::GuestEsSelector,
        BfReg::GuestFsBase,
        BfReg::GuestGsBase,
        BfReg::GuestGdtrBase,
        BfReg::GuestGdtrLimit,
        BfReg::GuestIdtrBase,
        BfReg::GuestIdtrLimit,
    ];

    pub fn new() -> Self {
        Self { regs: Self::REGS.iter().map(|r| (*r, 0)).collect() }
    }

    pub fn get(&self, reg: BfReg) -> Option<u64> {
        self.regs.iter().find(|(r, _)| *r == reg).map(|(_, v)| *v)
    }

    /// Update a register. Registers outside [StateSave::REGS] are ignored.
    pub fn set(&mut self, reg: BfReg, val: u64) {
        if let Some(slot) = self.regs.iter_mut().find(|(r, _)| *r == reg) {
            slot.1 = val;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (BfReg, u64)> + '_ {
        self.regs.iter().copied()
    }
}

/// Kernel state private to one physical processor.
#[derive(Clone, Debug)]
pub struct Tls {
    /// The PP this block belongs to.
    pub ppid: PpId,
    /// Number of PPs brought online at boot.
    pub online_pps: u16,

    pub active_extid: ExtId,
    pub active_vmid: VmId,
    pub active_vpid: VpId,
    pub active_vsid: VsId,

    /// Extension currently executing on this PP.
    pub ext: ExtId,
    /// Extension that registered the vmexit handler on this PP.
    pub ext_vmexit: ExtId,
    /// Extension that registered the fail handler on this PP.
    pub ext_fail: ExtId,

    /// Syscall word and argument registers of the syscall in flight.
    pub ext_syscall: u64,
    pub ext_reg0: u64,
    pub ext_reg1: u64,
    pub ext_reg2: u64,
    pub ext_reg3: u64,
    pub ext_reg4: u64,
    pub ext_reg5: u64,

    /// General purpose registers exposed through the extension TLS block.
    pub ext_gprs: [u64; NUM_TLS_REGS],

    /// Cleared when a syscall is dispatched and set by every operation that
    /// changes lifecycle state, so a failing syscall reports whether it got
    /// as far as touching an object.
    pub state_reversal_required: bool,

    pub log_vmid: VmId,
    pub log_vpid: VpId,
    pub log_vsid: VsId,

    /// Root of the direct map currently loaded on this PP, zero if none.
    pub active_rpt: u64,

    pub root_vp_state: StateSave,
}

impl Tls {
    pub fn new(ppid: PpId, online_pps: u16) -> Self {
        debug_assert!(online_pps <= HYPERVISOR_MAX_PPS);
        Self {
            ppid,
            online_pps,
            active_extid: ExtId::INVALID,
            active_vmid: VmId::INVALID,
            active_vpid: VpId::INVALID,
            active_vsid: VsId::INVALID,
            ext: ExtId::INVALID,
            ext_vmexit: ExtId::INVALID,
            ext_fail: ExtId::INVALID,
            ext_syscall: 0,
            ext_reg0: 0,
            ext_reg1: 0,
            ext_reg2: 0,
            ext_reg3: 0,
            ext_reg4: 0,
            ext_reg5: 0,
            ext_gprs: [0; NUM_TLS_REGS],
            state_reversal_required: false,
            log_vmid: VmId::INVALID,
            log_vpid: VpId::INVALID,
            log_vsid: VsId::INVALID,
            active_rpt: 0,
            root_vp_state: StateSave::new(),
        }
    }

    /// Whether `ppid` names a PP that was brought online.
    pub fn is_pp_online(&self, ppid: PpId) -> bool {
        ppid.is_valid()
            && ppid.get() < HYPERVISOR_MAX_PPS
            && ppid.get() < self.online_pps
    }

    pub fn gpr(&self, reg: TlsReg) -> u64 {
        self.ext_gprs[reg.index()]
    }

    pub fn set_gpr(&mut self, reg: TlsReg, val: u64) {
        self.ext_gprs[reg.index()] = val;
    }

    /// Whether the extension issuing the current syscall is the one that
    /// registered for vmexits on this PP.
    pub fn is_active_ext_the_vmexit_ext(&self) -> bool {
        self.ext.is_valid() && self.ext == self.ext_vmexit
    }
}
