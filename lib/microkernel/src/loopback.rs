// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-process microkernel that extensions reach through
//! [bf_syscall::BfSyscall].
//!
//! Each PP is a [Tls] plus a [SoftIntrinsic]. A trap copies the syscall
//! registers into the calling PP's TLS, runs [dispatch_syscall] and copies
//! the result registers back, the same way the syscall entry path does on
//! hardware.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slog::{info, Logger};

use bf_syscall::{AbiRegs, SyscallAbi};
use bf_types::{BfReg, BfStatus, ExtId, PpId, TlsId, TlsReg, VsId};

use crate::config::Config;
use crate::dispatch::{dispatch_syscall, Dispatch};
use crate::error::{Error, Result};
use crate::intrinsic::SoftIntrinsic;
use crate::kernel::Microkernel;
use crate::tls::Tls;

/// The single extension a loopback platform hosts.
pub const LOOPBACK_EXT: ExtId = ExtId::new(0);

struct PpState {
    tls: Tls,
    intrinsic: SoftIntrinsic,
    last: Option<Dispatch>,
}

/// A microkernel and every PP it runs on.
pub struct Platform {
    log: Logger,
    mk: Microkernel,
    pps: Vec<PpState>,
}

pub type SharedPlatform = Arc<Mutex<Platform>>;

impl Platform {
    /// Start the microkernel and prepare the BSP for the extension's
    /// `main`. APs come up in [Platform::finish_start].
    pub fn new(log: &Logger, config: &Config) -> Result<Self> {
        let log = log.new(slog::o!("component" => "loopback"));
        let mut mk = Microkernel::new(&log, config)?;

        let mut pps = (0..mk.online_pps())
            .map(|pp| {
                let mut tls = mk.tls(PpId::new(pp));
                tls.ext = LOOPBACK_EXT;
                tls.active_extid = LOOPBACK_EXT;
                PpState { tls, intrinsic: SoftIntrinsic::new(), last: None }
            })
            .collect::<Vec<_>>();

        let bsp = pps.first_mut().ok_or(Error::PpOffline(PpId::BS))?;
        mk.boot_pp(&mut bsp.tls)?;
        Ok(Self { log, mk, pps })
    }

    pub fn shared(self) -> SharedPlatform {
        Arc::new(Mutex::new(self))
    }

    pub fn microkernel(&self) -> &Microkernel {
        &self.mk
    }

    pub fn microkernel_mut(&mut self) -> &mut Microkernel {
        &mut self.mk
    }

    pub fn online_pps(&self) -> u16 {
        self.mk.online_pps()
    }

    pub fn tls(&self, ppid: PpId) -> Option<&Tls> {
        self.pps.get(ppid.index()).map(|pp| &pp.tls)
    }

    pub fn intrinsic(&self, ppid: PpId) -> Option<&SoftIntrinsic> {
        self.pps.get(ppid.index()).map(|pp| &pp.intrinsic)
    }

    /// What the last syscall on `ppid` asked the PP to do next.
    pub fn last_outcome(&self, ppid: PpId) -> Option<Dispatch> {
        self.pps.get(ppid.index()).and_then(|pp| pp.last)
    }

    fn pp_mut(&mut self, ppid: PpId) -> Result<&mut PpState> {
        self.pps.get_mut(ppid.index()).ok_or(Error::PpOffline(ppid))
    }

    /// Record the handlers registered by the extension's `main` on the BSP
    /// and bring up the APs.
    pub fn finish_start(&mut self) -> Result<()> {
        let Self { mk, pps, log } = self;
        let (bsp, aps) =
            pps.split_first_mut().ok_or(Error::PpOffline(PpId::BS))?;
        mk.finish_start(&bsp.tls)?;
        for ap in aps {
            mk.boot_pp(&mut ap.tls)?;
        }
        info!(log, "all pps started"; "online_pps" => mk.online_pps());
        Ok(())
    }

    /// Write a register of `vsid` as the hardware would, e.g. to stage a
    /// vmexit. `vsid` must be assigned to `ppid`.
    pub fn write_vs_reg(
        &mut self,
        ppid: PpId,
        vsid: VsId,
        reg: BfReg,
        val: u64,
    ) -> Result<()> {
        let Self { mk, pps, .. } = self;
        let pp = pps.get_mut(ppid.index()).ok_or(Error::PpOffline(ppid))?;
        mk.vs_pool.write(&mut pp.tls, &mut pp.intrinsic, vsid, reg, val)
    }

    /// Read a register of `vsid` as the hardware would.
    pub fn read_vs_reg(
        &mut self,
        ppid: PpId,
        vsid: VsId,
        reg: BfReg,
    ) -> Result<u64> {
        let Self { mk, pps, .. } = self;
        let pp = pps.get_mut(ppid.index()).ok_or(Error::PpOffline(ppid))?;
        mk.vs_pool.read(&pp.tls, &mut pp.intrinsic, vsid, reg)
    }

    /// Tear down everything the extension created.
    pub fn release(&mut self) -> Result<()> {
        let Self { mk, pps, .. } = self;
        let bsp = pps.first_mut().ok_or(Error::PpOffline(PpId::BS))?;
        mk.release(&mut bsp.tls)
    }

    fn trap(&mut self, ppid: PpId, word: u64, regs: &mut AbiRegs) -> u64 {
        let Self { mk, pps, .. } = self;
        let Some(pp) = pps.get_mut(ppid.index()) else {
            return BfStatus::FailureUnsupported.raw();
        };

        let tls = &mut pp.tls;
        tls.ext_syscall = word;
        tls.ext_reg0 = regs.reg0;
        tls.ext_reg1 = regs.reg1;
        tls.ext_reg2 = regs.reg2;
        tls.ext_reg3 = regs.reg3;
        tls.ext_reg4 = regs.reg4;
        tls.ext_reg5 = regs.reg5;

        let outcome = dispatch_syscall(tls, mk, &mut pp.intrinsic);

        regs.reg0 = tls.ext_reg0;
        regs.reg1 = tls.ext_reg1;
        regs.reg2 = tls.ext_reg2;
        regs.reg3 = tls.ext_reg3;
        regs.reg4 = tls.ext_reg4;
        regs.reg5 = tls.ext_reg5;
        pp.last = Some(outcome);
        outcome.status().raw()
    }
}

fn lock(platform: &SharedPlatform) -> MutexGuard<'_, Platform> {
    platform.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The extension's view of a [Platform], as seen from one PP.
#[derive(Clone)]
pub struct Loopback {
    platform: SharedPlatform,
    ppid: PpId,
}

impl Loopback {
    pub fn new(platform: SharedPlatform, ppid: PpId) -> Self {
        Self { platform, ppid }
    }

    /// Continue on another PP, as an extension does when the microkernel
    /// calls into it there.
    pub fn select_pp(&mut self, ppid: PpId) {
        self.ppid = ppid;
    }

    pub fn ppid(&self) -> PpId {
        self.ppid
    }

    pub fn platform(&self) -> &SharedPlatform {
        &self.platform
    }
}

impl SyscallAbi for Loopback {
    fn trap(&mut self, word: u64, regs: &mut AbiRegs) -> u64 {
        lock(&self.platform).trap(self.ppid, word, regs)
    }

    fn tls_reg(&self, reg: TlsReg) -> u64 {
        lock(&self.platform).tls(self.ppid).map_or(0, |tls| tls.gpr(reg))
    }

    fn set_tls_reg(&mut self, reg: TlsReg, val: u64) {
        let mut platform = lock(&self.platform);
        if let Ok(pp) = platform.pp_mut(self.ppid) {
            pp.tls.set_gpr(reg, val);
        }
    }

    fn tls_id(&self, id: TlsId) -> u16 {
        let platform = lock(&self.platform);
        let Some(tls) = platform.tls(self.ppid) else {
            return ExtId::INVALID.get();
        };
        match id {
            TlsId::ActiveExtId => tls.active_extid.get(),
            TlsId::ActiveVmId => tls.active_vmid.get(),
            TlsId::ActiveVpId => tls.active_vpid.get(),
            TlsId::ActiveVsId => tls.active_vsid.get(),
            TlsId::ActivePpId => tls.ppid.get(),
            TlsId::OnlinePps => tls.online_pps,
        }
    }
}
