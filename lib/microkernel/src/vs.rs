// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual CPU states.
//!
//! A VS owns one page from the page pool which holds its hardware state
//! area. All register access goes through [Intrinsic] using the physical
//! address of that page, except for the general purpose registers: those
//! live in the PP's TLS while the VS is active there, and in the VS itself
//! otherwise.

use slog::{crit, error, Logger};

use bf_types::{BfReg, PpId, TlsReg, VmId, VpId, VsId, NUM_TLS_REGS};

use crate::error::{Error, ObjKind, Result};
use crate::intrinsic::Intrinsic;
use crate::page_pool::{AllocTag, PagePool};
use crate::status::AllocatedStatus;
use crate::tls::{StateSave, Tls};
use crate::vp_pool::VpPool;

pub struct Vs {
    log: Logger,
    id: VsId,
    status: AllocatedStatus,
    assigned_vm: VmId,
    assigned_vp: VpId,
    assigned_pp: PpId,
    active_pp: PpId,
    /// Physical address of the state area, zero while deallocated.
    page: u64,
    /// Guest GPRs while this VS is not the active VS of its PP.
    gprs: [u64; NUM_TLS_REGS],
}

impl Vs {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.clone(),
            id: VsId::INVALID,
            status: AllocatedStatus::Deallocated,
            assigned_vm: VmId::INVALID,
            assigned_vp: VpId::INVALID,
            assigned_pp: PpId::INVALID,
            active_pp: PpId::INVALID,
            page: 0,
            gprs: [0; NUM_TLS_REGS],
        }
    }

    pub fn initialize(&mut self, id: VsId) -> Result<()> {
        if self.id.is_valid() {
            return Err(Error::AlreadyInitialized(ObjKind::Vs, self.id.get()));
        }
        if id.is_invalid() {
            return Err(Error::InvalidId(ObjKind::Vs));
        }

        self.log = self.log.new(slog::o!("vsid" => id.get()));
        self.id = id;
        Ok(())
    }

    /// Return the state area and forget this VS's identity. Zombies keep
    /// their page so that nothing can load it again.
    pub fn release(
        &mut self,
        tls: &mut Tls,
        page_pool: &mut PagePool,
    ) -> Result<()> {
        if self.id.is_invalid() || self.is_zombie() {
            return Ok(());
        }

        if self.is_allocated() {
            tls.state_reversal_required = true;
            self.teardown(page_pool)?;
        }

        self.status = AllocatedStatus::Deallocated;
        self.id = VsId::INVALID;
        Ok(())
    }

    pub fn id(&self) -> VsId {
        self.id
    }

    /// The tag the TLB uses for translations made on behalf of this VS.
    /// Zero is reserved for the host.
    pub fn tlb_tag(&self) -> u16 {
        self.id.get().wrapping_add(1)
    }

    /// Assign this VS to `vpid`, to be run on `ppid`.
    ///
    /// A fresh state area is taken from the page pool, cleared, and tagged.
    /// If any of that fails the page is returned and nothing changes.
    pub fn allocate(
        &mut self,
        tls: &mut Tls,
        page_pool: &mut PagePool,
        intrinsic: &mut dyn Intrinsic,
        vp_pool: &VpPool,
        vpid: VpId,
        ppid: PpId,
    ) -> Result<VsId> {
        self.ensure_initialized()?;
        match self.status {
            AllocatedStatus::Zombie => {
                return Err(Error::Zombie(ObjKind::Vs, self.id.get()))
            }
            AllocatedStatus::Allocated => {
                return Err(Error::AlreadyAllocated(ObjKind::Vs, self.id.get()))
            }
            AllocatedStatus::Deallocated => {}
        }
        let vmid = match vp_pool.assigned_vm(vpid) {
            Some(vmid) if vp_pool.is_allocated(vpid) => vmid,
            _ => return Err(Error::ParentUnusable(ObjKind::Vp, vpid.get())),
        };
        if !tls.is_pp_online(ppid) {
            return Err(Error::PpOffline(ppid));
        }

        let page = page_pool.allocate(AllocTag::VsState)?;
        let res = intrinsic.clear(page).and_then(|_| {
            intrinsic.write_reg(
                page,
                BfReg::VirtualProcessorIdentifier,
                u64::from(self.tlb_tag()),
            )
        });
        if let Err(e) = res {
            error!(self.log, "failed to prepare state area";
                "phys" => page,
                "error" => %e,
            );
            page_pool.deallocate(page)?;
            return Err(e.into());
        }

        tls.state_reversal_required = true;
        tls.log_vsid = self.id;

        self.page = page;
        self.assigned_vm = vmid;
        self.assigned_vp = vpid;
        self.assigned_pp = ppid;
        self.status = AllocatedStatus::Allocated;
        Ok(self.id)
    }

    /// Undo [Vs::allocate]. A VS that is still active somewhere becomes a
    /// zombie.
    pub fn deallocate(
        &mut self,
        tls: &mut Tls,
        page_pool: &mut PagePool,
    ) -> Result<()> {
        self.ensure_allocated()?;

        tls.state_reversal_required = true;
        self.teardown(page_pool)?;

        self.status = AllocatedStatus::Deallocated;
        tls.log_vsid = VsId::INVALID;
        Ok(())
    }

    pub fn zombify(&mut self) {
        if self.id.is_invalid() || self.is_zombie() {
            return;
        }
        crit!(self.log, "vs has been zombified");
        self.status = AllocatedStatus::Zombie;
    }

    pub fn status(&self) -> AllocatedStatus {
        self.status
    }

    pub fn is_deallocated(&self) -> bool {
        self.status == AllocatedStatus::Deallocated
    }

    pub fn is_allocated(&self) -> bool {
        self.status == AllocatedStatus::Allocated
    }

    pub fn is_zombie(&self) -> bool {
        self.status == AllocatedStatus::Zombie
    }

    /// Make this the active VS of the calling PP and load its state area.
    pub fn set_active(
        &mut self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
    ) -> Result<()> {
        self.ensure_allocated()?;
        if tls.active_vsid.is_valid() {
            return Err(Error::OtherActive {
                kind: ObjKind::Vs,
                active: tls.active_vsid.get(),
                ppid: tls.ppid,
            });
        }
        if self.active_pp.is_valid() {
            return Err(self.active_err());
        }
        if tls.ppid != self.assigned_pp {
            return Err(Error::WrongPp {
                kind: ObjKind::Vs,
                id: self.id.get(),
                assigned: self.assigned_pp,
                ppid: tls.ppid,
            });
        }

        intrinsic.load(self.page)?;

        tls.ext_gprs = self.gprs;
        tls.active_vsid = self.id;
        self.active_pp = tls.ppid;
        Ok(())
    }

    /// Stop being the active VS of the calling PP. The guest GPRs are saved
    /// out of the TLS so that the next VS starts from its own.
    pub fn set_inactive(&mut self, tls: &mut Tls) -> Result<()> {
        self.ensure_initialized()?;
        if self.is_deallocated() {
            return Err(Error::NotAllocated(ObjKind::Vs, self.id.get()));
        }
        if tls.active_vsid != self.id || self.active_pp != tls.ppid {
            return Err(Error::NotActive {
                kind: ObjKind::Vs,
                id: self.id.get(),
                ppid: tls.ppid,
            });
        }

        self.gprs = tls.ext_gprs;
        tls.active_vsid = VsId::INVALID;
        self.active_pp = PpId::INVALID;
        Ok(())
    }

    pub fn is_active(&self) -> Option<PpId> {
        self.active_pp.valid()
    }

    pub fn is_active_on_current_pp(&self, tls: &Tls) -> bool {
        self.active_pp.is_valid() && self.active_pp == tls.ppid
    }

    /// Move this VS to another PP. The state area is flushed so the new PP
    /// can load it.
    pub fn migrate(
        &mut self,
        tls: &Tls,
        intrinsic: &mut dyn Intrinsic,
        ppid: PpId,
    ) -> Result<()> {
        self.ensure_allocated()?;
        if !tls.is_pp_online(ppid) {
            return Err(Error::PpOffline(ppid));
        }
        if ppid == self.assigned_pp {
            return Err(Error::SamePp {
                kind: ObjKind::Vs,
                id: self.id.get(),
                ppid,
            });
        }
        if self.active_pp.is_valid() {
            return Err(self.active_err());
        }

        intrinsic.clear(self.page)?;
        self.assigned_pp = ppid;
        Ok(())
    }

    pub fn assigned_vm(&self) -> Option<VmId> {
        self.assigned_vm.valid()
    }

    pub fn assigned_vp(&self) -> Option<VpId> {
        self.assigned_vp.valid()
    }

    pub fn assigned_pp(&self) -> Option<PpId> {
        self.assigned_pp.valid()
    }

    /// Seed this VS from a state save.
    pub fn state_save_to_vs(
        &mut self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
        state: &StateSave,
    ) -> Result<()> {
        self.ensure_allocated()?;
        for (reg, val) in state.iter() {
            self.write_reg(tls, intrinsic, reg, val)?;
        }
        Ok(())
    }

    /// Copy this VS out into a state save.
    pub fn vs_to_state_save(
        &self,
        tls: &Tls,
        intrinsic: &mut dyn Intrinsic,
        state: &mut StateSave,
    ) -> Result<()> {
        self.ensure_allocated()?;
        for reg in StateSave::REGS {
            state.set(*reg, self.read_reg(tls, intrinsic, *reg)?);
        }
        Ok(())
    }

    pub fn read(
        &self,
        tls: &Tls,
        intrinsic: &mut dyn Intrinsic,
        reg: BfReg,
    ) -> Result<u64> {
        self.ensure_allocated()?;
        self.read_reg(tls, intrinsic, reg)
    }

    pub fn write(
        &mut self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
        reg: BfReg,
        val: u64,
    ) -> Result<()> {
        self.ensure_allocated()?;
        self.write_reg(tls, intrinsic, reg, val)
    }

    fn read_reg(
        &self,
        tls: &Tls,
        intrinsic: &mut dyn Intrinsic,
        reg: BfReg,
    ) -> Result<u64> {
        match TlsReg::from_bf_reg(reg) {
            Some(gpr) if tls.active_vsid == self.id => Ok(tls.gpr(gpr)),
            Some(gpr) => Ok(self.gprs[gpr.index()]),
            None => Ok(intrinsic.read_reg(self.page, reg)?),
        }
    }

    fn write_reg(
        &mut self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
        reg: BfReg,
        val: u64,
    ) -> Result<()> {
        match TlsReg::from_bf_reg(reg) {
            Some(gpr) if tls.active_vsid == self.id => tls.set_gpr(gpr, val),
            Some(gpr) => self.gprs[gpr.index()] = val,
            None => intrinsic.write_reg(self.page, reg, val)?,
        }
        Ok(())
    }

    /// Step the guest past the instruction that caused the last exit.
    pub fn advance_ip(&mut self, intrinsic: &mut dyn Intrinsic) -> Result<()> {
        self.ensure_allocated()?;
        let rip = intrinsic.read_reg(self.page, BfReg::GuestRip)?;
        let len =
            intrinsic.read_reg(self.page, BfReg::VmexitInstructionLength)?;
        let rip = rip.wrapping_add(len);
        intrinsic.write_reg(self.page, BfReg::GuestRip, rip)?;
        Ok(())
    }

    pub fn clear(&mut self, intrinsic: &mut dyn Intrinsic) -> Result<()> {
        self.ensure_allocated()?;
        Ok(intrinsic.clear(self.page)?)
    }

    /// Flush this VS's guest translations, or only `gla` when given.
    pub fn tlb_flush(
        &self,
        intrinsic: &mut dyn Intrinsic,
        gla: Option<u64>,
    ) -> Result<()> {
        self.ensure_allocated()?;
        intrinsic.invalidate_tlb(self.tlb_tag(), gla);
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.id.is_invalid() {
            return Err(Error::NotInitialized(ObjKind::Vs));
        }
        Ok(())
    }

    fn ensure_allocated(&self) -> Result<()> {
        self.ensure_initialized()?;
        match self.status {
            AllocatedStatus::Allocated => Ok(()),
            AllocatedStatus::Zombie => {
                Err(Error::Zombie(ObjKind::Vs, self.id.get()))
            }
            AllocatedStatus::Deallocated => {
                Err(Error::NotAllocated(ObjKind::Vs, self.id.get()))
            }
        }
    }

    fn teardown(&mut self, page_pool: &mut PagePool) -> Result<()> {
        if self.active_pp.is_valid() {
            let err = self.active_err();
            self.zombify();
            return Err(err);
        }
        if let Err(e) = page_pool.deallocate(self.page) {
            self.zombify();
            return Err(e);
        }

        self.page = 0;
        self.gprs = [0; NUM_TLS_REGS];
        self.assigned_vm = VmId::INVALID;
        self.assigned_vp = VpId::INVALID;
        self.assigned_pp = PpId::INVALID;
        Ok(())
    }

    fn active_err(&self) -> Error {
        Error::Active {
            kind: ObjKind::Vs,
            id: self.id.get(),
            ppid: self.active_pp,
        }
    }
}
