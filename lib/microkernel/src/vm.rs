// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual machines.

use slog::{crit, warn, Logger};

use bf_types::consts::HYPERVISOR_MAX_PPS;
use bf_types::{PpId, VmId};

use crate::error::{Error, ObjKind, Result};
use crate::ext_pool::ExtPool;
use crate::page_pool::PagePool;
use crate::status::AllocatedStatus;
use crate::tls::Tls;
use crate::vp_pool::VpPool;

/// A virtual machine.
///
/// Unlike VPs and VSs, a VM can be active on several PPs at once, so the
/// active state is kept as one flag per PP. Each flag is only written by the
/// PP it belongs to.
pub struct Vm {
    log: Logger,
    id: VmId,
    status: AllocatedStatus,
    active: Vec<bool>,
}

impl Vm {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.clone(),
            id: VmId::INVALID,
            status: AllocatedStatus::Deallocated,
            active: vec![false; HYPERVISOR_MAX_PPS as usize],
        }
    }

    pub fn initialize(&mut self, id: VmId) -> Result<()> {
        if self.id.is_valid() {
            return Err(Error::AlreadyInitialized(ObjKind::Vm, self.id.get()));
        }
        if id.is_invalid() {
            return Err(Error::InvalidId(ObjKind::Vm));
        }

        self.log = self.log.new(slog::o!("vmid" => id.get()));
        self.id = id;
        Ok(())
    }

    /// Tear the VM down and forget its identity. The root VM lives as long
    /// as the microkernel does and is left untouched.
    pub fn release(
        &mut self,
        tls: &mut Tls,
        ext_pool: &mut ExtPool,
        page_pool: &mut PagePool,
        vp_pool: &VpPool,
    ) -> Result<()> {
        if self.id.is_invalid() || self.is_zombie() || self.id.is_root() {
            return Ok(());
        }

        if self.is_allocated() {
            tls.state_reversal_required = true;
            self.teardown(ext_pool, page_pool, vp_pool)?;
        }

        self.status = AllocatedStatus::Deallocated;
        self.id = VmId::INVALID;
        Ok(())
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    /// Allocate the VM and let every extension know it exists.
    pub fn allocate(
        &mut self,
        tls: &mut Tls,
        ext_pool: &mut ExtPool,
        page_pool: &mut PagePool,
    ) -> Result<VmId> {
        self.ensure_initialized()?;
        match self.status {
            AllocatedStatus::Zombie => {
                return Err(Error::Zombie(ObjKind::Vm, self.id.get()))
            }
            AllocatedStatus::Allocated => {
                return Err(Error::AlreadyAllocated(ObjKind::Vm, self.id.get()))
            }
            AllocatedStatus::Deallocated => {}
        }

        ext_pool.signal_vm_created(page_pool, self.id)?;

        tls.state_reversal_required = true;
        tls.log_vmid = self.id;
        self.status = AllocatedStatus::Allocated;
        Ok(self.id)
    }

    /// Undo [Vm::allocate]. A VM that still has VPs, or that is running
    /// somewhere, becomes a zombie.
    pub fn deallocate(
        &mut self,
        tls: &mut Tls,
        ext_pool: &mut ExtPool,
        page_pool: &mut PagePool,
        vp_pool: &VpPool,
    ) -> Result<()> {
        self.ensure_allocated()?;
        if self.id.is_root() {
            return Err(Error::RootVm);
        }

        tls.state_reversal_required = true;
        self.teardown(ext_pool, page_pool, vp_pool)?;

        self.status = AllocatedStatus::Deallocated;
        tls.log_vmid = VmId::INVALID;
        Ok(())
    }

    pub fn zombify(&mut self) {
        if self.id.is_invalid() || self.is_zombie() {
            return;
        }
        if self.id.is_root() {
            warn!(self.log, "refusing to zombify the root vm");
            return;
        }
        crit!(self.log, "vm has been zombified");
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

    /// Make this the active VM of the calling PP.
    pub fn set_active(&mut self, tls: &mut Tls) -> Result<()> {
        self.ensure_allocated()?;
        if tls.active_vmid.is_valid() {
            return Err(Error::OtherActive {
                kind: ObjKind::Vm,
                active: tls.active_vmid.get(),
                ppid: tls.ppid,
            });
        }
        let slot = self.slot(tls.ppid)?;
        if self.active[slot] {
            return Err(Error::Active {
                kind: ObjKind::Vm,
                id: self.id.get(),
                ppid: tls.ppid,
            });
        }

        self.active[slot] = true;
        tls.active_vmid = self.id;
        Ok(())
    }

    pub fn set_inactive(&mut self, tls: &mut Tls) -> Result<()> {
        self.ensure_initialized()?;
        if self.is_deallocated() {
            return Err(Error::NotAllocated(ObjKind::Vm, self.id.get()));
        }
        let slot = self.slot(tls.ppid)?;
        if tls.active_vmid != self.id || !self.active[slot] {
            return Err(Error::NotActive {
                kind: ObjKind::Vm,
                id: self.id.get(),
                ppid: tls.ppid,
            });
        }

        self.active[slot] = false;
        tls.active_vmid = VmId::INVALID;
        Ok(())
    }

    /// The first PP this VM is active on, if any.
    pub fn is_active(&self) -> Option<PpId> {
        self.active
            .iter()
            .position(|a| *a)
            .map(|pp| PpId::new(pp as u16))
    }

    pub fn is_active_on_current_pp(&self, tls: &Tls) -> bool {
        self.slot(tls.ppid).map(|slot| self.active[slot]).unwrap_or(false)
    }

    fn slot(&self, ppid: PpId) -> Result<usize> {
        match ppid.valid() {
            Some(pp) if pp.index() < self.active.len() => Ok(pp.index()),
            _ => Err(Error::PpOffline(ppid)),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.id.is_invalid() {
            return Err(Error::NotInitialized(ObjKind::Vm));
        }
        Ok(())
    }

    fn ensure_allocated(&self) -> Result<()> {
        self.ensure_initialized()?;
        match self.status {
            AllocatedStatus::Allocated => Ok(()),
            AllocatedStatus::Zombie => {
                Err(Error::Zombie(ObjKind::Vm, self.id.get()))
            }
            AllocatedStatus::Deallocated => {
                Err(Error::NotAllocated(ObjKind::Vm, self.id.get()))
            }
        }
    }

    /// Checks shared by deallocate and release. Zombifies on failure.
    fn teardown(
        &mut self,
        ext_pool: &mut ExtPool,
        page_pool: &mut PagePool,
        vp_pool: &VpPool,
    ) -> Result<()> {
        let res = if let Some(vpid) = vp_pool.vp_assigned_to_vm(self.id) {
            Err(Error::StillAssigned {
                kind: ObjKind::Vm,
                id: self.id.get(),
                child: ObjKind::Vp,
                child_id: vpid.get(),
            })
        } else if let Some(ppid) = self.is_active() {
            Err(Error::Active { kind: ObjKind::Vm, id: self.id.get(), ppid })
        } else {
            ext_pool.signal_vm_destroyed(page_pool, self.id)
        };

        if res.is_err() {
            self.zombify();
        }
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page_pool::AllocTag;
    use crate::test_util::{logger, Fixture};

    fn vm(fx: &mut Fixture, id: u16) -> Vm {
        let mut vm = Vm::new(&logger());
        vm.initialize(VmId::new(id)).unwrap();
        vm.allocate(&mut fx.tls, &mut fx.ext_pool, &mut fx.page_pool)
            .unwrap();
        vm
    }

    #[test]
    fn allocate_creates_direct_map() {
        let mut fx = Fixture::new(1);
        let before = fx.page_pool.allocated_with(AllocTag::DirectMapRoot);
        let mut vm = vm(&mut fx, 3);
        assert!(vm.is_allocated());
        assert_eq!(fx.tls.log_vmid, VmId::new(3));
        assert_eq!(
            fx.page_pool.allocated_with(AllocTag::DirectMapRoot),
            before + 1
        );

        vm.deallocate(
            &mut fx.tls,
            &mut fx.ext_pool,
            &mut fx.page_pool,
            &fx.vp_pool,
        )
        .unwrap();
        assert!(vm.is_deallocated());
        assert_eq!(
            fx.page_pool.allocated_with(AllocTag::DirectMapRoot),
            before
        );
    }

    #[test]
    fn active_on_many_pps() {
        let mut fx = Fixture::new(2);
        let mut vm = vm(&mut fx, 3);
        let mut other = Tls::new(PpId::new(1), 2);

        vm.set_active(&mut fx.tls).unwrap();
        vm.set_active(&mut other).unwrap();
        assert!(vm.is_active_on_current_pp(&fx.tls));
        assert!(vm.is_active_on_current_pp(&other));
        assert!(matches!(
            vm.set_active(&mut fx.tls),
            Err(Error::OtherActive { .. })
        ));

        vm.set_inactive(&mut fx.tls).unwrap();
        assert_eq!(vm.is_active(), Some(PpId::new(1)));
        vm.set_inactive(&mut other).unwrap();
        assert_eq!(vm.is_active(), None);
    }

    #[test]
    fn deallocate_while_active_zombifies() {
        let mut fx = Fixture::new(1);
        let mut vm = vm(&mut fx, 3);
        vm.set_active(&mut fx.tls).unwrap();

        assert!(matches!(
            vm.deallocate(
                &mut fx.tls,
                &mut fx.ext_pool,
                &mut fx.page_pool,
                &fx.vp_pool
            ),
            Err(Error::Active { .. })
        ));
        assert!(vm.is_zombie());
        assert!(vm
            .allocate(&mut fx.tls, &mut fx.ext_pool, &mut fx.page_pool)
            .is_err());
        assert!(vm.set_inactive(&mut fx.tls).is_ok());
        assert!(vm.set_active(&mut fx.tls).is_err());
    }

    #[test]
    fn root_vm_is_never_zombified() {
        let mut fx = Fixture::new(1);
        fx.vm_pool.zombify(VmId::ROOT);
        assert!(fx.vm_pool.is_allocated(VmId::ROOT));
        assert_eq!(
            fx.vm_pool.deallocate(
                &mut fx.tls,
                &mut fx.ext_pool,
                &mut fx.page_pool,
                &fx.vp_pool,
                VmId::ROOT,
            ),
            Err(Error::RootVm)
        );
        assert!(fx.vm_pool.is_allocated(VmId::ROOT));
    }

    #[test]
    fn second_direct_map_for_same_vm_fails() {
        let mut fx = Fixture::new(1);
        let mut dup = Vm::new(&logger());
        dup.initialize(VmId::ROOT).unwrap();
        assert!(dup
            .allocate(&mut fx.tls, &mut fx.ext_pool, &mut fx.page_pool)
            .is_err());
        assert!(dup.is_deallocated());
    }

    #[test]
    fn release_forgets_identity() {
        let mut fx = Fixture::new(1);
        let mut vm = vm(&mut fx, 7);
        vm.release(
            &mut fx.tls,
            &mut fx.ext_pool,
            &mut fx.page_pool,
            &fx.vp_pool,
        )
        .unwrap();
        assert_eq!(vm.id(), VmId::INVALID);
        assert!(vm.is_deallocated());
    }
}
