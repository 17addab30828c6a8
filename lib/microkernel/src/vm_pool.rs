// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{error, Logger};

use bf_types::consts::HYPERVISOR_MAX_VMS;
use bf_types::{PpId, VmId};

use crate::error::{Error, ObjKind, Result};
use crate::ext_pool::ExtPool;
use crate::page_pool::PagePool;
use crate::status::AllocatedStatus;
use crate::tls::Tls;
use crate::vm::Vm;
use crate::vp_pool::VpPool;

/// Owner of every [Vm]. Slot zero is the root VM.
pub struct VmPool {
    log: Logger,
    vms: Vec<Vm>,
}

impl VmPool {
    pub fn new(log: &Logger) -> Self {
        let log = log.new(slog::o!("component" => "vm_pool"));
        let vms = (0..HYPERVISOR_MAX_VMS).map(|_| Vm::new(&log)).collect();
        Self { log, vms }
    }

    pub fn initialize(&mut self) -> Result<()> {
        for (i, vm) in self.vms.iter_mut().enumerate() {
            vm.initialize(VmId::new(i as u16))?;
        }
        Ok(())
    }

    pub fn release(
        &mut self,
        tls: &mut Tls,
        ext_pool: &mut ExtPool,
        page_pool: &mut PagePool,
        vp_pool: &VpPool,
    ) -> Result<()> {
        let mut res = Ok(());
        for vm in self.vms.iter_mut() {
            if let Err(e) = vm.release(tls, ext_pool, page_pool, vp_pool) {
                error!(self.log, "failed to release vm"; "error" => %e);
                res = res.and(Err(e));
            }
        }
        res
    }

    /// Allocate the first free VM. The first allocation made after
    /// [VmPool::initialize] is the root VM.
    pub fn allocate(
        &mut self,
        tls: &mut Tls,
        ext_pool: &mut ExtPool,
        page_pool: &mut PagePool,
    ) -> Result<VmId> {
        let Some(vm) = self.vms.iter_mut().find(|vm| vm.is_deallocated())
        else {
            error!(self.log, "vm pool out of vms");
            return Err(Error::PoolExhausted(ObjKind::Vm));
        };
        vm.allocate(tls, ext_pool, page_pool)
    }

    pub fn deallocate(
        &mut self,
        tls: &mut Tls,
        ext_pool: &mut ExtPool,
        page_pool: &mut PagePool,
        vp_pool: &VpPool,
        vmid: VmId,
    ) -> Result<()> {
        self.get_mut(vmid)?
            .deallocate(tls, ext_pool, page_pool, vp_pool)
    }

    pub fn zombify(&mut self, vmid: VmId) {
        if let Ok(vm) = self.get_mut(vmid) {
            vm.zombify();
        }
    }

    pub fn status(&self, vmid: VmId) -> AllocatedStatus {
        self.get(vmid).map(Vm::status).unwrap_or_default()
    }

    pub fn is_deallocated(&self, vmid: VmId) -> bool {
        self.status(vmid) == AllocatedStatus::Deallocated
    }

    pub fn is_allocated(&self, vmid: VmId) -> bool {
        self.status(vmid) == AllocatedStatus::Allocated
    }

    pub fn is_zombie(&self, vmid: VmId) -> bool {
        self.status(vmid) == AllocatedStatus::Zombie
    }

    pub fn set_active(&mut self, tls: &mut Tls, vmid: VmId) -> Result<()> {
        self.get_mut(vmid)?.set_active(tls)
    }

    /// Make `vmid` inactive on the calling PP. The invalid id is ignored.
    pub fn set_inactive(&mut self, tls: &mut Tls, vmid: VmId) -> Result<()> {
        if vmid.is_invalid() {
            return Ok(());
        }
        self.get_mut(vmid)?.set_inactive(tls)
    }

    pub fn is_active(&self, vmid: VmId) -> Option<PpId> {
        self.get(vmid).ok().and_then(Vm::is_active)
    }

    pub fn is_active_on_this_pp(&self, tls: &Tls, vmid: VmId) -> bool {
        self.get(vmid)
            .map(|vm| vm.is_active_on_current_pp(tls))
            .unwrap_or(false)
    }

    fn get(&self, vmid: VmId) -> Result<&Vm> {
        self.vms.get(vmid.index()).ok_or(Error::InvalidId(ObjKind::Vm))
    }

    fn get_mut(&mut self, vmid: VmId) -> Result<&mut Vm> {
        self.vms.get_mut(vmid.index()).ok_or(Error::InvalidId(ObjKind::Vm))
    }
}
