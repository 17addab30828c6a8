// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{error, Logger};

use bf_types::consts::HYPERVISOR_MAX_VPS;
use bf_types::{PpId, VmId, VpId};

use crate::error::{Error, ObjKind, Result};
use crate::status::AllocatedStatus;
use crate::tls::Tls;
use crate::vm_pool::VmPool;
use crate::vp::Vp;
use crate::vs_pool::VsPool;

/// Owner of every [Vp]. Ids are slot indices.
pub struct VpPool {
    log: Logger,
    vps: Vec<Vp>,
}

impl VpPool {
    pub fn new(log: &Logger) -> Self {
        let log = log.new(slog::o!("component" => "vp_pool"));
        let vps = (0..HYPERVISOR_MAX_VPS).map(|_| Vp::new(&log)).collect();
        Self { log, vps }
    }

    pub fn initialize(&mut self) -> Result<()> {
        for (i, vp) in self.vps.iter_mut().enumerate() {
            vp.initialize(VpId::new(i as u16))?;
        }
        Ok(())
    }

    /// Release every VP, reporting the first failure.
    pub fn release(&mut self, tls: &mut Tls, vs_pool: &VsPool) -> Result<()> {
        let mut res = Ok(());
        for vp in self.vps.iter_mut() {
            if let Err(e) = vp.release(tls, vs_pool) {
                error!(self.log, "failed to release vp"; "error" => %e);
                res = res.and(Err(e));
            }
        }
        res
    }

    /// Allocate the first free VP.
    pub fn allocate(
        &mut self,
        tls: &mut Tls,
        vm_pool: &VmPool,
        vmid: VmId,
        ppid: PpId,
    ) -> Result<VpId> {
        let Some(vp) = self.vps.iter_mut().find(|vp| vp.is_deallocated())
        else {
            error!(self.log, "vp pool out of vps");
            return Err(Error::PoolExhausted(ObjKind::Vp));
        };
        vp.allocate(tls, vm_pool, vmid, ppid)
    }

    pub fn deallocate(
        &mut self,
        tls: &mut Tls,
        vs_pool: &VsPool,
        vpid: VpId,
    ) -> Result<()> {
        self.get_mut(vpid)?.deallocate(tls, vs_pool)
    }

    pub fn zombify(&mut self, vpid: VpId) {
        if let Ok(vp) = self.get_mut(vpid) {
            vp.zombify();
        }
    }

    pub fn status(&self, vpid: VpId) -> AllocatedStatus {
        self.get(vpid).map(Vp::status).unwrap_or_default()
    }

    pub fn is_deallocated(&self, vpid: VpId) -> bool {
        self.status(vpid) == AllocatedStatus::Deallocated
    }

    pub fn is_allocated(&self, vpid: VpId) -> bool {
        self.status(vpid) == AllocatedStatus::Allocated
    }

    pub fn is_zombie(&self, vpid: VpId) -> bool {
        self.status(vpid) == AllocatedStatus::Zombie
    }

    /// Make `vpid` the active VP of the calling PP.
    pub fn set_active(&mut self, tls: &mut Tls, vpid: VpId) -> Result<()> {
        self.get_mut(vpid)?.set_active(tls)
    }

    /// Make `vpid` inactive on the calling PP. The invalid id is accepted
    /// and ignored, so callers can pass whatever the TLS holds.
    pub fn set_inactive(&mut self, tls: &mut Tls, vpid: VpId) -> Result<()> {
        if vpid.is_invalid() {
            return Ok(());
        }
        self.get_mut(vpid)?.set_inactive(tls)
    }

    pub fn is_active(&self, vpid: VpId) -> Option<PpId> {
        self.get(vpid).ok().and_then(Vp::is_active)
    }

    pub fn is_active_on_this_pp(&self, tls: &Tls, vpid: VpId) -> bool {
        self.get(vpid)
            .map(|vp| vp.is_active_on_current_pp(tls))
            .unwrap_or(false)
    }

    pub fn migrate(&mut self, tls: &Tls, vpid: VpId, ppid: PpId) -> Result<()> {
        self.get_mut(vpid)?.migrate(tls, ppid)
    }

    pub fn assigned_vm(&self, vpid: VpId) -> Option<VmId> {
        self.get(vpid).ok().and_then(Vp::assigned_vm)
    }

    pub fn assigned_pp(&self, vpid: VpId) -> Option<PpId> {
        self.get(vpid).ok().and_then(Vp::assigned_pp)
    }

    /// Any VP, allocated or zombie, that belongs to `vmid`.
    pub fn vp_assigned_to_vm(&self, vmid: VmId) -> Option<VpId> {
        self.vps
            .iter()
            .find(|vp| vp.assigned_vm() == Some(vmid))
            .map(Vp::id)
    }

    fn get(&self, vpid: VpId) -> Result<&Vp> {
        self.vps.get(vpid.index()).ok_or(Error::InvalidId(ObjKind::Vp))
    }

    fn get_mut(&mut self, vpid: VpId) -> Result<&mut Vp> {
        self.vps.get_mut(vpid.index()).ok_or(Error::InvalidId(ObjKind::Vp))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::Fixture;

    #[test]
    fn ids_are_slot_indices() {
        let mut fx = Fixture::new(1);
        for i in 0..3 {
            let vpid = fx
                .vp_pool
                .allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS)
                .unwrap();
            assert_eq!(vpid, VpId::new(i));
        }
        fx.vp_pool.deallocate(&mut fx.tls, &fx.vs_pool, VpId::new(1)).unwrap();
        let vpid = fx
            .vp_pool
            .allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS)
            .unwrap();
        assert_eq!(vpid, VpId::new(1));
    }

    #[test]
    fn exhaustion() {
        let mut fx = Fixture::new(1);
        for _ in 0..HYPERVISOR_MAX_VPS {
            fx.vp_pool
                .allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS)
                .unwrap();
        }
        assert_eq!(
            fx.vp_pool.allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS),
            Err(Error::PoolExhausted(ObjKind::Vp))
        );
    }

    #[test]
    fn out_of_range_ids_read_as_deallocated() {
        let fx = Fixture::new(1);
        const TEST_CASES: &[u16] = &[HYPERVISOR_MAX_VPS, 0x1000, 0xFFFF];
        for raw in TEST_CASES {
            let vpid = VpId::new(*raw);
            assert!(fx.vp_pool.is_deallocated(vpid));
            assert!(!fx.vp_pool.is_zombie(vpid));
            assert_eq!(fx.vp_pool.is_active(vpid), None);
            assert_eq!(fx.vp_pool.assigned_vm(vpid), None);
            assert!(!fx.vp_pool.is_active_on_this_pp(&fx.tls, vpid));
        }
    }

    #[test]
    fn set_inactive_ignores_invalid_id() {
        let mut fx = Fixture::new(1);
        assert_eq!(fx.vp_pool.set_inactive(&mut fx.tls, VpId::INVALID), Ok(()));
    }

    #[test]
    fn assigned_to_vm() {
        let mut fx = Fixture::new(1);
        assert_eq!(fx.vp_pool.vp_assigned_to_vm(VmId::ROOT), None);
        let vpid = fx
            .vp_pool
            .allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS)
            .unwrap();
        assert_eq!(fx.vp_pool.vp_assigned_to_vm(VmId::ROOT), Some(vpid));
    }
}
