// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{error, Logger};

use bf_types::consts::HYPERVISOR_MAX_VSS;
use bf_types::{BfReg, PpId, VmId, VpId, VsId};

use crate::error::{Error, ObjKind, Result};
use crate::intrinsic::Intrinsic;
use crate::page_pool::PagePool;
use crate::status::AllocatedStatus;
use crate::tls::{StateSave, Tls};
use crate::vp_pool::VpPool;
use crate::vs::Vs;

/// Owner of every [Vs]. Ids are slot indices.
pub struct VsPool {
    log: Logger,
    vss: Vec<Vs>,
}

impl VsPool {
    pub fn new(log: &Logger) -> Self {
        let log = log.new(slog::o!("component" => "vs_pool"));
        let vss = (0..HYPERVISOR_MAX_VSS).map(|_| Vs::new(&log)).collect();
        Self { log, vss }
    }

    pub fn initialize(&mut self) -> Result<()> {
        for (i, vs) in self.vss.iter_mut().enumerate() {
            vs.initialize(VsId::new(i as u16))?;
        }
        Ok(())
    }

    pub fn release(
        &mut self,
        tls: &mut Tls,
        page_pool: &mut PagePool,
    ) -> Result<()> {
        let mut res = Ok(());
        for vs in self.vss.iter_mut() {
            if let Err(e) = vs.release(tls, page_pool) {
                error!(self.log, "failed to release vs"; "error" => %e);
                res = res.and(Err(e));
            }
        }
        res
    }

    /// Allocate the first free VS.
    pub fn allocate(
        &mut self,
        tls: &mut Tls,
        page_pool: &mut PagePool,
        intrinsic: &mut dyn Intrinsic,
        vp_pool: &VpPool,
        vpid: VpId,
        ppid: PpId,
    ) -> Result<VsId> {
        let Some(vs) = self.vss.iter_mut().find(|vs| vs.is_deallocated())
        else {
            error!(self.log, "vs pool out of vss");
            return Err(Error::PoolExhausted(ObjKind::Vs));
        };
        vs.allocate(tls, page_pool, intrinsic, vp_pool, vpid, ppid)
    }

    pub fn deallocate(
        &mut self,
        tls: &mut Tls,
        page_pool: &mut PagePool,
        vsid: VsId,
    ) -> Result<()> {
        self.get_mut(vsid)?.deallocate(tls, page_pool)
    }

    pub fn zombify(&mut self, vsid: VsId) {
        if let Ok(vs) = self.get_mut(vsid) {
            vs.zombify();
        }
    }

    pub fn status(&self, vsid: VsId) -> AllocatedStatus {
        self.get(vsid).map(Vs::status).unwrap_or_default()
    }

    pub fn is_deallocated(&self, vsid: VsId) -> bool {
        self.status(vsid) == AllocatedStatus::Deallocated
    }

    pub fn is_allocated(&self, vsid: VsId) -> bool {
        self.status(vsid) == AllocatedStatus::Allocated
    }

    pub fn is_zombie(&self, vsid: VsId) -> bool {
        self.status(vsid) == AllocatedStatus::Zombie
    }

    pub fn set_active(
        &mut self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
    ) -> Result<()> {
        self.get_mut(vsid)?.set_active(tls, intrinsic)
    }

    /// Make `vsid` inactive on the calling PP. The invalid id is ignored.
    pub fn set_inactive(&mut self, tls: &mut Tls, vsid: VsId) -> Result<()> {
        if vsid.is_invalid() {
            return Ok(());
        }
        self.get_mut(vsid)?.set_inactive(tls)
    }

    pub fn is_active(&self, vsid: VsId) -> Option<PpId> {
        self.get(vsid).ok().and_then(Vs::is_active)
    }

    pub fn is_active_on_this_pp(&self, tls: &Tls, vsid: VsId) -> bool {
        self.get(vsid)
            .map(|vs| vs.is_active_on_current_pp(tls))
            .unwrap_or(false)
    }

    pub fn migrate(
        &mut self,
        tls: &Tls,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
        ppid: PpId,
    ) -> Result<()> {
        self.get_mut(vsid)?.migrate(tls, intrinsic, ppid)
    }

    pub fn assigned_vm(&self, vsid: VsId) -> Option<VmId> {
        self.get(vsid).ok().and_then(Vs::assigned_vm)
    }

    pub fn assigned_vp(&self, vsid: VsId) -> Option<VpId> {
        self.get(vsid).ok().and_then(Vs::assigned_vp)
    }

    pub fn assigned_pp(&self, vsid: VsId) -> Option<PpId> {
        self.get(vsid).ok().and_then(Vs::assigned_pp)
    }

    /// Any VS, allocated or zombie, that belongs to `vpid`.
    pub fn vs_assigned_to_vp(&self, vpid: VpId) -> Option<VsId> {
        self.vss
            .iter()
            .find(|vs| vs.assigned_vp() == Some(vpid))
            .map(Vs::id)
    }

    pub fn state_save_to_vs(
        &mut self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
        state: &StateSave,
    ) -> Result<()> {
        self.get_mut(vsid)?.state_save_to_vs(tls, intrinsic, state)
    }

    pub fn vs_to_state_save(
        &self,
        tls: &Tls,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
        state: &mut StateSave,
    ) -> Result<()> {
        self.get(vsid)?.vs_to_state_save(tls, intrinsic, state)
    }

    pub fn read(
        &self,
        tls: &Tls,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
        reg: BfReg,
    ) -> Result<u64> {
        self.get(vsid)?.read(tls, intrinsic, reg)
    }

    pub fn write(
        &mut self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
        reg: BfReg,
        val: u64,
    ) -> Result<()> {
        self.get_mut(vsid)?.write(tls, intrinsic, reg, val)
    }

    pub fn advance_ip(
        &mut self,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
    ) -> Result<()> {
        self.get_mut(vsid)?.advance_ip(intrinsic)
    }

    pub fn clear(
        &mut self,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
    ) -> Result<()> {
        self.get_mut(vsid)?.clear(intrinsic)
    }

    pub fn tlb_flush(
        &self,
        intrinsic: &mut dyn Intrinsic,
        vsid: VsId,
        gla: Option<u64>,
    ) -> Result<()> {
        self.get(vsid)?.tlb_flush(intrinsic, gla)
    }

    /// Flush the translations of every allocated VS of `vmid` that is
    /// assigned to the calling PP.
    pub fn tlb_flush_vm(
        &self,
        tls: &Tls,
        intrinsic: &mut dyn Intrinsic,
        vmid: VmId,
    ) -> Result<()> {
        self.vss
            .iter()
            .filter(|vs| {
                vs.is_allocated()
                    && vs.assigned_vm() == Some(vmid)
                    && vs.assigned_pp() == Some(tls.ppid)
            })
            .try_for_each(|vs| vs.tlb_flush(intrinsic, None))
    }

    fn get(&self, vsid: VsId) -> Result<&Vs> {
        self.vss.get(vsid.index()).ok_or(Error::InvalidId(ObjKind::Vs))
    }

    fn get_mut(&mut self, vsid: VsId) -> Result<&mut Vs> {
        self.vss.get_mut(vsid.index()).ok_or(Error::InvalidId(ObjKind::Vs))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::intrinsic::SoftIntrinsic;
    use crate::test_util::Fixture;

    fn vp(fx: &mut Fixture, ppid: PpId) -> VpId {
        fx.vp_pool
            .allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, ppid)
            .unwrap()
    }

    #[test]
    fn allocate_and_query() {
        let mut fx = Fixture::new(1);
        let mut intrinsic = SoftIntrinsic::new();
        let vpid = vp(&mut fx, PpId::BS);
        let vsid = fx
            .vs_pool
            .allocate(
                &mut fx.tls,
                &mut fx.page_pool,
                &mut intrinsic,
                &fx.vp_pool,
                vpid,
                PpId::BS,
            )
            .unwrap();

        assert_eq!(vsid, VsId::new(0));
        assert!(fx.vs_pool.is_allocated(vsid));
        assert_eq!(fx.vs_pool.assigned_vp(vsid), Some(vpid));
        assert_eq!(fx.vs_pool.assigned_vm(vsid), Some(VmId::ROOT));
        assert_eq!(fx.vs_pool.vs_assigned_to_vp(vpid), Some(vsid));

        // The VP cannot go while its VS is around.
        assert!(matches!(
            fx.vp_pool.deallocate(&mut fx.tls, &fx.vs_pool, vpid),
            Err(Error::StillAssigned { .. })
        ));
        assert!(fx.vp_pool.is_zombie(vpid));
    }

    #[test]
    fn tlb_flush_vm_only_touches_this_pp() {
        let mut fx = Fixture::new(2);
        let mut intrinsic = SoftIntrinsic::new();
        for pp in [0, 1, 0] {
            let ppid = PpId::new(pp);
            let vpid = vp(&mut fx, ppid);
            fx.vs_pool
                .allocate(
                    &mut fx.tls,
                    &mut fx.page_pool,
                    &mut intrinsic,
                    &fx.vp_pool,
                    vpid,
                    ppid,
                )
                .unwrap();
        }

        fx.vs_pool.tlb_flush_vm(&fx.tls, &mut intrinsic, VmId::ROOT).unwrap();
        assert_eq!(intrinsic.tlb_invalidations(), &[(1, None), (3, None)]);
    }
}
