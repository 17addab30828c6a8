// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual processors.

use slog::{crit, Logger};

use bf_types::{PpId, VmId, VpId};

use crate::error::{Error, ObjKind, Result};
use crate::status::AllocatedStatus;
use crate::tls::Tls;
use crate::vm_pool::VmPool;
use crate::vs_pool::VsPool;

/// A virtual processor: a vCPU identity belonging to one VM and, at any given
/// time, to one PP.
///
/// A VP is active on at most one PP. The PP it is active on is recorded both
/// here and in that PP's [Tls], and only that PP clears it again.
pub struct Vp {
    log: Logger,
    id: VpId,
    status: AllocatedStatus,
    assigned_vm: VmId,
    assigned_pp: PpId,
    active_pp: PpId,
}

impl Vp {
    pub fn new(log: &Logger) -> Self {
        Self {
            log: log.clone(),
            id: VpId::INVALID,
            status: AllocatedStatus::Deallocated,
            assigned_vm: VmId::INVALID,
            assigned_pp: PpId::INVALID,
            active_pp: PpId::INVALID,
        }
    }

    /// Give this slot its identity.
    pub fn initialize(&mut self, id: VpId) -> Result<()> {
        if self.id.is_valid() {
            return Err(Error::AlreadyInitialized(ObjKind::Vp, self.id.get()));
        }
        if id.is_invalid() {
            return Err(Error::InvalidId(ObjKind::Vp));
        }

        self.log = self.log.new(slog::o!("vpid" => id.get()));
        self.id = id;
        Ok(())
    }

    /// Return the slot to its pre-initialized state.
    ///
    /// Zombies are left as they are and reported as released. An allocated
    /// VP that cannot be torn down becomes a zombie.
    pub fn release(&mut self, tls: &mut Tls, vs_pool: &VsPool) -> Result<()> {
        if self.id.is_invalid() || self.is_zombie() {
            return Ok(());
        }

        tls.state_reversal_required = true;
        if let Err(e) = self.check_teardown(vs_pool) {
            self.zombify();
            return Err(e);
        }

        self.assigned_vm = VmId::INVALID;
        self.assigned_pp = PpId::INVALID;
        self.status = AllocatedStatus::Deallocated;
        self.id = VpId::INVALID;
        Ok(())
    }

    pub fn id(&self) -> VpId {
        self.id
    }

    /// Assign this VP to `vmid`, running on `ppid`.
    ///
    /// Nothing is modified unless every check passes.
    pub fn allocate(
        &mut self,
        tls: &mut Tls,
        vm_pool: &VmPool,
        vmid: VmId,
        ppid: PpId,
    ) -> Result<VpId> {
        self.ensure_initialized()?;
        match self.status {
            AllocatedStatus::Zombie => {
                return Err(Error::Zombie(ObjKind::Vp, self.id.get()))
            }
            AllocatedStatus::Allocated => {
                return Err(Error::AlreadyAllocated(ObjKind::Vp, self.id.get()))
            }
            AllocatedStatus::Deallocated => {}
        }
        if vmid.is_invalid() || !vm_pool.is_allocated(vmid) {
            return Err(Error::VmUnusable(vmid));
        }
        if !tls.is_pp_online(ppid) {
            return Err(Error::PpOffline(ppid));
        }

        tls.state_reversal_required = true;
        tls.log_vpid = self.id;

        self.assigned_vm = vmid;
        self.assigned_pp = ppid;
        self.status = AllocatedStatus::Allocated;
        Ok(self.id)
    }

    /// Undo [Vp::allocate].
    ///
    /// Asking to deallocate a VP that is still in use is not a retryable
    /// error: the VP becomes a zombie.
    pub fn deallocate(
        &mut self,
        tls: &mut Tls,
        vs_pool: &VsPool,
    ) -> Result<()> {
        self.ensure_allocated()?;

        tls.state_reversal_required = true;
        if let Err(e) = self.check_teardown(vs_pool) {
            self.zombify();
            return Err(e);
        }

        self.assigned_vm = VmId::INVALID;
        self.assigned_pp = PpId::INVALID;
        self.status = AllocatedStatus::Deallocated;
        tls.log_vpid = VpId::INVALID;
        Ok(())
    }

    pub fn zombify(&mut self) {
        if self.id.is_invalid() || self.is_zombie() {
            return;
        }
        crit!(self.log, "vp has been zombified");
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

    /// Make this the active VP of the calling PP.
    pub fn set_active(&mut self, tls: &mut Tls) -> Result<()> {
        self.ensure_allocated()?;
        if tls.active_vpid.is_valid() {
            return Err(Error::OtherActive {
                kind: ObjKind::Vp,
                active: tls.active_vpid.get(),
                ppid: tls.ppid,
            });
        }
        if self.active_pp.is_valid() {
            return Err(self.active_err());
        }
        if tls.ppid != self.assigned_pp {
            return Err(Error::WrongPp {
                kind: ObjKind::Vp,
                id: self.id.get(),
                assigned: self.assigned_pp,
                ppid: tls.ppid,
            });
        }

        tls.active_vpid = self.id;
        self.active_pp = tls.ppid;
        Ok(())
    }

    /// Stop being the active VP of the calling PP. A zombie may still be
    /// switched out, otherwise the PP it was active on could never move on.
    pub fn set_inactive(&mut self, tls: &mut Tls) -> Result<()> {
        self.ensure_initialized()?;
        if self.is_deallocated() {
            return Err(Error::NotAllocated(ObjKind::Vp, self.id.get()));
        }
        if tls.active_vpid != self.id || self.active_pp != tls.ppid {
            return Err(Error::NotActive {
                kind: ObjKind::Vp,
                id: self.id.get(),
                ppid: tls.ppid,
            });
        }

        tls.active_vpid = VpId::INVALID;
        self.active_pp = PpId::INVALID;
        Ok(())
    }

    /// The PP this VP is active on, if any.
    pub fn is_active(&self) -> Option<PpId> {
        self.active_pp.valid()
    }

    pub fn is_active_on_current_pp(&self, tls: &Tls) -> bool {
        self.active_pp.is_valid() && self.active_pp == tls.ppid
    }

    /// Reassign this VP to another PP. It must not be running anywhere.
    pub fn migrate(&mut self, tls: &Tls, ppid: PpId) -> Result<()> {
        self.ensure_allocated()?;
        if !tls.is_pp_online(ppid) {
            return Err(Error::PpOffline(ppid));
        }
        if ppid == self.assigned_pp {
            return Err(Error::SamePp {
                kind: ObjKind::Vp,
                id: self.id.get(),
                ppid,
            });
        }
        if self.active_pp.is_valid() {
            return Err(self.active_err());
        }

        self.assigned_pp = ppid;
        Ok(())
    }

    pub fn assigned_vm(&self) -> Option<VmId> {
        self.assigned_vm.valid()
    }

    pub fn assigned_pp(&self) -> Option<PpId> {
        self.assigned_pp.valid()
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.id.is_invalid() {
            return Err(Error::NotInitialized(ObjKind::Vp));
        }
        Ok(())
    }

    fn ensure_allocated(&self) -> Result<()> {
        self.ensure_initialized()?;
        match self.status {
            AllocatedStatus::Allocated => Ok(()),
            AllocatedStatus::Zombie => {
                Err(Error::Zombie(ObjKind::Vp, self.id.get()))
            }
            AllocatedStatus::Deallocated => {
                Err(Error::NotAllocated(ObjKind::Vp, self.id.get()))
            }
        }
    }

    fn check_teardown(&self, vs_pool: &VsPool) -> Result<()> {
        if let Some(vsid) = vs_pool.vs_assigned_to_vp(self.id) {
            return Err(Error::StillAssigned {
                kind: ObjKind::Vp,
                id: self.id.get(),
                child: ObjKind::Vs,
                child_id: vsid.get(),
            });
        }
        if self.active_pp.is_valid() {
            return Err(self.active_err());
        }
        Ok(())
    }

    fn active_err(&self) -> Error {
        Error::Active {
            kind: ObjKind::Vp,
            id: self.id.get(),
            ppid: self.active_pp,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{logger, Fixture};

    fn allocated_vp(fx: &mut Fixture) -> Vp {
        let mut vp = Vp::new(&logger());
        vp.initialize(VpId::new(1)).unwrap();
        vp.allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::new(0))
            .unwrap();
        vp
    }

    #[test]
    fn initialize() {
        let mut vp = Vp::new(&logger());
        assert_eq!(
            vp.initialize(VpId::INVALID),
            Err(Error::InvalidId(ObjKind::Vp))
        );
        vp.initialize(VpId::new(1)).unwrap();
        assert_eq!(vp.id(), VpId::new(1));
        assert_eq!(
            vp.initialize(VpId::new(2)),
            Err(Error::AlreadyInitialized(ObjKind::Vp, 1))
        );
    }

    #[test]
    fn uninitialized_vp_refuses_everything() {
        let mut fx = Fixture::new(2);
        let mut vp = Vp::new(&logger());
        assert_eq!(
            vp.allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS),
            Err(Error::NotInitialized(ObjKind::Vp))
        );
        assert!(vp.set_active(&mut fx.tls).is_err());
        assert!(vp.migrate(&fx.tls, PpId::new(1)).is_err());
        vp.zombify();
        assert!(!vp.is_zombie());
        assert_eq!(vp.release(&mut fx.tls, &fx.vs_pool), Ok(()));
    }

    #[test]
    fn allocate_assigns_vm_and_pp() {
        let mut fx = Fixture::new(1);
        let vp = allocated_vp(&mut fx);
        assert!(vp.is_allocated());
        assert_eq!(vp.assigned_vm(), Some(VmId::ROOT));
        assert_eq!(vp.assigned_pp(), Some(PpId::new(0)));
        assert_eq!(fx.tls.log_vpid, VpId::new(1));
        assert!(fx.tls.state_reversal_required);
    }

    #[test]
    fn allocate_rejects_bad_arguments_without_side_effects() {
        let mut fx = Fixture::new(2);
        let mut vp = Vp::new(&logger());
        vp.initialize(VpId::new(1)).unwrap();

        const TEST_CASES: &[(u16, u16)] =
            &[(0xFFFF, 0), (5, 0), (0, 2), (0, 0xFFFF), (0, 200)];
        for (vmid, ppid) in TEST_CASES {
            let res = vp.allocate(
                &mut fx.tls,
                &fx.vm_pool,
                VmId::new(*vmid),
                PpId::new(*ppid),
            );
            assert!(res.is_err(), "vm {vmid} pp {ppid}");
            assert!(vp.is_deallocated());
            assert_eq!(vp.assigned_vm(), None);
            assert_eq!(vp.assigned_pp(), None);
        }
        assert!(!fx.tls.state_reversal_required);
    }

    #[test]
    fn allocate_twice_fails() {
        let mut fx = Fixture::new(1);
        let mut vp = allocated_vp(&mut fx);
        assert_eq!(
            vp.allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS),
            Err(Error::AlreadyAllocated(ObjKind::Vp, 1))
        );
    }

    #[test]
    fn set_active_is_exclusive() {
        let mut fx = Fixture::new(1);
        let mut vp = allocated_vp(&mut fx);

        vp.set_active(&mut fx.tls).unwrap();
        assert_eq!(vp.is_active(), Some(PpId::new(0)));
        assert!(vp.is_active_on_current_pp(&fx.tls));
        assert_eq!(fx.tls.active_vpid, VpId::new(1));
        assert!(vp.set_active(&mut fx.tls).is_err());

        vp.set_inactive(&mut fx.tls).unwrap();
        assert_eq!(vp.is_active(), None);
        assert_eq!(fx.tls.active_vpid, VpId::INVALID);
        assert!(vp.set_inactive(&mut fx.tls).is_err());
    }

    #[test]
    fn set_active_on_another_pp_fails() {
        let mut fx = Fixture::new(2);
        let mut vp = allocated_vp(&mut fx);
        vp.set_active(&mut fx.tls).unwrap();

        let mut other = Tls::new(PpId::new(1), 2);
        assert!(matches!(
            vp.set_active(&mut other),
            Err(Error::Active { .. })
        ));
        assert!(!vp.is_active_on_current_pp(&other));
        assert!(vp.set_inactive(&mut other).is_err());
        assert_eq!(other.active_vpid, VpId::INVALID);
    }

    #[test]
    fn migrate() {
        let mut fx = Fixture::new(2);
        let mut vp = allocated_vp(&mut fx);

        vp.migrate(&fx.tls, PpId::new(1)).unwrap();
        assert_eq!(vp.assigned_pp(), Some(PpId::new(1)));
        assert!(matches!(
            vp.migrate(&fx.tls, PpId::new(1)),
            Err(Error::SamePp { .. })
        ));
        assert_eq!(
            vp.migrate(&fx.tls, PpId::new(2)),
            Err(Error::PpOffline(PpId::new(2)))
        );
    }

    #[test]
    fn migrate_while_active_fails() {
        let mut fx = Fixture::new(2);
        let mut vp = allocated_vp(&mut fx);
        vp.set_active(&mut fx.tls).unwrap();
        assert!(matches!(
            vp.migrate(&fx.tls, PpId::new(1)),
            Err(Error::Active { .. })
        ));
        assert_eq!(vp.assigned_pp(), Some(PpId::new(0)));
    }

    #[test]
    fn deallocate_while_active_zombifies() {
        let mut fx = Fixture::new(1);
        let mut vp = allocated_vp(&mut fx);
        vp.set_active(&mut fx.tls).unwrap();
        fx.tls.state_reversal_required = false;

        assert!(vp.deallocate(&mut fx.tls, &fx.vs_pool).is_err());
        assert!(vp.is_zombie());
        assert!(fx.tls.state_reversal_required);

        assert!(vp
            .allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS)
            .is_err());
        assert!(vp.deallocate(&mut fx.tls, &fx.vs_pool).is_err());
        assert!(vp.migrate(&fx.tls, PpId::new(0)).is_err());
        assert!(vp.is_zombie());

        // The PP can still switch the zombie out.
        vp.set_inactive(&mut fx.tls).unwrap();
        assert!(vp.set_active(&mut fx.tls).is_err());
        assert_eq!(vp.release(&mut fx.tls, &fx.vs_pool), Ok(()));
        assert!(vp.is_zombie());
    }

    #[test]
    fn deallocate_then_reallocate() {
        let mut fx = Fixture::new(1);
        let mut vp = allocated_vp(&mut fx);
        vp.deallocate(&mut fx.tls, &fx.vs_pool).unwrap();
        assert!(vp.is_deallocated());
        assert_eq!(vp.assigned_vm(), None);
        assert_eq!(vp.id(), VpId::new(1));
        assert_eq!(
            vp.deallocate(&mut fx.tls, &fx.vs_pool),
            Err(Error::NotAllocated(ObjKind::Vp, 1))
        );
        vp.allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS)
            .unwrap();
    }

    #[test]
    fn release_clears_identity() {
        let mut fx = Fixture::new(1);
        let mut vp = allocated_vp(&mut fx);
        vp.release(&mut fx.tls, &fx.vs_pool).unwrap();
        assert!(vp.is_deallocated());
        assert_eq!(vp.id(), VpId::INVALID);
        assert_eq!(vp.assigned_pp(), None);
    }

    #[test]
    fn release_while_active_zombifies() {
        let mut fx = Fixture::new(1);
        let mut vp = allocated_vp(&mut fx);
        vp.set_active(&mut fx.tls).unwrap();
        assert!(vp.release(&mut fx.tls, &fx.vs_pool).is_err());
        assert!(vp.is_zombie());
        assert_eq!(vp.id(), VpId::new(1));
    }
}
