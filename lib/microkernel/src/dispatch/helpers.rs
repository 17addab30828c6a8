// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Argument validation shared by the op families.
//!
//! The `get_*` functions turn a raw register into an id that names an
//! object in a usable state, or `None`. The `is_*` predicates check
//! relations between objects that were already resolved.

use bf_types::consts::{
    HYPERVISOR_MAX_PPS, HYPERVISOR_MAX_VMS, HYPERVISOR_MAX_VPS,
    HYPERVISOR_MAX_VSS,
};
use bf_types::{BfReg, PpId, VmId, VpId, VsId};

use crate::ext_pool::ExtPool;
use crate::tls::Tls;
use crate::vm_pool::VmPool;
use crate::vp_pool::VpPool;
use crate::vs_pool::VsPool;

/// Whether `reg0` holds the handle of the extension making the call.
pub(super) fn verify_handle_for_current_ext(
    tls: &Tls,
    ext_pool: &ExtPool,
) -> bool {
    ext_pool
        .get(tls.ext)
        .map(|ext| ext.is_handle_valid(tls.ext_reg0))
        .unwrap_or(false)
}

pub(super) fn get_vmid(reg: u64) -> Option<VmId> {
    VmId::from_reg(reg)
        .and_then(VmId::valid)
        .filter(|id| id.get() < HYPERVISOR_MAX_VMS)
}

pub(super) fn get_vpid(reg: u64) -> Option<VpId> {
    VpId::from_reg(reg)
        .and_then(VpId::valid)
        .filter(|id| id.get() < HYPERVISOR_MAX_VPS)
}

pub(super) fn get_vsid(reg: u64) -> Option<VsId> {
    VsId::from_reg(reg)
        .and_then(VsId::valid)
        .filter(|id| id.get() < HYPERVISOR_MAX_VSS)
}

/// A PP id that is in range and online.
pub(super) fn get_ppid(tls: &Tls, reg: u64) -> Option<PpId> {
    PpId::from_reg(reg)
        .and_then(PpId::valid)
        .filter(|id| id.get() < HYPERVISOR_MAX_PPS)
        .filter(|id| tls.is_pp_online(*id))
}

/// A VM that has been allocated. Zombies are accepted here and refused by
/// the operation itself.
pub(super) fn get_allocated_vmid(reg: u64, vm_pool: &VmPool) -> Option<VmId> {
    get_vmid(reg).filter(|id| !vm_pool.is_deallocated(*id))
}

pub(super) fn get_allocated_vpid(reg: u64, vp_pool: &VpPool) -> Option<VpId> {
    get_vpid(reg).filter(|id| !vp_pool.is_deallocated(*id))
}

pub(super) fn get_allocated_vsid(reg: u64, vs_pool: &VsPool) -> Option<VsId> {
    get_vsid(reg).filter(|id| !vs_pool.is_deallocated(*id))
}

/// An allocated VS that is assigned to the calling PP.
pub(super) fn get_locally_assigned_vsid(
    tls: &Tls,
    reg: u64,
    vs_pool: &VsPool,
) -> Option<VsId> {
    get_allocated_vsid(reg, vs_pool)
        .filter(|id| is_vs_assigned_to_current_pp(tls, vs_pool, *id))
}

pub(super) fn get_reg(reg: u64) -> Option<BfReg> {
    BfReg::decode(reg)
}

pub(super) fn is_vp_assigned_to_vm(
    vp_pool: &VpPool,
    vpid: VpId,
    vmid: VmId,
) -> bool {
    vp_pool.assigned_vm(vpid) == Some(vmid)
}

pub(super) fn is_vs_assigned_to_vp(
    vs_pool: &VsPool,
    vsid: VsId,
    vpid: VpId,
) -> bool {
    vs_pool.assigned_vp(vsid) == Some(vpid)
}

pub(super) fn is_vp_assigned_to_current_pp(
    tls: &Tls,
    vp_pool: &VpPool,
    vpid: VpId,
) -> bool {
    vp_pool.assigned_pp(vpid) == Some(tls.ppid)
}

pub(super) fn is_vs_assigned_to_current_pp(
    tls: &Tls,
    vs_pool: &VsPool,
    vsid: VsId,
) -> bool {
    vs_pool.assigned_pp(vsid) == Some(tls.ppid)
}

/// A VM can be destroyed once it runs nowhere and has no VPs.
pub(super) fn is_vm_destroyable(
    vm_pool: &VmPool,
    vp_pool: &VpPool,
    vmid: VmId,
) -> bool {
    vm_pool.is_active(vmid).is_none()
        && vp_pool.vp_assigned_to_vm(vmid).is_none()
}

pub(super) fn is_vp_destroyable(
    vp_pool: &VpPool,
    vs_pool: &VsPool,
    vpid: VpId,
) -> bool {
    vp_pool.is_active(vpid).is_none()
        && vs_pool.vs_assigned_to_vp(vpid).is_none()
}

pub(super) fn is_vs_destroyable(vs_pool: &VsPool, vsid: VsId) -> bool {
    vs_pool.is_active(vsid).is_none()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::Fixture;

    #[test]
    fn raw_ids() {
        const TEST_CASES: &[(u64, Option<u16>)] = &[
            (0, Some(0)),
            (15, Some(15)),
            (16, None),
            (0xFFFF, None),
            (0x1_0000, None),
            (u64::MAX, None),
        ];
        for (reg, expected) in TEST_CASES {
            assert_eq!(get_vmid(*reg), expected.map(VmId::new), "{reg:#x}");
        }
        assert_eq!(get_vpid(255), Some(VpId::new(255)));
        assert_eq!(get_vpid(256), None);
        assert_eq!(get_vsid(0x1_0001), None);
    }

    #[test]
    fn ppids_must_be_online() {
        let tls = Tls::new(PpId::BS, 2);
        assert_eq!(get_ppid(&tls, 1), Some(PpId::new(1)));
        assert_eq!(get_ppid(&tls, 2), None);
        assert_eq!(get_ppid(&tls, 0xFFFF), None);
        assert_eq!(get_ppid(&tls, 0x1_0000), None);
    }

    #[test]
    fn allocated_ids() {
        let fx = Fixture::new(1);
        assert_eq!(get_allocated_vmid(0, &fx.vm_pool), Some(VmId::ROOT));
        assert_eq!(get_allocated_vmid(1, &fx.vm_pool), None);
        assert_eq!(get_allocated_vpid(0, &fx.vp_pool), None);
        assert_eq!(get_allocated_vsid(0, &fx.vs_pool), None);
    }

    #[test]
    fn registers() {
        assert_eq!(get_reg(0), None);
        assert_eq!(get_reg(BfReg::GuestRip.raw()), Some(BfReg::GuestRip));
        assert_eq!(get_reg(u64::MAX), None);
    }

    #[test]
    fn destroyable() {
        let mut fx = Fixture::new(1);
        assert!(is_vm_destroyable(&fx.vm_pool, &fx.vp_pool, VmId::ROOT));
        let vpid = fx
            .vp_pool
            .allocate(&mut fx.tls, &fx.vm_pool, VmId::ROOT, PpId::BS)
            .unwrap();
        assert!(!is_vm_destroyable(&fx.vm_pool, &fx.vp_pool, VmId::ROOT));
        assert!(is_vp_assigned_to_vm(&fx.vp_pool, vpid, VmId::ROOT));
        assert!(is_vp_assigned_to_current_pp(&fx.tls, &fx.vp_pool, vpid));
        assert!(is_vp_destroyable(&fx.vp_pool, &fx.vs_pool, vpid));

        fx.vp_pool.set_active(&mut fx.tls, vpid).unwrap();
        assert!(!is_vp_destroyable(&fx.vp_pool, &fx.vs_pool, vpid));
    }
}
