// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle properties of a single VP, checked against a booted kernel's
//! pools.

use proptest::prelude::*;

use bf_types::{PpId, VmId, VpId};
use microkernel::config::Config;
use microkernel::tls::Tls;
use microkernel::vp::Vp;
use microkernel::{Error, Microkernel};

const ONLINE_PPS: u16 = 4;

fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn kernel() -> Microkernel {
    let config = Config { online_pps: ONLINE_PPS, ..Default::default() };
    Microkernel::new(&logger(), &config).unwrap()
}

/// VP 1, allocated to the root VM on `ppid`.
fn allocated_vp(mk: &Microkernel, ppid: PpId) -> Vp {
    let mut vp = Vp::new(&logger());
    vp.initialize(VpId::new(1)).unwrap();
    let mut tls = mk.tls(PpId::BS);
    vp.allocate(&mut tls, &mk.vm_pool, VmId::ROOT, ppid).unwrap();
    vp
}

fn pp() -> impl Strategy<Value = u16> {
    0..ONLINE_PPS
}

proptest! {
    #[test]
    fn active_on_one_pp_only(p1 in pp(), p2 in pp()) {
        prop_assume!(p1 != p2);
        let mk = kernel();
        let mut vp = allocated_vp(&mk, PpId::new(p1));
        let mut tls1 = mk.tls(PpId::new(p1));
        let mut tls2 = mk.tls(PpId::new(p2));

        vp.set_active(&mut tls1).unwrap();
        prop_assert!(vp.set_active(&mut tls2).is_err());
        prop_assert!(vp.is_active_on_current_pp(&tls1));
        prop_assert!(!vp.is_active_on_current_pp(&tls2));
        prop_assert_eq!(tls2.active_vpid, VpId::INVALID);
    }

    #[test]
    fn failed_allocate_changes_nothing(
        vmid in any::<u16>(),
        ppid in any::<u16>()
    ) {
        let (vmid, ppid) = (VmId::new(vmid), PpId::new(ppid));
        prop_assume!(!(vmid == VmId::ROOT && ppid.get() < ONLINE_PPS));

        let mk = kernel();
        let mut tls = mk.tls(PpId::BS);
        let mut vp = Vp::new(&logger());
        vp.initialize(VpId::new(1)).unwrap();

        prop_assert!(vp.allocate(&mut tls, &mk.vm_pool, vmid, ppid).is_err());
        prop_assert!(vp.is_deallocated());
        prop_assert_eq!(vp.assigned_vm(), None);
        prop_assert_eq!(vp.assigned_pp(), None);
        prop_assert!(!tls.state_reversal_required);
    }

    #[test]
    fn deallocate_while_active_zombifies(p in pp()) {
        let mk = kernel();
        let mut vp = allocated_vp(&mk, PpId::new(p));
        let mut tls = mk.tls(PpId::new(p));
        vp.set_active(&mut tls).unwrap();

        prop_assert!(vp.deallocate(&mut tls, &mk.vs_pool).is_err());
        prop_assert!(vp.is_zombie());
        prop_assert!(tls.state_reversal_required);
    }

    #[test]
    fn zombies_only_release(p in pp(), target in pp()) {
        let mk = kernel();
        let mut vp = allocated_vp(&mk, PpId::new(p));
        let mut tls = mk.tls(PpId::new(p));
        vp.zombify();
        prop_assert!(vp.is_zombie());

        prop_assert!(vp
            .allocate(&mut tls, &mk.vm_pool, VmId::ROOT, PpId::new(p))
            .is_err());
        prop_assert!(vp.migrate(&tls, PpId::new(target)).is_err());
        prop_assert!(vp.set_active(&mut tls).is_err());
        prop_assert!(vp.deallocate(&mut tls, &mk.vs_pool).is_err());
        prop_assert!(vp.is_zombie());

        prop_assert!(vp.release(&mut tls, &mk.vs_pool).is_ok());
        prop_assert!(vp.is_zombie());
    }

    #[test]
    fn migrate_requires_inactivity(from in pp(), to in pp()) {
        let mk = kernel();
        let mut vp = allocated_vp(&mk, PpId::new(from));
        let mut tls = mk.tls(PpId::new(from));

        vp.set_active(&mut tls).unwrap();
        prop_assert!(vp.migrate(&tls, PpId::new(to)).is_err());
        vp.set_inactive(&mut tls).unwrap();

        let res = vp.migrate(&tls, PpId::new(to));
        if from == to {
            prop_assert!(res.is_err());
            prop_assert_eq!(vp.assigned_pp(), Some(PpId::new(from)));
        } else {
            prop_assert!(res.is_ok());
            prop_assert_eq!(vp.assigned_pp(), Some(PpId::new(to)));
        }
    }
}

#[test]
fn allocate_onto_root_vm() {
    let mk = kernel();
    let vp = allocated_vp(&mk, PpId::BS);
    assert_eq!(vp.id(), VpId::new(1));
    assert_eq!(vp.assigned_vm(), Some(VmId::ROOT));
    assert_eq!(vp.assigned_pp(), Some(PpId::BS));
    assert!(vp.is_allocated());
}

#[test]
fn set_active_once() {
    let mk = kernel();
    let mut vp = allocated_vp(&mk, PpId::BS);
    let mut tls: Tls = mk.tls(PpId::BS);
    assert_eq!(tls.active_vpid, VpId::INVALID);

    vp.set_active(&mut tls).unwrap();
    assert_eq!(vp.is_active(), Some(PpId::BS));
    assert_eq!(tls.active_vpid, VpId::new(1));
    assert!(vp.set_active(&mut tls).is_err());
}

#[test]
fn migrate_to_another_pp() {
    let mk = kernel();
    let mut vp = allocated_vp(&mk, PpId::BS);
    let tls = mk.tls(PpId::BS);

    vp.migrate(&tls, PpId::new(1)).unwrap();
    assert_eq!(vp.assigned_pp(), Some(PpId::new(1)));
    assert!(matches!(
        vp.migrate(&tls, PpId::new(1)),
        Err(Error::SamePp { .. })
    ));
}

#[test]
fn deallocate_active_vp() {
    let mk = kernel();
    let mut vp = allocated_vp(&mk, PpId::BS);
    let mut tls = mk.tls(PpId::BS);
    vp.set_active(&mut tls).unwrap();
    tls.state_reversal_required = false;

    assert!(vp.deallocate(&mut tls, &mk.vs_pool).is_err());
    assert!(vp.is_zombie());
    assert!(tls.state_reversal_required);
}
