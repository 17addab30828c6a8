// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VS ops.
//!
//! Every handler runs in two phases: all arguments are resolved and
//! cross-checked first, and only then is any object touched. The ops that
//! make a VS active on the calling PP share [resolve_triple] and
//! [activate].

use slog::{debug, error, Logger};

use bf_types::syscall::{self, SyscallOp, VsOp};
use bf_types::{merge_reg_with_id, BfStatus, VmId, VpId, VsId};

use crate::intrinsic::Intrinsic;
use crate::kernel::Microkernel;
use crate::tls::Tls;

use super::{helpers, unknown, Dispatch, OpResult};

pub(super) fn dispatch(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    super::check_vmexit_ext(tls, mk)?;

    let Some(op) = VsOp::from_index(syscall::index(tls.ext_syscall)) else {
        return Err(super::report_unsupported(log, tls));
    };

    match op {
        VsOp::CreateVs => create_vs(log, tls, mk, intrinsic),
        VsOp::DestroyVs => destroy_vs(log, tls, mk),
        VsOp::InitAsRoot => init_as_root(log, tls, mk, intrinsic),
        VsOp::Read => read(log, tls, mk, intrinsic),
        VsOp::Write => write(log, tls, mk, intrinsic),
        VsOp::Run => {
            let target = resolve_triple(log, tls, mk)?;
            activate(log, tls, mk, intrinsic, target, false)?;
            Ok(Dispatch::Run)
        }
        VsOp::AdvanceIpAndRun => {
            let target = resolve_triple(log, tls, mk)?;
            activate(log, tls, mk, intrinsic, target, true)?;
            Ok(Dispatch::Run)
        }
        VsOp::SetActive => {
            let target = resolve_triple(log, tls, mk)?;
            activate(log, tls, mk, intrinsic, target, false)?;
            Ok(Dispatch::SUCCESS)
        }
        VsOp::AdvanceIpAndSetActive => {
            let target = resolve_triple(log, tls, mk)?;
            activate(log, tls, mk, intrinsic, target, true)?;
            Ok(Dispatch::SUCCESS)
        }
        VsOp::RunCurrent => run_current(log, tls, mk, intrinsic, false),
        VsOp::AdvanceIpAndRunCurrent => {
            run_current(log, tls, mk, intrinsic, true)
        }
        VsOp::Promote => promote(log, tls, mk, intrinsic),
        VsOp::Clear => clear(log, tls, mk, intrinsic),
        VsOp::Migrate => migrate(log, tls, mk, intrinsic),
        VsOp::TlbFlush => tlb_flush(log, tls, mk, intrinsic),
    }
}

fn local_vsid(tls: &Tls, mk: &Microkernel) -> Result<VsId, BfStatus> {
    helpers::get_locally_assigned_vsid(tls, tls.ext_reg1, &mk.vs_pool)
        .ok_or(BfStatus::InvalidInputReg1)
}

fn create_vs(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vpid = helpers::get_allocated_vpid(tls.ext_reg1, &mk.vp_pool)
        .ok_or(BfStatus::InvalidInputReg1)?;
    let ppid = helpers::get_ppid(tls, tls.ext_reg2)
        .ok_or(BfStatus::InvalidInputReg2)?;

    let vsid = mk
        .vs_pool
        .allocate(tls, &mut mk.page_pool, intrinsic, &mk.vp_pool, vpid, ppid)
        .map_err(unknown(log))?;

    debug!(log, "vs created";
        "vsid" => vsid.get(),
        "vpid" => vpid.get(),
        "assigned_pp" => ppid.get(),
    );
    tls.ext_reg0 = merge_reg_with_id(tls.ext_reg0, vsid.get());
    Ok(Dispatch::SUCCESS)
}

fn destroy_vs(log: &Logger, tls: &mut Tls, mk: &mut Microkernel) -> OpResult {
    let vsid = helpers::get_allocated_vsid(tls.ext_reg1, &mk.vs_pool)
        .ok_or(BfStatus::InvalidInputReg1)?;
    if !helpers::is_vs_destroyable(&mk.vs_pool, vsid) {
        error!(log, "vs is active"; "vsid" => vsid.get());
        return Err(BfStatus::FailureUnknown);
    }

    mk.vs_pool
        .deallocate(tls, &mut mk.page_pool, vsid)
        .map_err(unknown(log))?;

    debug!(log, "vs destroyed"; "vsid" => vsid.get());
    Ok(Dispatch::SUCCESS)
}

/// Seed a VS with the state the root OS had when the microkernel started.
fn init_as_root(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vsid = local_vsid(tls, mk)?;
    let state = tls.root_vp_state.clone();
    mk.vs_pool
        .state_save_to_vs(tls, intrinsic, vsid, &state)
        .map_err(unknown(log))?;
    Ok(Dispatch::SUCCESS)
}

fn read(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vsid = local_vsid(tls, mk)?;
    let reg =
        helpers::get_reg(tls.ext_reg2).ok_or(BfStatus::InvalidInputReg2)?;

    let val = mk
        .vs_pool
        .read(tls, intrinsic, vsid, reg)
        .map_err(unknown(log))?;
    tls.ext_reg0 = val;
    Ok(Dispatch::SUCCESS)
}

fn write(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vsid = local_vsid(tls, mk)?;
    let reg =
        helpers::get_reg(tls.ext_reg2).ok_or(BfStatus::InvalidInputReg2)?;
    let val = tls.ext_reg3;

    mk.vs_pool
        .write(tls, intrinsic, vsid, reg, val)
        .map_err(unknown(log))?;
    Ok(Dispatch::SUCCESS)
}

/// The VM, VP, and VS named by `reg1..reg3`, known to belong together.
#[derive(Clone, Copy, Debug)]
struct Triple {
    vmid: VmId,
    vpid: VpId,
    vsid: VsId,
}

/// Resolve `reg1..reg3` into a [Triple]. Ids are checked in register order
/// before any relation between them, so the first bad register is the one
/// reported.
fn resolve_triple(
    log: &Logger,
    tls: &Tls,
    mk: &Microkernel,
) -> Result<Triple, BfStatus> {
    let vmid = helpers::get_allocated_vmid(tls.ext_reg1, &mk.vm_pool)
        .ok_or(BfStatus::InvalidInputReg1)?;
    let vpid = helpers::get_allocated_vpid(tls.ext_reg2, &mk.vp_pool)
        .ok_or(BfStatus::InvalidInputReg2)?;
    let vsid = helpers::get_allocated_vsid(tls.ext_reg3, &mk.vs_pool)
        .ok_or(BfStatus::InvalidInputReg3)?;

    if !helpers::is_vp_assigned_to_vm(&mk.vp_pool, vpid, vmid) {
        error!(log, "vp is not assigned to vm";
            "vpid" => vpid.get(),
            "vmid" => vmid.get(),
        );
        return Err(BfStatus::InvalidInputReg2);
    }
    if !helpers::is_vs_assigned_to_vp(&mk.vs_pool, vsid, vpid) {
        error!(log, "vs is not assigned to vp";
            "vsid" => vsid.get(),
            "vpid" => vpid.get(),
        );
        return Err(BfStatus::InvalidInputReg3);
    }
    if !helpers::is_vp_assigned_to_current_pp(tls, &mk.vp_pool, vpid) {
        error!(log, "vp is not assigned to this pp"; "vpid" => vpid.get());
        return Err(BfStatus::InvalidInputReg2);
    }
    if mk.vm_pool.is_zombie(vmid)
        || mk.vp_pool.is_zombie(vpid)
        || mk.vs_pool.is_zombie(vsid)
    {
        error!(log, "cannot activate a zombie";
            "vmid" => vmid.get(),
            "vpid" => vpid.get(),
            "vsid" => vsid.get(),
        );
        return Err(BfStatus::FailureUnknown);
    }

    Ok(Triple { vmid, vpid, vsid })
}

/// Make `target` the active VM, VP, and VS of the calling PP, in that
/// order, then load the VM's direct map.
fn activate(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
    target: Triple,
    advance_ip: bool,
) -> Result<(), BfStatus> {
    let Triple { vmid, vpid, vsid } = target;

    if !helpers::is_vs_assigned_to_current_pp(tls, &mk.vs_pool, vsid) {
        mk.vs_pool
            .migrate(tls, intrinsic, vsid, tls.ppid)
            .map_err(unknown(log))?;
    }

    if advance_ip {
        mk.vs_pool
            .advance_ip(intrinsic, vsid)
            .map_err(unknown(log))?;
    }

    if !mk.vm_pool.is_active_on_this_pp(tls, vmid) {
        let prev = tls.active_vmid;
        mk.vm_pool.set_inactive(tls, prev).map_err(unknown(log))?;
        mk.vm_pool.set_active(tls, vmid).map_err(unknown(log))?;
    }
    if !mk.vp_pool.is_active_on_this_pp(tls, vpid) {
        let prev = tls.active_vpid;
        mk.vp_pool.set_inactive(tls, prev).map_err(unknown(log))?;
        mk.vp_pool.set_active(tls, vpid).map_err(unknown(log))?;
    }
    if !mk.vs_pool.is_active_on_this_pp(tls, vsid) {
        let prev = tls.active_vsid;
        mk.vs_pool.set_inactive(tls, prev).map_err(unknown(log))?;
        mk.vs_pool
            .set_active(tls, intrinsic, vsid)
            .map_err(unknown(log))?;
    }

    mk.ext_pool
        .signal_vm_active(tls, intrinsic, vmid)
        .map_err(unknown(log))
}

fn run_current(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
    advance_ip: bool,
) -> OpResult {
    let vsid = tls.active_vsid;
    if vsid.is_invalid() {
        error!(log, "no vs is active on this pp");
        return Err(BfStatus::FailureUnknown);
    }
    if advance_ip {
        mk.vs_pool
            .advance_ip(intrinsic, vsid)
            .map_err(unknown(log))?;
    }
    Ok(Dispatch::Run)
}

/// Hand the PP back to the root OS with the VS's state.
fn promote(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vsid = local_vsid(tls, mk)?;
    let mut state = tls.root_vp_state.clone();
    mk.vs_pool
        .vs_to_state_save(tls, intrinsic, vsid, &mut state)
        .map_err(unknown(log))?;
    tls.root_vp_state = state;
    Ok(Dispatch::Promote)
}

fn clear(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vsid = local_vsid(tls, mk)?;
    mk.vs_pool.clear(intrinsic, vsid).map_err(unknown(log))?;
    Ok(Dispatch::SUCCESS)
}

fn migrate(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vsid = helpers::get_allocated_vsid(tls.ext_reg1, &mk.vs_pool)
        .ok_or(BfStatus::InvalidInputReg1)?;
    let ppid = helpers::get_ppid(tls, tls.ext_reg2)
        .ok_or(BfStatus::InvalidInputReg2)?;

    mk.vs_pool
        .migrate(tls, intrinsic, vsid, ppid)
        .map_err(unknown(log))?;
    Ok(Dispatch::SUCCESS)
}

fn tlb_flush(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vsid = local_vsid(tls, mk)?;
    let gla = tls.ext_reg2;
    mk.vs_pool
        .tlb_flush(intrinsic, vsid, Some(gla))
        .map_err(unknown(log))?;
    Ok(Dispatch::SUCCESS)
}
