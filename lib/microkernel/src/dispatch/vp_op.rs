// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{debug, error, Logger};

use bf_types::syscall::{self, SyscallOp, VpOp};
use bf_types::{merge_reg_with_id, BfStatus};

use crate::kernel::Microkernel;
use crate::tls::Tls;

use super::{helpers, unknown, Dispatch, OpResult};

pub(super) fn dispatch(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
) -> OpResult {
    super::check_vmexit_ext(tls, mk)?;

    match VpOp::from_index(syscall::index(tls.ext_syscall)) {
        Some(VpOp::CreateVp) => create_vp(log, tls, mk),
        Some(VpOp::DestroyVp) => destroy_vp(log, tls, mk),
        None => Err(super::report_unsupported(log, tls)),
    }
}

/// New VPs are assigned to the PP that created them.
fn create_vp(log: &Logger, tls: &mut Tls, mk: &mut Microkernel) -> OpResult {
    let vmid = helpers::get_allocated_vmid(tls.ext_reg1, &mk.vm_pool)
        .ok_or(BfStatus::InvalidInputReg1)?;

    let ppid = tls.ppid;
    let vpid = mk
        .vp_pool
        .allocate(tls, &mk.vm_pool, vmid, ppid)
        .map_err(unknown(log))?;

    debug!(log, "vp created"; "vpid" => vpid.get(), "vmid" => vmid.get());
    tls.ext_reg0 = merge_reg_with_id(tls.ext_reg0, vpid.get());
    Ok(Dispatch::SUCCESS)
}

fn destroy_vp(log: &Logger, tls: &mut Tls, mk: &mut Microkernel) -> OpResult {
    let vpid = helpers::get_allocated_vpid(tls.ext_reg1, &mk.vp_pool)
        .ok_or(BfStatus::InvalidInputReg1)?;
    if !helpers::is_vp_destroyable(&mk.vp_pool, &mk.vs_pool, vpid) {
        error!(log, "vp is active or still has vss"; "vpid" => vpid.get());
        return Err(BfStatus::FailureUnknown);
    }

    mk.vp_pool
        .deallocate(tls, &mk.vs_pool, vpid)
        .map_err(unknown(log))?;

    debug!(log, "vp destroyed"; "vpid" => vpid.get());
    Ok(Dispatch::SUCCESS)
}
