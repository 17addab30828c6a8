// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{debug, error, Logger};

use bf_types::consts::{
    is_page_aligned, HYPERVISOR_EXT_DIRECT_MAP_ADDR,
    HYPERVISOR_EXT_DIRECT_MAP_SIZE,
};
use bf_types::syscall::{self, SyscallOp, VmOp};
use bf_types::{merge_reg_with_id, BfStatus, VmId};

use crate::error::{Error, ObjKind};
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

    match VmOp::from_index(syscall::index(tls.ext_syscall)) {
        Some(VmOp::CreateVm) => create_vm(log, tls, mk),
        Some(VmOp::DestroyVm) => destroy_vm(log, tls, mk),
        Some(VmOp::MapDirect) => map_direct(log, tls, mk),
        Some(VmOp::UnmapDirect) => unmap_direct(log, tls, mk, intrinsic),
        Some(VmOp::UnmapDirectBroadcast) => {
            Err(super::report_unsupported(log, tls))
        }
        Some(VmOp::TlbFlush) => tlb_flush(log, tls, mk, intrinsic),
        None => Err(super::report_unsupported(log, tls)),
    }
}

fn vmid_arg(tls: &Tls, mk: &Microkernel) -> Result<VmId, BfStatus> {
    helpers::get_allocated_vmid(tls.ext_reg1, &mk.vm_pool)
        .ok_or(BfStatus::InvalidInputReg1)
}

fn create_vm(log: &Logger, tls: &mut Tls, mk: &mut Microkernel) -> OpResult {
    let vmid = mk
        .vm_pool
        .allocate(tls, &mut mk.ext_pool, &mut mk.page_pool)
        .map_err(unknown(log))?;

    debug!(log, "vm created"; "vmid" => vmid.get());
    tls.ext_reg0 = merge_reg_with_id(tls.ext_reg0, vmid.get());
    Ok(Dispatch::SUCCESS)
}

fn destroy_vm(log: &Logger, tls: &mut Tls, mk: &mut Microkernel) -> OpResult {
    let vmid = vmid_arg(tls, mk)?;
    if vmid.is_root() {
        error!(log, "the root vm cannot be destroyed");
        return Err(BfStatus::InvalidInputReg1);
    }
    if !helpers::is_vm_destroyable(&mk.vm_pool, &mk.vp_pool, vmid) {
        error!(log, "vm is active or still has vps"; "vmid" => vmid.get());
        return Err(BfStatus::FailureUnknown);
    }

    mk.vm_pool
        .deallocate(
            tls,
            &mut mk.ext_pool,
            &mut mk.page_pool,
            &mk.vp_pool,
            vmid,
        )
        .map_err(unknown(log))?;

    debug!(log, "vm destroyed"; "vmid" => vmid.get());
    Ok(Dispatch::SUCCESS)
}

fn map_direct(log: &Logger, tls: &mut Tls, mk: &mut Microkernel) -> OpResult {
    let vmid = vmid_arg(tls, mk)?;
    let phys = tls.ext_reg2;
    if phys == 0
        || !is_page_aligned(phys)
        || phys >= HYPERVISOR_EXT_DIRECT_MAP_SIZE
    {
        error!(log, "physical address cannot be direct mapped";
            "phys" => format!("{phys:#018x}"),
        );
        return Err(BfStatus::InvalidInputReg2);
    }

    let virt = mk
        .ext_pool
        .get_mut(tls.ext)
        .ok_or(Error::InvalidId(ObjKind::Ext))
        .and_then(|ext| ext.map_page_direct(vmid, phys))
        .map_err(unknown(log))?;

    tls.ext_reg0 = virt;
    Ok(Dispatch::SUCCESS)
}

fn unmap_direct(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vmid = vmid_arg(tls, mk)?;
    let virt = tls.ext_reg2;
    let window = HYPERVISOR_EXT_DIRECT_MAP_ADDR
        ..HYPERVISOR_EXT_DIRECT_MAP_ADDR + HYPERVISOR_EXT_DIRECT_MAP_SIZE;
    if !window.contains(&virt) || !is_page_aligned(virt) {
        error!(log, "address is outside the direct map";
            "virt" => format!("{virt:#018x}"),
        );
        return Err(BfStatus::InvalidInputReg2);
    }

    mk.ext_pool
        .get_mut(tls.ext)
        .ok_or(Error::InvalidId(ObjKind::Ext))
        .and_then(|ext| ext.unmap_page_direct(intrinsic, vmid, virt))
        .map_err(unknown(log))?;
    Ok(Dispatch::SUCCESS)
}

fn tlb_flush(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    let vmid = vmid_arg(tls, mk)?;
    mk.vs_pool
        .tlb_flush_vm(tls, intrinsic, vmid)
        .map_err(unknown(log))?;
    Ok(Dispatch::SUCCESS)
}
