// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bf_types::{ExtId, PpId, VmId};

use crate::intrinsic::IntrinsicError;

/// Kind of lifecycle object an [Error] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ObjKind {
    Vm,
    Vp,
    Vs,
    Ext,
}

/// Failures reported by kernel objects and pools.
///
/// Dispatch collapses all of these into `BF_STATUS_FAILURE_UNKNOWN`; the
/// detail is only for the log.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("{0} has not been initialized")]
    NotInitialized(ObjKind),

    #[error("{0} {1:#06x} is already initialized")]
    AlreadyInitialized(ObjKind, u16),

    #[error("invalid {0} id")]
    InvalidId(ObjKind),

    #[error("{0} {1:#06x} is a zombie")]
    Zombie(ObjKind, u16),

    #[error("{0} {1:#06x} is not allocated")]
    NotAllocated(ObjKind, u16),

    #[error("{0} {1:#06x} is already allocated")]
    AlreadyAllocated(ObjKind, u16),

    #[error("no free {0} left in the pool")]
    PoolExhausted(ObjKind),

    #[error("{kind} {id:#06x} is active on pp {ppid}")]
    Active { kind: ObjKind, id: u16, ppid: PpId },

    #[error("{kind} {id:#06x} is not the active {kind} on pp {ppid}")]
    NotActive { kind: ObjKind, id: u16, ppid: PpId },

    #[error("{kind} {active:#06x} is still active on pp {ppid}")]
    OtherActive { kind: ObjKind, active: u16, ppid: PpId },

    #[error("{kind} {id:#06x} still has {child} {child_id:#06x} assigned")]
    StillAssigned { kind: ObjKind, id: u16, child: ObjKind, child_id: u16 },

    #[error("{kind} {id:#06x} is assigned to pp {assigned}, not pp {ppid}")]
    WrongPp { kind: ObjKind, id: u16, assigned: PpId, ppid: PpId },

    #[error("{kind} {id:#06x} is already assigned to pp {ppid}")]
    SamePp { kind: ObjKind, id: u16, ppid: PpId },

    #[error("pp {0} is invalid or offline")]
    PpOffline(PpId),

    #[error("vm {0} is not allocated or is a zombie")]
    VmUnusable(VmId),

    #[error("{0} {1:#06x} is not allocated or is a zombie")]
    ParentUnusable(ObjKind, u16),

    #[error("the root vm cannot be destroyed")]
    RootVm,

    #[error("out of memory in the {0}")]
    OutOfMemory(&'static str),

    #[error("address {0:#018x} does not belong to the {1}")]
    BadAddress(u64, &'static str),

    #[error("ext {0} already has an open handle")]
    HandleOpen(ExtId),

    #[error("ext {0} has no open handle")]
    HandleClosed(ExtId),

    #[error("the {0} callback was already registered")]
    CallbackRegistered(&'static str),

    #[error("no {0} callback was registered")]
    CallbackMissing(&'static str),

    #[error("vm {vmid} already has a direct map in ext {extid}")]
    DirectMapExists { extid: ExtId, vmid: VmId },

    #[error("vm {vmid} has no direct map in ext {extid}")]
    NoDirectMap { extid: ExtId, vmid: VmId },

    #[error("{virt:#018x} is already mapped in the direct map of vm {vmid}")]
    AlreadyMapped { vmid: VmId, virt: u64 },

    #[error("{virt:#018x} is not mapped in the direct map of vm {vmid}")]
    NotMapped { vmid: VmId, virt: u64 },

    #[error("msr {0:#010x} is reserved by the microkernel")]
    MsrDenied(u32),

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error(transparent)]
    Intrinsic(#[from] IntrinsicError),
}

pub type Result<T> = std::result::Result<T, Error>;
