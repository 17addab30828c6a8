// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Memory handed out to extensions. Nothing is ever given back: the free
//! ops are reported as unsupported.

use slog::{error, Logger};

use bf_types::syscall::{self, MemOp, SyscallOp};
use bf_types::BfStatus;

use crate::error::{Error, ObjKind};
use crate::ext::ExtAlloc;
use crate::kernel::Microkernel;
use crate::tls::Tls;

use super::{unknown, Dispatch, OpResult};

pub(super) fn dispatch(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
) -> OpResult {
    super::check_vmexit_ext(tls, mk)?;

    let (virt, phys): ExtAlloc =
        match MemOp::from_index(syscall::index(tls.ext_syscall)) {
            Some(MemOp::AllocPage) => {
                let page_pool = &mut mk.page_pool;
                mk.ext_pool
                    .get_mut(tls.ext)
                    .ok_or(Error::InvalidId(ObjKind::Ext))
                    .and_then(|ext| ext.alloc_page(page_pool))
                    .map_err(unknown(log))?
            }
            Some(MemOp::AllocHuge) => {
                let size = tls.ext_reg1;
                if size == 0 || size > mk.huge_pool.size() {
                    error!(log, "bad huge allocation size"; "size" => size);
                    return Err(BfStatus::InvalidInputReg1);
                }
                let huge_pool = &mut mk.huge_pool;
                mk.ext_pool
                    .get_mut(tls.ext)
                    .ok_or(Error::InvalidId(ObjKind::Ext))
                    .and_then(|ext| ext.alloc_huge(huge_pool, size))
                    .map_err(unknown(log))?
            }
            Some(MemOp::FreePage) | Some(MemOp::FreeHuge) | None => {
                return Err(super::report_unsupported(log, tls));
            }
        };

    tls.ext_reg0 = virt;
    tls.ext_reg1 = phys;
    Ok(Dispatch::SUCCESS)
}
