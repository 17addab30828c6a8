// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{debug, error, Logger};

use bf_types::consts::is_spec1_supported;
use bf_types::syscall::{self, HandleOp, SyscallOp};
use bf_types::BfStatus;

use crate::error::{Error, ObjKind};
use crate::kernel::Microkernel;
use crate::tls::Tls;

use super::{helpers, unknown, Dispatch, OpResult};

pub(super) fn dispatch(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
) -> OpResult {
    match HandleOp::from_index(syscall::index(tls.ext_syscall)) {
        Some(HandleOp::OpenHandle) => open_handle(log, tls, mk),
        Some(HandleOp::CloseHandle) => close_handle(log, tls, mk),
        None => Err(super::report_unsupported(log, tls)),
    }
}

fn open_handle(log: &Logger, tls: &mut Tls, mk: &mut Microkernel) -> OpResult {
    let version = u32::try_from(tls.ext_reg0).unwrap_or(0);
    if !is_spec1_supported(version) {
        error!(log, "unsupported abi version"; "version" => tls.ext_reg0);
        return Err(BfStatus::InvalidInputReg0);
    }

    let ext = mk
        .ext_pool
        .get_mut(tls.ext)
        .ok_or(Error::InvalidId(ObjKind::Ext))
        .map_err(unknown(log))?;
    let handle = ext.open_handle().map_err(unknown(log))?;

    debug!(log, "handle opened"; "extid" => tls.ext.get());
    tls.ext_reg0 = handle;
    Ok(Dispatch::SUCCESS)
}

fn close_handle(log: &Logger, tls: &Tls, mk: &mut Microkernel) -> OpResult {
    if !helpers::verify_handle_for_current_ext(tls, &mk.ext_pool) {
        return Err(BfStatus::FailureInvalidHandle);
    }
    if let Some(ext) = mk.ext_pool.get_mut(tls.ext) {
        ext.close_handle();
    }
    debug!(log, "handle closed"; "extid" => tls.ext.get());
    Ok(Dispatch::SUCCESS)
}
