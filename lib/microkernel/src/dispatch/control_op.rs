// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{info, Logger};

use bf_types::syscall::{self, ControlOp, SyscallOp};

use crate::tls::Tls;

use super::{Dispatch, OpResult};

pub(super) fn dispatch(log: &Logger, tls: &Tls) -> OpResult {
    match ControlOp::from_index(syscall::index(tls.ext_syscall)) {
        Some(ControlOp::Exit) => {
            info!(log, "extension requested exit"; "extid" => tls.ext.get());
            Ok(Dispatch::Exit)
        }
        Some(ControlOp::Wait) => Ok(Dispatch::Wait),
        None => Err(super::report_unsupported(log, tls)),
    }
}
