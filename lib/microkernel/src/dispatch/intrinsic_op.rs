// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::Logger;

use bf_types::syscall::{self, IntrinsicOp, SyscallOp};
use bf_types::BfStatus;

use crate::intrinsic::Intrinsic;
use crate::kernel::Microkernel;
use crate::msr::MsrId;
use crate::tls::Tls;

use super::{unknown, Dispatch, OpResult};

pub(super) fn dispatch(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> OpResult {
    super::check_vmexit_ext(tls, mk)?;

    let Some(op) = IntrinsicOp::from_index(syscall::index(tls.ext_syscall))
    else {
        return Err(super::report_unsupported(log, tls));
    };
    let msr =
        MsrId::from_reg(tls.ext_reg1).ok_or(BfStatus::InvalidInputReg1)?;

    match op {
        IntrinsicOp::Rdmsr => {
            tls.ext_reg0 = mk
                .msr_policy
                .rdmsr(intrinsic, msr)
                .map_err(unknown(log))?;
        }
        IntrinsicOp::Wrmsr => {
            mk.msr_policy
                .wrmsr(intrinsic, msr, tls.ext_reg2)
                .map_err(unknown(log))?;
        }
    }
    Ok(Dispatch::SUCCESS)
}
