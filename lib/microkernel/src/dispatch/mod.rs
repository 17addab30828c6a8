// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Syscall dispatch.
//!
//! A syscall arrives as the syscall word and argument registers stored in
//! the calling PP's [Tls]. Each op family validates every argument before
//! touching any object, in register order, so the first bad register is
//! the one reported. Object-level failures after that point are reported
//! as `BF_STATUS_FAILURE_UNKNOWN`.

use slog::{error, warn, Logger};

use bf_types::syscall::{self, OpFamily, BF_SYSCALL_SIG_VAL};
use bf_types::BfStatus;

use crate::error::Error;
use crate::intrinsic::Intrinsic;
use crate::kernel::Microkernel;
use crate::tls::Tls;

mod callback_op;
mod control_op;
mod handle_op;
mod helpers;
mod intrinsic_op;
mod mem_op;
mod vm_op;
mod vp_op;
mod vs_op;

/// What the caller of [dispatch_syscall] must do next on this PP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Return to the extension with this status in the syscall register.
    Return(BfStatus),
    /// Enter the active VS.
    Run,
    /// Give the PP back to the root OS, using the state in
    /// [Tls::root_vp_state].
    Promote,
    /// The extension asked to exit.
    Exit,
    /// The extension has nothing left to do until the next event.
    Wait,
}

impl Dispatch {
    pub const SUCCESS: Dispatch = Dispatch::Return(BfStatus::Success);

    /// The status the extension observes if control returns to it.
    pub fn status(self) -> BfStatus {
        match self {
            Dispatch::Return(status) => status,
            _ => BfStatus::Success,
        }
    }
}

/// Result of a single op handler. The error side is the status to report.
type OpResult = Result<Dispatch, BfStatus>;

/// Handle the syscall described by `tls`.
pub fn dispatch_syscall(
    tls: &mut Tls,
    mk: &mut Microkernel,
    intrinsic: &mut dyn Intrinsic,
) -> Dispatch {
    let log = mk.log().new(slog::o!(
        "component" => "dispatch",
        "ppid" => tls.ppid.get(),
    ));
    let word = tls.ext_syscall;
    tls.state_reversal_required = false;

    if syscall::signature(word) != BF_SYSCALL_SIG_VAL {
        warn!(log, "syscall signature mismatch"; "syscall" => word);
        return Dispatch::Return(BfStatus::FailureUnsupported);
    }

    let res = match OpFamily::decode(word) {
        Some(OpFamily::Control) => control_op::dispatch(&log, tls),
        Some(OpFamily::Handle) => handle_op::dispatch(&log, tls, mk),
        Some(OpFamily::Debug) => Err(report_unsupported(&log, tls)),
        Some(OpFamily::Callback) => callback_op::dispatch(&log, tls, mk),
        Some(OpFamily::Vm) => vm_op::dispatch(&log, tls, mk, intrinsic),
        Some(OpFamily::Vp) => vp_op::dispatch(&log, tls, mk),
        Some(OpFamily::Vs) => vs_op::dispatch(&log, tls, mk, intrinsic),
        Some(OpFamily::Intrinsic) => {
            intrinsic_op::dispatch(&log, tls, mk, intrinsic)
        }
        Some(OpFamily::Mem) => mem_op::dispatch(&log, tls, mk),
        None => Err(report_unsupported(&log, tls)),
    };

    res.unwrap_or_else(|status| {
        warn!(log, "syscall failed";
            "syscall" => format!("{word:#018x}"),
            "status" => %status,
            "state_reversal_required" => tls.state_reversal_required,
        );
        Dispatch::Return(status)
    })
}

/// Report a syscall this microkernel does not implement.
fn report_unsupported(log: &Logger, tls: &Tls) -> BfStatus {
    error!(log, "unsupported syscall";
        "syscall" => format!("{:#018x}", tls.ext_syscall),
        "reg0" => tls.ext_reg0,
        "reg1" => tls.ext_reg1,
        "reg2" => tls.ext_reg2,
        "reg3" => tls.ext_reg3,
    );
    BfStatus::FailureUnsupported
}

/// Map an object-level failure to `BF_STATUS_FAILURE_UNKNOWN`, logging the
/// detail.
fn unknown(log: &Logger) -> impl Fn(Error) -> BfStatus + '_ {
    move |e| {
        error!(log, "operation failed"; "error" => %e);
        BfStatus::FailureUnknown
    }
}

/// The handle and vmexit-extension checks that guard every op family
/// except control, handle, and callback ops.
fn check_vmexit_ext(tls: &Tls, mk: &Microkernel) -> Result<(), BfStatus> {
    if !helpers::verify_handle_for_current_ext(tls, &mk.ext_pool) {
        return Err(BfStatus::FailureInvalidHandle);
    }
    if !tls.is_active_ext_the_vmexit_ext() {
        return Err(BfStatus::InvalidPermDenied);
    }
    Ok(())
}


#[cfg(test)]
mod test {
    use super::test_support::Harness;
    use super::*;
    use bf_types::syscall::{SyscallOp, VmOp};

    #[test]
    fn bad_signature() {
        let mut h = Harness::new(1);
        let word = VmOp::CreateVm.word() & !syscall::BF_SYSCALL_SIG_MASK;
        h.tls[0].ext_syscall = word;
        assert_eq!(
            dispatch_syscall(&mut h.tls[0], &mut h.mk, &mut h.intrinsic),
            Dispatch::Return(BfStatus::FailureUnsupported)
        );
    }

    #[test]
    fn unknown_family() {
        let mut h = Harness::new(1);
        h.tls[0].ext_syscall = BF_SYSCALL_SIG_VAL | 0x0042_0000;
        assert_eq!(
            dispatch_syscall(&mut h.tls[0], &mut h.mk, &mut h.intrinsic),
            Dispatch::Return(BfStatus::FailureUnsupported)
        );
    }

    #[test]
    fn debug_ops_are_unsupported() {
        use bf_types::syscall::DebugOp;
        use strum::IntoEnumIterator;

        let mut h = Harness::new(1);
        for op in DebugOp::iter() {
            assert_eq!(
                h.call(0, op, &[]),
                Dispatch::Return(BfStatus::FailureUnsupported),
                "{op:?}"
            );
        }
    }

    #[test]
    fn state_reversal_is_tracked_per_syscall() {
        let mut h = Harness::new(1);
        assert_eq!(h.call(0, VmOp::CreateVm, &[]), Dispatch::SUCCESS);
        assert!(h.tls[0].state_reversal_required);

        assert_eq!(h.call(0, VmOp::TlbFlush, &[0]), Dispatch::SUCCESS);
        assert!(!h.tls[0].state_reversal_required);

        assert_eq!(h.call(0, VmOp::DestroyVm, &[1]), Dispatch::SUCCESS);
        assert!(h.tls[0].state_reversal_required);
        assert_eq!(
            h.call(0, VmOp::DestroyVm, &[1]),
            Dispatch::Return(BfStatus::InvalidInputReg1)
        );
        assert!(!h.tls[0].state_reversal_required);
    }

    #[test]
    fn non_return_outcomes_read_as_success() {
        assert_eq!(Dispatch::Run.status(), BfStatus::Success);
        assert_eq!(
            Dispatch::Return(BfStatus::FailureUnknown).status(),
            BfStatus::FailureUnknown
        );
    }
}
