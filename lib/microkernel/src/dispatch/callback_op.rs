// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Registration of the entry points an extension is called back on.

use slog::{error, info, Logger};

use bf_types::syscall::{self, CallbackOp, SyscallOp};
use bf_types::BfStatus;

use crate::kernel::Microkernel;
use crate::tls::Tls;

use super::{helpers, Dispatch, OpResult};

pub(super) fn dispatch(
    log: &Logger,
    tls: &mut Tls,
    mk: &mut Microkernel,
) -> OpResult {
    let Some(op) = CallbackOp::from_index(syscall::index(tls.ext_syscall))
    else {
        return Err(super::report_unsupported(log, tls));
    };

    if !helpers::verify_handle_for_current_ext(tls, &mk.ext_pool) {
        return Err(BfStatus::FailureInvalidHandle);
    }
    let ip = tls.ext_reg1;
    if ip == 0 {
        error!(log, "callback ip is null"; "op" => ?op);
        return Err(BfStatus::InvalidInputReg1);
    }

    let extid = tls.ext;
    let ext = mk
        .ext_pool
        .get_mut(extid)
        .ok_or(BfStatus::FailureInvalidHandle)?;

    match op {
        CallbackOp::RegisterBootstrap => ext.set_bootstrap_ip(ip),
        CallbackOp::RegisterVmexit => {
            if tls.ext_vmexit.is_valid() {
                error!(log, "vmexit handler already registered";
                    "owner" => tls.ext_vmexit.get(),
                );
                return Err(BfStatus::FailureUnknown);
            }
            ext.set_vmexit_ip(ip);
            tls.ext_vmexit = extid;
        }
        CallbackOp::RegisterFail => {
            if tls.ext_fail.is_valid() {
                error!(log, "fail handler already registered";
                    "owner" => tls.ext_fail.get(),
                );
                return Err(BfStatus::FailureUnknown);
            }
            ext.set_fail_ip(ip);
            tls.ext_fail = extid;
        }
    }

    info!(log, "callback registered";
        "op" => ?op,
        "extid" => extid.get(),
        "ip" => format!("{ip:#018x}"),
    );
    Ok(Dispatch::SUCCESS)
}

#[cfg(test)]
mod test {
    use bf_types::syscall::CallbackOp;
    use bf_types::{BfStatus, ExtId, PpId};

    use crate::dispatch::test_support::Harness;
    use crate::dispatch::Dispatch;

    /// A harness whose BSP has not registered any handlers yet.
    fn fresh() -> Harness {
        let mut h = Harness::new(1);
        h.tls[0].ext_vmexit = ExtId::INVALID;
        h.tls[0].ext_fail = ExtId::INVALID;
        h
    }

    #[test]
    fn register_all() {
        let mut h = fresh();
        const TEST_CASES: &[(CallbackOp, u64)] = &[
            (CallbackOp::RegisterBootstrap, 0x1000),
            (CallbackOp::RegisterVmexit, 0x2000),
            (CallbackOp::RegisterFail, 0x3000),
        ];
        for (op, ip) in TEST_CASES {
            assert_eq!(h.call(0, *op, &[*ip]), Dispatch::SUCCESS, "{op:?}");
        }

        let ext = h.mk.ext_pool.get(ExtId::new(0)).unwrap();
        assert_eq!(ext.bootstrap_ip(), Some(0x1000));
        assert_eq!(ext.vmexit_ip(), Some(0x2000));
        assert_eq!(ext.fail_ip(), Some(0x3000));
        assert_eq!(h.tls[0].ext_vmexit, ExtId::new(0));
        assert_eq!(h.tls[0].ext_fail, ExtId::new(0));
    }

    #[test]
    fn null_ip() {
        let mut h = fresh();
        assert_eq!(
            h.call(0, CallbackOp::RegisterVmexit, &[0]),
            Dispatch::Return(BfStatus::InvalidInputReg1)
        );
        assert!(h.tls[0].ext_vmexit.is_invalid());
    }

    #[test]
    fn handlers_register_once() {
        let mut h = fresh();
        for op in [CallbackOp::RegisterVmexit, CallbackOp::RegisterFail] {
            assert_eq!(h.call(0, op, &[0x1000]), Dispatch::SUCCESS);
            assert_eq!(
                h.call(0, op, &[0x2000]),
                Dispatch::Return(BfStatus::FailureUnknown)
            );
        }
        assert_eq!(
            h.call(0, CallbackOp::RegisterBootstrap, &[0x1000]),
            Dispatch::SUCCESS
        );
        assert_eq!(
            h.call(0, CallbackOp::RegisterBootstrap, &[0x2000]),
            Dispatch::SUCCESS
        );
    }

    #[test]
    fn aps_see_handlers_from_boot() {
        let mut h = Harness::new(2);
        assert_eq!(h.tls[1].ppid, PpId::new(1));
        assert_eq!(
            h.call(1, CallbackOp::RegisterVmexit, &[0x1000]),
            Dispatch::Return(BfStatus::FailureUnknown)
        );
    }

    #[test]
    fn bad_handle() {
        let mut h = fresh();
        h.handle = 0;
        assert_eq!(
            h.call(0, CallbackOp::RegisterBootstrap, &[0x1000]),
            Dispatch::Return(BfStatus::FailureInvalidHandle)
        );
    }
}
