// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The default extension: demote the root OS into the root VM on every PP
//! and handle the exits it produces.

use slog::{debug, error, info, Logger};

use bf_syscall::BfSyscallOps;
use bf_types::{BfReg, PpId, TlsReg, VmId, VsId};

/// Entry points handed to the microkernel. Only their being non-null
/// matters to the in-process kernel.
pub const BOOTSTRAP_IP: u64 = 0x0000_0300_0000_1000;
pub const VMEXIT_IP: u64 = 0x0000_0300_0000_2000;
pub const FAIL_IP: u64 = 0x0000_0300_0000_3000;

pub const EXIT_REASON_NMI: u64 = 0x0;
pub const EXIT_REASON_NMI_WINDOW: u64 = 0x8;
pub const EXIT_REASON_CPUID: u64 = 0xA;

const VMCS_SET_NMI_WINDOW_EXITING: u64 = 0x0040_0000;
const VMCS_CLEAR_NMI_WINDOW_EXITING: u64 = 0xFFBF_FFFF;
const VMCS_ENTRY_INTERRUPT_INFO_NMI: u64 = 0x8000_0202;

/// Answers a CPUID leaf/subleaf as `[eax, ebx, ecx, edx]`.
pub type CpuidFn = fn(u32, u32) -> [u32; 4];

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Pass CPUID through to the processor we run on.
        pub fn host_cpuid(leaf: u32, subleaf: u32) -> [u32; 4] {
            #[allow(unused_unsafe)]
            // SAFETY: every x86_64 processor implements cpuid
            let res = unsafe {
                std::arch::x86_64::__cpuid_count(leaf, subleaf)
            };
            [res.eax, res.ebx, res.ecx, res.edx]
        }
    } else {
        pub fn host_cpuid(_leaf: u32, _subleaf: u32) -> [u32; 4] {
            [0; 4]
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtError {
    #[error(transparent)]
    Syscall(#[from] bf_syscall::Error),

    #[error("unsupported vmexit {0:#x}")]
    UnsupportedVmexit(u64),
}

pub type Result<T> = std::result::Result<T, ExtError>;

pub struct DefaultExtension<S: BfSyscallOps> {
    log: Logger,
    sys: S,
    cpuid: CpuidFn,
}

impl<S: BfSyscallOps> DefaultExtension<S> {
    pub fn new(log: &Logger, sys: S, cpuid: CpuidFn) -> Self {
        Self {
            log: log.new(slog::o!("component" => "default_ext")),
            sys,
            cpuid,
        }
    }

    pub fn sys(&self) -> &S {
        &self.sys
    }

    pub fn sys_mut(&mut self) -> &mut S {
        &mut self.sys
    }

    /// Open a handle, register the entry points, and hand the BSP back to
    /// the microkernel.
    pub fn main(&mut self, version: u32) -> Result<()> {
        self.sys.initialize(version, BOOTSTRAP_IP, VMEXIT_IP, FAIL_IP)?;
        info!(self.log, "extension started"; "handle" => self.sys.handle());
        self.sys.bf_control_op_wait();
        Ok(())
    }

    /// Called on each PP as it is started. Control only comes back here
    /// when the PP could not be handed to the root VM.
    pub fn bootstrap_entry(&mut self, ppid: PpId) {
        if let Err(e) = self.bootstrap(ppid) {
            error!(self.log, "bootstrap failed";
                "ppid" => ppid.get(),
                "error" => %e,
            );
            self.sys.bf_control_op_exit();
        }
    }

    pub fn vmexit_entry(&mut self, vsid: VsId, exit_reason: u64) {
        if let Err(e) = self.vmexit(vsid, exit_reason) {
            error!(self.log, "vmexit not handled";
                "vsid" => vsid.get(),
                "exit_reason" => exit_reason,
                "error" => %e,
            );
            self.sys.bf_control_op_exit();
        }
    }

    /// The root VS failed in a way the microkernel could not recover from.
    /// Give the PP back to the root OS.
    pub fn fail_entry(&mut self, vsid: VsId, fail_reason: u64) {
        error!(self.log, "fast fail";
            "vsid" => vsid.get(),
            "ppid" => self.sys.bf_tls_ppid().get(),
            "reason" => format!("{fail_reason:#x}"),
        );
        if self.sys.bf_vs_op_promote(vsid).is_err() {
            self.sys.bf_control_op_exit();
        }
    }

    fn bootstrap(&mut self, ppid: PpId) -> Result<()> {
        let vpid = self.sys.bf_vp_op_create_vp(VmId::ROOT)?;
        let vsid = self.sys.bf_vs_op_create_vs(vpid, ppid)?;
        self.sys.bf_vs_op_init_as_root(vsid)?;

        debug!(self.log, "demoting root os";
            "ppid" => ppid.get(),
            "vpid" => vpid.get(),
            "vsid" => vsid.get(),
        );
        self.sys.bf_vs_op_run(VmId::ROOT, vpid, vsid)?;
        Ok(())
    }

    fn vmexit(&mut self, vsid: VsId, exit_reason: u64) -> Result<()> {
        match exit_reason {
            EXIT_REASON_NMI => self.handle_nmi(vsid),
            EXIT_REASON_NMI_WINDOW => self.handle_nmi_window(vsid),
            EXIT_REASON_CPUID => self.handle_cpuid(),
            other => Err(ExtError::UnsupportedVmexit(other)),
        }
    }

    /// NMIs are not ours. Ask for an exit once the guest can take one and
    /// reinject it then.
    fn handle_nmi(&mut self, vsid: VsId) -> Result<()> {
        let reg = BfReg::PrimaryProcBasedVmExecutionCtls;
        let ctls = self.sys.bf_vs_op_read(vsid, reg)?;
        self.sys
            .bf_vs_op_write(vsid, reg, ctls | VMCS_SET_NMI_WINDOW_EXITING)?;
        self.sys.bf_vs_op_run_current()?;
        Ok(())
    }

    fn handle_nmi_window(&mut self, vsid: VsId) -> Result<()> {
        let reg = BfReg::PrimaryProcBasedVmExecutionCtls;
        let ctls = self.sys.bf_vs_op_read(vsid, reg)?;
        self.sys
            .bf_vs_op_write(vsid, reg, ctls & VMCS_CLEAR_NMI_WINDOW_EXITING)?;
        self.sys.bf_vs_op_write(
            vsid,
            BfReg::VmentryInterruptInformationField,
            VMCS_ENTRY_INTERRUPT_INFO_NMI,
        )?;
        self.sys.bf_vs_op_run_current()?;
        Ok(())
    }

    fn handle_cpuid(&mut self) -> Result<()> {
        // Only the low halves of rax and rcx select the leaf.
        let leaf = self.sys.tls_reg(TlsReg::Rax) as u32;
        let subleaf = self.sys.tls_reg(TlsReg::Rcx) as u32;
        let [eax, ebx, ecx, edx] = (self.cpuid)(leaf, subleaf);

        self.sys.set_tls_reg(TlsReg::Rax, eax.into());
        self.sys.set_tls_reg(TlsReg::Rbx, ebx.into());
        self.sys.set_tls_reg(TlsReg::Rcx, ecx.into());
        self.sys.set_tls_reg(TlsReg::Rdx, edx.into());
        self.sys.bf_vs_op_advance_ip_and_run_current()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bf_syscall::mock::MockBfSyscall;
    use bf_types::consts::BF_ALL_SPECS_SUPPORTED_VAL;
    use bf_types::{BfStatus, VpId};

    fn fake_cpuid(leaf: u32, subleaf: u32) -> [u32; 4] {
        [leaf + 1, 0xB, subleaf + 2, 0xD]
    }

    fn extension() -> DefaultExtension<MockBfSyscall> {
        let log = slog::Logger::root(slog::Discard, slog::o!());
        DefaultExtension::new(&log, MockBfSyscall::new(), fake_cpuid)
    }

    #[test]
    fn main_initializes_then_waits() {
        let mut ext = extension();
        ext.main(BF_ALL_SPECS_SUPPORTED_VAL).unwrap();
        assert_eq!(ext.sys().calls("initialize"), 1);
        assert_eq!(ext.sys().calls("bf_control_op_wait"), 1);

        let mut ext = extension();
        ext.sys_mut().set_initialize(BfStatus::FailureUnknown);
        assert!(ext.main(BF_ALL_SPECS_SUPPORTED_VAL).is_err());
        assert_eq!(ext.sys().calls("bf_control_op_wait"), 0);
    }

    #[test]
    fn bootstrap_runs_the_root_vs() {
        let mut ext = extension();
        let sys = ext.sys_mut();
        sys.set_bf_vp_op_create_vp(VmId::ROOT, VpId::new(1));
        sys.set_bf_vs_op_create_vs(VpId::new(1), PpId::new(1), VsId::new(1));

        ext.bootstrap_entry(PpId::new(1));
        assert_eq!(ext.sys().calls("bf_vs_op_init_as_root"), 1);
        assert_eq!(ext.sys().calls("bf_vs_op_run"), 1);
        assert_eq!(ext.sys().calls("bf_control_op_exit"), 0);
    }

    #[test]
    fn bootstrap_failures_exit() {
        const TEST_CASES: &[&str] = &[
            "bf_vp_op_create_vp",
            "bf_vs_op_create_vs",
            "bf_vs_op_init_as_root",
            "bf_vs_op_run",
        ];
        for &failing in TEST_CASES {
            let mut ext = extension();
            let sys = ext.sys_mut();
            sys.set_bf_vp_op_create_vp(VmId::ROOT, VpId::new(0));
            sys.set_bf_vs_op_create_vs(VpId::new(0), PpId::BS, VsId::new(0));
            let (vpid, vsid) = (VpId::new(0), VsId::new(0));
            match failing {
                "bf_vp_op_create_vp" => {
                    sys.set_status(failing, &[0], BfStatus::FailureUnknown)
                }
                "bf_vs_op_create_vs" => sys.set_status(
                    failing,
                    &[vpid.into(), 0],
                    BfStatus::FailureUnknown,
                ),
                "bf_vs_op_init_as_root" => sys
                    .set_bf_vs_op_init_as_root(vsid, BfStatus::FailureUnknown),
                _ => sys.set_bf_vs_op_run(
                    VmId::ROOT,
                    vpid,
                    vsid,
                    BfStatus::FailureUnknown,
                ),
            }

            ext.bootstrap_entry(PpId::BS);
            assert_eq!(ext.sys().calls("bf_control_op_exit"), 1, "{failing}");
        }
    }

    #[test]
    fn cpuid_is_emulated() {
        let mut ext = extension();
        ext.sys_mut().set_tls_reg(TlsReg::Rax, 0xFFFF_FFFF_0000_0007);
        ext.sys_mut().set_tls_reg(TlsReg::Rcx, 1);

        ext.vmexit_entry(VsId::new(0), EXIT_REASON_CPUID);
        let sys = ext.sys();
        assert_eq!(sys.tls_reg(TlsReg::Rax), 8);
        assert_eq!(sys.tls_reg(TlsReg::Rbx), 0xB);
        assert_eq!(sys.tls_reg(TlsReg::Rcx), 3);
        assert_eq!(sys.tls_reg(TlsReg::Rdx), 0xD);
        assert_eq!(sys.calls("bf_vs_op_advance_ip_and_run_current"), 1);
        assert_eq!(sys.calls("bf_control_op_exit"), 0);
    }

    #[test]
    fn nmis_are_reinjected_at_the_window() {
        let mut ext = extension();
        let vsid = VsId::new(0);
        let ctls = BfReg::PrimaryProcBasedVmExecutionCtls;
        ext.sys_mut().set_bf_vs_op_read(vsid, ctls, 0x1);

        ext.vmexit_entry(vsid, EXIT_REASON_NMI);
        assert_eq!(ext.sys_mut().bf_vs_op_read(vsid, ctls), Ok(0x40_0001));

        ext.vmexit_entry(vsid, EXIT_REASON_NMI_WINDOW);
        let sys = ext.sys_mut();
        assert_eq!(sys.bf_vs_op_read(vsid, ctls), Ok(0x1));
        assert_eq!(
            sys.bf_vs_op_read(vsid, BfReg::VmentryInterruptInformationField),
            Ok(VMCS_ENTRY_INTERRUPT_INFO_NMI)
        );
        assert_eq!(sys.calls("bf_vs_op_run_current"), 2);
    }

    #[test]
    fn unknown_exits_stop_the_extension() {
        let mut ext = extension();
        ext.vmexit_entry(VsId::new(0), 0x30);
        assert_eq!(ext.sys().calls("bf_control_op_exit"), 1);
    }

    #[test]
    fn fail_promotes() {
        let mut ext = extension();
        ext.fail_entry(VsId::new(0), 0xDEAD);
        assert_eq!(ext.sys().calls("bf_vs_op_promote"), 1);
        assert_eq!(ext.sys().calls("bf_control_op_exit"), 0);

        ext.sys_mut()
            .set_bf_vs_op_promote(VsId::new(0), BfStatus::FailureUnknown);
        ext.fail_entry(VsId::new(0), 0xDEAD);
        assert_eq!(ext.sys().calls("bf_control_op_exit"), 1);
    }
}
