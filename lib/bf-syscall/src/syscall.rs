// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use slog::{debug, error, Logger};

use bf_types::consts::{
    is_page_aligned, is_spec1_supported, size_to_pages, BF_INVALID_HANDLE,
    BF_SPEC_ID1_VAL, HYPERVISOR_MAX_PPS, HYPERVISOR_MAX_VMS, HYPERVISOR_MAX_VPS,
    HYPERVISOR_MAX_VSS,
};
use bf_types::syscall::{
    CallbackOp, ControlOp, HandleOp, IntrinsicOp, MemOp, SyscallOp, VmOp,
    VpOp, VsOp,
};
use bf_types::{
    BfReg, BfStatus, ExtId, PpId, TlsId, TlsReg, VmId, VpId, VsId,
    BF_INVALID_ID,
};

use crate::abi::{AbiRegs, SyscallAbi};
use crate::error::{Error, Result};
use crate::handles::{DirectMap, HugeAlloc, Page};
use crate::ops::BfSyscallOps;

/// The syscall interface of one extension, over transport `A`.
pub struct BfSyscall<A: SyscallAbi> {
    log: Logger,
    abi: A,
    handle: Option<u64>,
    /// Live direct maps by virtual address: (vm, physical address).
    direct_maps: BTreeMap<u64, (VmId, u64)>,
}

impl<A: SyscallAbi> BfSyscall<A> {
    pub fn new(log: &Logger, abi: A) -> Self {
        Self {
            log: log.new(slog::o!("component" => "bf_syscall")),
            abi,
            handle: None,
            direct_maps: BTreeMap::new(),
        }
    }

    pub fn abi(&self) -> &A {
        &self.abi
    }

    pub fn abi_mut(&mut self) -> &mut A {
        &mut self.abi
    }

    /// Number of direct maps handed out and not yet unmapped.
    pub fn live_direct_maps(&self) -> usize {
        self.direct_maps.len()
    }

    fn open_handle(&self) -> u64 {
        match self.handle {
            Some(handle) => handle,
            None => panic!("syscall issued without an open handle"),
        }
    }

    /// Trap with explicit registers, turning the returned status into a
    /// [Result].
    fn trap_regs<O: SyscallOp>(
        &mut self,
        op: O,
        name: &'static str,
        mut regs: AbiRegs,
    ) -> Result<AbiRegs> {
        let raw = self.abi.trap(op.word(), &mut regs);
        match BfStatus::from_raw(raw) {
            Some(BfStatus::Success) => Ok(regs),
            Some(status) => {
                error!(self.log, "syscall failed";
                    "op" => name,
                    "status" => %status,
                );
                Err(Error::Status { op: name, status })
            }
            None => {
                error!(self.log, "syscall returned unknown status";
                    "op" => name,
                    "status" => format!("{raw:#018x}"),
                );
                Err(Error::UnknownStatus { op: name, raw })
            }
        }
    }

    /// Trap with the open handle in `reg0` and `args` from `reg1` onward.
    fn trap<O: SyscallOp>(
        &mut self,
        op: O,
        name: &'static str,
        args: &[u64],
    ) -> Result<AbiRegs> {
        let regs = AbiRegs::with_handle(self.open_handle(), args);
        self.trap_regs(op, name, regs)
    }

    /// Check an id handed back in the low 16 bits of `reg0`.
    fn returned_id(
        &self,
        name: &'static str,
        reg0: u64,
        max: u16,
    ) -> Result<u16> {
        let raw = reg0 & 0xFFFF;
        match u16::try_from(raw) {
            Ok(id) if id != BF_INVALID_ID && id < max => Ok(id),
            _ => {
                error!(self.log, "syscall returned a bad id";
                    "op" => name,
                    "reg0" => format!("{reg0:#018x}"),
                );
                Err(Error::BadId { op: name, raw })
            }
        }
    }
}

fn expect_vmid(vmid: VmId) {
    assert!(vmid.is_valid() && vmid.get() < HYPERVISOR_MAX_VMS, "bad {vmid}");
}

fn expect_vpid(vpid: VpId) {
    assert!(vpid.is_valid() && vpid.get() < HYPERVISOR_MAX_VPS, "bad {vpid}");
}

fn expect_vsid(vsid: VsId) {
    assert!(vsid.is_valid() && vsid.get() < HYPERVISOR_MAX_VSS, "bad {vsid}");
}

fn expect_ppid(ppid: PpId) {
    assert!(ppid.is_valid() && ppid.get() < HYPERVISOR_MAX_PPS, "bad {ppid}");
}

fn ids(vmid: VmId, vpid: VpId, vsid: VsId) -> [u64; 3] {
    expect_vmid(vmid);
    expect_vpid(vpid);
    expect_vsid(vsid);
    [vmid.into(), vpid.into(), vsid.into()]
}

impl<A: SyscallAbi> BfSyscallOps for BfSyscall<A> {
    fn initialize(
        &mut self,
        version: u32,
        bootstrap_ip: u64,
        vmexit_ip: u64,
        fail_ip: u64,
    ) -> Result<()> {
        assert!(bootstrap_ip != 0 && vmexit_ip != 0 && fail_ip != 0);
        assert!(self.handle.is_none(), "already initialized");

        if !is_spec1_supported(version) {
            error!(self.log, "unsupported microkernel";
                "version" => format!("{version:#010x}"),
            );
            return Err(Error::UnsupportedVersion(version));
        }

        let regs = AbiRegs {
            reg0: u64::from(BF_SPEC_ID1_VAL),
            ..Default::default()
        };
        let regs = self.trap_regs(HandleOp::OpenHandle, "open_handle", regs)?;
        self.handle = Some(regs.reg0);

        let registrations = [
            (CallbackOp::RegisterBootstrap, "register_bootstrap", bootstrap_ip),
            (CallbackOp::RegisterVmexit, "register_vmexit", vmexit_ip),
            (CallbackOp::RegisterFail, "register_fail", fail_ip),
        ];
        for (op, name, ip) in registrations {
            if let Err(e) = self.trap(op, name, &[ip]) {
                self.release();
                return Err(e);
            }
        }

        debug!(self.log, "initialized"; "handle" => regs.reg0);
        Ok(())
    }

    fn release(&mut self) {
        if self.handle.is_some() {
            // The handle is forgotten whatever the microkernel says.
            let _ = self.trap(HandleOp::CloseHandle, "close_handle", &[]);
        }
        self.handle = None;
        self.direct_maps.clear();
    }

    fn handle(&self) -> u64 {
        self.handle.unwrap_or(BF_INVALID_HANDLE)
    }

    fn tls_reg(&self, reg: TlsReg) -> u64 {
        self.abi.tls_reg(reg)
    }

    fn set_tls_reg(&mut self, reg: TlsReg, val: u64) {
        self.abi.set_tls_reg(reg, val)
    }

    fn bf_tls_extid(&self) -> ExtId {
        ExtId::new(self.abi.tls_id(TlsId::ActiveExtId))
    }

    fn bf_tls_vmid(&self) -> VmId {
        VmId::new(self.abi.tls_id(TlsId::ActiveVmId))
    }

    fn bf_tls_vpid(&self) -> VpId {
        VpId::new(self.abi.tls_id(TlsId::ActiveVpId))
    }

    fn bf_tls_vsid(&self) -> VsId {
        VsId::new(self.abi.tls_id(TlsId::ActiveVsId))
    }

    fn bf_tls_ppid(&self) -> PpId {
        PpId::new(self.abi.tls_id(TlsId::ActivePpId))
    }

    fn bf_tls_online_pps(&self) -> u16 {
        self.abi.tls_id(TlsId::OnlinePps)
    }

    fn bf_vm_op_create_vm(&mut self) -> Result<VmId> {
        let name = "bf_vm_op_create_vm";
        let regs = self.trap(VmOp::CreateVm, name, &[])?;
        self.returned_id(name, regs.reg0, HYPERVISOR_MAX_VMS).map(VmId::new)
    }

    fn bf_vm_op_destroy_vm(&mut self, vmid: VmId) -> Result<()> {
        expect_vmid(vmid);
        self.trap(VmOp::DestroyVm, "bf_vm_op_destroy_vm", &[vmid.into()])?;
        Ok(())
    }

    fn bf_vm_op_map_direct<T>(
        &mut self,
        vmid: VmId,
        phys: u64,
    ) -> Result<DirectMap<T>> {
        expect_vmid(vmid);
        assert!(phys != 0 && is_page_aligned(phys), "bad phys {phys:#x}");

        let regs = self.trap(
            VmOp::MapDirect,
            "bf_vm_op_map_direct",
            &[vmid.into(), phys],
        )?;
        let virt = regs.reg0;
        self.direct_maps.insert(virt, (vmid, phys));
        Ok(DirectMap::new(vmid, virt, phys))
    }

    fn bf_vm_op_unmap_direct<T>(&mut self, map: DirectMap<T>) -> Result<()> {
        let (vmid, virt) = (map.vmid(), map.virt());
        match self.direct_maps.get(&virt) {
            Some(&(owner, phys)) if owner == vmid && phys == map.phys() => {}
            _ => {
                error!(self.log, "unmap of an unknown direct map";
                    "vmid" => vmid.get(),
                    "virt" => format!("{virt:#018x}"),
                );
                return Err(Error::UnknownMapping { vmid, virt });
            }
        }

        self.trap(
            VmOp::UnmapDirect,
            "bf_vm_op_unmap_direct",
            &[vmid.into(), virt],
        )?;
        self.direct_maps.remove(&virt);
        Ok(())
    }

    fn bf_vm_op_tlb_flush(&mut self, vmid: VmId) -> Result<()> {
        expect_vmid(vmid);
        self.trap(VmOp::TlbFlush, "bf_vm_op_tlb_flush", &[vmid.into()])?;
        Ok(())
    }

    fn bf_vp_op_create_vp(&mut self, vmid: VmId) -> Result<VpId> {
        expect_vmid(vmid);
        let name = "bf_vp_op_create_vp";
        let regs = self.trap(VpOp::CreateVp, name, &[vmid.into()])?;
        self.returned_id(name, regs.reg0, HYPERVISOR_MAX_VPS).map(VpId::new)
    }

    fn bf_vp_op_destroy_vp(&mut self, vpid: VpId) -> Result<()> {
        expect_vpid(vpid);
        self.trap(VpOp::DestroyVp, "bf_vp_op_destroy_vp", &[vpid.into()])?;
        Ok(())
    }

    fn bf_vs_op_create_vs(&mut self, vpid: VpId, ppid: PpId) -> Result<VsId> {
        expect_vpid(vpid);
        expect_ppid(ppid);
        let name = "bf_vs_op_create_vs";
        let regs =
            self.trap(VsOp::CreateVs, name, &[vpid.into(), ppid.into()])?;
        self.returned_id(name, regs.reg0, HYPERVISOR_MAX_VSS).map(VsId::new)
    }

    fn bf_vs_op_destroy_vs(&mut self, vsid: VsId) -> Result<()> {
        expect_vsid(vsid);
        self.trap(VsOp::DestroyVs, "bf_vs_op_destroy_vs", &[vsid.into()])?;
        Ok(())
    }

    fn bf_vs_op_init_as_root(&mut self, vsid: VsId) -> Result<()> {
        expect_vsid(vsid);
        self.trap(VsOp::InitAsRoot, "bf_vs_op_init_as_root", &[vsid.into()])?;
        Ok(())
    }

    fn bf_vs_op_read(&mut self, vsid: VsId, reg: BfReg) -> Result<u64> {
        expect_vsid(vsid);
        assert!(reg != BfReg::Unsupported);
        let regs =
            self.trap(VsOp::Read, "bf_vs_op_read", &[vsid.into(), reg.raw()])?;
        Ok(regs.reg0)
    }

    fn bf_vs_op_write(
        &mut self,
        vsid: VsId,
        reg: BfReg,
        val: u64,
    ) -> Result<()> {
        expect_vsid(vsid);
        assert!(reg != BfReg::Unsupported);
        self.trap(
            VsOp::Write,
            "bf_vs_op_write",
            &[vsid.into(), reg.raw(), val],
        )?;
        Ok(())
    }

    fn bf_vs_op_run(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()> {
        self.trap(VsOp::Run, "bf_vs_op_run", &ids(vmid, vpid, vsid))?;
        Ok(())
    }

    fn bf_vs_op_run_current(&mut self) -> Result<()> {
        self.trap(VsOp::RunCurrent, "bf_vs_op_run_current", &[])?;
        Ok(())
    }

    fn bf_vs_op_advance_ip_and_run(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()> {
        self.trap(
            VsOp::AdvanceIpAndRun,
            "bf_vs_op_advance_ip_and_run",
            &ids(vmid, vpid, vsid),
        )?;
        Ok(())
    }

    fn bf_vs_op_advance_ip_and_run_current(&mut self) -> Result<()> {
        self.trap(
            VsOp::AdvanceIpAndRunCurrent,
            "bf_vs_op_advance_ip_and_run_current",
            &[],
        )?;
        Ok(())
    }

    fn bf_vs_op_promote(&mut self, vsid: VsId) -> Result<()> {
        expect_vsid(vsid);
        self.trap(VsOp::Promote, "bf_vs_op_promote", &[vsid.into()])?;
        Ok(())
    }

    fn bf_vs_op_clear(&mut self, vsid: VsId) -> Result<()> {
        expect_vsid(vsid);
        self.trap(VsOp::Clear, "bf_vs_op_clear", &[vsid.into()])?;
        Ok(())
    }

    fn bf_vs_op_migrate(&mut self, vsid: VsId, ppid: PpId) -> Result<()> {
        expect_vsid(vsid);
        expect_ppid(ppid);
        self.trap(
            VsOp::Migrate,
            "bf_vs_op_migrate",
            &[vsid.into(), ppid.into()],
        )?;
        Ok(())
    }

    fn bf_vs_op_set_active(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()> {
        self.trap(
            VsOp::SetActive,
            "bf_vs_op_set_active",
            &ids(vmid, vpid, vsid),
        )?;
        Ok(())
    }

    fn bf_vs_op_advance_ip_and_set_active(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()> {
        self.trap(
            VsOp::AdvanceIpAndSetActive,
            "bf_vs_op_advance_ip_and_set_active",
            &ids(vmid, vpid, vsid),
        )?;
        Ok(())
    }

    fn bf_vs_op_tlb_flush(&mut self, vsid: VsId, gla: u64) -> Result<()> {
        expect_vsid(vsid);
        self.trap(VsOp::TlbFlush, "bf_vs_op_tlb_flush", &[vsid.into(), gla])?;
        Ok(())
    }

    fn bf_intrinsic_op_rdmsr(&mut self, msr: u32) -> Result<u64> {
        let regs = self.trap(
            IntrinsicOp::Rdmsr,
            "bf_intrinsic_op_rdmsr",
            &[msr.into()],
        )?;
        Ok(regs.reg0)
    }

    fn bf_intrinsic_op_wrmsr(&mut self, msr: u32, val: u64) -> Result<()> {
        self.trap(
            IntrinsicOp::Wrmsr,
            "bf_intrinsic_op_wrmsr",
            &[msr.into(), val],
        )?;
        Ok(())
    }

    fn bf_mem_op_alloc_page<T>(&mut self) -> Result<Page<T>> {
        let regs = self.trap(MemOp::AllocPage, "bf_mem_op_alloc_page", &[])?;
        Ok(Page::new(regs.reg0, regs.reg1))
    }

    fn bf_mem_op_alloc_huge(&mut self, size: u64) -> Result<HugeAlloc> {
        let Some((bytes, _)) = size_to_pages(size) else {
            panic!("bad huge allocation size {size:#x}");
        };
        let regs =
            self.trap(MemOp::AllocHuge, "bf_mem_op_alloc_huge", &[size])?;
        Ok(HugeAlloc { virt: regs.reg0, phys: regs.reg1, size: bytes })
    }

    fn bf_control_op_exit(&mut self) {
        let _ = self.trap(ControlOp::Exit, "bf_control_op_exit", &[]);
    }

    fn bf_control_op_wait(&mut self) {
        let _ = self.trap(ControlOp::Wait, "bf_control_op_wait", &[]);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::abi::MockSyscallAbi;
    use bf_types::consts::BF_ALL_SPECS_SUPPORTED_VAL;
    use mockall::predicate::*;
    use slog::Drain;

    const HANDLE: u64 = 0x42;

    fn logger() -> Logger {
        let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, slog::o!())
    }

    /// A wrapper whose handle is already open, over `abi`.
    fn opened(abi: MockSyscallAbi) -> BfSyscall<MockSyscallAbi> {
        let mut sys = BfSyscall::new(&logger(), abi);
        sys.handle = Some(HANDLE);
        sys
    }

    #[test]
    fn initialize_opens_and_registers() {
        let mut abi = MockSyscallAbi::new();
        let mut seq = mockall::Sequence::new();
        abi.expect_trap()
            .withf(|word, _| *word == HandleOp::OpenHandle.word())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, regs| {
                assert_eq!(regs.reg0, u64::from(BF_SPEC_ID1_VAL));
                regs.reg0 = HANDLE;
                BfStatus::Success.raw()
            });
        for (op, ip) in [
            (CallbackOp::RegisterBootstrap, 0x1000),
            (CallbackOp::RegisterVmexit, 0x2000),
            (CallbackOp::RegisterFail, 0x3000),
        ] {
            abi.expect_trap()
                .withf(move |word, _| *word == op.word())
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, regs| {
                    assert_eq!(regs.reg0, HANDLE);
                    assert_eq!(regs.reg1, ip);
                    BfStatus::Success.raw()
                });
        }

        let mut sys = BfSyscall::new(&logger(), abi);
        assert_eq!(sys.handle(), BF_INVALID_HANDLE);
        sys.initialize(BF_ALL_SPECS_SUPPORTED_VAL, 0x1000, 0x2000, 0x3000)
            .unwrap();
        assert_eq!(sys.handle(), HANDLE);
    }

    #[test]
    fn initialize_refuses_old_microkernels() {
        let mut abi = MockSyscallAbi::new();
        abi.expect_trap().never();
        let mut sys = BfSyscall::new(&logger(), abi);
        assert_eq!(
            sys.initialize(0x1, 1, 2, 3),
            Err(Error::UnsupportedVersion(0x1))
        );
        assert_eq!(sys.handle(), BF_INVALID_HANDLE);
    }

    #[test]
    fn failed_registration_closes_handle() {
        let mut abi = MockSyscallAbi::new();
        abi.expect_trap()
            .withf(|word, _| *word != HandleOp::CloseHandle.word())
            .returning(|word, regs| {
                if word == HandleOp::OpenHandle.word() {
                    regs.reg0 = HANDLE;
                }
                if word == CallbackOp::RegisterVmexit.word() {
                    return BfStatus::FailureUnknown.raw();
                }
                BfStatus::Success.raw()
            });
        abi.expect_trap()
            .withf(|word, _| *word == HandleOp::CloseHandle.word())
            .times(1)
            .returning(|_, _| BfStatus::Success.raw());

        let mut sys = BfSyscall::new(&logger(), abi);
        let err = sys
            .initialize(BF_ALL_SPECS_SUPPORTED_VAL, 1, 2, 3)
            .unwrap_err();
        assert_eq!(err.status(), Some(BfStatus::FailureUnknown));
        assert_eq!(sys.handle(), BF_INVALID_HANDLE);
    }

    #[test]
    fn returned_ids_are_checked() {
        const TEST_CASES: &[(u64, Option<u16>)] = &[
            (3, Some(3)),
            (0xABCD_0000_0000_0005, Some(5)),
            (0xFFFF, None),
            (16, None),
        ];
        for (reg0, expected) in TEST_CASES {
            let reg0 = *reg0;
            let mut abi = MockSyscallAbi::new();
            abi.expect_trap()
                .withf(|word, _| *word == VmOp::CreateVm.word())
                .returning(move |_, regs| {
                    regs.reg0 = reg0;
                    BfStatus::Success.raw()
                });
            let mut sys = opened(abi);
            let res = sys.bf_vm_op_create_vm();
            match expected {
                Some(id) => assert_eq!(res, Ok(VmId::new(*id))),
                None => assert!(
                    matches!(res, Err(Error::BadId { .. })),
                    "{reg0:#x} gave {res:?}"
                ),
            }
        }
    }

    #[test]
    fn statuses_are_decoded() {
        let mut abi = MockSyscallAbi::new();
        abi.expect_trap()
            .withf(|word, _| *word == VpOp::DestroyVp.word())
            .returning(|_, _| BfStatus::InvalidInputReg1.raw());
        abi.expect_trap()
            .withf(|word, _| *word == VsOp::Clear.word())
            .returning(|_, _| 0x1234);
        let mut sys = opened(abi);

        let err = sys.bf_vp_op_destroy_vp(VpId::new(1)).unwrap_err();
        assert_eq!(err.status(), Some(BfStatus::InvalidInputReg1));
        assert_eq!(
            sys.bf_vs_op_clear(VsId::new(1)),
            Err(Error::UnknownStatus { op: "bf_vs_op_clear", raw: 0x1234 })
        );
    }

    #[test]
    fn arguments_are_placed_in_order() {
        let mut abi = MockSyscallAbi::new();
        abi.expect_trap()
            .withf(|word, _| *word == VsOp::Run.word())
            .times(1)
            .returning(|_, regs| {
                assert_eq!(
                    *regs,
                    AbiRegs {
                        reg0: HANDLE,
                        reg1: 1,
                        reg2: 2,
                        reg3: 3,
                        ..Default::default()
                    }
                );
                BfStatus::Success.raw()
            });
        abi.expect_trap()
            .withf(|word, _| *word == VsOp::Read.word())
            .times(1)
            .returning(|_, regs| {
                assert_eq!(regs.reg2, BfReg::GuestRip.raw());
                regs.reg0 = 0xFFF0;
                BfStatus::Success.raw()
            });
        let mut sys = opened(abi);
        sys.bf_vs_op_run(VmId::new(1), VpId::new(2), VsId::new(3)).unwrap();
        let rip = sys.bf_vs_op_read(VsId::new(0), BfReg::GuestRip);
        assert_eq!(rip, Ok(0xFFF0));
    }

    #[test]
    fn direct_maps_are_tracked() {
        let mut abi = MockSyscallAbi::new();
        abi.expect_trap()
            .withf(|word, _| *word == VmOp::MapDirect.word())
            .returning(|_, regs| {
                regs.reg0 = 0x6000_0000_5000;
                BfStatus::Success.raw()
            });
        abi.expect_trap()
            .withf(|word, _| *word == VmOp::UnmapDirect.word())
            .times(1)
            .returning(|_, regs| {
                assert_eq!(regs.reg2, 0x6000_0000_5000);
                BfStatus::Success.raw()
            });
        let mut sys = opened(abi);

        let map = sys.bf_vm_op_map_direct::<u64>(VmId::new(1), 0x5000).unwrap();
        assert_eq!(map.virt(), 0x6000_0000_5000);
        assert_eq!(sys.live_direct_maps(), 1);

        let forged = DirectMap::<u64>::new(VmId::new(2), map.virt(), 0x5000);
        assert_eq!(
            sys.bf_vm_op_unmap_direct(forged),
            Err(Error::UnknownMapping {
                vmid: VmId::new(2),
                virt: 0x6000_0000_5000
            })
        );

        sys.bf_vm_op_unmap_direct(map).unwrap();
        assert_eq!(sys.live_direct_maps(), 0);
    }

    #[test]
    fn release_forgets_handle() {
        let mut abi = MockSyscallAbi::new();
        abi.expect_trap()
            .withf(|word, _| *word == HandleOp::CloseHandle.word())
            .times(1)
            .returning(|_, _| BfStatus::FailureUnknown.raw());
        let mut sys = opened(abi);
        sys.release();
        assert_eq!(sys.handle(), BF_INVALID_HANDLE);
        // Nothing left to close.
        sys.release();
    }

    #[test]
    fn tls_reads_go_to_the_abi() {
        let mut abi = MockSyscallAbi::new();
        abi.expect_tls_id().with(eq(TlsId::OnlinePps)).return_const(4u16);
        abi.expect_tls_id().with(eq(TlsId::ActiveVmId)).return_const(0u16);
        abi.expect_tls_reg().with(eq(TlsReg::Rax)).return_const(0xAAu64);
        let sys = opened(abi);

        assert_eq!(sys.bf_tls_online_pps(), 4);
        assert!(sys.is_the_active_vm_the_root_vm());
        assert!(sys.is_vp_a_root_vp(VpId::new(3)));
        assert!(!sys.is_vs_a_root_vs(VsId::new(4)));
        assert_eq!(sys.tls_reg(TlsReg::Rax), 0xAA);
    }

    #[test]
    #[should_panic]
    fn invalid_ids_are_a_bug() {
        let mut sys = opened(MockSyscallAbi::new());
        let _ = sys.bf_vs_op_promote(VsId::INVALID);
    }

    #[test]
    #[should_panic]
    fn syscalls_need_a_handle() {
        let mut sys = BfSyscall::new(&logger(), MockSyscallAbi::new());
        let _ = sys.bf_vm_op_create_vm();
    }
}
