// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A programmable stand-in for [crate::BfSyscall], for testing extensions
//! without a microkernel.
//!
//! Every syscall that only reports a status succeeds unless a failure was
//! programmed for its exact arguments. Syscalls that create something fail
//! until told what to hand back. Reads return what was last written or
//! programmed, and zero otherwise.

use std::collections::{BTreeMap, HashMap};

use bf_types::consts::{
    is_page_aligned, size_to_pages, BF_INVALID_HANDLE,
    HYPERVISOR_EXT_DIRECT_MAP_ADDR,
    HYPERVISOR_EXT_PAGE_POOL_ADDR, HYPERVISOR_PAGE_SIZE,
};
use bf_types::{BfReg, BfStatus, ExtId, PpId, TlsReg, VmId, VpId, VsId};

use crate::error::{Error, Result};
use crate::handles::{DirectMap, HugeAlloc, Page};
use crate::ops::BfSyscallOps;

/// Handle returned by a successful [MockBfSyscall::initialize].
pub const MOCK_HANDLE: u64 = 0x42;

/// Physical address of the first page handed out by the mock page pool.
const MOCK_PAGE_PHYS: u64 = 0x1000_0000;

/// Physical address of the first huge allocation.
const MOCK_HUGE_PHYS: u64 = 0x8000_0000;

#[derive(Debug)]
pub struct MockBfSyscall {
    handle: Option<u64>,
    initialize_status: BfStatus,

    extid: ExtId,
    vmid: VmId,
    vpid: VpId,
    vsid: VsId,
    ppid: PpId,
    online_pps: u16,
    tls_regs: HashMap<TlsReg, u64>,

    create_vm: Option<VmId>,
    create_vp: HashMap<VmId, VpId>,
    create_vs: HashMap<(VpId, PpId), VsId>,
    statuses: HashMap<(&'static str, Vec<u64>), BfStatus>,
    vs_regs: HashMap<(VsId, BfReg), u64>,
    msrs: HashMap<u32, u64>,

    direct_maps: BTreeMap<u64, VmId>,
    next_page: u64,
    next_huge: u64,
    calls: HashMap<&'static str, usize>,
}

impl Default for MockBfSyscall {
    fn default() -> Self {
        Self {
            handle: None,
            initialize_status: BfStatus::Success,
            extid: ExtId::new(0),
            vmid: VmId::ROOT,
            vpid: VpId::new(0),
            vsid: VsId::new(0),
            ppid: PpId::BS,
            online_pps: 1,
            tls_regs: HashMap::new(),
            create_vm: None,
            create_vp: HashMap::new(),
            create_vs: HashMap::new(),
            statuses: HashMap::new(),
            vs_regs: HashMap::new(),
            msrs: HashMap::new(),
            direct_maps: BTreeMap::new(),
            next_page: 0,
            next_huge: 0,
            calls: HashMap::new(),
        }
    }
}

impl MockBfSyscall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times syscall `name` was issued, e.g.
    /// `"bf_vs_op_run_current"`.
    pub fn calls(&self, name: &str) -> usize {
        self.calls.get(name).copied().unwrap_or(0)
    }

    pub fn live_direct_maps(&self) -> usize {
        self.direct_maps.len()
    }

    /// Status [BfSyscallOps::initialize] fails with. Success by default.
    pub fn set_initialize(&mut self, status: BfStatus) {
        self.initialize_status = status;
    }

    pub fn set_bf_tls_extid(&mut self, id: ExtId) {
        self.extid = id;
    }

    pub fn set_bf_tls_vmid(&mut self, id: VmId) {
        self.vmid = id;
    }

    pub fn set_bf_tls_vpid(&mut self, id: VpId) {
        self.vpid = id;
    }

    pub fn set_bf_tls_vsid(&mut self, id: VsId) {
        self.vsid = id;
    }

    pub fn set_bf_tls_ppid(&mut self, id: PpId) {
        self.ppid = id;
    }

    pub fn set_bf_tls_online_pps(&mut self, online_pps: u16) {
        self.online_pps = online_pps;
    }

    /// The id the next [BfSyscallOps::bf_vm_op_create_vm] returns.
    pub fn set_bf_vm_op_create_vm(&mut self, vmid: VmId) {
        self.create_vm = Some(vmid);
    }

    pub fn set_bf_vp_op_create_vp(&mut self, vmid: VmId, vpid: VpId) {
        self.create_vp.insert(vmid, vpid);
    }

    pub fn set_bf_vs_op_create_vs(
        &mut self,
        vpid: VpId,
        ppid: PpId,
        vsid: VsId,
    ) {
        self.create_vs.insert((vpid, ppid), vsid);
    }

    pub fn set_bf_vs_op_read(&mut self, vsid: VsId, reg: BfReg, val: u64) {
        self.vs_regs.insert((vsid, reg), val);
    }

    pub fn set_bf_intrinsic_op_rdmsr(&mut self, msr: u32, val: u64) {
        self.msrs.insert(msr, val);
    }

    /// Make syscall `name` report `status` when issued with exactly `args`
    /// (ids and values in argument order, without the handle).
    pub fn set_status(
        &mut self,
        name: &'static str,
        args: &[u64],
        status: BfStatus,
    ) {
        self.statuses.insert((name, args.to_vec()), status);
    }

    pub fn set_bf_vm_op_destroy_vm(&mut self, vmid: VmId, status: BfStatus) {
        self.set_status("bf_vm_op_destroy_vm", &[vmid.into()], status);
    }

    pub fn set_bf_vp_op_destroy_vp(&mut self, vpid: VpId, status: BfStatus) {
        self.set_status("bf_vp_op_destroy_vp", &[vpid.into()], status);
    }

    pub fn set_bf_vs_op_destroy_vs(&mut self, vsid: VsId, status: BfStatus) {
        self.set_status("bf_vs_op_destroy_vs", &[vsid.into()], status);
    }

    pub fn set_bf_vs_op_init_as_root(
        &mut self,
        vsid: VsId,
        status: BfStatus,
    ) {
        self.set_status("bf_vs_op_init_as_root", &[vsid.into()], status);
    }

    pub fn set_bf_vs_op_run(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
        status: BfStatus,
    ) {
        let args = [vmid.into(), vpid.into(), vsid.into()];
        self.set_status("bf_vs_op_run", &args, status);
    }

    pub fn set_bf_vs_op_run_current(&mut self, status: BfStatus) {
        self.set_status("bf_vs_op_run_current", &[], status);
    }

    pub fn set_bf_vs_op_advance_ip_and_run_current(
        &mut self,
        status: BfStatus,
    ) {
        self.set_status("bf_vs_op_advance_ip_and_run_current", &[], status);
    }

    pub fn set_bf_vs_op_promote(&mut self, vsid: VsId, status: BfStatus) {
        self.set_status("bf_vs_op_promote", &[vsid.into()], status);
    }

    pub fn set_bf_vs_op_migrate(
        &mut self,
        vsid: VsId,
        ppid: PpId,
        status: BfStatus,
    ) {
        let args = [vsid.into(), ppid.into()];
        self.set_status("bf_vs_op_migrate", &args, status);
    }

    pub fn set_bf_mem_op_alloc_page(&mut self, status: BfStatus) {
        self.set_status("bf_mem_op_alloc_page", &[], status);
    }

    /// Count the call and report the programmed outcome.
    fn syscall(&mut self, name: &'static str, args: &[u64]) -> Result<()> {
        *self.calls.entry(name).or_default() += 1;
        match self.statuses.get(&(name, args.to_vec())) {
            None | Some(BfStatus::Success) => Ok(()),
            Some(status) => Err(Error::Status { op: name, status: *status }),
        }
    }

    /// Creation syscalls fail until programmed.
    fn created<T>(name: &'static str, id: Option<T>) -> Result<T> {
        id.ok_or(Error::Status { op: name, status: BfStatus::FailureUnknown })
    }
}

impl BfSyscallOps for MockBfSyscall {
    fn initialize(
        &mut self,
        _version: u32,
        bootstrap_ip: u64,
        vmexit_ip: u64,
        fail_ip: u64,
    ) -> Result<()> {
        assert!(bootstrap_ip != 0 && vmexit_ip != 0 && fail_ip != 0);
        *self.calls.entry("initialize").or_default() += 1;
        if !self.initialize_status.is_success() {
            return Err(Error::Status {
                op: "initialize",
                status: self.initialize_status,
            });
        }
        self.handle = Some(MOCK_HANDLE);
        Ok(())
    }

    fn release(&mut self) {
        self.handle = None;
        self.direct_maps.clear();
    }

    fn handle(&self) -> u64 {
        self.handle.unwrap_or(BF_INVALID_HANDLE)
    }

    fn tls_reg(&self, reg: TlsReg) -> u64 {
        self.tls_regs.get(&reg).copied().unwrap_or(0)
    }

    fn set_tls_reg(&mut self, reg: TlsReg, val: u64) {
        self.tls_regs.insert(reg, val);
    }

    fn bf_tls_extid(&self) -> ExtId {
        self.extid
    }

    fn bf_tls_vmid(&self) -> VmId {
        self.vmid
    }

    fn bf_tls_vpid(&self) -> VpId {
        self.vpid
    }

    fn bf_tls_vsid(&self) -> VsId {
        self.vsid
    }

    fn bf_tls_ppid(&self) -> PpId {
        self.ppid
    }

    fn bf_tls_online_pps(&self) -> u16 {
        self.online_pps
    }

    fn bf_vm_op_create_vm(&mut self) -> Result<VmId> {
        let name = "bf_vm_op_create_vm";
        self.syscall(name, &[])?;
        Self::created(name, self.create_vm)
    }

    fn bf_vm_op_destroy_vm(&mut self, vmid: VmId) -> Result<()> {
        self.syscall("bf_vm_op_destroy_vm", &[vmid.into()])
    }

    fn bf_vm_op_map_direct<T>(
        &mut self,
        vmid: VmId,
        phys: u64,
    ) -> Result<DirectMap<T>> {
        assert!(phys != 0 && is_page_aligned(phys), "bad phys {phys:#x}");
        self.syscall("bf_vm_op_map_direct", &[vmid.into(), phys])?;
        let virt = HYPERVISOR_EXT_DIRECT_MAP_ADDR + phys;
        self.direct_maps.insert(virt, vmid);
        Ok(DirectMap::new(vmid, virt, phys))
    }

    fn bf_vm_op_unmap_direct<T>(&mut self, map: DirectMap<T>) -> Result<()> {
        let (vmid, virt) = (map.vmid(), map.virt());
        if self.direct_maps.get(&virt) != Some(&vmid) {
            return Err(Error::UnknownMapping { vmid, virt });
        }
        self.syscall("bf_vm_op_unmap_direct", &[vmid.into(), virt])?;
        self.direct_maps.remove(&virt);
        Ok(())
    }

    fn bf_vm_op_tlb_flush(&mut self, vmid: VmId) -> Result<()> {
        self.syscall("bf_vm_op_tlb_flush", &[vmid.into()])
    }

    fn bf_vp_op_create_vp(&mut self, vmid: VmId) -> Result<VpId> {
        let name = "bf_vp_op_create_vp";
        self.syscall(name, &[vmid.into()])?;
        Self::created(name, self.create_vp.get(&vmid).copied())
    }

    fn bf_vp_op_destroy_vp(&mut self, vpid: VpId) -> Result<()> {
        self.syscall("bf_vp_op_destroy_vp", &[vpid.into()])
    }

    fn bf_vs_op_create_vs(&mut self, vpid: VpId, ppid: PpId) -> Result<VsId> {
        let name = "bf_vs_op_create_vs";
        self.syscall(name, &[vpid.into(), ppid.into()])?;
        Self::created(name, self.create_vs.get(&(vpid, ppid)).copied())
    }

    fn bf_vs_op_destroy_vs(&mut self, vsid: VsId) -> Result<()> {
        self.syscall("bf_vs_op_destroy_vs", &[vsid.into()])
    }

    fn bf_vs_op_init_as_root(&mut self, vsid: VsId) -> Result<()> {
        self.syscall("bf_vs_op_init_as_root", &[vsid.into()])
    }

    fn bf_vs_op_read(&mut self, vsid: VsId, reg: BfReg) -> Result<u64> {
        self.syscall("bf_vs_op_read", &[vsid.into(), reg.raw()])?;
        Ok(self.vs_regs.get(&(vsid, reg)).copied().unwrap_or(0))
    }

    fn bf_vs_op_write(
        &mut self,
        vsid: VsId,
        reg: BfReg,
        val: u64,
    ) -> Result<()> {
        self.syscall("bf_vs_op_write", &[vsid.into(), reg.raw(), val])?;
        self.vs_regs.insert((vsid, reg), val);
        Ok(())
    }

    fn bf_vs_op_run(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()> {
        self.syscall("bf_vs_op_run", &[vmid.into(), vpid.into(), vsid.into()])
    }

    fn bf_vs_op_run_current(&mut self) -> Result<()> {
        self.syscall("bf_vs_op_run_current", &[])
    }

    fn bf_vs_op_advance_ip_and_run(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()> {
        let args = [vmid.into(), vpid.into(), vsid.into()];
        self.syscall("bf_vs_op_advance_ip_and_run", &args)
    }

    fn bf_vs_op_advance_ip_and_run_current(&mut self) -> Result<()> {
        self.syscall("bf_vs_op_advance_ip_and_run_current", &[])
    }

    fn bf_vs_op_promote(&mut self, vsid: VsId) -> Result<()> {
        self.syscall("bf_vs_op_promote", &[vsid.into()])
    }

    fn bf_vs_op_clear(&mut self, vsid: VsId) -> Result<()> {
        self.syscall("bf_vs_op_clear", &[vsid.into()])
    }

    fn bf_vs_op_migrate(&mut self, vsid: VsId, ppid: PpId) -> Result<()> {
        self.syscall("bf_vs_op_migrate", &[vsid.into(), ppid.into()])
    }

    fn bf_vs_op_set_active(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()> {
        let args = [vmid.into(), vpid.into(), vsid.into()];
        self.syscall("bf_vs_op_set_active", &args)
    }

    fn bf_vs_op_advance_ip_and_set_active(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()> {
        let args = [vmid.into(), vpid.into(), vsid.into()];
        self.syscall("bf_vs_op_advance_ip_and_set_active", &args)
    }

    fn bf_vs_op_tlb_flush(&mut self, vsid: VsId, gla: u64) -> Result<()> {
        self.syscall("bf_vs_op_tlb_flush", &[vsid.into(), gla])
    }

    fn bf_intrinsic_op_rdmsr(&mut self, msr: u32) -> Result<u64> {
        self.syscall("bf_intrinsic_op_rdmsr", &[msr.into()])?;
        Ok(self.msrs.get(&msr).copied().unwrap_or(0))
    }

    fn bf_intrinsic_op_wrmsr(&mut self, msr: u32, val: u64) -> Result<()> {
        self.syscall("bf_intrinsic_op_wrmsr", &[msr.into(), val])?;
        self.msrs.insert(msr, val);
        Ok(())
    }

    fn bf_mem_op_alloc_page<T>(&mut self) -> Result<Page<T>> {
        self.syscall("bf_mem_op_alloc_page", &[])?;
        let offset = self.next_page * HYPERVISOR_PAGE_SIZE;
        self.next_page += 1;
        Ok(Page::new(
            HYPERVISOR_EXT_PAGE_POOL_ADDR + MOCK_PAGE_PHYS + offset,
            MOCK_PAGE_PHYS + offset,
        ))
    }

    fn bf_mem_op_alloc_huge(&mut self, size: u64) -> Result<HugeAlloc> {
        assert!(size != 0);
        self.syscall("bf_mem_op_alloc_huge", &[size])?;
        let (bytes, pages) = size_to_pages(size).ok_or(Error::Status {
            op: "bf_mem_op_alloc_huge",
            status: BfStatus::InvalidInputReg1,
        })?;
        let phys = MOCK_HUGE_PHYS + self.next_huge * HYPERVISOR_PAGE_SIZE;
        self.next_huge += pages;
        Ok(HugeAlloc {
            virt: HYPERVISOR_EXT_PAGE_POOL_ADDR + phys,
            phys,
            size: bytes,
        })
    }

    fn bf_control_op_exit(&mut self) {
        let _ = self.syscall("bf_control_op_exit", &[]);
    }

    fn bf_control_op_wait(&mut self) {
        let _ = self.syscall("bf_control_op_wait", &[]);
    }
}
