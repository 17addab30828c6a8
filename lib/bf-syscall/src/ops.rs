// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bf_types::{BfReg, ExtId, PpId, TlsReg, VmId, VpId, VsId};

use crate::error::Result;
use crate::handles::{DirectMap, HugeAlloc, Page};

/// Everything an extension can ask of the microkernel.
///
/// Methods panic when handed arguments that no correct extension would
/// produce, such as the invalid id or a null callback. Failures reported by
/// the microkernel come back as [crate::Error].
pub trait BfSyscallOps {
    /// Open a handle and register the three entry points. Nothing is left
    /// open or registered on failure.
    fn initialize(
        &mut self,
        version: u32,
        bootstrap_ip: u64,
        vmexit_ip: u64,
        fail_ip: u64,
    ) -> Result<()>;

    fn release(&mut self);

    fn handle(&self) -> u64;

    fn tls_reg(&self, reg: TlsReg) -> u64;
    fn set_tls_reg(&mut self, reg: TlsReg, val: u64);

    fn bf_tls_extid(&self) -> ExtId;
    fn bf_tls_vmid(&self) -> VmId;
    fn bf_tls_vpid(&self) -> VpId;
    fn bf_tls_vsid(&self) -> VsId;
    fn bf_tls_ppid(&self) -> PpId;
    fn bf_tls_online_pps(&self) -> u16;

    fn is_the_active_vm_the_root_vm(&self) -> bool {
        self.bf_tls_vmid().is_root()
    }

    fn is_vm_the_root_vm(&self, vmid: VmId) -> bool {
        vmid.is_root()
    }

    /// Root VPs are the first ones created, one per online PP.
    fn is_vp_a_root_vp(&self, vpid: VpId) -> bool {
        vpid.get() < self.bf_tls_online_pps()
    }

    fn is_vs_a_root_vs(&self, vsid: VsId) -> bool {
        vsid.get() < self.bf_tls_online_pps()
    }

    fn bf_vm_op_create_vm(&mut self) -> Result<VmId>;
    fn bf_vm_op_destroy_vm(&mut self, vmid: VmId) -> Result<()>;
    fn bf_vm_op_map_direct<T>(
        &mut self,
        vmid: VmId,
        phys: u64,
    ) -> Result<DirectMap<T>>;
    fn bf_vm_op_unmap_direct<T>(&mut self, map: DirectMap<T>) -> Result<()>;
    fn bf_vm_op_tlb_flush(&mut self, vmid: VmId) -> Result<()>;

    fn bf_vp_op_create_vp(&mut self, vmid: VmId) -> Result<VpId>;
    fn bf_vp_op_destroy_vp(&mut self, vpid: VpId) -> Result<()>;

    fn bf_vs_op_create_vs(&mut self, vpid: VpId, ppid: PpId) -> Result<VsId>;
    fn bf_vs_op_destroy_vs(&mut self, vsid: VsId) -> Result<()>;
    fn bf_vs_op_init_as_root(&mut self, vsid: VsId) -> Result<()>;
    fn bf_vs_op_read(&mut self, vsid: VsId, reg: BfReg) -> Result<u64>;
    fn bf_vs_op_write(&mut self, vsid: VsId, reg: BfReg, val: u64)
        -> Result<()>;
    fn bf_vs_op_run(&mut self, vmid: VmId, vpid: VpId, vsid: VsId)
        -> Result<()>;
    fn bf_vs_op_run_current(&mut self) -> Result<()>;
    fn bf_vs_op_advance_ip_and_run(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()>;
    fn bf_vs_op_advance_ip_and_run_current(&mut self) -> Result<()>;
    fn bf_vs_op_promote(&mut self, vsid: VsId) -> Result<()>;
    fn bf_vs_op_clear(&mut self, vsid: VsId) -> Result<()>;
    fn bf_vs_op_migrate(&mut self, vsid: VsId, ppid: PpId) -> Result<()>;
    fn bf_vs_op_set_active(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()>;
    fn bf_vs_op_advance_ip_and_set_active(
        &mut self,
        vmid: VmId,
        vpid: VpId,
        vsid: VsId,
    ) -> Result<()>;
    fn bf_vs_op_tlb_flush(&mut self, vsid: VsId, gla: u64) -> Result<()>;

    fn bf_intrinsic_op_rdmsr(&mut self, msr: u32) -> Result<u64>;
    fn bf_intrinsic_op_wrmsr(&mut self, msr: u32, val: u64) -> Result<()>;

    fn bf_mem_op_alloc_page<T>(&mut self) -> Result<Page<T>>;
    fn bf_mem_op_alloc_huge(&mut self, size: u64) -> Result<HugeAlloc>;

    fn bf_control_op_exit(&mut self);
    fn bf_control_op_wait(&mut self);
}
