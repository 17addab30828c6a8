// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Owned handles for memory the microkernel hands to an extension.

use std::marker::PhantomData;

use bf_types::VmId;

/// A guest physical page of `vmid`, mapped into the extension's direct map
/// and viewed as a `T`.
///
/// Only [crate::BfSyscallOps::bf_vm_op_unmap_direct] gets rid of one.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a direct map stays mapped until it is passed to unmap"]
pub struct DirectMap<T> {
    vmid: VmId,
    virt: u64,
    phys: u64,
    _ty: PhantomData<fn() -> T>,
}

impl<T> DirectMap<T> {
    pub(crate) fn new(vmid: VmId, virt: u64, phys: u64) -> Self {
        Self { vmid, virt, phys, _ty: PhantomData }
    }

    pub fn vmid(&self) -> VmId {
        self.vmid
    }

    pub fn virt(&self) -> u64 {
        self.virt
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Where the extension can reach the page.
    pub fn as_ptr(&self) -> *mut T {
        self.virt as *mut T
    }
}

/// A page from the microkernel's page pool, viewed as a `T`.
#[derive(Debug, PartialEq, Eq)]
pub struct Page<T> {
    virt: u64,
    phys: u64,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Page<T> {
    pub(crate) fn new(virt: u64, phys: u64) -> Self {
        Self { virt, phys, _ty: PhantomData }
    }

    pub fn virt(&self) -> u64 {
        self.virt
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn as_ptr(&self) -> *mut T {
        self.virt as *mut T
    }
}

/// Physically contiguous memory from the huge pool. `size` is rounded up
/// to whole pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HugeAlloc {
    pub virt: u64,
    pub phys: u64,
    pub size: u64,
}
