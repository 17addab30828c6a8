// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel's view of an extension.

use std::collections::BTreeMap;

use slog::{error, Logger};

use bf_types::consts::{
    size_to_pages, HYPERVISOR_EXT_DIRECT_MAP_ADDR,
    HYPERVISOR_EXT_PAGE_POOL_ADDR, HYPERVISOR_MAX_VMS,
};
use bf_types::{ExtId, VmId};

use crate::error::{Error, Result};
use crate::intrinsic::Intrinsic;
use crate::page_pool::{AllocTag, HugePool, PagePool};
use crate::tls::Tls;

/// Guest physical memory an extension has mapped for one VM.
#[derive(Debug)]
struct DirectMap {
    /// Page holding the root of this address space.
    root: u64,
    /// Mapped virtual address to physical address.
    entries: BTreeMap<u64, u64>,
}

/// An allocation made on behalf of the extension, as `(virt, phys)`.
pub type ExtAlloc = (u64, u64);

pub struct Ext {
    log: Logger,
    id: ExtId,
    handle: Option<u64>,
    bootstrap_ip: Option<u64>,
    vmexit_ip: Option<u64>,
    fail_ip: Option<u64>,
    direct_maps: Vec<Option<DirectMap>>,
    pages: Vec<u64>,
    huge: Vec<(u64, u64)>,
}

impl Ext {
    pub fn new(log: &Logger, id: ExtId) -> Self {
        Self {
            log: log.new(slog::o!("extid" => id.get())),
            id,
            handle: None,
            bootstrap_ip: None,
            vmexit_ip: None,
            fail_ip: None,
            direct_maps: (0..HYPERVISOR_MAX_VMS).map(|_| None).collect(),
            pages: Vec::new(),
            huge: Vec::new(),
        }
    }

    pub fn id(&self) -> ExtId {
        self.id
    }

    /// Open the extension's one handle. Handles are never zero.
    pub fn open_handle(&mut self) -> Result<u64> {
        if self.handle.is_some() {
            error!(self.log, "handle already opened");
            return Err(Error::HandleOpen(self.id));
        }
        let handle = u64::from(self.id.get()) + 1;
        self.handle = Some(handle);
        Ok(handle)
    }

    pub fn close_handle(&mut self) {
        self.handle = None;
    }

    pub fn is_handle_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_handle_valid(&self, handle: u64) -> bool {
        self.handle == Some(handle)
    }

    pub fn bootstrap_ip(&self) -> Option<u64> {
        self.bootstrap_ip
    }

    pub fn set_bootstrap_ip(&mut self, ip: u64) {
        self.bootstrap_ip = Some(ip);
    }

    pub fn vmexit_ip(&self) -> Option<u64> {
        self.vmexit_ip
    }

    pub fn set_vmexit_ip(&mut self, ip: u64) {
        self.vmexit_ip = Some(ip);
    }

    pub fn fail_ip(&self) -> Option<u64> {
        self.fail_ip
    }

    pub fn set_fail_ip(&mut self, ip: u64) {
        self.fail_ip = Some(ip);
    }

    /// Create the direct map for a new VM.
    pub fn signal_vm_created(
        &mut self,
        page_pool: &mut PagePool,
        vmid: VmId,
    ) -> Result<()> {
        let extid = self.id;
        let slot = self
            .direct_maps
            .get_mut(vmid.index())
            .ok_or(Error::NoDirectMap { extid, vmid })?;
        if slot.is_some() {
            return Err(Error::DirectMapExists { extid, vmid });
        }

        let root = page_pool.allocate(AllocTag::DirectMapRoot)?;
        *slot = Some(DirectMap { root, entries: BTreeMap::new() });
        Ok(())
    }

    /// Tear down the direct map of a VM that is going away.
    pub fn signal_vm_destroyed(
        &mut self,
        page_pool: &mut PagePool,
        vmid: VmId,
    ) -> Result<()> {
        let map = self
            .direct_maps
            .get_mut(vmid.index())
            .and_then(Option::take)
            .ok_or(Error::NoDirectMap { extid: self.id, vmid })?;
        page_pool.deallocate(map.root)
    }

    /// Switch the calling PP to the direct map of `vmid`, unless it is
    /// already loaded.
    pub fn signal_vm_active(
        &self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
        vmid: VmId,
    ) -> Result<()> {
        let root = self.direct_map(vmid)?.root;
        if tls.active_rpt != root {
            intrinsic.set_cr3(root)?;
            tls.active_rpt = root;
        }
        Ok(())
    }

    /// Map guest physical `phys` of `vmid`, returning where the extension
    /// can reach it.
    pub fn map_page_direct(&mut self, vmid: VmId, phys: u64) -> Result<u64> {
        let virt = HYPERVISOR_EXT_DIRECT_MAP_ADDR + phys;
        let map = self.direct_map_mut(vmid)?;
        if map.entries.contains_key(&virt) {
            return Err(Error::AlreadyMapped { vmid, virt });
        }
        map.entries.insert(virt, phys);
        Ok(virt)
    }

    /// Remove a mapping made by [Ext::map_page_direct], returning the
    /// physical address it referred to.
    pub fn unmap_page_direct(
        &mut self,
        intrinsic: &mut dyn Intrinsic,
        vmid: VmId,
        virt: u64,
    ) -> Result<u64> {
        let phys = self
            .direct_map_mut(vmid)?
            .entries
            .remove(&virt)
            .ok_or(Error::NotMapped { vmid, virt })?;
        intrinsic.invlpg(virt);
        Ok(phys)
    }

    pub fn direct_map_len(&self, vmid: VmId) -> usize {
        self.direct_map(vmid).map(|m| m.entries.len()).unwrap_or(0)
    }

    pub fn alloc_page(&mut self, page_pool: &mut PagePool) -> Result<ExtAlloc> {
        let phys = page_pool.allocate(AllocTag::ExtPage)?;
        self.pages.push(phys);
        Ok((HYPERVISOR_EXT_PAGE_POOL_ADDR + phys, phys))
    }

    pub fn alloc_huge(
        &mut self,
        huge_pool: &mut HugePool,
        size: u64,
    ) -> Result<ExtAlloc> {
        let (_, pages) = size_to_pages(size)
            .ok_or(Error::BadAddress(size, "huge pool"))?;
        let phys = huge_pool.allocate(pages)?;
        self.huge.push((phys, pages));
        Ok((HYPERVISOR_EXT_PAGE_POOL_ADDR + phys, phys))
    }

    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    /// Give back every page the extension holds. Huge memory is never
    /// returned.
    pub fn release(&mut self, page_pool: &mut PagePool) -> Result<()> {
        let mut res = Ok(());
        let roots = self.direct_maps.iter_mut().filter_map(Option::take);
        for phys in roots.map(|m| m.root).chain(self.pages.drain(..)) {
            res = res.and(page_pool.deallocate(phys));
        }
        self.huge.clear();
        self.handle = None;
        self.bootstrap_ip = None;
        self.vmexit_ip = None;
        self.fail_ip = None;
        res
    }

    fn direct_map(&self, vmid: VmId) -> Result<&DirectMap> {
        self.direct_maps
            .get(vmid.index())
            .and_then(Option::as_ref)
            .ok_or(Error::NoDirectMap { extid: self.id, vmid })
    }

    fn direct_map_mut(&mut self, vmid: VmId) -> Result<&mut DirectMap> {
        let extid = self.id;
        self.direct_maps
            .get_mut(vmid.index())
            .and_then(Option::as_mut)
            .ok_or(Error::NoDirectMap { extid, vmid })
    }
}
