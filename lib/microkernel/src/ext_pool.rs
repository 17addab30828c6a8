// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{error, Logger};

use bf_types::consts::HYPERVISOR_MAX_EXTENSIONS;
use bf_types::{ExtId, VmId};

use crate::error::Result;
use crate::ext::Ext;
use crate::intrinsic::Intrinsic;
use crate::page_pool::PagePool;
use crate::tls::Tls;

/// Owner of every [Ext]. VM lifecycle events are fanned out to all of them.
pub struct ExtPool {
    log: Logger,
    exts: Vec<Ext>,
}

impl ExtPool {
    pub fn new(log: &Logger) -> Self {
        let log = log.new(slog::o!("component" => "ext_pool"));
        let exts = (0..HYPERVISOR_MAX_EXTENSIONS)
            .map(|i| Ext::new(&log, ExtId::new(i)))
            .collect();
        Self { log, exts }
    }

    pub fn get(&self, extid: ExtId) -> Option<&Ext> {
        self.exts.get(extid.index())
    }

    pub fn get_mut(&mut self, extid: ExtId) -> Option<&mut Ext> {
        self.exts.get_mut(extid.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ext> {
        self.exts.iter()
    }

    /// Tell every extension about a new VM. If one of them fails, the ones
    /// already told are told again that the VM is gone.
    pub fn signal_vm_created(
        &mut self,
        page_pool: &mut PagePool,
        vmid: VmId,
    ) -> Result<()> {
        for i in 0..self.exts.len() {
            if let Err(e) = self.exts[i].signal_vm_created(page_pool, vmid) {
                error!(self.log, "vm creation refused";
                    "extid" => i,
                    "vmid" => vmid.get(),
                    "error" => %e,
                );
                for ext in self.exts[..i].iter_mut() {
                    let _ = ext.signal_vm_destroyed(page_pool, vmid);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn signal_vm_destroyed(
        &mut self,
        page_pool: &mut PagePool,
        vmid: VmId,
    ) -> Result<()> {
        let mut res = Ok(());
        for ext in self.exts.iter_mut() {
            if let Err(e) = ext.signal_vm_destroyed(page_pool, vmid) {
                error!(self.log, "vm destruction failed";
                    "extid" => ext.id().get(),
                    "vmid" => vmid.get(),
                    "error" => %e,
                );
                res = res.and(Err(e));
            }
        }
        res
    }

    /// Called once `vmid` has become the active VM of the calling PP.
    pub fn signal_vm_active(
        &self,
        tls: &mut Tls,
        intrinsic: &mut dyn Intrinsic,
        vmid: VmId,
    ) -> Result<()> {
        self.exts
            .iter()
            .try_for_each(|ext| ext.signal_vm_active(tls, intrinsic, vmid))
    }

    pub fn release(&mut self, page_pool: &mut PagePool) -> Result<()> {
        let mut res = Ok(());
        for ext in self.exts.iter_mut() {
            res = res.and(ext.release(page_pool));
        }
        res
    }
}
