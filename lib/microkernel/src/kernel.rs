// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The microkernel instance: every pool, owned in one place.

use slog::{error, info, Logger};

use bf_types::consts::HYPERVISOR_PAGE_SIZE;
use bf_types::{ExtId, PpId, VmId};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ext_pool::ExtPool;
use crate::msr::MsrPolicy;
use crate::page_pool::{HugePool, PagePool};
use crate::tls::Tls;
use crate::vm_pool::VmPool;
use crate::vp_pool::VpPool;
use crate::vs_pool::VsPool;

/// Physical address of the first frame of the page pool. The huge pool
/// follows it directly.
pub const PAGE_POOL_PHYS: u64 = 0x0000_0000_1000_0000;

/// Shared kernel state.
///
/// Fields are public so that dispatch can borrow several pools at once.
/// Per-PP state lives in each PP's [Tls] instead.
pub struct Microkernel {
    log: Logger,
    online_pps: u16,
    pub page_pool: PagePool,
    pub huge_pool: HugePool,
    pub vm_pool: VmPool,
    pub vp_pool: VpPool,
    pub vs_pool: VsPool,
    pub ext_pool: ExtPool,
    pub msr_policy: MsrPolicy,
    ext_vmexit: ExtId,
    ext_fail: ExtId,
}

impl Microkernel {
    /// Build the pools and allocate the root VM.
    pub fn new(log: &Logger, config: &Config) -> Result<Self> {
        let log = log.new(slog::o!("component" => "microkernel"));

        let huge_phys = PAGE_POOL_PHYS
            + config.page_pool_pages as u64 * HYPERVISOR_PAGE_SIZE;
        let mut mk = Self {
            online_pps: config.online_pps,
            page_pool: PagePool::new(
                &log,
                PAGE_POOL_PHYS,
                config.page_pool_pages,
            ),
            huge_pool: HugePool::new(&log, huge_phys, config.huge_pool_pages),
            vm_pool: VmPool::new(&log),
            vp_pool: VpPool::new(&log),
            vs_pool: VsPool::new(&log),
            ext_pool: ExtPool::new(&log),
            msr_policy: MsrPolicy::default(),
            ext_vmexit: ExtId::INVALID,
            ext_fail: ExtId::INVALID,
            log,
        };

        mk.vm_pool.initialize()?;
        mk.vp_pool.initialize()?;
        mk.vs_pool.initialize()?;

        let mut tls = mk.tls(PpId::BS);
        let root = mk.vm_pool.allocate(
            &mut tls,
            &mut mk.ext_pool,
            &mut mk.page_pool,
        )?;
        debug_assert_eq!(root, VmId::ROOT);

        info!(mk.log, "microkernel started";
            "online_pps" => mk.online_pps,
            "page_pool_pages" => config.page_pool_pages,
            "huge_pool_pages" => config.huge_pool_pages,
        );
        Ok(mk)
    }

    pub fn online_pps(&self) -> u16 {
        self.online_pps
    }

    /// A fresh per-PP state block for `ppid`.
    pub fn tls(&self, ppid: PpId) -> Tls {
        Tls::new(ppid, self.online_pps)
    }

    /// Prepare a PP for its extensions: the root VM becomes active, and APs
    /// inherit the handlers registered on the BSP.
    pub fn boot_pp(&mut self, tls: &mut Tls) -> Result<()> {
        if tls.ppid != PpId::BS {
            if self.ext_vmexit.is_invalid() {
                return Err(Error::CallbackMissing("vmexit"));
            }
            tls.ext_vmexit = self.ext_vmexit;
            tls.ext_fail = self.ext_fail;
        }
        self.vm_pool.set_active(tls, VmId::ROOT)
    }

    /// Record the handlers the extensions registered while starting on the
    /// BSP. Both are required.
    pub fn finish_start(&mut self, tls: &Tls) -> Result<()> {
        if tls.ext_vmexit.is_invalid() {
            error!(self.log, "a vmexit handler was not registered");
            return Err(Error::CallbackMissing("vmexit"));
        }
        if tls.ext_fail.is_invalid() {
            error!(self.log, "a fail handler was not registered");
            return Err(Error::CallbackMissing("fail"));
        }
        self.ext_vmexit = tls.ext_vmexit;
        self.ext_fail = tls.ext_fail;
        Ok(())
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// Release every object, children before parents.
    pub fn release(&mut self, tls: &mut Tls) -> Result<()> {
        let res = self
            .vs_pool
            .release(tls, &mut self.page_pool)
            .and(self.vp_pool.release(tls, &self.vs_pool))
            .and(self.vm_pool.release(
                tls,
                &mut self.ext_pool,
                &mut self.page_pool,
                &self.vp_pool,
            ));
        if let Err(e) = &res {
            error!(self.log, "microkernel release incomplete"; "error" => %e);
        }
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::page_pool::AllocTag;
    use crate::test_util::logger;

    #[test]
    fn boot_allocates_root_vm() {
        let config = Config { online_pps: 2, ..Default::default() };
        let mk = Microkernel::new(&logger(), &config).unwrap();
        assert!(mk.vm_pool.is_allocated(VmId::ROOT));
        assert_eq!(mk.online_pps(), 2);
        assert_eq!(mk.page_pool.allocated_with(AllocTag::DirectMapRoot), 1);

        let tls = mk.tls(PpId::new(1));
        assert!(tls.is_pp_online(PpId::new(1)));
        assert!(!tls.is_pp_online(PpId::new(2)));
    }

    #[test]
    fn aps_inherit_handlers() {
        let config = Config { online_pps: 2, ..Default::default() };
        let mut mk = Microkernel::new(&logger(), &config).unwrap();
        let mut bsp = mk.tls(PpId::BS);
        let mut ap = mk.tls(PpId::new(1));

        mk.boot_pp(&mut bsp).unwrap();
        assert_eq!(bsp.active_vmid, VmId::ROOT);
        assert_eq!(
            mk.finish_start(&bsp),
            Err(Error::CallbackMissing("vmexit"))
        );
        assert!(mk.boot_pp(&mut ap).is_err());

        bsp.ext_vmexit = ExtId::new(0);
        bsp.ext_fail = ExtId::new(0);
        mk.finish_start(&bsp).unwrap();

        let mut ap = mk.tls(PpId::new(1));
        mk.boot_pp(&mut ap).unwrap();
        assert_eq!(ap.ext_vmexit, ExtId::new(0));
        assert_eq!(ap.ext_fail, ExtId::new(0));
        assert!(mk.vm_pool.is_active_on_this_pp(&ap, VmId::ROOT));
    }

    #[test]
    fn release_leaves_root_vm() {
        let mut mk = Microkernel::new(&logger(), &Config::default()).unwrap();
        let mut tls = mk.tls(PpId::BS);
        mk.vm_pool
            .allocate(&mut tls, &mut mk.ext_pool, &mut mk.page_pool)
            .unwrap();
        mk.release(&mut tls).unwrap();
        assert!(mk.vm_pool.is_allocated(VmId::ROOT));
        assert_eq!(mk.page_pool.allocated_with(AllocTag::DirectMapRoot), 1);
    }
}
