// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Drain, Logger};

use bf_types::PpId;

use crate::config::Config;
use crate::ext_pool::ExtPool;
use crate::kernel::Microkernel;
use crate::page_pool::{HugePool, PagePool};
use crate::tls::Tls;
use crate::vm_pool::VmPool;
use crate::vp_pool::VpPool;
use crate::vs_pool::VsPool;

pub(crate) fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, slog::o!())
}

pub(crate) fn microkernel(online_pps: u16) -> Microkernel {
    let config = Config { online_pps, ..Default::default() };
    Microkernel::new(&logger(), &config).unwrap()
}

/// The pools of a freshly booted microkernel, split apart so tests can
/// borrow them independently, plus the BSP's TLS.
pub(crate) struct Fixture {
    pub tls: Tls,
    pub page_pool: PagePool,
    #[allow(dead_code)]
    pub huge_pool: HugePool,
    pub vm_pool: VmPool,
    pub vp_pool: VpPool,
    pub vs_pool: VsPool,
    pub ext_pool: ExtPool,
}

impl Fixture {
    pub fn new(online_pps: u16) -> Self {
        let mk = microkernel(online_pps);
        Self {
            tls: mk.tls(PpId::BS),
            page_pool: mk.page_pool,
            huge_pool: mk.huge_pool,
            vm_pool: mk.vm_pool,
            vp_pool: mk.vp_pool,
            vs_pool: mk.vs_pool,
            ext_pool: mk.ext_pool,
        }
    }
}
