// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical memory handed out by the microkernel.

use slog::{error, Logger};

use bf_types::consts::HYPERVISOR_PAGE_SIZE;

use crate::error::{Error, Result};

/// What a page was allocated for. Kept per frame so leaks can be attributed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum AllocTag {
    VsState,
    DirectMapRoot,
    ExtPage,
}

/// Fixed set of page frames starting at `base`.
pub struct PagePool {
    log: Logger,
    base: u64,
    frames: Vec<Option<AllocTag>>,
}

impl PagePool {
    pub fn new(log: &Logger, base: u64, pages: usize) -> Self {
        assert!(base != 0 && base % HYPERVISOR_PAGE_SIZE == 0);
        Self {
            log: log.new(slog::o!("component" => "page_pool")),
            base,
            frames: vec![None; pages],
        }
    }

    /// Allocate one frame, returning its physical address.
    pub fn allocate(&mut self, tag: AllocTag) -> Result<u64> {
        let Some(idx) = self.frames.iter().position(Option::is_none) else {
            let tag: &'static str = tag.into();
            error!(self.log, "page pool exhausted"; "tag" => tag);
            return Err(Error::OutOfMemory("page pool"));
        };
        self.frames[idx] = Some(tag);
        Ok(self.base + idx as u64 * HYPERVISOR_PAGE_SIZE)
    }

    pub fn deallocate(&mut self, phys: u64) -> Result<()> {
        let idx = self.index_of(phys)?;
        if self.frames[idx].take().is_none() {
            error!(self.log, "double free"; "phys" => phys);
            return Err(Error::BadAddress(phys, "page pool"));
        }
        Ok(())
    }

    pub fn tag_of(&self, phys: u64) -> Option<AllocTag> {
        self.index_of(phys).ok().and_then(|idx| self.frames[idx])
    }

    pub fn allocated(&self) -> usize {
        self.frames.iter().filter(|f| f.is_some()).count()
    }

    pub fn remaining(&self) -> usize {
        self.frames.len() - self.allocated()
    }

    /// Number of live frames carrying `tag`.
    pub fn allocated_with(&self, tag: AllocTag) -> usize {
        self.frames.iter().filter(|f| **f == Some(tag)).count()
    }

    fn index_of(&self, phys: u64) -> Result<usize> {
        let bad = Error::BadAddress(phys, "page pool");
        if phys < self.base || phys % HYPERVISOR_PAGE_SIZE != 0 {
            return Err(bad);
        }
        let idx = ((phys - self.base) / HYPERVISOR_PAGE_SIZE) as usize;
        if idx >= self.frames.len() {
            return Err(bad);
        }
        Ok(idx)
    }
}

/// Physically contiguous region carved up front to back. Memory handed out
/// here is never returned.
pub struct HugePool {
    log: Logger,
    base: u64,
    pages: u64,
    next: u64,
}

impl HugePool {
    pub fn new(log: &Logger, base: u64, pages: u64) -> Self {
        assert!(base != 0 && base % HYPERVISOR_PAGE_SIZE == 0);
        Self {
            log: log.new(slog::o!("component" => "huge_pool")),
            base,
            pages,
            next: 0,
        }
    }

    /// Allocate `pages` contiguous frames, returning the first physical
    /// address.
    pub fn allocate(&mut self, pages: u64) -> Result<u64> {
        match self.next.checked_add(pages) {
            Some(end) if pages != 0 && end <= self.pages => {
                let phys = self.base + self.next * HYPERVISOR_PAGE_SIZE;
                self.next = end;
                Ok(phys)
            }
            _ => {
                error!(self.log, "huge pool cannot satisfy request";
                    "pages" => pages,
                    "remaining" => self.pages - self.next,
                );
                Err(Error::OutOfMemory("huge pool"))
            }
        }
    }

    /// Size of the whole pool in bytes.
    pub fn size(&self) -> u64 {
        self.pages * HYPERVISOR_PAGE_SIZE
    }

    pub fn remaining_pages(&self) -> u64 {
        self.pages - self.next
    }
}
