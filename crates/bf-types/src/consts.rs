// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Platform limits and address-space layout shared by the kernel and its
//! extensions.

pub const HYPERVISOR_MAX_VMS: u16 = 16;
pub const HYPERVISOR_MAX_VPS: u16 = 256;
pub const HYPERVISOR_MAX_VSS: u16 = 256;
pub const HYPERVISOR_MAX_PPS: u16 = 128;
pub const HYPERVISOR_MAX_EXTENSIONS: u16 = 1;

pub const HYPERVISOR_PAGE_SIZE: u64 = 0x1000;

/// Window through which an extension sees guest physical memory.
pub const HYPERVISOR_EXT_DIRECT_MAP_ADDR: u64 = 0x0000_6000_0000_0000;
pub const HYPERVISOR_EXT_DIRECT_MAP_SIZE: u64 = 0x0000_1000_0000_0000;

/// Window through which an extension sees pages it allocated.
pub const HYPERVISOR_EXT_PAGE_POOL_ADDR: u64 = 0x0000_0300_0000_0000;

/// Upper bound for the contiguous huge pool.
pub const HYPERVISOR_MAX_HUGE_POOL_SIZE: u64 = 0x0400_0000;

pub const BF_SPEC_ID1_VAL: u32 = 0x3123_6642;
pub const BF_SPEC_ID1_MASK: u32 = 0x2;
pub const BF_ALL_SPECS_SUPPORTED_VAL: u32 = 0x2;
pub const BF_INVALID_VERSION: u32 = 0x8000_0000;

pub const BF_INVALID_HANDLE: u64 = u64::MAX;

pub const fn is_spec1_supported(version: u32) -> bool {
    version & BF_SPEC_ID1_MASK != 0
}

pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (HYPERVISOR_PAGE_SIZE - 1) == 0
}

pub const fn page_aligned(addr: u64) -> u64 {
    addr & !(HYPERVISOR_PAGE_SIZE - 1)
}

/// Round `size` up to whole pages, returning `(bytes, pages)`. Zero and
/// sizes that would overflow yield `None`.
pub const fn size_to_pages(size: u64) -> Option<(u64, u64)> {
    if size == 0 {
        return None;
    }
    let pages = size.div_ceil(HYPERVISOR_PAGE_SIZE);
    match pages.checked_mul(HYPERVISOR_PAGE_SIZE) {
        Some(bytes) => Some((bytes, pages)),
        None => None,
    }
}
