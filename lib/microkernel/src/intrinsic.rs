// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the processor features the lifecycle code needs.
//!
//! Each virtual CPU state owns a page-sized state area (a VMCS or VMCB,
//! depending on the vendor). Everything that touches real CPU state goes
//! through [Intrinsic], keyed by the physical address of that area, so the
//! object model never has to know which vendor it runs on.

use std::collections::BTreeMap;

use bf_types::consts::HYPERVISOR_PAGE_SIZE;
use bf_types::{BfReg, BF_MAX_REG_T};

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum IntrinsicError {
    #[error("state area {0:#018x} is not a valid state area")]
    BadStateArea(u64),

    #[error("register {0:?} cannot be accessed")]
    BadRegister(BfReg),

    #[error("msr {0:#010x} faulted")]
    MsrFault(u32),

    #[error("cr3 {0:#018x} is not page aligned")]
    BadCr3(u64),
}

/// Hardware operations of the PP the caller is running on.
#[cfg_attr(test, mockall::automock)]
pub trait Intrinsic {
    /// Make the state area at `phys` the current one on this PP.
    fn load(&mut self, phys: u64) -> Result<(), IntrinsicError>;

    /// Flush the state area at `phys` back to memory and mark it inactive,
    /// so that it may be loaded on another PP.
    fn clear(&mut self, phys: u64) -> Result<(), IntrinsicError>;

    fn read_reg(&mut self, phys: u64, reg: BfReg)
        -> Result<u64, IntrinsicError>;

    fn write_reg(
        &mut self,
        phys: u64,
        reg: BfReg,
        val: u64,
    ) -> Result<(), IntrinsicError>;

    fn rdmsr(&mut self, msr: u32) -> Result<u64, IntrinsicError>;

    fn wrmsr(&mut self, msr: u32, val: u64) -> Result<(), IntrinsicError>;

    /// Invalidate guest translations tagged with `tag`; only `gla` when one
    /// is given.
    fn invalidate_tlb(&mut self, tag: u16, gla: Option<u64>);

    /// Invalidate a single translation of the microkernel's own address
    /// space.
    fn invlpg(&mut self, virt: u64);

    fn set_cr3(&mut self, phys: u64) -> Result<(), IntrinsicError>;
}

/// Software model of one PP, used to host the microkernel in-process.
#[derive(Debug, Default)]
pub struct SoftIntrinsic {
    areas: BTreeMap<u64, Vec<u64>>,
    current: Option<u64>,
    msrs: BTreeMap<u32, u64>,
    cr3: u64,
    tlb_invalidations: Vec<(u16, Option<u64>)>,
    invlpgs: Vec<u64>,
}

impl SoftIntrinsic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<u64> {
        self.current
    }

    pub fn cr3(&self) -> u64 {
        self.cr3
    }

    pub fn tlb_invalidations(&self) -> &[(u16, Option<u64>)] {
        &self.tlb_invalidations
    }

    pub fn invlpgs(&self) -> &[u64] {
        &self.invlpgs
    }

    fn area(&mut self, phys: u64) -> Result<&mut Vec<u64>, IntrinsicError> {
        if phys == 0 || phys % HYPERVISOR_PAGE_SIZE != 0 {
            return Err(IntrinsicError::BadStateArea(phys));
        }
        Ok(self
            .areas
            .entry(phys)
            .or_insert_with(|| vec![0; BF_MAX_REG_T as usize]))
    }
}

impl Intrinsic for SoftIntrinsic {
    fn load(&mut self, phys: u64) -> Result<(), IntrinsicError> {
        self.area(phys)?;
        self.current = Some(phys);
        Ok(())
    }

    fn clear(&mut self, phys: u64) -> Result<(), IntrinsicError> {
        self.area(phys)?;
        if self.current == Some(phys) {
            self.current = None;
        }
        Ok(())
    }

    fn read_reg(
        &mut self,
        phys: u64,
        reg: BfReg,
    ) -> Result<u64, IntrinsicError> {
        if reg == BfReg::Unsupported {
            return Err(IntrinsicError::BadRegister(reg));
        }
        Ok(self.area(phys)?[reg.index()])
    }

    fn write_reg(
        &mut self,
        phys: u64,
        reg: BfReg,
        val: u64,
    ) -> Result<(), IntrinsicError> {
        if reg == BfReg::Unsupported {
            return Err(IntrinsicError::BadRegister(reg));
        }
        self.area(phys)?[reg.index()] = val;
        Ok(())
    }

    fn rdmsr(&mut self, msr: u32) -> Result<u64, IntrinsicError> {
        Ok(self.msrs.get(&msr).copied().unwrap_or(0))
    }

    fn wrmsr(&mut self, msr: u32, val: u64) -> Result<(), IntrinsicError> {
        self.msrs.insert(msr, val);
        Ok(())
    }

    fn invalidate_tlb(&mut self, tag: u16, gla: Option<u64>) {
        self.tlb_invalidations.push((tag, gla));
    }

    fn invlpg(&mut self, virt: u64) {
        self.invlpgs.push(virt);
    }

    fn set_cr3(&mut self, phys: u64) -> Result<(), IntrinsicError> {
        if phys % HYPERVISOR_PAGE_SIZE != 0 {
            return Err(IntrinsicError::BadCr3(phys));
        }
        self.cr3 = phys;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registers_are_per_state_area() {
        let mut intrinsic = SoftIntrinsic::new();
        intrinsic.write_reg(0x1000, BfReg::GuestRip, 0xfff0).unwrap();
        intrinsic.write_reg(0x2000, BfReg::GuestRip, 0x7c00).unwrap();
        assert_eq!(intrinsic.read_reg(0x1000, BfReg::GuestRip), Ok(0xfff0));
        assert_eq!(intrinsic.read_reg(0x2000, BfReg::GuestRip), Ok(0x7c00));
    }

    #[test]
    fn clear_drops_current() {
        let mut intrinsic = SoftIntrinsic::new();
        intrinsic.load(0x3000).unwrap();
        assert_eq!(intrinsic.current(), Some(0x3000));
        intrinsic.clear(0x3000).unwrap();
        assert_eq!(intrinsic.current(), None);
    }

    #[test]
    fn rejects_unaligned_areas() {
        let mut intrinsic = SoftIntrinsic::new();
        assert_eq!(
            intrinsic.load(0x3001),
            Err(IntrinsicError::BadStateArea(0x3001))
        );
        assert_eq!(intrinsic.load(0), Err(IntrinsicError::BadStateArea(0)));
    }
}
