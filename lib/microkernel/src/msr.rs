// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Which model-specific registers an extension may touch directly.

use crate::error::{Error, Result};
use crate::intrinsic::Intrinsic;

/// A model-specific register (MSR) number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MsrId(pub u32);

impl MsrId {
    pub const SYSENTER_CS: Self = Self(0x174);
    pub const SYSENTER_ESP: Self = Self(0x175);
    pub const SYSENTER_EIP: Self = Self(0x176);
    pub const EFER: Self = Self(0xC000_0080);
    pub const STAR: Self = Self(0xC000_0081);
    pub const LSTAR: Self = Self(0xC000_0082);
    pub const CSTAR: Self = Self(0xC000_0083);
    pub const FMASK: Self = Self(0xC000_0084);
    pub const FS_BASE: Self = Self(0xC000_0100);
    pub const GS_BASE: Self = Self(0xC000_0101);
    pub const KERNEL_GS_BASE: Self = Self(0xC000_0102);

    /// Decode an MSR number passed in a 64-bit register.
    pub fn from_reg(reg: u64) -> Option<Self> {
        u32::try_from(reg).ok().map(Self)
    }
}

/// Policy applied to the intrinsic rdmsr/wrmsr syscalls.
///
/// The microkernel relies on the MSRs it uses for system call entry and
/// segment bases; everything else is passed through to the hardware.
#[derive(Clone, Debug)]
pub struct MsrPolicy {
    reserved: Vec<MsrId>,
}

impl Default for MsrPolicy {
    fn default() -> Self {
        Self {
            reserved: vec![
                MsrId::SYSENTER_CS,
                MsrId::SYSENTER_ESP,
                MsrId::SYSENTER_EIP,
                MsrId::EFER,
                MsrId::STAR,
                MsrId::LSTAR,
                MsrId::CSTAR,
                MsrId::FMASK,
                MsrId::FS_BASE,
                MsrId::GS_BASE,
                MsrId::KERNEL_GS_BASE,
            ],
        }
    }
}

impl MsrPolicy {
    pub fn is_permitted(&self, msr: MsrId) -> bool {
        !self.reserved.contains(&msr)
    }

    pub fn rdmsr(
        &self,
        intrinsic: &mut dyn Intrinsic,
        msr: MsrId,
    ) -> Result<u64> {
        self.check(msr)?;
        Ok(intrinsic.rdmsr(msr.0)?)
    }

    pub fn wrmsr(
        &self,
        intrinsic: &mut dyn Intrinsic,
        msr: MsrId,
        val: u64,
    ) -> Result<()> {
        self.check(msr)?;
        Ok(intrinsic.wrmsr(msr.0, val)?)
    }

    fn check(&self, msr: MsrId) -> Result<()> {
        if !self.is_permitted(msr) {
            return Err(Error::MsrDenied(msr.0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::intrinsic::MockIntrinsic;
    use mockall::predicate::eq;

    #[test]
    fn from_reg() {
        assert_eq!(MsrId::from_reg(0x1b), Some(MsrId(0x1b)));
        assert_eq!(MsrId::from_reg(0xFFFF_FFFF), Some(MsrId(0xFFFF_FFFF)));
        assert_eq!(MsrId::from_reg(0x1_0000_0000), None);
    }

    #[test]
    fn reserved_msrs_never_reach_hardware() {
        let policy = MsrPolicy::default();
        let mut intrinsic = MockIntrinsic::new();
        intrinsic.expect_rdmsr().never();
        intrinsic.expect_wrmsr().never();

        assert_eq!(
            policy.rdmsr(&mut intrinsic, MsrId::LSTAR),
            Err(Error::MsrDenied(0xC000_0082))
        );
        assert_eq!(
            policy.wrmsr(&mut intrinsic, MsrId::EFER, 0),
            Err(Error::MsrDenied(0xC000_0080))
        );
    }

    #[test]
    fn others_pass_through() {
        let policy = MsrPolicy::default();
        let mut intrinsic = MockIntrinsic::new();
        intrinsic
            .expect_rdmsr()
            .with(eq(0x1b))
            .times(1)
            .returning(|_| Ok(0xfee0_0900));
        intrinsic
            .expect_wrmsr()
            .with(eq(0x277), eq(0x0007_0406_0007_0406))
            .times(1)
            .returning(|_, _| Ok(()));

        assert_eq!(policy.rdmsr(&mut intrinsic, MsrId(0x1b)), Ok(0xfee0_0900));
        assert_eq!(
            policy.wrmsr(&mut intrinsic, MsrId(0x277), 0x0007_0406_0007_0406),
            Ok(())
        );
    }
}
