// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Extension-side access to the microkernel.
//!
//! [BfSyscall] wraps a [SyscallAbi] transport and exposes every syscall as
//! a typed method. Extensions should be written against [BfSyscallOps] so
//! that they can be driven by [mock::MockBfSyscall] in tests.

mod abi;
mod error;
mod handles;
mod ops;
mod syscall;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use abi::{AbiRegs, SyscallAbi};
#[cfg(target_arch = "x86_64")]
pub use abi::HwAbi;
pub use error::{Error, Result};
pub use handles::{DirectMap, HugeAlloc, Page};
pub use ops::BfSyscallOps;
pub use syscall::BfSyscall;
