// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM, VP and VS lifecycle of a hypervisor microkernel, and the
//! syscall dispatch extensions drive it with.
//!
//! Architecture-specific work goes through [intrinsic::Intrinsic], so the
//! whole kernel can be hosted in-process. [loopback] wires such a kernel to
//! [bf_syscall::BfSyscall].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ext;
pub mod ext_pool;
pub mod intrinsic;
pub mod kernel;
pub mod loopback;
pub mod msr;
pub mod page_pool;
pub mod status;
pub mod tls;
pub mod vm;
pub mod vm_pool;
pub mod vp;
pub mod vp_pool;
pub mod vs;
pub mod vs_pool;

#[cfg(test)]
mod test_util;

pub use dispatch::{dispatch_syscall, Dispatch};
pub use error::{Error, Result};
pub use kernel::Microkernel;
