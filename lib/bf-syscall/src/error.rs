// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bf_types::{BfStatus, VmId};

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("{op} failed with {status}")]
    Status { op: &'static str, status: BfStatus },

    #[error("{op} returned unknown status {raw:#018x}")]
    UnknownStatus { op: &'static str, raw: u64 },

    #[error("{op} returned out-of-range id {raw:#x}")]
    BadId { op: &'static str, raw: u64 },

    #[error("microkernel version {0:#010x} does not support spec1")]
    UnsupportedVersion(u32),

    #[error("no live direct map of vm {vmid} at {virt:#018x}")]
    UnknownMapping { vmid: VmId, virt: u64 },
}

impl Error {
    /// The status the microkernel reported, if the failure came from it.
    pub fn status(&self) -> Option<BfStatus> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
