// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Crate-level error type for system-call failures. Pure parsers (hex,
// chunked) carry their own protocol error enums and never produce these.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

use crate::shm_name::NAME_MAX;

/// Errors surfaced by the kernel-facing parts of the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A syscall on a specific descriptor failed.
    #[error("{syscall} on fd {fd} failed: {source}")]
    Syscall {
        syscall: &'static str,
        fd: RawFd,
        source: io::Error,
    },

    /// A syscall with no associated descriptor failed.
    #[error("{syscall} failed: {source}")]
    Os {
        syscall: &'static str,
        source: io::Error,
    },

    /// Attach was asked for a shared-memory name that does not exist.
    #[error("shared memory object {name:?} not found")]
    NotFound { name: String },

    /// Attach found a ring header with an unsupported layout version.
    #[error("unsupported ring layout version {found}")]
    BadVersion { found: u8 },

    /// The requested ring capacity cannot be double-mapped in this
    /// address space.
    #[error("ring capacity {requested} exceeds the addressable limit")]
    CapacityOverflow { requested: usize },

    /// A ring name is longer than the header's name field allows, or
    /// contains bytes a POSIX shm name may not.
    #[error("ring name {name:?} is not a valid shm name (max {NAME_MAX} bytes, no interior '/')")]
    BadName { name: String },

    /// Could not bind or listen on the given address.
    #[error("could not listen on {addr}: {source}")]
    Listen { addr: String, source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Capture `errno` for a failed syscall on `fd`.
    pub(crate) fn syscall(syscall: &'static str, fd: RawFd) -> Self {
        Error::Syscall {
            syscall,
            fd,
            source: io::Error::last_os_error(),
        }
    }

    /// Capture `errno` for a failed syscall with no descriptor.
    pub(crate) fn os(syscall: &'static str) -> Self {
        Error::Os {
            syscall,
            source: io::Error::last_os_error(),
        }
    }
}
