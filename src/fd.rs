// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Owning file-descriptor value. Destruction closes exactly once; an
// invalid descriptor (-1) is representable and never closed.

use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

const INVALID: RawFd = -1;

/// An owned file descriptor.
///
/// Every descriptor the crate hands out or holds lives in one of these so
/// that close happens exactly once, on drop. `release` gives the raw value
/// up without closing; `try_clone` duplicates with `F_DUPFD_CLOEXEC`.
#[derive(Debug)]
pub struct FileDescriptor {
    fd: RawFd,
}

impl FileDescriptor {
    /// Take ownership of a raw descriptor. Passing a negative value
    /// produces an invalid (empty) holder.
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd: if fd < 0 { INVALID } else { fd },
        }
    }

    /// An empty holder that owns nothing.
    pub const fn invalid() -> Self {
        Self { fd: INVALID }
    }

    /// Whether a descriptor is held.
    pub fn is_valid(&self) -> bool {
        self.fd != INVALID
    }

    /// Give up ownership; the caller is now responsible for closing.
    pub fn release(mut self) -> RawFd {
        std::mem::replace(&mut self.fd, INVALID)
    }

    /// Duplicate the descriptor (`fcntl(F_DUPFD_CLOEXEC)`).
    pub fn try_clone(&self) -> io::Result<Self> {
        let dup = unsafe { libc::fcntl(self.fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd: dup })
    }

    /// OR `O_NONBLOCK` into the descriptor's status flags.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Close eagerly. The holder becomes invalid; drop will not close again.
    pub fn close(&mut self) {
        if self.fd != INVALID {
            unsafe { libc::close(self.fd) };
            self.fd = INVALID;
        }
    }
}

impl Default for FileDescriptor {
    fn default() -> Self {
        Self::invalid()
    }
}

impl AsRawFd for FileDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for FileDescriptor {
    fn into_raw_fd(self) -> RawFd {
        self.release()
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        self.close();
    }
}
