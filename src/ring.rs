// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Mirror-mapped SP/SC circular byte buffer, optionally backed by a named
// POSIX shared-memory object. The data region is mapped twice at adjacent
// virtual addresses, so every readable or writable window of up to
// `capacity` bytes is a single contiguous slice regardless of wrap-around.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::fd::FileDescriptor;
use crate::shm_name::{self, NAME_MAX};

/// One cache line per index so producer and consumer never share a line.
#[repr(C, align(64))]
struct PaddedIndex {
    value: AtomicU64,
}

/// On-disk/in-shm layout, version 1. Lives at offset 0 of the mapping.
/// The private-data region follows the struct; header plus private data
/// is rounded up to a whole page before the data region begins.
#[repr(C)]
struct RingHeader {
    read_idx: PaddedIndex,
    write_idx: PaddedIndex,
    version: u8,
    _reserved: [u8; 7],
    capacity: u64,
    private_size: u64,
    name: [u8; NAME_MAX + 1],
}

const LAYOUT_VERSION: u8 = 1;

/// A borrowed window into the ring's data region.
///
/// The pointer is always valid for `len` contiguous bytes (the mirror
/// mapping guarantee). Materialising a slice is `unsafe` because the
/// compiler cannot see the SP/SC ownership protocol that makes the bytes
/// exclusive to the caller.
#[derive(Clone, Copy, Debug)]
pub struct RingSlice {
    ptr: *mut u8,
    len: usize,
}

impl RingSlice {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the window as a byte slice.
    ///
    /// # Safety
    /// The caller must be the side of the SP/SC protocol this window was
    /// handed to (consumer for `readable`, producer for `writable`), and
    /// must not hold the slice across the matching commit.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }

    /// Mutable variant of [`RingSlice::as_slice`], same contract.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// Mirror-mapped circular byte buffer for exactly one producer and one
/// consumer.
///
/// Index protocol: the producer publishes bytes with a release store of
/// the write index after filling them; the consumer acquire-loads the
/// write index before reading and release-stores the read index after
/// consuming. Both indices are monotonic; offsets into the data region
/// are `index & (capacity - 1)`.
///
/// A named ring persists as a POSIX shared-memory object and can be
/// [`attach`](MirrorRing::attach)ed by any process with permission.
/// Dropping a ring destroys it (unlinks the name, if any, and unmaps);
/// use [`detach`](MirrorRing::detach) to release only the local mapping.
pub struct MirrorRing {
    base: *mut u8,
    head_size: usize,
    capacity: usize,
    name: Option<String>,
    unlink_on_drop: bool,
}

// The region is designed for cross-thread/cross-process SP/SC use; all
// index traffic is atomic.
unsafe impl Send for MirrorRing {}
unsafe impl Sync for MirrorRing {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Round the requested capacity up to a power of two no smaller than a
/// page, and compute the page-aligned head (header + private data) size.
fn layout(capacity: usize, private_size: usize) -> Result<(usize, usize)> {
    let overflow = || Error::CapacityOverflow {
        requested: capacity,
    };
    let page = page_size();
    let cap = capacity
        .max(1)
        .checked_next_power_of_two()
        .ok_or_else(overflow)?
        .max(page);
    let head = std::mem::size_of::<RingHeader>()
        .checked_add(private_size)
        .and_then(|h| h.checked_add(page - 1))
        .ok_or_else(overflow)?
        & !(page - 1);
    // The reservation is head + 2 * cap; reject anything that cannot fit.
    head.checked_add(cap)
        .and_then(|t| t.checked_add(cap))
        .ok_or_else(overflow)?;
    Ok((cap, head))
}

/// Build the double mapping: reserve head + 2C, map the backing object
/// over [0, head + C), then remap the data window to [head + C, head + 2C).
/// `shmfd == -1` selects anonymous shared memory.
fn map_mirrored(shmfd: RawFd, head_size: usize, capacity: usize) -> Result<*mut u8> {
    let total = head_size + capacity;
    let reserve_len = total + capacity;

    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            reserve_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::os("mmap"));
    }

    let flags =
        libc::MAP_SHARED | libc::MAP_FIXED | if shmfd == -1 { libc::MAP_ANONYMOUS } else { 0 };
    let first = unsafe {
        libc::mmap(
            addr,
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            shmfd,
            0,
        )
    };
    if first != addr {
        let err = Error::os("mmap");
        unsafe { libc::munmap(addr, reserve_len) };
        return Err(err);
    }

    let mirror_at = unsafe { (addr as *mut u8).add(total) };
    let mirror = unsafe {
        libc::mremap(
            (addr as *mut u8).add(head_size) as *mut libc::c_void,
            0,
            capacity,
            libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED,
            mirror_at as *mut libc::c_void,
        )
    };
    if mirror != mirror_at as *mut libc::c_void {
        let err = Error::os("mremap");
        unsafe { libc::munmap(addr, reserve_len) };
        return Err(err);
    }

    Ok(addr as *mut u8)
}

impl MirrorRing {
    /// Create a process-private ring. It can be shared across threads (one
    /// producer, one consumer) or inherited across `fork`, but has no name
    /// to attach to.
    pub fn anonymous(capacity: usize, private_size: usize) -> Result<Self> {
        let (cap, head) = layout(capacity, private_size)?;
        let base = map_mirrored(-1, head, cap)?;
        let ring = Self {
            base,
            head_size: head,
            capacity: cap,
            name: None,
            unlink_on_drop: false,
        };
        ring.init_header(private_size, "");
        Ok(ring)
    }

    /// Create a named ring backed by an exclusively created shared-memory
    /// object. Fails if the name already exists.
    pub fn create(name: &str, capacity: usize, private_size: usize) -> Result<Self> {
        let posix = shm_name::make_shm_name(name)?;
        let c_name = CString::new(posix.as_bytes()).map_err(|_| Error::BadName {
            name: name.to_string(),
        })?;
        let (cap, head) = layout(capacity, private_size)?;

        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o660 as libc::mode_t as libc::c_uint,
            )
        };
        if raw == -1 {
            return Err(Error::os("shm_open"));
        }
        let fd = FileDescriptor::new(raw);

        if unsafe { libc::ftruncate(fd.as_raw_fd(), (head + cap) as libc::off_t) } != 0 {
            let err = Error::syscall("ftruncate", fd.as_raw_fd());
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        let base = match map_mirrored(fd.as_raw_fd(), head, cap) {
            Ok(base) => base,
            Err(err) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(err);
            }
        };

        let ring = Self {
            base,
            head_size: head,
            capacity: cap,
            name: Some(posix.clone()),
            unlink_on_drop: true,
        };
        ring.init_header(private_size, &posix);
        Ok(ring)
    }

    /// Attach to an existing named ring, learning its geometry from the
    /// mapped header. A missing name is reported as [`Error::NotFound`].
    pub fn attach(name: &str) -> Result<Self> {
        let posix = shm_name::make_shm_name(name)?;
        let c_name = CString::new(posix.as_bytes()).map_err(|_| Error::BadName {
            name: name.to_string(),
        })?;

        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if raw == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Err(Error::NotFound { name: posix });
            }
            return Err(Error::Os {
                syscall: "shm_open",
                source: err,
            });
        }
        let fd = FileDescriptor::new(raw);

        // Peek one page of header to learn version and geometry.
        let page = page_size();
        let peek = unsafe {
            libc::mmap(
                ptr::null_mut(),
                page,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if peek == libc::MAP_FAILED {
            return Err(Error::syscall("mmap", fd.as_raw_fd()));
        }
        let (version, cap, private_size) = unsafe {
            let header = &*(peek as *const RingHeader);
            (
                header.version,
                header.capacity as usize,
                header.private_size as usize,
            )
        };
        unsafe { libc::munmap(peek, page) };

        if version != LAYOUT_VERSION {
            return Err(Error::BadVersion { found: version });
        }
        debug_assert!(cap.is_power_of_two());

        let (cap, head) = layout(cap, private_size)?;
        let base = map_mirrored(fd.as_raw_fd(), head, cap)?;
        Ok(Self {
            base,
            head_size: head,
            capacity: cap,
            name: Some(posix),
            unlink_on_drop: true,
        })
    }

    /// Remove a named ring's backing object without an open handle.
    pub fn unlink(name: &str) -> Result<()> {
        let posix = shm_name::make_shm_name(name)?;
        if let Ok(c_name) = CString::new(posix.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
        Ok(())
    }

    fn init_header(&self, private_size: usize, posix_name: &str) {
        // A fresh mapping is zero-filled; the indices are already 0.
        unsafe {
            let header = &mut *(self.base as *mut RingHeader);
            header.version = LAYOUT_VERSION;
            header.capacity = self.capacity as u64;
            header.private_size = private_size as u64;
            let bytes = posix_name.as_bytes();
            header.name[..bytes.len()].copy_from_slice(bytes);
            header.name[bytes.len()] = 0;
        }
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*(self.base as *const RingHeader) }
    }

    #[inline]
    fn mask(&self) -> u64 {
        self.capacity as u64 - 1
    }

    #[inline]
    fn data(&self) -> *mut u8 {
        unsafe { self.base.add(self.head_size) }
    }

    /// Ring capacity in bytes (a page-multiple power of two).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The POSIX object name, if this ring is named.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The embedded private-data region, if one was requested at creation.
    pub fn private_data(&self) -> Option<RingSlice> {
        let len = self.header().private_size as usize;
        if len == 0 {
            return None;
        }
        Some(RingSlice {
            ptr: unsafe { self.base.add(std::mem::size_of::<RingHeader>()) },
            len,
        })
    }

    /// Producer side: the contiguous window of free space starting at the
    /// write cursor. Fill a prefix, then [`commit_write`](Self::commit_write).
    pub fn writable(&self) -> RingSlice {
        let header = self.header();
        let read = header.read_idx.value.load(Ordering::Acquire);
        let write = header.write_idx.value.load(Ordering::Relaxed);
        RingSlice {
            ptr: unsafe { self.data().add((write & self.mask()) as usize) },
            len: self.capacity - (write - read) as usize,
        }
    }

    /// Publish `n` produced bytes. `n` is clamped to the writable window;
    /// the effective count is returned. Exceeding the window is a
    /// contract violation (debug assertion).
    pub fn commit_write(&self, n: usize) -> usize {
        let header = self.header();
        let read = header.read_idx.value.load(Ordering::Acquire);
        let write = header.write_idx.value.load(Ordering::Relaxed);
        let free = self.capacity - (write - read) as usize;
        debug_assert!(n <= free, "commit_write({n}) exceeds writable ({free})");
        let n = n.min(free);
        header
            .write_idx
            .value
            .store(write + n as u64, Ordering::Release);
        n
    }

    /// Consumer side: the contiguous window of unread bytes starting at
    /// the read cursor. Consume a prefix, then [`commit_read`](Self::commit_read).
    pub fn readable(&self) -> RingSlice {
        let header = self.header();
        let write = header.write_idx.value.load(Ordering::Acquire);
        let read = header.read_idx.value.load(Ordering::Relaxed);
        RingSlice {
            ptr: unsafe { self.data().add((read & self.mask()) as usize) },
            len: (write - read) as usize,
        }
    }

    /// Retire `n` consumed bytes. `n` is clamped to the readable window;
    /// the effective count is returned.
    pub fn commit_read(&self, n: usize) -> usize {
        let header = self.header();
        let write = header.write_idx.value.load(Ordering::Acquire);
        let read = header.read_idx.value.load(Ordering::Relaxed);
        let avail = (write - read) as usize;
        debug_assert!(n <= avail, "commit_read({n}) exceeds readable ({avail})");
        let n = n.min(avail);
        header
            .read_idx
            .value
            .store(read + n as u64, Ordering::Release);
        n
    }

    /// Copy as much of `data` as fits into the ring and commit it.
    /// Returns the number of bytes accepted.
    pub fn push(&self, data: &[u8]) -> usize {
        let window = self.writable();
        let n = data.len().min(window.len());
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), window.as_ptr(), n) };
        self.commit_write(n)
    }

    /// Copy up to `out.len()` unread bytes out of the ring and commit the
    /// read. Returns the number of bytes copied.
    pub fn pop_into(&self, out: &mut [u8]) -> usize {
        let window = self.readable();
        let n = out.len().min(window.len());
        unsafe { ptr::copy_nonoverlapping(window.as_ptr(), out.as_mut_ptr(), n) };
        self.commit_read(n)
    }

    /// Release the local mapping but keep the named object (and its
    /// contents) alive for other attachments.
    pub fn detach(mut self) {
        self.unlink_on_drop = false;
    }

    /// Destroy the ring: unlink the name (if any) and unmap. Equivalent
    /// to dropping, spelled out for call sites that want the intent
    /// visible.
    pub fn destroy(self) {}
}

impl Drop for MirrorRing {
    fn drop(&mut self) {
        if self.unlink_on_drop {
            if let Some(name) = &self.name {
                if let Ok(c_name) = CString::new(name.as_bytes()) {
                    unsafe { libc::shm_unlink(c_name.as_ptr()) };
                }
            }
        }
        unsafe {
            libc::munmap(
                self.base as *mut libc::c_void,
                self.head_size + 2 * self.capacity,
            )
        };
    }
}
