// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// TCP building blocks for the dispatcher: a listening socket that drains
// accept into a user factory, and a connection that couples a
// non-blocking socket to mirror-mapped rings with a drain-until-EAGAIN
// read/write state machine.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use crate::dispatch::{Dispatcher, Event, IoListener};
use crate::error::{Error, Result};
use crate::fd::FileDescriptor;
use crate::ring::MirrorRing;

const BACKLOG: libc::c_int = 1024;

/// Peer address of an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    V4(SocketAddrV4),
    Unix,
    Unknown,
}

fn peer_addr(storage: &libc::sockaddr_storage) -> PeerAddr {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            PeerAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)))
        }
        libc::AF_UNIX => PeerAddr::Unix,
        _ => PeerAddr::Unknown,
    }
}

/// Factory invoked once per accepted connection.
pub type AcceptFactory = Box<dyn FnMut(FileDescriptor, PeerAddr, &mut Dispatcher)>;

/// A listening socket registered with the dispatcher for readable events
/// only. On each edge it accepts until the kernel reports would-block and
/// hands every new socket to the factory.
pub struct TcpListener {
    sock: FileDescriptor,
    factory: AcceptFactory,
}

impl TcpListener {
    /// Wrap an already-listening non-blocking socket.
    pub fn new(
        sock: FileDescriptor,
        factory: impl FnMut(FileDescriptor, PeerAddr, &mut Dispatcher) + 'static,
    ) -> Self {
        Self {
            sock,
            factory: Box::new(factory),
        }
    }

    /// Bind and listen on `addr`: either an IPv4 `"a.b.c.d:port"` or a
    /// Unix-domain socket path (unlinked before bind).
    pub fn listen(addr: &str) -> Result<FileDescriptor> {
        match addr.parse::<SocketAddrV4>() {
            Ok(sa) => Self::listen_inet(sa),
            Err(_) => Self::listen_unix(Path::new(addr)),
        }
    }

    /// Bind and listen on an IPv4 address with backlog 1024.
    pub fn listen_inet(addr: SocketAddrV4) -> Result<FileDescriptor> {
        let fail = |source: io::Error| Error::Listen {
            addr: addr.to_string(),
            source,
        };

        let raw = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw == -1 {
            return Err(fail(io::Error::last_os_error()));
        }
        let sock = FileDescriptor::new(raw);

        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*addr.ip()).to_be(),
            },
            sin_zero: [0; 8],
        };
        let err = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                &sin as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if err != 0 {
            return Err(fail(io::Error::last_os_error()));
        }
        if unsafe { libc::listen(sock.as_raw_fd(), BACKLOG) } != 0 {
            return Err(fail(io::Error::last_os_error()));
        }
        Ok(sock)
    }

    /// Bind and listen on a Unix-domain path with backlog 1024. Any stale
    /// socket file at the path is unlinked first.
    pub fn listen_unix(path: &Path) -> Result<FileDescriptor> {
        let display = path.display().to_string();
        let fail = |source: io::Error| Error::Listen {
            addr: display.clone(),
            source,
        };

        let bytes = path.as_os_str().as_encoded_bytes();
        let mut sun = libc::sockaddr_un {
            sun_family: libc::AF_UNIX as libc::sa_family_t,
            sun_path: [0; 108],
        };
        if bytes.is_empty() || bytes.len() >= sun.sun_path.len() {
            return Err(fail(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unix socket path too long",
            )));
        }
        for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        let _ = std::fs::remove_file(path);

        let raw = unsafe {
            libc::socket(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw == -1 {
            return Err(fail(io::Error::last_os_error()));
        }
        let sock = FileDescriptor::new(raw);

        let err = unsafe {
            libc::bind(
                sock.as_raw_fd(),
                &sun as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if err != 0 {
            return Err(fail(io::Error::last_os_error()));
        }
        if unsafe { libc::listen(sock.as_raw_fd(), BACKLOG) } != 0 {
            return Err(fail(io::Error::last_os_error()));
        }
        Ok(sock)
    }

    /// The locally bound IPv4 address (resolves port-0 binds).
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let err = unsafe {
            libc::getsockname(
                self.sock.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if err != 0 {
            return Err(Error::syscall("getsockname", self.sock.as_raw_fd()));
        }
        match peer_addr(&storage) {
            PeerAddr::V4(sa) => Ok(sa),
            _ => Err(Error::Os {
                syscall: "getsockname",
                source: io::Error::new(io::ErrorKind::InvalidInput, "not an IPv4 socket"),
            }),
        }
    }
}

impl IoListener for TcpListener {
    fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn on_readable(&mut self, dispatcher: &mut Dispatcher) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let raw = unsafe {
                libc::accept4(
                    self.sock.as_raw_fd(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if raw == -1 {
                let err = io::Error::last_os_error();
                let errno = err.raw_os_error();
                if errno == Some(libc::EAGAIN) || errno == Some(libc::EWOULDBLOCK) {
                    return; // drained
                }
                if errno == Some(libc::EINTR) || errno == Some(libc::ECONNABORTED) {
                    continue;
                }
                log::warn!("accept4 on fd {}: {err}", self.sock.as_raw_fd());
                return;
            }
            (self.factory)(FileDescriptor::new(raw), peer_addr(&storage), dispatcher);
        }
    }

    fn on_writable(&mut self, _dispatcher: &mut Dispatcher) {
        // Never registered for writable.
    }
}

/// Per-callback context handed to a [`ConnectionHandler`]: the
/// connection's descriptor, its outbound ring (if any), and dispatcher
/// access for interest flips and re-entrant registration.
pub struct ConnCtx<'a> {
    dispatcher: &'a mut Dispatcher,
    write_ring: Option<&'a MirrorRing>,
    fd: RawFd,
}

impl ConnCtx<'_> {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn dispatcher(&mut self) -> &mut Dispatcher {
        self.dispatcher
    }

    /// The connection's outbound ring, for handlers that push their
    /// output directly (e.g. echoing from inside `on_read`). `None` on a
    /// write-disabled connection.
    pub fn write_ring(&self) -> Option<&MirrorRing> {
        self.write_ring
    }

    /// Subscribe the connection for writable events as well. Call when
    /// output becomes pending on a previously read-only connection.
    pub fn enable_write(&mut self) -> Result<()> {
        self.dispatcher.modify_io(self.fd, Event::ReadWrite)
    }

    /// Drop the writable subscription, keeping readable.
    pub fn disable_write(&mut self) -> Result<()> {
        self.dispatcher.modify_io(self.fd, Event::Read)
    }
}

/// User seam of a [`TcpConnection`].
///
/// `on_read` receives the inbound ring's readable window and returns how
/// many bytes it consumed. `on_write` fills the outbound ring's writable
/// window and returns how many bytes it produced; producing zero closes
/// the connection. `on_close` fires exactly once, after any remaining
/// inbound bytes have been offered to `on_read`.
pub trait ConnectionHandler {
    fn on_read(&mut self, ctx: &mut ConnCtx<'_>, data: &[u8]) -> usize;
    fn on_write(&mut self, ctx: &mut ConnCtx<'_>, buf: &mut [u8]) -> usize;
    fn on_close(&mut self, ctx: &mut ConnCtx<'_>);
}

enum Step {
    Continue,
    Yield,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    /// `on_close` has run but the outbound ring still held bytes; the
    /// connection stays registered write-only until the ring empties or
    /// the socket errors, then unregisters.
    Draining,
    Closed,
}

/// A non-blocking socket coupled to one inbound ring and, optionally, one
/// outbound ring (size 0 disables the write side).
///
/// Both cycles drain until the kernel reports would-block, as the
/// edge-triggered registration requires. Transient errors return to the
/// dispatcher; peer-close and fatal errnos run `on_close`. A graceful
/// close (peer EOF, consume starvation) with bytes still in the outbound
/// ring defers unregistration: the connection flips to write-only
/// interest and the normal non-blocking send path finishes the close.
/// Fatal socket errors unregister immediately, dropping unsent bytes.
pub struct TcpConnection<H: ConnectionHandler> {
    sock: FileDescriptor,
    rcb: MirrorRing,
    wcb: Option<MirrorRing>,
    handler: H,
    state: ConnState,
}

impl<H: ConnectionHandler> TcpConnection<H> {
    /// Take ownership of `sock` (switched to non-blocking) with an
    /// inbound ring of at least `rcb_size` bytes and, when `wcb_size`
    /// is non-zero, an outbound ring of at least `wcb_size` bytes.
    pub fn new(sock: FileDescriptor, rcb_size: usize, wcb_size: usize, handler: H) -> Result<Self> {
        sock.set_nonblocking().map_err(|source| Error::Syscall {
            syscall: "fcntl",
            fd: sock.as_raw_fd(),
            source,
        })?;
        let rcb = MirrorRing::anonymous(rcb_size, 0)?;
        let wcb = if wcb_size == 0 {
            None
        } else {
            Some(MirrorRing::anonymous(wcb_size, 0)?)
        };
        Ok(Self {
            sock,
            rcb,
            wcb,
            handler,
            state: ConnState::Open,
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Whether the close sequence has started (`on_close` has run). The
    /// connection may still be draining its outbound ring.
    pub fn is_closed(&self) -> bool {
        self.state != ConnState::Open
    }

    /// Offer the inbound ring's readable window to the user and retire
    /// whatever it consumed.
    fn consume(
        rcb: &MirrorRing,
        wcb: Option<&MirrorRing>,
        handler: &mut H,
        dispatcher: &mut Dispatcher,
        fd: RawFd,
    ) -> usize {
        let window = rcb.readable();
        let data = unsafe { window.as_slice() };
        let mut ctx = ConnCtx {
            dispatcher,
            write_ring: wcb,
            fd,
        };
        let n = handler.on_read(&mut ctx, data);
        rcb.commit_read(n.min(data.len()))
    }

    /// Non-blocking step of a draining close: send from the outbound
    /// ring until it empties (finish the close), the kernel would block
    /// (wait for the next writable edge), or the socket errors (finish,
    /// dropping the rest).
    fn drain_outbound(&mut self, dispatcher: &mut Dispatcher) {
        let fd = self.sock.as_raw_fd();
        loop {
            let step = match self.wcb.as_ref() {
                None => Step::Close,
                Some(wcb) => {
                    let window = wcb.readable();
                    if window.is_empty() {
                        Step::Close
                    } else {
                        let n = unsafe {
                            libc::send(
                                fd,
                                window.as_ptr() as *const libc::c_void,
                                window.len(),
                                libc::MSG_NOSIGNAL,
                            )
                        };
                        if n > 0 {
                            wcb.commit_read(n as usize);
                            Step::Continue
                        } else if n == 0 {
                            Step::Close
                        } else {
                            let err = io::Error::last_os_error();
                            let errno = err.raw_os_error();
                            if errno == Some(libc::EAGAIN) || errno == Some(libc::EWOULDBLOCK) {
                                Step::Yield
                            } else if errno == Some(libc::EINTR) {
                                Step::Continue
                            } else {
                                log::debug!("drain send on fd {fd}: {err}");
                                Step::Close
                            }
                        }
                    }
                }
            };
            match step {
                Step::Continue => continue,
                Step::Yield => return,
                Step::Close => {
                    self.finish_close(dispatcher);
                    return;
                }
            }
        }
    }

    /// Start the close sequence: run `on_close`, then either unregister
    /// or, for a graceful close with outbound bytes pending, switch to
    /// the draining state.
    fn close(&mut self, dispatcher: &mut Dispatcher, graceful: bool) {
        match self.state {
            ConnState::Closed => return,
            ConnState::Draining => {
                // A socket error while draining abandons the rest.
                if !graceful {
                    self.finish_close(dispatcher);
                }
                return;
            }
            ConnState::Open => {}
        }
        let fd = self.sock.as_raw_fd();
        let mut ctx = ConnCtx {
            dispatcher: &mut *dispatcher,
            write_ring: self.wcb.as_ref(),
            fd,
        };
        self.handler.on_close(&mut ctx);

        let pending = self.wcb.as_ref().is_some_and(|wcb| !wcb.readable().is_empty());
        if graceful && pending {
            self.state = ConnState::Draining;
            // Write-only interest; the MOD rearms the edge if the socket
            // is already writable.
            match dispatcher.modify_io(fd, Event::Write) {
                Ok(()) => return,
                Err(err) => log::debug!("arm drain on fd {fd}: {err}"),
            }
        }
        self.finish_close(dispatcher);
    }

    fn finish_close(&mut self, dispatcher: &mut Dispatcher) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        let fd = self.sock.as_raw_fd();
        if let Err(err) = dispatcher.unregister_io(fd) {
            log::debug!("unregister after close on fd {fd}: {err}");
        }
    }
}

impl<H: ConnectionHandler> IoListener for TcpConnection<H> {
    fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn on_readable(&mut self, dispatcher: &mut Dispatcher) {
        match self.state {
            ConnState::Closed => return,
            ConnState::Draining => {
                // HUP/ERR readiness lands here while draining; let the
                // send path observe the socket state and decide.
                self.drain_outbound(dispatcher);
                return;
            }
            ConnState::Open => {}
        }
        let fd = self.sock.as_raw_fd();
        loop {
            let window = self.rcb.writable();
            if !window.is_empty() {
                let n = unsafe {
                    libc::recv(fd, window.as_ptr() as *mut libc::c_void, window.len(), 0)
                };
                if n > 0 {
                    self.rcb.commit_write(n as usize);
                    continue;
                }
                if n == 0 {
                    // Peer closed: drain the ring to the user, then close.
                    Self::consume(&self.rcb, self.wcb.as_ref(), &mut self.handler, dispatcher, fd);
                    self.close(dispatcher, true);
                    return;
                }
                let err = io::Error::last_os_error();
                let errno = err.raw_os_error();
                if errno == Some(libc::EAGAIN) || errno == Some(libc::EWOULDBLOCK) {
                    // Emptied the socket — the edge contract is satisfied.
                    Self::consume(&self.rcb, self.wcb.as_ref(), &mut self.handler, dispatcher, fd);
                    return;
                }
                if errno == Some(libc::EINTR) {
                    continue;
                }
                log::debug!("recv on fd {fd}: {err}");
                self.close(dispatcher, false);
                return;
            }
            // Ring full: only the user can make room.
            if Self::consume(&self.rcb, self.wcb.as_ref(), &mut self.handler, dispatcher, fd) == 0 {
                self.close(dispatcher, true);
                return;
            }
        }
    }

    fn on_writable(&mut self, dispatcher: &mut Dispatcher) {
        match self.state {
            ConnState::Closed => return,
            ConnState::Draining => {
                self.drain_outbound(dispatcher);
                return;
            }
            ConnState::Open => {}
        }
        if self.wcb.is_none() {
            return;
        }
        let fd = self.sock.as_raw_fd();
        loop {
            let step = {
                let Some(wcb) = self.wcb.as_ref() else {
                    return;
                };
                let window = wcb.readable();
                if !window.is_empty() {
                    let n = unsafe {
                        libc::send(
                            fd,
                            window.as_ptr() as *const libc::c_void,
                            window.len(),
                            libc::MSG_NOSIGNAL,
                        )
                    };
                    if n > 0 {
                        wcb.commit_read(n as usize);
                        Step::Continue
                    } else if n == 0 {
                        Step::Close
                    } else {
                        let err = io::Error::last_os_error();
                        let errno = err.raw_os_error();
                        if errno == Some(libc::EAGAIN) || errno == Some(libc::EWOULDBLOCK) {
                            Step::Yield
                        } else if errno == Some(libc::EINTR) {
                            Step::Continue
                        } else {
                            log::debug!("send on fd {fd}: {err}");
                            Step::Close
                        }
                    }
                } else {
                    // Outbound ring dry: ask the user for more.
                    let window = wcb.writable();
                    let buf = unsafe { window.as_mut_slice() };
                    let mut ctx = ConnCtx {
                        dispatcher: &mut *dispatcher,
                        write_ring: Some(wcb),
                        fd,
                    };
                    let n = self.handler.on_write(&mut ctx, buf);
                    // A handler may also produce by pushing into the ring
                    // through the ctx; either form counts as progress.
                    if wcb.commit_write(n.min(buf.len())) == 0 && wcb.readable().is_empty() {
                        Step::Close
                    } else {
                        Step::Continue
                    }
                }
            };
            match step {
                Step::Continue => continue,
                Step::Yield => return,
                Step::Close => {
                    self.close(dispatcher, false);
                    return;
                }
            }
        }
    }
}
