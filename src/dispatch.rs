// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Single-threaded readiness multiplexer over epoll. Three subscription
// kinds: edge-triggered I/O listeners, per-iteration loop-tick listeners,
// and deadline-ordered timeout listeners in a min-heap.

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fd::FileDescriptor;

/// I/O event interest for an [`IoListener`] subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
    ReadWrite,
}

impl Event {
    fn bits(self) -> u32 {
        match self {
            Event::Read => libc::EPOLLIN as u32,
            Event::Write => libc::EPOLLOUT as u32,
            Event::ReadWrite => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }
}

/// A listener bound to one file descriptor. Registration is
/// edge-triggered: after a readiness callback the kernel stays silent
/// until the next not-ready → ready transition, so callbacks must drain
/// until would-block.
///
/// Remote-close conditions (`EPOLLHUP`/`EPOLLERR`/`EPOLLRDHUP`) are
/// delivered through `on_readable` so the listener discovers them by
/// draining.
pub trait IoListener {
    fn fd(&self) -> RawFd;
    fn on_readable(&mut self, dispatcher: &mut Dispatcher);
    fn on_writable(&mut self, dispatcher: &mut Dispatcher);
}

/// Invoked once per loop iteration, before the readiness wait.
pub trait LoopListener {
    fn on_loop(&mut self, dispatcher: &mut Dispatcher);
}

/// Invoked when its deadline passes. Return `true` to re-arm one
/// interval from `now`, `false` to drop the subscription.
pub trait TimeoutListener {
    fn on_timeout(&mut self, now: Instant, dispatcher: &mut Dispatcher) -> bool;
}

struct TimeoutEntry {
    deadline: Instant,
    interval: Duration,
    listener: Rc<RefCell<dyn TimeoutListener>>,
}

// Min-heap by deadline under std's max-heap.
impl PartialEq for TimeoutEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimeoutEntry {}

impl PartialOrd for TimeoutEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeoutEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

const MAX_EVENTS: usize = 64;

const CLOSE_BITS: u32 = (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;

/// Single-threaded event dispatcher.
///
/// All registration and dispatch happens on one thread. Callbacks may
/// re-enter the registration APIs (including unregistering themselves);
/// they must not re-enter [`run_once`](Dispatcher::run_once).
///
/// The dispatcher holds an `Rc` to every registered listener, so a
/// subscription keeps its listener alive until it is unregistered (or,
/// for timeouts, until the listener declines to repeat).
pub struct Dispatcher {
    epoll: FileDescriptor,
    io_listeners: HashMap<RawFd, Rc<RefCell<dyn IoListener>>>,
    loop_listeners: Vec<Rc<RefCell<dyn LoopListener>>>,
    timeouts: BinaryHeap<TimeoutEntry>,
    running: bool,
    dispatching: bool,
}

impl Dispatcher {
    pub fn new() -> Result<Self> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw == -1 {
            return Err(Error::os("epoll_create1"));
        }
        Ok(Self {
            epoll: FileDescriptor::new(raw),
            io_listeners: HashMap::new(),
            loop_listeners: Vec::new(),
            timeouts: BinaryHeap::new(),
            running: false,
            dispatching: false,
        })
    }

    /// Register an I/O listener, edge-triggered, for `event`. At most one
    /// subscription per descriptor; a second registration fails with the
    /// kernel's `EEXIST`.
    pub fn register_io(
        &mut self,
        listener: Rc<RefCell<dyn IoListener>>,
        event: Event,
    ) -> Result<()> {
        let fd = listener.borrow().fd();
        let mut ev = libc::epoll_event {
            events: event.bits() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let err = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev)
        };
        if err != 0 {
            return Err(Error::syscall("epoll_ctl(EPOLL_CTL_ADD)", fd));
        }
        self.io_listeners.insert(fd, listener);
        Ok(())
    }

    /// Change an existing I/O subscription's interest set.
    pub fn modify_io(&mut self, fd: RawFd, event: Event) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: event.bits() | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        let err = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut ev)
        };
        if err != 0 {
            return Err(Error::syscall("epoll_ctl(EPOLL_CTL_MOD)", fd));
        }
        Ok(())
    }

    /// Remove an I/O subscription. Takes effect immediately; safe to call
    /// from the listener's own callback.
    pub fn unregister_io(&mut self, fd: RawFd) -> Result<()> {
        let err = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if err != 0 {
            return Err(Error::syscall("epoll_ctl(EPOLL_CTL_DEL)", fd));
        }
        self.io_listeners.remove(&fd);
        Ok(())
    }

    /// Register a loop-tick listener. Duplicate registrations of the same
    /// listener are ignored.
    pub fn register_loop(&mut self, listener: Rc<RefCell<dyn LoopListener>>) {
        if !self
            .loop_listeners
            .iter()
            .any(|l| Rc::ptr_eq(l, &listener))
        {
            self.loop_listeners.push(listener);
        }
    }

    pub fn unregister_loop(&mut self, listener: &Rc<RefCell<dyn LoopListener>>) {
        self.loop_listeners.retain(|l| !Rc::ptr_eq(l, listener));
    }

    /// Arm a timeout listener one `interval` from now. The listener
    /// re-arms itself by returning `true` from `on_timeout`.
    pub fn register_timeout(&mut self, listener: Rc<RefCell<dyn TimeoutListener>>, interval: Duration) {
        self.timeouts.push(TimeoutEntry {
            deadline: Instant::now() + interval,
            interval,
            listener,
        });
    }

    /// Number of live I/O subscriptions.
    pub fn registered_io(&self) -> usize {
        self.io_listeners.len()
    }

    /// Number of armed timeout entries.
    pub fn pending_timeouts(&self) -> usize {
        self.timeouts.len()
    }

    /// Stop [`run_loop`](Dispatcher::run_loop) after the current
    /// iteration. Callable from any callback.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Run iterations until [`stop`](Dispatcher::stop) is called or an
    /// iteration fails.
    pub fn run_loop(&mut self, poll_timeout: Duration) -> Result<()> {
        self.running = true;
        while self.running {
            self.run_once(poll_timeout)?;
        }
        Ok(())
    }

    /// One iteration: loop ticks, readiness wait, I/O dispatch, timeout
    /// dispatch — in that order. An interrupted wait returns early; a
    /// failed wait is fatal.
    pub fn run_once(&mut self, poll_timeout: Duration) -> Result<()> {
        debug_assert!(!self.dispatching, "run_once re-entered from a callback");
        self.dispatching = true;
        let result = self.run_once_inner(poll_timeout);
        self.dispatching = false;
        result
    }

    fn run_once_inner(&mut self, poll_timeout: Duration) -> Result<()> {
        // Loop ticks, in registration order. Clone so listeners may
        // re-enter registration APIs.
        let ticks: Vec<_> = self.loop_listeners.clone();
        for listener in &ticks {
            listener.borrow_mut().on_loop(self);
        }

        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let millis = poll_timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                millis,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            log::error!("epoll_wait failed, stopping dispatch: {err}");
            return Err(Error::Syscall {
                syscall: "epoll_wait",
                fd: self.epoll.as_raw_fd(),
                source: err,
            });
        }

        for event in &events[..n as usize] {
            let fd = event.u64 as RawFd;
            // Looked up per event: a listener unregistered earlier in this
            // batch (e.g. by closing) must not be dispatched again.
            let Some(listener) = self.io_listeners.get(&fd).cloned() else {
                continue;
            };
            if event.events & (libc::EPOLLIN as u32 | CLOSE_BITS) != 0 {
                listener.borrow_mut().on_readable(self);
            }
            if event.events & libc::EPOLLOUT as u32 != 0 {
                // Re-fetch: the read callback may have unregistered this
                // descriptor or replaced its listener.
                if let Some(listener) = self.io_listeners.get(&fd).cloned() {
                    listener.borrow_mut().on_writable(self);
                }
            }
        }

        self.dispatch_timeouts(Instant::now());
        Ok(())
    }

    /// Pop and fire every timeout whose deadline has passed; listeners
    /// that return `true` are re-armed at `now + interval`.
    fn dispatch_timeouts(&mut self, now: Instant) {
        while self.timeouts.peek().is_some_and(|top| top.deadline <= now) {
            let Some(entry) = self.timeouts.pop() else {
                break;
            };
            let repeat = entry.listener.borrow_mut().on_timeout(now, self);
            if repeat {
                self.timeouts.push(TimeoutEntry {
                    deadline: now + entry.interval,
                    interval: entry.interval,
                    listener: entry.listener,
                });
            }
        }
    }
}
