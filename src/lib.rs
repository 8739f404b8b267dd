// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Systems primitives for single-host Linux network services: an
// edge-triggered epoll dispatcher, TCP listeners/connections layered over
// mirror-mapped circular buffers, a process-shareable SP/SC ring, and a
// time-indexed LRU cache, plus the small value types they lean on.

pub mod shm_name;

mod error;
pub use error::{Error, Result};

mod fd;
pub use fd::FileDescriptor;

mod ring;
pub use ring::{MirrorRing, RingSlice};

mod lru;
pub use lru::{EntryRef, LruCache};

mod dispatch;
pub use dispatch::{Dispatcher, Event, IoListener, LoopListener, TimeoutListener};

mod tcp;
pub use tcp::{ConnCtx, ConnectionHandler, PeerAddr, TcpConnection, TcpListener};

pub mod chunked;
pub mod hex;

mod task_queue;
pub use task_queue::TaskQueue;
