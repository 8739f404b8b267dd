// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Bounded task queue with one worker thread. Dispatcher callbacks that
// must not block hand work off here and arrange their own re-wake.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Task>,
    stopped: bool,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
    capacity: usize,
    processed: AtomicUsize,
}

/// Fixed-capacity FIFO of tasks drained by a single worker thread.
///
/// `push` never blocks: it returns `false` when the queue is full. The
/// worker parks on a condition variable while the queue is empty. Dropping
/// the queue lets already-accepted tasks finish, then joins the worker.
pub struct TaskQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity),
                stopped: false,
            }),
            available: Condvar::new(),
            capacity,
            processed: AtomicUsize::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("task-queue".into())
            .spawn(move || Self::worker_loop(&worker_shared))
            .expect("spawn task-queue worker");

        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Enqueue a task. Returns `false` (dropping nothing but the closure)
    /// when the queue is at capacity or shutting down.
    pub fn push(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped || state.queue.len() >= self.shared.capacity {
            return false;
        }
        state.queue.push_back(Box::new(task));
        drop(state);
        self.shared.available.notify_one();
        true
    }

    /// Tasks currently waiting in the queue.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    /// Tasks the worker has completed.
    pub fn processed(&self) -> usize {
        self.shared.processed.load(Ordering::Relaxed)
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let task = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if let Some(task) = state.queue.pop_front() {
                        break task;
                    }
                    if state.stopped {
                        return;
                    }
                    state = shared.available.wait(state).unwrap();
                }
            };
            task();
            shared.processed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().stopped = true;
        self.shared.available.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
