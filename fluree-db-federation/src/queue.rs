//! Bounded producer/consumer queue with error tossing
//!
//! `BoundedResultQueue` is the backpressure and cancellation backbone of the
//! concurrent join strategies. Producers (dispatch/worker threads) `put`
//! result streams and block while the queue is full; the single consumer
//! `take`s them and blocks while it is empty.
//!
//! Besides items the queue carries two out-of-band signals:
//! - **done**: the producer side has finished; `take` returns `Ok(None)` once
//!   the remaining items are drained
//! - **toss**: a producer failed; the error is returned by the next `take`,
//!   ahead of any queued items
//!
//! `close` wakes every waiter. Afterwards `put` hands the item back (so the
//! producer can release it) and `take` returns `Ok(None)`.

use crate::error::{FederationError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// Default number of queued items before producers block
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct QueueState<T> {
    items: VecDeque<T>,
    /// No more items will be produced
    done: bool,
    /// Consumer closed the queue
    closed: bool,
    /// First tossed error, pending delivery
    error: Option<FederationError>,
    /// An error was delivered to the consumer
    failed: bool,
}

/// Fixed-capacity blocking queue (mutate `state` only under its lock)
pub struct BoundedResultQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedResultQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                done: false,
                closed: false,
                error: None,
                failed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue an item, blocking while the queue is full
    ///
    /// Returns the item back if the queue was closed, finished, or failed
    /// before it could be accepted.
    pub fn put(&self, item: T) -> std::result::Result<(), T> {
        let mut state = self.state.lock();
        loop {
            if state.closed || state.done || state.failed || state.error.is_some() {
                return Err(item);
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            self.not_full.wait(&mut state);
        }
    }

    /// Signal end of production
    pub fn done(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Hand a producer error to the consumer
    ///
    /// Only the first error is kept; `Cancelled` is dropped since it never
    /// reaches consumers.
    pub fn toss(&self, error: FederationError) {
        if error.is_cancelled() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed || state.failed || state.error.is_some() {
            tracing::debug!(error = %error, "discarding secondary producer error");
            return;
        }
        state.error = Some(error);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Dequeue the next item, blocking until one is available
    ///
    /// Returns `Err` for a tossed error (once), `Ok(None)` after `done` with an
    /// empty queue or after `close`.
    pub fn take(&self) -> Result<Option<T>> {
        let mut state = self.state.lock();
        loop {
            if let Some(error) = state.error.take() {
                state.failed = true;
                self.not_full.notify_all();
                return Err(error);
            }
            if state.closed || state.failed {
                return Ok(None);
            }
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Ok(Some(item));
            }
            if state.done {
                return Ok(None);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Close the queue, waking all waiters
    ///
    /// Returns the items still queued so the caller can release them. Only the
    /// first call returns anything.
    pub fn close(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.closed = true;
        let drained = state.items.drain(..).collect();
        self.not_empty.notify_all();
        self.not_full.notify_all();
        drained
    }

    /// Drain queued items without closing (used when failing fast)
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let drained = state.items.drain(..).collect();
        self.not_full.notify_all();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True once an error was tossed (delivered or not)
    pub fn has_failed(&self) -> bool {
        let state = self.state.lock();
        state.failed || state.error.is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
