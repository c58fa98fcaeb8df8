//! Shared machinery for the threaded join cursors
//!
//! A [`JoinCursor`] owns three moving parts:
//! - a dispatcher thread that reads the left stream and hands work to a
//!   [`Dispatch`] strategy
//! - a [`WorkerPool`] running the strategy's tasks (the remote calls); the
//!   bound join has none and produces from the dispatcher thread itself
//! - a [`BoundedResultQueue`] of finished result streams, drained by the
//!   consumer in completion order
//!
//! The queue is marked done once the dispatcher has finished and no task is
//! in flight. Every stream that enters the queue is closed exactly once: by
//! the consumer after reading it, or by `close` if it is still queued.

use crate::binding::Binding;
use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::executor::{run_guarded, WorkerPool};
use crate::queue::BoundedResultQueue;
use crate::stream::{close_quietly, BoxedStream, CloseFlag, CloseHandle, Closeable, ResultStream};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::Span;

/// Per-strategy dispatch logic, driven by the dispatcher thread
pub(crate) trait Dispatch: Send + 'static {
    /// Handle one left binding
    fn dispatch(&mut self, binding: Binding, ctx: &Arc<JoinShared>) -> Result<()>;

    /// Left stream exhausted; flush any buffered work
    fn finish(&mut self, ctx: &Arc<JoinShared>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Pending {
    in_flight: usize,
    dispatch_complete: bool,
}

/// State shared by the dispatcher, the workers and the consumer
pub(crate) struct JoinShared {
    queue: BoundedResultQueue<BoxedStream>,
    /// `None` when the dispatcher thread is the only producer
    pool: Option<WorkerPool>,
    closed: CloseFlag,
    pending: Mutex<Pending>,
    left_handle: Mutex<Option<CloseHandle>>,
    /// Entered by every task
    span: Span,
}

impl JoinShared {
    /// Run `job` on the pool; an `Err` from the job is tossed to the consumer
    pub(crate) fn submit<F>(self: &Arc<Self>, what: &'static str, job: F) -> Result<()>
    where
        F: FnOnce(&Arc<JoinShared>) -> Result<()> + Send + 'static,
    {
        if self.is_stopping() {
            return Err(FederationError::Cancelled);
        }
        let Some(pool) = self.pool.as_ref() else {
            return Err(FederationError::Internal(
                "task submitted to a single-producer cursor".into(),
            ));
        };
        self.pending.lock().in_flight += 1;
        let shared = Arc::clone(self);
        let submitted = pool.submit(Box::new(move || {
            let _guard = shared.span.enter();
            if let Err(e) = run_guarded(what, || job(&shared)) {
                shared.fail(e);
            }
            shared.task_finished();
        }));
        if let Err(e) = submitted {
            self.task_finished();
            return Err(e);
        }
        Ok(())
    }

    /// Hand a finished result stream to the consumer
    ///
    /// If the cursor is already closed or failed the stream is closed here.
    pub(crate) fn publish(&self, stream: BoxedStream) {
        if let Err(mut rejected) = self.queue.put(stream) {
            close_quietly(&mut rejected, "publish after close");
        }
    }

    /// Record a producer error for the consumer's next read
    pub(crate) fn fail(&self, error: FederationError) {
        self.queue.toss(error);
    }

    /// Record an error and stop all production immediately
    ///
    /// Queued streams are closed and the pool is shut down; the error is
    /// still delivered on the consumer's next read.
    pub(crate) fn abort(&self, error: FederationError) {
        self.queue.toss(error);
        for mut stream in self.queue.drain() {
            close_quietly(&mut stream, "abort");
        }
        if let Some(pool) = self.pool.as_ref() {
            pool.shutdown_now();
        }
    }

    /// True once the cursor was closed or a producer failed
    pub(crate) fn is_stopping(&self) -> bool {
        self.closed.is_closed() || self.queue.has_failed()
    }

    fn task_finished(&self) {
        let mut pending = self.pending.lock();
        pending.in_flight = pending.in_flight.saturating_sub(1);
        if pending.in_flight == 0 && pending.dispatch_complete {
            self.queue.done();
        }
    }

    fn dispatch_finished(&self) {
        let mut pending = self.pending.lock();
        pending.dispatch_complete = true;
        if pending.in_flight == 0 {
            self.queue.done();
        }
    }

    /// Stop submission, discard queued work and close queued streams
    fn shutdown(&self) {
        if !self.closed.close() {
            return;
        }
        if let Some(pool) = self.pool.as_ref() {
            pool.shutdown_now();
        }
        if let Some(handle) = self.left_handle.lock().take() {
            handle.close();
        }
        let queued = self.queue.close();
        if !queued.is_empty() {
            tracing::debug!(streams = queued.len(), "closing queued result streams");
        }
        for mut stream in queued {
            close_quietly(&mut stream, "cursor close");
        }
    }
}

impl Closeable for JoinShared {
    fn close(&self) {
        self.shutdown();
    }
}

/// Consumer side of a threaded join
pub(crate) struct JoinCursor {
    shared: Arc<JoinShared>,
    current: Option<BoxedStream>,
    dispatcher: JoinHandle<()>,
    span: Span,
}

impl JoinCursor {
    /// Start the pool and the dispatcher thread
    ///
    /// `role` names the threads (`<prefix>-<role>-dispatch`, `<prefix>-<role>-<n>`).
    pub(crate) fn start<D: Dispatch>(
        mut left: BoxedStream,
        dispatch: D,
        config: &FederationConfig,
        role: &str,
        span: Span,
    ) -> Result<Self> {
        let pool = match WorkerPool::new(config.thread_name(role), config.join_workers) {
            Ok(pool) => pool,
            Err(e) => {
                close_quietly(&mut left, "worker pool start");
                return Err(e);
            }
        };
        Self::spawn(left, dispatch, Some(pool), config, role, span)
    }

    /// Start only the dispatcher thread, which produces every stream itself
    pub(crate) fn start_single<D: Dispatch>(
        left: BoxedStream,
        dispatch: D,
        config: &FederationConfig,
        role: &str,
        span: Span,
    ) -> Result<Self> {
        Self::spawn(left, dispatch, None, config, role, span)
    }

    fn spawn<D: Dispatch>(
        left: BoxedStream,
        dispatch: D,
        pool: Option<WorkerPool>,
        config: &FederationConfig,
        role: &str,
        span: Span,
    ) -> Result<Self> {
        let shared = Arc::new(JoinShared {
            queue: BoundedResultQueue::new(config.queue_capacity),
            pool,
            closed: CloseFlag::new(),
            pending: Mutex::new(Pending::default()),
            left_handle: Mutex::new(left.close_handle()),
            span: span.clone(),
        });

        let dispatcher_shared = Arc::clone(&shared);
        let dispatcher_span = span.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-dispatch", config.thread_name(role)))
            .spawn(move || {
                let _guard = dispatcher_span.enter();
                run_dispatch(left, dispatch, &dispatcher_shared);
            });
        let dispatcher = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                shared.shutdown();
                return Err(FederationError::WorkerSpawn(e));
            }
        };

        Ok(Self {
            shared,
            current: None,
            dispatcher,
            span,
        })
    }
}

fn run_dispatch<D: Dispatch>(mut left: BoxedStream, mut dispatch: D, shared: &Arc<JoinShared>) {
    let mut dispatched = 0usize;
    let outcome = loop {
        if shared.is_stopping() {
            break Ok(());
        }
        match left.next() {
            Ok(Some(binding)) => {
                dispatched += 1;
                if let Err(e) = dispatch.dispatch(binding, shared) {
                    break Err(e);
                }
            }
            Ok(None) => break dispatch.finish(shared),
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(()) => close_quietly(&mut left, "left stream"),
        Err(e) => {
            close_quietly(&mut left, "left stream");
            shared.fail(e);
        }
    }
    tracing::trace!(bindings = dispatched, "dispatch finished");
    shared.dispatch_finished();
}

impl ResultStream for JoinCursor {
    fn next(&mut self) -> Result<Option<Binding>> {
        let span = self.span.clone();
        let _guard = span.enter();
        loop {
            if self.shared.closed.is_closed() {
                return Ok(None);
            }
            if let Some(current) = self.current.as_mut() {
                match current.next() {
                    Ok(Some(row)) => return Ok(Some(row)),
                    Ok(None) => {
                        let mut finished = self.current.take();
                        if let Some(stream) = finished.as_mut() {
                            if let Err(e) = stream.close() {
                                self.release();
                                return Err(e);
                            }
                        }
                        continue;
                    }
                    Err(e) => {
                        self.release();
                        return Err(e);
                    }
                }
            }
            match self.shared.queue.take() {
                Ok(Some(stream)) => self.current = Some(stream),
                Ok(None) => {
                    // exhausted: the pool has no more work
                    if let Some(pool) = self.shared.pool.as_ref() {
                        pool.shutdown();
                    }
                    return Ok(None);
                }
                Err(e) => {
                    self.release();
                    return Err(e);
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        let span = self.span.clone();
        let _guard = span.enter();
        self.release();
        Ok(())
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        Some(CloseHandle::new(self.shared.clone() as Arc<dyn Closeable>))
    }
}

impl JoinCursor {
    /// Wait until the dispatcher thread and every pool worker have exited
    ///
    /// Returns `false` if they are still running after `timeout`. Threads only
    /// exit once the cursor is exhausted, failed or closed.
    pub(crate) fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.dispatcher.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        match self.shared.pool.as_ref() {
            Some(pool) => pool.await_termination(deadline.saturating_duration_since(Instant::now())),
            None => true,
        }
    }

    fn release(&mut self) {
        if let Some(mut current) = self.current.take() {
            close_quietly(&mut current, "current result stream");
        }
        self.shared.shutdown();
    }
}

impl Drop for JoinCursor {
    fn drop(&mut self) {
        self.release();
    }
}
