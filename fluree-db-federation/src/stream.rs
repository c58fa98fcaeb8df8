//! Result stream trait and basic stream implementations
//!
//! Every join strategy, remote response and materialized buffer is exposed
//! as a [`ResultStream`]: a pull iterator over [`Binding`]s with an explicit,
//! idempotent `close`. Strategies compose streams by wrapping a delegate
//! rather than by sharing a base type.
//!
//! `next`/`close` take `&mut self` and belong to the single consumer. Closing
//! from a different thread goes through a [`CloseHandle`], which concurrent
//! strategies hand out via [`ResultStream::close_handle`].

use crate::binding::Binding;
use crate::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pull-based stream of solutions
///
/// Call `next` until it returns `Ok(None)`, then `close`. `close` may be
/// called at any point, any number of times; after the first call `next`
/// returns `Ok(None)`.
pub trait ResultStream: Send {
    /// Pull the next solution, `Ok(None)` once exhausted or closed
    fn next(&mut self) -> Result<Option<Binding>>;

    /// Release resources held by the stream
    fn close(&mut self) -> Result<()>;

    /// Thread-safe close capability, for streams that own background work
    fn close_handle(&self) -> Option<CloseHandle> {
        None
    }
}

/// Boxed stream for dynamic dispatch
pub type BoxedStream = Box<dyn ResultStream>;

impl<S: ResultStream + ?Sized> ResultStream for Box<S> {
    fn next(&mut self) -> Result<Option<Binding>> {
        (**self).next()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        (**self).close_handle()
    }
}

/// Something that can be closed through a shared reference from any thread
pub trait Closeable: Send + Sync {
    fn close(&self);
}

/// Cloneable handle closing a stream from another thread
#[derive(Clone)]
pub struct CloseHandle {
    target: Arc<dyn Closeable>,
}

impl CloseHandle {
    pub fn new(target: Arc<dyn Closeable>) -> Self {
        Self { target }
    }

    pub fn close(&self) {
        self.target.close();
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle").finish_non_exhaustive()
    }
}

/// Exactly-once close guard shared between threads
///
/// `close` returns `true` for exactly one caller, however many threads race.
#[derive(Clone, Debug, Default)]
pub struct CloseFlag(Arc<AtomicBool>);

impl CloseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark closed; `true` only for the call that performed the transition
    pub fn close(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Close a stream, logging and discarding any secondary error
pub fn close_quietly<S: ResultStream + ?Sized>(stream: &mut S, context: &'static str) {
    if let Err(e) = stream.close() {
        tracing::debug!(error = %e, context, "ignoring error while closing stream");
    }
}

/// Drain a stream into a Vec, closing it on every exit path
pub fn collect_all<S: ResultStream + ?Sized>(stream: &mut S) -> Result<Vec<Binding>> {
    let mut rows = Vec::new();
    loop {
        match stream.next() {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break,
            Err(e) => {
                close_quietly(stream, "collect_all");
                return Err(e);
            }
        }
    }
    stream.close()?;
    Ok(rows)
}

/// Stream over an owned list of solutions
#[derive(Debug)]
pub struct VecStream {
    rows: std::vec::IntoIter<Binding>,
    closed: bool,
}

impl VecStream {
    pub fn new(rows: Vec<Binding>) -> Self {
        Self {
            rows: rows.into_iter(),
            closed: false,
        }
    }

    /// Stream yielding no solutions
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Stream yielding exactly one solution
    pub fn single(row: Binding) -> Self {
        Self::new(vec![row])
    }

    pub fn boxed(self) -> BoxedStream {
        Box::new(self)
    }
}

impl ResultStream for VecStream {
    fn next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.next())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Adds `has_next` look-ahead to any stream
pub struct PeekableStream<S> {
    inner: S,
    peeked: Option<Binding>,
}

impl<S: ResultStream> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            peeked: None,
        }
    }

    /// True if another solution is available; may block on the inner stream
    pub fn has_next(&mut self) -> Result<bool> {
        if self.peeked.is_none() {
            self.peeked = self.inner.next()?;
        }
        Ok(self.peeked.is_some())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ResultStream> ResultStream for PeekableStream<S> {
    fn next(&mut self) -> Result<Option<Binding>> {
        match self.peeked.take() {
            Some(row) => Ok(Some(row)),
            None => self.inner.next(),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.peeked = None;
        self.inner.close()
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        self.inner.close_handle()
    }
}

/// Joins each row of `inner` with a fixed binding
///
/// Rows keep their own values; variables of `binding` missing from a row are
/// filled in.
pub struct ExtendingStream {
    inner: BoxedStream,
    binding: Binding,
}

impl ExtendingStream {
    pub fn new(inner: BoxedStream, binding: Binding) -> Self {
        Self { inner, binding }
    }
}

impl ResultStream for ExtendingStream {
    fn next(&mut self) -> Result<Option<Binding>> {
        Ok(self
            .inner
            .next()?
            .map(|row| row.extend_missing(&self.binding)))
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        self.inner.close_handle()
    }
}
