//! Eager result buffering
//!
//! `ResultMaterializer` drains a stream into memory so it can be replayed any
//! number of times. The buffer is frozen into an `Arc<[Binding]>` before any
//! cursor is handed out; cursors share it read-only across threads.
//!
//! Memory use is proportional to the full result; there is no spilling.

use crate::binding::Binding;
use crate::error::Result;
use crate::stream::{close_quietly, BoxedStream, ResultStream};
use std::sync::Arc;

pub struct ResultMaterializer;

impl ResultMaterializer {
    /// Drain `source` to exhaustion; the source is closed on every path
    pub fn materialize<S: ResultStream + ?Sized>(source: &mut S) -> Result<MaterializedResult> {
        let mut rows = Vec::new();
        loop {
            match source.next() {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break,
                Err(e) => {
                    close_quietly(source, "materialize");
                    return Err(e);
                }
            }
        }
        source.close()?;
        tracing::trace!(rows = rows.len(), "materialized result");
        Ok(MaterializedResult::new(rows))
    }

    /// Materialize an owned stream
    pub fn materialize_boxed(mut source: BoxedStream) -> Result<MaterializedResult> {
        Self::materialize(&mut source)
    }
}

/// Frozen, shareable result buffer
#[derive(Clone, Debug, Default)]
pub struct MaterializedResult {
    rows: Arc<[Binding]>,
}

impl MaterializedResult {
    pub fn new(rows: Vec<Binding>) -> Self {
        Self { rows: rows.into() }
    }

    pub fn rows(&self) -> &[Binding] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fresh cursor from the first row
    pub fn cursor(&self) -> MaterializedCursor {
        MaterializedCursor {
            rows: Arc::clone(&self.rows),
            pos: 0,
            closed: false,
        }
    }
}

/// Independent read position over a `MaterializedResult`
#[derive(Debug)]
pub struct MaterializedCursor {
    rows: Arc<[Binding]>,
    pos: usize,
    closed: bool,
}

impl MaterializedCursor {
    pub fn boxed(self) -> BoxedStream {
        Box::new(self)
    }
}

impl ResultStream for MaterializedCursor {
    fn next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
