//! Block bound join
//!
//! `BlockBoundJoin` sends left bindings to the remote member in blocks, one
//! request per block, instead of one request per binding. Response rows carry
//! an `__index` tag naming the block position they answer; a demultiplexing
//! stream strips the tag and merges the row with its original binding.
//!
//! The very first binding is sent on its own through plain `evaluate`, which
//! gets first results to the consumer quickly. Subsequent blocks start small
//! and grow once enough bindings have been processed
//! (see [`FederationConfig::bound_join_block_for`]).
//!
//! A single producer thread issues every request and enqueues the resulting
//! streams in order, so output preserves left-to-right order.

use crate::binding::{Binding, JoinVars, VarSet};
use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::join_cursor::{Dispatch, JoinCursor, JoinShared};
use crate::remote::{FederatedOperand, RemoteEvaluator, BOUND_JOIN_INDEX_VAR};
use crate::stream::{close_quietly, BoxedStream, CloseHandle, ExtendingStream, ResultStream};
use std::sync::Arc;
use std::time::Duration;

pub struct BlockBoundJoin {
    cursor: JoinCursor,
}

impl BlockBoundJoin {
    pub fn new(
        left: BoxedStream,
        right: FederatedOperand,
        evaluator: Arc<dyn RemoteEvaluator>,
        config: &FederationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let span = tracing::debug_span!("block_bound_join", operand = %right.label());
        let dispatch = Blocks {
            right,
            evaluator,
            config: config.clone(),
            join_vars: None,
            block: Vec::new(),
            processed: 0,
        };
        let cursor = JoinCursor::start_single(left, dispatch, config, "bound-join", span)?;
        Ok(Self { cursor })
    }

    /// Wait until the join's producer threads have exited, `false` on timeout
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.cursor.await_termination(timeout)
    }
}

impl ResultStream for BlockBoundJoin {
    fn next(&mut self) -> Result<Option<Binding>> {
        self.cursor.next()
    }

    fn close(&mut self) -> Result<()> {
        self.cursor.close()
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        self.cursor.close_handle()
    }
}

struct Blocks {
    right: FederatedOperand,
    evaluator: Arc<dyn RemoteEvaluator>,
    config: FederationConfig,
    /// Fixed on the first binding
    join_vars: Option<VarSet>,
    block: Vec<Binding>,
    /// Bindings handed to the remote side so far
    processed: usize,
}

impl Blocks {
    fn send_block(&mut self, ctx: &JoinShared) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block: Arc<[Binding]> = std::mem::take(&mut self.block).into();
        let empty = VarSet::new();
        let join_vars = self.join_vars.as_ref().unwrap_or(&empty);
        tracing::trace!(block_size = block.len(), "sending bound join block");

        let stream = self
            .evaluator
            .evaluate_bound_join(&self.right, &block, join_vars)?;
        self.processed += block.len();
        let mut demux: BoxedStream = Box::new(BoundJoinDemux::new(stream, block));
        if ctx.is_stopping() {
            close_quietly(&mut demux, "bound join block");
            return Ok(());
        }
        ctx.publish(demux);
        Ok(())
    }
}

impl Dispatch for Blocks {
    fn dispatch(&mut self, binding: Binding, ctx: &Arc<JoinShared>) -> Result<()> {
        if self.join_vars.is_none() {
            self.join_vars =
                Some(JoinVars::between(&binding, self.right.free_vars()).to_var_set());
            let stream = self.evaluator.evaluate(&self.right, &binding)?;
            self.processed += 1;
            ctx.publish(Box::new(ExtendingStream::new(stream, binding)));
            return Ok(());
        }

        self.block.push(binding);
        if self.block.len() >= self.config.bound_join_block_for(self.processed) {
            self.send_block(ctx)?;
        }
        Ok(())
    }

    fn finish(&mut self, ctx: &Arc<JoinShared>) -> Result<()> {
        self.send_block(ctx)
    }
}

/// Maps `__index`-tagged response rows back onto their block bindings
pub struct BoundJoinDemux {
    inner: BoxedStream,
    block: Arc<[Binding]>,
}

impl BoundJoinDemux {
    pub fn new(inner: BoxedStream, block: Arc<[Binding]>) -> Self {
        Self { inner, block }
    }

    fn resolve(&self, row: Binding) -> Result<Binding> {
        let index = row
            .get(BOUND_JOIN_INDEX_VAR)
            .and_then(|v| v.as_long())
            .ok_or_else(|| {
                FederationError::InvalidBoundJoinRow(format!(
                    "row without usable {}: {:?}",
                    BOUND_JOIN_INDEX_VAR,
                    row.get(BOUND_JOIN_INDEX_VAR)
                ))
            })?;
        let original = usize::try_from(index)
            .ok()
            .and_then(|i| self.block.get(i))
            .ok_or_else(|| {
                FederationError::InvalidBoundJoinRow(format!(
                    "{} {} outside block of {}",
                    BOUND_JOIN_INDEX_VAR,
                    index,
                    self.block.len()
                ))
            })?;
        Ok(row.without(BOUND_JOIN_INDEX_VAR).extend_missing(original))
    }
}

impl ResultStream for BoundJoinDemux {
    fn next(&mut self) -> Result<Option<Binding>> {
        match self.inner.next()? {
            Some(row) => self.resolve(row).map(Some),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        self.inner.close_handle()
    }
}
