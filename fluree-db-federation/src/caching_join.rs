//! Nested-loop join with adjacent-run deduplication
//!
//! Left streams produced by sorted or grouped operators often repeat the same
//! join key many times in a row. `CachingAsyncNestedLoopJoin` batches such runs
//! and evaluates the right operand once per run, using the first binding of
//! the run (the "etalon"). The etalon's rows are materialized and replayed for
//! every member of the run, extended with that member's own variables.
//!
//! Only adjacent duplicates are merged; a key that reappears later in the
//! left stream triggers a new remote call.
//!
//! The join variables are fixed by the first left binding: variables that
//! later bindings bind in addition do not become part of the key.

use crate::binding::{Binding, JoinKey, JoinVars};
use crate::config::FederationConfig;
use crate::error::Result;
use crate::join_cursor::{Dispatch, JoinCursor, JoinShared};
use crate::materializer::ResultMaterializer;
use crate::remote::{FederatedOperand, RemoteEvaluator};
use crate::stream::{close_quietly, BoxedStream, CloseHandle, ExtendingStream, ResultStream};
use std::sync::Arc;
use std::time::Duration;

pub struct CachingAsyncNestedLoopJoin {
    cursor: JoinCursor,
}

impl CachingAsyncNestedLoopJoin {
    pub fn new(
        left: BoxedStream,
        right: FederatedOperand,
        evaluator: Arc<dyn RemoteEvaluator>,
        config: &FederationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let span = tracing::debug_span!(
            "caching_nested_loop_join",
            operand = %right.label(),
            workers = config.join_workers,
        );
        let dispatch = AdjacentBatches {
            right: Arc::new(right),
            evaluator,
            join_vars: None,
            batch: Vec::new(),
            batch_key: None,
        };
        let cursor = JoinCursor::start(left, dispatch, config, "caching-nlj", span)?;
        Ok(Self { cursor })
    }

    /// Wait until the join's producer threads have exited, `false` on timeout
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.cursor.await_termination(timeout)
    }
}

impl ResultStream for CachingAsyncNestedLoopJoin {
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

struct AdjacentBatches {
    right: Arc<FederatedOperand>,
    evaluator: Arc<dyn RemoteEvaluator>,
    /// Fixed on the first binding
    join_vars: Option<JoinVars>,
    batch: Vec<Binding>,
    batch_key: Option<JoinKey>,
}

impl AdjacentBatches {
    fn flush(&mut self, ctx: &Arc<JoinShared>) -> Result<()> {
        self.batch_key = None;
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let right = Arc::clone(&self.right);
        let evaluator = Arc::clone(&self.evaluator);
        ctx.submit("caching join task", move |shared| {
            // errors stop the whole cursor right away
            if let Err(e) = evaluate_batch(&*evaluator, &right, batch, shared) {
                shared.abort(e);
            }
            Ok(())
        })
    }
}

impl Dispatch for AdjacentBatches {
    fn dispatch(&mut self, binding: Binding, ctx: &Arc<JoinShared>) -> Result<()> {
        let join_vars = self
            .join_vars
            .get_or_insert_with(|| JoinVars::between(&binding, self.right.free_vars()));
        let key = join_vars.key(&binding);
        if self.batch_key.as_ref() != Some(&key) {
            self.flush(ctx)?;
            self.batch_key = Some(key);
        }
        self.batch.push(binding);
        Ok(())
    }

    fn finish(&mut self, ctx: &Arc<JoinShared>) -> Result<()> {
        self.flush(ctx)
    }
}

fn evaluate_batch(
    evaluator: &dyn RemoteEvaluator,
    right: &FederatedOperand,
    batch: Vec<Binding>,
    shared: &JoinShared,
) -> Result<()> {
    let Some(etalon) = batch.first() else {
        return Ok(());
    };

    if batch.len() == 1 {
        let mut stream = evaluator.evaluate(right, etalon)?;
        if shared.is_stopping() {
            close_quietly(&mut stream, "caching join task");
            return Ok(());
        }
        shared.publish(Box::new(ExtendingStream::new(stream, etalon.clone())));
        return Ok(());
    }

    let stream = evaluator.evaluate(right, etalon)?;
    let rows = ResultMaterializer::materialize_boxed(stream)?;
    tracing::trace!(batch = batch.len(), rows = rows.len(), "replaying etalon result");
    for member in batch {
        if shared.is_stopping() {
            break;
        }
        shared.publish(Box::new(ExtendingStream::new(rows.cursor().boxed(), member)));
    }
    Ok(())
}
