//! Parallel nested-loop join
//!
//! `AsyncNestedLoopJoin` evaluates the right operand once per left binding,
//! one pool task per binding. Each task's result stream joins the output as
//! soon as it is ready, so output order follows completion order, not input
//! order.

use crate::binding::Binding;
use crate::config::FederationConfig;
use crate::error::Result;
use crate::join_cursor::{Dispatch, JoinCursor, JoinShared};
use crate::remote::{FederatedOperand, RemoteEvaluator};
use crate::stream::{close_quietly, BoxedStream, CloseHandle, ExtendingStream, ResultStream};
use std::sync::Arc;
use std::time::Duration;

/// Inner join of a local binding stream with a remote operand
pub struct AsyncNestedLoopJoin {
    cursor: JoinCursor,
}

impl AsyncNestedLoopJoin {
    /// Start joining; the dispatcher and worker threads begin immediately
    pub fn new(
        left: BoxedStream,
        right: FederatedOperand,
        evaluator: Arc<dyn RemoteEvaluator>,
        config: &FederationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let span = tracing::debug_span!(
            "async_nested_loop_join",
            operand = %right.label(),
            workers = config.join_workers,
        );
        let dispatch = PerBinding {
            right: Arc::new(right),
            evaluator,
        };
        let cursor = JoinCursor::start(left, dispatch, config, "nlj", span)?;
        Ok(Self { cursor })
    }

    /// Wait until the join's producer threads have exited, `false` on timeout
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.cursor.await_termination(timeout)
    }
}

impl ResultStream for AsyncNestedLoopJoin {
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

struct PerBinding {
    right: Arc<FederatedOperand>,
    evaluator: Arc<dyn RemoteEvaluator>,
}

impl Dispatch for PerBinding {
    fn dispatch(&mut self, binding: Binding, ctx: &Arc<JoinShared>) -> Result<()> {
        let right = Arc::clone(&self.right);
        let evaluator = Arc::clone(&self.evaluator);
        ctx.submit("nested loop task", move |shared| {
            let mut stream = evaluator.evaluate(&right, &binding)?;
            if shared.is_stopping() {
                close_quietly(&mut stream, "nested loop task");
                return Ok(());
            }
            shared.publish(Box::new(ExtendingStream::new(stream, binding)));
            Ok(())
        })
    }
}
