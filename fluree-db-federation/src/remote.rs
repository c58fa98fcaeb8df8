//! Remote evaluation seam
//!
//! A [`FederatedOperand`] is the right-hand side of a federated join: a query
//! fragment that runs on one federation member. Execution is delegated to a
//! host-supplied [`RemoteEvaluator`]; this crate never speaks the wire
//! protocol itself.
//!
//! Streams returned by a transport-backed evaluator should be wrapped in a
//! [`RemoteResultStream`], which normalises iteration failures and swallows
//! the transport noise produced by closing a partially read response.

use crate::binding::{Binding, VarSet};
use crate::error::{FederationError, Result};
use crate::stream::{close_quietly, BoxedStream, CloseHandle, ResultStream, VecStream};
use std::fmt;
use std::sync::Arc;

/// Right operand of a federated join
#[derive(Clone, PartialEq, Eq)]
pub struct FederatedOperand {
    label: Arc<str>,
    endpoint: Arc<str>,
    query: Arc<str>,
    free_vars: VarSet,
}

impl FederatedOperand {
    pub fn new(
        label: impl Into<Arc<str>>,
        endpoint: impl Into<Arc<str>>,
        query: impl Into<Arc<str>>,
        free_vars: VarSet,
    ) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
            query: query.into(),
            free_vars,
        }
    }

    /// Short name used in logs and spans
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Federation member the operand runs on
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Rendered query text sent to the member
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Variables the operand can bind
    pub fn free_vars(&self) -> &VarSet {
        &self.free_vars
    }

    /// True when the operand mentions any of `vars`
    pub fn shares_vars(&self, vars: &VarSet) -> bool {
        !self.free_vars.is_disjoint(vars)
    }
}

impl fmt::Debug for FederatedOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederatedOperand")
            .field("label", &self.label)
            .field("endpoint", &self.endpoint)
            .field("free_vars", &self.free_vars)
            .finish_non_exhaustive()
    }
}

/// Name of the position tag carried by bound-join response rows
pub const BOUND_JOIN_INDEX_VAR: &str = "__index";

/// Executes federated operands against their members
///
/// Implementations must be safe for concurrent use: join cursors call them
/// from many worker threads at once.
pub trait RemoteEvaluator: Send + Sync {
    /// Evaluate `operand` with `binding` pre-bound
    ///
    /// Returned rows may omit variables of `binding`; the join layer fills
    /// them in.
    fn evaluate(&self, operand: &FederatedOperand, binding: &Binding) -> Result<BoxedStream>;

    /// Evaluate `operand` once for a block of bindings
    ///
    /// Every returned row must carry [`BOUND_JOIN_INDEX_VAR`] set to the
    /// position of the binding it answers within `bindings`.
    fn evaluate_bound_join(
        &self,
        operand: &FederatedOperand,
        bindings: &[Binding],
        join_vars: &VarSet,
    ) -> Result<BoxedStream>;

    /// Join the rows of `left` with `right`
    ///
    /// The default is an eager sequential nested loop over
    /// [`RemoteEvaluator::evaluate`]: rows of `right` win over left values
    /// and incompatible pairs are dropped. `left` is closed on every path.
    fn evaluate_join(
        &self,
        mut left: BoxedStream,
        right: &FederatedOperand,
        bound_vars: &VarSet,
    ) -> Result<BoxedStream> {
        let _ = bound_vars;
        let mut out = Vec::new();
        let result = (|| -> Result<()> {
            while let Some(row) = left.next()? {
                let mut inner = self.evaluate(right, &row)?;
                loop {
                    match inner.next() {
                        Ok(Some(r)) => {
                            if let Some(merged) = r.merge(&row) {
                                out.push(merged);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            close_quietly(&mut inner, "evaluate_join");
                            return Err(e);
                        }
                    }
                }
                inner.close()?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                left.close()?;
                Ok(VecStream::new(out).boxed())
            }
            Err(e) => {
                close_quietly(&mut left, "evaluate_join");
                Err(e)
            }
        }
    }
}

impl<E: RemoteEvaluator + ?Sized> RemoteEvaluator for Arc<E> {
    fn evaluate(&self, operand: &FederatedOperand, binding: &Binding) -> Result<BoxedStream> {
        (**self).evaluate(operand, binding)
    }

    fn evaluate_bound_join(
        &self,
        operand: &FederatedOperand,
        bindings: &[Binding],
        join_vars: &VarSet,
    ) -> Result<BoxedStream> {
        (**self).evaluate_bound_join(operand, bindings, join_vars)
    }

    fn evaluate_join(
        &self,
        left: BoxedStream,
        right: &FederatedOperand,
        bound_vars: &VarSet,
    ) -> Result<BoxedStream> {
        (**self).evaluate_join(left, right, bound_vars)
    }
}

/// Wrapper for transport-backed result streams
///
/// Iteration failures of any kind surface as `RemoteEvaluation`. Closing a
/// response that was not read to the end commonly fails with a truncated
/// chunk, a parser index error, or a reset socket; those are logged at debug
/// and dropped. Any other close failure is returned.
pub struct RemoteResultStream {
    inner: BoxedStream,
    operand: Arc<str>,
    closed: bool,
}

impl RemoteResultStream {
    pub fn new(inner: BoxedStream, operand: impl Into<Arc<str>>) -> Self {
        Self {
            inner,
            operand: operand.into(),
            closed: false,
        }
    }

    pub fn boxed(self) -> BoxedStream {
        Box::new(self)
    }
}

impl ResultStream for RemoteResultStream {
    fn next(&mut self) -> Result<Option<Binding>> {
        if self.closed {
            return Ok(None);
        }
        self.inner.next().map_err(|e| match e {
            FederationError::RemoteEvaluation { .. } | FederationError::Cancelled => e,
            other => FederationError::remote(format!("reading {}", self.operand), other),
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.inner.close() {
            Ok(()) => Ok(()),
            Err(FederationError::Transport { kind, message }) if kind.is_abandonment() => {
                tracing::debug!(
                    operand = %self.operand,
                    kind = %kind,
                    error = %message,
                    "ignoring transport error closing abandoned remote stream"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        self.inner.close_handle()
    }
}
