//! Shared harness for fluree-db-federation integration tests.
//!
//! `FakeMember` stands in for a federation member: each operand label maps to
//! a table of rows, and `evaluate` returns the rows compatible with the
//! pre-bound solution. Every stream it hands out is tracked so tests can check
//! that joins close what they open.

// Not every test crate uses every helper.
#![allow(dead_code)]

pub mod span_capture;

use fluree_db_federation::{
    var_set, Binding, BoxedStream, FederatedOperand, FederationError, RemoteEvaluator,
    ResultStream, Value, VarSet, VecStream, BOUND_JOIN_INDEX_VAR,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// Binding helpers
// =============================================================================

/// Binding of integer values
pub fn row(pairs: &[(&str, i64)]) -> Binding {
    pairs.iter().map(|(k, v)| (*k, Value::Long(*v))).collect()
}

/// One `{x = v}` binding per value
pub fn xs(values: &[i64]) -> Vec<Binding> {
    values.iter().map(|v| row(&[("x", *v)])).collect()
}

pub fn left(rows: Vec<Binding>) -> BoxedStream {
    VecStream::new(rows).boxed()
}

pub fn operand(label: &str, vars: &[&str]) -> FederatedOperand {
    FederatedOperand::new(
        label,
        "http://member.example.org/sparql",
        format!("SELECT * WHERE {{ # {} }}", label),
        var_set(vars.iter().copied()),
    )
}

/// Order-insensitive view of a result, for multiset comparison
pub fn multiset(rows: &[Binding]) -> Vec<String> {
    let mut out: Vec<String> = rows.iter().map(|r| format!("{:?}", r)).collect();
    out.sort();
    out
}

/// Reference sequential nested loop join
pub fn naive_join(left: &[Binding], table: &[Binding]) -> Vec<Binding> {
    left.iter()
        .flat_map(|l| table.iter().filter_map(move |r| r.merge(l)))
        .collect()
}

/// Poll until `cond` holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// =============================================================================
// Stream tracking
// =============================================================================

#[derive(Debug, Default)]
pub struct StreamTracker {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl StreamTracker {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// True once every stream handed out has been closed
    pub fn all_closed(&self) -> bool {
        self.opened() == self.closed()
    }
}

struct TrackedStream {
    inner: VecStream,
    tracker: Arc<StreamTracker>,
    closed: bool,
}

impl ResultStream for TrackedStream {
    fn next(&mut self) -> fluree_db_federation::Result<Option<Binding>> {
        self.inner.next()
    }

    fn close(&mut self) -> fluree_db_federation::Result<()> {
        if !self.closed {
            self.closed = true;
            self.tracker.closed.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.close()
    }
}

// =============================================================================
// Fake federation member
// =============================================================================

/// In-memory federation member with call accounting
#[derive(Default)]
pub struct FakeMember {
    tables: HashMap<String, Vec<Binding>>,
    delay: Duration,
    fail_on_x: Option<i64>,
    pub calls: AtomicUsize,
    pub bound_join_blocks: Mutex<Vec<usize>>,
    pub evaluated: Mutex<Vec<Binding>>,
    pub streams: Arc<StreamTracker>,
}

impl FakeMember {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, label: &str, rows: Vec<Binding>) -> Self {
        self.tables.insert(label.to_string(), rows);
        self
    }

    /// Sleep this long in every remote call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail any call whose pre-bound `?x` equals `x`
    pub fn failing_on_x(mut self, x: i64) -> Self {
        self.fail_on_x = Some(x);
        self
    }

    pub fn into_arc(self) -> Arc<FakeMember> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn rows_for(&self, operand: &FederatedOperand, binding: &Binding) -> fluree_db_federation::Result<Vec<Binding>> {
        if let (Some(bad), Some(x)) = (self.fail_on_x, binding.get("x").and_then(Value::as_long)) {
            if bad == x {
                return Err(FederationError::remote(
                    "evaluate",
                    format!("member rejected ?x = {}", x),
                ));
            }
        }
        let table = self.tables.get(operand.label()).map(Vec::as_slice).unwrap_or(&[]);
        Ok(table
            .iter()
            .filter(|r| r.is_compatible(binding))
            .cloned()
            .collect())
    }

    fn tracked(&self, rows: Vec<Binding>) -> BoxedStream {
        self.streams.opened.fetch_add(1, Ordering::SeqCst);
        Box::new(TrackedStream {
            inner: VecStream::new(rows),
            tracker: Arc::clone(&self.streams),
            closed: false,
        })
    }

    fn pause(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
    }
}

impl RemoteEvaluator for FakeMember {
    fn evaluate(
        &self,
        operand: &FederatedOperand,
        binding: &Binding,
    ) -> fluree_db_federation::Result<BoxedStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.evaluated.lock().push(binding.clone());
        self.pause();
        let rows = self.rows_for(operand, binding)?;
        Ok(self.tracked(rows))
    }

    fn evaluate_bound_join(
        &self,
        operand: &FederatedOperand,
        bindings: &[Binding],
        _join_vars: &VarSet,
    ) -> fluree_db_federation::Result<BoxedStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bound_join_blocks.lock().push(bindings.len());
        self.pause();
        let mut rows = Vec::new();
        for (idx, binding) in bindings.iter().enumerate() {
            for r in self.rows_for(operand, binding)? {
                rows.push(r.with_value(BOUND_JOIN_INDEX_VAR, Value::Long(idx as i64)));
            }
        }
        Ok(self.tracked(rows))
    }
}
