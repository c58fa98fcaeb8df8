//! Pluggable custom aggregates
//!
//! Custom aggregate functions are identified by IRI and resolved through an
//! [`AggregateServiceRegistry`]. An [`AggregateServiceDispatcher`] is created
//! per group: it evaluates the argument expression for each input row,
//! optionally deduplicates (DISTINCT), and hands the collected values to the
//! service when the group is finished.

use crate::binding::Binding;
use crate::error::{FederationError, Result};
use crate::expression::ExprRef;
use crate::value::{compare_values, Value};
use indexmap::IndexSet;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// IRI of the built-in median aggregate
pub const MEDIAN_AGGREGATE_IRI: &str = "https://ns.flur.ee/aggregate#median";

/// A custom aggregate function
///
/// Receives every collected argument value (`None` for unbound or failed
/// evaluations) and returns one or more output values.
pub trait AggregateService: Send + Sync {
    fn evaluate(&self, values: Vec<Option<Value>>) -> Result<Vec<Option<Value>>>;
}

/// Resolves aggregate IRIs to services
pub trait AggregateServiceRegistry: Send + Sync {
    fn resolve(&self, key: &str) -> Option<Arc<dyn AggregateService>>;
}

/// Registry backed by an in-memory map
#[derive(Default)]
pub struct InMemoryAggregateRegistry {
    services: RwLock<FxHashMap<String, Arc<dyn AggregateService>>>,
}

impl InMemoryAggregateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in aggregates registered
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(MEDIAN_AGGREGATE_IRI, Arc::new(MedianAggregate));
        registry
    }

    /// Register (or replace) the service for `key`
    pub fn register(&self, key: impl Into<String>, service: Arc<dyn AggregateService>) {
        self.services.write().insert(key.into(), service);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.services.read().contains_key(key)
    }
}

impl AggregateServiceRegistry for InMemoryAggregateRegistry {
    fn resolve(&self, key: &str) -> Option<Arc<dyn AggregateService>> {
        self.services.read().get(key).cloned()
    }
}

impl fmt::Debug for InMemoryAggregateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let services = self.services.read();
        let mut keys: Vec<&String> = services.keys().collect();
        keys.sort();
        f.debug_struct("InMemoryAggregateRegistry")
            .field("keys", &keys)
            .finish()
    }
}

/// Collected argument values for one group
enum Collected {
    All(Vec<Option<Value>>),
    Distinct(IndexSet<Option<Value>>),
}

/// Accumulates rows for one custom aggregate evaluation
pub struct AggregateServiceDispatcher {
    key: String,
    expr: ExprRef,
    service: Arc<dyn AggregateService>,
    values: Collected,
}

impl AggregateServiceDispatcher {
    /// Resolve `key` and prepare an empty accumulator
    pub fn new(
        key: &str,
        expr: ExprRef,
        distinct: bool,
        registry: &dyn AggregateServiceRegistry,
    ) -> Result<Self> {
        let service = registry
            .resolve(key)
            .ok_or_else(|| FederationError::UnknownAggregate(key.to_string()))?;
        let values = if distinct {
            Collected::Distinct(IndexSet::new())
        } else {
            Collected::All(Vec::new())
        };
        Ok(Self {
            key: key.to_string(),
            expr,
            service,
            values,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Evaluate the argument for `row`; a failed evaluation counts as unbound
    pub fn accumulate(&mut self, row: &Binding) {
        let value = match self.expr.evaluate(row) {
            Ok(v) => v,
            Err(e) => {
                tracing::trace!(aggregate = %self.key, error = %e, "aggregate argument failed");
                None
            }
        };
        match &mut self.values {
            Collected::All(values) => values.push(value),
            Collected::Distinct(values) => {
                values.insert(value);
            }
        }
    }

    /// Number of collected values (after DISTINCT)
    pub fn len(&self) -> usize {
        match &self.values {
            Collected::All(values) => values.len(),
            Collected::Distinct(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand the collected values to the service
    pub fn finish(self) -> Result<Vec<Option<Value>>> {
        let values = match self.values {
            Collected::All(values) => values,
            Collected::Distinct(values) => values.into_iter().collect(),
        };
        self.service.evaluate(values)
    }
}

/// Upper median: the element at `len / 2` after ordering, no averaging
///
/// Empty input yields a single unbound value.
#[derive(Debug, Clone, Copy, Default)]
pub struct MedianAggregate;

impl AggregateService for MedianAggregate {
    fn evaluate(&self, mut values: Vec<Option<Value>>) -> Result<Vec<Option<Value>>> {
        if values.is_empty() {
            return Ok(vec![None]);
        }
        values.sort_by(|a, b| compare_values(a.as_ref(), b.as_ref()));
        let mid = values.len() / 2;
        Ok(vec![values.swap_remove(mid)])
    }
}
