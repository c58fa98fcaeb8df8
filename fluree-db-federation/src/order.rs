//! ORDER BY comparison for federated top-K evaluation
//!
//! `OrderComparator` compares two solutions by an ordered list of
//! [`OrderCondition`]s. Key evaluation failures never propagate: as soon as a
//! key cannot be evaluated on either side, the two solutions compare equal.
//!
//! [`PriorityElement`] caches the evaluated keys of one solution so a [`TopK`]
//! buffer does not re-evaluate expressions on every comparison.

use crate::binding::Binding;
use crate::expression::ExprRef;
use crate::value::{compare_values, Value};
use std::cmp::Ordering;
use std::fmt;

/// Sort direction for ORDER BY clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    fn apply(self, ord: Ordering) -> Ordering {
        match self {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        }
    }
}

/// One ORDER BY key
#[derive(Clone)]
pub struct OrderCondition {
    pub expr: ExprRef,
    pub direction: SortDirection,
}

impl OrderCondition {
    pub fn asc(expr: ExprRef) -> Self {
        Self {
            expr,
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(expr: ExprRef) -> Self {
        Self {
            expr,
            direction: SortDirection::Descending,
        }
    }
}

impl fmt::Debug for OrderCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderCondition")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

/// Evaluated sort key; `Err(())` marks a failed evaluation
type KeySlot = Result<Option<Value>, ()>;

#[derive(Clone, Debug, Default)]
pub struct OrderComparator {
    conditions: Vec<OrderCondition>,
}

impl OrderComparator {
    pub fn new(conditions: Vec<OrderCondition>) -> Self {
        Self { conditions }
    }

    pub fn conditions(&self) -> &[OrderCondition] {
        &self.conditions
    }

    /// Compare two solutions key by key
    pub fn compare(&self, a: &Binding, b: &Binding) -> Ordering {
        for cond in &self.conditions {
            let (ka, kb) = match (self.eval(cond, a), self.eval(cond, b)) {
                (Ok(ka), Ok(kb)) => (ka, kb),
                _ => return Ordering::Equal,
            };
            let ord = cond.direction.apply(compare_values(ka.as_ref(), kb.as_ref()));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Evaluate every key of `binding` up front
    pub fn element(&self, binding: Binding) -> PriorityElement {
        let keys = self
            .conditions
            .iter()
            .map(|cond| self.eval(cond, &binding))
            .collect();
        PriorityElement { binding, keys }
    }

    /// Compare two pre-evaluated elements; same semantics as [`Self::compare`]
    pub fn compare_elements(&self, a: &PriorityElement, b: &PriorityElement) -> Ordering {
        for (idx, cond) in self.conditions.iter().enumerate() {
            let (ka, kb) = match (a.keys.get(idx), b.keys.get(idx)) {
                (Some(Ok(ka)), Some(Ok(kb))) => (ka, kb),
                _ => return Ordering::Equal,
            };
            let ord = cond.direction.apply(compare_values(ka.as_ref(), kb.as_ref()));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn eval(&self, cond: &OrderCondition, binding: &Binding) -> KeySlot {
        cond.expr.evaluate(binding).map_err(|e| {
            tracing::trace!(error = %e, "order key evaluation failed, comparing as equal");
        })
    }
}

/// A solution with its evaluated ORDER BY keys
#[derive(Clone, Debug)]
pub struct PriorityElement {
    binding: Binding,
    keys: Vec<KeySlot>,
}

impl PriorityElement {
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn into_binding(self) -> Binding {
        self.binding
    }

    /// True if some key failed to evaluate
    pub fn has_failed_key(&self) -> bool {
        self.keys.iter().any(Result::is_err)
    }
}

/// Keeps the `limit` best solutions seen so far, in ORDER BY order
///
/// Ties keep arrival order.
#[derive(Debug)]
pub struct TopK {
    comparator: OrderComparator,
    limit: usize,
    items: Vec<PriorityElement>,
}

impl TopK {
    pub fn new(comparator: OrderComparator, limit: usize) -> Self {
        Self {
            comparator,
            limit,
            items: Vec::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Offer a solution; returns `false` if it did not make the cut
    pub fn offer(&mut self, binding: Binding) -> bool {
        if self.limit == 0 {
            return false;
        }
        let element = self.comparator.element(binding);
        let pos = self.items.partition_point(|existing| {
            self.comparator.compare_elements(existing, &element) != Ordering::Greater
        });
        if pos >= self.limit {
            return false;
        }
        self.items.insert(pos, element);
        self.items.truncate(self.limit);
        true
    }

    /// The current worst retained solution, once the buffer is full
    pub fn threshold(&self) -> Option<&PriorityElement> {
        if self.items.len() < self.limit {
            None
        } else {
            self.items.last()
        }
    }

    /// Retained solutions in order
    pub fn into_sorted(self) -> Vec<Binding> {
        self.items.into_iter().map(PriorityElement::into_binding).collect()
    }
}
