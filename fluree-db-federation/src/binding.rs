//! Solution bindings and join keys
//!
//! This module contains:
//! - `Binding`: an immutable variable → value map for one solution (cheap to clone)
//! - `JoinVars`: the variables shared by two operands, fixed once per cursor
//! - `JoinKey`: a binding projected onto `JoinVars`, hashable for grouping/joins

use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Variable name (without the leading `?`)
pub type Var = Arc<str>;

/// Ordered set of variable names
pub type VarSet = BTreeSet<Var>;

/// Build a `VarSet` from string names
pub fn var_set<I, S>(names: I) -> VarSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names.into_iter().map(|n| Var::from(n.as_ref())).collect()
}

/// One solution: an immutable map from variable name to bound value
///
/// Unbound variables are simply absent. Cloning shares the underlying map, and
/// every "modifying" operation returns a new binding, so a binding handed to a
/// worker thread can never change underneath its producer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Binding {
    vars: Arc<BTreeMap<Var, Value>>,
}

impl Binding {
    /// The empty solution (joins with everything)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, var: &str) -> Option<&Value> {
        self.vars.get(var)
    }

    pub fn contains(&self, var: &str) -> bool {
        self.vars.contains_key(var)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Bound variable names in sorted order
    pub fn vars(&self) -> impl Iterator<Item = &Var> + '_ {
        self.vars.keys()
    }

    pub fn var_set(&self) -> VarSet {
        self.vars.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Value)> + '_ {
        self.vars.iter()
    }

    /// Copy of this binding with `var` bound to `value`
    ///
    /// An existing value for `var` is replaced; callers that must not
    /// overwrite use [`Binding::extend_missing`].
    pub fn with_value(&self, var: impl Into<Var>, value: Value) -> Binding {
        let mut vars = (*self.vars).clone();
        vars.insert(var.into(), value);
        Binding {
            vars: Arc::new(vars),
        }
    }

    /// Copy of this binding with `var` removed
    pub fn without(&self, var: &str) -> Binding {
        if !self.contains(var) {
            return self.clone();
        }
        let mut vars = (*self.vars).clone();
        vars.remove(var);
        Binding {
            vars: Arc::new(vars),
        }
    }

    /// Add every variable of `other` that this binding does not already bind
    ///
    /// Values already present in `self` always win.
    pub fn extend_missing(&self, other: &Binding) -> Binding {
        if other.vars.keys().all(|v| self.vars.contains_key(v)) {
            return self.clone();
        }
        let mut vars = (*self.vars).clone();
        for (var, value) in other.vars.iter() {
            vars.entry(var.clone()).or_insert_with(|| value.clone());
        }
        Binding {
            vars: Arc::new(vars),
        }
    }

    /// True when every variable bound in both solutions has the same value
    pub fn is_compatible(&self, other: &Binding) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small
            .vars
            .iter()
            .all(|(var, value)| large.get(var).is_none_or(|v| v == value))
    }

    /// Union of two compatible solutions, `None` if they conflict
    pub fn merge(&self, other: &Binding) -> Option<Binding> {
        if self.is_compatible(other) {
            Some(self.extend_missing(other))
        } else {
            None
        }
    }
}

impl<K: Into<Var>> FromIterator<(K, Value)> for Binding {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Binding {
            vars: Arc::new(iter.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }
}

/// Variables shared between a left binding and a right operand
///
/// Computed once per cursor and never changed afterwards; every `JoinKey`
/// produced by the same `JoinVars` has the same arity and variable order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinVars {
    vars: Arc<[Var]>,
}

impl JoinVars {
    pub fn new(vars: impl IntoIterator<Item = Var>) -> Self {
        let set: VarSet = vars.into_iter().collect();
        Self {
            vars: set.into_iter().collect(),
        }
    }

    /// Variables bound in `left` that the right operand also mentions
    pub fn between(left: &Binding, right_vars: &VarSet) -> Self {
        Self::new(left.vars().filter(|v| right_vars.contains(*v)).cloned())
    }

    /// Variables present in both sets
    pub fn shared(a: &VarSet, b: &VarSet) -> Self {
        Self::new(a.intersection(b).cloned())
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn to_var_set(&self) -> VarSet {
        self.vars.iter().cloned().collect()
    }

    /// Project a binding onto these variables
    pub fn key(&self, binding: &Binding) -> JoinKey {
        JoinKey(
            self.vars
                .iter()
                .map(|v| binding.get(v).cloned())
                .collect(),
        )
    }
}

/// A binding projected onto a fixed `JoinVars`; `None` marks an unbound position
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JoinKey(Vec<Option<Value>>);

impl JoinKey {
    pub fn values(&self) -> &[Option<Value>] {
        &self.0
    }

    /// True when some join variable is unbound in the projected binding
    pub fn has_unbound(&self) -> bool {
        self.0.iter().any(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(pairs: &[(&str, i64)]) -> Binding {
        pairs.iter().map(|(k, v)| (*k, Value::Long(*v))).collect()
    }

    #[test]
    fn test_extend_missing_never_overwrites() {
        let response = b(&[("x", 1), ("y", 2)]);
        let original = b(&[("x", 99), ("z", 3)]);

        let merged = response.extend_missing(&original);
        assert_eq!(merged.get("x"), Some(&Value::Long(1)));
        assert_eq!(merged.get("y"), Some(&Value::Long(2)));
        assert_eq!(merged.get("z"), Some(&Value::Long(3)));
        // source bindings untouched
        assert_eq!(response.len(), 2);
        assert_eq!(original.get("x"), Some(&Value::Long(99)));
    }

    #[test]
    fn test_merge_conflict() {
        let a = b(&[("x", 1), ("y", 2)]);
        assert!(a.merge(&b(&[("x", 2)])).is_none());
        let merged = a.merge(&b(&[("x", 1), ("z", 5)])).unwrap();
        assert_eq!(merged.var_set(), var_set(["x", "y", "z"]));
    }

    #[test]
    fn test_without() {
        let a = b(&[("__index", 0), ("x", 1)]);
        let stripped = a.without("__index");
        assert!(!stripped.contains("__index"));
        assert_eq!(stripped.len(), 1);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_join_vars_between() {
        let left = b(&[("x", 1), ("y", 2), ("w", 0)]);
        let jv = JoinVars::between(&left, &var_set(["y", "x", "q"]));
        assert_eq!(jv.vars(), &[Var::from("x"), Var::from("y")]);

        assert_eq!(jv.key(&left), jv.key(&b(&[("x", 1), ("y", 2), ("w", 7)])));
        assert_ne!(jv.key(&left), jv.key(&b(&[("x", 1), ("y", 3)])));
        assert!(jv.key(&b(&[("x", 1)])).has_unbound());
    }
}
