//! Expression evaluation seam
//!
//! ORDER BY keys and aggregate arguments are supplied by the query engine as
//! [`Expression`]s. Evaluation returns `Ok(None)` for an unbound result and
//! `Err` when the expression cannot be evaluated against the row (type error,
//! bad function argument); callers decide how lenient to be.

use crate::binding::{Binding, Var};
use crate::error::{FederationError, Result};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Something evaluable against a single solution
pub trait Expression: Send + Sync {
    fn evaluate(&self, binding: &Binding) -> Result<Option<Value>>;
}

/// Shared expression handle
pub type ExprRef = Arc<dyn Expression>;

/// Value of a variable in the row
#[derive(Clone, Debug)]
pub struct Variable(pub Var);

impl Variable {
    pub fn new(name: impl Into<Var>) -> Self {
        Self(name.into())
    }
}

impl Expression for Variable {
    fn evaluate(&self, binding: &Binding) -> Result<Option<Value>> {
        Ok(binding.get(&self.0).cloned())
    }
}

/// A fixed value
#[derive(Clone, Debug)]
pub struct Constant(pub Value);

impl Expression for Constant {
    fn evaluate(&self, _binding: &Binding) -> Result<Option<Value>> {
        Ok(Some(self.0.clone()))
    }
}

/// Expression backed by a closure
pub struct FnExpression<F> {
    name: &'static str,
    f: F,
}

impl<F> FnExpression<F>
where
    F: Fn(&Binding) -> Result<Option<Value>> + Send + Sync,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> Expression for FnExpression<F>
where
    F: Fn(&Binding) -> Result<Option<Value>> + Send + Sync,
{
    fn evaluate(&self, binding: &Binding) -> Result<Option<Value>> {
        (self.f)(binding)
    }
}

impl<F> fmt::Debug for FnExpression<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnExpression").field(&self.name).finish()
    }
}

/// `?var` as a shared expression
pub fn var(name: &str) -> ExprRef {
    Arc::new(Variable::new(name))
}

/// Numeric value of `?var`, failing on non-numeric bindings
///
/// Mirrors a cast-style function: unbound stays unbound, anything not numeric
/// is an evaluation error.
pub fn numeric(name: &str) -> ExprRef {
    let var: Var = name.into();
    Arc::new(FnExpression::new("numeric", move |b: &Binding| {
        match b.get(&var) {
            None => Ok(None),
            Some(v) if v.is_numeric() => Ok(Some(v.clone())),
            Some(v) => Err(FederationError::ExpressionEvaluation(format!(
                "?{} is not numeric: {}",
                var, v
            ))),
        }
    }))
}
