//! Expression evaluation capability.
//!
//! Check and eval constraints name an evaluator; the catalog resolves the
//! name to an [`ExpressionEvaluator`] when a plan is compiled. Evaluators
//! must be deterministic: the network revokes exactly the value it inserted,
//! but local search re-evaluates on every call.

use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct EvaluationError(pub String);

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        EvaluationError(message.into())
    }
}

pub trait ExpressionEvaluator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Compute the expression value for one set of input bindings
    fn evaluate(&self, inputs: &[Value]) -> Result<Value, EvaluationError>;
}

/// Adapter turning a closure into an evaluator
pub struct FnEvaluator<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for FnEvaluator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEvaluator").field("name", &self.name).finish()
    }
}

impl<F> ExpressionEvaluator for FnEvaluator<F>
where
    F: Fn(&[Value]) -> Result<Value, EvaluationError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, inputs: &[Value]) -> Result<Value, EvaluationError> {
        (self.f)(inputs)
    }
}

/// Wrap a closure as a shareable evaluator
pub fn evaluator<F>(name: &str, f: F) -> Arc<dyn ExpressionEvaluator>
where
    F: Fn(&[Value]) -> Result<Value, EvaluationError> + Send + Sync + 'static,
{
    Arc::new(FnEvaluator {
        name: name.to_string(),
        f,
    })
}

/// Whether a check expression's result accepts the tuple
pub fn is_truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}
