//! Error types
//!
//! Three channels, following how far a failure is allowed to travel:
//!
//! - [`PlanError`]: compile-time failures, returned to whoever asked for a
//!   plan or network. Fatal to that compilation only.
//! - [`IntegrityIssue`]: local data problems found while propagating
//!   (bucket inconsistencies, failed expression evaluation, badly typed
//!   matches). Never returned; reported to error listeners and logged.
//! - [`EngineError`]: failures of engine-level requests (unknown query,
//!   disposal with attached listeners, ...).

use thiserror::Error;

/// Query planning and network construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The constraint cannot be compiled in the requested binding direction
    #[error("Unsupported operation for {constraint}: {reason}")]
    UnsupportedOperation { constraint: String, reason: String },

    /// The supplied plan does not fit the pattern body
    #[error("Malformed plan: {0}")]
    MalformedPlan(String),

    /// A pattern call refers to a query missing from the catalog
    #[error("Unknown query: {0}")]
    UnknownQuery(String),

    #[error("Unknown expression evaluator: {0}")]
    UnknownEvaluator(String),

    #[error("Unknown aggregation operator: {0}")]
    UnknownAggregator(String),

    /// Call site arity differs from the callee's parameter list
    #[error("Arity mismatch calling {query}: expected {expected}, got {actual}")]
    ArityMismatch {
        query: String,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    /// Local search cannot evaluate (mutually) recursive patterns
    #[error("Recursive pattern cannot be evaluated by local search: {0}")]
    RecursiveLocalSearch(String),
}

impl PlanError {
    pub fn unsupported(constraint: impl Into<String>, reason: impl Into<String>) -> Self {
        PlanError::UnsupportedOperation {
            constraint: constraint.into(),
            reason: reason.into(),
        }
    }

    /// True for the "unsupported operation" class of failures
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            PlanError::UnsupportedOperation { .. } | PlanError::RecursiveLocalSearch(_)
        )
    }
}

/// Engine-level errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("Query not found: {0}")]
    UnknownQuery(String),

    /// A partial binding has the wrong number of positions
    #[error("Binding for {query} has {actual} positions, expected {expected}")]
    BindingArity {
        query: String,
        expected: usize,
        actual: usize,
    },

    #[error("Cannot dispose engine: {0} match listener(s) still attached")]
    ListenersAttached(usize),

    #[error("Engine has been disposed")]
    Disposed,
}

/// Non-fatal consistency problems found during propagation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IntegrityIssue {
    /// A tuple already present was inserted into a duplicate-free bucket
    #[error("duplicate insert of {tuple} into unique index {index}")]
    DuplicateInsert { index: String, tuple: String },

    /// A revoke arrived for a tuple the index does not hold
    #[error("removal of absent tuple {tuple} from index {index}")]
    MissingTuple { index: String, tuple: String },

    /// An expression evaluator failed for one input tuple
    #[error("expression {evaluator} failed on {tuple}: {message}")]
    EvaluationFailed {
        evaluator: String,
        tuple: String,
        message: String,
    },

    /// A raw tuple could not be converted into a typed match
    #[error("element not properly typed in match of {query}: {message}")]
    BadlyTypedMatch { query: String, message: String },
}

/// Result type for planning operations
pub type PlanResult<T> = Result<T, PlanError>;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_is_distinguishable() {
        let err = PlanError::unsupported("Inequality(a, b)", "cannot enumerate unequal values");
        assert!(err.is_unsupported());
        assert!(!PlanError::MalformedPlan("x".into()).is_unsupported());
        assert_eq!(
            err.to_string(),
            "Unsupported operation for Inequality(a, b): cannot enumerate unequal values"
        );
    }

    #[test]
    fn test_engine_error_from_plan() {
        let err: EngineError = PlanError::UnknownQuery("q".into()).into();
        assert!(matches!(err, EngineError::Plan(PlanError::UnknownQuery(_))));
        assert_eq!(err.to_string(), "Planning failed: Unknown query: q");
    }

    #[test]
    fn test_integrity_issue_display() {
        let issue = IntegrityIssue::MissingTuple {
            index: "edge[0]".into(),
            tuple: "(#1, #2)".into(),
        };
        assert_eq!(
            issue.to_string(),
            "removal of absent tuple (#1, #2) from index edge[0]"
        );
    }
}
