//! # Query Planner
//!
//! Turns a pattern body plus a join order into something executable.
//!
//! ```text
//! PQuery/PBody ──normalize──> PBody ──GreedyOrderer (or caller)──> SubPlan
//!                                                                   │
//!                          ┌────────────────────────────────────────┤
//!                          ▼                                        ▼
//!            search_plan::compile_search_plan       rete_compiler::compile_body
//!            (SearchOperation list)                 (ReteRecipe)
//! ```
//!
//! Both compilers walk the plan once, assign every variable a slot, and
//! decide per constraint whether it is a *check* (all affected variables
//! already bound) or an *extend* (binds new variables). Constraint and
//! direction combinations that cannot be executed fail at compile time with
//! [`crate::error::PlanError::UnsupportedOperation`].

pub mod ordering;
pub mod pattern;
pub mod plan;
pub mod rete_compiler;
pub mod search_plan;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use ordering::GreedyOrderer;
pub use pattern::{Constraint, PBody, PParameter, PQuery, PVariable};
pub use plan::{SubPlan, VariableSlots};

/// Evaluation strategy of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Incremental dataflow network, matches kept up to date
    #[default]
    Rete,
    /// Backtracking search over the model on every request
    LocalSearch,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Rete => write!(f, "rete"),
            Backend::LocalSearch => write!(f, "local_search"),
        }
    }
}
