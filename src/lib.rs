//! # PatternFlow Incremental Pattern Matching Engine
//!
//! Keeps the matches of declarative graph patterns up to date while the
//! object graph they range over changes.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! PQuery (constraint graph)
//!     ↓
//! [QueryCatalog]                → call checks, dependency SCCs
//!     ↓
//! [PBody::normalize]            → equalities unified
//!     ↓
//! [GreedyOrderer]               → SubPlan (Start / Apply / Project / Join)
//!     ↓
//!     ├── [rete_compiler]       → ReteRecipe → [ReteBuilder] → Network nodes
//!     └── [search_plan]         → SearchOperation list → [SearchExecutor]
//!     ↓
//! [QueryEngine]                 → matchers, listeners, error channels
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use patternflow::{Constraint, InMemoryModel, Metamodel, PBody, PQuery, PartialMatch, QueryEngine};
//!
//! let metamodel = Metamodel::new().with_class("TypeA", &[]).with_class("TypeB", &[]);
//! let mut engine = QueryEngine::new(InMemoryModel::new(metamodel));
//!
//! engine.register_query(PQuery::new("p", &["x", "y"]).with_body(
//!     PBody::new(&["x", "y"])
//!         .with(Constraint::instance_of("TypeA", "x"))
//!         .with(Constraint::instance_of("TypeB", "y"))
//!         .with(Constraint::feature("edge", "x", "y")),
//! ))?;
//!
//! engine.update(|model| {
//!     let a = model.create_object("TypeA");
//!     let b = model.create_object("TypeB");
//!     model.add_value(&a.into(), "edge", b.into());
//! })?;
//!
//! let matches = engine.matcher("p")?.all_matches(&PartialMatch::new())?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `value` | Values, tuples and projection masks |
//! | `index` | Signature-keyed tuple buckets |
//! | `rete` | Dataflow network, node kinds, recipes and builder |
//! | `planner` | Pattern bodies, plans, check/extend compilation |
//! | `localsearch` | Backtracking plan executor |
//! | `catalog` | Query registry and dependency analysis |
//! | `model` | Object-graph access and change events |
//! | `engine` | Query engine, matchers and listeners |

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod index;
pub mod localsearch;
pub mod logging;
pub mod model;
pub mod planner;
pub mod rete;
pub mod value;

pub use catalog::{MatcherReference, QueryCatalog};
pub use config::{Config, EngineConfig, LoggingConfig};
pub use engine::{
    match_listener, CollectingErrorListener, DeferredUpdates, EngineStatistics, ErrorListener,
    FatalError, FromMatch, ListenerId, Match, MatchListener, Matcher, PartialMatch, QueryEngine,
};
pub use error::{EngineError, EngineResult, IntegrityIssue, PlanError, PlanResult};
pub use expression::{evaluator, EvaluationError, ExpressionEvaluator};
pub use model::{FeatureDecl, InMemoryModel, InputKey, Metamodel, ModelChange, ModelIndex};
pub use planner::{Backend, Constraint, PBody, PQuery, PVariable, SubPlan};
pub use rete::{Direction, Network, NetworkStatistics};
pub use value::{Mask, ObjectId, Tuple, Value, ValueKind};
