//! Node kinds of the dataflow network.
//!
//! Stateless kinds (trimmers, filters) only transform tuples. Stateful kinds
//! own their storage: input/uniqueness/production memories, expression
//! caches, aggregate groups, closure state. Join-like kinds read the two
//! indexers they listen to and keep no storage of their own.

use super::aggregate::AggregationOperator;
use super::closure::ClosureState;
use super::memory::TupleMemory;
use super::IndexerId;
use crate::expression::ExpressionEvaluator;
use crate::model::InputKey;
use crate::value::{Mask, Tuple, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Base tuples for one input key. Multiset unless the key is declared unique.
#[derive(Debug, Clone)]
pub struct InputNode {
    pub key: InputKey,
    pub unique: bool,
    pub memory: TupleMemory,
}

/// Whether an expression node filters or appends its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpressionMode {
    /// Keep the tuple iff the value is `true`
    Check,
    /// Append the value as a new column
    Bind,
}

#[derive(Debug, Clone)]
pub struct ExpressionNode {
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub inputs: Vec<usize>,
    pub mode: ExpressionMode,
    /// input tuple -> (output emitted for it, multiplicity)
    pub cache: HashMap<Tuple, (Option<Tuple>, usize)>,
}

/// Natural join of two indexed parents
#[derive(Debug, Clone)]
pub struct JoinNode {
    pub primary: IndexerId,
    pub secondary: IndexerId,
    /// Secondary columns appended to the primary tuple
    pub complement: Mask,
}

/// Semi-join (`negative == false`) or anti-join (`negative == true`)
#[derive(Debug, Clone)]
pub struct ExistenceNode {
    pub primary: IndexerId,
    pub secondary: IndexerId,
    pub negative: bool,
}

/// Left outer join filling unmatched primaries with `defaults`
#[derive(Debug, Clone)]
pub struct OuterJoinNode {
    pub primary: IndexerId,
    pub secondary: IndexerId,
    pub complement: Mask,
    pub defaults: Tuple,
}

/// Groups the source indexer's buckets and folds one column per group
#[derive(Debug, Clone)]
pub struct AggregatorNode {
    pub source: IndexerId,
    pub operator: Arc<dyn AggregationOperator>,
    /// Aggregated column of the parent tuple; `None` folds over nulls (counting)
    pub column: Option<usize>,
    /// signature -> last emitted aggregate
    pub groups: HashMap<Tuple, Value>,
}

/// Terminal node holding one query's match set
#[derive(Debug, Clone)]
pub struct ProductionNode {
    pub query: String,
    pub memory: TupleMemory,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Input(InputNode),
    /// Fixed tuples, e.g. the unit tuple or a bound constant
    Constant(Vec<Tuple>),
    /// Projection, keeps duplicates
    Trimmer(Mask),
    ConstantFilter { column: usize, value: Value },
    /// Each group of columns must hold one value
    EqualityFilter(Vec<Vec<usize>>),
    InequalityFilter { left: usize, right: usize },
    Expression(ExpressionNode),
    Join(JoinNode),
    Existence(ExistenceNode),
    OuterJoin(OuterJoinNode),
    Aggregator(AggregatorNode),
    TransitiveClosure(ClosureState),
    Uniqueness(TupleMemory),
    Production(ProductionNode),
}

impl NodeKind {
    /// Short kind name for statistics and logs
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Input(_) => "input",
            NodeKind::Constant(_) => "constant",
            NodeKind::Trimmer(_) => "trimmer",
            NodeKind::ConstantFilter { .. } => "constant_filter",
            NodeKind::EqualityFilter(_) => "equality_filter",
            NodeKind::InequalityFilter { .. } => "inequality_filter",
            NodeKind::Expression(_) => "expression",
            NodeKind::Join(_) => "join",
            NodeKind::Existence(e) if e.negative => "anti_join",
            NodeKind::Existence(_) => "semi_join",
            NodeKind::OuterJoin(_) => "outer_join",
            NodeKind::Aggregator(_) => "aggregator",
            NodeKind::TransitiveClosure(_) => "transitive_closure",
            NodeKind::Uniqueness(_) => "uniqueness",
            NodeKind::Production(_) => "production",
        }
    }

    /// Stateful kinds own tuple storage
    pub fn is_stateful(&self) -> bool {
        matches!(
            self,
            NodeKind::Input(_)
                | NodeKind::Expression(_)
                | NodeKind::Aggregator(_)
                | NodeKind::TransitiveClosure(_)
                | NodeKind::Uniqueness(_)
                | NodeKind::Production(_)
        )
    }

    /// Number of tuples (or closure pairs, or groups) held by this node
    pub fn stored_tuples(&self) -> usize {
        match self {
            NodeKind::Input(input) => input.memory.entries().map(|(_, n)| n).sum(),
            NodeKind::Expression(e) => e.cache.len(),
            NodeKind::Aggregator(a) => a.groups.len(),
            NodeKind::TransitiveClosure(state) => state.pair_count(),
            NodeKind::Uniqueness(memory) => memory.len(),
            NodeKind::Production(p) => p.memory.len(),
            _ => 0,
        }
    }

    /// Drop all stored state
    pub fn clear(&mut self) {
        match self {
            NodeKind::Input(input) => input.memory.clear(),
            NodeKind::Expression(e) => e.cache.clear(),
            NodeKind::Aggregator(a) => a.groups.clear(),
            NodeKind::TransitiveClosure(state) => state.clear(),
            NodeKind::Uniqueness(memory) => memory.clear(),
            NodeKind::Production(p) => p.memory.clear(),
            _ => {}
        }
    }
}
