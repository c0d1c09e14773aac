//! Recipes: network fragments described as values.
//!
//! The compiler emits a recipe tree per query body; [`super::builder`]
//! instantiates it. Recipes compare structurally, so two bodies (or two
//! queries) containing the same sub-expression map to one set of nodes.
//! Evaluators and aggregation operators are referenced by catalog name to
//! keep recipes hashable.

use super::node::ExpressionMode;
use crate::model::InputKey;
use crate::value::{Mask, Tuple, Value};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReteRecipe {
    /// Fixed tuples; the unit relation is one empty tuple of width 0
    Constant {
        tuples: Vec<Tuple>,
        arity: usize,
    },
    Input {
        key: InputKey,
    },
    /// Match set of a query, possibly one still being built
    Production {
        query: String,
        arity: usize,
    },
    Trim {
        parent: Arc<ReteRecipe>,
        mask: Mask,
    },
    ConstantFilter {
        parent: Arc<ReteRecipe>,
        column: usize,
        value: Value,
    },
    EqualityFilter {
        parent: Arc<ReteRecipe>,
        groups: Vec<Vec<usize>>,
    },
    InequalityFilter {
        parent: Arc<ReteRecipe>,
        left: usize,
        right: usize,
    },
    Expression {
        parent: Arc<ReteRecipe>,
        evaluator: String,
        inputs: Vec<usize>,
        mode: ExpressionMode,
    },
    Join {
        primary: Arc<ReteRecipe>,
        primary_mask: Mask,
        secondary: Arc<ReteRecipe>,
        secondary_mask: Mask,
    },
    Existence {
        primary: Arc<ReteRecipe>,
        primary_mask: Mask,
        secondary: Arc<ReteRecipe>,
        secondary_mask: Mask,
        negative: bool,
    },
    OuterJoin {
        primary: Arc<ReteRecipe>,
        primary_mask: Mask,
        secondary: Arc<ReteRecipe>,
        secondary_mask: Mask,
        defaults: Tuple,
    },
    Aggregate {
        parent: Arc<ReteRecipe>,
        group_mask: Mask,
        operator: String,
        column: Option<usize>,
    },
    TransitiveClosure {
        parent: Arc<ReteRecipe>,
    },
}

impl ReteRecipe {
    /// Relation with a single empty tuple; neutral element of joins
    pub fn unit() -> Self {
        ReteRecipe::Constant {
            tuples: vec![Tuple::empty()],
            arity: 0,
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, ReteRecipe::Constant { tuples, arity: 0 } if tuples.len() == 1)
    }

    /// Width of the tuples produced
    pub fn arity(&self) -> usize {
        match self {
            ReteRecipe::Constant { arity, .. } | ReteRecipe::Production { arity, .. } => *arity,
            ReteRecipe::Input { key } => key.arity(),
            ReteRecipe::Trim { mask, .. } => mask.arity(),
            ReteRecipe::ConstantFilter { parent, .. }
            | ReteRecipe::EqualityFilter { parent, .. }
            | ReteRecipe::InequalityFilter { parent, .. } => parent.arity(),
            ReteRecipe::Expression { parent, mode, .. } => match mode {
                ExpressionMode::Check => parent.arity(),
                ExpressionMode::Bind => parent.arity() + 1,
            },
            ReteRecipe::Join {
                primary,
                secondary_mask,
                ..
            }
            | ReteRecipe::OuterJoin {
                primary,
                secondary_mask,
                ..
            } => primary.arity() + secondary_mask.complement().arity(),
            ReteRecipe::Existence { primary, .. } => primary.arity(),
            ReteRecipe::Aggregate { group_mask, .. } => group_mask.arity() + 1,
            ReteRecipe::TransitiveClosure { .. } => 2,
        }
    }

    /// Number of recipe nodes in the tree, shared subtrees counted per use
    pub fn size(&self) -> usize {
        1 + self.children().iter().map(|c| c.size()).sum::<usize>()
    }

    pub fn children(&self) -> Vec<&Arc<ReteRecipe>> {
        match self {
            ReteRecipe::Constant { .. } | ReteRecipe::Input { .. } | ReteRecipe::Production { .. } => {
                Vec::new()
            }
            ReteRecipe::Trim { parent, .. }
            | ReteRecipe::ConstantFilter { parent, .. }
            | ReteRecipe::EqualityFilter { parent, .. }
            | ReteRecipe::InequalityFilter { parent, .. }
            | ReteRecipe::Expression { parent, .. }
            | ReteRecipe::Aggregate { parent, .. }
            | ReteRecipe::TransitiveClosure { parent } => vec![parent],
            ReteRecipe::Join {
                primary, secondary, ..
            }
            | ReteRecipe::Existence {
                primary, secondary, ..
            }
            | ReteRecipe::OuterJoin {
                primary, secondary, ..
            } => vec![primary, secondary],
        }
    }
}

impl fmt::Display for ReteRecipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReteRecipe::Constant { tuples, .. } => write!(f, "const[{}]", tuples.len()),
            ReteRecipe::Input { key } => write!(f, "{key}"),
            ReteRecipe::Production { query, .. } => write!(f, "@{query}"),
            ReteRecipe::Trim { parent, mask } => write!(f, "trim{mask}({parent})"),
            ReteRecipe::ConstantFilter {
                parent,
                column,
                value,
            } => write!(f, "filter[{column}={value}]({parent})"),
            ReteRecipe::EqualityFilter { parent, groups } => {
                write!(f, "equal{groups:?}({parent})")
            }
            ReteRecipe::InequalityFilter {
                parent,
                left,
                right,
            } => write!(f, "unequal[{left},{right}]({parent})"),
            ReteRecipe::Expression {
                parent,
                evaluator,
                mode,
                ..
            } => write!(f, "{mode:?}:{evaluator}({parent})"),
            ReteRecipe::Join {
                primary,
                primary_mask,
                secondary,
                secondary_mask,
            } => write!(f, "join({primary}{primary_mask}, {secondary}{secondary_mask})"),
            ReteRecipe::Existence {
                primary,
                secondary,
                negative,
                ..
            } => {
                let op = if *negative { "anti" } else { "semi" };
                write!(f, "{op}({primary}, {secondary})")
            }
            ReteRecipe::OuterJoin {
                primary, secondary, ..
            } => write!(f, "outer({primary}, {secondary})"),
            ReteRecipe::Aggregate {
                parent, operator, ..
            } => write!(f, "{operator}({parent})"),
            ReteRecipe::TransitiveClosure { parent } => write!(f, "closure({parent})"),
        }
    }
}
