//! Default join orderer.
//!
//! Used when the caller does not hand in a [`SubPlan`]. Repeatedly picks the
//! cheapest constraint that is executable under the current binding state:
//!
//! 1. checks (every affected variable bound)
//! 2. constant and copy extends, expression evaluation
//! 3. counting and aggregation
//! 4. feature navigation from a bound endpoint
//! 5. closure extends, class iteration, pattern calls
//! 6. feature enumeration with neither endpoint bound
//!
//! Nothing here is cost based; any valid plan is accepted by the compilers,
//! so a smarter orderer can replace this one.

use super::pattern::{Constraint, PBody, PVariable};
use super::plan::SubPlan;
use super::Backend;
use crate::error::{PlanError, PlanResult};
use crate::model::InputKey;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GreedyOrderer {
    backend: Backend,
}

impl GreedyOrderer {
    pub fn new(backend: Backend) -> Self {
        GreedyOrderer { backend }
    }

    /// Order the constraints of a normalized body, starting from `bound`
    pub fn order(&self, body: &PBody, bound: BTreeSet<PVariable>) -> PlanResult<SubPlan> {
        let mut remaining: Vec<usize> = (0..body.constraints.len()).collect();
        let mut current = bound.clone();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let best = remaining
                .iter()
                .enumerate()
                .filter_map(|(at, &index)| {
                    self.cost(body, index, &current).map(|cost| (cost, at, index))
                })
                .min();
            let Some((_, at, index)) = best else {
                let stuck = &body.constraints[remaining[0]];
                return Err(PlanError::unsupported(
                    stuck.to_string(),
                    format!("no {} order binds its variables", self.backend),
                ));
            };
            remaining.remove(at);
            current.extend(body.affected_variables(index));
            order.push(index);
        }

        let plan = SubPlan::sequence(body, bound, &order);
        tracing::trace!(plan = %plan, backend = %self.backend, "join_order_chosen");
        Ok(plan)
    }

    /// Cost of applying constraint `index` now, `None` if not executable yet
    fn cost(&self, body: &PBody, index: usize, bound: &BTreeSet<PVariable>) -> Option<u8> {
        if !body.deferred_variables(index).is_subset(bound) {
            return None;
        }
        if body.affected_variables(index).is_subset(bound) {
            return Some(0);
        }
        let is_bound = |v: &PVariable| bound.contains(v);
        match &body.constraints[index] {
            Constraint::ConstantValue { .. } | Constraint::ExpressionEvaluation { .. } => Some(1),
            Constraint::Equality { left, right } => {
                (is_bound(left) || is_bound(right)).then_some(1)
            }
            Constraint::PatternMatchCounter { .. } | Constraint::Aggregate { .. } => Some(2),
            Constraint::TypeConstraint {
                key: InputKey::Feature(_),
                variables,
            } => {
                if variables.iter().any(is_bound) {
                    Some(3)
                } else {
                    Some(6)
                }
            }
            Constraint::TypeConstraint { .. } => Some(4),
            Constraint::TransitiveClosure { .. } => match self.backend {
                Backend::Rete => Some(4),
                Backend::LocalSearch => None,
            },
            Constraint::PatternCall {
                negative: false, ..
            } => match self.backend {
                Backend::Rete => Some(5),
                Backend::LocalSearch => None,
            },
            // deferred variables bound means every affected variable is
            Constraint::PatternCall { negative: true, .. } | Constraint::Inequality { .. } => None,
        }
    }
}
