//! Plan trees and variable slots.
//!
//! A [`SubPlan`] fixes the order in which a body's constraints are applied.
//! It is supplied by the caller or built by [`super::GreedyOrderer`]; the
//! compilers only execute it, after [`SubPlan::validate`] has checked that it
//! fits the body.

use super::pattern::{PBody, PVariable};
use crate::error::{PlanError, PlanResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubPlan {
    /// Leaf; `bound` are the variables bound on entry
    Start { bound: BTreeSet<PVariable> },
    /// Apply constraint `constraint` (index into the body) after `parent`
    Apply {
        parent: Box<SubPlan>,
        constraint: usize,
    },
    /// Keep only `variables`, in this order
    Project {
        parent: Box<SubPlan>,
        variables: Vec<PVariable>,
    },
    /// Natural join of two independent sub-plans
    Join {
        left: Box<SubPlan>,
        right: Box<SubPlan>,
    },
}

impl SubPlan {
    pub fn start(bound: impl IntoIterator<Item = PVariable>) -> Self {
        SubPlan::Start {
            bound: bound.into_iter().collect(),
        }
    }

    pub fn apply(self, constraint: usize) -> Self {
        SubPlan::Apply {
            parent: Box::new(self),
            constraint,
        }
    }

    pub fn project(self, variables: Vec<PVariable>) -> Self {
        SubPlan::Project {
            parent: Box::new(self),
            variables,
        }
    }

    pub fn join(self, right: SubPlan) -> Self {
        SubPlan::Join {
            left: Box::new(self),
            right: Box::new(right),
        }
    }

    /// Left-deep plan applying `order` and projecting to the body parameters
    pub fn sequence(body: &PBody, bound: BTreeSet<PVariable>, order: &[usize]) -> Self {
        order
            .iter()
            .fold(SubPlan::Start { bound }, |plan, &c| plan.apply(c))
            .project(body.parameters.clone())
    }

    /// Constraint indices in execution order
    pub fn applied_constraints(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_applied(&mut out);
        out
    }

    fn collect_applied(&self, out: &mut Vec<usize>) {
        match self {
            SubPlan::Start { .. } => {}
            SubPlan::Apply { parent, constraint } => {
                parent.collect_applied(out);
                out.push(*constraint);
            }
            SubPlan::Project { parent, .. } => parent.collect_applied(out),
            SubPlan::Join { left, right } => {
                left.collect_applied(out);
                right.collect_applied(out);
            }
        }
    }

    /// Variables bound at the entry of the plan (all `Start` leaves)
    pub fn entry_bound(&self) -> BTreeSet<PVariable> {
        match self {
            SubPlan::Start { bound } => bound.clone(),
            SubPlan::Apply { parent, .. } | SubPlan::Project { parent, .. } => parent.entry_bound(),
            SubPlan::Join { left, right } => {
                let mut bound = left.entry_bound();
                bound.extend(right.entry_bound());
                bound
            }
        }
    }

    /// Variables bound after this (sub-)plan has run
    pub fn bound_variables(&self, body: &PBody) -> BTreeSet<PVariable> {
        match self {
            SubPlan::Start { bound } => bound.clone(),
            SubPlan::Apply { parent, constraint } => {
                let mut bound = parent.bound_variables(body);
                if *constraint < body.constraints.len() {
                    bound.extend(body.affected_variables(*constraint));
                }
                bound
            }
            SubPlan::Project { variables, .. } => variables.iter().cloned().collect(),
            SubPlan::Join { left, right } => {
                let mut bound = left.bound_variables(body);
                bound.extend(right.bound_variables(body));
                bound
            }
        }
    }

    /// Binding state before every applied constraint, in execution order.
    ///
    /// Sub-plans are executed left to right, so the right side of a join
    /// also sees what the left side bound.
    pub fn binding_states(&self, body: &PBody) -> Vec<(usize, BTreeSet<PVariable>)> {
        let mut out = Vec::new();
        self.collect_states(body, BTreeSet::new(), &mut out);
        out
    }

    fn collect_states(
        &self,
        body: &PBody,
        mut bound: BTreeSet<PVariable>,
        out: &mut Vec<(usize, BTreeSet<PVariable>)>,
    ) -> BTreeSet<PVariable> {
        match self {
            SubPlan::Start { bound: start } => {
                bound.extend(start.iter().cloned());
                bound
            }
            SubPlan::Apply { parent, constraint } => {
                let mut bound = parent.collect_states(body, bound, out);
                out.push((*constraint, bound.clone()));
                if *constraint < body.constraints.len() {
                    bound.extend(body.affected_variables(*constraint));
                }
                bound
            }
            SubPlan::Project { parent, variables } => {
                let before = parent.collect_states(body, bound.clone(), out);
                bound.extend(variables.iter().filter(|v| before.contains(v)).cloned());
                bound
            }
            SubPlan::Join { left, right } => {
                let after_left = left.collect_states(body, bound, out);
                right.collect_states(body, after_left, out)
            }
        }
    }

    /// Check that the plan is executable for `body`.
    ///
    /// Every constraint must be applied exactly once and the root must
    /// project to the body parameters (`MalformedPlan` otherwise). A
    /// constraint applied before its deferred variables are bound is an
    /// unsupported direction.
    pub fn validate(&self, body: &PBody) -> PlanResult<()> {
        match self {
            SubPlan::Project { variables, .. } if *variables == body.parameters => {}
            _ => {
                return Err(PlanError::MalformedPlan(
                    "plan root must project to the body parameters".to_string(),
                ))
            }
        }

        let known = body.variables();
        if let Some(unknown) = self.entry_bound().iter().find(|v| !known.contains(v)) {
            return Err(PlanError::UnknownVariable(unknown.to_string()));
        }

        let applied = self.applied_constraints();
        let mut seen = vec![false; body.constraints.len()];
        for &index in &applied {
            let Some(flag) = seen.get_mut(index) else {
                return Err(PlanError::MalformedPlan(format!(
                    "constraint index {index} out of range"
                )));
            };
            if *flag {
                return Err(PlanError::MalformedPlan(format!(
                    "constraint {} applied twice",
                    body.constraints[index]
                )));
            }
            *flag = true;
        }
        if let Some(missing) = seen.iter().position(|applied| !applied) {
            return Err(PlanError::MalformedPlan(format!(
                "constraint {} never applied",
                body.constraints[missing]
            )));
        }

        for (index, bound) in self.binding_states(body) {
            if let Some(unbound) = body
                .deferred_variables(index)
                .iter()
                .find(|v| !bound.contains(v))
            {
                return Err(PlanError::unsupported(
                    body.constraints[index].to_string(),
                    format!("applied before {unbound} is bound"),
                ));
            }
        }
        self.validate_projections(body)
    }

    fn validate_projections(&self, body: &PBody) -> PlanResult<()> {
        match self {
            SubPlan::Start { .. } => Ok(()),
            SubPlan::Apply { parent, .. } => parent.validate_projections(body),
            SubPlan::Project { parent, variables } => {
                let bound = parent.bound_variables(body);
                if let Some(unbound) = variables.iter().find(|v| !bound.contains(v)) {
                    return Err(PlanError::MalformedPlan(format!(
                        "projection to unbound variable {unbound}"
                    )));
                }
                parent.validate_projections(body)
            }
            SubPlan::Join { left, right } => {
                left.validate_projections(body)?;
                right.validate_projections(body)
            }
        }
    }
}

impl fmt::Display for SubPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubPlan::Start { bound } => {
                let names: Vec<&str> = bound.iter().map(PVariable::name).collect();
                write!(f, "start[{}]", names.join(","))
            }
            SubPlan::Apply { parent, constraint } => write!(f, "{parent} -> #{constraint}"),
            SubPlan::Project { parent, variables } => {
                let names: Vec<&str> = variables.iter().map(PVariable::name).collect();
                write!(f, "{parent} -> project({})", names.join(","))
            }
            SubPlan::Join { left, right } => write!(f, "join({left}; {right})"),
        }
    }
}

/// Variable -> slot assignment, stable for one compiled plan.
///
/// Parameters come first in parameter order, the remaining variables follow
/// in order of first appearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableSlots {
    names: Vec<PVariable>,
    by_name: BTreeMap<PVariable, usize>,
}

impl VariableSlots {
    pub fn assign(body: &PBody) -> Self {
        let mut slots = VariableSlots {
            names: Vec::new(),
            by_name: BTreeMap::new(),
        };
        let ordered = body
            .parameters
            .iter()
            .chain(body.constraints.iter().flat_map(|c| c.variables()));
        for variable in ordered {
            if !slots.by_name.contains_key(variable) {
                slots.by_name.insert(variable.clone(), slots.names.len());
                slots.names.push(variable.clone());
            }
        }
        slots
    }

    pub fn slot(&self, variable: &PVariable) -> PlanResult<usize> {
        self.by_name
            .get(variable)
            .copied()
            .ok_or_else(|| PlanError::UnknownVariable(variable.to_string()))
    }

    pub fn variable(&self, slot: usize) -> Option<&PVariable> {
        self.names.get(slot)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn slots_of<'a>(&self, variables: impl IntoIterator<Item = &'a PVariable>) -> BTreeSet<usize> {
        variables
            .into_iter()
            .filter_map(|v| self.by_name.get(v).copied())
            .collect()
    }
}
