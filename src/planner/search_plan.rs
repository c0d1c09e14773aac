//! Local-search plan compilation.
//!
//! Walks a [`SubPlan`] once, and for every applied constraint decides
//! between a check and an extend operation based on the slots bound at that
//! point. The resulting [`SearchPlan`] is a flat operation list executed by
//! [`crate::localsearch`].

use super::pattern::{Constraint, PBody, PVariable};
use super::plan::{SubPlan, VariableSlots};
use crate::catalog::{MatcherReference, QueryCatalog};
use crate::error::{PlanError, PlanResult};
use crate::expression::ExpressionEvaluator;
use crate::model::{InputKey, Metamodel};
use crate::rete::aggregate::AggregationOperator;
use crate::value::{Tuple, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Caller slots passed to a callee, position by position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFrame {
    /// Caller slot feeding each callee parameter
    pub slots: Vec<usize>,
    /// Whether the slot is bound when the call runs
    pub bound: Vec<bool>,
}

impl CallFrame {
    fn new(slots: Vec<usize>, bound_slots: &BTreeSet<usize>) -> Self {
        let bound = slots.iter().map(|s| bound_slots.contains(s)).collect();
        CallFrame { slots, bound }
    }

    /// Callee positions bound at the call site
    pub fn adornment(&self) -> BTreeSet<usize> {
        self.bound
            .iter()
            .enumerate()
            .filter_map(|(i, &b)| b.then_some(i))
            .collect()
    }

    /// Callee-side partial binding; unbound positions are `None`
    pub fn binding(&self, frame: &[Option<Value>]) -> Vec<Option<Value>> {
        self.slots
            .iter()
            .zip(&self.bound)
            .map(|(&slot, &bound)| {
                if bound {
                    frame.get(slot).cloned().flatten()
                } else {
                    None
                }
            })
            .collect()
    }

    /// A callee match is consistent if positions sharing a caller slot
    /// carry equal values
    pub fn is_consistent(&self, callee_match: &Tuple) -> bool {
        for (i, slot) in self.slots.iter().enumerate() {
            for (j, other) in self.slots.iter().enumerate().skip(i + 1) {
                if slot == other && callee_match.get(i) != callee_match.get(j) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Clone)]
pub enum SearchOperation {
    IterateInstances {
        class: String,
        slot: usize,
    },
    CheckInstance {
        class: String,
        slot: usize,
    },
    /// Holder bound, enumerate values
    ExtendFeatureForward {
        feature: String,
        holder: usize,
        value: usize,
    },
    /// Value bound, enumerate holders
    ExtendFeatureBackward {
        feature: String,
        holder: usize,
        value: usize,
    },
    /// Neither endpoint bound: iterate the declaring class, then navigate
    /// forward
    IterateFeatureViaSourceClass {
        class: String,
        feature: String,
        holder: usize,
        value: usize,
    },
    CheckFeature {
        feature: String,
        holder: usize,
        value: usize,
    },
    CheckInequality {
        left: usize,
        right: usize,
    },
    CheckEquality {
        left: usize,
        right: usize,
    },
    ExtendEquality {
        from: usize,
        to: usize,
    },
    CheckConstant {
        slot: usize,
        value: Value,
    },
    ExtendConstant {
        slot: usize,
        value: Value,
    },
    CheckPatternCall {
        callee: MatcherReference,
        frame: CallFrame,
    },
    NegativeCall {
        callee: MatcherReference,
        frame: CallFrame,
    },
    Count {
        callee: MatcherReference,
        frame: CallFrame,
        result: usize,
        bind: bool,
    },
    Aggregate {
        callee: MatcherReference,
        frame: CallFrame,
        operator: Arc<dyn AggregationOperator>,
        /// Callee position folded by the operator
        aggregated: usize,
        result: usize,
        bind: bool,
    },
    ExpressionCheck {
        evaluator: Arc<dyn ExpressionEvaluator>,
        inputs: Vec<usize>,
    },
    ExpressionEval {
        evaluator: Arc<dyn ExpressionEvaluator>,
        inputs: Vec<usize>,
        output: usize,
        bind: bool,
    },
    CheckTransitiveClosure {
        callee: MatcherReference,
        source: usize,
        target: usize,
    },
}

impl SearchOperation {
    /// Slots this operation binds
    pub fn produced_slots(&self) -> Vec<usize> {
        match self {
            SearchOperation::IterateInstances { slot, .. }
            | SearchOperation::ExtendConstant { slot, .. } => vec![*slot],
            SearchOperation::ExtendFeatureForward { value, .. } => vec![*value],
            SearchOperation::ExtendFeatureBackward { holder, .. } => vec![*holder],
            SearchOperation::IterateFeatureViaSourceClass { holder, value, .. } => {
                vec![*holder, *value]
            }
            SearchOperation::ExtendEquality { to, .. } => vec![*to],
            SearchOperation::Count { result, bind, .. }
            | SearchOperation::Aggregate { result, bind, .. }
            | SearchOperation::ExpressionEval {
                output: result,
                bind,
                ..
            } if *bind => vec![*result],
            _ => Vec::new(),
        }
    }

    pub fn is_check(&self) -> bool {
        self.produced_slots().is_empty()
    }
}

impl fmt::Debug for SearchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for SearchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchOperation::IterateInstances { class, slot } => {
                write!(f, "iterate {class}(${slot})")
            }
            SearchOperation::CheckInstance { class, slot } => write!(f, "check {class}(${slot})"),
            SearchOperation::ExtendFeatureForward {
                feature,
                holder,
                value,
            } => write!(f, "extend ${holder}.{feature} -> ${value}"),
            SearchOperation::ExtendFeatureBackward {
                feature,
                holder,
                value,
            } => write!(f, "extend ${value} <- {feature}.${holder}"),
            SearchOperation::IterateFeatureViaSourceClass {
                class,
                feature,
                holder,
                value,
            } => write!(f, "iterate {class}(${holder}).{feature} -> ${value}"),
            SearchOperation::CheckFeature {
                feature,
                holder,
                value,
            } => write!(f, "check ${holder}.{feature} == ${value}"),
            SearchOperation::CheckInequality { left, right } => {
                write!(f, "check ${left} != ${right}")
            }
            SearchOperation::CheckEquality { left, right } => {
                write!(f, "check ${left} == ${right}")
            }
            SearchOperation::ExtendEquality { from, to } => write!(f, "extend ${to} := ${from}"),
            SearchOperation::CheckConstant { slot, value } => write!(f, "check ${slot} == {value}"),
            SearchOperation::ExtendConstant { slot, value } => {
                write!(f, "extend ${slot} := {value}")
            }
            SearchOperation::CheckPatternCall { callee, .. } => write!(f, "check find {callee}"),
            SearchOperation::NegativeCall { callee, .. } => write!(f, "check neg find {callee}"),
            SearchOperation::Count { callee, result, .. } => {
                write!(f, "${result} := count find {callee}")
            }
            SearchOperation::Aggregate {
                callee,
                operator,
                result,
                ..
            } => write!(f, "${result} := {} find {callee}", operator.name()),
            SearchOperation::ExpressionCheck { evaluator, .. } => {
                write!(f, "check {}", evaluator.name())
            }
            SearchOperation::ExpressionEval {
                evaluator, output, ..
            } => write!(f, "${output} := eval {}", evaluator.name()),
            SearchOperation::CheckTransitiveClosure {
                callee,
                source,
                target,
            } => write!(f, "check ${source} {callee}+ ${target}"),
        }
    }
}

/// Compiled local-search plan of one body under one adornment
#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub query: String,
    pub slots: VariableSlots,
    /// Slot of every query parameter
    pub parameter_slots: Vec<usize>,
    /// Parameter positions bound on entry
    pub adornment: BTreeSet<usize>,
    pub operations: Vec<SearchOperation>,
    pub dependencies: BTreeSet<MatcherReference>,
}

/// Everything plan compilation may consult besides the body itself
#[derive(Clone, Copy)]
pub struct CompileContext<'a> {
    pub catalog: &'a QueryCatalog,
    pub metamodel: &'a Metamodel,
}

/// Compile `plan` over the normalized `body` of `query`
pub fn compile_search_plan(
    ctx: CompileContext<'_>,
    query: &str,
    body: &PBody,
    plan: &SubPlan,
) -> PlanResult<SearchPlan> {
    plan.validate(body)?;
    let slots = VariableSlots::assign(body);
    let parameter_slots = body
        .parameters
        .iter()
        .map(|p| slots.slot(p))
        .collect::<PlanResult<Vec<_>>>()?;
    let entry = plan.entry_bound();
    let adornment = body
        .parameters
        .iter()
        .enumerate()
        .filter_map(|(i, p)| entry.contains(p).then_some(i))
        .collect();

    let mut operations = Vec::new();
    let mut dependencies = BTreeSet::new();
    for (index, bound) in plan.binding_states(body) {
        let bound_slots = slots.slots_of(&bound);
        let operation =
            compile_constraint(ctx, body, index, &bound_slots, &slots, &mut dependencies)?;
        operations.push(operation);
    }

    tracing::debug!(
        query,
        operations = operations.len(),
        dependencies = dependencies.len(),
        "search_plan_compiled"
    );
    Ok(SearchPlan {
        query: query.to_string(),
        slots,
        parameter_slots,
        adornment,
        operations,
        dependencies,
    })
}

fn compile_constraint(
    ctx: CompileContext<'_>,
    body: &PBody,
    index: usize,
    bound: &BTreeSet<usize>,
    slots: &VariableSlots,
    dependencies: &mut BTreeSet<MatcherReference>,
) -> PlanResult<SearchOperation> {
    let constraint = &body.constraints[index];
    let check = slots
        .slots_of(&body.affected_variables(index))
        .is_subset(bound);
    let slot = |v: &PVariable| slots.slot(v);
    let frame = |arguments: &[PVariable]| -> PlanResult<CallFrame> {
        let frame_slots = arguments.iter().map(slot).collect::<PlanResult<Vec<_>>>()?;
        Ok(CallFrame::new(frame_slots, bound))
    };

    let operation = match constraint {
        Constraint::TypeConstraint {
            key: InputKey::Class(class),
            variables,
        } => {
            let slot = slot(&variables[0])?;
            let class = class.to_string();
            if check {
                SearchOperation::CheckInstance { class, slot }
            } else {
                SearchOperation::IterateInstances { class, slot }
            }
        }
        Constraint::TypeConstraint {
            key: InputKey::Feature(feature),
            variables,
        } => {
            let holder = slot(&variables[0])?;
            let value = slot(&variables[1])?;
            let feature = feature.to_string();
            match (bound.contains(&holder), bound.contains(&value)) {
                (true, true) => SearchOperation::CheckFeature {
                    feature,
                    holder,
                    value,
                },
                (true, false) => SearchOperation::ExtendFeatureForward {
                    feature,
                    holder,
                    value,
                },
                (false, true) => SearchOperation::ExtendFeatureBackward {
                    feature,
                    holder,
                    value,
                },
                (false, false) => {
                    let Some(class) = ctx.metamodel.source_class(&feature) else {
                        return Err(PlanError::unsupported(
                            constraint.to_string(),
                            "neither endpoint bound and no source class declared",
                        ));
                    };
                    SearchOperation::IterateFeatureViaSourceClass {
                        class: class.to_string(),
                        feature,
                        holder,
                        value,
                    }
                }
            }
        }
        Constraint::Inequality { left, right } => {
            if !check {
                return Err(PlanError::unsupported(
                    constraint.to_string(),
                    "inequality can only check bound variables",
                ));
            }
            SearchOperation::CheckInequality {
                left: slot(left)?,
                right: slot(right)?,
            }
        }
        Constraint::Equality { left, right } => {
            let (left, right) = (slot(left)?, slot(right)?);
            match (bound.contains(&left), bound.contains(&right)) {
                (true, true) => SearchOperation::CheckEquality { left, right },
                (true, false) => SearchOperation::ExtendEquality {
                    from: left,
                    to: right,
                },
                (false, true) => SearchOperation::ExtendEquality {
                    from: right,
                    to: left,
                },
                (false, false) => {
                    return Err(PlanError::unsupported(
                        constraint.to_string(),
                        "equality needs one bound side",
                    ))
                }
            }
        }
        Constraint::ConstantValue { variable, value } => {
            let slot = slot(variable)?;
            let value = value.clone();
            if check {
                SearchOperation::CheckConstant { slot, value }
            } else {
                SearchOperation::ExtendConstant { slot, value }
            }
        }
        Constraint::PatternCall {
            query,
            arguments,
            negative: false,
        } => {
            if !check {
                return Err(PlanError::unsupported(
                    constraint.to_string(),
                    "local search can only check a positive pattern call",
                ));
            }
            let frame = frame(arguments)?;
            let callee = MatcherReference::new(query, frame.adornment());
            dependencies.insert(callee.clone());
            SearchOperation::CheckPatternCall { callee, frame }
        }
        Constraint::PatternCall {
            query,
            arguments,
            negative: true,
        } => {
            let frame = frame(arguments)?;
            let callee = MatcherReference::new(query, frame.adornment());
            dependencies.insert(callee.clone());
            SearchOperation::NegativeCall { callee, frame }
        }
        Constraint::PatternMatchCounter {
            query,
            arguments,
            result,
        } => {
            let frame = frame(arguments)?;
            let callee = MatcherReference::new(query, frame.adornment());
            dependencies.insert(callee.clone());
            let result = slot(result)?;
            SearchOperation::Count {
                callee,
                frame,
                result,
                bind: !bound.contains(&result),
            }
        }
        Constraint::Aggregate {
            operator,
            query,
            arguments,
            aggregated,
            result,
        } => {
            let operator = ctx.catalog.aggregator(operator)?;
            let aggregated = arguments
                .iter()
                .position(|a| a == aggregated)
                .ok_or_else(|| PlanError::UnknownVariable(aggregated.to_string()))?;
            let frame = frame(arguments)?;
            let callee = MatcherReference::new(query, frame.adornment());
            dependencies.insert(callee.clone());
            let result = slot(result)?;
            SearchOperation::Aggregate {
                callee,
                frame,
                operator,
                aggregated,
                result,
                bind: !bound.contains(&result),
            }
        }
        Constraint::ExpressionEvaluation {
            evaluator,
            inputs,
            output,
        } => {
            let evaluator = ctx.catalog.evaluator(evaluator)?;
            let inputs = inputs.iter().map(slot).collect::<PlanResult<Vec<_>>>()?;
            match output {
                None => SearchOperation::ExpressionCheck { evaluator, inputs },
                Some(output) => {
                    let output = slot(output)?;
                    SearchOperation::ExpressionEval {
                        evaluator,
                        inputs,
                        output,
                        bind: !bound.contains(&output),
                    }
                }
            }
        }
        Constraint::TransitiveClosure {
            query,
            source,
            target,
        } => {
            if !check {
                return Err(PlanError::unsupported(
                    constraint.to_string(),
                    "transitive closure can only be checked",
                ));
            }
            let callee = MatcherReference::new(query, BTreeSet::from([0]));
            dependencies.insert(callee.clone());
            SearchOperation::CheckTransitiveClosure {
                callee,
                source: slot(source)?,
                target: slot(target)?,
            }
        }
    };
    Ok(operation)
}
