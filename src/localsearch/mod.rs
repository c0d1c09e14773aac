//! Pull-based backtracking search.
//!
//! A [`SearchPlan`] is interpreted operation by operation over a frame of
//! optional values, one per variable slot. Extends enumerate candidates and
//! recurse once per candidate; checks either continue or cut the branch.
//! Nothing is cached between calls: every request re-walks the model
//! through the [`ModelIndex`] bulk queries.
//!
//! Calls to other queries go through a [`MatchSource`], which the engine
//! implements by dispatching to the callee's own backend.

use crate::catalog::MatcherReference;
use crate::error::{IntegrityIssue, PlanResult};
use crate::expression::is_truthy;
use crate::model::ModelIndex;
use crate::planner::search_plan::{CallFrame, SearchOperation, SearchPlan};
use crate::value::{Tuple, Value};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Supplier of callee matches during a search
pub trait MatchSource {
    /// Matches of `callee` agreeing with `binding` on its bound positions
    fn matches(&self, callee: &MatcherReference, binding: &[Option<Value>])
        -> PlanResult<Vec<Tuple>>;
}

impl<F> MatchSource for F
where
    F: Fn(&MatcherReference, &[Option<Value>]) -> PlanResult<Vec<Tuple>>,
{
    fn matches(
        &self,
        callee: &MatcherReference,
        binding: &[Option<Value>],
    ) -> PlanResult<Vec<Tuple>> {
        self(callee, binding)
    }
}

/// Whether `tuple` agrees with every bound position of `binding`
pub fn agrees_with(tuple: &Tuple, binding: &[Option<Value>]) -> bool {
    binding
        .iter()
        .enumerate()
        .all(|(i, b)| b.as_ref().is_none_or(|v| tuple.get(i) == Some(v)))
}

/// Matches collected during one execution, in discovery order
#[derive(Debug, Default)]
struct Collector {
    seen: HashSet<Tuple>,
    matches: Vec<Tuple>,
}

impl Collector {
    fn push(&mut self, tuple: Tuple) {
        if self.seen.insert(tuple.clone()) {
            self.matches.push(tuple);
        }
    }
}

pub struct SearchExecutor<'a> {
    model: &'a dyn ModelIndex,
    source: &'a dyn MatchSource,
    issues: Vec<IntegrityIssue>,
}

impl<'a> SearchExecutor<'a> {
    pub fn new(model: &'a dyn ModelIndex, source: &'a dyn MatchSource) -> Self {
        SearchExecutor {
            model,
            source,
            issues: Vec::new(),
        }
    }

    /// Distinct matches of `plan` agreeing with `binding`.
    ///
    /// `binding` has one entry per query parameter; its bound positions
    /// are expected to be the plan's adornment.
    pub fn execute(
        &mut self,
        plan: &SearchPlan,
        binding: &[Option<Value>],
    ) -> PlanResult<Vec<Tuple>> {
        let mut frame: Vec<Option<Value>> = vec![None; plan.slots.len()];
        for (position, value) in binding.iter().enumerate() {
            let (Some(value), Some(&slot)) = (value, plan.parameter_slots.get(position)) else {
                continue;
            };
            if !plan.adornment.contains(&position) {
                continue;
            }
            match &frame[slot] {
                Some(existing) if existing != value => return Ok(Vec::new()),
                _ => frame[slot] = Some(value.clone()),
            }
        }
        let mut out = Collector::default();
        self.step(plan, 0, &mut frame, &mut out)?;
        let matches: Vec<Tuple> = out
            .matches
            .into_iter()
            .filter(|m| agrees_with(m, binding))
            .collect();
        tracing::trace!(
            query = %plan.query,
            matches = matches.len(),
            "local_search_executed"
        );
        Ok(matches)
    }

    /// Integrity issues met since the last call
    pub fn take_issues(&mut self) -> Vec<IntegrityIssue> {
        std::mem::take(&mut self.issues)
    }

    fn step(
        &mut self,
        plan: &SearchPlan,
        at: usize,
        frame: &mut Vec<Option<Value>>,
        out: &mut Collector,
    ) -> PlanResult<()> {
        let Some(operation) = plan.operations.get(at) else {
            let values = plan
                .parameter_slots
                .iter()
                .map(|&s| frame[s].clone().unwrap_or(Value::Null))
                .collect();
            out.push(Tuple::new(values));
            return Ok(());
        };
        let model = self.model;
        let value = |slot: usize| frame[slot].clone();

        match operation {
            SearchOperation::IterateInstances { class, slot } => {
                for candidate in model.instances_of(class) {
                    self.bind(plan, at, frame, &[(*slot, candidate)], out)?;
                }
                Ok(())
            }
            SearchOperation::CheckInstance { class, slot } => {
                let ok = value(*slot).is_some_and(|v| model.is_instance(class, &v));
                self.pass(ok, plan, at, frame, out)
            }
            SearchOperation::ExtendFeatureForward {
                feature,
                holder,
                value: target,
            } => {
                let Some(h) = value(*holder) else {
                    return Ok(());
                };
                for candidate in model.values_of(&h, feature) {
                    self.bind(plan, at, frame, &[(*target, candidate)], out)?;
                }
                Ok(())
            }
            SearchOperation::ExtendFeatureBackward {
                feature,
                holder,
                value: target,
            } => {
                let Some(v) = value(*target) else {
                    return Ok(());
                };
                for candidate in model.holders_of(feature, &v) {
                    self.bind(plan, at, frame, &[(*holder, candidate)], out)?;
                }
                Ok(())
            }
            SearchOperation::IterateFeatureViaSourceClass {
                class,
                feature,
                holder,
                value: target,
            } => {
                for h in model.instances_of(class) {
                    for v in model.values_of(&h, feature) {
                        self.bind(plan, at, frame, &[(*holder, h.clone()), (*target, v)], out)?;
                    }
                }
                Ok(())
            }
            SearchOperation::CheckFeature {
                feature,
                holder,
                value: target,
            } => {
                let ok = match (value(*holder), value(*target)) {
                    (Some(h), Some(v)) => model.has_value(&h, feature, &v),
                    _ => false,
                };
                self.pass(ok, plan, at, frame, out)
            }
            SearchOperation::CheckInequality { left, right } => {
                let ok = value(*left) != value(*right);
                self.pass(ok, plan, at, frame, out)
            }
            SearchOperation::CheckEquality { left, right } => {
                let ok = value(*left).is_some() && value(*left) == value(*right);
                self.pass(ok, plan, at, frame, out)
            }
            SearchOperation::ExtendEquality { from, to } => match value(*from) {
                Some(v) => self.bind(plan, at, frame, &[(*to, v)], out),
                None => Ok(()),
            },
            SearchOperation::CheckConstant { slot, value: constant } => {
                let ok = value(*slot).as_ref() == Some(constant);
                self.pass(ok, plan, at, frame, out)
            }
            SearchOperation::ExtendConstant { slot, value: constant } => {
                self.bind(plan, at, frame, &[(*slot, constant.clone())], out)
            }
            SearchOperation::CheckPatternCall { callee, frame: call } => {
                let found = !self.call(callee, call, frame)?.is_empty();
                self.pass(found, plan, at, frame, out)
            }
            SearchOperation::NegativeCall { callee, frame: call } => {
                let found = !self.call(callee, call, frame)?.is_empty();
                self.pass(!found, plan, at, frame, out)
            }
            SearchOperation::Count {
                callee,
                frame: call,
                result,
                ..
            } => {
                let count = self.call(callee, call, frame)?.len();
                let count = Value::Int64(i64::try_from(count).unwrap_or(i64::MAX));
                self.bind(plan, at, frame, &[(*result, count)], out)
            }
            SearchOperation::Aggregate {
                callee,
                frame: call,
                operator,
                aggregated,
                result,
                ..
            } => {
                let matches = self.call(callee, call, frame)?;
                let folded = if matches.is_empty() {
                    operator.neutral()
                } else {
                    operator.aggregate(&mut matches.iter().filter_map(|m| m.get(*aggregated)))
                };
                match folded {
                    Some(v) => self.bind(plan, at, frame, &[(*result, v)], out),
                    None => Ok(()),
                }
            }
            SearchOperation::ExpressionCheck { evaluator, inputs } => {
                let args: Option<Vec<Value>> = inputs.iter().map(|&s| value(s)).collect();
                let Some(args) = args else {
                    return Ok(());
                };
                match evaluator.evaluate(&args) {
                    Ok(v) => self.pass(is_truthy(&v), plan, at, frame, out),
                    Err(e) => {
                        self.evaluation_failed(evaluator.name(), &args, &e.to_string());
                        Ok(())
                    }
                }
            }
            SearchOperation::ExpressionEval {
                evaluator,
                inputs,
                output,
                ..
            } => {
                let args: Option<Vec<Value>> = inputs.iter().map(|&s| value(s)).collect();
                let Some(args) = args else {
                    return Ok(());
                };
                match evaluator.evaluate(&args) {
                    Ok(v) => self.bind(plan, at, frame, &[(*output, v)], out),
                    Err(e) => {
                        self.evaluation_failed(evaluator.name(), &args, &e.to_string());
                        Ok(())
                    }
                }
            }
            SearchOperation::CheckTransitiveClosure {
                callee,
                source,
                target,
            } => {
                let ok = match (value(*source), value(*target)) {
                    (Some(from), Some(to)) => self.reaches(callee, from, &to)?,
                    _ => false,
                };
                self.pass(ok, plan, at, frame, out)
            }
        }
    }

    fn pass(
        &mut self,
        ok: bool,
        plan: &SearchPlan,
        at: usize,
        frame: &mut Vec<Option<Value>>,
        out: &mut Collector,
    ) -> PlanResult<()> {
        if ok {
            self.step(plan, at + 1, frame, out)
        } else {
            Ok(())
        }
    }

    /// Continue with `bindings` applied; an already bound slot must hold
    /// the same value
    fn bind(
        &mut self,
        plan: &SearchPlan,
        at: usize,
        frame: &mut Vec<Option<Value>>,
        bindings: &[(usize, Value)],
        out: &mut Collector,
    ) -> PlanResult<()> {
        let mut assigned = Vec::with_capacity(bindings.len());
        let mut consistent = true;
        for (slot, value) in bindings {
            match &frame[*slot] {
                Some(existing) => {
                    if existing != value {
                        consistent = false;
                        break;
                    }
                }
                None => {
                    frame[*slot] = Some(value.clone());
                    assigned.push(*slot);
                }
            }
        }
        let result = if consistent {
            self.step(plan, at + 1, frame, out)
        } else {
            Ok(())
        };
        for slot in assigned {
            frame[slot] = None;
        }
        result
    }

    /// Callee matches consistent with the caller frame
    fn call(
        &self,
        callee: &MatcherReference,
        call: &CallFrame,
        frame: &[Option<Value>],
    ) -> PlanResult<Vec<Tuple>> {
        let binding = call.binding(frame);
        let matches = self.source.matches(callee, &binding)?;
        Ok(matches
            .into_iter()
            .filter(|m| agrees_with(m, &binding) && call.is_consistent(m))
            .collect())
    }

    /// Whether `to` is reachable from `from` over one or more callee edges.
    ///
    /// `(a, a)` holds only for an explicit self-loop, never for a cycle
    /// through other nodes.
    fn reaches(&self, callee: &MatcherReference, from: Value, to: &Value) -> PlanResult<bool> {
        let mut visited: BTreeSet<Value> = BTreeSet::new();
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(node) = queue.pop_front() {
            for edge in self.source.matches(callee, &[Some(node.clone()), None])? {
                let Some(next) = edge.get(1) else {
                    continue;
                };
                if *next == from {
                    if node == from && next == to {
                        return Ok(true);
                    }
                    continue;
                }
                if next == to {
                    return Ok(true);
                }
                if visited.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        Ok(false)
    }

    fn evaluation_failed(&mut self, evaluator: &str, args: &[Value], message: &str) {
        let issue = IntegrityIssue::EvaluationFailed {
            evaluator: evaluator.to_string(),
            tuple: Tuple::new(args.to_vec()).to_string(),
            message: message.to_string(),
        };
        tracing::warn!(%issue, "local_search_evaluation_failed");
        self.issues.push(issue);
    }
}
