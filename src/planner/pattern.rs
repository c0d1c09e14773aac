//! Pattern model consumed by the planner.
//!
//! A [`PQuery`] has typed parameters and one or more [`PBody`]s
//! (disjunction). A body is a set of [`Constraint`]s over named variables
//! plus the list of variables exported as the query's parameters.

use super::Backend;
use crate::error::{PlanError, PlanResult};
use crate::model::InputKey;
use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Pattern variable
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PVariable(Arc<str>);

impl PVariable {
    pub fn new(name: &str) -> Self {
        PVariable(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PVariable {
    fn from(name: &str) -> Self {
        PVariable::new(name)
    }
}

impl fmt::Display for PVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn vars(names: &[&str]) -> Vec<PVariable> {
    names.iter().map(|n| PVariable::new(n)).collect()
}

/// Closed set of constraint kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constraint {
    /// Variables form a tuple of a base relation
    TypeConstraint {
        key: InputKey,
        variables: Vec<PVariable>,
    },
    PatternCall {
        query: String,
        arguments: Vec<PVariable>,
        negative: bool,
    },
    Inequality {
        left: PVariable,
        right: PVariable,
    },
    Equality {
        left: PVariable,
        right: PVariable,
    },
    ConstantValue {
        variable: PVariable,
        value: Value,
    },
    /// `result` is the number of matches of `query` for the bound arguments
    PatternMatchCounter {
        query: String,
        arguments: Vec<PVariable>,
        result: PVariable,
    },
    /// `result` folds `aggregated` over the matches of `query`
    Aggregate {
        operator: String,
        query: String,
        arguments: Vec<PVariable>,
        aggregated: PVariable,
        result: PVariable,
    },
    /// Check (`output == None`) or evaluation bound to `output`
    ExpressionEvaluation {
        evaluator: String,
        inputs: Vec<PVariable>,
        output: Option<PVariable>,
    },
    /// `(source, target)` is in the transitive closure of binary `query`
    TransitiveClosure {
        query: String,
        source: PVariable,
        target: PVariable,
    },
}

impl Constraint {
    pub fn instance_of(class: &str, variable: &str) -> Self {
        Constraint::TypeConstraint {
            key: InputKey::class(class),
            variables: vars(&[variable]),
        }
    }

    pub fn feature(feature: &str, holder: &str, value: &str) -> Self {
        Constraint::TypeConstraint {
            key: InputKey::feature(feature),
            variables: vars(&[holder, value]),
        }
    }

    pub fn call(query: &str, arguments: &[&str]) -> Self {
        Constraint::PatternCall {
            query: query.to_string(),
            arguments: vars(arguments),
            negative: false,
        }
    }

    pub fn neg_call(query: &str, arguments: &[&str]) -> Self {
        Constraint::PatternCall {
            query: query.to_string(),
            arguments: vars(arguments),
            negative: true,
        }
    }

    pub fn inequality(left: &str, right: &str) -> Self {
        Constraint::Inequality {
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn equality(left: &str, right: &str) -> Self {
        Constraint::Equality {
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn constant(variable: &str, value: impl Into<Value>) -> Self {
        Constraint::ConstantValue {
            variable: variable.into(),
            value: value.into(),
        }
    }

    pub fn count(query: &str, arguments: &[&str], result: &str) -> Self {
        Constraint::PatternMatchCounter {
            query: query.to_string(),
            arguments: vars(arguments),
            result: result.into(),
        }
    }

    pub fn aggregate(
        operator: &str,
        query: &str,
        arguments: &[&str],
        aggregated: &str,
        result: &str,
    ) -> Self {
        Constraint::Aggregate {
            operator: operator.to_string(),
            query: query.to_string(),
            arguments: vars(arguments),
            aggregated: aggregated.into(),
            result: result.into(),
        }
    }

    pub fn check(evaluator: &str, inputs: &[&str]) -> Self {
        Constraint::ExpressionEvaluation {
            evaluator: evaluator.to_string(),
            inputs: vars(inputs),
            output: None,
        }
    }

    pub fn eval(evaluator: &str, inputs: &[&str], output: &str) -> Self {
        Constraint::ExpressionEvaluation {
            evaluator: evaluator.to_string(),
            inputs: vars(inputs),
            output: Some(output.into()),
        }
    }

    pub fn closure(query: &str, source: &str, target: &str) -> Self {
        Constraint::TransitiveClosure {
            query: query.to_string(),
            source: source.into(),
            target: target.into(),
        }
    }

    /// Every variable mentioned, in order of appearance
    pub fn variables(&self) -> Vec<&PVariable> {
        match self {
            Constraint::TypeConstraint { variables, .. } => variables.iter().collect(),
            Constraint::PatternCall { arguments, .. } => arguments.iter().collect(),
            Constraint::Inequality { left, right } | Constraint::Equality { left, right } => {
                vec![left, right]
            }
            Constraint::ConstantValue { variable, .. } => vec![variable],
            Constraint::PatternMatchCounter {
                arguments, result, ..
            }
            | Constraint::Aggregate {
                arguments, result, ..
            } => arguments.iter().chain(std::iter::once(result)).collect(),
            Constraint::ExpressionEvaluation { inputs, output, .. } => {
                inputs.iter().chain(output.iter()).collect()
            }
            Constraint::TransitiveClosure { source, target, .. } => vec![source, target],
        }
    }

    /// Query called by this constraint, if any
    pub fn called_query(&self) -> Option<&str> {
        match self {
            Constraint::PatternCall { query, .. }
            | Constraint::PatternMatchCounter { query, .. }
            | Constraint::Aggregate { query, .. }
            | Constraint::TransitiveClosure { query, .. } => Some(query),
            _ => None,
        }
    }

    /// Whether the constraint reads its callee through a closed-world
    /// operator (negation, counting, aggregation)
    pub fn is_closed_world_call(&self) -> bool {
        matches!(
            self,
            Constraint::PatternCall { negative: true, .. }
                | Constraint::PatternMatchCounter { .. }
                | Constraint::Aggregate { .. }
        )
    }

    /// Rewrite every variable through `f`
    pub fn rename(&self, f: &impl Fn(&PVariable) -> PVariable) -> Constraint {
        let all = |vs: &[PVariable]| vs.iter().map(f).collect::<Vec<_>>();
        match self {
            Constraint::TypeConstraint { key, variables } => Constraint::TypeConstraint {
                key: key.clone(),
                variables: all(variables),
            },
            Constraint::PatternCall {
                query,
                arguments,
                negative,
            } => Constraint::PatternCall {
                query: query.clone(),
                arguments: all(arguments),
                negative: *negative,
            },
            Constraint::Inequality { left, right } => Constraint::Inequality {
                left: f(left),
                right: f(right),
            },
            Constraint::Equality { left, right } => Constraint::Equality {
                left: f(left),
                right: f(right),
            },
            Constraint::ConstantValue { variable, value } => Constraint::ConstantValue {
                variable: f(variable),
                value: value.clone(),
            },
            Constraint::PatternMatchCounter {
                query,
                arguments,
                result,
            } => Constraint::PatternMatchCounter {
                query: query.clone(),
                arguments: all(arguments),
                result: f(result),
            },
            Constraint::Aggregate {
                operator,
                query,
                arguments,
                aggregated,
                result,
            } => Constraint::Aggregate {
                operator: operator.clone(),
                query: query.clone(),
                arguments: all(arguments),
                aggregated: f(aggregated),
                result: f(result),
            },
            Constraint::ExpressionEvaluation {
                evaluator,
                inputs,
                output,
            } => Constraint::ExpressionEvaluation {
                evaluator: evaluator.clone(),
                inputs: all(inputs),
                output: output.as_ref().map(f),
            },
            Constraint::TransitiveClosure {
                query,
                source,
                target,
            } => Constraint::TransitiveClosure {
                query: query.clone(),
                source: f(source),
                target: f(target),
            },
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |vs: &[PVariable]| {
            vs.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Constraint::TypeConstraint { key, variables } => {
                write!(f, "{}({})", key.name(), join(variables))
            }
            Constraint::PatternCall {
                query,
                arguments,
                negative,
            } => {
                let prefix = if *negative { "neg find" } else { "find" };
                write!(f, "{prefix} {query}({})", join(arguments))
            }
            Constraint::Inequality { left, right } => write!(f, "{left} != {right}"),
            Constraint::Equality { left, right } => write!(f, "{left} == {right}"),
            Constraint::ConstantValue { variable, value } => write!(f, "{variable} == {value}"),
            Constraint::PatternMatchCounter {
                query,
                arguments,
                result,
            } => write!(f, "{result} == count find {query}({})", join(arguments)),
            Constraint::Aggregate {
                operator,
                query,
                arguments,
                aggregated,
                result,
            } => write!(
                f,
                "{result} == {operator} find {query}({})#{aggregated}",
                join(arguments)
            ),
            Constraint::ExpressionEvaluation {
                evaluator,
                inputs,
                output: Some(output),
            } => write!(f, "{output} == eval {evaluator}({})", join(inputs)),
            Constraint::ExpressionEvaluation {
                evaluator, inputs, ..
            } => write!(f, "check {evaluator}({})", join(inputs)),
            Constraint::TransitiveClosure {
                query,
                source,
                target,
            } => write!(f, "find {query}+({source}, {target})"),
        }
    }
}

/// One conjunctive body of a query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PBody {
    /// Variables exported as the query's parameters, in parameter order
    pub parameters: Vec<PVariable>,
    pub constraints: Vec<Constraint>,
}

impl PBody {
    pub fn new(parameters: &[&str]) -> Self {
        PBody {
            parameters: vars(parameters),
            constraints: Vec::new(),
        }
    }

    pub fn with(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// All variables of the body
    pub fn variables(&self) -> BTreeSet<PVariable> {
        self.parameters
            .iter()
            .chain(self.constraints.iter().flat_map(Constraint::variables))
            .cloned()
            .collect()
    }

    /// A variable is local to constraint `index` if nothing else mentions it
    pub fn is_local(&self, variable: &PVariable, index: usize) -> bool {
        !self.parameters.contains(variable)
            && self
                .constraints
                .iter()
                .enumerate()
                .all(|(i, c)| i == index || !c.variables().contains(&variable))
    }

    /// Variables whose binding state decides check vs. extend
    pub fn affected_variables(&self, index: usize) -> BTreeSet<PVariable> {
        let constraint = &self.constraints[index];
        match constraint {
            Constraint::PatternCall { negative: true, .. }
            | Constraint::PatternMatchCounter { .. }
            | Constraint::Aggregate { .. } => constraint
                .variables()
                .into_iter()
                .filter(|v| !self.is_local(v, index))
                .cloned()
                .collect(),
            _ => constraint.variables().into_iter().cloned().collect(),
        }
    }

    /// Variables that must be bound before the constraint can be applied
    pub fn deferred_variables(&self, index: usize) -> BTreeSet<PVariable> {
        match &self.constraints[index] {
            Constraint::PatternCall {
                negative: true,
                arguments,
                ..
            } => arguments
                .iter()
                .filter(|v| !self.is_local(v, index))
                .cloned()
                .collect(),
            Constraint::PatternMatchCounter { arguments, .. }
            | Constraint::Aggregate { arguments, .. } => arguments
                .iter()
                .filter(|v| !self.is_local(v, index))
                .cloned()
                .collect(),
            Constraint::Inequality { left, right } => [left.clone(), right.clone()].into(),
            Constraint::ExpressionEvaluation { inputs, .. } => inputs.iter().cloned().collect(),
            Constraint::TransitiveClosure { source, .. } => BTreeSet::from([source.clone()]),
            _ => BTreeSet::new(),
        }
    }

    /// Variables newly bound when the constraint is applied as an extend
    pub fn produced_variables(&self, index: usize) -> BTreeSet<PVariable> {
        let affected = self.affected_variables(index);
        let deferred = self.deferred_variables(index);
        affected.difference(&deferred).cloned().collect()
    }

    /// Merge variables related by `Equality` constraints.
    ///
    /// Parameters are preferred as class representatives, equalities become
    /// trivial and are dropped, as are duplicate constraints.
    pub fn normalize(&self) -> PBody {
        let mut parent: BTreeMap<PVariable, PVariable> = BTreeMap::new();
        fn find(parent: &BTreeMap<PVariable, PVariable>, v: &PVariable) -> PVariable {
            let mut current = v.clone();
            while let Some(next) = parent.get(&current) {
                if *next == current {
                    break;
                }
                current = next.clone();
            }
            current
        }
        for constraint in &self.constraints {
            if let Constraint::Equality { left, right } = constraint {
                let a = find(&parent, left);
                let b = find(&parent, right);
                if a == b {
                    continue;
                }
                let a_param = self.parameters.contains(&a);
                let b_param = self.parameters.contains(&b);
                // keep a parameter (or the smaller name) as representative
                let (root, child) = if a_param && !b_param {
                    (a, b)
                } else if b_param && !a_param {
                    (b, a)
                } else if a <= b {
                    (a, b)
                } else {
                    (b, a)
                };
                parent.insert(child, root);
            }
        }
        let rename = |v: &PVariable| find(&parent, v);
        let mut constraints: Vec<Constraint> = Vec::new();
        for constraint in &self.constraints {
            let renamed = constraint.rename(&rename);
            if matches!(&renamed, Constraint::Equality { left, right } if left == right) {
                continue;
            }
            if !constraints.contains(&renamed) {
                constraints.push(renamed);
            }
        }
        PBody {
            parameters: self.parameters.iter().map(rename).collect(),
            constraints,
        }
    }
}

/// Query parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PParameter {
    pub name: String,
    /// Expected kind of every value at this position, if declared
    pub kind: Option<ValueKind>,
}

/// A named graph pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PQuery {
    pub name: String,
    pub parameters: Vec<PParameter>,
    pub bodies: Vec<PBody>,
    /// Preferred backend; the engine default applies when absent
    pub backend: Option<Backend>,
}

impl PQuery {
    pub fn new(name: &str, parameters: &[&str]) -> Self {
        PQuery {
            name: name.to_string(),
            parameters: parameters
                .iter()
                .map(|p| PParameter {
                    name: (*p).to_string(),
                    kind: None,
                })
                .collect(),
            bodies: Vec::new(),
            backend: None,
        }
    }

    pub fn with_body(mut self, body: PBody) -> Self {
        self.bodies.push(body);
        self
    }

    /// Declare the kind of parameter `name`
    pub fn typed(mut self, name: &str, kind: ValueKind) -> Self {
        if let Some(p) = self.parameters.iter_mut().find(|p| p.name == name) {
            p.kind = Some(kind);
        }
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn arity(&self) -> usize {
        self.parameters.len()
    }

    pub fn parameter_position(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    /// Queries called from any body
    pub fn called_queries(&self) -> BTreeSet<String> {
        self.bodies
            .iter()
            .flat_map(|b| b.constraints.iter())
            .filter_map(Constraint::called_query)
            .map(str::to_string)
            .collect()
    }

    /// Structural checks independent of other queries
    pub fn validate(&self) -> PlanResult<()> {
        if self.bodies.is_empty() {
            return Err(PlanError::MalformedPlan(format!(
                "query {} has no body",
                self.name
            )));
        }
        for body in &self.bodies {
            if body.parameters.len() != self.arity() {
                return Err(PlanError::ArityMismatch {
                    query: self.name.clone(),
                    expected: self.arity(),
                    actual: body.parameters.len(),
                });
            }
            for constraint in &body.constraints {
                if let Constraint::TypeConstraint { key, variables } = constraint {
                    if variables.len() != key.arity() {
                        return Err(PlanError::MalformedPlan(format!(
                            "{constraint} has {} variables, {key} needs {}",
                            variables.len(),
                            key.arity()
                        )));
                    }
                }
                if let Constraint::Aggregate {
                    arguments,
                    aggregated,
                    ..
                } = constraint
                {
                    if !arguments.contains(aggregated) {
                        return Err(PlanError::UnknownVariable(format!(
                            "{aggregated} is not an argument of {constraint}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(name: &str) -> PVariable {
        PVariable::new(name)
    }

    #[test]
    fn test_local_variables_of_negative_call() {
        let body = PBody::new(&["x"])
            .with(Constraint::instance_of("A", "x"))
            .with(Constraint::neg_call("q", &["x", "tmp"]));
        assert!(body.is_local(&v("tmp"), 1));
        assert!(!body.is_local(&v("x"), 1));
        assert_eq!(body.affected_variables(1), BTreeSet::from([v("x")]));
        assert_eq!(body.deferred_variables(1), BTreeSet::from([v("x")]));
        assert!(body.produced_variables(1).is_empty());
    }

    #[test]
    fn test_count_produces_result() {
        let body = PBody::new(&["x", "n"])
            .with(Constraint::instance_of("A", "x"))
            .with(Constraint::count("q", &["x", "y"], "n"));
        assert_eq!(body.produced_variables(1), BTreeSet::from([v("n")]));
    }

    #[test]
    fn test_normalize_prefers_parameters() {
        let body = PBody::new(&["x"])
            .with(Constraint::instance_of("A", "tmp"))
            .with(Constraint::equality("tmp", "x"))
            .with(Constraint::instance_of("A", "x"));
        let normalized = body.normalize();
        assert_eq!(normalized.parameters, vec![v("x")]);
        assert_eq!(
            normalized.constraints,
            vec![Constraint::instance_of("A", "x")]
        );
    }

    #[test]
    fn test_normalize_chains() {
        let body = PBody::new(&["a", "b"])
            .with(Constraint::equality("a", "m"))
            .with(Constraint::equality("m", "b"))
            .with(Constraint::feature("f", "a", "b"));
        let normalized = body.normalize();
        assert_eq!(normalized.parameters[0], normalized.parameters[1]);
        assert_eq!(normalized.constraints.len(), 1);
    }

    #[test]
    fn test_validate_arity() {
        let query = PQuery::new("p", &["x", "y"]).with_body(PBody::new(&["x"]));
        assert!(matches!(
            query.validate(),
            Err(PlanError::ArityMismatch { expected: 2, .. })
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Constraint::neg_call("q", &["x"]).to_string(), "neg find q(x)");
        assert_eq!(
            Constraint::count("q", &["x"], "n").to_string(),
            "n == count find q(x)"
        );
    }
}
