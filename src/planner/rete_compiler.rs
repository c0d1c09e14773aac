//! Rete compilation: plan -> recipe.
//!
//! Every intermediate result is a [`Trace`]: a recipe plus the variable
//! held by each of its columns. Applying a constraint turns the current
//! trace into a wider or filtered one:
//!
//! | constraint            | check                    | extend                           |
//! |-----------------------|--------------------------|----------------------------------|
//! | type / positive call  | join on common columns   | join on common columns           |
//! | negative call         | anti-join                | (deferred, always a check)       |
//! | count / aggregate     | outer join + equality    | outer join with neutral default  |
//! | inequality            | inequality filter        | unsupported                      |
//! | constant              | constant filter          | cross product with a constant    |
//! | expression            | check node / bind + eq.  | bind node                        |
//! | transitive closure    | join with closure node   | join with closure node           |
//!
//! Calls to other queries (and to the query itself) refer to their
//! production node by name; the engine allocates productions before
//! building, which is what makes recursion possible.

use super::pattern::{Constraint, PBody, PVariable};
use super::plan::SubPlan;
use crate::catalog::{MatcherReference, QueryCatalog};
use crate::error::{PlanError, PlanResult};
use crate::rete::node::ExpressionMode;
use crate::rete::recipe::ReteRecipe;
use crate::value::{Mask, Tuple};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Recipe of one body plus the queries it reads
#[derive(Debug, Clone)]
pub struct CompiledBody {
    pub recipe: Arc<ReteRecipe>,
    pub dependencies: BTreeSet<MatcherReference>,
}

/// Recipe with one variable per column
#[derive(Debug, Clone)]
struct Trace {
    recipe: Arc<ReteRecipe>,
    columns: Vec<PVariable>,
}

impl Trace {
    fn unit() -> Self {
        Trace {
            recipe: Arc::new(ReteRecipe::unit()),
            columns: Vec::new(),
        }
    }

    fn position(&self, variable: &PVariable) -> PlanResult<usize> {
        self.columns
            .iter()
            .position(|c| c == variable)
            .ok_or_else(|| PlanError::UnknownVariable(variable.to_string()))
    }

    fn arity(&self) -> usize {
        self.columns.len()
    }

    fn with(self, recipe: ReteRecipe, columns: Vec<PVariable>) -> Self {
        Trace {
            recipe: Arc::new(recipe),
            columns,
        }
    }

    /// Source relation whose columns carry `variables`; repeated variables
    /// become an equality filter followed by a trim to distinct columns
    fn source(recipe: ReteRecipe, variables: &[PVariable]) -> Self {
        let mut distinct: Vec<PVariable> = Vec::new();
        let mut keep = Vec::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (i, v) in variables.iter().enumerate() {
            match distinct.iter().position(|d| d == v) {
                Some(first) => {
                    let at = keep[first];
                    match groups.iter_mut().find(|g| g[0] == at) {
                        Some(group) => group.push(i),
                        None => groups.push(vec![at, i]),
                    }
                }
                None => {
                    distinct.push(v.clone());
                    keep.push(i);
                }
            }
        }
        let mut recipe = Arc::new(recipe);
        if !groups.is_empty() {
            let arity = variables.len();
            recipe = Arc::new(ReteRecipe::Trim {
                parent: Arc::new(ReteRecipe::EqualityFilter {
                    parent: recipe,
                    groups,
                }),
                mask: Mask::new(keep, arity),
            });
        }
        Trace {
            recipe,
            columns: distinct,
        }
    }

    /// Keep `variables`, in this order
    fn project(self, variables: &[PVariable]) -> PlanResult<Self> {
        let indices = variables
            .iter()
            .map(|v| self.position(v))
            .collect::<PlanResult<Vec<_>>>()?;
        let mask = Mask::new(indices, self.arity());
        if mask.is_identity() {
            return Ok(self);
        }
        let recipe = ReteRecipe::Trim {
            parent: self.recipe.clone(),
            mask,
        };
        Ok(self.with(recipe, variables.to_vec()))
    }

    /// Natural join on the shared variables
    fn join(self, other: Trace) -> Self {
        if self.recipe.is_unit() {
            return other;
        }
        if other.recipe.is_unit() {
            return self;
        }
        let (primary_cols, secondary_cols) = shared_columns(&self, &other);
        let mut columns = self.columns.clone();
        columns.extend(
            other
                .columns
                .iter()
                .enumerate()
                .filter(|(i, _)| !secondary_cols.contains(i))
                .map(|(_, v)| v.clone()),
        );
        let recipe = ReteRecipe::Join {
            primary: self.recipe.clone(),
            primary_mask: Mask::new(primary_cols, self.arity()),
            secondary: other.recipe.clone(),
            secondary_mask: Mask::new(secondary_cols, other.arity()),
        };
        self.with(recipe, columns)
    }

    fn exists(self, other: &Trace, negative: bool) -> Self {
        let (primary_cols, secondary_cols) = shared_columns(&self, other);
        let recipe = ReteRecipe::Existence {
            primary: self.recipe.clone(),
            primary_mask: Mask::new(primary_cols, self.arity()),
            secondary: other.recipe.clone(),
            secondary_mask: Mask::new(secondary_cols, other.arity()),
            negative,
        };
        let columns = self.columns.clone();
        self.with(recipe, columns)
    }

    /// Drop the last column after checking it equals `variable`
    fn unify_last(self, variable: &PVariable) -> PlanResult<Self> {
        let target = self.position(variable)?;
        let last = self.arity() - 1;
        let filtered = ReteRecipe::EqualityFilter {
            parent: self.recipe.clone(),
            groups: vec![vec![target, last]],
        };
        let recipe = ReteRecipe::Trim {
            parent: Arc::new(filtered),
            mask: Mask::new((0..last).collect(), self.arity()),
        };
        let mut columns = self.columns.clone();
        columns.pop();
        Ok(self.with(recipe, columns))
    }
}

/// Positions of the variables both traces carry, in `left` column order
fn shared_columns(left: &Trace, right: &Trace) -> (Vec<usize>, Vec<usize>) {
    left.columns
        .iter()
        .enumerate()
        .filter_map(|(i, v)| right.columns.iter().position(|c| c == v).map(|j| (i, j)))
        .unzip()
}

/// Compile `plan` over the normalized `body` of `query` into a recipe
/// producing the body parameters
pub fn compile_body(
    catalog: &QueryCatalog,
    query: &str,
    body: &PBody,
    plan: &SubPlan,
) -> PlanResult<CompiledBody> {
    plan.validate(body)?;
    if !plan.entry_bound().is_empty() {
        return Err(PlanError::MalformedPlan(
            "rete plans start with no bound variable".to_string(),
        ));
    }
    let mut compiler = ReteCompiler {
        catalog,
        body,
        dependencies: BTreeSet::new(),
    };
    let trace = compiler.compile(plan)?;
    tracing::debug!(
        query,
        recipe = %trace.recipe,
        size = trace.recipe.size(),
        "rete_body_compiled"
    );
    Ok(CompiledBody {
        recipe: trace.recipe,
        dependencies: compiler.dependencies,
    })
}

struct ReteCompiler<'a> {
    catalog: &'a QueryCatalog,
    body: &'a PBody,
    dependencies: BTreeSet<MatcherReference>,
}

impl ReteCompiler<'_> {
    fn compile(&mut self, plan: &SubPlan) -> PlanResult<Trace> {
        match plan {
            SubPlan::Start { .. } => Ok(Trace::unit()),
            SubPlan::Apply { parent, constraint } => {
                let trace = self.compile(parent)?;
                self.apply(trace, *constraint)
            }
            SubPlan::Project { parent, variables } => {
                let trace = self.compile(parent)?;
                if variables.iter().collect::<BTreeSet<_>>().len() == variables.len() {
                    return trace.project(variables);
                }
                // parameters merged by normalization share a column
                let indices = variables
                    .iter()
                    .map(|v| trace.position(v))
                    .collect::<PlanResult<Vec<_>>>()?;
                let recipe = ReteRecipe::Trim {
                    parent: trace.recipe.clone(),
                    mask: Mask::new(indices, trace.arity()),
                };
                Ok(trace.with(recipe, variables.clone()))
            }
            SubPlan::Join { left, right } => {
                let left = self.compile(left)?;
                let right = self.compile(right)?;
                Ok(left.join(right))
            }
        }
    }

    /// Callee match set with one column per argument
    fn call(&mut self, query: &str, arguments: &[PVariable], bound: &Trace) -> PlanResult<Trace> {
        let arity = self.catalog.query(query)?.arity();
        let adornment = arguments
            .iter()
            .enumerate()
            .filter_map(|(i, a)| bound.columns.contains(a).then_some(i))
            .collect();
        self.dependencies
            .insert(MatcherReference::new(query, adornment));
        let recipe = ReteRecipe::Production {
            query: query.to_string(),
            arity,
        };
        Ok(Trace::source(recipe, arguments))
    }

    fn apply(&mut self, trace: Trace, index: usize) -> PlanResult<Trace> {
        let body = self.body;
        let constraint = &body.constraints[index];
        let bound: BTreeSet<&PVariable> = trace.columns.iter().collect();
        let is_bound = |v: &PVariable| bound.contains(v);

        match constraint {
            Constraint::TypeConstraint { key, variables } => {
                let source = Trace::source(ReteRecipe::Input { key: key.clone() }, variables);
                Ok(trace.join(source))
            }
            Constraint::PatternCall {
                query,
                arguments,
                negative: false,
            } => {
                let callee = self.call(query, arguments, &trace)?;
                Ok(trace.join(callee))
            }
            Constraint::PatternCall {
                query,
                arguments,
                negative: true,
            } => {
                let outer: Vec<PVariable> = non_local(body, arguments, index);
                let callee = self.call(query, arguments, &trace)?.project(&outer)?;
                Ok(trace.exists(&callee, true))
            }
            Constraint::Inequality { left, right } => {
                if !(is_bound(left) && is_bound(right)) {
                    return Err(PlanError::unsupported(
                        constraint.to_string(),
                        "inequality can only check bound variables",
                    ));
                }
                let recipe = ReteRecipe::InequalityFilter {
                    parent: trace.recipe.clone(),
                    left: trace.position(left)?,
                    right: trace.position(right)?,
                };
                let columns = trace.columns.clone();
                Ok(trace.with(recipe, columns))
            }
            Constraint::Equality { left, right } => {
                match (is_bound(left), is_bound(right)) {
                    (true, true) => {
                        let recipe = ReteRecipe::EqualityFilter {
                            parent: trace.recipe.clone(),
                            groups: vec![vec![trace.position(left)?, trace.position(right)?]],
                        };
                        let columns = trace.columns.clone();
                        Ok(trace.with(recipe, columns))
                    }
                    (true, false) | (false, true) => {
                        let (from, to) = if is_bound(left) {
                            (left, right)
                        } else {
                            (right, left)
                        };
                        // a repeated mask index copies the column
                        let mut indices: Vec<usize> = (0..trace.arity()).collect();
                        indices.push(trace.position(from)?);
                        let recipe = ReteRecipe::Trim {
                            parent: trace.recipe.clone(),
                            mask: Mask::new(indices, trace.arity()),
                        };
                        let mut columns = trace.columns.clone();
                        columns.push(to.clone());
                        Ok(trace.with(recipe, columns))
                    }
                    (false, false) => Err(PlanError::unsupported(
                        constraint.to_string(),
                        "equality needs one bound side",
                    )),
                }
            }
            Constraint::ConstantValue { variable, value } => {
                if is_bound(variable) {
                    let recipe = ReteRecipe::ConstantFilter {
                        parent: trace.recipe.clone(),
                        column: trace.position(variable)?,
                        value: value.clone(),
                    };
                    let columns = trace.columns.clone();
                    return Ok(trace.with(recipe, columns));
                }
                let constant = Trace {
                    recipe: Arc::new(ReteRecipe::Constant {
                        tuples: vec![Tuple::new(vec![value.clone()])],
                        arity: 1,
                    }),
                    columns: vec![variable.clone()],
                };
                Ok(trace.join(constant))
            }
            Constraint::PatternMatchCounter {
                query,
                arguments,
                result,
            } => {
                let callee = self.call(query, arguments, &trace)?;
                let groups = non_local(body, arguments, index);
                self.fold(trace, callee, &groups, "count", None, result)
            }
            Constraint::Aggregate {
                operator,
                query,
                arguments,
                aggregated,
                result,
            } => {
                if !body.is_local(aggregated, index) {
                    return Err(PlanError::unsupported(
                        constraint.to_string(),
                        "the aggregated variable must be local to the call",
                    ));
                }
                let callee = self.call(query, arguments, &trace)?;
                let column = callee.position(aggregated)?;
                let groups = non_local(body, arguments, index);
                self.fold(trace, callee, &groups, operator, Some(column), result)
            }
            Constraint::ExpressionEvaluation {
                evaluator,
                inputs,
                output,
            } => {
                self.catalog.evaluator(evaluator)?;
                let positions = inputs
                    .iter()
                    .map(|v| trace.position(v))
                    .collect::<PlanResult<Vec<_>>>()?;
                let mode = match output {
                    None => ExpressionMode::Check,
                    Some(_) => ExpressionMode::Bind,
                };
                let recipe = ReteRecipe::Expression {
                    parent: trace.recipe.clone(),
                    evaluator: evaluator.clone(),
                    inputs: positions,
                    mode,
                };
                let mut columns = trace.columns.clone();
                match output {
                    None => Ok(trace.with(recipe, columns)),
                    Some(output) if is_bound(output) => {
                        columns.push(PVariable::new(&format!("{output}'")));
                        trace.with(recipe, columns).unify_last(output)
                    }
                    Some(output) => {
                        columns.push(output.clone());
                        Ok(trace.with(recipe, columns))
                    }
                }
            }
            Constraint::TransitiveClosure {
                query,
                source,
                target,
            } => {
                let arity = self.catalog.query(query)?.arity();
                if arity != 2 {
                    return Err(PlanError::ArityMismatch {
                        query: query.clone(),
                        expected: 2,
                        actual: arity,
                    });
                }
                self.dependencies
                    .insert(MatcherReference::new(query, BTreeSet::from([0])));
                let closure = ReteRecipe::TransitiveClosure {
                    parent: Arc::new(ReteRecipe::Production {
                        query: query.clone(),
                        arity: 2,
                    }),
                };
                let pairs = Trace::source(closure, &[source.clone(), target.clone()]);
                Ok(trace.join(pairs))
            }
        }
    }

    /// Attach `operator` folded over `callee` grouped by `groups` as the
    /// value of `result`. Groups without matches take the operator's
    /// neutral value, or drop the row if it has none.
    fn fold(
        &mut self,
        trace: Trace,
        callee: Trace,
        groups: &[PVariable],
        operator: &str,
        column: Option<usize>,
        result: &PVariable,
    ) -> PlanResult<Trace> {
        let op = self.catalog.aggregator(operator)?;
        let group_positions = groups
            .iter()
            .map(|g| callee.position(g))
            .collect::<PlanResult<Vec<_>>>()?;
        let aggregated = ReteRecipe::Aggregate {
            parent: callee.recipe.clone(),
            group_mask: Mask::new(group_positions, callee.arity()),
            operator: operator.to_string(),
            column,
        };
        let width = groups.len() + 1;
        let primary_mask = Mask::new(
            groups
                .iter()
                .map(|g| trace.position(g))
                .collect::<PlanResult<Vec<_>>>()?,
            trace.arity(),
        );
        let secondary_mask = Mask::new((0..groups.len()).collect(), width);
        let result_bound = trace.columns.contains(result);
        let value_column = if result_bound {
            PVariable::new(&format!("{result}'"))
        } else {
            result.clone()
        };
        let recipe = match op.neutral() {
            Some(neutral) => ReteRecipe::OuterJoin {
                primary: trace.recipe.clone(),
                primary_mask,
                secondary: Arc::new(aggregated),
                secondary_mask,
                defaults: Tuple::new(vec![neutral]),
            },
            None => ReteRecipe::Join {
                primary: trace.recipe.clone(),
                primary_mask,
                secondary: Arc::new(aggregated),
                secondary_mask,
            },
        };
        let mut columns = trace.columns.clone();
        columns.push(value_column);
        let folded = trace.with(recipe, columns);
        if result_bound {
            folded.unify_last(result)
        } else {
            Ok(folded)
        }
    }
}

/// Arguments of call `index` visible outside it, first occurrence order
fn non_local(body: &PBody, arguments: &[PVariable], index: usize) -> Vec<PVariable> {
    let mut out: Vec<PVariable> = Vec::new();
    for a in arguments {
        if !body.is_local(a, index) && !out.contains(a) {
            out.push(a.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{Backend, GreedyOrderer, PQuery};

    fn catalog() -> QueryCatalog {
        let mut catalog = QueryCatalog::new();
        catalog
            .register(
                PQuery::new("edge", &["x", "y"])
                    .with_body(PBody::new(&["x", "y"]).with(Constraint::feature("e", "x", "y"))),
            )
            .unwrap();
        catalog
    }

    fn compile(body: &PBody) -> PlanResult<CompiledBody> {
        let catalog = catalog();
        let body = body.normalize();
        let plan = GreedyOrderer::new(Backend::Rete).order(&body, BTreeSet::new())?;
        compile_body(&catalog, "p", &body, &plan)
    }

    #[test]
    fn test_join_of_type_constraints() {
        let body = PBody::new(&["x", "y"])
            .with(Constraint::instance_of("A", "x"))
            .with(Constraint::instance_of("B", "y"))
            .with(Constraint::feature("e", "x", "y"));
        let compiled = compile(&body).unwrap();
        assert_eq!(compiled.recipe.arity(), 2);
        assert!(compiled.dependencies.is_empty());
    }

    #[test]
    fn test_repeated_variable_filters() {
        let body = PBody::new(&["x"]).with(Constraint::feature("e", "x", "x"));
        let compiled = compile(&body).unwrap();
        assert_eq!(
            compiled.recipe.to_string(),
            "trim[0]/2(equal[[0, 1]](feature:e))"
        );
    }

    #[test]
    fn test_negative_call_is_anti_join() {
        let body = PBody::new(&["x"])
            .with(Constraint::instance_of("A", "x"))
            .with(Constraint::neg_call("edge", &["x", "other"]));
        let compiled = compile(&body).unwrap();
        assert!(matches!(
            compiled.recipe.as_ref(),
            ReteRecipe::Existence { negative: true, .. }
        ));
        assert!(compiled
            .dependencies
            .contains(&MatcherReference::new("edge", BTreeSet::from([0]))));
    }

    #[test]
    fn test_count_uses_outer_join() {
        let body = PBody::new(&["x", "n"])
            .with(Constraint::instance_of("A", "x"))
            .with(Constraint::count("edge", &["x", "y"], "n"));
        let compiled = compile(&body).unwrap();
        assert!(matches!(
            compiled.recipe.as_ref(),
            ReteRecipe::OuterJoin { .. }
        ));
        assert_eq!(compiled.recipe.arity(), 2);
    }

    #[test]
    fn test_inequality_must_be_bound() {
        let body = PBody::new(&["x", "y"]).with(Constraint::inequality("x", "y"));
        let plan = SubPlan::sequence(&body, BTreeSet::new(), &[0]);
        let err = compile_body(&catalog(), "p", &body, &plan).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_closure_dependency() {
        let body = PBody::new(&["x", "y"])
            .with(Constraint::instance_of("A", "x"))
            .with(Constraint::closure("edge", "x", "y"));
        let compiled = compile(&body).unwrap();
        assert!(compiled
            .dependencies
            .contains(&MatcherReference::new("edge", BTreeSet::from([0]))));
    }
}
