//! # Query Catalog
//!
//! Explicit registry of everything a compilation may refer to:
//!
//! - queries, by name
//! - expression evaluators and aggregation operators, by name
//!
//! plus dependency resolution over pattern calls. The catalog is a plain
//! value owned by the engine; there is no process-wide registry.
//!
//! ## Dependency resolution
//!
//! Calls form a directed graph `caller -> callee`. Strongly connected
//! components (Tarjan) are the units of recursive evaluation; they are
//! returned callees-first so every callee network exists before its callers
//! are wired. Negation, counting and aggregation inside a component have no
//! well-defined result and are rejected.

use crate::error::{PlanError, PlanResult};
use crate::expression::ExpressionEvaluator;
use crate::planner::pattern::{Constraint, PQuery};
use crate::rete::aggregate::{builtin_operators, AggregationOperator};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// A callee query plus the parameter positions bound at the call site
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatcherReference {
    pub query: String,
    pub adornment: BTreeSet<usize>,
}

impl MatcherReference {
    pub fn new(query: &str, adornment: BTreeSet<usize>) -> Self {
        MatcherReference {
            query: query.to_string(),
            adornment,
        }
    }

    /// Reference with no bound position
    pub fn unbound(query: &str) -> Self {
        MatcherReference::new(query, BTreeSet::new())
    }
}

impl fmt::Display for MatcherReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let positions: Vec<String> = self.adornment.iter().map(ToString::to_string).collect();
        write!(f, "{}{{{}}}", self.query, positions.join(","))
    }
}

#[derive(Debug, Clone)]
pub struct QueryCatalog {
    queries: BTreeMap<String, Arc<PQuery>>,
    evaluators: HashMap<String, Arc<dyn ExpressionEvaluator>>,
    aggregators: HashMap<String, Arc<dyn AggregationOperator>>,
}

impl Default for QueryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCatalog {
    /// Empty catalog with the builtin aggregation operators
    pub fn new() -> Self {
        let aggregators = builtin_operators()
            .into_iter()
            .map(|op| (op.name().to_string(), op))
            .collect();
        QueryCatalog {
            queries: BTreeMap::new(),
            evaluators: HashMap::new(),
            aggregators,
        }
    }

    /// Add or replace a query after structural validation
    pub fn register(&mut self, query: PQuery) -> PlanResult<()> {
        query.validate()?;
        tracing::debug!(query = %query.name, bodies = query.bodies.len(), "query_registered");
        self.queries.insert(query.name.clone(), Arc::new(query));
        Ok(())
    }

    pub fn register_evaluator(&mut self, evaluator: Arc<dyn ExpressionEvaluator>) {
        self.evaluators
            .insert(evaluator.name().to_string(), evaluator);
    }

    pub fn register_aggregator(&mut self, operator: Arc<dyn AggregationOperator>) {
        self.aggregators.insert(operator.name().to_string(), operator);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queries.contains_key(name)
    }

    pub fn query(&self, name: &str) -> PlanResult<&Arc<PQuery>> {
        self.queries
            .get(name)
            .ok_or_else(|| PlanError::UnknownQuery(name.to_string()))
    }

    pub fn query_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.queries.keys().map(String::as_str)
    }

    pub fn evaluator(&self, name: &str) -> PlanResult<Arc<dyn ExpressionEvaluator>> {
        self.evaluators
            .get(name)
            .cloned()
            .ok_or_else(|| PlanError::UnknownEvaluator(name.to_string()))
    }

    pub fn aggregator(&self, name: &str) -> PlanResult<Arc<dyn AggregationOperator>> {
        self.aggregators
            .get(name)
            .cloned()
            .ok_or_else(|| PlanError::UnknownAggregator(name.to_string()))
    }

    /// Check every call made by `name`: callee exists and arities agree
    pub fn check_calls(&self, name: &str) -> PlanResult<()> {
        let query = self.query(name)?;
        for body in &query.bodies {
            for constraint in &body.constraints {
                let Some(callee_name) = constraint.called_query() else {
                    continue;
                };
                let callee = self.query(callee_name)?;
                let actual = match constraint {
                    Constraint::PatternCall { arguments, .. }
                    | Constraint::PatternMatchCounter { arguments, .. }
                    | Constraint::Aggregate { arguments, .. } => arguments.len(),
                    _ => 2,
                };
                if actual != callee.arity() {
                    return Err(PlanError::ArityMismatch {
                        query: callee.name.clone(),
                        expected: callee.arity(),
                        actual,
                    });
                }
                if let Constraint::Aggregate { operator, .. } = constraint {
                    self.aggregator(operator)?;
                }
            }
            for constraint in &body.constraints {
                if let Constraint::ExpressionEvaluation { evaluator, .. } = constraint {
                    self.evaluator(evaluator)?;
                }
            }
        }
        Ok(())
    }

    /// Direct callees of every registered query
    pub fn dependency_graph(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.queries
            .iter()
            .map(|(name, query)| (name.clone(), query.called_queries()))
            .collect()
    }

    /// `name` and every query it reaches through calls.
    ///
    /// Fails on calls to unregistered queries.
    pub fn dependency_closure(&self, name: &str) -> PlanResult<BTreeSet<String>> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            stack.extend(self.query(&current)?.called_queries());
        }
        Ok(seen)
    }

    /// Strongly connected components, callees before callers
    pub fn strongly_connected_components(&self) -> Vec<Vec<String>> {
        find_sccs(&self.dependency_graph())
    }

    /// Whether `name` can reach itself through calls
    pub fn is_recursive(&self, name: &str) -> bool {
        let graph = self.dependency_graph();
        let Some(callees) = graph.get(name) else {
            return false;
        };
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&String> = callees.iter().collect();
        while let Some(current) = stack.pop() {
            if current == name {
                return true;
            }
            if seen.insert(current) {
                stack.extend(graph.get(current).into_iter().flatten());
            }
        }
        false
    }

    /// Components needed to evaluate `name`, callees first.
    ///
    /// Validates every call on the way and rejects negation, counting and
    /// aggregation through recursion.
    pub fn resolution_order(&self, name: &str) -> PlanResult<Vec<Vec<String>>> {
        let closure = self.dependency_closure(name)?;
        for query in &closure {
            self.check_calls(query)?;
        }
        let graph: BTreeMap<String, BTreeSet<String>> = self
            .dependency_graph()
            .into_iter()
            .filter(|(query, _)| closure.contains(query))
            .collect();
        let components = find_sccs(&graph);
        for component in &components {
            let members: BTreeSet<&str> = component.iter().map(String::as_str).collect();
            for member in component {
                for body in &self.query(member)?.bodies {
                    for constraint in &body.constraints {
                        let Some(callee) = constraint.called_query() else {
                            continue;
                        };
                        if constraint.is_closed_world_call() && members.contains(callee) {
                            return Err(PlanError::unsupported(
                                constraint.to_string(),
                                format!("{member} reaches {callee} through recursion"),
                            ));
                        }
                    }
                }
            }
        }
        Ok(components)
    }
}

/// Tarjan's algorithm. Components are emitted in reverse topological order
/// of the condensed graph, i.e. callees first.
fn find_sccs(graph: &BTreeMap<String, BTreeSet<String>>) -> Vec<Vec<String>> {
    let mut state = Tarjan {
        graph,
        index: 0,
        stack: Vec::new(),
        indices: BTreeMap::new(),
        lowlinks: BTreeMap::new(),
        on_stack: BTreeSet::new(),
        sccs: Vec::new(),
    };
    let mut nodes: BTreeSet<&str> = BTreeSet::new();
    for (node, neighbors) in graph {
        nodes.insert(node);
        nodes.extend(neighbors.iter().map(String::as_str));
    }
    for node in nodes {
        if !state.indices.contains_key(node) {
            state.strongconnect(node);
        }
    }
    state.sccs
}

struct Tarjan<'a> {
    graph: &'a BTreeMap<String, BTreeSet<String>>,
    index: usize,
    stack: Vec<String>,
    indices: BTreeMap<String, usize>,
    lowlinks: BTreeMap<String, usize>,
    on_stack: BTreeSet<String>,
    sccs: Vec<Vec<String>>,
}

impl Tarjan<'_> {
    fn strongconnect(&mut self, v: &str) {
        self.indices.insert(v.to_string(), self.index);
        self.lowlinks.insert(v.to_string(), self.index);
        self.index += 1;
        self.stack.push(v.to_string());
        self.on_stack.insert(v.to_string());

        let graph = self.graph;
        for w in graph.get(v).into_iter().flatten() {
            if let Some(&w_index) = self.indices.get(w) {
                if self.on_stack.contains(w) {
                    self.lower(v, w_index);
                }
            } else {
                self.strongconnect(w);
                let w_low = self.lowlinks.get(w).copied().unwrap_or(usize::MAX);
                self.lower(v, w_low);
            }
        }

        if self.lowlinks.get(v) == self.indices.get(v) {
            let mut scc = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack.remove(&w);
                let done = w == v;
                scc.push(w);
                if done {
                    break;
                }
            }
            scc.sort();
            self.sccs.push(scc);
        }
    }

    fn lower(&mut self, v: &str, candidate: usize) {
        if let Some(low) = self.lowlinks.get_mut(v) {
            *low = (*low).min(candidate);
        }
    }
}
