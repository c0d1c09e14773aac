//! # Query Engine
//!
//! Owns the model, the query catalog and the Rete network, and ties them
//! together:
//!
//! ```text
//! update(f) ──> f(&mut model) ──> drain ModelChange ──> Network::update_input
//!                                                           │
//!        ┌──────────────────────────────────────────────────┤
//!        ▼                                                  ▼
//!  integrity issues ──> ErrorListener          production events ──> coalesce
//!                                                           │
//!                                                           ▼
//!                                        MatchListener (DeferredUpdates) ──┐
//!                                                           ▲              │
//!                                                           └── next round ┘
//! ```
//!
//! Queries run on one of two backends. Rete queries get a production node
//! that is kept up to date by every update; local-search queries compile a
//! search plan per adornment on first use and walk the model on every
//! request. A Rete query pulls every query it depends on into the network,
//! whatever backend those declare for their own matchers.

pub mod listener;
pub mod matcher;

use crate::catalog::{MatcherReference, QueryCatalog};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, IntegrityIssue, PlanError, PlanResult};
use crate::expression::ExpressionEvaluator;
use crate::localsearch::{agrees_with, MatchSource, SearchExecutor};
use crate::model::ModelIndex;
use crate::planner::rete_compiler::compile_body;
use crate::planner::search_plan::{compile_search_plan, CompileContext, SearchPlan};
use crate::planner::{Backend, GreedyOrderer, PQuery};
use crate::rete::aggregate::AggregationOperator;
use crate::rete::builder::{BuildContext, ReteBuilder};
use crate::rete::{Direction, Network, NetworkStatistics, NodeId, ProductionEvent};
use crate::value::{Tuple, Value};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

pub use listener::{
    match_listener, CollectingErrorListener, DeferredUpdates, ErrorListener, FatalError, ListenerId,
    MatchListener,
};
pub use matcher::{FromMatch, Match, Matcher, PartialMatch};

struct Subscription<M> {
    id: ListenerId,
    query: Arc<PQuery>,
    listener: Box<dyn MatchListener<M>>,
}

/// Engine size counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub engine_id: Uuid,
    pub registered_queries: usize,
    pub rete_queries: usize,
    pub search_plans: usize,
    pub listeners: usize,
    pub network: NetworkStatistics,
}

impl EngineStatistics {
    /// Pretty-printed JSON dump for diagnostics
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct QueryEngine<M: ModelIndex> {
    id: Uuid,
    config: EngineConfig,
    model: M,
    catalog: QueryCatalog,
    network: Network,
    builder: ReteBuilder,
    productions: HashMap<String, NodeId>,
    production_queries: HashMap<NodeId, Arc<PQuery>>,
    search_plans: Mutex<HashMap<MatcherReference, Arc<Vec<SearchPlan>>>>,
    subscriptions: Vec<Subscription<M>>,
    next_listener: u64,
    error_listeners: Vec<Arc<dyn ErrorListener>>,
    disposed: bool,
}

impl<M: ModelIndex> QueryEngine<M> {
    pub fn new(model: M) -> Self {
        Self::with_config(model, EngineConfig::default())
    }

    /// Engine over `model`. Changes recorded before this call are already
    /// part of the model's state and are discarded.
    pub fn with_config(mut model: M, config: EngineConfig) -> Self {
        let stale = model.drain_changes().len();
        let id = Uuid::new_v4();
        tracing::debug!(engine = %id, backend = %config.default_backend, stale, "engine_created");
        QueryEngine {
            id,
            config,
            model,
            catalog: QueryCatalog::new(),
            network: Network::new(),
            builder: ReteBuilder::new(),
            productions: HashMap::new(),
            production_queries: HashMap::new(),
            search_plans: Mutex::new(HashMap::new()),
            subscriptions: Vec::new(),
            next_listener: 0,
            error_listeners: Vec::new(),
            disposed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn catalog(&self) -> &QueryCatalog {
        &self.catalog
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    /// Add a query to the catalog. Queries already in use cannot be
    /// replaced.
    pub fn register_query(&mut self, query: PQuery) -> EngineResult<()> {
        self.ensure_live()?;
        if self.is_in_use(&query.name) {
            return Err(PlanError::MalformedPlan(format!(
                "query {} is in use and cannot be replaced",
                query.name
            ))
            .into());
        }
        self.catalog.register(query)?;
        Ok(())
    }

    pub fn register_evaluator(&mut self, evaluator: Arc<dyn ExpressionEvaluator>) {
        self.catalog.register_evaluator(evaluator);
    }

    pub fn register_aggregator(&mut self, operator: Arc<dyn AggregationOperator>) {
        self.catalog.register_aggregator(operator);
    }

    pub fn add_error_listener(&mut self, listener: Arc<dyn ErrorListener>) {
        self.error_listeners.push(listener);
    }

    fn is_in_use(&self, name: &str) -> bool {
        self.productions.contains_key(name)
            || self.search_plans.lock().keys().any(|r| r.query == name)
    }

    /// Backend `name` is evaluated with
    pub fn backend_of(&self, name: &str) -> EngineResult<Backend> {
        let query = self.catalog.query(name)?;
        Ok(query.backend.unwrap_or(self.config.default_backend))
    }

    // ---------------------------------------------------------------------
    // Preparation
    // ---------------------------------------------------------------------

    /// Make `name` ready to answer match requests.
    ///
    /// Rete queries are compiled and wired into the network together with
    /// everything they call. Local-search queries are checked for recursion
    /// here; their plans are compiled per adornment on first use.
    pub fn prepare(&mut self, name: &str) -> EngineResult<Backend> {
        self.ensure_live()?;
        let backend = self.backend_of(name)?;
        match backend {
            Backend::Rete => self.prepare_rete(name)?,
            Backend::LocalSearch => {
                let dependencies: Vec<String> =
                    self.catalog.resolution_order(name)?.into_iter().flatten().collect();
                for dependency in &dependencies {
                    if self.backend_of(dependency)? == Backend::Rete {
                        self.prepare_rete(dependency)?;
                    }
                }
                // queries pulled into the network are answered from there
                for dependency in dependencies {
                    if !self.productions.contains_key(&dependency)
                        && self.catalog.is_recursive(&dependency)
                    {
                        return Err(PlanError::RecursiveLocalSearch(dependency).into());
                    }
                }
            }
        }
        Ok(backend)
    }

    fn prepare_rete(&mut self, name: &str) -> PlanResult<()> {
        if self.productions.contains_key(name) {
            return Ok(());
        }
        for component in self.catalog.resolution_order(name)? {
            if component.iter().all(|q| self.productions.contains_key(q)) {
                continue;
            }
            // compile every body first so a failure leaves the network untouched
            let mut bodies = Vec::new();
            for member in &component {
                let query = self.catalog.query(member)?.clone();
                for body in &query.bodies {
                    let body = body.normalize();
                    let plan = GreedyOrderer::new(Backend::Rete).order(&body, BTreeSet::new())?;
                    bodies.push((member.clone(), compile_body(&self.catalog, member, &body, &plan)?));
                }
            }

            for member in &component {
                let query = self.catalog.query(member)?.clone();
                let id = self.network.add_production(member, query.arity());
                self.productions.insert(member.clone(), id);
                self.production_queries.insert(id, query);
            }

            let nodes_before = self.network.node_count();
            for (member, compiled) in bodies {
                let ctx = BuildContext {
                    catalog: &self.catalog,
                    model: &self.model,
                    productions: &self.productions,
                };
                let body = self.builder.build(&mut self.network, &compiled.recipe, &ctx)?;
                let production = self.productions[&member];
                self.network.connect_production(production, body);
            }
            tracing::debug!(
                engine = %self.id,
                queries = ?component,
                new_nodes = self.network.node_count() - nodes_before,
                "rete_network_built"
            );
        }
        // nobody can listen to a production that did not exist before
        self.network.take_production_events();
        self.dispatch_network_issues();
        Ok(())
    }

    /// Handle on the matches of `name`, preparing it if needed
    pub fn matcher(&mut self, name: &str) -> EngineResult<Matcher<'_, M>> {
        let backend = self.prepare(name)?;
        let query = self.catalog.query(name)?.clone();
        Ok(Matcher::new(self, query, backend))
    }

    fn search_plans_for(&self, reference: &MatcherReference) -> PlanResult<Arc<Vec<SearchPlan>>> {
        if let Some(plans) = self.search_plans.lock().get(reference) {
            return Ok(plans.clone());
        }
        let query = self.catalog.query(&reference.query)?;
        let ctx = CompileContext {
            catalog: &self.catalog,
            metamodel: self.model.metamodel(),
        };
        let mut plans = Vec::with_capacity(query.bodies.len());
        for body in &query.bodies {
            let body = body.normalize();
            let bound = reference
                .adornment
                .iter()
                .filter_map(|&i| body.parameters.get(i).cloned())
                .collect();
            let order = GreedyOrderer::new(Backend::LocalSearch).order(&body, bound)?;
            plans.push(compile_search_plan(ctx, &query.name, &body, &order)?);
        }
        tracing::debug!(
            engine = %self.id,
            reference = %reference,
            operations = plans.iter().map(|p| p.operations.len()).sum::<usize>(),
            "search_plan_compiled"
        );
        let plans = Arc::new(plans);
        self.search_plans
            .lock()
            .insert(reference.clone(), plans.clone());
        Ok(plans)
    }

    // ---------------------------------------------------------------------
    // Evaluation
    // ---------------------------------------------------------------------

    /// Distinct tuples of `query` agreeing with `binding`
    pub(crate) fn raw_matches(
        &self,
        query: &PQuery,
        backend: Backend,
        binding: &[Option<Value>],
    ) -> EngineResult<Vec<Tuple>> {
        self.ensure_live()?;
        Ok(self.evaluate(&query.name, backend, binding)?)
    }

    fn evaluate(
        &self,
        name: &str,
        backend: Backend,
        binding: &[Option<Value>],
    ) -> PlanResult<Vec<Tuple>> {
        match backend {
            Backend::Rete => {
                let memory = self
                    .productions
                    .get(name)
                    .and_then(|&id| self.network.production_memory(id))
                    .ok_or_else(|| {
                        PlanError::MalformedPlan(format!("{name} has no rete production"))
                    })?;
                Ok(memory
                    .tuples()
                    .filter(|t| agrees_with(t, binding))
                    .cloned()
                    .collect())
            }
            Backend::LocalSearch => {
                let adornment = binding
                    .iter()
                    .enumerate()
                    .filter_map(|(i, v)| v.is_some().then_some(i))
                    .collect();
                let plans = self.search_plans_for(&MatcherReference::new(name, adornment))?;
                let mut executor = SearchExecutor::new(&self.model, self);
                let mut seen = BTreeSet::new();
                let mut out = Vec::new();
                for plan in plans.iter() {
                    for tuple in executor.execute(plan, binding)? {
                        if seen.insert(tuple.clone()) {
                            out.push(tuple);
                        }
                    }
                }
                for issue in executor.take_issues() {
                    self.report_issue(issue);
                }
                Ok(out)
            }
        }
    }

    /// Typed view of a tuple; tuples violating a declared parameter kind
    /// are reported and dropped
    pub(crate) fn to_match(&self, query: &Arc<PQuery>, tuple: Tuple) -> Option<Match> {
        for (parameter, value) in query.parameters.iter().zip(&tuple) {
            if let Some(kind) = parameter.kind {
                if !kind.matches(value) {
                    self.report_issue(IntegrityIssue::BadlyTypedMatch {
                        query: query.name.clone(),
                        message: format!("{} = {value} is not {kind}", parameter.name),
                    });
                    return None;
                }
            }
        }
        Some(Match::new(query.clone(), tuple))
    }

    // ---------------------------------------------------------------------
    // Updates
    // ---------------------------------------------------------------------

    /// Run `write` against the model and propagate what it changed.
    ///
    /// Listeners see the settled result. Writes they queue run afterwards,
    /// round by round, up to `max_deferred_rounds`.
    pub fn update<R>(&mut self, write: impl FnOnce(&mut M) -> R) -> EngineResult<R> {
        self.ensure_live()?;
        let result = write(&mut self.model);
        self.flush();
        Ok(result)
    }

    fn flush(&mut self) {
        let mut rounds = 0;
        loop {
            let changes = self.model.drain_changes();
            let applied = changes.len();
            for change in changes {
                self.network
                    .update_input(&change.key, change.direction, change.tuple);
            }
            self.dispatch_network_issues();
            let events = self.collect_events();
            tracing::trace!(
                engine = %self.id,
                round = rounds,
                changes = applied,
                events = events.len(),
                "update_propagated"
            );

            let mut deferred = DeferredUpdates::new();
            self.deliver(&events, &mut deferred);
            if deferred.is_empty() {
                return;
            }
            rounds += 1;
            if rounds > self.config.max_deferred_rounds {
                self.report_fatal(&FatalError::DeferredOverflow {
                    rounds: rounds - 1,
                    dropped: deferred.len(),
                });
                return;
            }
            deferred.apply(&mut self.model);
        }
    }

    /// Production events of the last propagation, netted per tuple when
    /// coalescing is on
    fn collect_events(&mut self) -> Vec<ProductionEvent> {
        let events = self.network.take_production_events();
        if !self.config.coalesce_listener_events {
            return events;
        }
        let mut order: Vec<(NodeId, Tuple)> = Vec::new();
        let mut net: HashMap<(NodeId, Tuple), i64> = HashMap::new();
        for event in events {
            let key = (event.node, event.tuple);
            let delta = match event.direction {
                Direction::Insert => 1,
                Direction::Revoke => -1,
            };
            let entry = net.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                0
            });
            *entry += delta;
        }
        order
            .into_iter()
            .filter_map(|key| {
                let delta = net.get(&key).copied().unwrap_or(0);
                let direction = match delta.signum() {
                    1 => Direction::Insert,
                    -1 => Direction::Revoke,
                    _ => return None,
                };
                Some(ProductionEvent {
                    node: key.0,
                    direction,
                    tuple: key.1,
                })
            })
            .collect()
    }

    fn deliver(&mut self, events: &[ProductionEvent], deferred: &mut DeferredUpdates<M>) {
        if self.subscriptions.is_empty() {
            return;
        }
        for event in events {
            let Some(query) = self.production_queries.get(&event.node).cloned() else {
                continue;
            };
            if !self.subscriptions.iter().any(|s| s.query.name == query.name) {
                continue;
            }
            let Some(matched) = self.to_match(&query, event.tuple.clone()) else {
                continue;
            };
            let mut failures = Vec::new();
            for subscription in &mut self.subscriptions {
                if subscription.query.name != query.name {
                    continue;
                }
                if let Some(failure) =
                    notify(subscription, event.direction, &matched, deferred)
                {
                    failures.push(failure);
                }
            }
            for failure in failures {
                self.report_fatal(&failure);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Listeners
    // ---------------------------------------------------------------------

    /// Register `listener` for match-set changes of `name`.
    ///
    /// With `fire_now`, the current matches are delivered as appearances
    /// before this returns. Only Rete queries can be observed.
    pub fn subscribe(
        &mut self,
        name: &str,
        fire_now: bool,
        listener: impl MatchListener<M> + 'static,
    ) -> EngineResult<ListenerId> {
        if self.prepare(name)? != Backend::Rete {
            return Err(PlanError::unsupported(
                name,
                "change notifications need the rete backend",
            )
            .into());
        }
        let query = self.catalog.query(name)?.clone();
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        let mut subscription = Subscription {
            id,
            query: query.clone(),
            listener: Box::new(listener),
        };

        if fire_now {
            let current = self.evaluate(name, Backend::Rete, &vec![None; query.arity()])?;
            let mut deferred = DeferredUpdates::new();
            let mut failures = Vec::new();
            for tuple in current {
                let Some(matched) = self.to_match(&query, tuple) else {
                    continue;
                };
                if let Some(failure) =
                    notify(&mut subscription, Direction::Insert, &matched, &mut deferred)
                {
                    failures.push(failure);
                }
            }
            for failure in failures {
                self.report_fatal(&failure);
            }
            self.subscriptions.push(subscription);
            if !deferred.is_empty() {
                deferred.apply(&mut self.model);
                self.flush();
            }
        } else {
            self.subscriptions.push(subscription);
        }
        tracing::debug!(engine = %self.id, query = name, listener = %id, fire_now, "listener_added");
        Ok(id)
    }

    /// Detach a match listener; false if it was not registered
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        before != self.subscriptions.len()
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ---------------------------------------------------------------------
    // Error channels
    // ---------------------------------------------------------------------

    fn dispatch_network_issues(&mut self) {
        for issue in self.network.take_issues() {
            self.report_issue(issue);
        }
    }

    pub(crate) fn report_issue(&self, issue: IntegrityIssue) {
        tracing::warn!(engine = %self.id, %issue, "integrity_issue");
        if self.config.report_integrity_issues {
            for listener in &self.error_listeners {
                listener.on_integrity_issue(&issue);
            }
        }
    }

    fn report_fatal(&self, error: &FatalError) {
        tracing::error!(engine = %self.id, %error, "fatal_listener_error");
        for listener in &self.error_listeners {
            listener.on_fatal(error);
        }
    }

    // ---------------------------------------------------------------------
    // Diagnostics and teardown
    // ---------------------------------------------------------------------

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            engine_id: self.id,
            registered_queries: self.catalog.query_names().count(),
            rete_queries: self.productions.len(),
            search_plans: self.search_plans.lock().len(),
            listeners: self.subscriptions.len(),
            network: self.network.statistics(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Drop the network and every cached plan.
    ///
    /// Fails while match listeners are attached. The engine answers no
    /// further requests afterwards.
    pub fn dispose(&mut self) -> EngineResult<()> {
        self.ensure_live()?;
        if !self.subscriptions.is_empty() {
            return Err(EngineError::ListenersAttached(self.subscriptions.len()));
        }
        self.network.clear();
        self.builder.clear();
        self.productions.clear();
        self.production_queries.clear();
        self.search_plans.lock().clear();
        self.disposed = true;
        tracing::debug!(engine = %self.id, "engine_disposed");
        Ok(())
    }

    fn ensure_live(&self) -> EngineResult<()> {
        if self.disposed {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }
}

/// Deliver one event to one listener, isolating errors and panics
fn notify<M>(
    subscription: &mut Subscription<M>,
    direction: Direction,
    matched: &Match,
    deferred: &mut DeferredUpdates<M>,
) -> Option<FatalError> {
    let listener = &mut subscription.listener;
    let outcome = catch_unwind(AssertUnwindSafe(|| match direction {
        Direction::Insert => listener.on_appeared(matched, deferred),
        Direction::Revoke => listener.on_disappeared(matched, deferred),
    }));
    let query = subscription.query.name.clone();
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(FatalError::ListenerFailed {
            query,
            listener: subscription.id,
            message: format!("{e:#}"),
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Some(FatalError::ListenerPanicked {
                query,
                listener: subscription.id,
                message,
            })
        }
    }
}

impl<M: ModelIndex> MatchSource for QueryEngine<M> {
    fn matches(&self, callee: &MatcherReference, binding: &[Option<Value>]) -> PlanResult<Vec<Tuple>> {
        let backend = if self.productions.contains_key(&callee.query) {
            Backend::Rete
        } else {
            Backend::LocalSearch
        };
        self.evaluate(&callee.query, backend, binding)
    }
}

impl<M: ModelIndex> std::fmt::Debug for QueryEngine<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("id", &self.id)
            .field("queries", &self.catalog.query_names().count())
            .field("rete_queries", &self.productions.len())
            .field("listeners", &self.subscriptions.len())
            .field("disposed", &self.disposed)
            .finish()
    }
}
