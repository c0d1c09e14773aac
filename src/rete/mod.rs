//! Incremental dataflow network.
//!
//! # Architecture
//!
//! ```text
//! Network
//!   |-- nodes: Vec<NodeSlot>          (arena, addressed by NodeId)
//!   |     |-- NodeKind                (state + semantics, see node.rs)
//!   |     `-- receivers               (downstream nodes and indexers)
//!   |-- indexers: Vec<IndexerSlot>    (arena, addressed by IndexerId)
//!   |     |-- Indexer                 (signature -> bucket)
//!   |     `-- listeners               ((NodeId, Side) pairs)
//!   `-- issue buffer / production events
//! ```
//!
//! Propagation is synchronous and depth-first: an event is fully pushed
//! through every receiver before the next receiver of the same node sees
//! it. Join-like nodes read the current content of both indexers, which is
//! what makes self-joins and diamonds exact without any batching.
//!
//! Nodes are created through the `add_*` methods. A newly created stateful
//! node or indexer pulls the current content of its parent, so parts of the
//! network can be built after data has arrived. Production nodes can be
//! allocated before their bodies exist and connected later, which is how
//! recursive queries are wired.

pub mod aggregate;
pub mod builder;
pub mod closure;
pub mod memory;
pub mod node;
pub mod recipe;

use crate::error::IntegrityIssue;
use crate::expression::{is_truthy, ExpressionEvaluator};
use crate::index::{Bucket, IndexUpdate, Indexer};
use crate::model::InputKey;
use crate::value::{Mask, Tuple, Value};
use aggregate::AggregationOperator;
use closure::ClosureState;
use memory::{CountChange, TupleMemory};
use node::{
    AggregatorNode, ExistenceNode, ExpressionMode, ExpressionNode, InputNode, JoinNode, NodeKind,
    OuterJoinNode, ProductionNode,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Direction of a propagated change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    Insert,
    Revoke,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Insert => Direction::Revoke,
            Direction::Revoke => Direction::Insert,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Insert => write!(f, "INSERT"),
            Direction::Revoke => write!(f, "REVOKE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexerId(usize);

impl IndexerId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Which input of a two-input node an indexer feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receiver {
    Node(NodeId),
    Indexer(IndexerId),
}

#[derive(Debug)]
struct NodeSlot {
    kind: NodeKind,
    parents: Vec<NodeId>,
    receivers: Vec<Receiver>,
    arity: usize,
}

#[derive(Debug)]
struct IndexerSlot {
    parent: NodeId,
    indexer: Indexer,
    listeners: Vec<(NodeId, Side)>,
}

/// A change of a production node's match set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionEvent {
    pub node: NodeId,
    pub direction: Direction,
    pub tuple: Tuple,
}

/// Size counters for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStatistics {
    pub nodes: usize,
    pub nodes_by_kind: BTreeMap<&'static str, usize>,
    pub indexers: usize,
    /// Tuples held by indexers, counting multiplicities
    pub indexed_tuples: usize,
    /// Tuples held by stateful nodes
    pub stored_tuples: usize,
    /// Events pushed through the network since creation
    pub propagated_events: u64,
    /// Indexer lookups made while propagating
    pub indexer_lookups: u64,
}

static NULL_VALUE: Value = Value::Null;

#[derive(Debug, Default)]
pub struct Network {
    nodes: Vec<NodeSlot>,
    indexers: Vec<IndexerSlot>,
    indexer_cache: HashMap<(NodeId, Mask), IndexerId>,
    inputs: HashMap<InputKey, NodeId>,
    issues: Vec<IntegrityIssue>,
    production_events: Vec<ProductionEvent>,
    propagated_events: u64,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn indexer_count(&self) -> usize {
        self.indexers.len()
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    /// Output width of a node
    pub fn arity(&self, id: NodeId) -> usize {
        self.nodes[id.0].arity
    }

    pub fn parents(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].parents
    }

    pub fn indexer(&self, id: IndexerId) -> &Indexer {
        &self.indexers[id.0].indexer
    }

    /// Parent node feeding an indexer
    pub fn indexer_parent(&self, id: IndexerId) -> NodeId {
        self.indexers[id.0].parent
    }

    pub fn input_node(&self, key: &InputKey) -> Option<NodeId> {
        self.inputs.get(key).copied()
    }

    /// Keys with an input node in this network
    pub fn input_keys(&self) -> impl Iterator<Item = &InputKey> + '_ {
        self.inputs.keys()
    }

    /// Current match set of a production node
    pub fn production_memory(&self, id: NodeId) -> Option<&TupleMemory> {
        match &self.nodes[id.0].kind {
            NodeKind::Production(p) => Some(&p.memory),
            _ => None,
        }
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    /// Input node for `key`, created on first request.
    ///
    /// `unique` declares that the model never holds the same tuple twice.
    pub fn add_input(&mut self, key: InputKey, arity: usize, unique: bool) -> NodeId {
        if let Some(&id) = self.inputs.get(&key) {
            return id;
        }
        let id = self.push_node(
            NodeKind::Input(InputNode {
                key: key.clone(),
                unique,
                memory: TupleMemory::new(),
            }),
            Vec::new(),
            arity,
        );
        self.inputs.insert(key, id);
        id
    }

    /// Node emitting a fixed set of tuples
    pub fn add_constant(&mut self, tuples: Vec<Tuple>, arity: usize) -> NodeId {
        self.push_node(NodeKind::Constant(tuples), Vec::new(), arity)
    }

    pub fn add_trimmer(&mut self, parent: NodeId, mask: Mask) -> NodeId {
        let arity = mask.arity();
        self.add_child(parent, NodeKind::Trimmer(mask), arity)
    }

    pub fn add_constant_filter(&mut self, parent: NodeId, column: usize, value: Value) -> NodeId {
        let arity = self.arity(parent);
        self.add_child(parent, NodeKind::ConstantFilter { column, value }, arity)
    }

    pub fn add_equality_filter(&mut self, parent: NodeId, groups: Vec<Vec<usize>>) -> NodeId {
        let arity = self.arity(parent);
        self.add_child(parent, NodeKind::EqualityFilter(groups), arity)
    }

    pub fn add_inequality_filter(&mut self, parent: NodeId, left: usize, right: usize) -> NodeId {
        let arity = self.arity(parent);
        self.add_child(parent, NodeKind::InequalityFilter { left, right }, arity)
    }

    pub fn add_expression(
        &mut self,
        parent: NodeId,
        evaluator: Arc<dyn ExpressionEvaluator>,
        inputs: Vec<usize>,
        mode: ExpressionMode,
    ) -> NodeId {
        let arity = match mode {
            ExpressionMode::Check => self.arity(parent),
            ExpressionMode::Bind => self.arity(parent) + 1,
        };
        let kind = NodeKind::Expression(ExpressionNode {
            evaluator,
            inputs,
            mode,
            cache: HashMap::new(),
        });
        self.add_child(parent, kind, arity)
    }

    /// Natural join; output is the primary tuple followed by the secondary
    /// columns outside `secondary_mask`.
    pub fn add_join(
        &mut self,
        primary: NodeId,
        primary_mask: Mask,
        secondary: NodeId,
        secondary_mask: Mask,
    ) -> NodeId {
        let complement = secondary_mask.complement();
        let arity = self.arity(primary) + complement.arity();
        let p = self.indexer_for(primary, primary_mask);
        let s = self.indexer_for(secondary, secondary_mask);
        let kind = NodeKind::Join(JoinNode {
            primary: p,
            secondary: s,
            complement,
        });
        self.add_two_input(kind, (primary, p), (secondary, s), arity)
    }

    /// Semi-join (`negative == false`) or anti-join (`negative == true`)
    pub fn add_existence(
        &mut self,
        primary: NodeId,
        primary_mask: Mask,
        secondary: NodeId,
        secondary_mask: Mask,
        negative: bool,
    ) -> NodeId {
        let arity = self.arity(primary);
        let p = self.indexer_for(primary, primary_mask);
        let s = self.indexer_for(secondary, secondary_mask);
        let kind = NodeKind::Existence(ExistenceNode {
            primary: p,
            secondary: s,
            negative,
        });
        self.add_two_input(kind, (primary, p), (secondary, s), arity)
    }

    /// Left outer join; unmatched primaries are extended with `defaults`,
    /// which must be as wide as the secondary complement.
    pub fn add_outer_join(
        &mut self,
        primary: NodeId,
        primary_mask: Mask,
        secondary: NodeId,
        secondary_mask: Mask,
        defaults: Tuple,
    ) -> NodeId {
        let complement = secondary_mask.complement();
        assert_eq!(
            complement.arity(),
            defaults.arity(),
            "outer join defaults {defaults} do not cover complement {complement}"
        );
        let arity = self.arity(primary) + complement.arity();
        let p = self.indexer_for(primary, primary_mask);
        let s = self.indexer_for(secondary, secondary_mask);
        let kind = NodeKind::OuterJoin(OuterJoinNode {
            primary: p,
            secondary: s,
            complement,
            defaults,
        });
        self.add_two_input(kind, (primary, p), (secondary, s), arity)
    }

    /// Group `parent` by `group_mask` and emit `group + aggregate` per group
    pub fn add_aggregator(
        &mut self,
        parent: NodeId,
        group_mask: Mask,
        operator: Arc<dyn AggregationOperator>,
        column: Option<usize>,
    ) -> NodeId {
        let arity = group_mask.arity() + 1;
        let source = self.indexer_for(parent, group_mask);
        let mut node = AggregatorNode {
            source,
            operator,
            column,
            groups: HashMap::new(),
        };
        for (signature, bucket) in self.indexers[source.0].indexer.buckets() {
            if let Some(value) = fold_group(&node, Some(bucket)) {
                node.groups.insert(signature.clone(), value);
            }
        }
        let id = self.push_node(NodeKind::Aggregator(node), vec![parent], arity);
        self.indexers[source.0].listeners.push((id, Side::Primary));
        id
    }

    /// Transitive closure of a binary parent
    pub fn add_transitive_closure(&mut self, parent: NodeId) -> NodeId {
        assert_eq!(self.arity(parent), 2, "transitive closure over a non-binary node");
        self.add_child(parent, NodeKind::TransitiveClosure(ClosureState::new()), 2)
    }

    pub fn add_uniqueness(&mut self, parent: NodeId) -> NodeId {
        let arity = self.arity(parent);
        self.add_child(parent, NodeKind::Uniqueness(TupleMemory::new()), arity)
    }

    /// Unconnected production node; bodies are attached with
    /// [`Network::connect_production`].
    pub fn add_production(&mut self, query: &str, arity: usize) -> NodeId {
        let kind = NodeKind::Production(ProductionNode {
            query: query.to_string(),
            memory: TupleMemory::new(),
        });
        self.push_node(kind, Vec::new(), arity)
    }

    /// Attach a body output to a production node and push its current
    /// content through the production's receivers.
    pub fn connect_production(&mut self, production: NodeId, parent: NodeId) {
        assert_eq!(
            self.arity(production),
            self.arity(parent),
            "production body width mismatch"
        );
        self.nodes[production.0].parents.push(parent);
        self.nodes[parent.0]
            .receivers
            .push(Receiver::Node(production));
        for tuple in self.pull(parent) {
            self.receive(production, Direction::Insert, tuple);
        }
    }

    /// Indexer over `parent` projected by `mask`, shared per `(parent, mask)`
    pub fn indexer_for(&mut self, parent: NodeId, mask: Mask) -> IndexerId {
        if let Some(&id) = self.indexer_cache.get(&(parent, mask.clone())) {
            return id;
        }
        let unique = self.produces_set(parent);
        let name = format!(
            "{}#{}{}",
            self.nodes[parent.0].kind.name(),
            parent.0,
            mask
        );
        let mut indexer = Indexer::new(name, mask.clone(), unique);
        for tuple in self.pull(parent) {
            if let Err(issue) = indexer.insert(tuple) {
                self.report(issue);
            }
        }
        let id = IndexerId(self.indexers.len());
        self.indexers.push(IndexerSlot {
            parent,
            indexer,
            listeners: Vec::new(),
        });
        self.nodes[parent.0].receivers.push(Receiver::Indexer(id));
        self.indexer_cache.insert((parent, mask), id);
        id
    }

    fn push_node(&mut self, kind: NodeKind, parents: Vec<NodeId>, arity: usize) -> NodeId {
        let id = NodeId(self.nodes.len());
        tracing::trace!(node = id.0, kind = kind.name(), arity, "rete_node_created");
        self.nodes.push(NodeSlot {
            kind,
            parents,
            receivers: Vec::new(),
            arity,
        });
        id
    }

    fn add_child(&mut self, parent: NodeId, kind: NodeKind, arity: usize) -> NodeId {
        let stateful = kind.is_stateful();
        let id = self.push_node(kind, vec![parent], arity);
        self.nodes[parent.0].receivers.push(Receiver::Node(id));
        if stateful {
            for tuple in self.pull(parent) {
                self.receive(id, Direction::Insert, tuple);
            }
        }
        id
    }

    fn add_two_input(
        &mut self,
        kind: NodeKind,
        (primary, primary_index): (NodeId, IndexerId),
        (secondary, secondary_index): (NodeId, IndexerId),
        arity: usize,
    ) -> NodeId {
        let id = self.push_node(kind, vec![primary, secondary], arity);
        self.indexers[primary_index.0]
            .listeners
            .push((id, Side::Primary));
        self.indexers[secondary_index.0]
            .listeners
            .push((id, Side::Secondary));
        id
    }

    /// Whether a node never emits the same tuple twice at once
    fn produces_set(&self, id: NodeId) -> bool {
        let slot = &self.nodes[id.0];
        let parent_is_set = || slot.parents.first().is_some_and(|&p| self.produces_set(p));
        match &slot.kind {
            NodeKind::Input(input) => input.unique,
            NodeKind::Constant(tuples) => {
                tuples.iter().collect::<HashSet<_>>().len() == tuples.len()
            }
            NodeKind::Trimmer(mask) => mask.is_identity() && parent_is_set(),
            NodeKind::ConstantFilter { .. }
            | NodeKind::EqualityFilter(_)
            | NodeKind::InequalityFilter { .. }
            | NodeKind::Expression(_) => parent_is_set(),
            NodeKind::Join(join) => {
                self.indexer(join.primary).is_unique() && self.indexer(join.secondary).is_unique()
            }
            NodeKind::Existence(existence) => self.indexer(existence.primary).is_unique(),
            NodeKind::OuterJoin(outer) => {
                self.indexer(outer.primary).is_unique() && self.indexer(outer.secondary).is_unique()
            }
            NodeKind::Aggregator(_)
            | NodeKind::TransitiveClosure(_)
            | NodeKind::Uniqueness(_)
            | NodeKind::Production(_) => true,
        }
    }

    // ---------------------------------------------------------------------
    // Propagation
    // ---------------------------------------------------------------------

    /// Feed one base change into the input node of `key`.
    ///
    /// Returns false if no query uses the key.
    pub fn update_input(&mut self, key: &InputKey, direction: Direction, tuple: Tuple) -> bool {
        let Some(&id) = self.inputs.get(key) else {
            return false;
        };
        let mut issue = None;
        if let NodeKind::Input(input) = &mut self.nodes[id.0].kind {
            match direction {
                Direction::Insert => {
                    let change = input.memory.increment(tuple.clone());
                    if input.unique && change == CountChange::Unchanged {
                        input.memory.decrement(&tuple);
                        issue = Some(IntegrityIssue::DuplicateInsert {
                            index: key.to_string(),
                            tuple: tuple.to_string(),
                        });
                    }
                }
                Direction::Revoke => {
                    if input.memory.decrement(&tuple) == CountChange::Missing {
                        issue = Some(IntegrityIssue::MissingTuple {
                            index: key.to_string(),
                            tuple: tuple.to_string(),
                        });
                    }
                }
            }
        }
        match issue {
            Some(issue) => self.report(issue),
            None => self.propagate(id, direction, &tuple),
        }
        true
    }

    fn propagate(&mut self, from: NodeId, direction: Direction, tuple: &Tuple) {
        self.propagated_events += 1;
        tracing::trace!(node = from.0, %direction, %tuple, "rete_propagate");
        let count = self.nodes[from.0].receivers.len();
        for i in 0..count {
            match self.nodes[from.0].receivers[i] {
                Receiver::Node(id) => self.receive(id, direction, tuple.clone()),
                Receiver::Indexer(id) => self.update_indexer(id, direction, tuple),
            }
        }
    }

    /// Single-parent node receiving an event from its parent
    fn receive(&mut self, id: NodeId, direction: Direction, tuple: Tuple) {
        let mut out: Vec<(Direction, Tuple)> = Vec::new();
        let mut issue = None;
        let mut produced = false;
        match &mut self.nodes[id.0].kind {
            NodeKind::Trimmer(mask) => out.push((direction, mask.project(&tuple))),
            NodeKind::ConstantFilter { column, value } => {
                if tuple.values()[*column] == *value {
                    out.push((direction, tuple));
                }
            }
            NodeKind::EqualityFilter(groups) => {
                let values = tuple.values();
                let equal = groups
                    .iter()
                    .all(|group| group.iter().all(|&c| values[c] == values[group[0]]));
                if equal {
                    out.push((direction, tuple));
                }
            }
            NodeKind::InequalityFilter { left, right } => {
                if tuple.values()[*left] != tuple.values()[*right] {
                    out.push((direction, tuple));
                }
            }
            NodeKind::Expression(node) => match direction {
                Direction::Insert => {
                    if let Some((output, count)) = node.cache.get_mut(&tuple) {
                        *count += 1;
                        if let Some(output) = output {
                            out.push((direction, output.clone()));
                        }
                    } else {
                        let inputs: Vec<Value> =
                            node.inputs.iter().map(|&c| tuple.values()[c].clone()).collect();
                        let output = match node.evaluator.evaluate(&inputs) {
                            Ok(value) => match node.mode {
                                ExpressionMode::Check => is_truthy(&value).then(|| tuple.clone()),
                                ExpressionMode::Bind => Some(tuple.extend_with(value)),
                            },
                            Err(err) => {
                                issue = Some(IntegrityIssue::EvaluationFailed {
                                    evaluator: node.evaluator.name().to_string(),
                                    tuple: tuple.to_string(),
                                    message: err.to_string(),
                                });
                                None
                            }
                        };
                        if let Some(output) = &output {
                            out.push((direction, output.clone()));
                        }
                        node.cache.insert(tuple, (output, 1));
                    }
                }
                Direction::Revoke => match node.cache.get_mut(&tuple) {
                    Some(entry) => {
                        entry.1 -= 1;
                        let output = entry.0.clone();
                        let remaining = entry.1;
                        if remaining == 0 {
                            node.cache.remove(&tuple);
                        }
                        if let Some(output) = output {
                            out.push((direction, output));
                        }
                    }
                    None => {
                        issue = Some(IntegrityIssue::MissingTuple {
                            index: format!("expression {}", node.evaluator.name()),
                            tuple: tuple.to_string(),
                        });
                    }
                },
            },
            NodeKind::TransitiveClosure(state) => {
                let (Some(source), Some(target)) = (tuple.get(0), tuple.get(1)) else {
                    return;
                };
                let changed = match direction {
                    Direction::Insert => Some(state.insert_edge(source.clone(), target.clone())),
                    Direction::Revoke => state.remove_edge(source, target),
                };
                match changed {
                    Some(pairs) => out.extend(
                        pairs
                            .into_iter()
                            .map(|(a, b)| (direction, Tuple::new(vec![a, b]))),
                    ),
                    None => {
                        issue = Some(IntegrityIssue::MissingTuple {
                            index: "transitive closure".to_string(),
                            tuple: tuple.to_string(),
                        });
                    }
                }
            }
            NodeKind::Uniqueness(memory) => {
                match refcount(memory, direction, &tuple) {
                    Ok(true) => out.push((direction, tuple)),
                    Ok(false) => {}
                    Err(()) => {
                        issue = Some(IntegrityIssue::MissingTuple {
                            index: "uniqueness".to_string(),
                            tuple: tuple.to_string(),
                        });
                    }
                }
            }
            NodeKind::Production(production) => {
                match refcount(&mut production.memory, direction, &tuple) {
                    Ok(true) => {
                        produced = true;
                        out.push((direction, tuple));
                    }
                    Ok(false) => {}
                    Err(()) => {
                        issue = Some(IntegrityIssue::MissingTuple {
                            index: format!("production {}", production.query),
                            tuple: tuple.to_string(),
                        });
                    }
                }
            }
            // Fed by indexers or by the model, never by a parent node
            NodeKind::Input(_)
            | NodeKind::Constant(_)
            | NodeKind::Join(_)
            | NodeKind::Existence(_)
            | NodeKind::OuterJoin(_)
            | NodeKind::Aggregator(_) => {}
        }
        if let Some(issue) = issue {
            self.report(issue);
        }
        for (direction, tuple) in out {
            if produced {
                self.production_events.push(ProductionEvent {
                    node: id,
                    direction,
                    tuple: tuple.clone(),
                });
            }
            self.propagate(id, direction, &tuple);
        }
    }

    fn update_indexer(&mut self, id: IndexerId, direction: Direction, tuple: &Tuple) {
        let update = match self.indexers[id.0].indexer.update(direction, tuple.clone()) {
            Ok(update) => update,
            Err(issue) => {
                self.report(issue);
                return;
            }
        };
        let count = self.indexers[id.0].listeners.len();
        for i in 0..count {
            let (node, side) = self.indexers[id.0].listeners[i];
            self.notify(node, side, direction, tuple, &update);
        }
    }

    /// Two-input or aggregating node notified by one of its indexers.
    ///
    /// When both sides read the same indexer, the primary side must see the
    /// secondary as it was before the update and the secondary side sees the
    /// primary after it; otherwise the pairing of `tuple` with itself would be
    /// counted twice on insert and never on revoke.
    fn notify(
        &mut self,
        id: NodeId,
        side: Side,
        direction: Direction,
        tuple: &Tuple,
        update: &IndexUpdate,
    ) {
        let signature = &update.signature;
        let mut out: Vec<(Direction, Tuple)> = Vec::new();
        match &mut self.nodes[id.0].kind {
            NodeKind::Join(join) => {
                let shared = join.primary == join.secondary;
                match side {
                    Side::Primary => {
                        let bucket = self.indexers[join.secondary.0].indexer.probe(signature);
                        for other in previous_view(bucket, shared, direction, tuple) {
                            out.push((direction, Mask::combine(tuple, &other, &join.complement)));
                        }
                    }
                    Side::Secondary => {
                        if let Some(bucket) = self.indexers[join.primary.0].indexer.probe(signature) {
                            for primary in bucket.occurrences() {
                                out.push((
                                    direction,
                                    Mask::combine(primary, tuple, &join.complement),
                                ));
                            }
                        }
                    }
                }
            }
            NodeKind::Existence(existence) => match side {
                Side::Primary => {
                    let present = if existence.primary == existence.secondary {
                        direction == Direction::Revoke || !update.signature_transition
                    } else {
                        self.indexers[existence.secondary.0]
                            .indexer
                            .probe(signature)
                            .is_some()
                    };
                    if present != existence.negative {
                        out.push((direction, tuple.clone()));
                    }
                }
                Side::Secondary => {
                    if update.signature_transition {
                        let emitted = if existence.negative {
                            direction.opposite()
                        } else {
                            direction
                        };
                        if let Some(bucket) =
                            self.indexers[existence.primary.0].indexer.probe(signature)
                        {
                            out.extend(bucket.occurrences().map(|p| (emitted, p.clone())));
                        }
                    }
                }
            },
            NodeKind::OuterJoin(outer) => {
                let shared = outer.primary == outer.secondary;
                match side {
                    Side::Primary => {
                        let bucket = self.indexers[outer.secondary.0].indexer.probe(signature);
                        let matches = previous_view(bucket, shared, direction, tuple);
                        if matches.is_empty() {
                            out.push((direction, tuple.concat(&outer.defaults)));
                        }
                        for other in matches {
                            out.push((direction, Mask::combine(tuple, &other, &outer.complement)));
                        }
                    }
                    Side::Secondary => {
                        let primaries: Vec<Tuple> = self.indexers[outer.primary.0]
                            .indexer
                            .probe(signature)
                            .map(|b| b.occurrences().cloned().collect())
                            .unwrap_or_default();
                        let defaulted =
                            |p: &Tuple| p.concat(&outer.defaults);
                        let joined =
                            |p: &Tuple| Mask::combine(p, tuple, &outer.complement);
                        match direction {
                            Direction::Insert => {
                                if update.signature_transition {
                                    out.extend(
                                        primaries.iter().map(|p| (Direction::Revoke, defaulted(p))),
                                    );
                                }
                                out.extend(primaries.iter().map(|p| (Direction::Insert, joined(p))));
                            }
                            Direction::Revoke => {
                                out.extend(primaries.iter().map(|p| (Direction::Revoke, joined(p))));
                                if update.signature_transition {
                                    out.extend(
                                        primaries.iter().map(|p| (Direction::Insert, defaulted(p))),
                                    );
                                }
                            }
                        }
                    }
                }
            }
            NodeKind::Aggregator(aggregator) => {
                let bucket = self.indexers[aggregator.source.0].indexer.probe(signature);
                let fresh = fold_group(aggregator, bucket);
                let old = aggregator.groups.get(signature).cloned();
                if old != fresh {
                    if let Some(old) = old {
                        out.push((Direction::Revoke, signature.extend_with(old)));
                    }
                    match fresh {
                        Some(value) => {
                            aggregator.groups.insert(signature.clone(), value.clone());
                            out.push((Direction::Insert, signature.extend_with(value)));
                        }
                        None => {
                            aggregator.groups.remove(signature);
                        }
                    }
                }
            }
            _ => {}
        }
        for (direction, tuple) in out {
            self.propagate(id, direction, &tuple);
        }
    }

    fn report(&mut self, issue: IntegrityIssue) {
        tracing::debug!(%issue, "rete_integrity_issue");
        self.issues.push(issue);
    }

    /// Drain integrity issues found since the last call
    pub fn take_issues(&mut self) -> Vec<IntegrityIssue> {
        std::mem::take(&mut self.issues)
    }

    /// Drain production match-set changes since the last call
    pub fn take_production_events(&mut self) -> Vec<ProductionEvent> {
        std::mem::take(&mut self.production_events)
    }

    // ---------------------------------------------------------------------
    // Pull
    // ---------------------------------------------------------------------

    /// Current output of a node
    pub fn pull(&self, id: NodeId) -> Vec<Tuple> {
        let mut out = Vec::new();
        self.pull_into(id, &mut out);
        out
    }

    /// Append the current output of a node to `out`, one entry per
    /// occurrence. Consistent with the net effect of every event the node
    /// has propagated so far.
    pub fn pull_into(&self, id: NodeId, out: &mut Vec<Tuple>) {
        let slot = &self.nodes[id.0];
        match &slot.kind {
            NodeKind::Input(input) => {
                for (tuple, count) in input.memory.entries() {
                    out.extend(std::iter::repeat(tuple).take(count).cloned());
                }
            }
            NodeKind::Constant(tuples) => out.extend(tuples.iter().cloned()),
            NodeKind::Trimmer(mask) => {
                out.extend(self.pull(slot.parents[0]).iter().map(|t| mask.project(t)));
            }
            NodeKind::ConstantFilter { column, value } => {
                out.extend(
                    self.pull(slot.parents[0])
                        .into_iter()
                        .filter(|t| t.values()[*column] == *value),
                );
            }
            NodeKind::EqualityFilter(groups) => {
                out.extend(self.pull(slot.parents[0]).into_iter().filter(|t| {
                    let values = t.values();
                    groups
                        .iter()
                        .all(|group| group.iter().all(|&c| values[c] == values[group[0]]))
                }));
            }
            NodeKind::InequalityFilter { left, right } => {
                out.extend(
                    self.pull(slot.parents[0])
                        .into_iter()
                        .filter(|t| t.values()[*left] != t.values()[*right]),
                );
            }
            NodeKind::Expression(node) => {
                for (output, count) in node.cache.values() {
                    if let Some(output) = output {
                        out.extend(std::iter::repeat(output).take(*count).cloned());
                    }
                }
            }
            NodeKind::Join(join) => {
                let secondary = self.indexer(join.secondary);
                for (signature, bucket) in self.indexer(join.primary).buckets() {
                    let Some(matches) = secondary.get(signature) else {
                        continue;
                    };
                    for p in bucket.occurrences() {
                        for s in matches.occurrences() {
                            out.push(Mask::combine(p, s, &join.complement));
                        }
                    }
                }
            }
            NodeKind::Existence(existence) => {
                let secondary = self.indexer(existence.secondary);
                for (signature, bucket) in self.indexer(existence.primary).buckets() {
                    if secondary.get(signature).is_some() != existence.negative {
                        out.extend(bucket.occurrences().cloned());
                    }
                }
            }
            NodeKind::OuterJoin(outer) => {
                let secondary = self.indexer(outer.secondary);
                for (signature, bucket) in self.indexer(outer.primary).buckets() {
                    for p in bucket.occurrences() {
                        match secondary.get(signature) {
                            Some(matches) => out.extend(
                                matches
                                    .occurrences()
                                    .map(|s| Mask::combine(p, s, &outer.complement)),
                            ),
                            None => out.push(p.concat(&outer.defaults)),
                        }
                    }
                }
            }
            NodeKind::Aggregator(aggregator) => {
                out.extend(
                    aggregator
                        .groups
                        .iter()
                        .map(|(signature, value)| signature.extend_with(value.clone())),
                );
            }
            NodeKind::TransitiveClosure(state) => {
                out.extend(
                    state
                        .pairs()
                        .map(|(a, b)| Tuple::new(vec![a.clone(), b.clone()])),
                );
            }
            NodeKind::Uniqueness(memory) => out.extend(memory.tuples().cloned()),
            NodeKind::Production(production) => out.extend(production.memory.tuples().cloned()),
        }
    }

    // ---------------------------------------------------------------------
    // Diagnostics and teardown
    // ---------------------------------------------------------------------

    pub fn statistics(&self) -> NetworkStatistics {
        let mut nodes_by_kind = BTreeMap::new();
        for slot in &self.nodes {
            *nodes_by_kind.entry(slot.kind.name()).or_insert(0) += 1;
        }
        NetworkStatistics {
            nodes: self.nodes.len(),
            nodes_by_kind,
            indexers: self.indexers.len(),
            indexed_tuples: self.indexers.iter().map(|s| s.indexer.tuple_count()).sum(),
            stored_tuples: self.nodes.iter().map(|s| s.kind.stored_tuples()).sum(),
            propagated_events: self.propagated_events,
            indexer_lookups: self.indexers.iter().map(|s| s.indexer.stats().lookups).sum(),
        }
    }

    /// Detach every node and drop all stored state
    pub fn clear(&mut self) {
        for slot in &mut self.nodes {
            slot.kind.clear();
            slot.receivers.clear();
        }
        for slot in &mut self.indexers {
            slot.indexer.clear();
            slot.listeners.clear();
        }
        self.nodes.clear();
        self.indexers.clear();
        self.indexer_cache.clear();
        self.inputs.clear();
        self.issues.clear();
        self.production_events.clear();
    }
}

/// Reference-count a tuple; `Ok(true)` on a 0 -> 1 or 1 -> 0 transition
fn refcount(memory: &mut TupleMemory, direction: Direction, tuple: &Tuple) -> Result<bool, ()> {
    match direction {
        Direction::Insert => Ok(memory.increment(tuple.clone()) == CountChange::Appeared),
        Direction::Revoke => match memory.decrement(tuple) {
            CountChange::Disappeared => Ok(true),
            CountChange::Missing => Err(()),
            _ => Ok(false),
        },
    }
}

/// Content of the secondary bucket before the current update, for a node
/// whose two sides read the same indexer. Identical to the bucket otherwise.
fn previous_view(
    bucket: Option<&Bucket>,
    shared: bool,
    direction: Direction,
    tuple: &Tuple,
) -> Vec<Tuple> {
    let mut view: Vec<Tuple> = bucket
        .map(|b| b.occurrences().cloned().collect())
        .unwrap_or_default();
    if shared {
        match direction {
            Direction::Insert => {
                if let Some(pos) = view.iter().position(|t| t == tuple) {
                    view.swap_remove(pos);
                }
            }
            Direction::Revoke => view.push(tuple.clone()),
        }
    }
    view
}

fn fold_group(aggregator: &AggregatorNode, bucket: Option<&Bucket>) -> Option<Value> {
    let bucket = bucket?;
    let mut values = bucket.occurrences().map(|t| match aggregator.column {
        Some(column) => &t.values()[column],
        None => &NULL_VALUE,
    });
    aggregator.operator.aggregate(&mut values)
}

#[cfg(test)]
mod tests {
    use super::aggregate::Count;
    use super::*;
    use crate::tuple;

    fn key(name: &str) -> InputKey {
        InputKey::Feature(name.into())
    }

    fn sorted(mut tuples: Vec<Tuple>) -> Vec<Tuple> {
        tuples.sort();
        tuples
    }

    #[test]
    fn test_self_join_on_shared_indexer() {
        let mut net = Network::new();
        let edge = net.add_input(key("edge"), 2, true);
        // edge(x, y), edge(x, z): both sides index column 0 of the same node
        let join = net.add_join(edge, Mask::new(vec![0], 2), edge, Mask::new(vec![0], 2));

        net.update_input(&key("edge"), Direction::Insert, tuple!(1i64, 2i64));
        assert_eq!(net.pull(join), vec![tuple!(1i64, 2i64, 2i64)]);

        net.update_input(&key("edge"), Direction::Insert, tuple!(1i64, 3i64));
        assert_eq!(net.pull(join).len(), 4);

        net.update_input(&key("edge"), Direction::Revoke, tuple!(1i64, 2i64));
        assert_eq!(net.pull(join), vec![tuple!(1i64, 3i64, 3i64)]);
        assert!(net.take_issues().is_empty());
    }

    #[test]
    fn test_aggregator_replaces_group_row() {
        let mut net = Network::new();
        let edge = net.add_input(key("edge"), 2, true);
        let count = net.add_aggregator(edge, Mask::new(vec![0], 2), Arc::new(Count), None);
        let production = net.add_production("degree", 2);
        net.connect_production(production, count);

        net.update_input(&key("edge"), Direction::Insert, tuple!("a", 1i64));
        net.update_input(&key("edge"), Direction::Insert, tuple!("a", 2i64));
        assert_eq!(net.pull(production), vec![tuple!("a", 2i64)]);

        let events = net.take_production_events();
        let directions: Vec<Direction> = events.iter().map(|e| e.direction).collect();
        assert_eq!(
            directions,
            vec![Direction::Insert, Direction::Revoke, Direction::Insert]
        );
    }

    #[test]
    fn test_late_indexer_pulls_existing_content() {
        let mut net = Network::new();
        let edge = net.add_input(key("edge"), 2, true);
        net.update_input(&key("edge"), Direction::Insert, tuple!("a", 1i64));
        net.update_input(&key("edge"), Direction::Insert, tuple!("b", 2i64));

        let trimmed = net.add_trimmer(edge, Mask::new(vec![1], 2));
        let index = net.indexer_for(trimmed, Mask::identity(1));
        assert_eq!(net.indexer(index).tuple_count(), 2);
        assert_eq!(
            sorted(net.pull(trimmed)),
            vec![tuple!(1i64), tuple!(2i64)]
        );
    }

    #[test]
    fn test_unique_input_rejects_duplicate() {
        let mut net = Network::new();
        net.add_input(key("edge"), 2, true);
        net.update_input(&key("edge"), Direction::Insert, tuple!(1i64, 2i64));
        net.update_input(&key("edge"), Direction::Insert, tuple!(1i64, 2i64));
        let issues = net.take_issues();
        assert!(matches!(issues[..], [IntegrityIssue::DuplicateInsert { .. }]));
    }

    #[test]
    fn test_unused_key_is_ignored() {
        let mut net = Network::new();
        assert!(!net.update_input(&key("missing"), Direction::Insert, tuple!(1i64)));
    }

    #[test]
    fn test_statistics() {
        let mut net = Network::new();
        let edge = net.add_input(key("edge"), 2, true);
        let _ = net.add_uniqueness(edge);
        net.update_input(&key("edge"), Direction::Insert, tuple!(1i64, 2i64));

        let stats = net.statistics();
        assert_eq!(stats.nodes, 2);
        assert_eq!(stats.nodes_by_kind.get("uniqueness"), Some(&1));
        assert_eq!(stats.stored_tuples, 2);
        assert!(stats.propagated_events >= 2);
    }
}
