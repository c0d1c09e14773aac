//! Object-graph side of the engine.
//!
//! Queries read the graph through two channels:
//!
//! - bulk queries on a [`ModelIndex`] (`instances_of`, `values_of`,
//!   `holders_of`), used by local search and to seed new input nodes;
//! - a stream of [`ModelChange`] events, drained by the engine after every
//!   update and fed into the network's input nodes.
//!
//! [`InMemoryModel`] is a complete reference implementation backed by hash
//! maps. Other models only need to implement the trait.

use crate::rete::Direction;
use crate::value::{ObjectId, Tuple, Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Opaque identifier of a base relation: a class extent (unary) or a
/// feature's `(holder, value)` pairs (binary)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InputKey {
    Class(Arc<str>),
    Feature(Arc<str>),
}

impl InputKey {
    pub fn class(name: &str) -> Self {
        InputKey::Class(name.into())
    }

    pub fn feature(name: &str) -> Self {
        InputKey::Feature(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            InputKey::Class(name) | InputKey::Feature(name) => name,
        }
    }

    /// Width of the tuples stored under this key
    pub fn arity(&self) -> usize {
        match self {
            InputKey::Class(_) => 1,
            InputKey::Feature(_) => 2,
        }
    }
}

impl fmt::Display for InputKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKey::Class(name) => write!(f, "class:{name}"),
            InputKey::Feature(name) => write!(f, "feature:{name}"),
        }
    }
}

/// One base-relation change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChange {
    pub direction: Direction,
    pub key: InputKey,
    pub tuple: Tuple,
}

/// Declaration of a feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDecl {
    pub name: Arc<str>,
    /// Class declaring the feature; holders are instances of it
    pub source: Option<Arc<str>>,
    /// Kind of the feature's values, if fixed
    pub target: Option<ValueKind>,
    /// Whether one holder may carry the same value only once
    pub unique: bool,
}

impl FeatureDecl {
    pub fn new(name: &str) -> Self {
        FeatureDecl {
            name: name.into(),
            source: None,
            target: None,
            unique: true,
        }
    }

    pub fn source(mut self, class: &str) -> Self {
        self.source = Some(class.into());
        self
    }

    pub fn target(mut self, kind: ValueKind) -> Self {
        self.target = Some(kind);
        self
    }

    /// Allow duplicate values per holder
    pub fn non_unique(mut self) -> Self {
        self.unique = false;
        self
    }
}

/// Class hierarchy and feature declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metamodel {
    /// class -> direct supertypes
    classes: BTreeMap<Arc<str>, Vec<Arc<str>>>,
    features: BTreeMap<Arc<str>, FeatureDecl>,
}

impl Metamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(mut self, name: &str, supertypes: &[&str]) -> Self {
        for supertype in supertypes {
            self.classes.entry((*supertype).into()).or_default();
        }
        self.classes.insert(
            name.into(),
            supertypes.iter().map(|s| Arc::from(*s)).collect(),
        );
        self
    }

    pub fn with_feature(mut self, feature: FeatureDecl) -> Self {
        self.features.insert(feature.name.clone(), feature);
        self
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureDecl> {
        self.features.get(name)
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// Class declaring `feature`, if known
    pub fn source_class(&self, feature: &str) -> Option<&str> {
        self.features.get(feature)?.source.as_deref()
    }

    /// Undeclared features are treated as unique
    pub fn is_unique_feature(&self, feature: &str) -> bool {
        self.features.get(feature).is_none_or(|f| f.unique)
    }

    /// `class` and all of its transitive supertypes
    pub fn supertypes_of(&self, class: &str) -> Vec<Arc<str>> {
        let mut seen: BTreeSet<Arc<str>> = BTreeSet::new();
        let mut stack: Vec<Arc<str>> = vec![class.into()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(parents) = self.classes.get(&current) {
                stack.extend(parents.iter().cloned());
            }
        }
        seen.into_iter().collect()
    }

    /// Whether tuples under `key` are free of duplicates
    pub fn is_unique_key(&self, key: &InputKey) -> bool {
        match key {
            InputKey::Class(_) => true,
            InputKey::Feature(name) => self.is_unique_feature(name),
        }
    }
}

/// Bulk read access to the object graph plus its change log
pub trait ModelIndex {
    fn metamodel(&self) -> &Metamodel;

    /// All instances of `class`, including instances of its subclasses
    fn instances_of(&self, class: &str) -> Vec<Value>;

    /// Values of `feature` on `holder`, one entry per occurrence
    fn values_of(&self, holder: &Value, feature: &str) -> Vec<Value>;

    /// Holders carrying `value` in `feature`, one entry per occurrence
    fn holders_of(&self, feature: &str, value: &Value) -> Vec<Value>;

    /// Every `(holder, value)` pair of `feature`, one entry per occurrence
    fn feature_tuples(&self, feature: &str) -> Vec<Tuple>;

    /// Take the changes recorded since the last drain
    fn drain_changes(&mut self) -> Vec<ModelChange>;

    fn is_instance(&self, class: &str, value: &Value) -> bool {
        self.instances_of(class).contains(value)
    }

    fn has_value(&self, holder: &Value, feature: &str, value: &Value) -> bool {
        self.values_of(holder, feature).contains(value)
    }

    /// Current content of a base relation
    fn tuples(&self, key: &InputKey) -> Vec<Tuple> {
        match key {
            InputKey::Class(class) => self
                .instances_of(class)
                .into_iter()
                .map(|v| Tuple::new(vec![v]))
                .collect(),
            InputKey::Feature(feature) => self.feature_tuples(feature),
        }
    }
}

/// Hash-map backed object graph
#[derive(Debug, Default)]
pub struct InMemoryModel {
    metamodel: Metamodel,
    next_object: u64,
    /// object -> direct class
    objects: BTreeMap<ObjectId, Arc<str>>,
    /// class -> instances, subclass instances included
    extents: HashMap<Arc<str>, BTreeSet<Value>>,
    /// (holder, feature) -> values in insertion order
    slots: HashMap<(Value, Arc<str>), Vec<Value>>,
    /// (feature, value) -> holders, one entry per occurrence
    inverse: HashMap<(Arc<str>, Value), Vec<Value>>,
    changes: Vec<ModelChange>,
}

impl InMemoryModel {
    pub fn new(metamodel: Metamodel) -> Self {
        InMemoryModel {
            metamodel,
            ..Self::default()
        }
    }

    /// Create an object of `class`; it joins the extent of every supertype
    pub fn create_object(&mut self, class: &str) -> ObjectId {
        self.next_object += 1;
        let id = ObjectId(self.next_object);
        self.objects.insert(id, class.into());
        for extent in self.metamodel.supertypes_of(class) {
            self.add_instance(&extent, Value::Object(id));
        }
        id
    }

    /// Delete an object, its class memberships, and every feature value
    /// held by it or referring to it
    pub fn remove_object(&mut self, id: ObjectId) -> bool {
        let Some(class) = self.objects.remove(&id) else {
            return false;
        };
        let object = Value::Object(id);

        let mut held: Vec<(Arc<str>, Value)> = Vec::new();
        for ((holder, feature), values) in &self.slots {
            if *holder == object {
                held.extend(values.iter().map(|v| (feature.clone(), v.clone())));
            }
        }
        for (feature, value) in held {
            self.remove_value(&object, &feature, &value);
        }

        let mut referring: Vec<(Arc<str>, Value)> = Vec::new();
        for ((feature, value), holders) in &self.inverse {
            if *value == object {
                referring.extend(holders.iter().map(|h| (feature.clone(), h.clone())));
            }
        }
        for (feature, holder) in referring {
            self.remove_value(&holder, &feature, &object);
        }

        for extent in self.metamodel.supertypes_of(&class) {
            self.remove_instance(&extent, &object);
        }
        true
    }

    pub fn contains_object(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Add a plain value to a class extent
    pub fn add_instance(&mut self, class: &str, value: Value) -> bool {
        let added = self.extents.entry(class.into()).or_default().insert(value.clone());
        if added {
            self.record(Direction::Insert, InputKey::class(class), Tuple::new(vec![value]));
        }
        added
    }

    pub fn remove_instance(&mut self, class: &str, value: &Value) -> bool {
        let removed = self
            .extents
            .get_mut(class)
            .is_some_and(|extent| extent.remove(value));
        if removed {
            self.record(
                Direction::Revoke,
                InputKey::class(class),
                Tuple::new(vec![value.clone()]),
            );
        }
        removed
    }

    /// Append a value to a feature. Unique features ignore a value the
    /// holder already carries.
    pub fn add_value(&mut self, holder: &Value, feature: &str, value: Value) -> bool {
        let unique = self.metamodel.is_unique_feature(feature);
        let feature: Arc<str> = feature.into();
        let values = self
            .slots
            .entry((holder.clone(), feature.clone()))
            .or_default();
        if unique && values.contains(&value) {
            return false;
        }
        values.push(value.clone());
        self.inverse
            .entry((feature.clone(), value.clone()))
            .or_default()
            .push(holder.clone());
        self.record(
            Direction::Insert,
            InputKey::Feature(feature),
            Tuple::new(vec![holder.clone(), value]),
        );
        true
    }

    /// Remove one occurrence of a feature value
    pub fn remove_value(&mut self, holder: &Value, feature: &str, value: &Value) -> bool {
        let feature: Arc<str> = feature.into();
        let slot_key = (holder.clone(), feature.clone());
        let Some(values) = self.slots.get_mut(&slot_key) else {
            return false;
        };
        let Some(pos) = values.iter().position(|v| v == value) else {
            return false;
        };
        values.remove(pos);
        if values.is_empty() {
            self.slots.remove(&slot_key);
        }
        let inverse_key = (feature.clone(), value.clone());
        if let Some(holders) = self.inverse.get_mut(&inverse_key) {
            if let Some(pos) = holders.iter().position(|h| h == holder) {
                holders.remove(pos);
            }
            if holders.is_empty() {
                self.inverse.remove(&inverse_key);
            }
        }
        self.record(
            Direction::Revoke,
            InputKey::Feature(feature),
            Tuple::new(vec![holder.clone(), value.clone()]),
        );
        true
    }

    /// Replace every value of a single-valued feature
    pub fn set_value(&mut self, holder: &Value, feature: &str, value: Value) {
        for old in self.values_of(holder, feature) {
            self.remove_value(holder, feature, &old);
        }
        self.add_value(holder, feature, value);
    }

    /// Changes recorded and not yet drained
    pub fn pending_changes(&self) -> usize {
        self.changes.len()
    }

    fn record(&mut self, direction: Direction, key: InputKey, tuple: Tuple) {
        tracing::trace!(%direction, %key, %tuple, "model_change");
        self.changes.push(ModelChange {
            direction,
            key,
            tuple,
        });
    }
}

impl ModelIndex for InMemoryModel {
    fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    fn instances_of(&self, class: &str) -> Vec<Value> {
        self.extents
            .get(class)
            .map(|extent| extent.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn values_of(&self, holder: &Value, feature: &str) -> Vec<Value> {
        self.slots
            .get(&(holder.clone(), Arc::from(feature)))
            .cloned()
            .unwrap_or_default()
    }

    fn holders_of(&self, feature: &str, value: &Value) -> Vec<Value> {
        self.inverse
            .get(&(Arc::from(feature), value.clone()))
            .cloned()
            .unwrap_or_default()
    }

    fn feature_tuples(&self, feature: &str) -> Vec<Tuple> {
        let mut tuples: Vec<Tuple> = self
            .slots
            .iter()
            .filter(|((_, f), _)| &**f == feature)
            .flat_map(|((holder, _), values)| {
                values
                    .iter()
                    .map(move |v| Tuple::new(vec![holder.clone(), v.clone()]))
            })
            .collect();
        tuples.sort();
        tuples
    }

    fn drain_changes(&mut self) -> Vec<ModelChange> {
        std::mem::take(&mut self.changes)
    }

    fn is_instance(&self, class: &str, value: &Value) -> bool {
        self.extents
            .get(class)
            .is_some_and(|extent| extent.contains(value))
    }
}
