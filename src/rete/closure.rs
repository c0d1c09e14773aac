//! Incremental transitive closure of a binary relation.
//!
//! Insertions extend reachability by joining everything that reaches the
//! edge source with everything reachable from the edge target. Removals
//! cannot simply decrement, because several paths may justify the same
//! pair: every source that reached the removed edge has its reachable set
//! recomputed from the remaining edges.
//!
//! The closure is irreflexive: `(a, a)` is derived only when the base
//! relation contains the edge `(a, a)` itself, even if `a` lies on a cycle.

use crate::value::Value;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct ClosureState {
    /// Base edge multiplicities
    edges: HashMap<(Value, Value), usize>,
    successors: HashMap<Value, HashSet<Value>>,
    /// source -> targets reachable in one or more steps
    reachable: HashMap<Value, HashSet<Value>>,
    /// target -> sources reaching it
    reached_by: HashMap<Value, HashSet<Value>>,
}

impl ClosureState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one occurrence of a base edge, returning newly derived pairs
    pub fn insert_edge(&mut self, source: Value, target: Value) -> Vec<(Value, Value)> {
        let count = self
            .edges
            .entry((source.clone(), target.clone()))
            .or_insert(0);
        *count += 1;
        if *count > 1 {
            return Vec::new();
        }
        self.successors
            .entry(source.clone())
            .or_default()
            .insert(target.clone());

        let mut sources: Vec<Value> = self
            .reached_by
            .get(&source)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        if !sources.contains(&source) {
            sources.push(source.clone());
        }
        let mut targets: Vec<Value> = self
            .reachable
            .get(&target)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }

        let mut derived = Vec::new();
        for a in &sources {
            for b in &targets {
                if a == b && !self.has_edge(a, a) {
                    continue;
                }
                if self.add_pair(a.clone(), b.clone()) {
                    derived.push((a.clone(), b.clone()));
                }
            }
        }
        derived
    }

    /// Remove one occurrence of a base edge, returning pairs no longer derivable.
    ///
    /// Returns `None` if the edge was not present.
    pub fn remove_edge(&mut self, source: &Value, target: &Value) -> Option<Vec<(Value, Value)>> {
        let key = (source.clone(), target.clone());
        let count = self.edges.get_mut(&key)?;
        if *count > 1 {
            *count -= 1;
            return Some(Vec::new());
        }
        self.edges.remove(&key);
        if let Some(succ) = self.successors.get_mut(source) {
            succ.remove(target);
            if succ.is_empty() {
                self.successors.remove(source);
            }
        }

        let mut affected: Vec<Value> = self
            .reached_by
            .get(source)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        if !affected.contains(source) {
            affected.push(source.clone());
        }

        let mut lost = Vec::new();
        for a in affected {
            let fresh = self.search_from(&a);
            let stale: Vec<Value> = self
                .reachable
                .get(&a)
                .map(|old| old.difference(&fresh).cloned().collect())
                .unwrap_or_default();
            for b in stale {
                self.remove_pair(&a, &b);
                lost.push((a.clone(), b));
            }
        }
        Some(lost)
    }

    pub fn contains(&self, source: &Value, target: &Value) -> bool {
        self.reachable
            .get(source)
            .is_some_and(|targets| targets.contains(target))
    }

    /// All closure pairs
    pub fn pairs(&self) -> impl Iterator<Item = (&Value, &Value)> + '_ {
        self.reachable
            .iter()
            .flat_map(|(a, targets)| targets.iter().map(move |b| (a, b)))
    }

    pub fn pair_count(&self) -> usize {
        self.reachable.values().map(HashSet::len).sum()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn has_edge(&self, source: &Value, target: &Value) -> bool {
        self.edges
            .contains_key(&(source.clone(), target.clone()))
    }

    fn add_pair(&mut self, a: Value, b: Value) -> bool {
        let added = self.reachable.entry(a.clone()).or_default().insert(b.clone());
        if added {
            self.reached_by.entry(b).or_default().insert(a);
        }
        added
    }

    fn remove_pair(&mut self, a: &Value, b: &Value) {
        if let Some(targets) = self.reachable.get_mut(a) {
            targets.remove(b);
            if targets.is_empty() {
                self.reachable.remove(a);
            }
        }
        if let Some(sources) = self.reached_by.get_mut(b) {
            sources.remove(a);
            if sources.is_empty() {
                self.reached_by.remove(b);
            }
        }
    }

    /// Breadth-first reachability over the current base edges
    fn search_from(&self, start: &Value) -> HashSet<Value> {
        let mut seen: HashSet<Value> = HashSet::new();
        let mut queue: VecDeque<&Value> = VecDeque::new();
        queue.push_back(start);
        while let Some(node) = queue.pop_front() {
            for next in self.successors.get(node).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        if !self.has_edge(start, start) {
            seen.remove(start);
        }
        seen
    }
}
