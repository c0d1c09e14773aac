//! Reference-counted tuple storage.

use crate::value::Tuple;
use std::collections::HashMap;

/// Result of changing a tuple's reference count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountChange {
    /// 0 -> 1
    Appeared,
    /// 1 -> 0
    Disappeared,
    /// Interior change, count stays positive
    Unchanged,
    /// Revoke of a tuple with count 0
    Missing,
}

/// Multiset of tuples with per-tuple reference counts
#[derive(Debug, Clone, Default)]
pub struct TupleMemory {
    counts: HashMap<Tuple, usize>,
}

impl TupleMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, tuple: Tuple) -> CountChange {
        let count = self.counts.entry(tuple).or_insert(0);
        *count += 1;
        if *count == 1 {
            CountChange::Appeared
        } else {
            CountChange::Unchanged
        }
    }

    pub fn decrement(&mut self, tuple: &Tuple) -> CountChange {
        match self.counts.get_mut(tuple) {
            None => CountChange::Missing,
            Some(count) if *count > 1 => {
                *count -= 1;
                CountChange::Unchanged
            }
            Some(_) => {
                self.counts.remove(tuple);
                CountChange::Disappeared
            }
        }
    }

    pub fn count(&self, tuple: &Tuple) -> usize {
        self.counts.get(tuple).copied().unwrap_or(0)
    }

    pub fn contains(&self, tuple: &Tuple) -> bool {
        self.counts.contains_key(tuple)
    }

    /// Distinct tuples
    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> + '_ {
        self.counts.keys()
    }

    /// Distinct tuples with their counts
    pub fn entries(&self) -> impl Iterator<Item = (&Tuple, usize)> + '_ {
        self.counts.iter().map(|(t, &n)| (t, n))
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}
