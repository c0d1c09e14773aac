//! Signature indexing for node outputs. O(1) lookup of full tuples by the
//! sub-tuple a [`Mask`] projects out of them.
//!
//! # Architecture
//!
//! ```text
//! Indexer
//!   |-- Mask                          (tuple -> signature)
//!   |-- HashMap<Tuple, Bucket>        (signature -> tuples)
//!   |     |-- Bucket::Unique          (duplicate-free parent)
//!   |     `-- Bucket::Counted         (multiset parent)
//!   `-- IndexerStats
//! ```
//!
//! Every update reports whether the signature itself appeared or vanished
//! (`signature_transition`), so dependents can ignore multiplicity changes
//! inside a bucket that already existed.
//!
//! # Example
//!
//! ```
//! use patternflow::index::Indexer;
//! use patternflow::value::Mask;
//! use patternflow::tuple;
//!
//! let mut index = Indexer::new("edge[0]", Mask::new(vec![0], 2), true);
//! assert!(index.insert(tuple!("a", 1i64)).unwrap().signature_transition);
//! assert!(!index.insert(tuple!("a", 2i64)).unwrap().signature_transition);
//! assert_eq!(index.get(&tuple!("a")).map(|b| b.len()), Some(2));
//! ```

use crate::error::IntegrityIssue;
use crate::rete::Direction;
use crate::value::{Mask, Tuple};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

/// Tuples sharing one signature
#[derive(Debug, Clone)]
pub enum Bucket {
    /// The parent never emits the same tuple twice
    Unique(HashSet<Tuple>),
    /// Tuple -> multiplicity
    Counted(HashMap<Tuple, usize>),
}

impl Bucket {
    fn new(unique: bool) -> Self {
        if unique {
            Bucket::Unique(HashSet::new())
        } else {
            Bucket::Counted(HashMap::new())
        }
    }

    /// Total number of tuples, counting multiplicities
    pub fn len(&self) -> usize {
        match self {
            Bucket::Unique(set) => set.len(),
            Bucket::Counted(map) => map.values().sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Bucket::Unique(set) => set.is_empty(),
            Bucket::Counted(map) => map.is_empty(),
        }
    }

    pub fn contains(&self, tuple: &Tuple) -> bool {
        match self {
            Bucket::Unique(set) => set.contains(tuple),
            Bucket::Counted(map) => map.contains_key(tuple),
        }
    }

    /// Multiplicity of one tuple
    pub fn count(&self, tuple: &Tuple) -> usize {
        match self {
            Bucket::Unique(set) => usize::from(set.contains(tuple)),
            Bucket::Counted(map) => map.get(tuple).copied().unwrap_or(0),
        }
    }

    /// Distinct tuples with their multiplicities
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&Tuple, usize)> + '_> {
        match self {
            Bucket::Unique(set) => Box::new(set.iter().map(|t| (t, 1))),
            Bucket::Counted(map) => Box::new(map.iter().map(|(t, &n)| (t, n))),
        }
    }

    /// Every tuple, repeated by multiplicity
    pub fn occurrences(&self) -> impl Iterator<Item = &Tuple> + '_ {
        self.iter()
            .flat_map(|(tuple, n)| std::iter::repeat(tuple).take(n))
    }
}

/// Outcome of a single index update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexUpdate {
    /// Signature of the updated tuple
    pub signature: Tuple,
    /// True if the signature was absent before an insert or is absent after a removal
    pub signature_transition: bool,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexerStats {
    pub inserts: u64,
    pub removals: u64,
    pub lookups: u64,
}

/// Signature -> tuples storage
#[derive(Debug, Clone)]
pub struct Indexer {
    name: String,
    mask: Mask,
    unique: bool,
    buckets: HashMap<Tuple, Bucket>,
    tuple_count: usize,
    stats: IndexerStats,
}

impl Indexer {
    /// Create an indexer.
    ///
    /// `unique` must only be set when the fed stream never contains the same
    /// tuple twice at once; buckets are then plain sets.
    pub fn new(name: impl Into<String>, mask: Mask, unique: bool) -> Self {
        Indexer {
            name: name.into(),
            mask,
            unique,
            buckets: HashMap::new(),
            tuple_count: 0,
            stats: IndexerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Point lookup by signature
    pub fn get(&self, signature: &Tuple) -> Option<&Bucket> {
        self.buckets.get(signature)
    }

    /// Point lookup that also counts towards the lookup statistics
    pub fn probe(&mut self, signature: &Tuple) -> Option<&Bucket> {
        self.stats.lookups += 1;
        self.buckets.get(signature)
    }

    /// Apply an insert or revoke
    pub fn update(&mut self, direction: Direction, tuple: Tuple) -> Result<IndexUpdate, IntegrityIssue> {
        match direction {
            Direction::Insert => self.insert(tuple),
            Direction::Revoke => self.remove(&tuple),
        }
    }

    /// Add a tuple to its signature's bucket
    pub fn insert(&mut self, tuple: Tuple) -> Result<IndexUpdate, IntegrityIssue> {
        let signature = self.mask.project(&tuple);
        let unique = self.unique;
        let bucket = match self.buckets.entry(signature.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(Bucket::new(unique)),
        };
        let was_empty = bucket.is_empty();
        match bucket {
            Bucket::Unique(set) => {
                if set.contains(&tuple) {
                    return Err(IntegrityIssue::DuplicateInsert {
                        index: self.name.clone(),
                        tuple: tuple.to_string(),
                    });
                }
                set.insert(tuple);
            }
            Bucket::Counted(map) => *map.entry(tuple).or_insert(0) += 1,
        }
        self.tuple_count += 1;
        self.stats.inserts += 1;
        Ok(IndexUpdate {
            signature,
            signature_transition: was_empty,
        })
    }

    /// Remove one occurrence of a tuple
    pub fn remove(&mut self, tuple: &Tuple) -> Result<IndexUpdate, IntegrityIssue> {
        let signature = self.mask.project(tuple);
        let missing = || IntegrityIssue::MissingTuple {
            index: self.name.clone(),
            tuple: tuple.to_string(),
        };
        let Some(bucket) = self.buckets.get_mut(&signature) else {
            return Err(missing());
        };
        let removed = match bucket {
            Bucket::Unique(set) => set.remove(tuple),
            Bucket::Counted(map) => match map.get_mut(tuple) {
                Some(n) if *n > 1 => {
                    *n -= 1;
                    true
                }
                Some(_) => map.remove(tuple).is_some(),
                None => false,
            },
        };
        if !removed {
            return Err(missing());
        }
        let now_empty = bucket.is_empty();
        if now_empty {
            self.buckets.remove(&signature);
        }
        self.tuple_count -= 1;
        self.stats.removals += 1;
        Ok(IndexUpdate {
            signature,
            signature_transition: now_empty,
        })
    }

    /// All signatures currently holding at least one tuple
    pub fn signatures(&self) -> impl Iterator<Item = &Tuple> + '_ {
        self.buckets.keys()
    }

    /// All buckets
    pub fn buckets(&self) -> impl Iterator<Item = (&Tuple, &Bucket)> + '_ {
        self.buckets.iter()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Stored tuples, counting multiplicities
    pub fn tuple_count(&self) -> usize {
        self.tuple_count
    }

    pub fn stats(&self) -> &IndexerStats {
        &self.stats
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.tuple_count = 0;
    }
}
