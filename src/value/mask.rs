//! Column selection descriptors.
//!
//! A [`Mask`] names an ordered list of source columns of a tuple with a known
//! width. Masks project signatures out of full tuples and rebuild join
//! results from a primary tuple plus the "new" columns of a secondary one.
//!
//! Repeated indices are allowed and describe positions that must hold equal
//! values; enforcing that equality is the job of an equality filter node, a
//! mask never checks it.

use super::{Tuple, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mask {
    indices: Vec<usize>,
    source_arity: usize,
}

impl Mask {
    /// Create a mask over tuples of width `source_arity`.
    ///
    /// # Panics
    /// If any index is out of range.
    pub fn new(indices: Vec<usize>, source_arity: usize) -> Self {
        assert!(
            indices.iter().all(|&i| i < source_arity),
            "mask index out of range: {indices:?} over width {source_arity}"
        );
        Mask {
            indices,
            source_arity,
        }
    }

    /// Select every column in order
    pub fn identity(arity: usize) -> Self {
        Mask::new((0..arity).collect(), arity)
    }

    /// Select no column (every tuple has the empty signature)
    pub fn empty(source_arity: usize) -> Self {
        Mask::new(Vec::new(), source_arity)
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn source_arity(&self) -> usize {
        self.source_arity
    }

    /// Width of the projected tuple
    pub fn arity(&self) -> usize {
        self.indices.len()
    }

    pub fn is_identity(&self) -> bool {
        self.indices.len() == self.source_arity
            && self.indices.iter().enumerate().all(|(i, &c)| i == c)
    }

    /// Project `tuple` through this mask.
    ///
    /// # Panics
    /// If the tuple width differs from the mask's source width.
    pub fn project(&self, tuple: &Tuple) -> Tuple {
        assert_eq!(
            tuple.arity(),
            self.source_arity,
            "mask over width {} applied to tuple {tuple}",
            self.source_arity
        );
        let values = self
            .indices
            .iter()
            .map(|&i| tuple.values()[i].clone())
            .collect();
        Tuple::new(values)
    }

    /// Columns of the source not selected by this mask, in source order
    pub fn complement(&self) -> Mask {
        let indices = (0..self.source_arity)
            .filter(|i| !self.indices.contains(i))
            .collect();
        Mask::new(indices, self.source_arity)
    }

    /// Append to `base` the columns of `complement` selected by `complement_mask`.
    pub fn combine(base: &Tuple, complement: &Tuple, complement_mask: &Mask) -> Tuple {
        let mut values = Vec::with_capacity(base.arity() + complement_mask.arity());
        values.extend(base.values().iter().cloned());
        values.extend(complement_mask.project(complement).values().iter().cloned());
        Tuple::new(values)
    }

    /// Groups of source positions selected more than once, as
    /// `(first position in the mask, other positions in the mask)`.
    pub fn repeated_positions(&self) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (pos, column) in self.indices.iter().enumerate() {
            let first = self.indices.iter().position(|c| c == column).unwrap_or(pos);
            if first == pos {
                continue;
            }
            match groups.iter_mut().find(|g| g[0] == first) {
                Some(group) => group.push(pos),
                None => groups.push(vec![first, pos]),
            }
        }
        groups
    }

    /// A tuple of `Null`s matching this mask's width.
    pub fn null_tuple(&self) -> Tuple {
        Tuple::new(vec![Value::Null; self.arity()])
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols: Vec<String> = self.indices.iter().map(ToString::to_string).collect();
        write!(f, "[{}]/{}", cols.join(","), self.source_arity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn test_project_reorders() {
        let mask = Mask::new(vec![2, 0], 3);
        assert_eq!(mask.project(&tuple!(1i64, 2i64, 3i64)), tuple!(3i64, 1i64));
    }

    #[test]
    #[should_panic(expected = "mask over width")]
    fn test_project_width_contract() {
        let mask = Mask::new(vec![0], 2);
        let _ = mask.project(&tuple!(1i64, 2i64, 3i64));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_out_of_range() {
        let _ = Mask::new(vec![3], 3);
    }

    #[test]
    fn test_complement_and_combine() {
        let secondary_sig = Mask::new(vec![0], 2);
        let complement = secondary_sig.complement();
        assert_eq!(complement.indices(), &[1]);

        let joined = Mask::combine(&tuple!("a", 1i64), &tuple!("a", "X"), &complement);
        assert_eq!(joined, tuple!("a", 1i64, "X"));
    }

    #[test]
    fn test_repeated_positions() {
        let mask = Mask::new(vec![0, 1, 0, 0], 2);
        assert_eq!(mask.repeated_positions(), vec![vec![0, 2, 3]]);
        assert!(Mask::new(vec![1, 0], 2).repeated_positions().is_empty());
    }

    #[test]
    fn test_identity() {
        assert!(Mask::identity(3).is_identity());
        assert!(!Mask::new(vec![1, 0], 2).is_identity());
        assert_eq!(Mask::empty(2).project(&tuple!(1i64, 2i64)), Tuple::empty());
    }
}
