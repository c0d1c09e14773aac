//! Property-based network tests (proptest): incremental results agree with
//! recomputation from scratch regardless of update order.

use patternflow::rete::{Direction, Network};
use patternflow::{tuple, InputKey, Mask, Tuple};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

fn pairs() -> impl Strategy<Value = BTreeSet<(i64, i64)>> {
    prop::collection::btree_set((0i64..6, 0i64..6), 0..16)
}

/// Naive irreflexive closure of an edge set without self-loops
fn recompute_closure(edges: &BTreeSet<(i64, i64)>) -> HashSet<Tuple> {
    let mut successors: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    for &(a, b) in edges {
        successors.entry(a).or_default().push(b);
    }
    let mut result = HashSet::new();
    for &start in successors.keys() {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<i64> = successors[&start].iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = successors.get(&node) {
                queue.extend(next.iter().copied());
            }
        }
        for target in seen {
            if target != start {
                result.insert(tuple!(start, target));
            }
        }
    }
    result
}

proptest! {
    #[test]
    fn join_result_is_independent_of_arrival_order(
        left in pairs(),
        right in pairs(),
        right_first in any::<bool>(),
    ) {
        let mut net = Network::new();
        let l = net.add_input(InputKey::feature("left"), 2, true);
        let r = net.add_input(InputKey::feature("right"), 2, true);
        // left.1 = right.0
        let join = net.add_join(l, Mask::new(vec![1], 2), r, Mask::new(vec![0], 2));

        let left_tuples: Vec<Tuple> = left.iter().map(|&(a, b)| tuple!(a, b)).collect();
        let right_tuples: Vec<Tuple> = right.iter().map(|&(a, b)| tuple!(a, b)).collect();
        let mut batches = vec![
            (InputKey::feature("left"), left_tuples),
            (InputKey::feature("right"), right_tuples),
        ];
        if right_first {
            batches.reverse();
        }
        for (key, tuples) in batches {
            for t in tuples {
                net.update_input(&key, Direction::Insert, t);
            }
        }

        let expected: HashSet<Tuple> = left
            .iter()
            .flat_map(|&(a, b)| {
                right
                    .iter()
                    .filter(move |&&(c, _)| c == b)
                    .map(move |&(_, d)| tuple!(a, b, d))
            })
            .collect();
        let actual: HashSet<Tuple> = net.pull(join).into_iter().collect();
        prop_assert_eq!(actual, expected);
        prop_assert!(net.take_issues().is_empty());
    }

    #[test]
    fn uniqueness_tracks_positive_multiplicity(
        ops in prop::collection::vec((0i64..4, any::<bool>()), 0..40),
    ) {
        let mut net = Network::new();
        let input = net.add_input(InputKey::class("Tag"), 1, false);
        let unique = net.add_uniqueness(input);
        let key = InputKey::class("Tag");

        let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
        for (value, insert) in ops {
            let count = counts.entry(value).or_insert(0);
            if insert {
                *count += 1;
                net.update_input(&key, Direction::Insert, tuple!(value));
            } else if *count > 0 {
                *count -= 1;
                net.update_input(&key, Direction::Revoke, tuple!(value));
            }
        }

        let expected: HashSet<Tuple> = counts
            .iter()
            .filter(|(_, &c)| c > 0)
            .map(|(&v, _)| tuple!(v))
            .collect();
        let actual: Vec<Tuple> = net.pull(unique);
        prop_assert_eq!(actual.len(), expected.len());
        prop_assert_eq!(actual.into_iter().collect::<HashSet<_>>(), expected);
        prop_assert!(net.take_issues().is_empty());
    }

    #[test]
    fn closure_matches_recomputation_after_removals(
        edges in pairs(),
        removals in prop::collection::vec(any::<bool>(), 16),
    ) {
        let edges: BTreeSet<(i64, i64)> = edges.into_iter().filter(|(a, b)| a != b).collect();
        let mut net = Network::new();
        let key = InputKey::feature("edge");
        let input = net.add_input(key.clone(), 2, true);
        let closure = net.add_transitive_closure(input);

        for &(a, b) in &edges {
            net.update_input(&key, Direction::Insert, tuple!(a, b));
        }
        let reached: HashSet<Tuple> = net.pull(closure).into_iter().collect();
        prop_assert_eq!(reached, recompute_closure(&edges));

        let mut remaining = edges.clone();
        for (&(a, b), &remove) in edges.iter().zip(&removals) {
            if remove {
                remaining.remove(&(a, b));
                net.update_input(&key, Direction::Revoke, tuple!(a, b));
            }
        }
        let reached: HashSet<Tuple> = net.pull(closure).into_iter().collect();
        prop_assert_eq!(reached, recompute_closure(&remaining));
    }
}
