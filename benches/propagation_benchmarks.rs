//! Propagation benchmark suite.
//!
//! Groups:
//! 1. Join maintenance: bulk insert into a two-input join
//! 2. Transitive closure: chain construction and single-edge removal
//! 3. Engine update: model writes flowing through to a subscribed query
//! 4. Local search: bound and unbound two-hop navigation

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use patternflow::rete::{Direction, Network};
use patternflow::{
    tuple, Backend, Constraint, DeferredUpdates, FeatureDecl, InMemoryModel, InputKey, Mask,
    Match, MatchListener, Metamodel, PBody, PQuery, PartialMatch, QueryEngine, Value,
};
use std::hint::black_box;

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn metamodel() -> Metamodel {
    Metamodel::new()
        .with_class("Node", &[])
        .with_feature(FeatureDecl::new("next").source("Node"))
}

/// Chain of `len` nodes linked by `next`
fn chain_model(len: usize) -> (InMemoryModel, Vec<Value>) {
    let mut model = InMemoryModel::new(metamodel());
    let nodes: Vec<Value> = (0..len)
        .map(|_| Value::Object(model.create_object("Node")))
        .collect();
    for pair in nodes.windows(2) {
        model.add_value(&pair[0], "next", pair[1].clone());
    }
    (model, nodes)
}

fn two_hop(backend: Backend) -> PQuery {
    PQuery::new("two_hop", &["a", "c"])
        .with_body(
            PBody::new(&["a", "c"])
                .with(Constraint::feature("next", "a", "b"))
                .with(Constraint::feature("next", "b", "c")),
        )
        .with_backend(backend)
}

struct Counter(usize);

impl MatchListener<InMemoryModel> for Counter {
    fn on_appeared(
        &mut self,
        _: &Match,
        _: &mut DeferredUpdates<InMemoryModel>,
    ) -> anyhow::Result<()> {
        self.0 += 1;
        Ok(())
    }

    fn on_disappeared(
        &mut self,
        _: &Match,
        _: &mut DeferredUpdates<InMemoryModel>,
    ) -> anyhow::Result<()> {
        self.0 += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 1. Join maintenance
// ---------------------------------------------------------------------------

fn bench_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("join_insert");
    for size in [100i64, 1_000, 5_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut net = Network::new();
                let left = InputKey::feature("left");
                let right = InputKey::feature("right");
                let l = net.add_input(left.clone(), 2, true);
                let r = net.add_input(right.clone(), 2, true);
                let join = net.add_join(l, Mask::new(vec![1], 2), r, Mask::new(vec![0], 2));
                for i in 0..size {
                    net.update_input(&left, Direction::Insert, tuple!(i, i % 97));
                    net.update_input(&right, Direction::Insert, tuple!(i % 97, i));
                }
                black_box(net.pull(join).len())
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 2. Transitive closure
// ---------------------------------------------------------------------------

fn bench_closure(c: &mut Criterion) {
    let mut group = c.benchmark_group("transitive_closure");
    group.sample_size(20);
    for len in [50i64, 200] {
        group.bench_with_input(BenchmarkId::new("build_chain", len), &len, |b, &len| {
            b.iter(|| {
                let mut net = Network::new();
                let key = InputKey::feature("edge");
                let input = net.add_input(key.clone(), 2, true);
                let closure = net.add_transitive_closure(input);
                for i in 0..len {
                    net.update_input(&key, Direction::Insert, tuple!(i, i + 1));
                }
                black_box(net.pull(closure).len())
            });
        });

        group.bench_with_input(BenchmarkId::new("cut_middle", len), &len, |b, &len| {
            let key = InputKey::feature("edge");
            let mut net = Network::new();
            let input = net.add_input(key.clone(), 2, true);
            net.add_transitive_closure(input);
            for i in 0..len {
                net.update_input(&key, Direction::Insert, tuple!(i, i + 1));
            }
            let mid = len / 2;
            b.iter(|| {
                net.update_input(&key, Direction::Revoke, tuple!(mid, mid + 1));
                net.update_input(&key, Direction::Insert, tuple!(mid, mid + 1));
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// 3. Engine update
// ---------------------------------------------------------------------------

fn bench_engine_update(c: &mut Criterion) {
    let (model, nodes) = chain_model(1_000);
    let mut engine = QueryEngine::new(model);
    engine.register_query(two_hop(Backend::Rete)).unwrap();
    engine.subscribe("two_hop", false, Counter(0)).unwrap();

    let (a, b) = (nodes[500].clone(), nodes[501].clone());
    c.bench_function("engine_update_toggle_edge", |bench| {
        bench.iter(|| {
            engine
                .update(|m| {
                    m.remove_value(&a, "next", &b);
                })
                .unwrap();
            engine
                .update(|m| {
                    m.add_value(&a, "next", b.clone());
                })
                .unwrap();
        });
    });
}

// ---------------------------------------------------------------------------
// 4. Local search
// ---------------------------------------------------------------------------

fn bench_local_search(c: &mut Criterion) {
    let (model, nodes) = chain_model(1_000);
    let mut engine = QueryEngine::new(model);
    engine.register_query(two_hop(Backend::LocalSearch)).unwrap();

    let mut group = c.benchmark_group("local_search_two_hop");
    group.bench_function("bound_source", |b| {
        let matcher = engine.matcher("two_hop").unwrap();
        let binding = PartialMatch::new().bind("a", nodes[10].clone());
        b.iter(|| black_box(matcher.count_matches(&binding).unwrap()));
    });
    group.bench_function("unbound", |b| {
        let matcher = engine.matcher("two_hop").unwrap();
        let binding = PartialMatch::new();
        b.iter(|| black_box(matcher.count_matches(&binding).unwrap()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_join,
    bench_closure,
    bench_engine_update,
    bench_local_search
);
criterion_main!(benches);
