//! End-to-end behaviour of the query engine on the Rete backend: match
//! maintenance, listeners, error channels and disposal.

use anyhow::anyhow;
use parking_lot::Mutex;
use patternflow::{
    match_listener, Backend, CollectingErrorListener, Constraint, DeferredUpdates, Direction,
    EngineConfig, EngineError, FatalError, FeatureDecl, FromMatch, InMemoryModel, IntegrityIssue,
    Match, MatchListener, Metamodel, PBody, PQuery, PartialMatch, PlanError, QueryEngine, Tuple,
    Value, ValueKind,
};
use std::collections::HashSet;
use std::sync::Arc;

type Log = Arc<Mutex<Vec<(Direction, Tuple)>>>;

/// Listener appending every event to a shared log
struct Recorder(Log);

impl MatchListener<InMemoryModel> for Recorder {
    fn on_appeared(
        &mut self,
        matched: &Match,
        _: &mut DeferredUpdates<InMemoryModel>,
    ) -> anyhow::Result<()> {
        self.0.lock().push((Direction::Insert, matched.tuple().clone()));
        Ok(())
    }

    fn on_disappeared(
        &mut self,
        matched: &Match,
        _: &mut DeferredUpdates<InMemoryModel>,
    ) -> anyhow::Result<()> {
        self.0.lock().push((Direction::Revoke, matched.tuple().clone()));
        Ok(())
    }
}

fn recorder() -> (Recorder, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    (Recorder(log.clone()), log)
}

fn metamodel() -> Metamodel {
    Metamodel::new()
        .with_class("TypeA", &[])
        .with_class("TypeB", &[])
        .with_class("Node", &[])
        .with_class("Seen", &[])
        .with_feature(FeatureDecl::new("edge"))
        .with_feature(FeatureDecl::new("next").source("Node"))
        .with_feature(FeatureDecl::new("tags").source("Node").non_unique())
}

fn p_query() -> PQuery {
    PQuery::new("p", &["x", "y"]).with_body(
        PBody::new(&["x", "y"])
            .with(Constraint::instance_of("TypeA", "x"))
            .with(Constraint::instance_of("TypeB", "y"))
            .with(Constraint::feature("edge", "x", "y")),
    )
}

fn engine() -> QueryEngine<InMemoryModel> {
    QueryEngine::new(InMemoryModel::new(metamodel()))
}

fn all(engine: &mut QueryEngine<InMemoryModel>, query: &str) -> HashSet<Tuple> {
    engine
        .matcher(query)
        .unwrap()
        .all_matches(&PartialMatch::new())
        .unwrap()
        .into_iter()
        .map(|m| m.tuple().clone())
        .collect()
}

#[test]
fn test_pattern_match_in_every_interleaving() {
    let a1 = Value::object(1);
    let b1 = Value::object(2);
    type Step = fn(&mut InMemoryModel, &Value, &Value);
    let steps: [Step; 3] = [
        |m, a, _| {
            m.add_instance("TypeA", a.clone());
        },
        |m, _, b| {
            m.add_instance("TypeB", b.clone());
        },
        |m, a, b| {
            m.add_value(a, "edge", b.clone());
        },
    ];
    let orders = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in orders {
        let mut engine = engine();
        engine.register_query(p_query()).unwrap();
        let (listener, log) = recorder();
        engine.subscribe("p", false, listener).unwrap();

        for &step in &order {
            engine.update(|m| steps[step](m, &a1, &b1)).unwrap();
        }
        let expected = Tuple::new(vec![a1.clone(), b1.clone()]);
        assert_eq!(*log.lock(), vec![(Direction::Insert, expected.clone())], "{order:?}");
        assert_eq!(all(&mut engine, "p"), HashSet::from([expected]));
    }
}

#[test]
fn test_removing_object_revokes_match() {
    let mut engine = engine();
    engine.register_query(p_query()).unwrap();
    let (listener, log) = recorder();
    engine.subscribe("p", false, listener).unwrap();

    let (a, b) = engine
        .update(|m| {
            let a = m.create_object("TypeA");
            let b = Value::Object(m.create_object("TypeB"));
            m.add_value(&Value::Object(a), "edge", b.clone());
            (a, b)
        })
        .unwrap();
    assert_eq!(log.lock().len(), 1);

    engine.update(|m| m.remove_object(a)).unwrap();
    assert!(all(&mut engine, "p").is_empty());
    assert_eq!(
        log.lock().last(),
        Some(&(Direction::Revoke, Tuple::new(vec![Value::Object(a), b])))
    );
}

#[test]
fn test_duplicate_feature_values_report_one_match() {
    let mut engine = engine();
    engine
        .register_query(PQuery::new("tagged", &["x", "t"]).with_body(
            PBody::new(&["x", "t"])
                .with(Constraint::instance_of("Node", "x"))
                .with(Constraint::feature("tags", "x", "t")),
        ))
        .unwrap();
    let (listener, log) = recorder();
    engine.subscribe("tagged", false, listener).unwrap();

    let node = engine
        .update(|m| {
            let n = Value::Object(m.create_object("Node"));
            m.add_value(&n, "tags", Value::string("red"));
            m.add_value(&n, "tags", Value::string("red"));
            n
        })
        .unwrap();
    assert_eq!(all(&mut engine, "tagged").len(), 1);
    assert_eq!(log.lock().len(), 1);

    engine
        .update(|m| m.remove_value(&node, "tags", &Value::string("red")))
        .unwrap();
    assert_eq!(all(&mut engine, "tagged").len(), 1);
    assert_eq!(log.lock().len(), 1);

    engine
        .update(|m| m.remove_value(&node, "tags", &Value::string("red")))
        .unwrap();
    assert!(all(&mut engine, "tagged").is_empty());
    assert_eq!(log.lock().last().map(|e| e.0), Some(Direction::Revoke));
}

#[test]
fn test_coalescing_cancels_transient_matches() {
    for coalesce in [true, false] {
        let config = EngineConfig {
            coalesce_listener_events: coalesce,
            ..EngineConfig::default()
        };
        let mut model = InMemoryModel::new(metamodel());
        let a = Value::Object(model.create_object("TypeA"));
        let b = Value::Object(model.create_object("TypeB"));
        let mut engine = QueryEngine::with_config(model, config);
        engine.register_query(p_query()).unwrap();
        let (listener, log) = recorder();
        engine.subscribe("p", false, listener).unwrap();

        engine
            .update(|m| {
                m.add_value(&a, "edge", b.clone());
                m.remove_value(&a, "edge", &b);
            })
            .unwrap();
        let expected = if coalesce { 0 } else { 2 };
        assert_eq!(log.lock().len(), expected);
    }
}

#[test]
fn test_fire_now_delivers_existing_matches() {
    let mut model = InMemoryModel::new(metamodel());
    let a = Value::Object(model.create_object("TypeA"));
    let b = Value::Object(model.create_object("TypeB"));
    model.add_value(&a, "edge", b.clone());
    let mut engine = QueryEngine::new(model);
    engine.register_query(p_query()).unwrap();

    let (listener, log) = recorder();
    engine.subscribe("p", true, listener).unwrap();
    assert_eq!(*log.lock(), vec![(Direction::Insert, Tuple::new(vec![a, b]))]);
}

#[test]
fn test_deferred_writes_run_after_delivery() {
    let mut engine = engine();
    engine
        .register_query(PQuery::new("nodes", &["x"]).with_body(
            PBody::new(&["x"]).with(Constraint::instance_of("Node", "x")),
        ))
        .unwrap();
    engine
        .register_query(PQuery::new("seen", &["x"]).with_body(
            PBody::new(&["x"]).with(Constraint::instance_of("Seen", "x")),
        ))
        .unwrap();
    engine
        .subscribe(
            "nodes",
            false,
            match_listener(
                |direction: Direction,
                 matched: &Match,
                 deferred: &mut DeferredUpdates<InMemoryModel>|
                 -> anyhow::Result<()> {
                    if direction == Direction::Insert {
                        let node = matched.tuple().values()[0].clone();
                        deferred.push(move |m: &mut InMemoryModel| {
                            m.add_instance("Seen", node);
                        });
                    }
                    Ok(())
                },
            ),
        )
        .unwrap();

    let node = engine.update(|m| m.create_object("Node")).unwrap();
    assert_eq!(
        all(&mut engine, "seen"),
        HashSet::from([Tuple::new(vec![Value::Object(node)])])
    );
}

#[test]
fn test_runaway_deferred_writes_are_cut_off() {
    let config = EngineConfig {
        max_deferred_rounds: 3,
        ..EngineConfig::default()
    };
    let mut engine = QueryEngine::with_config(InMemoryModel::new(metamodel()), config);
    let errors = Arc::new(CollectingErrorListener::new());
    engine.add_error_listener(errors.clone());
    engine
        .register_query(PQuery::new("nodes", &["x"]).with_body(
            PBody::new(&["x"]).with(Constraint::instance_of("Node", "x")),
        ))
        .unwrap();
    engine
        .subscribe(
            "nodes",
            false,
            match_listener(
                |_: Direction,
                 _: &Match,
                 deferred: &mut DeferredUpdates<InMemoryModel>|
                 -> anyhow::Result<()> {
                    deferred.push(|m: &mut InMemoryModel| {
                        m.create_object("Node");
                    });
                    Ok(())
                },
            ),
        )
        .unwrap();

    engine.update(|m| m.create_object("Node")).unwrap();
    assert_eq!(engine.model().object_count(), 4);
    assert_eq!(
        errors.fatal_errors(),
        vec![FatalError::DeferredOverflow {
            rounds: 3,
            dropped: 1
        }]
    );
}

#[test]
fn test_failing_listeners_are_isolated() {
    let mut engine = engine();
    let errors = Arc::new(CollectingErrorListener::new());
    engine.add_error_listener(errors.clone());
    engine.register_query(p_query()).unwrap();

    engine
        .subscribe(
            "p",
            false,
            match_listener(
                |_: Direction,
                 _: &Match,
                 _: &mut DeferredUpdates<InMemoryModel>|
                 -> anyhow::Result<()> { panic!("listener bug") },
            ),
        )
        .unwrap();
    engine
        .subscribe(
            "p",
            false,
            match_listener(
                |_: Direction,
                 _: &Match,
                 _: &mut DeferredUpdates<InMemoryModel>|
                 -> anyhow::Result<()> { Err(anyhow!("rejected")) },
            ),
        )
        .unwrap();
    let (listener, log) = recorder();
    engine.subscribe("p", false, listener).unwrap();

    engine
        .update(|m| {
            let a = Value::Object(m.create_object("TypeA"));
            let b = Value::Object(m.create_object("TypeB"));
            m.add_value(&a, "edge", b);
        })
        .unwrap();

    assert_eq!(log.lock().len(), 1);
    let fatal = errors.fatal_errors();
    assert_eq!(fatal.len(), 2);
    assert!(matches!(
        &fatal[0],
        FatalError::ListenerPanicked { message, .. } if message == "listener bug"
    ));
    assert!(matches!(&fatal[1], FatalError::ListenerFailed { .. }));
}

#[test]
fn test_recursive_reachability() {
    let mut model = InMemoryModel::new(metamodel());
    let nodes: Vec<Value> = (0..4)
        .map(|_| Value::Object(model.create_object("Node")))
        .collect();
    for pair in nodes.windows(2) {
        model.add_value(&pair[0], "next", pair[1].clone());
    }
    let mut engine = QueryEngine::new(model);
    engine
        .register_query(
            PQuery::new("reach", &["x", "y"])
                .with_body(PBody::new(&["x", "y"]).with(Constraint::feature("next", "x", "y")))
                .with_body(
                    PBody::new(&["x", "y"])
                        .with(Constraint::call("reach", &["x", "z"]))
                        .with(Constraint::feature("next", "z", "y")),
                ),
        )
        .unwrap();
    assert_eq!(all(&mut engine, "reach").len(), 6);

    engine
        .update(|m| m.remove_value(&nodes[1], "next", &nodes[2]))
        .unwrap();
    assert_eq!(
        all(&mut engine, "reach"),
        HashSet::from([
            Tuple::new(vec![nodes[0].clone(), nodes[1].clone()]),
            Tuple::new(vec![nodes[2].clone(), nodes[3].clone()]),
        ])
    );
}

#[test]
fn test_count_with_zero_default_follows_updates() {
    let mut model = InMemoryModel::new(metamodel());
    let a = Value::Object(model.create_object("Node"));
    let b = Value::Object(model.create_object("Node"));
    let mut engine = QueryEngine::new(model);
    engine
        .register_query(PQuery::new("succ", &["x", "y"]).with_body(
            PBody::new(&["x", "y"]).with(Constraint::feature("next", "x", "y")),
        ))
        .unwrap();
    engine
        .register_query(PQuery::new("out_degree", &["x", "n"]).with_body(
            PBody::new(&["x", "n"])
                .with(Constraint::instance_of("Node", "x"))
                .with(Constraint::count("succ", &["x", "y"], "n")),
        ))
        .unwrap();
    assert_eq!(
        all(&mut engine, "out_degree"),
        HashSet::from([
            Tuple::new(vec![a.clone(), Value::Int64(0)]),
            Tuple::new(vec![b.clone(), Value::Int64(0)]),
        ])
    );

    let (listener, log) = recorder();
    engine.subscribe("out_degree", false, listener).unwrap();
    engine.update(|m| m.add_value(&a, "next", b.clone())).unwrap();
    let events: HashSet<(Direction, Tuple)> = log.lock().iter().cloned().collect();
    assert_eq!(
        events,
        HashSet::from([
            (Direction::Revoke, Tuple::new(vec![a.clone(), Value::Int64(0)])),
            (Direction::Insert, Tuple::new(vec![a, Value::Int64(1)])),
        ])
    );
}

#[test]
fn test_declared_parameter_kind_filters_badly_typed_matches() {
    let mut engine = engine();
    let errors = Arc::new(CollectingErrorListener::new());
    engine.add_error_listener(errors.clone());
    engine
        .register_query(
            PQuery::new("labels", &["x", "l"])
                .typed("l", ValueKind::String)
                .with_body(PBody::new(&["x", "l"]).with(Constraint::feature("edge", "x", "l"))),
        )
        .unwrap();
    engine
        .update(|m| {
            let n = Value::Object(m.create_object("Node"));
            m.add_value(&n, "edge", Value::string("ok"));
            m.add_value(&n, "edge", Value::Int64(3));
        })
        .unwrap();

    let matches = engine
        .matcher("labels")
        .unwrap()
        .all_matches(&PartialMatch::new())
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get("l"), Some(&Value::string("ok")));
    assert!(errors
        .issues()
        .iter()
        .any(|i| matches!(i, IntegrityIssue::BadlyTypedMatch { .. })));
}

#[derive(Debug, PartialEq)]
struct Edge {
    from: Value,
    to: Value,
}

impl FromMatch for Edge {
    fn from_match(matched: &Match) -> anyhow::Result<Self> {
        let field = |name: &str| {
            matched
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("missing {name}"))
        };
        Ok(Edge {
            from: field("x")?,
            to: field("y")?,
        })
    }
}

#[test]
fn test_typed_matches() {
    let mut engine = engine();
    engine.register_query(p_query()).unwrap();
    let (a, b) = engine
        .update(|m| {
            let a = Value::Object(m.create_object("TypeA"));
            let b = Value::Object(m.create_object("TypeB"));
            m.add_value(&a, "edge", b.clone());
            (a, b)
        })
        .unwrap();
    let edges: Vec<Edge> = engine
        .matcher("p")
        .unwrap()
        .typed_matches(&PartialMatch::new())
        .unwrap();
    assert_eq!(edges, vec![Edge { from: a, to: b }]);
}

#[test]
fn test_local_search_queries_cannot_be_observed() {
    let mut engine = engine();
    engine
        .register_query(p_query().with_backend(Backend::LocalSearch))
        .unwrap();
    let (listener, _) = recorder();
    let err = engine.subscribe("p", false, listener).unwrap_err();
    assert!(matches!(err, EngineError::Plan(ref e) if e.is_unsupported()));
}

#[test]
fn test_in_use_query_cannot_be_replaced() {
    let mut engine = engine();
    engine.register_query(p_query()).unwrap();
    engine.prepare("p").unwrap();
    assert!(matches!(
        engine.register_query(p_query()),
        Err(EngineError::Plan(PlanError::MalformedPlan(_)))
    ));
}

#[test]
fn test_dispose_requires_detached_listeners() {
    let mut engine = engine();
    engine.register_query(p_query()).unwrap();
    let (listener, _) = recorder();
    let id = engine.subscribe("p", false, listener).unwrap();

    assert!(matches!(
        engine.dispose(),
        Err(EngineError::ListenersAttached(1))
    ));
    assert!(engine.remove_listener(id));
    assert!(!engine.remove_listener(id));
    engine.dispose().unwrap();
    assert!(engine.is_disposed());

    assert!(matches!(engine.update(|_| ()), Err(EngineError::Disposed)));
    assert!(matches!(engine.matcher("p"), Err(EngineError::Disposed)));
    assert!(matches!(engine.dispose(), Err(EngineError::Disposed)));
}

#[test]
fn test_statistics_reflect_prepared_queries() {
    let mut engine = engine();
    engine.register_query(p_query()).unwrap();
    assert_eq!(engine.statistics().rete_queries, 0);
    engine.prepare("p").unwrap();
    let stats = engine.statistics();
    assert_eq!(stats.registered_queries, 1);
    assert_eq!(stats.rete_queries, 1);
    assert_eq!(stats.network.nodes_by_kind.get("production"), Some(&1));
    assert_eq!(stats.engine_id, engine.id());
}
