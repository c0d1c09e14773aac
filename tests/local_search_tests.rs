//! Local-search backend through the engine: plans per adornment, calls to
//! other queries, counting, expressions and recursion rejection.

use patternflow::{
    evaluator, Backend, CollectingErrorListener, Constraint, EngineError, EvaluationError,
    FeatureDecl, InMemoryModel, IntegrityIssue, Metamodel, PBody, PQuery, PartialMatch, PlanError,
    QueryEngine, Tuple, Value,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

fn metamodel() -> Metamodel {
    Metamodel::new()
        .with_class("Node", &[])
        .with_feature(FeatureDecl::new("next").source("Node"))
        .with_feature(FeatureDecl::new("weight").source("Node"))
}

/// Chain n0 -> n1 -> n2 -> n3, every node weighted by its index
fn chain_engine() -> (QueryEngine<InMemoryModel>, Vec<Value>) {
    let mut model = InMemoryModel::new(metamodel());
    let nodes: Vec<Value> = (0..4)
        .map(|_| Value::Object(model.create_object("Node")))
        .collect();
    for pair in nodes.windows(2) {
        model.add_value(&pair[0], "next", pair[1].clone());
    }
    for (i, node) in nodes.iter().enumerate() {
        model.add_value(node, "weight", Value::Int64(i as i64));
    }
    (QueryEngine::new(model), nodes)
}

fn ls(query: PQuery) -> PQuery {
    query.with_backend(Backend::LocalSearch)
}

#[test]
fn test_two_hop_with_and_without_binding() {
    let (mut engine, nodes) = chain_engine();
    engine
        .register_query(ls(PQuery::new("two_hop", &["a", "c"]).with_body(
            PBody::new(&["a", "c"])
                .with(Constraint::feature("next", "a", "b"))
                .with(Constraint::feature("next", "b", "c")),
        )))
        .unwrap();

    let matcher = engine.matcher("two_hop").unwrap();
    assert_eq!(matcher.count_matches(&PartialMatch::new()).unwrap(), 2);

    let from_n1 = matcher
        .all_matches(&PartialMatch::new().bind("a", nodes[1].clone()))
        .unwrap();
    assert_eq!(from_n1.len(), 1);
    assert_eq!(from_n1[0].get("c"), Some(&nodes[3]));

    let into_n2 = matcher
        .all_values_of("a", &PartialMatch::new().bind("c", nodes[2].clone()))
        .unwrap();
    assert_eq!(into_n2, BTreeSet::from([nodes[0].clone()]));

    // one plan per adornment used so far
    assert_eq!(engine.statistics().search_plans, 3);
}

#[test]
fn test_negative_call_to_rete_callee() {
    let (mut engine, nodes) = chain_engine();
    engine
        .register_query(PQuery::new("has_next", &["x"]).with_body(
            PBody::new(&["x"]).with(Constraint::feature("next", "x", "y")),
        ))
        .unwrap();
    engine
        .register_query(ls(PQuery::new("last", &["x"]).with_body(
            PBody::new(&["x"])
                .with(Constraint::instance_of("Node", "x"))
                .with(Constraint::neg_call("has_next", &["x"])),
        )))
        .unwrap();

    let matches = engine
        .matcher("last")
        .unwrap()
        .all_matches(&PartialMatch::new())
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].get_at(0), Some(&nodes[3]));
    // the callee was pulled into the network
    assert_eq!(engine.statistics().rete_queries, 1);
}

#[test]
fn test_count_of_successors() {
    let (mut engine, nodes) = chain_engine();
    engine
        .register_query(ls(PQuery::new("succ", &["x", "y"]).with_body(
            PBody::new(&["x", "y"]).with(Constraint::feature("next", "x", "y")),
        )))
        .unwrap();
    engine
        .register_query(ls(PQuery::new("out_degree", &["x", "n"]).with_body(
            PBody::new(&["x", "n"])
                .with(Constraint::instance_of("Node", "x"))
                .with(Constraint::count("succ", &["x", "y"], "n")),
        )))
        .unwrap();

    let matcher = engine.matcher("out_degree").unwrap();
    let last = matcher
        .one_match(&PartialMatch::new().bind("x", nodes[3].clone()))
        .unwrap()
        .unwrap();
    assert_eq!(last.get("n"), Some(&Value::Int64(0)));
    let degrees = matcher.all_values_of("n", &PartialMatch::new()).unwrap();
    assert_eq!(degrees, BTreeSet::from([Value::Int64(0), Value::Int64(1)]));
}

#[test]
fn test_expression_failure_is_reported_and_skipped() {
    let (mut engine, _) = chain_engine();
    let errors = Arc::new(CollectingErrorListener::new());
    engine.add_error_listener(errors.clone());
    engine.register_evaluator(evaluator("inverse", |inputs: &[Value]| {
        match inputs[0].as_i64() {
            Some(0) => Err(EvaluationError::new("division by zero")),
            Some(v) => Ok(Value::Float64(1.0 / v as f64)),
            None => Err(EvaluationError::new("not an integer")),
        }
    }));
    engine
        .register_query(ls(PQuery::new("inverse_weight", &["x", "w"]).with_body(
            PBody::new(&["x", "w"])
                .with(Constraint::feature("weight", "x", "v"))
                .with(Constraint::eval("inverse", &["v"], "w")),
        )))
        .unwrap();

    let count = engine
        .matcher("inverse_weight")
        .unwrap()
        .count_matches(&PartialMatch::new())
        .unwrap();
    assert_eq!(count, 3);
    assert!(errors
        .issues()
        .iter()
        .any(|i| matches!(i, IntegrityIssue::EvaluationFailed { .. })));
}

#[test]
fn test_closure_check_with_both_ends_bound() {
    let (mut engine, nodes) = chain_engine();
    engine
        .register_query(ls(PQuery::new("succ", &["x", "y"]).with_body(
            PBody::new(&["x", "y"]).with(Constraint::feature("next", "x", "y")),
        )))
        .unwrap();
    engine
        .register_query(ls(PQuery::new("reaches", &["x", "y"]).with_body(
            PBody::new(&["x", "y"])
                .with(Constraint::instance_of("Node", "x"))
                .with(Constraint::instance_of("Node", "y"))
                .with(Constraint::closure("succ", "x", "y")),
        )))
        .unwrap();

    let matcher = engine.matcher("reaches").unwrap();
    // 3 + 2 + 1 forward pairs along the chain
    assert_eq!(matcher.count_matches(&PartialMatch::new()).unwrap(), 6);
    assert!(!matcher
        .has_match(
            &PartialMatch::new()
                .bind("x", nodes[3].clone())
                .bind("y", nodes[0].clone())
        )
        .unwrap());
}

fn reaches_query(name: &str, backend: Backend) -> PQuery {
    PQuery::new(name, &["x", "y"])
        .with_body(
            PBody::new(&["x", "y"])
                .with(Constraint::instance_of("Node", "x"))
                .with(Constraint::instance_of("Node", "y"))
                .with(Constraint::closure("succ", "x", "y")),
        )
        .with_backend(backend)
}

#[test]
fn test_closure_on_cycle_agrees_across_backends() {
    // a -> b -> a, and c with an explicit self-loop
    let mut model = InMemoryModel::new(metamodel());
    let a = Value::Object(model.create_object("Node"));
    let b = Value::Object(model.create_object("Node"));
    let c = Value::Object(model.create_object("Node"));
    model.add_value(&a, "next", b.clone());
    model.add_value(&b, "next", a.clone());
    model.add_value(&c, "next", c.clone());
    let mut engine = QueryEngine::new(model);
    engine
        .register_query(PQuery::new("succ", &["x", "y"]).with_body(
            PBody::new(&["x", "y"]).with(Constraint::feature("next", "x", "y")),
        ))
        .unwrap();
    engine
        .register_query(reaches_query("reaches_rete", Backend::Rete))
        .unwrap();
    engine
        .register_query(reaches_query("reaches_ls", Backend::LocalSearch))
        .unwrap();

    let mut results = Vec::new();
    for name in ["reaches_rete", "reaches_ls"] {
        let matcher = engine.matcher(name).unwrap();
        let all: HashSet<Tuple> = matcher
            .all_matches(&PartialMatch::new())
            .unwrap()
            .iter()
            .map(|m| m.tuple().clone())
            .collect();
        let a_to_a = matcher
            .has_match(&PartialMatch::new().bind("x", a.clone()).bind("y", a.clone()))
            .unwrap();
        let c_to_c = matcher
            .has_match(&PartialMatch::new().bind("x", c.clone()).bind("y", c.clone()))
            .unwrap();
        results.push((all, a_to_a, c_to_c));
    }

    let expected: HashSet<Tuple> = [
        Tuple::new(vec![a.clone(), b.clone()]),
        Tuple::new(vec![b.clone(), a.clone()]),
        Tuple::new(vec![c.clone(), c.clone()]),
    ]
    .into_iter()
    .collect();
    assert_eq!(results[0], (expected, false, true));
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_recursive_query_rejected() {
    let (mut engine, _) = chain_engine();
    engine
        .register_query(ls(PQuery::new("reach", &["x", "y"])
            .with_body(PBody::new(&["x", "y"]).with(Constraint::feature("next", "x", "y")))
            .with_body(
                PBody::new(&["x", "y"])
                    .with(Constraint::feature("next", "x", "z"))
                    .with(Constraint::call("reach", &["z", "y"])),
            )))
        .unwrap();
    let err = engine.matcher("reach").unwrap_err();
    assert!(matches!(
        err,
        EngineError::Plan(PlanError::RecursiveLocalSearch(ref q)) if q == "reach"
    ));
}

#[test]
fn test_positional_binding_arity_checked() {
    let (mut engine, _) = chain_engine();
    engine
        .register_query(ls(PQuery::new("succ", &["x", "y"]).with_body(
            PBody::new(&["x", "y"]).with(Constraint::feature("next", "x", "y")),
        )))
        .unwrap();
    let err = engine
        .matcher("succ")
        .unwrap()
        .all_matches(&PartialMatch::from_positions(vec![None]))
        .unwrap_err();
    assert!(matches!(err, EngineError::BindingArity { expected: 2, actual: 1, .. }));
}
