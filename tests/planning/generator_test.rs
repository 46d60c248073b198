//! Search and generator behavior through the public planner API.

use std::rc::Rc;

use strata::config::PlannerSettings;
use strata::discovery::{validate_stack, Planner, ValidationResult};
use strata::model::{AggregateOp, Column, DataType, Datasource, Environment, Literal};
use strata::Outcome;

fn items() -> Environment {
    let mut env = Environment::new();
    env.add_key("id", DataType::Integer);
    env.add_property("cat", DataType::String, &["id"]);
    env.add_property("value", DataType::Integer, &["id"]);
    env.add_metric("total", DataType::Integer, AggregateOp::Sum, "value", &["cat"])
        .unwrap();
    env.add_datasource(Datasource::new(
        "items",
        vec![
            Column::new("id", "id"),
            Column::new("cat", "cat"),
            Column::new("value", "value"),
        ],
        ["id"],
    ))
    .unwrap();
    env
}

fn planner(env: Environment) -> Planner {
    Planner::new(Rc::new(env), PlannerSettings::default()).unwrap()
}

#[test]
fn test_search_finds_root_concepts() {
    let mut planner = planner(items());
    let env = planner.environment();
    let targets = env.concepts_for(&["local.id", "local.value"]).unwrap();
    let Outcome::Found(id) = planner.search_concepts(&targets, 0, false, None) else {
        panic!("expected a plan");
    };
    let outputs = planner.arena().core(id).usable_outputs();
    assert!(outputs.contains(&"local.id".to_string()));
    assert!(outputs.contains(&"local.value".to_string()));

    let (result, coverage) =
        validate_stack(planner.arena(), &[id], &targets, &targets, None, false).unwrap();
    assert_eq!(result, ValidationResult::Complete);
    assert!(coverage.missing.is_empty());
}

#[test]
fn test_repeated_search_returns_a_fresh_copy() {
    let mut planner = planner(items());
    let env = planner.environment();
    let targets = env.concepts_for(&["local.cat", "local.total"]).unwrap();
    let Outcome::Found(first) = planner.search_concepts(&targets, 0, false, None) else {
        panic!("expected a plan");
    };
    let Outcome::Found(second) = planner.search_concepts(&targets, 0, false, None) else {
        panic!("expected a cached plan");
    };
    assert_ne!(first, second);
    assert_eq!(
        planner.arena().node(first).kind_name(),
        planner.arena().node(second).kind_name()
    );
    assert_eq!(
        planner.arena().core(first).output_concepts,
        planner.arena().core(second).output_concepts
    );
}

#[test]
fn test_unbound_concept_is_not_found() {
    let mut env = items();
    env.add_key("orphan", DataType::Integer);
    let mut planner = planner(env);
    let env = planner.environment();
    let targets = env.concepts_for(&["local.orphan"]).unwrap();
    assert!(matches!(
        planner.search_concepts(&targets, 0, false, None),
        Outcome::NotFound
    ));
}

#[test]
fn test_constants_need_no_datasource() {
    let mut env = items();
    env.add_constant("answer", DataType::Integer, Literal::Integer(42));
    let mut planner = planner(env);
    let env = planner.environment();
    let targets = env.concepts_for(&["local.answer"]).unwrap();
    let Outcome::Found(id) = planner.search_concepts(&targets, 0, false, None) else {
        panic!("expected a constant node");
    };
    assert!(planner.arena().node(id).is_constant());
}

#[test]
fn test_depth_limit_is_enforced() {
    let settings = PlannerSettings {
        max_depth: 0,
        ..PlannerSettings::default()
    };
    let mut planner = Planner::new(Rc::new(items()), settings).unwrap();
    let env = planner.environment();
    let targets = env.concepts_for(&["local.cat", "local.total"]).unwrap();
    assert!(matches!(
        planner.search_concepts(&targets, 1, false, None),
        Outcome::Invalid(strata::PlanningError::DepthExceeded { limit: 0 })
    ));
}

#[test]
fn test_resolution_is_memoized_per_version() {
    let mut planner = planner(items());
    let env = planner.environment();
    let targets = env.concepts_for(&["local.id", "local.cat"]).unwrap();
    let Outcome::Found(id) = planner.search_concepts(&targets, 0, false, None) else {
        panic!("expected a plan");
    };
    let first = planner.arena().resolve(id).unwrap();
    let second = planner.arena().resolve(id).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
    let rebuilt = planner.arena().rebuild_cache(id).unwrap();
    assert!(!Rc::ptr_eq(&first, &rebuilt));
    assert_eq!(first.identifier, rebuilt.identifier);
}
