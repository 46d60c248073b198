//! End-to-end planning scenarios over small declared environments.

use std::collections::BTreeSet;

use strata::config::PlannerSettings;
use strata::discovery::{plan_query, PlannedQuery};
use strata::model::{
    AggregateOp, Column, ComparisonOp, Condition, DataType, Datasource, Environment, Expr,
    FilterItem, Lineage,
};
use strata::plan::{PlanId, PlanNode};
use strata::PlanningError;

/// items(id, cat, value) with `total = sum(value) by cat`.
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

/// customers(customer_id, name) and orders(order_id, customer_id, order_total).
fn shop() -> Environment {
    let mut env = Environment::new();
    env.add_key("customer_id", DataType::Integer);
    env.add_key("order_id", DataType::Integer);
    env.add_property("name", DataType::String, &["customer_id"]);
    env.add_property("order_total", DataType::Float, &["order_id"]);
    env.add_metric(
        "revenue",
        DataType::Float,
        AggregateOp::Sum,
        "order_total",
        &["customer_id"],
    )
    .unwrap();
    env.add_derived(
        "high_value",
        DataType::Integer,
        Lineage::Filter(FilterItem {
            content: "local.order_id".to_string(),
            condition: big_orders(),
        }),
    )
    .unwrap();
    env.add_datasource(Datasource::new(
        "customers",
        vec![
            Column::new("customer_id", "customer_id"),
            Column::new("name", "name"),
        ],
        ["customer_id"],
    ))
    .unwrap();
    env.add_datasource(Datasource::new(
        "orders",
        vec![
            Column::new("order_id", "order_id"),
            Column::new("customer_id", "customer_id"),
            Column::new("order_total", "order_total"),
        ],
        ["order_id"],
    ))
    .unwrap();
    env
}

fn big_orders() -> Condition {
    Condition::compare(
        Expr::concept("local.order_total"),
        ComparisonOp::Gt,
        Expr::int(100),
    )
}

fn walk(planned: &PlannedQuery) -> Vec<PlanId> {
    let mut out = Vec::new();
    let mut stack = vec![planned.root];
    while let Some(id) = stack.pop() {
        out.push(id);
        stack.extend(planned.arena.node(id).parents().iter().copied());
    }
    out
}

fn kinds(planned: &PlannedQuery) -> BTreeSet<&'static str> {
    walk(planned)
        .into_iter()
        .map(|id| planned.arena.node(id).kind_name())
        .collect()
}

fn datasources(planned: &PlannedQuery) -> BTreeSet<String> {
    walk(planned)
        .into_iter()
        .filter_map(|id| match planned.arena.node(id) {
            PlanNode::Select(select) => Some(select.datasource.identifier.clone()),
            _ => None,
        })
        .collect()
}

fn root_outputs(planned: &PlannedQuery) -> BTreeSet<String> {
    planned
        .arena
        .core(planned.root)
        .usable_outputs()
        .into_iter()
        .collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_keys_and_properties_come_from_one_select() {
    let env = items();
    let planned = plan_query(&env, &["local.id", "local.cat"], None, &PlannerSettings::default())
        .unwrap();
    let root = planned.arena.node(planned.root);
    assert_eq!(root.kind_name(), "Select");
    assert_eq!(root_outputs(&planned), set(&["local.cat", "local.id"]));
    assert_eq!(datasources(&planned), set(&["items"]));
}

#[test]
fn test_aggregate_is_grouped_over_its_inputs() {
    let env = items();
    let planned = plan_query(
        &env,
        &["local.cat", "local.total"],
        None,
        &PlannerSettings::default(),
    )
    .unwrap();
    assert!(kinds(&planned).contains("Group"));
    assert!(kinds(&planned).contains("Select"));
    assert_eq!(datasources(&planned), set(&["items"]));
    assert_eq!(root_outputs(&planned), set(&["local.cat", "local.total"]));

    let resolved = planned.arena.resolve(planned.root).unwrap();
    assert!(resolved.grain.contains("local.cat"));
    assert!(!resolved.grain.contains("local.id"));
}

#[test]
fn test_aggregate_is_enriched_across_datasources() {
    let env = shop();
    let planned = plan_query(
        &env,
        &["local.name", "local.revenue"],
        None,
        &PlannerSettings::default(),
    )
    .unwrap();
    let kinds = kinds(&planned);
    assert!(kinds.contains("Merge"), "plan was:\n{}", planned.explain());
    assert!(kinds.contains("Group"), "plan was:\n{}", planned.explain());
    assert_eq!(datasources(&planned), set(&["customers", "orders"]));
    assert_eq!(root_outputs(&planned), set(&["local.name", "local.revenue"]));
}

#[test]
fn test_ungrouped_aggregate_injects_bridge_key() {
    let mut env = shop();
    env.add_metric("spend", DataType::Float, AggregateOp::Sum, "order_total", &[])
        .unwrap();
    let planned = plan_query(
        &env,
        &["local.name", "local.spend"],
        None,
        &PlannerSettings::default(),
    )
    .unwrap();
    let kinds = kinds(&planned);
    assert!(kinds.contains("Merge"), "plan was:\n{}", planned.explain());
    assert!(kinds.contains("Group"), "plan was:\n{}", planned.explain());
    assert_eq!(datasources(&planned), set(&["customers", "orders"]));
    assert_eq!(root_outputs(&planned), set(&["local.name", "local.spend"]));

    // customer_id is never requested but must link the two sources
    let bridged = walk(&planned).into_iter().any(|id| {
        id != planned.root
            && planned
                .arena
                .core(id)
                .output_concepts
                .contains(&"local.customer_id".to_string())
    });
    assert!(bridged, "plan was:\n{}", planned.explain());

    let resolved = planned.arena.resolve(planned.root).unwrap();
    assert!(!resolved.grain.contains("local.order_id"));
}

#[test]
fn test_scalar_filter_becomes_a_condition() {
    let env = shop();
    let planned =
        plan_query(&env, &["local.high_value"], None, &PlannerSettings::default()).unwrap();
    let ids = walk(&planned);
    assert!(!kinds(&planned).contains("Filter"), "plan was:\n{}", planned.explain());
    assert!(ids
        .iter()
        .any(|id| planned.arena.core(*id).conditions.as_ref() == Some(&big_orders())));
    assert!(root_outputs(&planned).contains("local.high_value"));
    assert_eq!(datasources(&planned), set(&["orders"]));
}

#[test]
fn test_filter_matching_query_condition_is_folded() {
    let env = shop();
    let condition = big_orders();
    let planned = plan_query(
        &env,
        &["local.high_value"],
        Some(&condition),
        &PlannerSettings::default(),
    )
    .unwrap();
    assert!(!kinds(&planned).contains("Filter"), "plan was:\n{}", planned.explain());
    assert!(root_outputs(&planned).contains("local.high_value"));
    assert_eq!(datasources(&planned), set(&["orders"]));
}

#[test]
fn test_filter_and_count_under_matching_condition_share_one_select() {
    let mut env = shop();
    env.add_metric("order_count", DataType::Integer, AggregateOp::Count, "order_id", &[])
        .unwrap();
    let condition = big_orders();
    let planned = plan_query(
        &env,
        &["local.high_value", "local.order_count"],
        Some(&condition),
        &PlannerSettings::default(),
    )
    .unwrap();
    let kinds = kinds(&planned);
    assert!(!kinds.contains("Filter"), "plan was:\n{}", planned.explain());
    assert!(!kinds.contains("Merge"), "plan was:\n{}", planned.explain());
    assert!(kinds.contains("Group"), "plan was:\n{}", planned.explain());
    assert_eq!(datasources(&planned), set(&["orders"]));
    assert_eq!(
        root_outputs(&planned),
        set(&["local.high_value", "local.order_count"])
    );
    assert!(walk(&planned).iter().any(|id| {
        let core = planned.arena.core(*id);
        core.conditions.as_ref() == Some(&condition)
            || core.preexisting_conditions.as_ref() == Some(&condition)
    }));
}

#[test]
fn test_query_condition_inputs_are_hidden() {
    let env = shop();
    let condition = big_orders();
    let planned = plan_query(
        &env,
        &["local.order_id"],
        Some(&condition),
        &PlannerSettings::default(),
    )
    .unwrap();
    assert_eq!(root_outputs(&planned), set(&["local.order_id"]));
    let ids = walk(&planned);
    assert!(ids.iter().any(|id| {
        let core = planned.arena.core(*id);
        core.conditions.as_ref() == Some(&condition)
            || core.preexisting_conditions.as_ref() == Some(&condition)
    }));
}

#[test]
fn test_parallel_link_tables_are_ambiguous() {
    let mut env = Environment::new();
    for key in ["l", "r", "p1", "p2", "q1", "q2"] {
        env.add_key(key, DataType::Integer);
    }
    env.add_property("x", DataType::String, &["l"]);
    env.add_property("y", DataType::String, &["r"]);
    env.add_datasource(Datasource::new(
        "left",
        vec![
            Column::new("l", "l"),
            Column::new("x", "x"),
            Column::new("p1", "p1"),
            Column::new("p2", "p2"),
        ],
        ["l"],
    ))
    .unwrap();
    env.add_datasource(Datasource::new(
        "right",
        vec![
            Column::new("r", "r"),
            Column::new("y", "y"),
            Column::new("q1", "q1"),
            Column::new("q2", "q2"),
        ],
        ["r"],
    ))
    .unwrap();
    for (name, p, q) in [("link_one", "p1", "q1"), ("link_two", "p2", "q2")] {
        env.add_datasource(Datasource::new(
            name,
            vec![Column::new(p, p), Column::new(q, q)],
            [p, q],
        ))
        .unwrap();
    }

    let err = plan_query(&env, &["local.x", "local.y"], None, &PlannerSettings::default())
        .unwrap_err();
    assert!(
        matches!(err, PlanningError::Ambiguous { .. }),
        "expected ambiguity, got {err:?}"
    );
}

#[test]
fn test_unbound_concept_is_unresolvable() {
    let mut env = items();
    env.add_key("orphan", DataType::Integer);
    let err = plan_query(&env, &["local.orphan"], None, &PlannerSettings::default()).unwrap_err();
    assert_eq!(
        err,
        PlanningError::Unresolvable {
            concepts: vec!["local.orphan".to_string()]
        }
    );
}

#[test]
fn test_undefined_concept_is_rejected() {
    let env = items();
    let err = plan_query(&env, &["local.missing"], None, &PlannerSettings::default()).unwrap_err();
    assert_eq!(err, PlanningError::UndefinedConcept("local.missing".to_string()));
}
