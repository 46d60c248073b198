//! Planning, lowering and optimizing together.

use std::collections::BTreeSet;

use strata::config::{OptimizerConfig, PlannerSettings};
use strata::discovery::plan_query;
use strata::model::{
    AggregateOp, Column, ComparisonOp, Condition, DataType, Datasource, Environment, Expr,
};
use strata::optimizer::{lower_plan, optimize_ctes, CtePlan};

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

fn plan(env: &Environment, select: &[&str], condition: Option<&Condition>) -> CtePlan {
    let planned = plan_query(env, select, condition, &PlannerSettings::default()).unwrap();
    lower_plan(&planned.arena, planned.root).unwrap()
}

fn assert_parents_first(plan: &CtePlan) {
    let mut seen = BTreeSet::new();
    for cte in &plan.ctes {
        for parent in &cte.parent_ctes {
            assert!(seen.contains(parent), "{} read before {} was defined", parent, cte.name);
        }
        assert!(seen.insert(cte.name.clone()), "duplicate cte {}", cte.name);
    }
    assert_eq!(plan.ctes.last().map(|c| c.name.as_str()), Some(plan.root.as_str()));
}

#[test]
fn test_optimized_aggregate_keeps_outputs() {
    let env = items();
    let lowered = plan(&env, &["local.cat", "local.total"], None);
    let optimized = optimize_ctes(lowered.clone(), &env, &OptimizerConfig::default()).unwrap();

    assert_parents_first(&optimized);
    assert!(optimized.ctes.len() <= lowered.ctes.len());
    let root = optimized.root_cte().unwrap();
    let outputs: BTreeSet<String> = root.usable_outputs().into_iter().collect();
    assert_eq!(
        outputs,
        BTreeSet::from(["local.cat".to_string(), "local.total".to_string()])
    );
    assert!(optimized
        .ctes
        .iter()
        .any(|c| c.datasources.iter().any(|d| d.identifier == "items")));
}

#[test]
fn test_row_condition_is_applied_before_grouping() {
    let env = items();
    let condition = Condition::compare(Expr::concept("local.value"), ComparisonOp::Gt, Expr::int(10));
    let lowered = plan(&env, &["local.cat", "local.total"], Some(&condition));
    let optimized = optimize_ctes(lowered, &env, &OptimizerConfig::default()).unwrap();

    assert_parents_first(&optimized);
    let root = optimized.root_cte().unwrap();
    let outputs: BTreeSet<String> = root.usable_outputs().into_iter().collect();
    assert_eq!(
        outputs,
        BTreeSet::from(["local.cat".to_string(), "local.total".to_string()])
    );

    let filtered: Vec<_> = optimized
        .ctes
        .iter()
        .filter(|c| c.condition.as_ref() == Some(&condition))
        .collect();
    assert!(!filtered.is_empty(), "condition was dropped: {:?}", optimized.names());
    for cte in filtered {
        // the predicate reads row-level values, never the aggregate
        assert!(cte.input_concepts.contains(&"local.value".to_string()));
        assert!(!cte.input_concepts.contains(&"local.total".to_string()));
    }
}

#[test]
fn test_disabled_rules_keep_the_lowered_plan() {
    let env = items();
    let lowered = plan(&env, &["local.cat", "local.total"], None);
    let config = OptimizerConfig {
        predicate_pushdown: false,
        predicate_pushdown_remove: false,
        datasource_inlining: false,
        constant_inlining: false,
        merge_aggregate: false,
        direct_return: false,
        ..OptimizerConfig::default()
    };
    let optimized = optimize_ctes(lowered.clone(), &env, &config).unwrap();
    let before: BTreeSet<&str> = lowered.ctes.iter().map(|c| c.name.as_str()).collect();
    let after: BTreeSet<&str> = optimized.ctes.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(before, after);
    assert_eq!(lowered.root, optimized.root);
}

#[test]
fn test_optimizing_twice_is_stable() {
    let env = items();
    let lowered = plan(&env, &["local.cat", "local.total"], None);
    let once = optimize_ctes(lowered, &env, &OptimizerConfig::default()).unwrap();
    let twice = optimize_ctes(once.clone(), &env, &OptimizerConfig::default()).unwrap();
    let first: BTreeSet<String> = once.names().into_iter().collect();
    let second: BTreeSet<String> = twice.names().into_iter().collect();
    assert_eq!(first, second);
    assert_eq!(once.root, twice.root);
}
