//! Snapshot tests for plan and CTE renderings.

use insta::assert_snapshot;
use strata::config::{OptimizerConfig, PlannerSettings};
use strata::discovery::{plan_query, PlannedQuery};
use strata::model::{Column, DataType, Datasource, Environment};
use strata::optimizer::{lower_plan, optimize_ctes, CtePlan};
use strata::plan::{PlanId, PlanNode};

fn items() -> Environment {
    let mut env = Environment::new();
    env.add_key("id", DataType::Integer);
    env.add_property("cat", DataType::String, &["id"]);
    env.add_datasource(Datasource::new(
        "items",
        vec![Column::new("id", "id"), Column::new("cat", "cat")],
        ["id"],
    ))
    .unwrap();
    env
}

/// Kind, datasource, sorted visible outputs and grain per node, indented by
/// depth. Node ids are left out so the rendering is stable.
fn render(planned: &PlannedQuery) -> String {
    fn walk(planned: &PlannedQuery, id: PlanId, depth: usize, out: &mut String) {
        let node = planned.arena.node(id);
        let mut outputs = node.core().usable_outputs();
        outputs.sort();
        out.push_str(&"  ".repeat(depth));
        out.push_str(node.kind_name());
        if let PlanNode::Select(select) = node {
            out.push(' ');
            out.push_str(&select.datasource.identifier);
        }
        out.push_str(&format!(" [{}]", outputs.join(", ")));
        if let Some(grain) = &node.core().grain {
            out.push_str(&format!(" grain={}", grain.fingerprint()));
        }
        out.push('\n');
        for parent in node.parents() {
            walk(planned, *parent, depth + 1, out);
        }
    }
    let mut out = String::new();
    walk(planned, planned.root, 0, &mut out);
    out
}

fn render_ctes(plan: &CtePlan) -> String {
    let mut out = String::new();
    for cte in &plan.ctes {
        let mut columns = cte.usable_outputs();
        columns.sort();
        let datasources: Vec<&str> = cte.datasources.iter().map(|d| d.identifier.as_str()).collect();
        out.push_str(&format!(
            "{} root={} datasources=[{}] columns=[{}] grain={} grouped={}\n",
            cte.source_type,
            cte.name == plan.root,
            datasources.join(", "),
            columns.join(", "),
            cte.grain.fingerprint(),
            cte.group_to_grain,
        ));
    }
    out
}

#[test]
fn test_select_without_grouping() {
    let env = items();
    let planned = plan_query(&env, &["local.id", "local.cat"], None, &PlannerSettings::default())
        .unwrap();
    assert_snapshot!("select_without_grouping", render(&planned));
}

#[test]
fn test_single_select_cte() {
    let env = items();
    let planned = plan_query(&env, &["local.id", "local.cat"], None, &PlannerSettings::default())
        .unwrap();
    let lowered = lower_plan(&planned.arena, planned.root).unwrap();
    let optimized = optimize_ctes(lowered, &env, &OptimizerConfig::default()).unwrap();
    assert_snapshot!("single_select_cte", render_ctes(&optimized));
}

#[test]
fn test_unresolvable_message() {
    let mut env = items();
    env.add_key("orphan", DataType::Integer);
    let err = plan_query(&env, &["local.orphan"], None, &PlannerSettings::default()).unwrap_err();
    assert_snapshot!("unresolvable_message", err.to_string());
}
