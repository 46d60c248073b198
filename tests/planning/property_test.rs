//! Property tests for grain sufficiency and end-to-end planning.

use std::collections::BTreeSet;
use std::rc::Rc;

use proptest::prelude::*;
use strata::config::PlannerSettings;
use strata::discovery::{plan_query, validate_stack, ValidationResult};
use strata::model::{Column, DataType, Datasource, Environment};
use strata::plan::{check_if_group_required, NodeCore, PlanArena, PlanId, PlanNode, ResolvedSource};

const KEYS: [&str; 5] = ["k0", "k1", "k2", "k3", "k4"];

/// Five keys, each with one property named `p<i>`.
fn keyed() -> Environment {
    let mut env = Environment::new();
    for (i, key) in KEYS.iter().enumerate() {
        env.add_key(key, DataType::Integer);
        env.add_property(&format!("p{i}"), DataType::String, &[key]);
    }
    env
}

fn source(grain: &BTreeSet<usize>) -> ResolvedSource {
    let keys: Vec<&str> = grain.iter().map(|i| KEYS[*i]).collect();
    let columns = keys.iter().map(|k| Column::new(k, k)).collect();
    ResolvedSource::Datasource(Datasource::new("ds", columns, keys))
}

fn addresses(indexes: &BTreeSet<usize>) -> Vec<String> {
    indexes.iter().map(|i| format!("local.{}", KEYS[*i])).collect()
}

fn key_set() -> impl Strategy<Value = BTreeSet<usize>> {
    proptest::collection::btree_set(0..KEYS.len(), 1..=KEYS.len())
}

/// `keyed()` plus a chain of datasources `d<i>(k<i>, p<i>, k<i+1>)`.
fn chained() -> Environment {
    let mut env = keyed();
    for i in 0..KEYS.len() {
        let mut columns = vec![
            Column::new(KEYS[i], KEYS[i]),
            Column::new(&format!("p{i}"), &format!("p{i}")),
        ];
        if i + 1 < KEYS.len() {
            columns.push(Column::new(KEYS[i + 1], KEYS[i + 1]));
        }
        env.add_datasource(Datasource::new(&format!("d{i}"), columns, [KEYS[i]]))
            .unwrap();
    }
    env
}

fn select_over(arena: &mut PlanArena, index: usize) -> PlanId {
    let datasource = arena.environment().datasources[&format!("d{index}")].clone();
    let outputs = datasource.output_concepts();
    let core = NodeCore::new(outputs.clone(), outputs).with_grain(datasource.grain.clone());
    arena.insert(PlanNode::select(core, datasource, false))
}

fn items() -> Environment {
    let mut env = Environment::new();
    env.add_key("id", DataType::Integer);
    env.add_property("cat", DataType::String, &["id"]);
    env.add_property("value", DataType::Integer, &["id"]);
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

proptest! {
    #[test]
    fn grouping_needed_exactly_when_upstream_is_finer(
        upstream in key_set(),
        target in key_set(),
    ) {
        let env = keyed();
        let check = check_if_group_required(&env, &addresses(&target), &[source(&upstream)]).unwrap();
        prop_assert_eq!(check.required, !upstream.is_subset(&target));
    }

    #[test]
    fn properties_of_selected_keys_never_force_grouping(
        upstream in key_set(),
        target in key_set(),
    ) {
        let env = keyed();
        let plain = check_if_group_required(&env, &addresses(&target), &[source(&upstream)]).unwrap();

        let mut with_properties = addresses(&target);
        with_properties.extend(target.iter().map(|i| format!("local.p{i}")));
        let enriched = check_if_group_required(&env, &with_properties, &[source(&upstream)]).unwrap();

        prop_assert_eq!(plain.required, enriched.required);
        prop_assert_eq!(plain.target, enriched.target);
    }
}

proptest! {
    #[test]
    fn adding_a_source_never_loses_completeness(
        stack in proptest::collection::btree_set(0..KEYS.len(), 0..KEYS.len()),
        extra in 0..KEYS.len(),
        wanted in key_set(),
    ) {
        let env = Rc::new(chained());
        let mandatory_addresses: Vec<String> = wanted.iter().map(|i| format!("local.p{i}")).collect();
        let mandatory = env.concepts_for(&mandatory_addresses).unwrap();
        let mut arena = PlanArena::new(Rc::clone(&env));

        let mut nodes: Vec<PlanId> = stack.iter().map(|i| select_over(&mut arena, *i)).collect();
        let (before, _) = validate_stack(&arena, &nodes, &mandatory, &mandatory, None, false).unwrap();
        nodes.push(select_over(&mut arena, extra));
        let (after, _) = validate_stack(&arena, &nodes, &mandatory, &mandatory, None, false).unwrap();

        if before != ValidationResult::Incomplete {
            prop_assert_ne!(after, ValidationResult::Incomplete);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_column_subset_plans_to_exactly_its_outputs(
        picked in proptest::collection::btree_set(
            prop_oneof![Just("local.id"), Just("local.cat"), Just("local.value")],
            1..=3,
        ),
    ) {
        let env = items();
        let select: Vec<&str> = picked.iter().copied().collect();
        let planned = plan_query(&env, &select, None, &PlannerSettings::default()).unwrap();
        let outputs: BTreeSet<String> =
            planned.arena.core(planned.root).usable_outputs().into_iter().collect();
        let expected: BTreeSet<String> = picked.iter().map(|s| s.to_string()).collect();
        prop_assert_eq!(outputs, expected);
    }
}
