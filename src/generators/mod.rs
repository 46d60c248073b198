//! Node generators, one per derivation.
//!
//! ```text
//!   generate_node ──cached/exact select──▶ Select
//!        │
//!        └─ by derivation ─▶ group | filter | window | unnest | recursive
//!                            union | rowset | multiselect | basic | group_to
//!                            root/constant ─▶ bridge merge ─▶ synonyms
//! ```
//!
//! Every generator returns `Ok(None)` for a local miss; errors are never
//! downgraded.

mod basic;
mod enrichment;
mod filter;
mod group;
mod group_to;
mod merge;
mod multiselect;
mod recursive;
mod rowset;
mod select;
mod synonym;
mod union;
mod unnest;
mod window;

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::{Outcome, PlanningResult};
use crate::model::{Concept, Condition, Derivation, Granularity};
use crate::plan::{NodeCore, PlanId, PlanNode, SearchKey};

pub(crate) use enrichment::{addresses, is_root_or_constant, unique};

/// Produce a node for `concept`, opportunistically including `optional`.
pub fn generate_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> Outcome<PlanId> {
    generate(planner, concept, optional, depth, accept_partial, conditions).into()
}

fn generate(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let next_depth = depth + 1;
    let mut targets = vec![concept.clone()];
    targets.extend(optional.iter().cloned());

    if let Some(found) = cached_select(planner, &targets, next_depth, accept_partial, conditions)? {
        trace!(depth, concept = %concept.address, node = %found, "sourced by exact datasource match");
        return Ok(Some(found));
    }

    debug!(
        depth,
        concept = %concept.address,
        derivation = %concept.derivation,
        "generating node by derivation"
    );
    match concept.derivation {
        Derivation::Window => window::gen_window_node(planner, concept, optional, next_depth, conditions),
        Derivation::Filter => filter::gen_filter_node(planner, concept, optional, next_depth, conditions),
        Derivation::Unnest => unnest::gen_unnest_node(planner, concept, optional, next_depth, conditions),
        Derivation::Recursive => {
            recursive::gen_recursive_node(planner, concept, optional, next_depth, conditions)
        }
        Derivation::Union => union::gen_union_node(planner, concept, optional, next_depth, conditions),
        Derivation::Rowset => rowset::gen_rowset_node(planner, concept, optional, next_depth, conditions),
        Derivation::Multiselect => {
            multiselect::gen_multiselect_node(planner, concept, optional, next_depth, conditions)
        }
        Derivation::Aggregate => {
            // single-row companions cannot be grouped alongside
            let grouped: Vec<Concept> = optional
                .iter()
                .filter(|c| c.granularity != Granularity::SingleRow)
                .cloned()
                .collect();
            group::gen_group_node(planner, concept, &grouped, next_depth, conditions)
        }
        Derivation::Basic => basic::gen_basic_node(planner, concept, optional, next_depth, conditions),
        Derivation::GroupTo => {
            group_to::gen_group_to_node(planner, concept, optional, next_depth, conditions)
        }
        Derivation::Root | Derivation::Constant => {
            gen_root_node(planner, &targets, next_depth, accept_partial, conditions)
        }
    }
}

/// Exact datasource match for `targets`, memoized per search key.
fn cached_select(
    planner: &mut Planner,
    targets: &[Concept],
    depth: usize,
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let key = SearchKey::new(&addresses(targets), accept_partial, conditions);
    if let Some(hit) = planner.history.get_select(&mut planner.arena, &key) {
        return Ok(hit);
    }
    let found = select::gen_select_merge_node(planner, targets, depth, accept_partial, conditions)?;
    planner
        .history
        .select_to_history(&mut planner.arena, key, found);
    Ok(found)
}

/// Roots and constants: bridge discovery, then synonyms.
///
/// A root requested alongside derived companions re-enters the search with
/// all of them, since the companions may only be reachable through it. A
/// constant with any non-constant companion does the same, as it has no
/// row context of its own.
fn gen_root_node(
    planner: &mut Planner,
    targets: &[Concept],
    depth: usize,
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let key = SearchKey::new(&addresses(targets), accept_partial, conditions);
    if needs_row_context(targets) {
        if !planner.history.log_start(key.clone()) {
            trace!(depth, targets = ?addresses(targets), "root search already in progress");
            return Ok(None);
        }
        debug!(depth, targets = ?addresses(targets), "sourcing root or constant with its companions");
        let found = planner.search(targets, depth, accept_partial, None);
        planner.history.log_end(&key);
        return found;
    }

    let partial_options: &[bool] = if accept_partial { &[false, true] } else { &[false] };
    for &partial in partial_options {
        if let Some(node) = merge::gen_merge_node(planner, targets, depth, partial, conditions)? {
            restrict_to_targets(planner, node, targets);
            return Ok(Some(node));
        }
    }

    if accept_partial && planner.settings.synonym_fallback && !planner.history.check_started(&key) {
        planner.history.log_start(key.clone());
        let found = synonym::gen_synonym_node(planner, targets, depth, accept_partial, conditions);
        planner.history.log_end(&key);
        if let Some(node) = found? {
            return Ok(Some(node));
        }
    }

    if targets.iter().all(|t| t.derivation == Derivation::Constant) {
        let outputs = addresses(targets);
        let node = planner.arena.insert(PlanNode::Constant(
            NodeCore::new(Vec::new(), outputs).with_depth(depth),
        ));
        return Ok(Some(node));
    }
    debug!(depth, targets = ?addresses(targets), "no strategy sourced root concepts");
    Ok(None)
}

fn needs_row_context(targets: &[Concept]) -> bool {
    let Some((first, companions)) = targets.split_first() else {
        return false;
    };
    if !targets.iter().all(is_root_or_constant) {
        return true;
    }
    first.derivation == Derivation::Constant
        && companions.iter().any(|c| c.derivation != Derivation::Constant)
}

/// Keep only the targets on a bridged node. A pseudonym standing in for a
/// target stays visible unless the target itself is present.
fn restrict_to_targets(planner: &mut Planner, node: PlanId, targets: &[Concept]) {
    let outputs = planner.arena.core(node).output_concepts.clone();
    let mut kept: Vec<String> = Vec::new();
    let mut hidden: Vec<String> = Vec::new();
    for output in outputs {
        if targets.iter().any(|t| t.address == output) {
            kept.push(output);
            continue;
        }
        let Some(target) = targets.iter().find(|t| t.pseudonyms.contains(&output)) else {
            continue;
        };
        if planner.arena.core(node).output_concepts.contains(&target.address) {
            hidden.push(output.clone());
        }
        kept.push(output);
    }
    planner.arena.set_output_concepts(node, kept);
    planner.arena.hide_output_concepts(node, &hidden);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerSettings;
    use crate::model::{AggregateOp, Column, DataType, Datasource, Environment, Literal};
    use std::rc::Rc;

    fn items() -> Environment {
        let mut env = Environment::new();
        env.add_key("id", DataType::Integer);
        env.add_property("cat", DataType::String, &["id"]);
        env.add_property("value", DataType::Float, &["id"]);
        env.add_metric("total", DataType::Float, AggregateOp::Sum, "value", &["cat"])
            .unwrap();
        env.add_constant("one", DataType::Integer, Literal::Integer(1));
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
    fn test_exact_match_is_memoized() {
        let env = items();
        let id = env.concepts["local.id"].clone();
        let cat = env.concepts["local.cat"].clone();
        let mut planner = planner(env);
        let first = generate_node(&mut planner, &id, &[cat.clone()], 0, false, None);
        let second = generate_node(&mut planner, &id, &[cat], 0, false, None);
        let (Outcome::Found(a), Outcome::Found(b)) = (first, second) else {
            panic!("expected both lookups to succeed");
        };
        assert_ne!(a, b);
        assert_eq!(
            planner.arena.core(a).output_concepts,
            planner.arena.core(b).output_concepts
        );
    }

    #[test]
    fn test_aggregate_dispatches_to_group() {
        let env = items();
        let total = env.concepts["local.total"].clone();
        let mut planner = planner(env);
        let Outcome::Found(id) = generate_node(&mut planner, &total, &[], 0, false, None) else {
            panic!("aggregate should be sourced");
        };
        assert!(planner.arena.node(id).is_group());
    }

    #[test]
    fn test_unknown_root_is_not_found() {
        let mut env = items();
        env.add_key("orphan", DataType::Integer);
        let orphan = env.concepts["local.orphan"].clone();
        let mut planner = planner(env);
        assert!(matches!(
            generate_node(&mut planner, &orphan, &[], 0, true, None),
            Outcome::NotFound
        ));
    }

    /// customers(customer_id, name) and orders(order_id, customer_id, order_total).
    fn shop() -> Environment {
        let mut env = Environment::new();
        env.add_key("customer_id", DataType::Integer);
        env.add_key("order_id", DataType::Integer);
        env.add_property("name", DataType::String, &["customer_id"]);
        env.add_property("order_total", DataType::Float, &["order_id"]);
        env.add_constant("one", DataType::Integer, Literal::Integer(1));
        env.add_datasource(Datasource::new(
            "customers",
            vec![Column::new("customer_id", "customer_id"), Column::new("name", "name")],
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

    #[test]
    fn test_constant_with_root_companions_is_searched_together() {
        let env = shop();
        let one = env.concepts["local.one"].clone();
        let companions = env.concepts_for(&["local.name", "local.order_total"]).unwrap();
        let mut planner = planner(env);
        let Outcome::Found(id) = generate_node(&mut planner, &one, &companions, 0, false, None)
        else {
            panic!("constant and bridged companions should be sourced");
        };
        let outputs = planner.arena.core(id).usable_outputs();
        for address in ["local.one", "local.name", "local.order_total"] {
            assert!(outputs.contains(&address.to_string()), "missing {address} in {outputs:?}");
        }
        assert!(planner
            .arena
            .ancestors(id)
            .iter()
            .any(|p| planner.arena.node(*p).is_constant()));
    }

    #[test]
    fn test_row_context_rules() {
        let env = shop();
        let one = env.concepts["local.one"].clone();
        let name = env.concepts["local.name"].clone();
        assert!(needs_row_context(&[one.clone(), name.clone()]));
        assert!(!needs_row_context(&[one.clone(), one.clone()]));
        assert!(!needs_row_context(&[name.clone(), one]));
        assert!(!needs_row_context(&[name]));
    }

    #[test]
    fn test_constants_yield_constant_node() {
        let env = items();
        let one = env.concepts["local.one"].clone();
        let mut planner = planner(env);
        let Outcome::Found(id) = generate_node(&mut planner, &one, &[], 0, false, None) else {
            panic!("constant should be sourced");
        };
        assert!(planner.arena.node(id).is_constant());
    }
}
