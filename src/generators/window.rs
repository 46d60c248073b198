//! Window functions. Never change grain; peers over the same partition and
//! ordering are computed in one pass.

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Environment, Grain, Lineage};
use crate::plan::{concept_to_relevant_joins, NodeCore, PlanId, PlanNode};

use super::enrichment::{addresses, gen_enrichment_node, lineage_error, unique};

fn window_parents(env: &Environment, concept: &Concept) -> PlanningResult<Vec<Concept>> {
    let Some(Lineage::Window(window)) = &concept.lineage else {
        return Err(lineage_error(concept, "expected window lineage"));
    };
    let mut parents = vec![env.concept(&window.content)?.clone()];
    parents.extend(env.concepts_for(&window.over)?);
    let order: Vec<&String> = window.order_by.iter().map(|o| &o.concept).collect();
    parents.extend(env.concepts_for(&order)?);
    Ok(unique(parents))
}

pub(crate) fn gen_window_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let mut parents = window_parents(&env, concept)?;
    let mut outputs = vec![concept.clone()];
    if let Some(lineage) = &concept.lineage {
        for peer in optional {
            let equivalent = matches!(&peer.lineage, Some(other @ Lineage::Window(_)) if lineage.is_equivalent(other));
            if equivalent {
                trace!(depth, concept = %concept.address, peer = %peer.address, "batching window peer");
                parents.extend(window_parents(&env, peer)?);
                outputs.push(peer.clone());
            }
        }
    }
    let parents = unique(parents);

    let Some(parent) = planner.search(&parents, depth + 1, false, conditions)? else {
        debug!(
            depth,
            concept = %concept.address,
            parents = ?addresses(&parents),
            "could not source window inputs"
        );
        return Ok(None);
    };

    let mut window_outputs = addresses(&outputs);
    window_outputs.extend(addresses(&parents));
    let grain = Grain::from_concepts(parents.iter());
    let window = planner.arena.insert(PlanNode::Window(
        NodeCore::new(addresses(&parents), window_outputs.clone())
            .with_parents(vec![parent])
            .with_depth(depth)
            .with_preexisting(conditions.cloned()),
    ));
    let wrapped = planner.arena.insert(PlanNode::merge(
        NodeCore::new(window_outputs.clone(), window_outputs)
            .with_parents(vec![window])
            .with_depth(depth)
            .with_force_group(Some(false))
            .with_grain(grain)
            .with_preexisting(conditions.cloned()),
        None,
    ));

    let join_keys = env.concepts_for(&concept_to_relevant_joins(&parents))?;
    gen_enrichment_node(planner, wrapped, &join_keys, optional, depth, conditions).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerSettings;
    use crate::model::{Column, DataType, Datasource, OrderItem, WindowItem, WindowKind};
    use std::rc::Rc;

    fn ranked() -> Environment {
        let mut env = Environment::new();
        env.add_key("order_id", DataType::Integer);
        env.add_key("customer_id", DataType::Integer);
        env.add_property("total", DataType::Float, &["order_id"]);
        for (name, kind) in [("total_rank", WindowKind::Rank), ("total_row", WindowKind::RowNumber)] {
            env.add_derived(
                name,
                DataType::Integer,
                Lineage::Window(WindowItem {
                    kind,
                    content: "local.order_id".to_string(),
                    over: vec!["local.customer_id".to_string()],
                    order_by: vec![OrderItem {
                        concept: "local.total".to_string(),
                        descending: true,
                    }],
                }),
            )
            .unwrap();
        }
        env.add_datasource(Datasource::new(
            "orders",
            vec![
                Column::new("order_id", "order_id"),
                Column::new("customer_id", "customer_id"),
                Column::new("total", "total"),
            ],
            ["order_id"],
        ))
        .unwrap();
        env
    }

    #[test]
    fn test_window_is_wrapped_without_grouping() {
        let env = ranked();
        let rank = env.concepts["local.total_rank"].clone();
        let mut planner = Planner::new(Rc::new(env), PlannerSettings::default()).unwrap();
        let id = gen_window_node(&mut planner, &rank, &[], 0, None)
            .unwrap()
            .unwrap();
        let node = planner.arena.node(id);
        assert!(node.is_merge());
        assert_eq!(node.core().force_group, Some(false));
        assert!(matches!(
            planner.arena.node(node.parents()[0]),
            PlanNode::Window(_)
        ));
    }

    #[test]
    fn test_equivalent_windows_share_one_pass() {
        let env = ranked();
        let rank = env.concepts["local.total_rank"].clone();
        let row = env.concepts["local.total_row"].clone();
        let mut planner = Planner::new(Rc::new(env), PlannerSettings::default()).unwrap();
        let id = gen_window_node(&mut planner, &rank, &[row], 0, None)
            .unwrap()
            .unwrap();
        let window = planner.arena.node(id).parents()[0];
        let outputs = &planner.arena.core(window).output_concepts;
        assert!(outputs.contains(&"local.total_rank".to_string()));
        assert!(outputs.contains(&"local.total_row".to_string()));
    }
}
