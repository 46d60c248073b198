//! `group x by a, b`: restate a value at an explicit grain.

use tracing::debug;

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition};
use crate::plan::{NodeCore, PlanId, PlanNode};

use super::enrichment::{addresses, unique};

pub(crate) fn gen_group_to_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let arguments = env.concepts_for(&concept.concept_arguments())?;
    let Some(parent) = planner.search(&arguments, depth + 1, false, conditions)? else {
        debug!(depth, concept = %concept.address, "could not source group-to arguments");
        return Ok(None);
    };
    let mut outputs = addresses(&arguments);
    outputs.push(concept.address.clone());
    let group = planner.arena.insert(PlanNode::Group(
        NodeCore::new(addresses(&arguments), outputs)
            .with_parents(vec![parent])
            .with_depth(depth)
            .with_preexisting(conditions.cloned()),
    ));
    if optional.is_empty() {
        return Ok(Some(group));
    }

    let mut enrich_concepts = arguments.clone();
    enrich_concepts.extend(optional.iter().cloned());
    let enrich_concepts = unique(enrich_concepts);
    let Some(enrich) = planner.search(&enrich_concepts, depth + 1, false, conditions)? else {
        debug!(depth, concept = %concept.address, "could not enrich group-to, returning group alone");
        return Ok(Some(group));
    };
    let mut merged = vec![concept.address.clone()];
    merged.extend(addresses(optional));
    let mut inputs = merged.clone();
    inputs.extend(addresses(&arguments));
    let core = NodeCore::new(inputs, merged)
        .with_parents(vec![group, enrich])
        .with_depth(depth)
        .with_preexisting(conditions.cloned());
    let node = planner.arena.insert(PlanNode::merge(core, None));
    planner.arena.set_whole_grain(node, true);
    Ok(Some(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerSettings;
    use crate::model::{
        Column, DataType, Datasource, Environment, Expr, Function, FunctionOp, Lineage,
    };
    use std::rc::Rc;

    fn regional() -> Environment {
        let mut env = Environment::new();
        env.add_key("store_id", DataType::Integer);
        env.add_key("region", DataType::String);
        env.add_property("store_name", DataType::String, &["store_id"]);
        env.add_derived(
            "region_of_store",
            DataType::String,
            Lineage::Function(Function {
                op: FunctionOp::Group,
                args: vec![Expr::concept("local.region"), Expr::concept("local.store_id")],
            }),
        )
        .unwrap();
        env.add_datasource(Datasource::new(
            "stores",
            vec![
                Column::new("store_id", "store_id"),
                Column::new("region", "region"),
                Column::new("store_name", "store_name"),
            ],
            ["store_id"],
        ))
        .unwrap();
        env
    }

    #[test]
    fn test_group_to_without_companions() {
        let env = regional();
        let concept = env.concepts["local.region_of_store"].clone();
        let mut planner = Planner::new(Rc::new(env), PlannerSettings::default()).unwrap();
        let id = gen_group_to_node(&mut planner, &concept, &[], 0, None)
            .unwrap()
            .unwrap();
        let node = planner.arena.node(id);
        assert!(node.is_group());
        assert_eq!(
            node.core().output_concepts,
            vec!["local.region", "local.store_id", "local.region_of_store"]
        );
    }

    #[test]
    fn test_companions_merge_at_whole_grain() {
        let env = regional();
        let concept = env.concepts["local.region_of_store"].clone();
        let name = env.concepts["local.store_name"].clone();
        let mut planner = Planner::new(Rc::new(env), PlannerSettings::default()).unwrap();
        let id = gen_group_to_node(&mut planner, &concept, &[name], 0, None)
            .unwrap()
            .unwrap();
        let core = planner.arena.core(id);
        assert!(planner.arena.node(id).is_merge());
        assert!(core.whole_grain);
        assert_eq!(core.output_concepts, vec!["local.region_of_store", "local.store_name"]);
    }
}
