//! Transitive closure over an edge pair.

use tracing::debug;

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition};
use crate::plan::{NodeCore, PlanId, PlanNode};

use super::enrichment::{addresses, gen_enrichment_node, lineage_error};

pub(crate) fn gen_recursive_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let arguments = env.concepts_for(&concept.concept_arguments())?;
    if arguments.len() != 2 {
        return Err(lineage_error(concept, "recursion needs a child and a parent edge"));
    }
    let Some(parent) = planner.search(&arguments, depth + 1, false, conditions)? else {
        debug!(
            depth,
            concept = %concept.address,
            edges = ?addresses(&arguments),
            "could not source recursion edges"
        );
        return Ok(None);
    };

    let mut outputs = vec![concept.address.clone()];
    outputs.extend(addresses(&arguments));
    let base = planner.arena.insert(PlanNode::Recursive(
        NodeCore::new(addresses(&arguments), outputs.clone())
            .with_parents(vec![parent])
            .with_depth(depth)
            .with_preexisting(conditions.cloned()),
    ));
    // recursion fans rows out, so always regroup
    let grouped = planner.arena.insert(PlanNode::Group(
        NodeCore::new(outputs.clone(), outputs)
            .with_parents(vec![base])
            .with_depth(depth)
            .with_force_group(Some(true))
            .with_preexisting(conditions.cloned()),
    ));
    gen_enrichment_node(planner, grouped, &arguments, optional, depth, conditions).map(Some)
}
