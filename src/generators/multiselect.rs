//! Multiselects: several inner selects full-joined on their aligned concepts.

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Derivation, Grain, Lineage, MultiselectItem};
use crate::plan::{concept_to_relevant_joins, JoinType, NodeCore, NodeJoin, PlanId, PlanNode};

use super::enrichment::{addresses, gen_enrichment_node, lineage_error};

/// Full joins from the first branch to every other branch on the aligned
/// concepts they share.
fn align_joins(parents: &[(PlanId, Vec<String>)]) -> Vec<NodeJoin> {
    let Some(((first, first_aligned), rest)) = parents.split_first() else {
        return Vec::new();
    };
    rest.iter()
        .map(|(other, aligned)| {
            let shared: Vec<String> = first_aligned
                .iter()
                .filter(|a| aligned.contains(a))
                .cloned()
                .collect();
            let join_type = if shared.is_empty() {
                JoinType::Cross
            } else {
                JoinType::Full
            };
            NodeJoin::new(*first, *other, shared, join_type)
        })
        .collect()
}

pub(crate) fn gen_multiselect_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let Some(Lineage::Multiselect(item)) = &concept.lineage else {
        return Err(lineage_error(concept, "expected multiselect lineage"));
    };
    let MultiselectItem {
        name,
        selects,
        ..
    } = item;

    let mut branches: Vec<(PlanId, Vec<String>)> = Vec::with_capacity(selects.len());
    for select in selects {
        let outputs = env.concepts_for(&select.output)?;
        let condition = match (&select.condition, &select.having) {
            (Some(c), Some(h)) => Some(c.clone().and(h.clone())),
            (c, h) => c.clone().or_else(|| h.clone()),
        };
        let Some(branch) = planner.source_at_depth(&outputs, depth + 1, condition.as_ref())? else {
            debug!(depth, multiselect = %name, outputs = ?select.output, "could not plan multiselect branch");
            return Ok(None);
        };
        let aligned: Vec<String> = planner
            .arena
            .core(branch)
            .usable_outputs()
            .iter()
            .filter_map(|o| item.merge_concept(o).map(str::to_string))
            .collect();
        trace!(depth, multiselect = %name, node = %branch, aligned = ?aligned, "planned branch");
        planner.arena.add_output_concepts(branch, &aligned);
        branches.push((branch, aligned));
    }

    let requested: Vec<&String> = optional
        .iter()
        .map(|o| &o.address)
        .chain(std::iter::once(&concept.address))
        .collect();
    let mut outputs: Vec<String> = env
        .multiselect_concepts(name)
        .into_iter()
        .map(|c| c.address.clone())
        .filter(|a| requested.contains(&a))
        .collect();
    outputs.extend(
        optional
            .iter()
            .filter(|o| selects.iter().any(|s| s.output.contains(&o.address)))
            .map(|o| o.address.clone()),
    );
    let mut inputs: Vec<String> = Vec::new();
    for (branch, _) in &branches {
        inputs.extend(planner.arena.core(*branch).usable_outputs());
    }
    let grain = Grain::from_concepts(env.concepts_for(&outputs)?.iter());
    let joins = align_joins(&branches);
    let parents: Vec<PlanId> = branches.iter().map(|(b, _)| *b).collect();
    let node = planner.arena.insert(PlanNode::merge(
        NodeCore::new(inputs, outputs.clone())
            .with_parents(parents)
            .with_depth(depth)
            .with_grain(grain),
        Some(joins),
    ));

    if optional.iter().all(|o| outputs.contains(&o.address)) {
        return Ok(Some(node));
    }
    let joinable: Vec<Concept> = env
        .concepts_for(&outputs)?
        .into_iter()
        .filter(|c| c.derivation != Derivation::Multiselect)
        .collect();
    if joinable.is_empty() {
        debug!(depth, multiselect = %name, "no join keys to enrich multiselect");
        return Ok(Some(node));
    }
    let join_keys = env.concepts_for(&concept_to_relevant_joins(&joinable))?;
    debug!(depth, multiselect = %name, join_keys = ?addresses(&join_keys), "enriching multiselect");
    gen_enrichment_node(planner, node, &join_keys, optional, depth, conditions).map(Some)
}
