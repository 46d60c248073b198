//! Aggregates: source the aggregated arguments and the grain, then group.

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Derivation, Grain};
use crate::plan::{NodeCore, PlanId, PlanNode};

use super::enrichment::{
    addresses, gen_enrichment_node, resolve_function_parent_concepts, unique,
};

pub(crate) fn gen_group_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let mut parent_concepts = resolve_function_parent_concepts(&env, concept)?;
    let mut outputs = vec![concept.clone()];
    if !concept.grain.is_abstract() {
        let grain: Vec<&String> = concept.grain.components.iter().collect();
        let components = env.concepts_for(&grain)?;
        parent_concepts.extend(components.iter().cloned());
        outputs.extend(components);
    }
    let mut parent_concepts = unique(parent_concepts);

    // Companions at the same grain whose inputs are already here ride along
    for companion in optional {
        if !matches!(
            companion.derivation,
            Derivation::Aggregate | Derivation::Basic
        ) || companion.grain != concept.grain
        {
            continue;
        }
        if outputs.iter().any(|o| o.address == companion.address) {
            continue;
        }
        let companion_parents = resolve_function_parent_concepts(&env, companion)?;
        let contained = companion_parents
            .iter()
            .all(|p| parent_concepts.iter().any(|c| c.address == p.address));
        let same_grain = Grain::from_concepts(companion_parents.iter())
            == Grain::from_concepts(parent_concepts.iter());
        if contained || same_grain {
            trace!(
                depth,
                concept = %concept.address,
                companion = %companion.address,
                "folding companion into aggregate"
            );
            parent_concepts.extend(companion_parents);
            parent_concepts = unique(parent_concepts);
            outputs.push(companion.clone());
        }
    }
    let outputs = unique(outputs);

    let Some(parent) = planner.search(&parent_concepts, depth, false, conditions)? else {
        debug!(
            depth,
            concept = %concept.address,
            parents = ?addresses(&parent_concepts),
            "could not source aggregate inputs"
        );
        return Ok(None);
    };

    let core = NodeCore::new(addresses(&parent_concepts), addresses(&outputs))
        .with_parents(vec![parent])
        .with_depth(depth)
        .with_preexisting(conditions.cloned());
    let group = planner.arena.insert(PlanNode::Group(core));

    let missing: Vec<Concept> = optional
        .iter()
        .filter(|c| !outputs.iter().any(|o| o.address == c.address))
        .cloned()
        .collect();
    if missing.is_empty() {
        trace!(depth, concept = %concept.address, "aggregate covers every companion");
        return Ok(Some(group));
    }
    let join_keys: Vec<Concept> = if concept.grain.is_abstract() {
        Vec::new()
    } else {
        let grain: Vec<&String> = concept.grain.components.iter().collect();
        env.concepts_for(&grain)?
    };
    gen_enrichment_node(planner, group, &join_keys, optional, depth, conditions).map(Some)
}
