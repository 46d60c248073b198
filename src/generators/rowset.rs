//! Named rowsets: plan the inner select, expose the rowset's concepts and
//! hide what the select only needed internally.

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Derivation, Grain, Lineage};
use crate::plan::{concept_to_relevant_joins, PlanId};

use super::enrichment::{addresses, gen_enrichment_node, lineage_error, unique};

pub(crate) fn gen_rowset_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let Some(Lineage::Rowset(item)) = &concept.lineage else {
        return Err(lineage_error(concept, "expected rowset lineage"));
    };
    let select = &item.select;
    let mut inner = env.concepts_for(&select.output)?;
    inner.extend(env.concepts_for(&select.hidden)?);
    let inner = unique(inner);

    let Some(node) = planner.source_at_depth(&inner, depth + 1, select.condition.as_ref())? else {
        debug!(depth, rowset = %item.rowset, "could not plan rowset select");
        return Ok(None);
    };

    let exposed: Vec<String> = env
        .rowset_concepts(&item.rowset)
        .into_iter()
        .filter(|c| match &c.lineage {
            Some(Lineage::Rowset(r)) => !select.hidden.contains(&r.content),
            _ => false,
        })
        .map(|c| c.address.clone())
        .collect();
    let passthrough: Vec<String> = optional
        .iter()
        .filter(|o| select.output.contains(&o.address))
        .map(|o| o.address.clone())
        .collect();
    planner.arena.add_output_concepts(node, &exposed);
    planner.arena.add_output_concepts(node, &passthrough);
    if select.condition.is_some() {
        // the select's filter leaves these only partially populated
        planner.arena.add_partial_concepts(node, &passthrough);
    }

    let requested: Vec<&String> = optional
        .iter()
        .map(|o| &o.address)
        .chain(std::iter::once(&concept.address))
        .collect();
    let hidden: Vec<String> = planner
        .arena
        .core(node)
        .output_concepts
        .iter()
        .filter(|o| !exposed.contains(o) && !requested.contains(o))
        .cloned()
        .collect();
    planner.arena.hide_output_concepts(node, &hidden);

    let visible = env.concepts_for(&planner.arena.core(node).usable_outputs())?;
    planner
        .arena
        .set_grain(node, Some(Grain::from_concepts(visible.iter())));
    trace!(depth, rowset = %item.rowset, node = %node, "exposed rowset concepts");

    let core = planner.arena.core(node);
    let covered = optional.iter().all(|o| {
        core.usable_outputs().contains(&o.address) && !core.partial_concepts.contains(&o.address)
    });
    if covered {
        return Ok(Some(node));
    }

    let inner_outputs = env.concepts_for(&core.output_concepts)?;
    let joinable: Vec<Concept> = inner_outputs
        .into_iter()
        .filter(|c| c.derivation != Derivation::Rowset)
        .collect();
    let join_keys = env.concepts_for(&concept_to_relevant_joins(&joinable))?;
    if join_keys.is_empty() {
        debug!(depth, rowset = %item.rowset, "no join keys to enrich rowset");
        return Ok(Some(node));
    }
    planner.arena.unhide_output_concepts(node, &addresses(&join_keys));
    gen_enrichment_node(planner, node, &join_keys, optional, depth, conditions).map(Some)
}
