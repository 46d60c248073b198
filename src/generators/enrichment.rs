//! Helpers shared by the derivation generators: parent resolution and
//! enrichment of a core node with optional companions it does not produce.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::{PlanningError, PlanningResult};
use crate::model::{Concept, Condition, Derivation, Environment, Lineage, Purpose};
use crate::plan::{NodeCore, PlanId, PlanNode};

pub(crate) fn addresses(concepts: &[Concept]) -> Vec<String> {
    concepts.iter().map(|c| c.address.clone()).collect()
}

/// Deduplicate by address, keeping first occurrence.
pub(crate) fn unique(concepts: Vec<Concept>) -> Vec<Concept> {
    let mut out: Vec<Concept> = Vec::with_capacity(concepts.len());
    for concept in concepts {
        if !out.iter().any(|c| c.address == concept.address) {
            out.push(concept);
        }
    }
    out
}

pub(crate) fn lineage_error(concept: &Concept, reason: &str) -> PlanningError {
    PlanningError::InvalidLineage {
        address: concept.address.clone(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// Parent resolution
// ============================================================================

/// Concepts a function or aggregate reads.
///
/// An aggregate with a concrete grain also needs its grain components, and
/// the keys of any property it aggregates so the property is not collapsed
/// before aggregation.
pub(crate) fn resolve_function_parent_concepts(
    env: &Environment,
    concept: &Concept,
) -> PlanningResult<Vec<Concept>> {
    let lineage = concept
        .lineage
        .as_ref()
        .ok_or_else(|| lineage_error(concept, "expected function or aggregate lineage"))?;
    match lineage {
        Lineage::Aggregate(aggregate) => {
            let direct: Vec<String> = aggregate
                .args
                .iter()
                .flat_map(|a| a.concept_arguments())
                .collect();
            let mut base = env.concepts_for(&direct)?;
            if !concept.grain.is_abstract() {
                let grain: Vec<&String> = concept.grain.components.iter().collect();
                base.extend(env.concepts_for(&grain)?);
            }
            for arg in env.concepts_for(&direct)? {
                if arg.purpose == Purpose::Property && !arg.keys.is_empty() {
                    let keys: Vec<&String> = arg.keys.iter().collect();
                    base.extend(env.concepts_for(&keys)?);
                }
            }
            Ok(unique(base))
        }
        Lineage::Function(_) => Ok(unique(env.concepts_for(&lineage.concept_arguments())?)),
        _ => Err(lineage_error(concept, "expected function or aggregate lineage")),
    }
}

/// Row parents and existence parents of a filtered concept.
///
/// A filtered property or metric also brings its keys so it stays at its
/// own grain.
pub(crate) fn resolve_filter_parent_concepts(
    env: &Environment,
    concept: &Concept,
) -> PlanningResult<(Vec<Concept>, Vec<Concept>)> {
    let Some(Lineage::Filter(filter)) = &concept.lineage else {
        return Err(lineage_error(concept, "expected filter lineage"));
    };
    let content = env.concept(&filter.content)?;
    let mut rows = vec![content.clone()];
    rows.extend(env.concepts_for(&filter.condition.row_arguments())?);
    if matches!(content.purpose, Purpose::Property | Purpose::Metric) && !content.keys.is_empty() {
        let keys: Vec<&String> = content.keys.iter().collect();
        rows.extend(env.concepts_for(&keys)?);
    }
    let existence = env.concepts_for(&filter.condition.existence_arguments())?;
    Ok((unique(rows), unique(existence)))
}

// ============================================================================
// Enrichment
// ============================================================================

/// Wrap `base` so it also produces `optional`.
///
/// Missing optionals (or ones `base` only has partially) are fetched with
/// `join_keys` in a second search and merged back. If every missing
/// optional is a property whose keys `base` already outputs, each key set is
/// looked up on its own instead. An unresolvable enrichment leaves `base`
/// as is.
pub(crate) fn gen_enrichment_node(
    planner: &mut Planner,
    base: PlanId,
    join_keys: &[Concept],
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<PlanId> {
    let core = planner.arena.core(base).clone();
    let extra_required: Vec<Concept> = optional
        .iter()
        .filter(|c| {
            !core.output_concepts.contains(&c.address) || core.partial_concepts.contains(&c.address)
        })
        .cloned()
        .collect();
    if extra_required.is_empty() {
        return Ok(base);
    }

    let property_lookup = extra_required.iter().all(|c| {
        c.purpose == Purpose::Property
            && !c.keys.is_empty()
            && c.keys.iter().all(|k| core.output_concepts.contains(k))
    });
    if property_lookup {
        trace!(depth, node = %base, "property lookup enrichment");
        if let Some(node) =
            gen_property_enrichment_node(planner, base, &extra_required, depth, conditions)?
        {
            return Ok(node);
        }
        return Ok(base);
    }

    debug!(
        depth,
        node = %base,
        join_keys = ?addresses(join_keys),
        missing = ?addresses(&extra_required),
        "searching for enrichment"
    );
    let mut mandatory = join_keys.to_vec();
    mandatory.extend(extra_required.iter().cloned());
    let mandatory = unique(mandatory);
    let Some(enrich) = planner.search(&mandatory, depth + 1, false, conditions)? else {
        debug!(depth, node = %base, "enrichment unresolvable, returning base node");
        return Ok(base);
    };

    let mut concepts = addresses(&mandatory);
    concepts.extend(core.usable_outputs());
    let merged = NodeCore::new(concepts.clone(), concepts)
        .with_parents(vec![enrich, base])
        .with_depth(depth)
        .with_force_group(Some(false))
        .with_preexisting(conditions.cloned());
    Ok(planner.arena.insert(PlanNode::merge(merged, None)))
}

/// Look up missing properties per key set and merge them onto `base`.
fn gen_property_enrichment_node(
    planner: &mut Planner,
    base: PlanId,
    properties: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let mut by_keys: BTreeMap<Vec<String>, Vec<String>> = BTreeMap::new();
    for property in properties {
        let keys: Vec<String> = property.keys.iter().cloned().collect();
        by_keys.entry(keys).or_default().push(property.address.clone());
    }

    let mut parents = vec![base];
    for (keys, values) in &by_keys {
        let mut lookup = env.concepts_for(keys)?;
        lookup.extend(env.concepts_for(values)?);
        match planner.search(&lookup, depth + 1, false, conditions)? {
            Some(node) => parents.push(node),
            None => {
                debug!(depth, keys = ?keys, "property lookup unresolvable");
                return Ok(None);
            }
        }
    }

    let mut outputs = planner.arena.core(base).output_concepts.clone();
    outputs.extend(addresses(properties));
    let core = NodeCore::new(outputs.clone(), outputs)
        .with_parents(parents)
        .with_depth(depth)
        .with_preexisting(conditions.cloned());
    Ok(Some(planner.arena.insert(PlanNode::merge(core, None))))
}

pub(crate) fn is_root_or_constant(concept: &Concept) -> bool {
    matches!(concept.derivation, Derivation::Root | Derivation::Constant)
}
