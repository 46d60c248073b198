//! Unions of key-compatible concepts.
//!
//! Each branch ("layer") of the union pairs the members of every requested
//! union concept that belong together, is sourced on its own, and exposes
//! the union concepts in place of its members.

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Derivation, Environment, Lineage};
use crate::plan::{NodeCore, PlanId, PlanNode};

use super::enrichment::{addresses, lineage_error};

/// Members of two unions belong in one layer when one keys the other or
/// they share a key set.
fn same_branch(a: &Concept, b: &Concept) -> bool {
    a.keys.contains(&b.address)
        || b.keys.contains(&a.address)
        || (!a.keys.is_empty() && a.keys == b.keys)
}

fn members(env: &Environment, concept: &Concept) -> PlanningResult<Vec<Concept>> {
    match &concept.lineage {
        Some(Lineage::Union(union)) => env.concepts_for(&union.concepts),
        _ => Err(lineage_error(concept, "expected union lineage")),
    }
}

/// Split the root union into layers, one per member, with the paired
/// members of every other union.
pub(crate) fn build_layers(
    env: &Environment,
    root: &Concept,
    others: &[Concept],
) -> PlanningResult<Vec<Vec<Concept>>> {
    let mut other_members = Vec::with_capacity(others.len());
    for other in others {
        other_members.push(members(env, other)?);
    }
    let mut layers = Vec::new();
    for member in members(env, root)? {
        let mut layer = vec![member.clone()];
        for candidates in &other_members {
            if let Some(paired) = candidates.iter().find(|c| same_branch(&member, c)) {
                if !layer.iter().any(|l| l.address == paired.address) {
                    layer.push(paired.clone());
                }
            }
        }
        layers.push(layer);
    }
    Ok(layers)
}

pub(crate) fn gen_union_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let unions: Vec<Concept> = optional
        .iter()
        .filter(|c| c.derivation == Derivation::Union)
        .cloned()
        .collect();
    let layers = build_layers(&env, concept, &unions)?;
    let mut resolved = vec![concept.address.clone()];
    resolved.extend(addresses(&unions));

    let mut parents = Vec::with_capacity(layers.len());
    for layer in &layers {
        let Some(parent) = planner.search(layer, depth + 1, false, conditions)? else {
            debug!(depth, concept = %concept.address, layer = ?addresses(layer), "could not source union layer");
            return Ok(None);
        };
        trace!(depth, layer = ?addresses(layer), node = %parent, "sourced union layer");
        let own = planner.arena.core(parent).output_concepts.clone();
        planner.arena.hide_output_concepts(parent, &own);
        planner.arena.add_output_concepts(parent, &resolved);
        parents.push(parent);
    }

    let node = planner.arena.insert(PlanNode::Union(
        NodeCore::new(resolved.clone(), resolved)
            .with_parents(parents)
            .with_depth(depth)
            .with_preexisting(conditions.cloned()),
    ));
    Ok(Some(node))
}
