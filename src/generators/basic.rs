//! Scalar functions over other concepts.

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Derivation, Lineage};
use crate::plan::PlanId;

use super::enrichment::{addresses, resolve_function_parent_concepts, unique};

fn is_equivalent(concept: &Concept, other: &Concept) -> bool {
    match (&concept.lineage, &other.lineage) {
        (Some(a @ Lineage::Function(_)), Some(b @ Lineage::Function(_))) => {
            other.derivation == Derivation::Basic && a.is_equivalent(b)
        }
        _ => false,
    }
}

/// Compute `concept` on the node sourcing its arguments.
///
/// Companions with an equivalent expression are computed on the same node;
/// other companions are sourced with the arguments.
pub(crate) fn gen_basic_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let mut lineage_inputs = resolve_function_parent_concepts(&env, concept)?;
    let mut computed = vec![concept.clone()];
    let mut others: Vec<Concept> = Vec::new();
    for companion in optional {
        if companion.address != concept.address && is_equivalent(concept, companion) {
            trace!(depth, concept = %concept.address, peer = %companion.address, "batching equivalent expression");
            lineage_inputs.extend(resolve_function_parent_concepts(&env, companion)?);
            computed.push(companion.clone());
        } else {
            others.push(companion.clone());
        }
    }
    let lineage_inputs = unique(lineage_inputs);
    let mut parents = lineage_inputs.clone();
    parents.extend(others.iter().cloned());
    let parents = unique(parents);

    let Some(node) = planner.search(&parents, depth + 1, false, conditions)? else {
        debug!(
            depth,
            concept = %concept.address,
            parents = ?addresses(&parents),
            "could not source function inputs"
        );
        return Ok(None);
    };
    planner.arena.add_output_concepts(node, &addresses(&computed));

    let keep: Vec<String> = addresses(&computed)
        .into_iter()
        .chain(addresses(optional))
        .chain(addresses(&lineage_inputs))
        .collect();
    let stray: Vec<String> = planner
        .arena
        .core(node)
        .output_concepts
        .iter()
        .filter(|o| !keep.contains(o))
        .cloned()
        .collect();
    if !stray.is_empty() {
        trace!(depth, concept = %concept.address, stray = ?stray, "dropping unrequested outputs");
        planner.arena.remove_output_concepts(node, &stray);
    }
    Ok(Some(node))
}
