//! Filtered concepts.
//!
//! A filter whose predicate is scalar is folded into the parent's condition
//! when the query applies the same predicate, or when every companion can
//! live under it. Anything else gets a dedicated filter layer, merged back
//! onto the unfiltered companions with a left outer join.

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Grain, Lineage};
use crate::plan::{concept_to_relevant_joins, JoinType, NodeCore, NodeJoin, PlanId, PlanNode};

use super::enrichment::{addresses, lineage_error, resolve_filter_parent_concepts, unique};

pub(crate) fn gen_filter_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let Some(Lineage::Filter(filter)) = &concept.lineage else {
        return Err(lineage_error(concept, "expected filter lineage"));
    };
    let where_clause = &filter.condition;
    let content = env.concept(&filter.content)?.clone();
    let (mut rows, existence) = resolve_filter_parent_concepts(&env, concept)?;

    // Optional filters over the same predicate are computed together
    let mut outputs = vec![concept.clone()];
    let mut others: Vec<Concept> = Vec::new();
    for companion in optional {
        match &companion.lineage {
            Some(Lineage::Filter(peer)) if peer.condition == *where_clause => {
                trace!(depth, concept = %concept.address, peer = %companion.address, "batching filter peer");
                let (peer_rows, _) = resolve_filter_parent_concepts(&env, companion)?;
                rows.extend(peer_rows);
                outputs.push(companion.clone());
            }
            _ => others.push(companion.clone()),
        }
    }
    let rows = unique(rows);
    let row_addresses = addresses(&rows);

    let global_match = conditions.is_some_and(|global| where_clause.is_child_of(global));
    let companions_fit = others.iter().all(|o| row_addresses.contains(&o.address));
    if existence.is_empty() && where_clause.is_scalar(&env, None) && (global_match || companions_fit)
    {
        let pushed = if global_match { conditions } else { Some(where_clause) };
        let mut mandatory = rows.clone();
        mandatory.extend(others.iter().cloned());
        let mandatory = unique(mandatory);
        debug!(
            depth,
            concept = %concept.address,
            global_match,
            parents = ?addresses(&mandatory),
            "pushing filter into parent"
        );
        let Some(parent) = planner.search(&mandatory, depth + 1, false, pushed)? else {
            debug!(depth, concept = %concept.address, "could not source filter parents");
            return Ok(None);
        };
        planner.arena.add_output_concepts(parent, &addresses(&outputs));
        return Ok(Some(parent));
    }

    let Some(row_parent) = planner.search(&rows, depth + 1, false, conditions)? else {
        debug!(depth, concept = %concept.address, rows = ?row_addresses, "could not source filter rows");
        return Ok(None);
    };
    let mut parents = vec![row_parent];
    for check in &existence {
        let Some(node) = planner.search(std::slice::from_ref(check), depth + 1, false, None)? else {
            debug!(depth, concept = %check.address, "could not source existence check");
            return Ok(None);
        };
        parents.push(node);
    }

    let mut grain_basis = vec![content.clone()];
    grain_basis.extend(env.concepts_for(&where_clause.row_arguments())?);
    let mut filter_outputs = addresses(&outputs);
    filter_outputs.push(content.address.clone());
    filter_outputs.extend(row_addresses.iter().cloned());
    let mut inputs = row_addresses.clone();
    inputs.extend(addresses(&existence));
    let core = NodeCore::new(inputs, filter_outputs)
        .with_parents(parents)
        .with_depth(depth)
        .with_existence(addresses(&existence))
        .with_grain(Grain::from_concepts(grain_basis.iter()))
        .with_preexisting(conditions.cloned())
        .with_conditions(Some(where_clause.clone()));
    let filter_node = planner.arena.insert(PlanNode::Filter(core));

    if others.iter().all(|o| row_addresses.contains(&o.address)) {
        return Ok(Some(filter_node));
    }

    let mut enrich_concepts = vec![content.clone()];
    enrich_concepts.extend(rows.iter().cloned());
    enrich_concepts.extend(others.iter().cloned());
    let enrich_concepts = unique(enrich_concepts);
    let Some(enrich) = planner.search(&enrich_concepts, depth + 1, false, conditions)? else {
        debug!(depth, concept = %concept.address, "could not enrich filter, returning filter alone");
        return Ok(Some(filter_node));
    };
    let mut joins_on = vec![content.clone()];
    joins_on.extend(rows.iter().cloned());
    let mut merged = addresses(&outputs);
    merged.extend(addresses(&enrich_concepts));
    let core = NodeCore::new(merged.clone(), merged)
        .with_parents(vec![enrich, filter_node])
        .with_depth(depth)
        .with_preexisting(conditions.cloned());
    let joins = vec![NodeJoin::new(
        enrich,
        filter_node,
        concept_to_relevant_joins(&joins_on),
        JoinType::LeftOuter,
    )];
    Ok(Some(planner.arena.insert(PlanNode::merge(core, Some(joins)))))
}
