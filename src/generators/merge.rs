//! Bridge discovery: connect concepts no single datasource provides.
//!
//! Repeatedly extracts a minimal tree over the reference graph joining the
//! requested concepts, records the bridge concepts it had to pass through,
//! removes them and tries again. More than one incomparable bridge set is an
//! ambiguity; a unique one is split per datasource and each piece sourced on
//! its own before merging.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::{PlanningError, PlanningResult};
use crate::graph::{prune_sources_for_conditions, steiner, GraphDatasource, NodeId, ReferenceGraph};
use crate::model::{Concept, Condition, Derivation, Environment, Grain};
use crate::plan::{NodeCore, PlanId, PlanNode};

use super::enrichment::addresses;

/// Source `targets` by discovering the join keys that link them.
///
/// Returns `None` when no connecting subgraph exists or when the only one
/// found would repeat this very search.
pub(crate) fn gen_merge_node(
    planner: &mut Planner,
    targets: &[Concept],
    depth: usize,
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let mut search: Vec<Concept> = targets.to_vec();
    if let Some(condition) = conditions {
        search.extend(env.concepts_for(&condition.row_arguments())?);
    }
    search.sort_by(|a, b| a.address.cmp(&b.address));
    search.dedup_by(|a, b| a.address == b.address);
    let break_set: BTreeSet<&str> = search.iter().map(|c| c.address.as_str()).collect();

    for filter_downstream in [true, false] {
        let Some(subgraphs) = resolve_weak_components(
            &env,
            &planner.graph,
            &search,
            filter_downstream,
            accept_partial,
            conditions,
            planner.settings.weak_component_limit,
        )?
        else {
            trace!(depth, filter_downstream, "no bridged subgraph");
            continue;
        };
        debug!(
            depth,
            subgraphs = ?subgraphs.iter().map(|s| addresses(s)).collect::<Vec<_>>(),
            "resolved bridged subgraphs"
        );
        if subgraphs
            .iter()
            .any(|s| s.iter().map(|c| c.address.as_str()).collect::<BTreeSet<_>>() == break_set)
        {
            debug!(depth, "bridged subgraph equals the search itself, giving up");
            return Ok(None);
        }
        return subgraphs_to_merge_node(planner, &subgraphs, targets, depth);
    }
    Ok(None)
}

/// Source each subgraph and merge the results.
fn subgraphs_to_merge_node(
    planner: &mut Planner,
    subgraphs: &[Vec<Concept>],
    targets: &[Concept],
    depth: usize,
) -> PlanningResult<Option<PlanId>> {
    let mut parents = Vec::with_capacity(subgraphs.len());
    for subgraph in subgraphs {
        match planner.search(subgraph, depth + 1, false, None)? {
            Some(parent) => parents.push(parent),
            None => {
                debug!(depth, subgraph = ?addresses(subgraph), "could not source subgraph");
                return Ok(None);
            }
        }
    }
    if let [single] = parents.as_slice() {
        return Ok(Some(*single));
    }

    let mut inputs: Vec<String> = Vec::new();
    let mut outputs: Vec<String> = Vec::new();
    for parent in &parents {
        for address in planner.arena.core(*parent).usable_outputs() {
            let wanted = targets.iter().any(|t| {
                t.address == address
                    || t.pseudonyms.contains(&address)
                    || planner
                        .arena
                        .environment()
                        .concepts
                        .get(&address)
                        .is_some_and(|c| c.pseudonyms.contains(&t.address))
            });
            if wanted && !outputs.contains(&address) {
                outputs.push(address.clone());
            }
            if !inputs.contains(&address) {
                inputs.push(address);
            }
        }
    }
    let core = NodeCore::new(inputs, outputs)
        .with_parents(parents)
        .with_depth(depth);
    Ok(Some(planner.arena.insert(PlanNode::merge(core, None))))
}

// ============================================================================
// Weak component resolution
// ============================================================================

/// Concept groups that, sourced separately and merged, cover `concepts`.
///
/// Fails with [`PlanningError::Ambiguous`] when two discovered bridge sets
/// are incomparable, and with [`PlanningError::IterationLimit`] when the
/// discovery does not settle within `limit` rounds.
pub(crate) fn resolve_weak_components(
    env: &Environment,
    graph: &ReferenceGraph,
    concepts: &[Concept],
    filter_downstream: bool,
    accept_partial: bool,
    conditions: Option<&Condition>,
    limit: usize,
) -> PlanningResult<Option<Vec<Vec<Concept>>>> {
    let mut search_graph = graph.clone();
    prune_sources_for_conditions(&mut search_graph, accept_partial, conditions);

    let search: BTreeSet<&str> = concepts.iter().map(|c| c.address.as_str()).collect();
    let terminals: Vec<NodeId> = concepts.iter().map(NodeId::concept).collect();
    let synonyms: BTreeSet<String> = concepts
        .iter()
        .flat_map(|c| c.pseudonyms.iter().cloned())
        .collect();

    let mut found: Vec<ReferenceGraph> = Vec::new();
    let mut bridge_sets: Vec<BTreeSet<String>> = Vec::new();
    let mut count = 0;
    loop {
        count += 1;
        if count > limit {
            return Err(PlanningError::IterationLimit {
                stage: "weak component resolution".to_string(),
                limit,
            });
        }
        let Some(g) = determine_induced_minimal_nodes(
            env,
            &search_graph,
            &terminals,
            filter_downstream,
            accept_partial,
            &synonyms,
        ) else {
            break;
        };
        if g.node_count() == 0 || g.connected_components().len() != 1 {
            break;
        }
        let new: Vec<NodeId> = g
            .concept_nodes()
            .into_iter()
            .filter(|n| n.address().is_some_and(|a| !search.contains(a)))
            .collect();
        for node in &new {
            search_graph.remove_node(node);
        }
        let bridges: BTreeSet<String> = new
            .iter()
            .filter_map(|n| n.address())
            .filter(|a| !synonyms.contains(*a))
            .map(str::to_string)
            .collect();
        trace!(round = count, bridges = ?bridges, "found connecting subgraph");
        found.push(g);
        bridge_sets.push(bridges);
        if new.is_empty() {
            break;
        }
    }
    let Some(first) = found.first() else {
        return Ok(None);
    };

    detect_ambiguity(concepts, &bridge_sets)?;

    let components = extract_ds_components(first, &search);
    let mut subgraphs = Vec::with_capacity(components.len());
    for component in components {
        let mut concepts = Vec::with_capacity(component.len());
        for address in component {
            concepts.push(env.concept(&address)?.clone());
        }
        if !concepts.is_empty() {
            subgraphs.push(concepts);
        }
    }
    Ok(Some(filter_duplicate_subgraphs(subgraphs)))
}

/// Reject incomparable bridge sets: every set must be contained in every
/// other for at least one candidate to exist.
fn detect_ambiguity(concepts: &[Concept], bridge_sets: &[BTreeSet<String>]) -> PlanningResult<()> {
    let has_candidate = bridge_sets
        .iter()
        .any(|set| bridge_sets.iter().all(|other| set.is_subset(other)));
    if has_candidate || bridge_sets.is_empty() {
        return Ok(());
    }
    let common = bridge_sets
        .iter()
        .skip(1)
        .fold(bridge_sets[0].clone(), |acc, set| {
            acc.intersection(set).cloned().collect()
        });
    let candidates = bridge_sets
        .iter()
        .map(|set| set.difference(&common).cloned().collect())
        .collect();
    Err(PlanningError::Ambiguous {
        targets: addresses(concepts),
        candidates,
    })
}

// ============================================================================
// Minimal connecting subgraph
// ============================================================================

/// Smallest subgraph of `graph` linking every terminal through datasources,
/// with every datasource edge into it restored.
///
/// Aggregates, filters and constants never bridge. With
/// `filter_downstream` only root concepts may appear between terminals.
fn determine_induced_minimal_nodes(
    env: &Environment,
    graph: &ReferenceGraph,
    terminals: &[NodeId],
    filter_downstream: bool,
    accept_partial: bool,
    synonyms: &BTreeSet<String>,
) -> Option<ReferenceGraph> {
    let excluded: BTreeSet<NodeId> = graph
        .concept_nodes()
        .into_iter()
        .filter(|node| match graph.concept(node) {
            Some(concept) => {
                matches!(
                    concept.derivation,
                    Derivation::Constant | Derivation::Aggregate | Derivation::Filter
                ) || (filter_downstream && concept.derivation != Derivation::Root)
            }
            None => false,
        })
        .collect();
    let mut h = graph.without(&excluded);

    let isolates: BTreeSet<NodeId> = h.nodes().into_iter().filter(|n| h.degree(n) == 0).collect();
    if !isolates.is_empty() {
        h = h.without(&isolates);
    }
    // dead ends cannot bridge anything
    loop {
        let dead: BTreeSet<NodeId> = h
            .nodes()
            .into_iter()
            .filter(|n| graph.successors(n).is_empty() && !terminals.contains(n))
            .collect();
        if dead.is_empty() {
            break;
        }
        h = h.without(&dead);
    }

    let tree = steiner::steiner_tree(&h, terminals)?;
    if tree.is_empty() {
        return None;
    }
    let mut final_graph = graph.subgraph(&tree);

    for (from, to) in graph.edges() {
        if !from.is_datasource() || !final_graph.contains(&to) {
            continue;
        }
        let Some(payload) = graph.datasource(&from) else {
            continue;
        };
        if let (GraphDatasource::Single(ds), Some(address)) = (payload, to.address()) {
            if !accept_partial && ds.partial_concepts().iter().any(|p| p == address) {
                continue;
            }
        }
        if !final_graph.contains(&from) {
            final_graph.add_datasource_node(payload.clone());
        }
        final_graph.add_edge(&from, &to);
    }

    reinject_common_join_keys(env, graph, &mut final_graph, synonyms);

    let sourced = terminals
        .iter()
        .all(|t| final_graph.contains(t) && final_graph.in_degree(t) > 0);
    if !sourced {
        trace!(terminals = ?terminals, "connecting subgraph leaves a terminal unsourced");
        return None;
    }
    Some(final_graph)
}

/// Add every further key shared by two datasources in the same component
/// as an explicit join concept.
fn reinject_common_join_keys(
    env: &Environment,
    graph: &ReferenceGraph,
    final_graph: &mut ReferenceGraph,
    synonyms: &BTreeSet<String>,
) {
    for component in final_graph.connected_components() {
        let datasources: Vec<NodeId> = component
            .iter()
            .filter(|n| n.is_datasource())
            .cloned()
            .collect();
        for (i, left) in datasources.iter().enumerate() {
            for right in &datasources[i + 1..] {
                let (Some(GraphDatasource::Single(a)), Some(GraphDatasource::Single(b))) =
                    (graph.datasource(left), graph.datasource(right))
                else {
                    continue;
                };
                let common: Vec<&Concept> = a
                    .output_concepts()
                    .iter()
                    .filter(|address| b.provides(address))
                    .filter_map(|address| env.concepts.get(address))
                    .collect();
                let reduced = Grain::from_concepts(common.iter().copied());
                let existing: BTreeSet<&str> = common
                    .iter()
                    .filter(|c| final_graph.contains(&NodeId::concept(c)))
                    .map(|c| c.address.as_str())
                    .collect();
                for concept in &common {
                    if synonyms.contains(&concept.address)
                        || !reduced.contains(&concept.address)
                        || concept.pseudonyms.iter().any(|p| existing.contains(p.as_str()))
                    {
                        continue;
                    }
                    let node = final_graph.add_concept_node(concept);
                    if final_graph.has_edge(left, &node) && final_graph.has_edge(right, &node) {
                        continue;
                    }
                    final_graph.add_edge(left, &node);
                    final_graph.add_edge(right, &node);
                    trace!(concept = %concept.address, left = %left, right = %right, "reinjected common join key");
                }
            }
        }
    }
}

// ============================================================================
// Splitting into sourceable pieces
// ============================================================================

/// One concept group per datasource: the concepts it is linked to directly.
///
/// Of two pseudonyms on the same datasource only one is kept, preferring the
/// one that was searched for. Concepts no datasource reaches stand alone.
fn extract_ds_components(graph: &ReferenceGraph, search: &BTreeSet<&str>) -> Vec<Vec<String>> {
    let concept_nodes = graph.concept_nodes();
    let mut components: Vec<Vec<String>> = Vec::new();
    for ds in graph.datasource_nodes() {
        let mut linked: Vec<NodeId> = graph
            .successors(&ds)
            .into_iter()
            .filter(NodeId::is_concept)
            .collect();
        let mut dropped = BTreeSet::new();
        for (i, a) in linked.iter().enumerate() {
            for b in &linked[i + 1..] {
                if !graph.is_pseudonym_edge(a, b) || dropped.contains(a) || dropped.contains(b) {
                    continue;
                }
                let keep_b = b.address().is_some_and(|x| search.contains(x))
                    && !a.address().is_some_and(|x| search.contains(x));
                dropped.insert(if keep_b { a.clone() } else { b.clone() });
            }
        }
        linked.retain(|n| !dropped.contains(n));
        let mut component: Vec<String> = linked
            .iter()
            .filter_map(|n| n.address().map(str::to_string))
            .collect();
        component.sort();
        component.dedup();
        if !component.is_empty() {
            components.push(component);
        }
    }
    if components.is_empty() {
        let mut all: Vec<String> = concept_nodes
            .iter()
            .filter_map(|n| n.address().map(str::to_string))
            .collect();
        all.dedup();
        return vec![all];
    }

    let mut components = filter_unique(components);
    for node in &concept_nodes {
        let Some(address) = node.address() else {
            continue;
        };
        if !components.iter().any(|c| c.iter().any(|a| a == address)) {
            components.push(vec![address.to_string()]);
        }
    }
    components
}

/// Drop repeated groups and groups strictly contained in another.
fn filter_unique(groups: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let sets: Vec<BTreeSet<&String>> = groups.iter().map(|g| g.iter().collect()).collect();
    let mut seen: BTreeSet<Vec<String>> = BTreeSet::new();
    let mut out = Vec::new();
    for (i, group) in groups.iter().enumerate() {
        let contained = sets
            .iter()
            .enumerate()
            .any(|(j, other)| j != i && sets[i].is_subset(other) && sets[i] != *other);
        if contained || !seen.insert(group.clone()) {
            continue;
        }
        out.push(group.clone());
    }
    out
}

/// Drop subgraphs whose concepts are a strict subset of another's.
fn filter_duplicate_subgraphs(subgraphs: Vec<Vec<Concept>>) -> Vec<Vec<Concept>> {
    let sets: Vec<BTreeSet<&str>> = subgraphs
        .iter()
        .map(|s| s.iter().map(|c| c.address.as_str()).collect())
        .collect();
    let keep: Vec<bool> = sets
        .iter()
        .map(|set| !sets.iter().any(|other| set.is_subset(other) && set != other))
        .collect();
    subgraphs
        .into_iter()
        .zip(keep)
        .filter_map(|(subgraph, keep)| keep.then_some(subgraph))
        .collect()
}
