//! Direct datasource matches.
//!
//! Prunes the reference graph down to datasources that touch the targets,
//! requires the survivors to form one connected component, and emits one
//! Select per datasource (merged when more than one is needed).

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::graph::{prune_sources_for_conditions, GraphDatasource, NodeId, ReferenceGraph};
use crate::model::{
    ComparisonOp, Concept, Condition, DataType, Datasource, Derivation, Environment, Expr, Grain,
    Literal,
};
use crate::plan::{NodeCore, PlanArena, PlanId, PlanNode};

use super::enrichment::addresses;

// ============================================================================
// Entry point
// ============================================================================

/// Source `targets` straight from datasources, without any derivation.
///
/// Constants ride along in a separate Constant parent. Returns `None` when
/// no single connected set of datasources covers every non-constant target.
pub(crate) fn gen_select_merge_node(
    planner: &mut Planner,
    targets: &[Concept],
    depth: usize,
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let (mut constants, non_constant): (Vec<Concept>, Vec<Concept>) = targets
        .iter()
        .cloned()
        .partition(|c| c.derivation == Derivation::Constant);

    if non_constant.is_empty() {
        if let Some(condition) = conditions {
            let row_args = env.concepts_for(&condition.row_arguments())?;
            if !row_args.iter().all(|c| c.derivation == Derivation::Constant) {
                debug!(depth, condition = %condition, "condition over non-constants cannot be applied to constants");
                return Ok(None);
            }
            constants.extend(row_args);
        }
        let outputs = addresses(&constants);
        let core = NodeCore::new(Vec::new(), outputs)
            .with_depth(depth)
            .with_conditions(conditions.cloned());
        return Ok(Some(planner.arena.insert(PlanNode::Constant(core))));
    }

    let mut attempts = vec![false];
    if accept_partial {
        attempts.push(true);
    }
    let mut pruned = None;
    for attempt in attempts {
        pruned =
            create_pruned_concept_graph(&env, &planner.graph, &non_constant, attempt, conditions);
        if pruned.is_some() {
            debug!(depth, partial = attempt, "found covering datasource graph");
            break;
        }
    }
    let Some(pruned) = pruned else {
        debug!(depth, concepts = ?addresses(targets), "no covering datasource graph");
        return Ok(None);
    };

    let subgraphs = resolve_subgraphs(&pruned, &non_constant, conditions);
    trace!(depth, subgraphs = subgraphs.len(), "resolved datasource subgraphs");
    let mut parents = Vec::new();
    for (ds_node, nodes) in &subgraphs {
        let Some(datasource) = pruned.datasource(ds_node) else {
            continue;
        };
        let mut concepts = Vec::new();
        for node in nodes {
            if let Some(address) = node.address() {
                concepts.push(env.concept(address)?.clone());
            }
        }
        let parent = create_select_node(
            &mut planner.arena,
            datasource,
            &concepts,
            accept_partial,
            depth,
            conditions,
        );
        parents.push(parent);
    }
    if parents.is_empty() {
        return Ok(None);
    }

    if !constants.is_empty() {
        let core = NodeCore::new(Vec::new(), addresses(&constants))
            .with_depth(depth)
            .with_preexisting(conditions.cloned());
        parents.push(planner.arena.insert(PlanNode::Constant(core)));
    }
    if let [single] = parents.as_slice() {
        return Ok(Some(*single));
    }

    debug!(depth, parents = parents.len(), "multiple datasources resolved, wrapping in merge");
    let preexisting = conditions.filter(|condition| {
        parents
            .iter()
            .all(|p| planner.arena.core(*p).preexisting_conditions.as_ref() == Some(*condition))
    });
    let core = NodeCore::new(addresses(&non_constant), addresses(targets))
        .with_parents(parents)
        .with_depth(depth)
        .with_preexisting(preexisting.cloned());
    Ok(Some(planner.arena.insert(PlanNode::merge(core, None))))
}

// ============================================================================
// Graph pruning
// ============================================================================

/// Concept nodes a datasource provides only partially. A conditional
/// extract queried under its own condition is complete; unions never are
/// partial.
fn partial_nodes(
    env: &Environment,
    graph: &ReferenceGraph,
    ds_node: &NodeId,
    conditions: Option<&Condition>,
) -> BTreeSet<NodeId> {
    let Some(GraphDatasource::Single(ds)) = graph.datasource(ds_node) else {
        return BTreeSet::new();
    };
    if ds.non_partial_for.is_some() && ds.non_partial_for.as_ref() == conditions {
        return BTreeSet::new();
    }
    ds.partial_concepts()
        .iter()
        .filter_map(|address| env.concepts.get(address))
        .map(NodeId::concept)
        .collect()
}

/// Datasources usable as-is under `conditions`.
fn exact_matches(
    graph: &ReferenceGraph,
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> BTreeSet<NodeId> {
    graph
        .datasource_nodes()
        .into_iter()
        .filter(|node| match graph.datasource(node) {
            Some(GraphDatasource::Union(_)) => true,
            Some(GraphDatasource::Single(ds)) => match (conditions, &ds.non_partial_for) {
                (None, None) => true,
                (None, Some(_)) => accept_partial,
                (Some(condition), Some(extract)) => condition == extract,
                (Some(_), None) => false,
            },
            None => false,
        })
        .collect()
}

/// Working copy of the graph holding only datasources that provide a
/// target, the targets, and concepts that join two of those datasources.
///
/// Returns `None` unless exactly one connected component covers every
/// target with a datasource edge.
fn create_pruned_concept_graph(
    env: &Environment,
    graph: &ReferenceGraph,
    targets: &[Concept],
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> Option<ReferenceGraph> {
    let mut g = graph.clone();
    for group in get_union_sources(env, targets) {
        let name = group
            .iter()
            .map(|ds| ds.identifier.as_str())
            .collect::<Vec<_>>()
            .join("-");
        trace!(datasource = %name, "injecting union datasource");
        let common: Vec<String> = group
            .first()
            .map(|first| first.output_concepts())
            .unwrap_or_default()
            .into_iter()
            .filter(|address| group.iter().all(|ds| ds.provides(address)))
            .collect();
        let ds_node = g.add_datasource_node(GraphDatasource::Union(group));
        for address in common {
            if let Some(concept) = env.concepts.get(&address) {
                let c_node = NodeId::concept(concept);
                g.add_edge(&ds_node, &c_node);
                g.add_edge(&c_node, &ds_node);
            }
        }
    }
    prune_sources_for_conditions(&mut g, accept_partial, conditions);

    let target_addresses: BTreeSet<&str> = targets.iter().map(|c| c.address.as_str()).collect();
    let relevant_targets: BTreeSet<NodeId> = g
        .concept_nodes()
        .into_iter()
        .filter(|n| n.address().is_some_and(|a| target_addresses.contains(a)))
        .collect();

    if !accept_partial {
        for ds_node in g.datasource_nodes() {
            for c_node in partial_nodes(env, &g, &ds_node, conditions) {
                g.remove_edge(&ds_node, &c_node);
                g.remove_edge(&c_node, &ds_node);
            }
        }
    }

    let relevant_datasets: BTreeSet<NodeId> = g
        .datasource_nodes()
        .into_iter()
        .filter(|ds| g.neighbors(ds).iter().any(|n| relevant_targets.contains(n)))
        .collect();

    // concepts shared by two relevant datasources are join keys
    let mut relevant = relevant_targets.clone();
    let mut roots: BTreeMap<String, BTreeSet<NodeId>> = BTreeMap::new();
    for node in graph.concept_nodes() {
        if relevant.contains(&node) {
            continue;
        }
        let Some(address) = node.address() else {
            continue;
        };
        let touching = roots.entry(address.to_string()).or_default();
        for neighbor in graph.neighbors(&node) {
            if relevant_datasets.contains(&neighbor) {
                touching.insert(neighbor);
            }
        }
        if touching.len() > 1 {
            relevant.insert(node);
        }
    }

    let keep: BTreeSet<NodeId> = relevant_datasets.union(&relevant).cloned().collect();
    let g = g.subgraph(&keep);
    let complete: Vec<BTreeSet<NodeId>> = g
        .connected_components()
        .into_iter()
        .filter(|component| subgraph_is_complete(&g, component, &target_addresses))
        .collect();
    let component = match complete.as_slice() {
        [single] => single.clone(),
        [] => {
            trace!("no complete component after pruning");
            return None;
        }
        _ => {
            trace!(components = complete.len(), "datasource graph is split");
            return None;
        }
    };

    let mut g = g.subgraph(&component);
    for (a, b) in graph.edges() {
        if component.contains(&a) && component.contains(&b) && !g.has_edge(&a, &b) {
            g.add_edge(&a, &b);
        }
    }
    if g.datasource_nodes().is_empty() {
        return None;
    }
    Some(g)
}

/// Every target appears in `component` and has a datasource neighbor.
fn subgraph_is_complete(
    graph: &ReferenceGraph,
    component: &BTreeSet<NodeId>,
    targets: &BTreeSet<&str>,
) -> bool {
    targets.iter().all(|target| {
        component.iter().any(|node| {
            node.address() == Some(*target)
                && graph.neighbors(node).iter().any(NodeId::is_datasource)
        })
    })
}

// ============================================================================
// Subgraph resolution
// ============================================================================

/// Pick the datasources to read and the concepts each contributes.
///
/// A datasource whose concepts are a strict subset of another's is dropped;
/// among datasources with identical coverage the best scored one wins.
/// Join concepts left with a single user are dropped.
fn resolve_subgraphs(
    graph: &ReferenceGraph,
    relevant: &[Concept],
    conditions: Option<&Condition>,
) -> BTreeMap<NodeId, Vec<NodeId>> {
    let datasources = graph.datasource_nodes();
    let exact = exact_matches(graph, false, conditions);

    let mut subgraphs: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    let mut non_partial: BTreeMap<NodeId, BTreeSet<String>> = BTreeMap::new();
    let mut all: BTreeMap<NodeId, BTreeSet<String>> = BTreeMap::new();
    let mut grains: BTreeMap<NodeId, Grain> = BTreeMap::new();
    for ds in &datasources {
        let neighbors = graph.neighbors(ds);
        let partial: BTreeSet<String> = match graph.datasource(ds) {
            Some(GraphDatasource::Single(source))
                if !(source.non_partial_for.is_some()
                    && source.non_partial_for.as_ref() == conditions) =>
            {
                source.partial_concepts().into_iter().collect()
            }
            _ => BTreeSet::new(),
        };
        let concepts: BTreeSet<String> = neighbors
            .iter()
            .filter_map(|n| n.address().map(str::to_string))
            .collect();
        non_partial.insert(
            ds.clone(),
            concepts.difference(&partial).cloned().collect(),
        );
        all.insert(ds.clone(), concepts);
        grains.insert(
            ds.clone(),
            graph.datasource(ds).map(GraphDatasource::grain).unwrap_or_default(),
        );
        subgraphs.insert(ds.clone(), neighbors);
    }

    let score = |ds: &NodeId| {
        let grain = &grains[ds];
        let covered = all[ds].iter().filter(|a| grain.contains(a)).count();
        (
            grain.len().saturating_sub(covered),
            u8::from(!exact.contains(ds)),
            subgraphs[ds].len(),
            ds.clone(),
        )
    };

    let mut pruned: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for key in &datasources {
        let value = &non_partial[key];
        let concepts = &all[key];
        let mut is_subset = false;
        let mut matches: BTreeSet<NodeId> = BTreeSet::new();
        for other in &datasources {
            if other == key {
                continue;
            }
            let other_value = &non_partial[other];
            let other_concepts = &all[other];
            if !(value.is_subset(other_value) && concepts.is_subset(other_concepts)) {
                continue;
            }
            if value.len() < other_value.len() {
                trace!(datasource = %key, covered_by = %other, "dropping subset datasource");
                is_subset = true;
                break;
            }
            if value.len() == other_value.len() && concepts.len() == other_concepts.len() {
                matches.insert(other.clone());
                matches.insert(key.clone());
            }
        }
        if !is_subset && !matches.is_empty() {
            if let Some(best) = matches.iter().min_by_key(|ds| score(ds)) {
                is_subset = best != key;
            }
        }
        if !is_subset {
            pruned.insert(key.clone(), subgraphs[key].clone());
        }
    }

    let relevant_addresses: BTreeSet<&str> =
        relevant.iter().map(|c| c.address.as_str()).collect();
    let mut counts: BTreeMap<NodeId, usize> = BTreeMap::new();
    for nodes in pruned.values() {
        for node in nodes {
            if node.address().is_some_and(|a| !relevant_addresses.contains(a)) {
                *counts.entry(node.clone()).or_default() += 1;
            }
        }
    }
    let single_use: BTreeSet<NodeId> = counts
        .into_iter()
        .filter(|(_, count)| *count <= 1)
        .map(|(node, _)| node)
        .collect();
    if !single_use.is_empty() {
        trace!(nodes = ?single_use, "pruning join concepts with a single user");
        for nodes in pruned.values_mut() {
            nodes.retain(|n| !single_use.contains(n));
        }
    }
    pruned
}

// ============================================================================
// Node construction
// ============================================================================

fn create_select_node(
    arena: &mut PlanArena,
    datasource: &GraphDatasource,
    concepts: &[Concept],
    accept_partial: bool,
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanId {
    if concepts.iter().all(|c| c.derivation == Derivation::Constant) {
        let core = NodeCore::new(Vec::new(), addresses(concepts))
            .with_depth(depth)
            .with_preexisting(conditions.cloned());
        return arena.insert(PlanNode::Constant(core));
    }

    let (candidate, force_group) = match datasource {
        GraphDatasource::Single(ds) => {
            let (node, force_group) =
                create_datasource_node(ds, concepts, accept_partial, depth, conditions);
            (arena.insert(node), force_group)
        }
        GraphDatasource::Union(list) => {
            let mut parents = Vec::new();
            let mut force_group = false;
            for ds in list {
                let (node, group) =
                    create_datasource_node(ds, concepts, accept_partial, depth + 1, conditions);
                parents.push(arena.insert(node));
                force_group |= group;
            }
            let outputs = addresses(concepts);
            let core = NodeCore::new(outputs.clone(), outputs)
                .with_parents(parents)
                .with_depth(depth);
            (arena.insert(PlanNode::Union(core)), force_group)
        }
    };
    if !force_group {
        return candidate;
    }

    trace!(depth, datasource = %datasource.name(), "source requires group before consumption");
    let base = arena.core(candidate).clone();
    let outputs = addresses(concepts);
    let core = NodeCore::new(outputs.clone(), outputs)
        .with_parents(vec![candidate])
        .with_depth(depth + 1)
        .with_partial(base.partial_concepts)
        .with_nullable(base.nullable_concepts)
        .with_preexisting(base.preexisting_conditions)
        .with_force_group(Some(true));
    arena.insert(PlanNode::Group(core))
}

/// A Select over one datasource, and whether it must be grouped before its
/// rows reach the requested grain.
fn create_datasource_node(
    datasource: &Datasource,
    concepts: &[Concept],
    accept_partial: bool,
    depth: usize,
    conditions: Option<&Condition>,
) -> (PlanNode, bool) {
    let target_grain = Grain::from_concepts(concepts);
    let force_group = !datasource.grain.issubset(&target_grain) || datasource.grain.is_abstract();
    trace!(
        datasource = %datasource.identifier,
        grain = %datasource.grain,
        target = %target_grain,
        force_group,
        "built datasource node"
    );

    let requested: BTreeSet<&str> = concepts.iter().map(|c| c.address.as_str()).collect();
    let partial_is_full = conditions.is_some() && datasource.non_partial_for.as_ref() == conditions;
    let partial: Vec<String> = if partial_is_full {
        Vec::new()
    } else {
        datasource
            .partial_concepts()
            .into_iter()
            .filter(|c| requested.contains(c.as_str()))
            .collect()
    };
    let nullable: Vec<String> = datasource
        .nullable_concepts()
        .into_iter()
        .filter(|c| requested.contains(c.as_str()))
        .collect();

    let mut outputs = addresses(concepts);
    outputs.sort();
    let core = NodeCore::new(datasource.output_concepts(), outputs)
        .with_depth(depth)
        .with_grain(datasource.grain.clone())
        .with_partial(partial)
        .with_nullable(nullable)
        .with_preexisting(if partial_is_full {
            conditions.cloned()
        } else {
            None
        })
        .with_conditions(datasource.where_clause.clone());
    (
        PlanNode::select(core, datasource.clone(), accept_partial),
        force_group,
    )
}

// ============================================================================
// Union sources
// ============================================================================

/// Groups of conditional extracts that each provide every target and whose
/// conditions over one shared concept together cover every row.
pub(crate) fn get_union_sources(env: &Environment, targets: &[Concept]) -> Vec<Vec<Datasource>> {
    let mut by_key: BTreeMap<String, Vec<Datasource>> = BTreeMap::new();
    for ds in env.datasources.values() {
        let Some(extract) = &ds.non_partial_for else {
            continue;
        };
        let partial = ds.partial_concepts();
        if !targets.iter().all(|c| ds.provides(&c.address))
            || !targets.iter().any(|c| partial.contains(&c.address))
        {
            continue;
        }
        if let [key] = extract.concept_arguments().as_slice() {
            by_key.entry(key.clone()).or_default().push(ds.clone());
        }
    }
    by_key
        .into_values()
        .filter(|group| {
            let conditions: Vec<&Condition> =
                group.iter().filter_map(|ds| ds.non_partial_for.as_ref()).collect();
            simplify_conditions(env, &conditions)
        })
        .collect()
}

fn numeric_value(env: &Environment, expr: &Expr) -> Option<f64> {
    let literal = match expr {
        Expr::Literal(literal) => literal,
        Expr::Concept(address) => env
            .concepts
            .get(address)
            .and_then(|c| c.lineage.as_ref())
            .and_then(|l| l.constant_value())?,
        _ => return None,
    };
    match literal {
        Literal::Integer(v) => Some(*v as f64),
        Literal::Float(v) => Some(*v),
        _ => None,
    }
}

fn flip(op: ComparisonOp) -> ComparisonOp {
    match op {
        ComparisonOp::Gt => ComparisonOp::Lt,
        ComparisonOp::Gte => ComparisonOp::Lte,
        ComparisonOp::Lt => ComparisonOp::Gt,
        ComparisonOp::Lte => ComparisonOp::Gte,
        other => other,
    }
}

/// True if numeric range comparisons over each concept cover every value
/// exactly once.
pub(crate) fn simplify_conditions(env: &Environment, conditions: &[&Condition]) -> bool {
    let mut grouped: BTreeMap<String, Vec<(ComparisonOp, f64)>> = BTreeMap::new();
    for condition in conditions {
        let Condition::Comparison { left, op, right } = condition else {
            return false;
        };
        let (concept, op, value) = match (left, right) {
            (Expr::Concept(address), other) if numeric_value(env, left).is_none() => {
                match numeric_value(env, other) {
                    Some(value) => (address, *op, value),
                    None => return false,
                }
            }
            (other, Expr::Concept(address)) if numeric_value(env, right).is_none() => {
                match numeric_value(env, other) {
                    Some(value) => (address, flip(*op), value),
                    None => return false,
                }
            }
            _ => return false,
        };
        grouped
            .entry(concept.clone())
            .or_default()
            .push((op, value));
    }
    if grouped.is_empty() {
        return false;
    }

    grouped.iter().all(|(address, comparisons)| {
        let increment = match env.concepts.get(address).map(|c| &c.datatype) {
            Some(DataType::Integer) => 1.0,
            Some(DataType::Float) => 1e-7,
            _ => return false,
        };
        let mut ranges = Vec::with_capacity(comparisons.len());
        for (op, value) in comparisons {
            let range = match op {
                ComparisonOp::Gt => (value + increment, f64::INFINITY),
                ComparisonOp::Gte => (*value, f64::INFINITY),
                ComparisonOp::Lt => (f64::NEG_INFINITY, value - increment),
                ComparisonOp::Lte => (f64::NEG_INFINITY, *value),
                ComparisonOp::Eq => (*value, *value),
                _ => return false,
            };
            ranges.push(range);
        }
        is_fully_covered(f64::NEG_INFINITY, f64::INFINITY, ranges, increment)
    })
}

/// True if `ranges` cover `[start, end]` with no gap wider than `increment`
/// and no overlap.
pub(crate) fn is_fully_covered(
    start: f64,
    end: f64,
    mut ranges: Vec<(f64, f64)>,
    increment: f64,
) -> bool {
    ranges.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    let mut current_end = start;
    for (range_start, range_end) in ranges {
        // -inf minus -inf is NaN, which compares false: no gap
        if range_start - current_end > increment {
            return false;
        }
        if range_start < current_end {
            return false;
        }
        current_end = current_end.max(range_end);
    }
    current_end >= end
}
