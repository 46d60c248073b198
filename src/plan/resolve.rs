//! Per-kind resolution of plan nodes into [`ResolvedDatasource`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::PlanningResult;
use crate::model::{Derivation, Environment, Grain};

use super::arena::PlanArena;
use super::grouping::check_if_group_required;
use super::joins::{find_nullable_concepts, get_node_joins, resolve_join_order};
use super::node::{MergeNode, NodeCore, NodeJoin, PlanNode, SelectNode, UnnestNode};
use super::resolved::{
    build_identifier, BaseJoin, ConceptPair, JoinType, ResolvedDatasource, ResolvedJoin,
    ResolvedSource, SourceType, UnnestJoin,
};

/// Map each concept to the parent sources that provide it.
///
/// Complete providers win; partial providers are used only for inherited
/// inputs nothing else provides. Targets not inherited are computed here
/// and map to an empty set. Concepts keyed by a full join collect every
/// provider.
pub fn resolve_concept_map(
    inputs: &[ResolvedSource],
    targets: &[String],
    inherited: &[String],
    full_joins: &[String],
) -> BTreeMap<String, BTreeSet<String>> {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for input in inputs {
        let partial = input.partial_concepts();
        for concept in input.output_concepts() {
            if partial.contains(&concept) || input.is_hidden(&concept) {
                continue;
            }
            if full_joins.contains(&concept) || !map.contains_key(&concept) {
                map.entry(concept)
                    .or_default()
                    .insert(input.identifier().to_string());
            }
        }
    }
    for input in inputs {
        for concept in input.output_concepts() {
            if !inherited.contains(&concept) || input.is_hidden(&concept) {
                continue;
            }
            let entry = map.entry(concept).or_default();
            if entry.is_empty() {
                entry.insert(input.identifier().to_string());
            }
        }
    }
    for target in targets {
        if !inherited.contains(target) {
            map.insert(target.clone(), BTreeSet::new());
        }
    }
    map
}

pub(crate) fn resolve_node(
    arena: &PlanArena,
    node: &PlanNode,
    parents: Vec<Rc<ResolvedDatasource>>,
) -> PlanningResult<ResolvedDatasource> {
    let env = arena.environment();
    let sources: Vec<ResolvedSource> = parents.into_iter().map(ResolvedSource::Query).collect();
    match node {
        PlanNode::Select(select) => resolve_select(env, select, sources),
        PlanNode::Constant(core) => Ok(resolve_constant(core)),
        PlanNode::Group(core) => resolve_group(env, core, sources),
        PlanNode::Merge(merge) => resolve_merge(arena, merge, sources),
        PlanNode::Unnest(unnest) => resolve_unnest(env, unnest, sources),
        PlanNode::Filter(core)
        | PlanNode::Window(core)
        | PlanNode::Recursive(core)
        | PlanNode::Union(core) => resolve_base(env, core, sources, node.source_type()),
    }
}

fn inherited(core: &NodeCore) -> Vec<String> {
    let mut out = core.input_concepts.clone();
    for concept in &core.existence_concepts {
        if !out.contains(concept) {
            out.push(concept.clone());
        }
    }
    out
}

fn resolve_base(
    env: &Environment,
    core: &NodeCore,
    sources: Vec<ResolvedSource>,
    source_type: SourceType,
) -> PlanningResult<ResolvedDatasource> {
    let grain = match &core.grain {
        Some(grain) => grain.clone(),
        None => Grain::from_concepts(env.concepts_for(&core.output_concepts)?.iter()),
    };
    let source_map = resolve_concept_map(&sources, &core.output_concepts, &inherited(core), &[]);
    let identifier = build_identifier(
        &source_type.to_string(),
        &sources,
        &grain,
        core.conditions.as_ref(),
    );
    Ok(ResolvedDatasource {
        identifier,
        source_type,
        input_concepts: core.input_concepts.clone(),
        output_concepts: core.output_concepts.clone(),
        hidden_concepts: core.hidden_concepts.clone(),
        partial_concepts: core.partial_concepts.clone(),
        nullable_concepts: core.nullable_concepts.clone(),
        datasources: sources,
        source_map,
        joins: Vec::new(),
        grain,
        condition: core.conditions.clone(),
        force_group: core.force_group,
    })
}

fn resolve_constant(core: &NodeCore) -> ResolvedDatasource {
    let grain = Grain::abstract_grain();
    ResolvedDatasource {
        identifier: build_identifier("constant", &[], &grain, core.conditions.as_ref()),
        source_type: SourceType::Constant,
        input_concepts: Vec::new(),
        output_concepts: core.output_concepts.clone(),
        hidden_concepts: core.hidden_concepts.clone(),
        partial_concepts: Vec::new(),
        nullable_concepts: Vec::new(),
        datasources: Vec::new(),
        source_map: core
            .output_concepts
            .iter()
            .map(|c| (c.clone(), BTreeSet::new()))
            .collect(),
        joins: Vec::new(),
        grain,
        condition: core.conditions.clone(),
        force_group: None,
    }
}

fn resolve_select(
    env: &Environment,
    select: &SelectNode,
    parents: Vec<ResolvedSource>,
) -> PlanningResult<ResolvedDatasource> {
    let core = &select.core;
    let outputs = env.concepts_for(&core.output_concepts)?;
    if !outputs.is_empty() && outputs.iter().all(|c| c.derivation == Derivation::Constant) {
        return Ok(resolve_constant(core));
    }
    let datasource = &select.datasource;
    let mut source_map: BTreeMap<String, BTreeSet<String>> = core
        .input_concepts
        .iter()
        .map(|c| (c.clone(), BTreeSet::from([datasource.identifier.clone()])))
        .collect();
    for concept in &outputs {
        if source_map.contains_key(&concept.address) {
            continue;
        }
        if datasource.provides(&concept.address) {
            source_map.insert(
                concept.address.clone(),
                BTreeSet::from([datasource.identifier.clone()]),
            );
        } else if matches!(
            concept.derivation,
            Derivation::Multiselect | Derivation::Filter | Derivation::Basic | Derivation::Rowset
        ) {
            source_map.insert(concept.address.clone(), BTreeSet::new());
        }
    }

    // Without grouping the rows stay at the datasource grain
    let grain = match (core.force_group, &core.grain) {
        (Some(false), _) | (_, None) => datasource.grain.clone(),
        (_, Some(grain)) => grain.clone(),
    };
    let mut sources = vec![ResolvedSource::Datasource(datasource.clone())];
    if !parents.is_empty() {
        let parent_map =
            resolve_concept_map(&parents, &core.output_concepts, &inherited(core), &[]);
        for (address, providers) in parent_map {
            if !providers.is_empty() && !source_map.contains_key(&address) {
                source_map.insert(address, providers);
            }
        }
        sources.extend(parents);
    }
    let identifier = build_identifier("select", &sources, &grain, core.conditions.as_ref());
    Ok(ResolvedDatasource {
        identifier,
        source_type: SourceType::Select,
        input_concepts: core.input_concepts.clone(),
        output_concepts: core.output_concepts.clone(),
        hidden_concepts: core.hidden_concepts.clone(),
        partial_concepts: core.partial_concepts.clone(),
        nullable_concepts: core.nullable_concepts.clone(),
        datasources: sources,
        source_map,
        joins: Vec::new(),
        grain,
        condition: core.conditions.clone(),
        force_group: core.force_group,
    })
}

fn resolve_group(
    env: &Environment,
    core: &NodeCore,
    parents: Vec<ResolvedSource>,
) -> PlanningResult<ResolvedDatasource> {
    let check = check_if_group_required(env, &core.output_concepts, &parents)?;
    let source_type = if !check.required && core.force_group != Some(true) {
        SourceType::Select
    } else {
        debug!(
            upstream = %check.upstream,
            target = %check.target,
            "group node differs from parent grain, grouping"
        );
        SourceType::Group
    };
    let mut targets = core.output_concepts.clone();
    if let Some(condition) = &core.conditions {
        for arg in condition.concept_arguments() {
            if !targets.contains(&arg) {
                targets.push(arg);
            }
        }
    }
    let source_map = resolve_concept_map(&parents, &targets, &inherited(core), &[]);
    let nullable_addresses = find_nullable_concepts(&source_map, &parents, &[]);
    let nullable: Vec<String> = core
        .output_concepts
        .iter()
        .filter(|c| nullable_addresses.contains(c))
        .cloned()
        .collect();
    let grain = check.target;
    let identifier = build_identifier(
        &source_type.to_string(),
        &parents,
        &grain,
        core.conditions.as_ref(),
    );
    let mut base = ResolvedDatasource {
        identifier,
        source_type,
        input_concepts: core.input_concepts.clone(),
        output_concepts: core.output_concepts.clone(),
        hidden_concepts: core.hidden_concepts.clone(),
        partial_concepts: core.partial_concepts.clone(),
        nullable_concepts: nullable,
        datasources: parents,
        source_map,
        joins: Vec::new(),
        grain: grain.clone(),
        condition: core.conditions.clone(),
        force_group: core.force_group,
    };

    // A condition over aggregates is applied in a layer above the grouping
    let Some(condition) = core.conditions.as_ref() else {
        return Ok(base);
    };
    if condition.is_scalar(env, None) {
        return Ok(base);
    }
    base.condition = None;
    for arg in condition.row_arguments() {
        if !base.output_concepts.contains(&arg) {
            base.output_concepts.push(arg);
        }
    }
    let visible: BTreeSet<String> = base.output_concepts.iter().cloned().collect();
    base.hidden_concepts.retain(|h| !visible.contains(h));
    base.identifier = build_identifier(
        &base.source_type.to_string(),
        &base.datasources,
        &grain,
        None,
    );
    let base_outputs = base.output_concepts.clone();
    let nullable = base.nullable_concepts.clone();
    let wrapped = vec![ResolvedSource::Query(Rc::new(base))];
    let source_map = resolve_concept_map(&wrapped, &core.output_concepts, &base_outputs, &[]);
    Ok(ResolvedDatasource {
        identifier: build_identifier("select", &wrapped, &grain, Some(condition)),
        source_type: SourceType::Select,
        input_concepts: base_outputs,
        output_concepts: core.output_concepts.clone(),
        hidden_concepts: core.hidden_concepts.clone(),
        partial_concepts: core.partial_concepts.clone(),
        nullable_concepts: nullable,
        datasources: wrapped,
        source_map,
        joins: Vec::new(),
        grain,
        condition: Some(condition.clone()),
        force_group: None,
    })
}

fn resolve_unnest(
    env: &Environment,
    unnest: &UnnestNode,
    parents: Vec<ResolvedSource>,
) -> PlanningResult<ResolvedDatasource> {
    let mut base = resolve_base(env, &unnest.core, parents, SourceType::Unnest)?;
    let names: BTreeSet<String> = unnest
        .unnest_concepts
        .iter()
        .map(|c| c.replace('.', "_"))
        .collect();
    let alias = format!(
        "unnest_{}",
        names.into_iter().collect::<Vec<_>>().join("_")
    );
    base.joins.push(ResolvedJoin::Unnest(UnnestJoin {
        concepts: unnest.unnest_concepts.clone(),
        alias: alias.clone(),
    }));
    for concept in &unnest.unnest_concepts {
        base.source_map
            .insert(concept.clone(), BTreeSet::from([alias.clone()]));
    }
    Ok(base)
}

// ============================================================================
// Merge resolution
// ============================================================================

/// Drop parents whose complete outputs and grain are covered by another
/// unconditioned, fully complete parent.
fn deduplicate_sources(merged: &mut Vec<ResolvedSource>) -> BTreeSet<String> {
    let mut removed = BTreeSet::new();
    loop {
        let sets: Vec<BTreeSet<String>> = merged
            .iter()
            .map(|s| {
                let partial = s.partial_concepts();
                s.output_concepts()
                    .into_iter()
                    .filter(|c| !partial.contains(c))
                    .collect()
            })
            .collect();
        let mut drop: Option<usize> = None;
        'outer: for (i, a) in merged.iter().enumerate() {
            for (j, b) in merged.iter().enumerate() {
                if i == j {
                    continue;
                }
                if sets[i].is_subset(&sets[j])
                    && a.grain().issubset(b.grain())
                    && a.partial_concepts().is_empty()
                    && b.partial_concepts().is_empty()
                    && a.condition().is_none()
                    && b.condition().is_none()
                {
                    drop = Some(i);
                    break 'outer;
                }
            }
        }
        let Some(index) = drop else {
            break;
        };
        let source = merged.remove(index);
        debug!(source = %source.identifier(), "dropping parent covered by a sibling");
        removed.insert(source.identifier().to_string());
    }
    removed
}

fn resolve_merge(
    arena: &PlanArena,
    merge: &MergeNode,
    parents: Vec<ResolvedSource>,
) -> PlanningResult<ResolvedDatasource> {
    let env = arena.environment();
    let core = &merge.core;

    // Combine parents that resolved to the same relation
    let mut merged: Vec<ResolvedSource> = Vec::new();
    for source in parents {
        match merged
            .iter_mut()
            .find(|m| m.identifier() == source.identifier())
        {
            Some(existing) => {
                if let (ResolvedSource::Query(a), ResolvedSource::Query(b)) = (&*existing, &source) {
                    *existing = ResolvedSource::Query(Rc::new(a.merged_with(b)));
                }
            }
            None => merged.push(source),
        }
    }
    let removed = deduplicate_sources(&mut merged);

    let node_joins = match &merge.node_joins {
        Some(joins) => {
            let mut kept = Vec::new();
            for join in joins {
                let left = arena.resolve(join.left)?;
                let right = arena.resolve(join.right)?;
                if left.identifier == right.identifier
                    || removed.contains(&left.identifier)
                    || removed.contains(&right.identifier)
                {
                    continue;
                }
                kept.push(join.clone());
            }
            Some(kept)
        }
        None => None,
    };

    let own_outputs: BTreeSet<&String> = core.output_concepts.iter().collect();
    if let [single] = merged.as_slice() {
        if let ResolvedSource::Query(query) = single {
            let outputs: BTreeSet<&String> = query.output_concepts.iter().collect();
            if outputs == own_outputs && core.conditions.is_none() {
                trace!("merge has one parent with identical outputs, returning parent");
                return Ok(query.as_ref().clone());
            }
        }
    }
    for dataset in &merged {
        let ResolvedSource::Query(query) = dataset else {
            continue;
        };
        let full: BTreeSet<String> = query.full_concepts().into_iter().collect();
        if core.conditions.is_none() && core.output_concepts.iter().all(|c| full.contains(c)) {
            trace!(parent = %query.identifier, "parent covers every merge output");
            return Ok(query.as_ref().clone());
        }
    }

    let pregrain = merged
        .iter()
        .fold(Grain::abstract_grain(), |acc, s| acc.union(s.grain()));
    let grain = core.grain.clone().unwrap_or_else(|| pregrain.clone());

    let (existence_only, candidates): (Vec<ResolvedSource>, Vec<ResolvedSource>) =
        merged.iter().cloned().partition(|s| {
            let outputs = s.output_concepts();
            !outputs.is_empty()
                && !core.existence_concepts.is_empty()
                && outputs.iter().all(|o| core.existence_concepts.contains(o))
        });
    let joins: Vec<ResolvedJoin> = if candidates.len() > 1 {
        generate_joins(arena, &candidates, node_joins.as_deref(), &pregrain, env)?
    } else {
        Vec::new()
    };
    debug!(
        parents = candidates.len(),
        existence = existence_only.len(),
        joins = joins.len(),
        grain = %grain,
        "resolved merge"
    );

    let mut full_join_concepts: Vec<String> = Vec::new();
    for join in &joins {
        if let ResolvedJoin::Base(base) = join {
            if base.join_type == JoinType::Full {
                full_join_concepts.extend(base.keys());
            }
        }
    }

    let force_group = if core.whole_grain || core.force_group == Some(false) {
        Some(false)
    } else if !merged.iter().any(|d| d.grain().issubset(&grain)) && !pregrain.issubset(&grain) {
        Some(true)
    } else {
        None
    };

    let source_map = resolve_concept_map(
        &merged,
        &core.output_concepts,
        &inherited(core),
        &full_join_concepts,
    );
    let nullable_addresses = find_nullable_concepts(&source_map, &merged, &joins);
    let identifier = build_identifier("merge", &merged, &grain, core.conditions.as_ref());
    Ok(ResolvedDatasource {
        identifier,
        source_type: SourceType::Merge,
        input_concepts: core.input_concepts.clone(),
        output_concepts: core.output_concepts.clone(),
        hidden_concepts: core.hidden_concepts.clone(),
        partial_concepts: core.partial_concepts.clone(),
        nullable_concepts: core
            .output_concepts
            .iter()
            .filter(|c| nullable_addresses.contains(c))
            .cloned()
            .collect(),
        datasources: merged,
        source_map,
        joins,
        grain,
        condition: core.conditions.clone(),
        force_group,
    })
}

fn generate_joins(
    arena: &PlanArena,
    datasets: &[ResolvedSource],
    node_joins: Option<&[NodeJoin]>,
    pregrain: &Grain,
    env: &Environment,
) -> PlanningResult<Vec<ResolvedJoin>> {
    let mut ordered: Vec<ResolvedSource> = datasets.to_vec();
    ordered.sort_by_key(|d| std::cmp::Reverse(d.grain().len()));
    match node_joins {
        None if pregrain.is_abstract() => Ok(create_full_joins(&ordered)),
        None => Ok(get_node_joins(&ordered, env)
            .into_iter()
            .map(ResolvedJoin::Base)
            .collect()),
        Some(joins) if joins.is_empty() => Ok(Vec::new()),
        Some(joins) => {
            let mut out = Vec::new();
            for join in resolve_join_order(joins)? {
                let left = arena.resolve(join.left)?;
                let right = arena.resolve(join.right)?;
                let concept_pairs = join
                    .concepts
                    .iter()
                    .map(|c| ConceptPair {
                        left: c.clone(),
                        right: c.clone(),
                        existing: left.identifier.clone(),
                    })
                    .collect();
                out.push(ResolvedJoin::Base(BaseJoin {
                    left: Some(left.identifier.clone()),
                    right: right.identifier.clone(),
                    join_type: join.join_type,
                    concept_pairs,
                }));
            }
            Ok(out)
        }
    }
}

fn create_full_joins(datasets: &[ResolvedSource]) -> Vec<ResolvedJoin> {
    let Some((first, rest)) = datasets.split_first() else {
        return Vec::new();
    };
    rest.iter()
        .map(|right| {
            ResolvedJoin::Base(BaseJoin {
                left: Some(first.identifier().to_string()),
                right: right.identifier().to_string(),
                join_type: JoinType::Full,
                concept_pairs: Vec::new(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, Datasource};

    fn ds(name: &str, columns: &[(&str, bool)]) -> ResolvedSource {
        let columns = columns
            .iter()
            .map(|(c, complete)| {
                let column = Column::new(c, c);
                if *complete {
                    column
                } else {
                    column.partial()
                }
            })
            .collect();
        ResolvedSource::Datasource(Datasource::new(name, columns, ["id"]))
    }

    #[test]
    fn test_complete_sources_win() {
        let inputs = vec![
            ds("partial", &[("id", true), ("cat", false)]),
            ds("full", &[("id", true), ("cat", true)]),
        ];
        let map = resolve_concept_map(&inputs, &[], &[], &[]);
        assert_eq!(map["local.cat"], BTreeSet::from(["full".to_string()]));
        assert_eq!(map["local.id"], BTreeSet::from(["partial".to_string()]));
    }

    #[test]
    fn test_partial_fallback_for_inherited_inputs() {
        let inputs = vec![ds("partial", &[("id", true), ("cat", false)])];
        let map = resolve_concept_map(&inputs, &[], &["local.cat".to_string()], &[]);
        assert_eq!(map["local.cat"], BTreeSet::from(["partial".to_string()]));
    }

    #[test]
    fn test_targets_computed_here_have_no_source() {
        let inputs = vec![ds("items", &[("id", true)])];
        let map = resolve_concept_map(
            &inputs,
            &["local.total".to_string()],
            &["local.id".to_string()],
            &[],
        );
        assert!(map["local.total"].is_empty());
    }

    #[test]
    fn test_full_join_keys_collect_every_provider() {
        let inputs = vec![ds("a", &[("id", true)]), ds("b", &[("id", true)])];
        let map = resolve_concept_map(&inputs, &[], &[], &["local.id".to_string()]);
        assert_eq!(map["local.id"].len(), 2);
    }
}
