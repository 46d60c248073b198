//! Join inference for merge resolution.
//!
//! Merges either carry explicit [`NodeJoin`]s (ordered by
//! [`resolve_join_order`]) or infer joins from the concepts their parents
//! share ([`get_node_joins`]).

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::error::{PlanningError, PlanningResult};
use crate::model::{Concept, Environment, Purpose};

use super::node::{NodeJoin, PlanId};
use super::resolved::{BaseJoin, ConceptPair, JoinType, ResolvedJoin, ResolvedSource};

// ============================================================================
// Explicit join ordering
// ============================================================================

/// Order explicit joins so every join's left side is already available.
///
/// The base join is the first whose left node never appears on a right
/// side. Joins whose both sides are already available are dropped.
pub fn resolve_join_order(joins: &[NodeJoin]) -> PlanningResult<Vec<NodeJoin>> {
    if joins.is_empty() {
        return Ok(Vec::new());
    }
    let lefts: BTreeSet<PlanId> = joins.iter().map(|j| j.left).collect();
    let rights: BTreeSet<PlanId> = joins.iter().map(|j| j.right).collect();
    let basis: BTreeSet<PlanId> = lefts.difference(&rights).copied().collect();

    let base = joins
        .iter()
        .find(|j| basis.contains(&j.left))
        .ok_or_else(|| PlanningError::JoinOrder {
            left: format_ids(&lefts),
            right: format_ids(&rights),
        })?;

    let mut available: BTreeSet<PlanId> = BTreeSet::from([base.left, base.right]);
    let mut ordered = vec![base.clone()];
    let mut pending: Vec<NodeJoin> = joins.iter().filter(|j| *j != base).cloned().collect();
    loop {
        let before = pending.len();
        let mut remaining = Vec::new();
        for join in pending {
            if available.contains(&join.left) {
                if available.contains(&join.right) {
                    continue;
                }
                available.insert(join.right);
                ordered.push(join);
            } else {
                remaining.push(join);
            }
        }
        pending = remaining;
        if pending.is_empty() {
            break;
        }
        if pending.len() == before {
            let left: BTreeSet<PlanId> = pending.iter().map(|j| j.left).collect();
            let right: BTreeSet<PlanId> = pending.iter().map(|j| j.right).collect();
            return Err(PlanningError::JoinOrder {
                left: format_ids(&left),
                right: format_ids(&right),
            });
        }
    }
    Ok(ordered)
}

fn format_ids(ids: &BTreeSet<PlanId>) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Inferred join ordering
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JoinOrderOutput {
    pub left: Option<String>,
    pub right: String,
    pub join_type: JoinType,
    /// Left source → shared key concepts.
    pub keys: BTreeMap<String, BTreeSet<String>>,
}

/// Order datasources into a join chain over their shared concepts.
///
/// `sources` maps a source identifier to the concepts it exposes.
/// Pivots (concepts shared by more than one source) are processed fewest
/// sources first; sources reachable through no pivot are attached with a
/// keyless full join.
pub(crate) fn resolve_join_order_v2(
    sources: &BTreeMap<String, BTreeSet<String>>,
    partials: &BTreeMap<String, BTreeSet<String>>,
    nullables: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<JoinOrderOutput> {
    let mut pivot_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (source, concepts) in sources {
        for concept in concepts {
            pivot_map
                .entry(concept.clone())
                .or_default()
                .push(source.clone());
        }
    }
    let mut pivots: Vec<String> = pivot_map
        .iter()
        .filter(|(_, v)| v.len() > 1)
        .map(|(k, _)| k.clone())
        .collect();
    pivots.sort_by_key(|p| (pivot_map[p].len(), p.len(), p.clone()));
    let solo: Vec<String> = pivot_map
        .iter()
        .filter(|(_, v)| v.len() == 1)
        .map(|(k, _)| k.clone())
        .collect();

    let empty = BTreeSet::new();
    let mut eligible_left: Vec<String> = Vec::new();
    let mut output: Vec<JoinOrderOutput> = Vec::new();

    while !pivots.is_empty() {
        let next = pivots
            .iter()
            .position(|p| pivot_map[p].iter().any(|ds| eligible_left.contains(ds)));
        let root = match next {
            Some(index) => pivots.remove(index),
            None => match pivots.pop() {
                Some(root) => root,
                None => break,
            },
        };

        // Best candidate sorts last
        let score_key = |source: &String, eligible: &[String]| {
            let mut base: i32 = 1;
            if eligible.contains(source) {
                base += 3;
            }
            if partials.get(source).is_some_and(|p| p.contains(&root)) {
                base -= 1;
            }
            (base, source.len(), source.clone())
        };

        let mut to_join: Vec<String> = pivot_map[&root]
            .iter()
            .filter(|ds| !eligible_left.contains(ds))
            .cloned()
            .collect();
        to_join.sort_by_key(|ds| score_key(ds, &eligible_left));

        while !to_join.is_empty() {
            let mut base: Vec<String> = pivot_map[&root]
                .iter()
                .filter(|ds| eligible_left.contains(ds))
                .cloned()
                .collect();
            base.sort_by_key(|ds| score_key(ds, &eligible_left));
            if base.is_empty() {
                let Some(new) = to_join.pop() else {
                    break;
                };
                eligible_left.push(new.clone());
                base = vec![new];
            }
            let Some(right) = to_join.pop() else {
                break;
            };
            if eligible_left.contains(&right) {
                continue;
            }
            let mut keys: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            let mut join_types: BTreeSet<JoinType> = BTreeSet::new();
            let right_concepts = sources.get(&right).unwrap_or(&empty);
            for left in base.iter().rev() {
                let left_concepts = sources.get(left).unwrap_or(&empty);
                let common: BTreeSet<String> = left_concepts
                    .intersection(right_concepts)
                    .cloned()
                    .collect();
                if common.is_empty() || keys.values().any(|v| v == &common) {
                    continue;
                }
                let touches = |map: &BTreeMap<String, BTreeSet<String>>, ds: &String| {
                    map.get(ds)
                        .is_some_and(|set| common.iter().any(|c| set.contains(c)))
                };
                let join_type = if touches(partials, left) {
                    JoinType::Full
                } else if touches(partials, &right) || touches(nullables, &right) {
                    JoinType::LeftOuter
                } else {
                    JoinType::Inner
                };
                join_types.insert(join_type);
                keys.insert(left.clone(), common);
            }
            let join_type = if join_types.contains(&JoinType::LeftOuter) {
                JoinType::LeftOuter
            } else if join_types.contains(&JoinType::Full) {
                JoinType::Full
            } else {
                JoinType::Inner
            };
            output.push(JoinOrderOutput {
                left: None,
                right: right.clone(),
                join_type,
                keys,
            });
            eligible_left.push(right);
        }
    }

    for concept in solo {
        for ds in &pivot_map[&concept] {
            if eligible_left.contains(ds) {
                continue;
            }
            let Some(first) = eligible_left.first().cloned() else {
                eligible_left.push(ds.clone());
                continue;
            };
            output.push(JoinOrderOutput {
                left: Some(first),
                right: ds.clone(),
                join_type: JoinType::Full,
                keys: BTreeMap::new(),
            });
            eligible_left.push(ds.clone());
        }
    }

    // An inner join reading from the right side of an outer join must
    // preserve the outer rows.
    let outer_rights: BTreeSet<String> = output
        .iter()
        .filter(|j| matches!(j.join_type, JoinType::LeftOuter | JoinType::Full))
        .map(|j| j.right.clone())
        .collect();
    for join in output.iter_mut() {
        if join.join_type == JoinType::Inner
            && join.keys.keys().any(|left| outer_rights.contains(left))
        {
            join.join_type = JoinType::LeftOuter;
        }
    }
    output
}

// ============================================================================
// Resolved joins
// ============================================================================

/// Infer the joins between a merge's resolved parents.
pub fn get_node_joins(datasets: &[ResolvedSource], env: &Environment) -> Vec<BaseJoin> {
    let mut sources: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut partials: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut nullables: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let by_identifier: BTreeMap<&str, &ResolvedSource> =
        datasets.iter().map(|d| (d.identifier(), d)).collect();

    for dataset in datasets {
        let id = dataset.identifier().to_string();
        partials.insert(id.clone(), dataset.partial_concepts().into_iter().collect());
        nullables.insert(id.clone(), dataset.nullable_concepts().into_iter().collect());
        let entry = sources.entry(id.clone()).or_default();
        for concept in dataset.output_concepts() {
            if dataset.is_hidden(&concept) {
                continue;
            }
            add_join_concept(entry, &mut seen, &concept, env);
        }
    }

    let ordered = resolve_join_order_v2(&sources, &partials, &nullables);
    ordered
        .into_iter()
        .filter_map(|join| {
            let right = by_identifier.get(join.right.as_str())?;
            let mut pairs = Vec::new();
            for (left_id, concepts) in &join.keys {
                let Some(left) = by_identifier.get(left_id.as_str()) else {
                    continue;
                };
                for concept in concepts {
                    let (Some(l), Some(r)) = (
                        instantiate(concept, left, env),
                        instantiate(concept, right, env),
                    ) else {
                        continue;
                    };
                    pairs.push(ConceptPair {
                        left: l,
                        right: r,
                        existing: left_id.clone(),
                    });
                }
            }
            trace!(right = %join.right, join_type = %join.join_type, "inferred join");
            Some(BaseJoin {
                left: join.left,
                right: join.right,
                join_type: join.join_type,
                concept_pairs: reduce_concept_pairs(pairs, env),
            })
        })
        .collect()
}

fn add_join_concept(
    entry: &mut BTreeSet<String>,
    seen: &mut BTreeSet<String>,
    address: &str,
    env: &Environment,
) {
    seen.insert(address.to_string());
    entry.insert(address.to_string());
    let Some(concept) = env.concepts.get(address) else {
        return;
    };
    for pseudonym in &concept.pseudonyms {
        if seen.contains(pseudonym) || pseudonym == address {
            continue;
        }
        add_join_concept(entry, seen, pseudonym, env);
    }
}

/// The address under which `source` exposes `address` (itself or a
/// pseudonym).
fn instantiate(address: &str, source: &ResolvedSource, env: &Environment) -> Option<String> {
    let outputs = source.output_concepts();
    if outputs.iter().any(|o| o == address) {
        return Some(address.to_string());
    }
    let concept = env.concepts.get(address)?;
    concept
        .pseudonyms
        .iter()
        .find(|p| outputs.contains(p))
        .cloned()
}

/// Drop property key pairs whose own keys already join.
pub fn reduce_concept_pairs(pairs: Vec<ConceptPair>, env: &Environment) -> Vec<ConceptPair> {
    let purpose = |address: &str| env.concepts.get(address).map(|c| c.purpose);
    let keys_of = |address: &str| {
        env.concepts
            .get(address)
            .map(|c| c.keys.clone())
            .unwrap_or_default()
    };
    let left_keys: BTreeSet<String> = pairs
        .iter()
        .filter(|p| purpose(&p.left) == Some(Purpose::Key))
        .map(|p| p.left.clone())
        .collect();
    let right_keys: BTreeSet<String> = pairs
        .iter()
        .filter(|p| purpose(&p.right) == Some(Purpose::Key))
        .map(|p| p.right.clone())
        .collect();
    let covered = |address: &str, keys: &BTreeSet<String>| {
        let own = keys_of(address);
        purpose(address) == Some(Purpose::Property) && !own.is_empty() && own.is_subset(keys)
    };
    pairs
        .into_iter()
        .filter(|p| !covered(&p.left, &left_keys) && !covered(&p.right, &right_keys))
        .collect()
}

/// Concepts of a merge output that may contain nulls.
///
/// A concept is nullable if it is nullable on every source that outputs
/// it, or if every source providing it sits on the right side of a join
/// keyed on nullable concepts.
pub fn find_nullable_concepts(
    source_map: &BTreeMap<String, BTreeSet<String>>,
    datasets: &[ResolvedSource],
    joins: &[ResolvedJoin],
) -> Vec<String> {
    let by_identifier: BTreeMap<&str, &ResolvedSource> =
        datasets.iter().map(|d| (d.identifier(), d)).collect();
    let nullable_on = |identifier: &str, address: &str| {
        by_identifier
            .get(identifier)
            .is_some_and(|ds| ds.nullable_concepts().iter().any(|n| n == address))
    };

    let mut nullable_sources: BTreeSet<String> = BTreeSet::new();
    for join in joins {
        let ResolvedJoin::Base(join) = join else {
            continue;
        };
        let on_nullable = join.concept_pairs.iter().any(|pair| {
            let left = join.left.as_deref().unwrap_or(&pair.existing);
            nullable_on(&join.right, &pair.right) || nullable_on(left, &pair.left)
        });
        if on_nullable {
            nullable_sources.insert(join.right.clone());
        }
    }

    let mut out = BTreeSet::new();
    for (address, sources) in source_map {
        let providers: Vec<&ResolvedSource> = datasets
            .iter()
            .filter(|d| d.output_concepts().iter().any(|o| o == address))
            .collect();
        if !providers.is_empty()
            && providers
                .iter()
                .all(|d| d.nullable_concepts().iter().any(|n| n == address))
        {
            out.insert(address.clone());
            continue;
        }
        if !nullable_sources.is_empty()
            && !sources.is_empty()
            && sources
                .iter()
                .all(|s| nullable_sources.contains(s) || nullable_on(s, address))
        {
            out.insert(address.clone());
        }
    }
    out.into_iter().collect()
}

/// Drop properties whose keys are also present; they ride along with
/// their keys.
pub fn concept_to_relevant_joins(concepts: &[Concept]) -> Vec<String> {
    let present: BTreeSet<&str> = concepts.iter().map(|c| c.address.as_str()).collect();
    let mut out: Vec<String> = Vec::new();
    for concept in concepts {
        let rides_on_keys = !concept.keys.is_empty()
            && concept.keys.iter().all(|k| present.contains(k.as_str()));
        if !rides_on_keys && !out.contains(&concept.address) {
            out.push(concept.address.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, DataType, Datasource};

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn sources(entries: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), set(v)))
            .collect()
    }

    #[test]
    fn test_explicit_join_order_finds_base() {
        let (a, b, c) = (PlanId(0), PlanId(1), PlanId(2));
        let joins = vec![
            NodeJoin::new(b, c, vec![], JoinType::Inner),
            NodeJoin::new(a, b, vec![], JoinType::Inner),
        ];
        let ordered = resolve_join_order(&joins).unwrap();
        assert_eq!(ordered[0].left, a);
        assert_eq!(ordered[1].left, b);
    }

    #[test]
    fn test_explicit_join_cycle_is_rejected() {
        let (a, b) = (PlanId(0), PlanId(1));
        let joins = vec![
            NodeJoin::new(a, b, vec![], JoinType::Inner),
            NodeJoin::new(b, a, vec![], JoinType::Inner),
        ];
        assert!(matches!(
            resolve_join_order(&joins),
            Err(PlanningError::JoinOrder { .. })
        ));
    }

    #[test]
    fn test_partial_left_key_forces_full_join() {
        let srcs = sources(&[("a", &["k", "x"]), ("b", &["k", "y"])]);
        let partials = sources(&[("a", &["k"]), ("b", &["k"])]);
        let joins = resolve_join_order_v2(&srcs, &partials, &BTreeMap::new());
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].join_type, JoinType::Full);
    }

    #[test]
    fn test_nullable_right_key_is_left_outer() {
        let srcs = sources(&[("aa", &["k", "x"]), ("b", &["k", "y"])]);
        let nullables = sources(&[("aa", &["k"]), ("b", &["k"])]);
        let joins = resolve_join_order_v2(&srcs, &BTreeMap::new(), &nullables);
        assert_eq!(joins[0].join_type, JoinType::LeftOuter);
    }

    #[test]
    fn test_unshared_sources_get_keyless_full_join() {
        let srcs = sources(&[("a", &["x"]), ("b", &["y"])]);
        let joins = resolve_join_order_v2(&srcs, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].join_type, JoinType::Full);
        assert!(joins[0].keys.is_empty());
        assert_eq!(joins[0].left.as_deref(), Some("a"));
    }

    #[test]
    fn test_inner_after_outer_is_upgraded() {
        // a -k- b (b partial on k: left outer), b -j- c (inner)
        let srcs = sources(&[("a", &["k"]), ("b", &["k", "j"]), ("c", &["j"])]);
        let partials = sources(&[("b", &["k"])]);
        let joins = resolve_join_order_v2(&srcs, &partials, &BTreeMap::new());
        assert_eq!(joins.len(), 2);
        assert!(joins
            .iter()
            .all(|j| matches!(j.join_type, JoinType::LeftOuter | JoinType::Full)));
    }

    #[test]
    fn test_property_pairs_are_reduced() {
        let mut env = Environment::new();
        env.add_key("id", DataType::Integer);
        env.add_property("name", DataType::String, &["id"]);
        let pair = |c: &str| ConceptPair {
            left: c.to_string(),
            right: c.to_string(),
            existing: "a".to_string(),
        };
        let reduced = reduce_concept_pairs(vec![pair("local.id"), pair("local.name")], &env);
        assert_eq!(reduced, vec![pair("local.id")]);
    }

    #[test]
    fn test_node_joins_between_datasources() {
        let mut env = Environment::new();
        env.add_key("id", DataType::Integer);
        env.add_property("a", DataType::String, &["id"]);
        env.add_property("b", DataType::String, &["id"]);
        let left = Datasource::new("left", vec![Column::new("id", "id"), Column::new("a", "a")], ["id"]);
        let right = Datasource::new("right", vec![Column::new("id", "id"), Column::new("b", "b")], ["id"]);
        let joins = get_node_joins(
            &[ResolvedSource::Datasource(left), ResolvedSource::Datasource(right)],
            &env,
        );
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].join_type, JoinType::Inner);
        assert_eq!(joins[0].keys(), vec!["local.id"]);
    }

    #[test]
    fn test_relevant_joins_drop_properties_with_keys() {
        let id = Concept::key("id", DataType::Integer);
        let name = Concept::property("name", DataType::String, ["id"]);
        assert_eq!(concept_to_relevant_joins(&[id, name]), vec!["local.id"]);
    }
}
