//! Grain sufficiency: does a set of parents need a grouping step to reach a
//! target grain?

use std::collections::BTreeSet;

use tracing::debug;

use crate::error::PlanningResult;
use crate::model::{Concept, Environment, Grain, Lineage, Purpose};

use super::resolved::{ResolvedJoin, ResolvedSource};

/// Outcome of [`check_if_group_required`].
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRequired {
    pub target: Grain,
    pub upstream: Grain,
    pub required: bool,
}

/// Grain a parent contributes to its consumer's rows.
///
/// A join whose right side is joined on exactly its own grain does not fan
/// out, so only the left grain counts.
pub fn effective_parent_grain(source: &ResolvedSource, env: &Environment) -> Grain {
    let ResolvedSource::Query(query) = source else {
        return source.grain().clone();
    };
    if query.joins.is_empty() {
        return query.grain.clone();
    }
    let mut grain = Grain::abstract_grain();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for join in &query.joins {
        match join {
            ResolvedJoin::Unnest(unnest) => {
                grain = grain.union(&Grain::new(unnest.concepts.iter()));
            }
            ResolvedJoin::Base(join) => {
                for pair in &join.concept_pairs {
                    if let Some(left) = query.source(&pair.existing) {
                        grain = grain.union(left.grain());
                        seen.insert(left.identifier());
                    }
                }
                if let Some(left) = join.left.as_deref().and_then(|l| query.source(l)) {
                    grain = grain.union(left.grain());
                    seen.insert(left.identifier());
                }
                let Some(right) = query.source(&join.right) else {
                    continue;
                };
                let keys: Vec<&Concept> = join
                    .concept_pairs
                    .iter()
                    .filter_map(|p| env.concepts.get(&p.right))
                    .collect();
                let join_grain = Grain::from_concepts(keys);
                if &join_grain != right.grain() {
                    grain = grain.union(right.grain());
                }
                seen.insert(right.identifier());
            }
        }
    }
    let existence = query
        .condition
        .as_ref()
        .map(|c| c.existence_arguments())
        .unwrap_or_default();
    for source in &query.datasources {
        if seen.contains(source.identifier()) {
            continue;
        }
        let existence_only = !existence.is_empty()
            && source
                .output_concepts()
                .iter()
                .any(|c| existence.contains(c));
        if !existence_only {
            grain = grain.union(source.grain());
        }
    }
    grain
}

/// Decide whether rows from `parents` must be grouped to carry
/// `downstream` at its own grain.
///
/// Grouping is skipped when the upstream grain is a subset of the target,
/// when the extra upstream components are attributes of keys already
/// upstream, when they are keys whose unique properties the target
/// carries, or when the target only differs by rowset/filter renames.
pub fn check_if_group_required(
    env: &Environment,
    downstream: &[String],
    parents: &[ResolvedSource],
) -> PlanningResult<GroupRequired> {
    let downstream_concepts = env.concepts_for(downstream)?;
    let target = Grain::from_concepts(downstream_concepts.iter());
    let upstream = parents
        .iter()
        .fold(Grain::abstract_grain(), |acc, p| acc.union(&effective_parent_grain(p, env)));

    let response = |target: Grain, required: bool| GroupRequired {
        target,
        upstream: upstream.clone(),
        required,
    };

    if upstream.is_abstract() && !target.is_abstract() {
        debug!(target = %target, "upstream grain is abstract, grouping");
        return Ok(response(target, true));
    }
    if upstream.issubset(&target) {
        return Ok(response(target, false));
    }

    let difference: Vec<&Concept> = upstream
        .difference(&target)
        .components
        .iter()
        .filter_map(|c| env.concepts.get(c))
        .collect();

    if !difference.is_empty()
        && difference
            .iter()
            .all(|x| !x.keys.is_empty() && x.keys.iter().all(|k| upstream.contains(k)))
    {
        debug!(upstream = %upstream, target = %target, "extra grain is dependent on upstream keys");
        return Ok(response(target, false));
    }

    if !difference.is_empty() && difference.iter().all(|x| x.purpose == Purpose::Key) {
        let replaced: BTreeSet<String> = downstream_concepts
            .iter()
            .filter(|x| target.contains(&x.address))
            .flat_map(|x| {
                if x.purpose == Purpose::UniqueProperty {
                    x.keys.iter().cloned().collect::<Vec<_>>()
                } else {
                    vec![x.address.clone()]
                }
            })
            .collect();
        let replaced_concepts = env.concepts_for(&replaced.into_iter().collect::<Vec<_>>())?;
        if upstream.issubset(&Grain::from_concepts(replaced_concepts.iter())) {
            debug!(upstream = %upstream, "target carries unique properties of upstream keys");
            return Ok(response(target, false));
        }
    }

    let renamed: Vec<String> = target
        .components
        .iter()
        .map(|component| match env.concepts.get(component).and_then(|c| c.lineage.as_ref()) {
            Some(Lineage::Rowset(rowset)) => rowset.content.clone(),
            Some(Lineage::Filter(filter)) => filter.content.clone(),
            _ => component.clone(),
        })
        .collect();
    let renamed_concepts = env.concepts_for(&renamed)?;
    let renamed_target = Grain::from_concepts(renamed_concepts.iter());
    if upstream.issubset(&renamed_target) {
        return Ok(response(renamed_target, false));
    }

    debug!(upstream = %upstream, target = %target, "group required");
    Ok(response(target, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, DataType, Datasource};

    fn env() -> Environment {
        let mut env = Environment::new();
        env.add_key("id", DataType::Integer);
        env.add_key("user_id", DataType::Integer);
        env.add_property("cat", DataType::String, &["id"]);
        env.add_concept(
            crate::model::Concept::unique_property("email", DataType::String, ["user_id"]),
        );
        env
    }

    fn source(grain: &[&str]) -> ResolvedSource {
        let columns = grain.iter().map(|g| Column::new(g, g)).collect();
        ResolvedSource::Datasource(Datasource::new("ds", columns, grain.iter().copied()))
    }

    #[test]
    fn test_same_grain_needs_no_group() {
        let env = env();
        let check = check_if_group_required(
            &env,
            &["local.id".into(), "local.cat".into()],
            &[source(&["id"])],
        )
        .unwrap();
        assert!(!check.required);
    }

    #[test]
    fn test_coarser_target_needs_group() {
        let env = env();
        let check = check_if_group_required(&env, &["local.cat".into()], &[source(&["id"])]).unwrap();
        assert!(check.required);
        assert_eq!(check.target, Grain::new(["local.cat"]));
    }

    #[test]
    fn test_unique_property_target_skips_group() {
        let env = env();
        let check =
            check_if_group_required(&env, &["local.email".into()], &[source(&["user_id"])]).unwrap();
        assert!(!check.required);
    }
}
