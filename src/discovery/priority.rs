//! Pick order for the discovery loop.
//!
//! The tier table below decides which unattempted concept is sourced next.
//! Plans are sensitive to it: changing the order changes which generator
//! runs first and which companions ride along.

use std::collections::BTreeSet;

use crate::model::{Concept, Derivation, Environment, Granularity, Lineage};

/// Precedence tiers, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityTier {
    /// Single-row constants need no joins and let the loop exit early.
    SingleRowConstant,
    Multiselect,
    Rowset,
    Union,
    Aggregate,
    Window,
    Filter,
    Unnest,
    Recursive,
    Basic,
    GroupTo,
    Constant,
    Root,
}

impl PriorityTier {
    /// Every tier in pick order.
    pub const ORDER: [PriorityTier; 13] = [
        PriorityTier::SingleRowConstant,
        PriorityTier::Multiselect,
        PriorityTier::Rowset,
        PriorityTier::Union,
        PriorityTier::Aggregate,
        PriorityTier::Window,
        PriorityTier::Filter,
        PriorityTier::Unnest,
        PriorityTier::Recursive,
        PriorityTier::Basic,
        PriorityTier::GroupTo,
        PriorityTier::Constant,
        PriorityTier::Root,
    ];

    pub fn of(concept: &Concept) -> PriorityTier {
        match concept.derivation {
            Derivation::Constant if concept.granularity == Granularity::SingleRow => {
                PriorityTier::SingleRowConstant
            }
            Derivation::Constant => PriorityTier::Constant,
            Derivation::Multiselect => PriorityTier::Multiselect,
            Derivation::Rowset => PriorityTier::Rowset,
            Derivation::Union => PriorityTier::Union,
            Derivation::Aggregate => PriorityTier::Aggregate,
            Derivation::Window => PriorityTier::Window,
            Derivation::Filter => PriorityTier::Filter,
            Derivation::Unnest => PriorityTier::Unnest,
            Derivation::Recursive => PriorityTier::Recursive,
            Derivation::Basic => PriorityTier::Basic,
            Derivation::GroupTo => PriorityTier::GroupTo,
            Derivation::Root => PriorityTier::Root,
        }
    }
}

/// Every concept `base` is computed from, transitively. Depending on any
/// rowset concept makes every output of that rowset upstream.
pub fn get_upstream_concepts(env: &Environment, base: &Concept) -> BTreeSet<String> {
    let mut upstream = BTreeSet::new();
    let mut visiting = BTreeSet::new();
    collect_upstream(env, base, false, &mut upstream, &mut visiting);
    upstream
}

fn collect_upstream(
    env: &Environment,
    base: &Concept,
    nested: bool,
    upstream: &mut BTreeSet<String>,
    visiting: &mut BTreeSet<String>,
) {
    if nested {
        upstream.insert(base.address.clone());
    }
    if !visiting.insert(base.address.clone()) {
        return;
    }
    let Some(lineage) = &base.lineage else {
        return;
    };
    for arg in lineage.concept_arguments() {
        let Some(concept) = env.concepts.get(&arg) else {
            continue;
        };
        if let Some(Lineage::Rowset(rowset)) = &concept.lineage {
            for output in &rowset.select.output {
                if let Some(content) = env.concepts.get(output) {
                    upstream.insert(format!("{}.{}", rowset.rowset, content.name()));
                }
            }
        }
        collect_upstream(env, concept, true, upstream, visiting);
    }
}

/// Next concept to source: the highest tier among concepts neither
/// attempted nor found, sorted by address within a tier, deferring any
/// concept another remaining concept is derived from.
///
/// Returns `None` once nothing remains.
pub fn get_priority_concept(
    env: &Environment,
    concepts: &[Concept],
    attempted: &BTreeSet<String>,
    found: &BTreeSet<String>,
) -> Option<Concept> {
    let mut remaining: Vec<&Concept> = concepts
        .iter()
        .filter(|c| !attempted.contains(&c.address) && !found.contains(&c.address))
        .collect();
    remaining.sort_by(|a, b| {
        PriorityTier::of(a)
            .cmp(&PriorityTier::of(b))
            .then_with(|| a.address.cmp(&b.address))
    });

    let upstream: BTreeSet<String> = remaining
        .iter()
        .flat_map(|c| get_upstream_concepts(env, c))
        .collect();
    remaining
        .iter()
        .find(|c| !upstream.contains(&c.address))
        .or_else(|| remaining.first())
        .map(|c| (*c).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AggregateItem, AggregateOp, ComparisonOp, Condition, DataType, Expr, FilterItem, Function,
        FunctionOp, Literal,
    };

    fn env() -> Environment {
        let mut env = Environment::new();
        env.add_key("id", DataType::Integer);
        env.add_property("value", DataType::Float, &["id"]);
        env.add_constant("one", DataType::Integer, Literal::Integer(1));
        env.add_derived(
            "total",
            DataType::Float,
            Lineage::Aggregate(AggregateItem {
                op: AggregateOp::Sum,
                args: vec![Expr::concept("local.value")],
                by: vec!["local.id".to_string()],
            }),
        )
        .unwrap();
        env.add_derived(
            "big_id",
            DataType::Integer,
            Lineage::Filter(FilterItem {
                content: "local.id".to_string(),
                condition: Condition::compare(
                    Expr::concept("local.value"),
                    ComparisonOp::Gt,
                    Expr::int(10),
                ),
            }),
        )
        .unwrap();
        env
    }

    #[test]
    fn test_tier_table_order() {
        let mut sorted = PriorityTier::ORDER.to_vec();
        sorted.sort();
        assert_eq!(sorted, PriorityTier::ORDER.to_vec());
        assert_eq!(PriorityTier::ORDER.first(), Some(&PriorityTier::SingleRowConstant));
        assert_eq!(PriorityTier::ORDER.last(), Some(&PriorityTier::Root));
        assert!(PriorityTier::Multiselect < PriorityTier::Rowset);
        assert!(PriorityTier::Aggregate < PriorityTier::Window);
        assert!(PriorityTier::Window < PriorityTier::Filter);
        assert!(PriorityTier::Basic < PriorityTier::GroupTo);
        assert!(PriorityTier::Constant < PriorityTier::Root);
    }

    #[test]
    fn test_tier_of_concepts() {
        let env = env();
        assert_eq!(PriorityTier::of(&env.concepts["local.id"]), PriorityTier::Root);
        assert_eq!(
            PriorityTier::of(&env.concepts["local.one"]),
            PriorityTier::SingleRowConstant
        );
        assert_eq!(PriorityTier::of(&env.concepts["local.total"]), PriorityTier::Aggregate);
        assert_eq!(PriorityTier::of(&env.concepts["local.big_id"]), PriorityTier::Filter);
    }

    #[test]
    fn test_aggregate_before_root() {
        let env = env();
        let concepts = env
            .concepts_for(&["local.id", "local.total", "local.value"])
            .unwrap();
        let pick = get_priority_concept(&env, &concepts, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(pick.map(|c| c.address), Some("local.total".to_string()));
    }

    #[test]
    fn test_upstream_concepts_are_deferred() {
        let mut env = env();
        for (name, arg) in [("doubled", "local.value"), ("quadrupled", "local.doubled")] {
            env.add_derived(
                name,
                DataType::Float,
                Lineage::Function(Function {
                    op: FunctionOp::Multiply,
                    args: vec![Expr::concept(arg), Expr::int(2)],
                }),
            )
            .unwrap();
        }
        // same tier, but doubled feeds quadrupled
        let concepts = env.concepts_for(&["local.doubled", "local.quadrupled"]).unwrap();
        let pick = get_priority_concept(&env, &concepts, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(pick.map(|c| c.address), Some("local.quadrupled".to_string()));

        let upstream = get_upstream_concepts(&env, &env.concepts["local.big_id"]);
        assert!(upstream.contains("local.id"));
        assert!(upstream.contains("local.value"));
        assert!(!upstream.contains("local.big_id"));
    }

    #[test]
    fn test_attempted_and_found_are_skipped() {
        let env = env();
        let concepts = env.concepts_for(&["local.id", "local.total"]).unwrap();
        let attempted = BTreeSet::from(["local.total".to_string()]);
        let pick = get_priority_concept(&env, &concepts, &attempted, &BTreeSet::new());
        assert_eq!(pick.map(|c| c.address), Some("local.id".to_string()));

        let found = BTreeSet::from(["local.id".to_string()]);
        assert!(get_priority_concept(&env, &concepts, &attempted, &found).is_none());
    }
}
