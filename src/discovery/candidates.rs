//! Companion concepts sourced alongside the priority concept.

use std::collections::BTreeSet;

use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Derivation, Environment};

/// Concepts worth fetching in the same node as `priority`.
///
/// Single-row concepts never need a join, so a single-row priority takes no
/// companions and is never offered as one. Concepts already exhausted and
/// pseudonyms of the priority are dropped. When the priority is a root or a
/// constant the condition's row arguments are pulled in first, so the
/// resulting node can evaluate the condition.
pub fn generate_candidates_restrictive(
    env: &Environment,
    priority: &Concept,
    candidates: &[Concept],
    exhausted: &BTreeSet<String>,
    conditions: Option<&Condition>,
) -> PlanningResult<Vec<Concept>> {
    if priority.is_single_row() {
        return Ok(Vec::new());
    }

    let local: Vec<Concept> = candidates
        .iter()
        .filter(|c| {
            !exhausted.contains(&c.address)
                && !c.is_single_row()
                && !priority.pseudonyms.contains(&c.address)
                && !c.pseudonyms.contains(&priority.address)
        })
        .cloned()
        .collect();

    let Some(condition) = conditions else {
        return Ok(local);
    };
    if !matches!(priority.derivation, Derivation::Root | Derivation::Constant) {
        return Ok(local);
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for concept in env
        .concepts_for(&condition.row_arguments())?
        .into_iter()
        .chain(local)
    {
        if concept.address != priority.address && seen.insert(concept.address.clone()) {
            out.push(concept);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComparisonOp, DataType, Expr, Literal};

    fn env() -> Environment {
        let mut env = Environment::new();
        env.add_key("id", DataType::Integer);
        env.add_property("cat", DataType::String, &["id"]);
        env.add_property("value", DataType::Float, &["id"]);
        env.add_key("other_id", DataType::Integer);
        env.add_constant("one", DataType::Integer, Literal::Integer(1));
        env.merge_concepts("other_id", "id").unwrap();
        env
    }

    #[test]
    fn test_single_row_priority_takes_no_companions() {
        let env = env();
        let priority = env.concepts["local.one"].clone();
        let candidates = env.concepts_for(&["local.id", "local.cat"]).unwrap();
        let out =
            generate_candidates_restrictive(&env, &priority, &candidates, &BTreeSet::new(), None)
                .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_exhausted_single_row_and_pseudonyms_are_dropped() {
        let env = env();
        let priority = env.concepts["local.id"].clone();
        let candidates = env
            .concepts_for(&["local.cat", "local.value", "local.one", "local.other_id"])
            .unwrap();
        let exhausted = BTreeSet::from(["local.value".to_string()]);
        let out = generate_candidates_restrictive(&env, &priority, &candidates, &exhausted, None)
            .unwrap();
        let addresses: Vec<&str> = out.iter().map(|c| c.address.as_str()).collect();
        assert_eq!(addresses, vec!["local.cat"]);
    }

    #[test]
    fn test_condition_arguments_join_root_priority() {
        let env = env();
        let priority = env.concepts["local.id"].clone();
        let candidates = env.concepts_for(&["local.cat"]).unwrap();
        let condition = Condition::compare(
            Expr::concept("local.value"),
            ComparisonOp::Gt,
            Expr::int(3),
        );
        let out = generate_candidates_restrictive(
            &env,
            &priority,
            &candidates,
            &BTreeSet::new(),
            Some(&condition),
        )
        .unwrap();
        let addresses: Vec<&str> = out.iter().map(|c| c.address.as_str()).collect();
        assert_eq!(addresses, vec!["local.value", "local.cat"]);
    }
}
