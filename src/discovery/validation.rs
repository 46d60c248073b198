//! Completeness check of a discovery stack.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::unionfind::UnionFind;

use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Environment, Purpose};
use crate::plan::{PlanArena, PlanId};

/// Outcome of checking a stack against its mandatory concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// Every mandatory concept is present and the stack joins into one graph.
    Complete,
    /// Everything is present but the sources do not connect.
    Disconnected,
    /// Some mandatory concept is missing.
    Incomplete,
    /// Concepts are present but the condition is neither applied upstream
    /// nor evaluable from the found concepts.
    IncompleteCondition,
}

/// Address bookkeeping of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackCoverage {
    pub found: BTreeSet<String>,
    pub missing: BTreeSet<String>,
    pub partial: BTreeSet<String>,
    pub virtual_outputs: BTreeSet<String>,
}

#[derive(Default)]
struct Tracker {
    found: BTreeSet<String>,
    non_partial: BTreeSet<String>,
    partial: BTreeSet<String>,
    virtual_outputs: BTreeSet<String>,
    found_map: BTreeMap<PlanId, BTreeSet<String>>,
    seen: BTreeSet<String>,
}

impl Tracker {
    fn validate_concept(
        &mut self,
        env: &Environment,
        concept: &Concept,
        node: PlanId,
        node_partial: &[String],
        accept_partial: bool,
    ) {
        let address = &concept.address;
        self.found_map.entry(node).or_default().insert(address.clone());
        self.seen.insert(address.clone());
        if node_partial.contains(address) {
            if self.non_partial.contains(address) {
                return;
            }
            self.partial.insert(address.clone());
            if accept_partial {
                self.found.insert(address.clone());
            }
        } else {
            self.found.insert(address.clone());
            self.non_partial.insert(address.clone());
            self.partial.remove(address);
            self.virtual_outputs.remove(address);
        }
        for pseudonym in &concept.pseudonyms {
            if self.seen.contains(pseudonym) || pseudonym == address {
                return;
            }
            let Some(other) = env.concepts.get(pseudonym) else {
                return;
            };
            self.validate_concept(env, other, node, node_partial, accept_partial);
        }
    }
}

/// Check whether `stack` covers `mandatory` and connects into one graph.
///
/// `completion_mandatory` adds the condition's row arguments; when every
/// one of those is found the condition can still be applied on top.
pub fn validate_stack(
    arena: &PlanArena,
    stack: &[PlanId],
    mandatory: &[Concept],
    completion_mandatory: &[Concept],
    conditions: Option<&Condition>,
    accept_partial: bool,
) -> PlanningResult<(ValidationResult, StackCoverage)> {
    let env = arena.environment();
    let mut tracker = Tracker::default();

    for node in stack {
        let resolved = arena.resolve(*node)?;
        let core = arena.core(*node);
        for address in &resolved.output_concepts {
            if resolved.hidden_concepts.contains(address) {
                continue;
            }
            let concept = env.concept(address)?;
            tracker.validate_concept(env, concept, *node, &core.partial_concepts, accept_partial);
        }
        for address in &core.virtual_output_concepts {
            if tracker.non_partial.contains(address) {
                continue;
            }
            tracker.found.insert(address.clone());
            tracker.virtual_outputs.insert(address.clone());
        }
    }

    let conditions_met = match conditions {
        None => true,
        Some(condition) => {
            stack
                .iter()
                .all(|n| arena.core(*n).preexisting_conditions.as_ref() == Some(condition))
                || completion_mandatory
                    .iter()
                    .all(|c| tracker.found.contains(&c.address))
        }
    };

    let missing: BTreeSet<String> = mandatory
        .iter()
        .filter(|c| !tracker.found.contains(&c.address))
        .map(|c| c.address.clone())
        .collect();
    let coverage = |missing: BTreeSet<String>, tracker: &Tracker| StackCoverage {
        found: tracker.found.clone(),
        missing,
        partial: tracker.partial.clone(),
        virtual_outputs: tracker.virtual_outputs.clone(),
    };

    if !missing.is_empty() {
        return Ok((ValidationResult::Incomplete, coverage(missing, &tracker)));
    }
    if !conditions_met {
        return Ok((
            ValidationResult::IncompleteCondition,
            coverage(BTreeSet::new(), &tracker),
        ));
    }

    let components = disconnected_components(env, &tracker.found_map);
    let result = if components <= 1 {
        ValidationResult::Complete
    } else {
        ValidationResult::Disconnected
    };
    Ok((result, coverage(BTreeSet::new(), &tracker)))
}

/// Count connected node/concept components that carry at least one
/// concept which cannot be cross joined in later.
fn disconnected_components(env: &Environment, found_map: &BTreeMap<PlanId, BTreeSet<String>>) -> usize {
    let concepts: BTreeSet<&String> = found_map.values().flatten().collect();
    let concept_index: BTreeMap<&String, usize> = concepts
        .iter()
        .enumerate()
        .map(|(i, c)| (*c, found_map.len() + i))
        .collect();

    let mut components = UnionFind::<usize>::new(found_map.len() + concepts.len());
    for (node_index, addresses) in found_map.values().enumerate() {
        for address in addresses {
            components.union(node_index, concept_index[address]);
        }
    }

    let mut relevant_roots: BTreeSet<usize> = BTreeSet::new();
    for (address, index) in &concept_index {
        if is_relevant(env, address) {
            relevant_roots.insert(components.find(*index));
        }
    }
    relevant_roots.len()
}

/// Single-row concepts and ungrained metrics can always be joined in later.
fn is_relevant(env: &Environment, address: &str) -> bool {
    let Some(concept) = env.concepts.get(address) else {
        return true;
    };
    if concept.is_single_row() {
        return false;
    }
    !(concept.purpose == Purpose::Metric && concept.grain.is_abstract())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, DataType, Datasource};
    use crate::plan::{NodeCore, PlanNode};
    use std::rc::Rc;

    fn arena() -> PlanArena {
        let mut env = Environment::new();
        env.add_key("a", DataType::Integer);
        env.add_key("b", DataType::Integer);
        env.add_datasource(Datasource::new("ds_a", vec![Column::new("a", "a")], ["a"]))
            .unwrap();
        env.add_datasource(Datasource::new("ds_b", vec![Column::new("b", "b").partial()], ["b"]))
            .unwrap();
        PlanArena::new(Rc::new(env))
    }

    fn select(arena: &mut PlanArena, ds: &str, concept: &str) -> PlanId {
        let datasource = arena.environment().datasources[ds].clone();
        let partial = datasource.partial_concepts();
        let core = NodeCore::new(vec![concept.into()], vec![concept.into()]).with_partial(partial);
        arena.insert(PlanNode::select(core, datasource, false))
    }

    #[test]
    fn test_missing_concept_is_incomplete() {
        let mut arena = arena();
        let env = arena.shared_environment();
        let node = select(&mut arena, "ds_a", "local.a");
        let mandatory = env.concepts_for(&["local.a", "local.b"]).unwrap();
        let (result, coverage) =
            validate_stack(&arena, &[node], &mandatory, &mandatory, None, false).unwrap();
        assert_eq!(result, ValidationResult::Incomplete);
        assert!(coverage.missing.contains("local.b"));
    }

    #[test]
    fn test_two_unrelated_sources_are_disconnected() {
        let mut arena = arena();
        let env = arena.shared_environment();
        let a = select(&mut arena, "ds_a", "local.a");
        let b = select(&mut arena, "ds_b", "local.b");
        let mandatory = env.concepts_for(&["local.a", "local.b"]).unwrap();
        let (result, coverage) =
            validate_stack(&arena, &[a, b], &mandatory, &mandatory, None, true).unwrap();
        assert_eq!(result, ValidationResult::Disconnected);
        assert!(coverage.partial.contains("local.b"));
    }

    #[test]
    fn test_partial_counts_only_when_accepted() {
        let mut arena = arena();
        let env = arena.shared_environment();
        let b = select(&mut arena, "ds_b", "local.b");
        let mandatory = env.concepts_for(&["local.b"]).unwrap();
        let (strict, _) = validate_stack(&arena, &[b], &mandatory, &mandatory, None, false).unwrap();
        assert_eq!(strict, ValidationResult::Incomplete);
        let (loose, _) = validate_stack(&arena, &[b], &mandatory, &mandatory, None, true).unwrap();
        assert_eq!(loose, ValidationResult::Complete);
    }
}
