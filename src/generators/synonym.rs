//! Substitute pseudonyms for targets that cannot be sourced as named.

use tracing::{debug, trace, warn};

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition, Derivation};
use crate::plan::PlanId;

/// Try every combination of targets and their pseudonyms, most natural
/// first, and return the first one that sources.
///
/// The unmodified combination is skipped; the caller already failed it.
pub(crate) fn gen_synonym_node(
    planner: &mut Planner,
    targets: &[Concept],
    depth: usize,
    accept_partial: bool,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let mut base: Vec<&str> = targets.iter().map(|c| c.address.as_str()).collect();
    base.sort();

    let mut sorted: Vec<&Concept> = targets.iter().collect();
    sorted.sort_by(|a, b| a.address.cmp(&b.address));
    let mut choices: Vec<Vec<Concept>> = Vec::with_capacity(sorted.len());
    let mut has_synonyms = false;
    for target in sorted {
        let mut options = vec![target.clone()];
        for pseudonym in &target.pseudonyms {
            if let Some(other) = env.concepts.get(pseudonym) {
                options.push(other.clone());
                has_synonyms = true;
            }
        }
        options.sort_by(|a, b| a.address.cmp(&b.address));
        choices.push(options);
    }
    if !has_synonyms {
        return Ok(None);
    }

    let mut combinations = cartesian_product(&choices);
    combinations.sort_by_cached_key(|combo| combination_rank(combo));
    debug!(depth, combinations = combinations.len(), "trying synonym combinations");

    for combo in combinations {
        let mut fingerprint: Vec<&str> = combo.iter().map(|c| c.address.as_str()).collect();
        fingerprint.sort();
        if fingerprint == base {
            continue;
        }
        trace!(depth, combination = ?fingerprint, "checking synonym combination");
        if let Some(found) = planner.search(&combo, depth, accept_partial, conditions)? {
            warn!(depth, combination = ?fingerprint, "resolved through synonyms");
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn cartesian_product(choices: &[Vec<Concept>]) -> Vec<Vec<Concept>> {
    choices.iter().fold(vec![Vec::new()], |acc, options| {
        acc.iter()
            .flat_map(|prefix| {
                options.iter().map(move |option| {
                    let mut next = prefix.clone();
                    next.push(option.clone());
                    next
                })
            })
            .collect()
    })
}

/// Sort key: more roots first, then more shared address prefix, then
/// lexical order of addresses.
fn combination_rank(combo: &[Concept]) -> (isize, isize, Vec<String>) {
    let roots = combo
        .iter()
        .filter(|c| matches!(c.derivation, Derivation::Root | Derivation::Constant))
        .count();
    let addresses: Vec<String> = combo.iter().map(|c| c.address.clone()).collect();
    let mut similarity = 0;
    for (i, a) in addresses.iter().enumerate() {
        for b in &addresses[i + 1..] {
            similarity += a
                .split('.')
                .zip(b.split('.'))
                .take_while(|(x, y)| x == y)
                .count();
        }
    }
    (-(roots as isize), -(similarity as isize), addresses)
}
