//! Memo of search attempts within one planning pass.

use std::collections::{BTreeSet, HashMap};

use crate::model::Condition;

use super::arena::PlanArena;
use super::node::PlanId;

/// Key of a search attempt: sorted target addresses, partial acceptance and
/// the condition text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchKey {
    concepts: Vec<String>,
    accept_partial: bool,
    condition: Option<String>,
}

impl SearchKey {
    pub fn new(concepts: &[String], accept_partial: bool, condition: Option<&Condition>) -> Self {
        let mut concepts = concepts.to_vec();
        concepts.sort();
        concepts.dedup();
        Self {
            concepts,
            accept_partial,
            condition: condition.map(|c| c.to_string()),
        }
    }
}

/// Results of completed searches, direct-select attempts and the set of
/// searches currently on the stack.
///
/// Stored nodes are handed out as deep copies so callers can mutate what
/// they receive.
#[derive(Debug, Default)]
pub struct History {
    searches: HashMap<SearchKey, Option<PlanId>>,
    selects: HashMap<SearchKey, Option<PlanId>>,
    started: BTreeSet<SearchKey>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// A finished search: `Some(None)` records a known miss.
    pub fn get_history(&self, arena: &mut PlanArena, key: &SearchKey) -> Option<Option<PlanId>> {
        let stored = *self.searches.get(key)?;
        Some(stored.map(|id| arena.copy(id)))
    }

    pub fn search_to_history(&mut self, arena: &mut PlanArena, key: SearchKey, node: Option<PlanId>) {
        let stored = node.map(|id| arena.copy(id));
        self.searches.insert(key, stored);
    }

    pub fn get_select(&self, arena: &mut PlanArena, key: &SearchKey) -> Option<Option<PlanId>> {
        let stored = *self.selects.get(key)?;
        Some(stored.map(|id| arena.copy(id)))
    }

    pub fn select_to_history(&mut self, arena: &mut PlanArena, key: SearchKey, node: Option<PlanId>) {
        let stored = node.map(|id| arena.copy(id));
        self.selects.insert(key, stored);
    }

    /// Mark a search as in progress. Returns false if it already was.
    pub fn log_start(&mut self, key: SearchKey) -> bool {
        self.started.insert(key)
    }

    pub fn check_started(&self, key: &SearchKey) -> bool {
        self.started.contains(key)
    }

    pub fn log_end(&mut self, key: &SearchKey) {
        self.started.remove(key);
    }
}
