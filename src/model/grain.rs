//! Grain: the set of concepts at which rows are unique.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::concept::{Concept, Granularity, Purpose};
use super::expr::Condition;

/// A set of concept addresses plus an optional attached condition.
///
/// A grain with no components is *abstract*: a single aggregate row with no
/// join key. The condition does not participate in equality or in
/// [`Grain::issubset`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Grain {
    #[serde(default)]
    pub components: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Grain {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
            condition: None,
        }
    }

    /// The single-row grain.
    pub fn abstract_grain() -> Self {
        Self::default()
    }

    pub fn is_abstract(&self) -> bool {
        self.components.is_empty()
    }

    pub fn with_condition(mut self, condition: Option<Condition>) -> Self {
        self.condition = condition;
        self
    }

    pub fn contains(&self, address: &str) -> bool {
        self.components.contains(address)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn union(&self, other: &Grain) -> Grain {
        Grain {
            components: self.components.union(&other.components).cloned().collect(),
            condition: self.condition.clone().or_else(|| other.condition.clone()),
        }
    }

    pub fn difference(&self, other: &Grain) -> Grain {
        Grain {
            components: self
                .components
                .difference(&other.components)
                .cloned()
                .collect(),
            condition: self.condition.clone(),
        }
    }

    /// True if rows at this grain are already unique at `other`.
    ///
    /// The abstract grain is a subset of every grain.
    pub fn issubset(&self, other: &Grain) -> bool {
        self.components.is_subset(&other.components)
    }

    /// Derive the grain of a row that carries `concepts`.
    ///
    /// Keys contribute themselves. Properties and metrics contribute nothing
    /// when their keys (or, for metrics, their own grain) are already on the
    /// row. Single-row concepts never contribute.
    pub fn from_concepts<'a>(concepts: impl IntoIterator<Item = &'a Concept>) -> Grain {
        let concepts: Vec<&Concept> = concepts.into_iter().collect();
        let present: BTreeSet<&str> = concepts.iter().map(|c| c.address.as_str()).collect();
        let mut components = BTreeSet::new();

        for concept in &concepts {
            if concept.granularity == Granularity::SingleRow {
                continue;
            }
            let keys_present =
                !concept.keys.is_empty() && concept.keys.iter().all(|k| present.contains(k.as_str()));
            match concept.purpose {
                Purpose::Property | Purpose::UniqueProperty if keys_present => continue,
                Purpose::Metric => {
                    if keys_present {
                        continue;
                    }
                    if concept
                        .grain
                        .components
                        .iter()
                        .all(|c| present.contains(c.as_str()) && c != &concept.address)
                    {
                        continue;
                    }
                }
                Purpose::Constant => continue,
                _ => {}
            }
            components.insert(concept.address.clone());
        }
        Grain {
            components,
            condition: None,
        }
    }

    /// Stable textual form without the condition, used for graph identity.
    pub fn fingerprint(&self) -> String {
        if self.is_abstract() {
            "Grain<Abstract>".to_string()
        } else {
            format!(
                "Grain<{}>",
                self.components.iter().cloned().collect::<Vec<_>>().join(",")
            )
        }
    }
}

impl PartialEq for Grain {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for Grain {}

impl fmt::Display for Grain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.condition {
            Some(condition) => write!(f, "{}|{}", self.fingerprint(), condition),
            None => write!(f, "{}", self.fingerprint()),
        }
    }
}
