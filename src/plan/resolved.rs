//! Resolved datasources: the concrete join/grain/condition description a
//! plan node resolves to.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{Condition, Datasource, Grain};

/// Kind of relational step a resolved datasource performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Select,
    Group,
    Filter,
    Window,
    Unnest,
    Recursive,
    Union,
    Merge,
    Constant,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceType::Select => "select",
            SourceType::Group => "group",
            SourceType::Filter => "filter",
            SourceType::Window => "window",
            SourceType::Unnest => "unnest",
            SourceType::Recursive => "recursive",
            SourceType::Union => "union",
            SourceType::Merge => "merge",
            SourceType::Constant => "constant",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Inner,
    LeftOuter,
    Full,
    Cross,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JoinType::Inner => "inner",
            JoinType::LeftOuter => "left outer",
            JoinType::Full => "full",
            JoinType::Cross => "cross",
        };
        write!(f, "{}", name)
    }
}

/// One equality key of a join. `existing` is the left-side source the
/// key is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConceptPair {
    pub left: String,
    pub right: String,
    pub existing: String,
}

/// A join between two sources of a resolved datasource, by identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BaseJoin {
    /// `None` when keys come from several left sources.
    pub left: Option<String>,
    pub right: String,
    pub join_type: JoinType,
    pub concept_pairs: Vec<ConceptPair>,
}

impl BaseJoin {
    pub fn keys(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for pair in &self.concept_pairs {
            if !out.contains(&pair.left) {
                out.push(pair.left.clone());
            }
        }
        out
    }
}

impl fmt::Display for BaseJoin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .concept_pairs
            .iter()
            .map(|p| {
                if p.left == p.right {
                    p.left.clone()
                } else {
                    format!("{}={}", p.left, p.right)
                }
            })
            .collect();
        write!(
            f,
            "{} join {} to {} on [{}]",
            self.join_type,
            self.left.as_deref().unwrap_or("*"),
            self.right,
            keys.join(", ")
        )
    }
}

/// Array expansion joined onto the row stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnnestJoin {
    pub concepts: Vec<String>,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolvedJoin {
    Base(BaseJoin),
    Unnest(UnnestJoin),
}

/// A child of a resolved datasource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedSource {
    Datasource(Datasource),
    Query(Rc<ResolvedDatasource>),
}

impl ResolvedSource {
    pub fn identifier(&self) -> &str {
        match self {
            ResolvedSource::Datasource(ds) => &ds.identifier,
            ResolvedSource::Query(q) => &q.identifier,
        }
    }

    pub fn grain(&self) -> &Grain {
        match self {
            ResolvedSource::Datasource(ds) => &ds.grain,
            ResolvedSource::Query(q) => &q.grain,
        }
    }

    pub fn output_concepts(&self) -> Vec<String> {
        match self {
            ResolvedSource::Datasource(ds) => ds.output_concepts(),
            ResolvedSource::Query(q) => q.output_concepts.clone(),
        }
    }

    /// Outputs visible to consumers.
    pub fn usable_outputs(&self) -> Vec<String> {
        match self {
            ResolvedSource::Datasource(ds) => ds.output_concepts(),
            ResolvedSource::Query(q) => q.usable_outputs(),
        }
    }

    pub fn partial_concepts(&self) -> Vec<String> {
        match self {
            ResolvedSource::Datasource(ds) => ds.partial_concepts(),
            ResolvedSource::Query(q) => q.partial_concepts.clone(),
        }
    }

    pub fn nullable_concepts(&self) -> Vec<String> {
        match self {
            ResolvedSource::Datasource(ds) => ds.nullable_concepts(),
            ResolvedSource::Query(q) => q.nullable_concepts.clone(),
        }
    }

    pub fn is_hidden(&self, address: &str) -> bool {
        match self {
            ResolvedSource::Datasource(_) => false,
            ResolvedSource::Query(q) => q.hidden_concepts.contains(address),
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            ResolvedSource::Datasource(ds) => ds.where_clause.as_ref(),
            ResolvedSource::Query(q) => q.condition.as_ref(),
        }
    }

    pub fn as_query(&self) -> Option<&Rc<ResolvedDatasource>> {
        match self {
            ResolvedSource::Query(q) => Some(q),
            ResolvedSource::Datasource(_) => None,
        }
    }
}

/// The concrete relational shape of one plan node.
///
/// `source_map` maps each concept address to the identifiers of the
/// children providing it; an empty set means the concept is computed at
/// this level.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDatasource {
    pub identifier: String,
    pub source_type: SourceType,
    pub input_concepts: Vec<String>,
    pub output_concepts: Vec<String>,
    pub hidden_concepts: BTreeSet<String>,
    pub partial_concepts: Vec<String>,
    pub nullable_concepts: Vec<String>,
    pub datasources: Vec<ResolvedSource>,
    pub source_map: BTreeMap<String, BTreeSet<String>>,
    pub joins: Vec<ResolvedJoin>,
    pub grain: Grain,
    pub condition: Option<Condition>,
    pub force_group: Option<bool>,
}

impl ResolvedDatasource {
    pub fn usable_outputs(&self) -> Vec<String> {
        self.output_concepts
            .iter()
            .filter(|c| !self.hidden_concepts.contains(*c))
            .cloned()
            .collect()
    }

    /// Outputs that are fully populated here.
    pub fn full_concepts(&self) -> Vec<String> {
        self.output_concepts
            .iter()
            .filter(|c| !self.partial_concepts.contains(*c))
            .cloned()
            .collect()
    }

    pub fn base_joins(&self) -> impl Iterator<Item = &BaseJoin> {
        self.joins.iter().filter_map(|j| match j {
            ResolvedJoin::Base(base) => Some(base),
            ResolvedJoin::Unnest(_) => None,
        })
    }

    pub fn source(&self, identifier: &str) -> Option<&ResolvedSource> {
        self.datasources
            .iter()
            .find(|s| s.identifier() == identifier)
    }

    /// Combine two resolutions of the same underlying sources.
    pub fn merged_with(&self, other: &ResolvedDatasource) -> ResolvedDatasource {
        let mut merged = self.clone();
        for concept in &other.output_concepts {
            if !merged.output_concepts.contains(concept) {
                merged.output_concepts.push(concept.clone());
            }
        }
        for concept in &other.input_concepts {
            if !merged.input_concepts.contains(concept) {
                merged.input_concepts.push(concept.clone());
            }
        }
        for (address, sources) in &other.source_map {
            merged
                .source_map
                .entry(address.clone())
                .or_default()
                .extend(sources.iter().cloned());
        }
        // Hidden only if hidden on both sides
        merged.hidden_concepts = self
            .hidden_concepts
            .intersection(&other.hidden_concepts)
            .cloned()
            .collect();
        merged.partial_concepts.retain(|c| {
            other.partial_concepts.contains(c) || !other.output_concepts.contains(c)
        });
        for concept in &other.partial_concepts {
            if !self.output_concepts.contains(concept) && !merged.partial_concepts.contains(concept)
            {
                merged.partial_concepts.push(concept.clone());
            }
        }
        merged
    }
}

/// Stable identifier for a resolution built from its sources, grain and
/// condition.
pub fn build_identifier(
    prefix: &str,
    sources: &[ResolvedSource],
    grain: &Grain,
    condition: Option<&Condition>,
) -> String {
    let mut base = if sources.is_empty() {
        prefix.to_string()
    } else {
        sources
            .iter()
            .map(|s| s.identifier().to_string())
            .collect::<Vec<_>>()
            .join("_join_")
    };
    if !sources.is_empty() && prefix != "select" {
        base = format!("{}_{}", prefix, base);
    }
    if !grain.is_abstract() {
        let components: Vec<&str> = grain
            .components
            .iter()
            .map(|c| c.rsplit('.').next().unwrap_or(c))
            .collect();
        base = format!("{}_at_{}", base, components.join("_"));
    }
    if let Some(condition) = condition {
        base = format!("{}_filtered_{}", base, short_hash(&condition.to_string()));
    }
    base
}

/// First eight hex characters of the SHA256 of `text`.
fn short_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, ComparisonOp, Expr};

    fn items() -> Datasource {
        Datasource::new(
            "items",
            vec![Column::new("id", "id"), Column::new("cat", "cat").partial()],
            ["id"],
        )
    }

    #[test]
    fn test_identifier_carries_grain_and_condition() {
        let sources = vec![ResolvedSource::Datasource(items())];
        let grain = Grain::new(["local.id"]);
        assert_eq!(
            build_identifier("select", &sources, &grain, None),
            "items_at_id"
        );
        let condition = Condition::compare(
            Expr::concept("local.cat"),
            ComparisonOp::Eq,
            Expr::string("a"),
        );
        let filtered = build_identifier("select", &sources, &grain, Some(&condition));
        assert!(filtered.starts_with("items_at_id_filtered_"));
        assert_eq!(
            build_identifier("group", &sources, &Grain::new(["local.cat"]), None),
            "group_items_at_cat"
        );
    }

    #[test]
    fn test_datasource_source_reports_partials() {
        let source = ResolvedSource::Datasource(items());
        assert_eq!(source.partial_concepts(), vec!["local.cat"]);
        assert!(!source.is_hidden("local.cat"));
    }
}
