//! CTE form of a resolved plan: one named step per resolved datasource,
//! parents referenced by name.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde::Serialize;
use tracing::trace;

use crate::error::PlanningResult;
use crate::model::{Condition, Datasource, Grain, Literal};
use crate::plan::{
    BaseJoin, JoinType, PlanArena, PlanId, ResolvedDatasource, ResolvedJoin, ResolvedSource,
    SourceType, UnnestJoin,
};

/// A join between two steps (or raw datasources) of a CTE, by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CteJoin {
    Base {
        left: Option<String>,
        right: String,
        join_type: JoinType,
        keys: Vec<(String, String)>,
    },
    Unnest(UnnestJoin),
}

impl CteJoin {
    fn from_resolved(join: &ResolvedJoin) -> Self {
        match join {
            ResolvedJoin::Base(BaseJoin {
                left,
                right,
                join_type,
                concept_pairs,
            }) => CteJoin::Base {
                left: left.clone(),
                right: right.clone(),
                join_type: *join_type,
                keys: concept_pairs
                    .iter()
                    .map(|p| (p.left.clone(), p.right.clone()))
                    .collect(),
            },
            ResolvedJoin::Unnest(unnest) => CteJoin::Unnest(unnest.clone()),
        }
    }

    /// Point every reference to `old` at `new`.
    pub fn rename(&mut self, old: &str, new: &str) {
        if let CteJoin::Base { left, right, .. } = self {
            if left.as_deref() == Some(old) {
                *left = Some(new.to_string());
            }
            if right == old {
                *right = new.to_string();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cte {
    pub name: String,
    pub source_type: SourceType,
    /// Steps this one reads, by name.
    pub parent_ctes: Vec<String>,
    /// Raw datasources read directly.
    pub datasources: Vec<Datasource>,
    /// Address to the parent steps or datasources providing it. Empty
    /// means computed here.
    pub source_map: BTreeMap<String, Vec<String>>,
    pub input_concepts: Vec<String>,
    pub output_columns: Vec<String>,
    pub hidden_concepts: BTreeSet<String>,
    pub partial_concepts: Vec<String>,
    pub nullable_concepts: Vec<String>,
    pub grain: Grain,
    pub group_to_grain: bool,
    pub joins: Vec<CteJoin>,
    pub condition: Option<Condition>,
    /// Constants replaced by their literal value.
    pub inlined_constants: BTreeMap<String, Literal>,
}

impl Cte {
    /// An ungrouped select over exactly one datasource.
    pub fn is_root_datasource(&self) -> bool {
        self.source_type == SourceType::Select
            && !self.group_to_grain
            && self.parent_ctes.is_empty()
            && self.datasources.len() == 1
            && self.joins.is_empty()
    }

    pub fn root_datasource(&self) -> Option<&Datasource> {
        if self.is_root_datasource() {
            self.datasources.first()
        } else {
            None
        }
    }

    /// Concepts produced here rather than read from a parent.
    pub fn derived_concepts(&self) -> Vec<&String> {
        self.output_columns
            .iter()
            .filter(|c| !self.input_concepts.contains(*c))
            .collect()
    }

    /// Addresses actually read from some source.
    pub fn materialized(&self) -> BTreeSet<String> {
        self.source_map
            .iter()
            .filter(|(_, sources)| !sources.is_empty())
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn usable_outputs(&self) -> Vec<String> {
        self.output_columns
            .iter()
            .filter(|c| !self.hidden_concepts.contains(*c))
            .cloned()
            .collect()
    }

    /// Swap parent `old` for `new` everywhere it is referenced.
    pub fn replace_parent(&mut self, old: &str, new: &str) {
        let mut parents: Vec<String> = Vec::with_capacity(self.parent_ctes.len());
        for parent in self.parent_ctes.drain(..) {
            let parent = if parent == old { new.to_string() } else { parent };
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }
        self.parent_ctes = parents;
        for sources in self.source_map.values_mut() {
            for source in sources.iter_mut() {
                if source == old {
                    *source = new.to_string();
                }
            }
            sources.dedup();
        }
        for join in &mut self.joins {
            join.rename(old, new);
        }
    }

    /// Read `parent`'s datasource directly instead of through the parent.
    pub fn inline_parent_datasource(&mut self, parent: &Cte) -> bool {
        let Some(datasource) = parent.root_datasource() else {
            return false;
        };
        let before = self.parent_ctes.len();
        self.parent_ctes.retain(|p| p != &parent.name);
        if self.parent_ctes.len() == before {
            return false;
        }
        for sources in self.source_map.values_mut() {
            for source in sources.iter_mut() {
                if *source == parent.name {
                    *source = datasource.identifier.clone();
                }
            }
        }
        for join in &mut self.joins {
            join.rename(&parent.name, &datasource.identifier);
        }
        if !self
            .datasources
            .iter()
            .any(|d| d.identifier == datasource.identifier)
        {
            self.datasources.push(datasource.clone());
        }
        true
    }
}

/// A lowered plan: its steps and the one whose rows are the query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CtePlan {
    pub ctes: Vec<Cte>,
    pub root: String,
}

impl CtePlan {
    pub fn get(&self, name: &str) -> Option<&Cte> {
        self.ctes.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cte> {
        self.ctes.iter_mut().find(|c| c.name == name)
    }

    pub fn root_cte(&self) -> Option<&Cte> {
        self.get(&self.root)
    }

    pub fn names(&self) -> Vec<String> {
        self.ctes.iter().map(|c| c.name.clone()).collect()
    }
}

// ============================================================================
// Lowering
// ============================================================================

/// Lower the resolved tree under `root` into named steps, parents first.
pub fn lower_plan(arena: &PlanArena, root: PlanId) -> PlanningResult<CtePlan> {
    let resolved = arena.resolve(root)?;
    let mut ctes: Vec<Cte> = Vec::new();
    lower(&resolved, &mut ctes);
    trace!(root = %resolved.identifier, ctes = ctes.len(), "lowered plan");
    Ok(CtePlan {
        ctes,
        root: resolved.identifier.clone(),
    })
}

fn lower(resolved: &Rc<ResolvedDatasource>, out: &mut Vec<Cte>) {
    if out.iter().any(|c| c.name == resolved.identifier) {
        return;
    }
    let mut parent_ctes = Vec::new();
    let mut datasources = Vec::new();
    for source in &resolved.datasources {
        match source {
            ResolvedSource::Query(query) => {
                lower(query, out);
                if !parent_ctes.contains(&query.identifier) {
                    parent_ctes.push(query.identifier.clone());
                }
            }
            ResolvedSource::Datasource(datasource) => datasources.push(datasource.clone()),
        }
    }
    out.push(Cte {
        name: resolved.identifier.clone(),
        source_type: resolved.source_type,
        parent_ctes,
        group_to_grain: group_to_grain(resolved, &datasources),
        datasources,
        source_map: resolved
            .source_map
            .iter()
            .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
            .collect(),
        input_concepts: resolved.input_concepts.clone(),
        output_columns: resolved.output_concepts.clone(),
        hidden_concepts: resolved.hidden_concepts.clone(),
        partial_concepts: resolved.partial_concepts.clone(),
        nullable_concepts: resolved.nullable_concepts.clone(),
        grain: resolved.grain.clone(),
        joins: resolved.joins.iter().map(CteJoin::from_resolved).collect(),
        condition: resolved.condition.clone(),
        inlined_constants: BTreeMap::new(),
    });
}

fn group_to_grain(resolved: &ResolvedDatasource, datasources: &[Datasource]) -> bool {
    match (resolved.source_type, resolved.force_group) {
        (SourceType::Group, _) | (_, Some(true)) => true,
        (_, Some(false)) => false,
        (SourceType::Select, None) => datasources
            .iter()
            .any(|d| !d.grain.issubset(&resolved.grain)),
        _ => false,
    }
}
