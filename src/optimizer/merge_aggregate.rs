//! Fold an aggregate into the single CTE it reads from.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::config::OptimizerConfig;
use crate::error::PlanningResult;
use crate::model::Environment;
use crate::plan::SourceType;

use super::{is_sensitive, Cte, CtePlan, InverseMap, OptimizationRule};

/// Merges a join-free, unconditioned aggregate into its parent when that
/// parent has no other consumer. The parent then groups to the
/// aggregate's grain itself.
#[derive(Debug, Default)]
pub struct MergeAggregate {
    completed: BTreeSet<String>,
}

impl MergeAggregate {
    pub fn new(_config: &OptimizerConfig) -> Self {
        Self::default()
    }
}

fn has_unsafe_derivations(cte: &Cte, env: &Environment) -> bool {
    cte.output_columns.iter().any(|c| is_sensitive(env, c))
}

impl OptimizationRule for MergeAggregate {
    fn name(&self) -> &'static str {
        "merge_aggregate"
    }

    fn optimize(
        &mut self,
        plan: &mut CtePlan,
        name: &str,
        inverse: &InverseMap,
        env: &Environment,
    ) -> PlanningResult<bool> {
        if self.completed.contains(name) {
            return Ok(false);
        }
        let Some(cte) = plan.get(name) else {
            return Ok(false);
        };
        if cte.source_type != SourceType::Group && !cte.group_to_grain {
            return Ok(false);
        }
        if !cte.joins.is_empty() || cte.condition.is_some() || !cte.datasources.is_empty() {
            return Ok(false);
        }
        let [parent_name] = cte.parent_ctes.as_slice() else {
            return Ok(false);
        };
        let Some(parent) = plan.get(parent_name) else {
            return Ok(false);
        };
        if matches!(
            parent.source_type,
            SourceType::Union | SourceType::Recursive | SourceType::Group | SourceType::Constant
        ) || parent.group_to_grain
        {
            trace!(cte = %name, parent = %parent.name, "parent cannot absorb an aggregate");
            return Ok(false);
        }
        let children = inverse.get(parent_name).map(Vec::as_slice).unwrap_or_default();
        if children.len() != 1 || children[0] != name {
            trace!(cte = %name, parent = %parent.name, children = ?children, "parent is shared");
            return Ok(false);
        }
        if has_unsafe_derivations(parent, env) {
            trace!(parent = %parent.name, "parent has unsafe derivations");
            return Ok(false);
        }

        let aggregate = cte.clone();
        let parent_name = parent_name.clone();
        let Some(parent) = plan.get_mut(&parent_name) else {
            return Ok(false);
        };
        debug!(cte = %name, parent = %parent_name, "merging aggregate into parent");
        for column in &aggregate.output_columns {
            if aggregate.source_map.get(column).is_some_and(|s| s.is_empty()) {
                parent.source_map.insert(column.clone(), Vec::new());
            }
        }
        parent.output_columns = aggregate.output_columns.clone();
        parent.hidden_concepts = aggregate.hidden_concepts.clone();
        parent.partial_concepts.retain(|c| aggregate.partial_concepts.contains(c));
        parent.nullable_concepts = aggregate.nullable_concepts.clone();
        parent.grain = aggregate.grain.clone();
        parent.group_to_grain = true;

        for child in inverse.get(name).into_iter().flatten() {
            if let Some(child) = plan.get_mut(child) {
                child.replace_parent(name, &parent_name);
            }
        }
        if plan.root == name {
            plan.root = parent_name;
        }
        self.completed.insert(name.to_string());
        Ok(true)
    }
}
