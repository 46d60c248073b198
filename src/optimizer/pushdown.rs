//! Predicate pushdown: move row filters into the CTEs that read the rows.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::config::OptimizerConfig;
use crate::error::PlanningResult;
use crate::model::{Condition, Environment};

use super::{CtePlan, InverseMap, OptimizationRule};

fn is_child_of(term: &Condition, parent: Option<&Condition>) -> bool {
    parent.is_some_and(|p| term.is_child_of(p))
}

/// Conjoins a child's scalar terms onto a parent when every consumer of
/// that parent already filters by them.
#[derive(Debug, Default)]
pub struct PredicatePushdown {
    complete: BTreeMap<String, bool>,
}

impl PredicatePushdown {
    pub fn new(_config: &OptimizerConfig) -> Self {
        Self::default()
    }

    fn check_parent(
        plan: &mut CtePlan,
        parent_name: &str,
        term: &Condition,
        inverse: &InverseMap,
        env: &Environment,
    ) -> bool {
        let Some(parent) = plan.get(parent_name) else {
            return false;
        };
        if is_child_of(term, parent.condition.as_ref()) {
            return false;
        }
        let rows: BTreeSet<String> = term.row_arguments().into_iter().collect();
        let mut materialized = parent.materialized();
        if rows.is_empty() || materialized.is_empty() {
            return false;
        }
        // a bare datasource can filter on any of its columns
        let mut borrowed: Vec<(String, String)> = Vec::new();
        if let Some(datasource) = parent.root_datasource() {
            if rows.iter().all(|r| datasource.provides(r)) {
                for row in rows.iter().filter(|r| !materialized.contains(*r)) {
                    borrowed.push((row.clone(), datasource.identifier.clone()));
                }
                materialized.extend(borrowed.iter().map(|(r, _)| r.clone()));
            }
        }
        if !rows.is_subset(&materialized) {
            trace!(
                parent = %parent.name,
                term = %term,
                "term inputs not materialized on parent"
            );
            return false;
        }
        let children = inverse.get(parent_name).map(Vec::as_slice).unwrap_or_default();
        let shared = children.iter().all(|child| {
            plan.get(child)
                .is_some_and(|c| is_child_of(term, c.condition.as_ref()))
        });
        if !shared {
            trace!(parent = %parent.name, term = %term, "a sibling does not filter by term");
            return false;
        }
        if let Some(existing) = &parent.condition {
            if !existing.is_scalar(env, Some(&materialized)) {
                debug!(parent = %parent.name, "parent condition is not scalar, not pushing");
                return false;
            }
        }

        let Some(parent) = plan.get_mut(parent_name) else {
            return false;
        };
        debug!(
            parent = %parent.name,
            children = children.len(),
            term = %term,
            "pushing term into parent"
        );
        for (row, source) in borrowed {
            parent.source_map.insert(row, vec![source]);
        }
        parent.condition = Some(Condition::conjoin(parent.condition.take(), term.clone()));
        true
    }
}

impl OptimizationRule for PredicatePushdown {
    fn name(&self) -> &'static str {
        "predicate_pushdown"
    }

    fn optimize(
        &mut self,
        plan: &mut CtePlan,
        name: &str,
        inverse: &InverseMap,
        env: &Environment,
    ) -> PlanningResult<bool> {
        let Some(cte) = plan.get(name) else {
            return Ok(false);
        };
        if cte.parent_ctes.is_empty() || self.complete.get(name).copied().unwrap_or(false) {
            return Ok(false);
        }
        let Some(condition) = cte.condition.clone() else {
            return Ok(false);
        };
        let parents = cte.parent_ctes.clone();

        let mut changed = false;
        for term in condition.decompose() {
            if !term.is_scalar(env, None) || !term.existence_arguments().is_empty() {
                trace!(cte = %name, term = %term, "term cannot be pushed");
                continue;
            }
            for parent in &parents {
                if Self::check_parent(plan, parent, &term, inverse, env) {
                    self.complete.insert(parent.clone(), false);
                    changed = true;
                }
            }
        }
        self.complete.insert(name.to_string(), true);
        Ok(changed)
    }
}

/// Drops a child's condition once every parent already applies it.
#[derive(Debug, Default)]
pub struct PredicatePushdownRemove;

impl PredicatePushdownRemove {
    pub fn new(_config: &OptimizerConfig) -> Self {
        Self
    }
}

impl OptimizationRule for PredicatePushdownRemove {
    fn name(&self) -> &'static str {
        "predicate_pushdown_remove"
    }

    fn optimize(
        &mut self,
        plan: &mut CtePlan,
        name: &str,
        _inverse: &InverseMap,
        _env: &Environment,
    ) -> PlanningResult<bool> {
        let Some(cte) = plan.get(name) else {
            return Ok(false);
        };
        let Some(condition) = &cte.condition else {
            return Ok(false);
        };
        if cte.parent_ctes.is_empty() || !cte.datasources.is_empty() {
            return Ok(false);
        }
        let existence = condition.existence_arguments();
        let mut existence_only: Vec<String> = Vec::new();
        for parent_name in &cte.parent_ctes {
            let Some(parent) = plan.get(parent_name) else {
                return Ok(false);
            };
            if !existence.is_empty() && parent.output_columns.iter().all(|c| existence.contains(c)) {
                existence_only.push(parent_name.clone());
                continue;
            }
            if !is_child_of(condition, parent.condition.as_ref()) {
                return Ok(false);
            }
        }
        if existence_only.len() == cte.parent_ctes.len() {
            return Ok(false);
        }

        let Some(cte) = plan.get_mut(name) else {
            return Ok(false);
        };
        debug!(cte = %name, dropped_parents = ?existence_only, "parents already apply condition, removing it");
        cte.condition = None;
        cte.parent_ctes.retain(|p| !existence_only.contains(p));
        for sources in cte.source_map.values_mut() {
            sources.retain(|s| !existence_only.contains(s));
        }
        Ok(true)
    }
}
