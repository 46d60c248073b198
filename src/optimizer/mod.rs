//! CTE optimizer.
//!
//! Rewrites run over the lowered CTE list, never over plan nodes:
//!
//! ```text
//!   lower_plan ─▶ direct return ─▶ [InlineDatasource, PredicatePushdown,
//!                                   PredicatePushdownRemove, InlineConstant,
//!                                   MergeAggregate] ─▶ filter + reorder
//! ```
//!
//! Each rule is applied to the root and then every other CTE (children
//! first) until a whole pass changes nothing.

mod cte;
mod inline_constant;
mod inline_datasource;
mod merge_aggregate;
mod pushdown;

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info};

use crate::config::OptimizerConfig;
use crate::error::{PlanningError, PlanningResult};
use crate::model::{Condition, Derivation, Environment};
use crate::plan::SourceType;

pub use cte::{lower_plan, Cte, CteJoin, CtePlan};
pub use inline_constant::InlineConstant;
pub use inline_datasource::InlineDatasource;
pub use merge_aggregate::MergeAggregate;
pub use pushdown::{PredicatePushdown, PredicatePushdownRemove};

/// CTE name to the names of the CTEs reading it.
pub type InverseMap = BTreeMap<String, Vec<String>>;

/// A rewrite applied to one CTE at a time.
pub trait OptimizationRule {
    fn name(&self) -> &'static str;

    /// Rewrite the CTE called `name`; true if anything changed.
    fn optimize(
        &mut self,
        plan: &mut CtePlan,
        name: &str,
        inverse: &InverseMap,
        env: &Environment,
    ) -> PlanningResult<bool>;
}

pub(crate) const SENSITIVE_DERIVATIONS: [Derivation; 3] =
    [Derivation::Window, Derivation::Unnest, Derivation::Recursive];

pub(crate) fn is_sensitive(env: &Environment, address: &str) -> bool {
    env.concepts
        .get(address)
        .is_some_and(|c| SENSITIVE_DERIVATIONS.contains(&c.derivation))
}

pub fn gen_inverse_map(ctes: &[Cte]) -> InverseMap {
    let mut inverse = InverseMap::new();
    for cte in ctes {
        for parent in &cte.parent_ctes {
            let children = inverse.entry(parent.clone()).or_default();
            if !children.contains(&cte.name) {
                children.push(cte.name.clone());
            }
        }
    }
    inverse
}

/// Drop every CTE the root does not read, directly or transitively.
pub fn filter_irrelevant_ctes(plan: &mut CtePlan) {
    let mut relevant: BTreeSet<String> = BTreeSet::new();
    let mut stack = vec![plan.root.clone()];
    while let Some(name) = stack.pop() {
        if !relevant.insert(name.clone()) {
            continue;
        }
        if let Some(cte) = plan.get(&name) {
            stack.extend(cte.parent_ctes.iter().cloned());
        }
    }
    let before = plan.ctes.len();
    plan.ctes.retain(|c| relevant.contains(&c.name));
    if plan.ctes.len() != before {
        debug!(removed = before - plan.ctes.len(), "dropped unreachable ctes");
    }
}

/// Order CTEs parents first.
pub fn reorder_ctes(plan: &mut CtePlan) -> PlanningResult<()> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let indices: BTreeMap<String, NodeIndex> = plan
        .ctes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.clone(), graph.add_node(i)))
        .collect();
    for cte in &plan.ctes {
        for parent in &cte.parent_ctes {
            if let (Some(&from), Some(&to)) = (indices.get(parent), indices.get(&cte.name)) {
                graph.add_edge(from, to, ());
            }
        }
    }
    let order = toposort(&graph, None).map_err(|cycle| PlanningError::CyclicPlan {
        node: plan.ctes[graph[cycle.node_id()]].name.clone(),
    })?;
    let mut slots: Vec<Option<Cte>> = plan.ctes.drain(..).map(Some).collect();
    plan.ctes = order
        .into_iter()
        .filter_map(|idx| slots[graph[idx]].take())
        .collect();
    Ok(())
}

// ============================================================================
// Direct return
// ============================================================================

/// The root's single parent, if the root can be dropped in its favour.
pub fn is_direct_return_eligible(plan: &CtePlan, env: &Environment) -> Option<String> {
    let root = plan.root_cte()?;
    let [parent_name] = root.parent_ctes.as_slice() else {
        return None;
    };
    if !root.datasources.is_empty() || !root.joins.is_empty() {
        return None;
    }
    let parent = plan.get(parent_name)?;
    if matches!(parent.source_type, SourceType::Union | SourceType::Recursive) {
        return None;
    }
    if !root
        .output_columns
        .iter()
        .all(|c| parent.output_columns.contains(c))
    {
        return None;
    }
    if parent.grain != root.grain {
        debug!(root = %root.name, parent = %parent.name, "grain mismatch, cannot return directly");
        return None;
    }
    if root.derived_concepts().iter().any(|c| is_sensitive(env, c)) {
        return None;
    }
    let condition_args = root
        .condition
        .as_ref()
        .map(Condition::row_arguments)
        .unwrap_or_default();
    let parent_derived = parent.derived_concepts();
    for arg in &condition_args {
        if !parent_derived.contains(&arg) {
            continue;
        }
        if is_sensitive(env, arg) {
            return None;
        }
        let Some(concept) = env.concepts.get(arg) else {
            continue;
        };
        for input in concept.concept_arguments() {
            if !parent.input_concepts.contains(&input) && is_sensitive(env, &input) {
                return None;
            }
        }
    }
    Some(parent.name.clone())
}

/// Replace the root with its parent, carrying over the root's condition
/// and visible column order.
fn collapse_root(plan: &mut CtePlan, parent_name: &str) {
    let Some(root) = plan.root_cte().cloned() else {
        return;
    };
    let Some(parent) = plan.get_mut(parent_name) else {
        return;
    };
    info!(root = %root.name, parent = %parent.name, "returning parent directly");
    if let Some(condition) = &root.condition {
        parent.condition = Some(Condition::conjoin(parent.condition.take(), condition.clone()));
    }
    let visible = root.usable_outputs();
    let mut columns = visible.clone();
    columns.extend(
        parent
            .output_columns
            .iter()
            .filter(|c| !visible.contains(c))
            .cloned(),
    );
    for column in &columns {
        if !visible.contains(column) {
            parent.hidden_concepts.insert(column.clone());
        }
    }
    parent.hidden_concepts.extend(root.hidden_concepts);
    parent.output_columns = columns;
    plan.root = parent_name.to_string();
}

// ============================================================================
// Driver
// ============================================================================

fn registered_rules(config: &OptimizerConfig) -> Vec<Box<dyn OptimizationRule>> {
    let mut rules: Vec<Box<dyn OptimizationRule>> = Vec::new();
    if config.datasource_inlining {
        rules.push(Box::new(InlineDatasource::new(config)));
    }
    if config.predicate_pushdown {
        rules.push(Box::new(PredicatePushdown::new(config)));
    }
    if config.predicate_pushdown_remove {
        rules.push(Box::new(PredicatePushdownRemove::new(config)));
    }
    if config.constant_inlining {
        rules.push(Box::new(InlineConstant::new(config)));
    }
    if config.merge_aggregate {
        rules.push(Box::new(MergeAggregate::new(config)));
    }
    rules
}

/// Run every enabled rule to a fixed point.
pub fn optimize_ctes(
    mut plan: CtePlan,
    env: &Environment,
    config: &OptimizerConfig,
) -> PlanningResult<CtePlan> {
    if config.direct_return {
        let mut loops = 0;
        while let Some(parent) = is_direct_return_eligible(&plan, env) {
            loops += 1;
            if loops > config.max_loops {
                return Err(PlanningError::IterationLimit {
                    stage: "direct return".to_string(),
                    limit: config.max_loops,
                });
            }
            collapse_root(&mut plan, &parent);
        }
        filter_irrelevant_ctes(&mut plan);
    }

    for mut rule in registered_rules(config) {
        let mut loops = 0;
        loop {
            if loops >= config.max_loops {
                return Err(PlanningError::IterationLimit {
                    stage: format!("optimizer rule {}", rule.name()),
                    limit: config.max_loops,
                });
            }
            loops += 1;
            let mut look_at = vec![plan.root.clone()];
            look_at.extend(
                plan.ctes
                    .iter()
                    .rev()
                    .map(|c| c.name.clone())
                    .filter(|n| n != &plan.root),
            );
            let mut changed = false;
            for name in look_at {
                if plan.get(&name).is_none() {
                    continue;
                }
                let inverse = gen_inverse_map(&plan.ctes);
                changed |= rule.optimize(&mut plan, &name, &inverse, env)?;
            }
            filter_irrelevant_ctes(&mut plan);
            reorder_ctes(&mut plan)?;
            if !changed {
                break;
            }
        }
        info!(rule = rule.name(), loops, ctes = plan.ctes.len(), "finished optimizer rule");
    }
    filter_irrelevant_ctes(&mut plan);
    reorder_ctes(&mut plan)?;
    Ok(plan)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{Cte, CtePlan};
    use crate::model::{Condition, Datasource, Grain};
    use crate::plan::SourceType;

    /// A CTE with every column read from `parents` (or computed if none).
    pub fn cte(name: &str, source_type: SourceType, parents: &[&str], columns: &[&str]) -> Cte {
        let parent_ctes: Vec<String> = parents.iter().map(|p| p.to_string()).collect();
        Cte {
            name: name.to_string(),
            source_type,
            parent_ctes: parent_ctes.clone(),
            datasources: Vec::new(),
            source_map: columns
                .iter()
                .map(|c| (c.to_string(), parent_ctes.clone()))
                .collect(),
            input_concepts: if parents.is_empty() {
                Vec::new()
            } else {
                columns.iter().map(|c| c.to_string()).collect()
            },
            output_columns: columns.iter().map(|c| c.to_string()).collect(),
            hidden_concepts: BTreeSet::new(),
            partial_concepts: Vec::new(),
            nullable_concepts: Vec::new(),
            grain: Grain::abstract_grain(),
            group_to_grain: false,
            joins: Vec::new(),
            condition: None,
            inlined_constants: BTreeMap::new(),
        }
    }

    /// A bare select over `datasource`.
    pub fn root_select(name: &str, datasource: &Datasource) -> Cte {
        let columns = datasource.output_concepts();
        let mut cte = cte(name, SourceType::Select, &[], &[]);
        cte.source_map = columns
            .iter()
            .map(|c| (c.clone(), vec![datasource.identifier.clone()]))
            .collect();
        cte.input_concepts = columns.clone();
        cte.output_columns = columns;
        cte.grain = datasource.grain.clone();
        cte.datasources = vec![datasource.clone()];
        cte
    }

    pub fn with_condition(mut cte: Cte, condition: Condition) -> Cte {
        cte.condition = Some(condition);
        cte
    }

    pub fn plan(ctes: Vec<Cte>, root: &str) -> CtePlan {
        CtePlan {
            ctes,
            root: root.to_string(),
        }
    }
}
