//! Replace constant concepts read from a parent with their literal value.

use tracing::debug;

use crate::config::OptimizerConfig;
use crate::error::PlanningResult;
use crate::model::{Derivation, Environment};
use crate::plan::SourceType;

use super::{CteJoin, CtePlan, InverseMap, OptimizationRule};

#[derive(Debug, Default)]
pub struct InlineConstant;

impl InlineConstant {
    pub fn new(_config: &OptimizerConfig) -> Self {
        Self
    }
}

impl OptimizationRule for InlineConstant {
    fn name(&self) -> &'static str {
        "inline_constant"
    }

    fn optimize(
        &mut self,
        plan: &mut CtePlan,
        name: &str,
        _inverse: &InverseMap,
        env: &Environment,
    ) -> PlanningResult<bool> {
        let constant_parents: Vec<String> = plan
            .ctes
            .iter()
            .filter(|c| c.source_type == SourceType::Constant)
            .map(|c| c.name.clone())
            .collect();
        let Some(cte) = plan.get_mut(name) else {
            return Ok(false);
        };

        let mut changed = false;
        for input in cte.input_concepts.clone() {
            let read = cte.source_map.get(&input).is_some_and(|s| !s.is_empty());
            if !read {
                continue;
            }
            let Some(concept) = env.concepts.get(&input) else {
                continue;
            };
            if concept.derivation != Derivation::Constant {
                continue;
            }
            let Some(literal) = concept.lineage.as_ref().and_then(|l| l.constant_value()) else {
                continue;
            };
            if let Some(condition) = cte.condition.as_mut() {
                condition.inline_literal(&input, literal);
            }
            cte.inlined_constants.insert(input.clone(), literal.clone());
            cte.source_map.insert(input.clone(), Vec::new());
            debug!(cte = %name, constant = %input, value = %literal, "inlined constant");
            changed = true;
        }
        if !changed {
            return Ok(false);
        }

        // constant-only parents nothing reads any more
        let unread: Vec<String> = cte
            .parent_ctes
            .iter()
            .filter(|p| constant_parents.contains(p))
            .filter(|p| !cte.source_map.values().any(|s| s.contains(p)))
            .cloned()
            .collect();
        cte.parent_ctes.retain(|p| !unread.contains(p));
        cte.joins.retain(|join| match join {
            CteJoin::Base { left, right, .. } => {
                !unread.contains(right) && !left.as_ref().is_some_and(|l| unread.contains(l))
            }
            CteJoin::Unnest(_) => true,
        });
        Ok(true)
    }
}
