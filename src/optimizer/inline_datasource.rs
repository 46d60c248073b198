//! Read bare datasources directly instead of through a pass-through CTE.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::config::OptimizerConfig;
use crate::error::PlanningResult;
use crate::model::Environment;

use super::{Cte, CtePlan, InverseMap, OptimizationRule};

/// Inlines unconditioned root-datasource parents into their consumers.
///
/// A parent is first recorded as a candidate; it is inlined on a later
/// pass unless the same datasource is referenced more than `cutoff` times.
/// Parents grouped coarser than their datasource are never inlined, so the
/// consumer keeps its grain.
#[derive(Debug)]
pub struct InlineDatasource {
    cutoff: usize,
    candidates: BTreeMap<String, BTreeSet<String>>,
    count: BTreeMap<String, usize>,
}

impl InlineDatasource {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            cutoff: config.inline_datasource_cutoff,
            candidates: BTreeMap::new(),
            count: BTreeMap::new(),
        }
    }
}

fn can_inline(cte: &Cte, parent: &Cte) -> bool {
    let Some(datasource) = parent.root_datasource() else {
        return false;
    };
    if parent.condition.is_some() {
        trace!(parent = %parent.name, "parent has a condition");
        return false;
    }
    let inherited_ok = cte
        .source_map
        .iter()
        .filter(|(_, sources)| sources.contains(&parent.name))
        .all(|(address, _)| datasource.provides(address));
    if !inherited_ok {
        debug!(parent = %parent.name, "datasource lacks inputs read from parent");
        return false;
    }
    if !datasource.grain.issubset(&parent.grain) {
        debug!(parent = %parent.name, "parent is at the wrong grain to inline");
        return false;
    }
    true
}

impl OptimizationRule for InlineDatasource {
    fn name(&self) -> &'static str {
        "inline_datasource"
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
        let replaceable: Vec<Cte> = cte
            .parent_ctes
            .iter()
            .filter_map(|p| plan.get(p))
            .filter(|p| can_inline(cte, p))
            .cloned()
            .collect();

        let mut changed = false;
        for parent in replaceable {
            let Some(identifier) = parent.root_datasource().map(|ds| ds.identifier.clone()) else {
                continue;
            };
            let seen = self.candidates.entry(name.to_string()).or_default();
            if seen.insert(parent.name.clone()) {
                *self.count.entry(identifier).or_default() += 1;
                return Ok(true);
            }
            let uses = self.count.get(&identifier).copied().unwrap_or_default();
            if uses > self.cutoff {
                debug!(datasource = %identifier, parent = %parent.name, uses, "too many references, not inlining");
                continue;
            }
            let Some(cte) = plan.get_mut(name) else {
                break;
            };
            if cte.inline_parent_datasource(&parent) {
                debug!(cte = %name, parent = %parent.name, "inlined datasource");
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Column, ComparisonOp, Condition, Datasource, Expr};
    use crate::optimizer::testing::{cte, plan, root_select};
    use crate::optimizer::{gen_inverse_map, optimize_ctes};
    use crate::plan::SourceType;

    fn items() -> Datasource {
        Datasource::new(
            "items",
            vec![Column::new("id", "id"), Column::new("cat", "cat")],
            ["id"],
        )
    }

    fn single_consumer() -> CtePlan {
        plan(
            vec![
                root_select("base", &items()),
                cte("root", SourceType::Group, &["base"], &["local.cat"]),
            ],
            "root",
        )
    }

    #[test]
    fn test_candidate_is_inlined_on_second_pass() {
        let mut p = single_consumer();
        let mut rule = InlineDatasource::new(&OptimizerConfig::default());
        let inverse = gen_inverse_map(&p.ctes);
        let env = Environment::new();
        assert!(rule.optimize(&mut p, "root", &inverse, &env).unwrap());
        assert_eq!(p.get("root").unwrap().parent_ctes, vec!["base"]);
        assert!(rule.optimize(&mut p, "root", &inverse, &env).unwrap());
        let root = p.get("root").unwrap();
        assert!(root.parent_ctes.is_empty());
        assert_eq!(root.datasources[0].identifier, "items");
        assert_eq!(root.source_map["local.cat"], vec!["items"]);
    }

    #[test]
    fn test_conditioned_parent_is_kept() {
        let mut p = single_consumer();
        p.ctes[0].condition = Some(Condition::compare(
            Expr::concept("local.cat"),
            ComparisonOp::Eq,
            Expr::string("a"),
        ));
        let config = OptimizerConfig {
            predicate_pushdown: false,
            direct_return: false,
            merge_aggregate: false,
            ..OptimizerConfig::default()
        };
        let optimized = optimize_ctes(p, &Environment::new(), &config).unwrap();
        assert_eq!(optimized.names(), vec!["base", "root"]);
    }

    #[test]
    fn test_cutoff_bounds_reuse() {
        let ds = items();
        let mut p = plan(
            vec![
                root_select("base", &ds),
                cte("a", SourceType::Group, &["base"], &["local.cat"]),
                cte("b", SourceType::Group, &["base"], &["local.cat"]),
                cte("c", SourceType::Group, &["base"], &["local.cat"]),
                cte("root", SourceType::Merge, &["a", "b", "c"], &["local.cat"]),
            ],
            "root",
        );
        for name in ["a", "b", "c"] {
            p.get_mut(name).unwrap().grain = crate::model::Grain::new(["local.cat"]);
        }
        let config = OptimizerConfig {
            inline_datasource_cutoff: 2,
            direct_return: false,
            merge_aggregate: false,
            ..OptimizerConfig::default()
        };
        let optimized = optimize_ctes(p, &Environment::new(), &config).unwrap();
        assert!(optimized.get("base").is_some());
        for name in ["a", "b", "c"] {
            assert_eq!(optimized.get(name).unwrap().parent_ctes, vec!["base"]);
        }
    }

    /// `n` separate selects over `items`, each read by its own consumer.
    fn fanned_out(n: usize) -> CtePlan {
        let ds = items();
        let mut ctes = Vec::new();
        let mut consumers = Vec::new();
        for i in 0..n {
            let base = format!("base_{i}");
            let consumer = format!("use_{i}");
            ctes.push(root_select(&base, &ds));
            ctes.push(cte(&consumer, SourceType::Group, &[base.as_str()], &["local.cat"]));
            consumers.push(consumer);
        }
        let parents: Vec<&str> = consumers.iter().map(String::as_str).collect();
        ctes.push(cte("root", SourceType::Merge, &parents, &["local.cat"]));
        plan(ctes, "root")
    }

    fn inlined_copies(p: &CtePlan) -> usize {
        p.ctes
            .iter()
            .filter(|c| c.name.starts_with("use_") && c.parent_ctes.is_empty())
            .count()
    }

    #[test]
    fn test_cutoff_counts_references_to_one_datasource() {
        let config = OptimizerConfig {
            inline_datasource_cutoff: 2,
            direct_return: false,
            merge_aggregate: false,
            ..OptimizerConfig::default()
        };
        let env = Environment::new();

        let over = optimize_ctes(fanned_out(3), &env, &config).unwrap();
        assert_eq!(inlined_copies(&over), 0);
        assert!(over.get("base_0").is_some());

        let within = optimize_ctes(fanned_out(2), &env, &config).unwrap();
        assert_eq!(inlined_copies(&within), 2);
        assert!(within.get("base_0").is_none());
    }
}
