//! Array expansion.

use tracing::debug;

use crate::discovery::Planner;
use crate::error::PlanningResult;
use crate::model::{Concept, Condition};
use crate::plan::{NodeCore, PlanId, PlanNode};

use super::enrichment::{addresses, unique};

/// Unnest `concept` alongside `optional`.
///
/// The unnest is always wrapped in a pass-through node; an unnest join is
/// not legal in every position a parent may be rendered in.
pub(crate) fn gen_unnest_node(
    planner: &mut Planner,
    concept: &Concept,
    optional: &[Concept],
    depth: usize,
    conditions: Option<&Condition>,
) -> PlanningResult<Option<PlanId>> {
    let env = planner.environment();
    let arguments = env.concepts_for(&concept.concept_arguments())?;
    let local_optional: Vec<Concept> = optional
        .iter()
        .filter(|o| !arguments.iter().any(|a| a.address == o.address))
        .cloned()
        .collect();

    let mut mandatory = arguments.clone();
    mandatory.extend(local_optional.iter().cloned());
    let mandatory = unique(mandatory);
    let parents = if mandatory.is_empty() {
        Vec::new()
    } else {
        match planner.search(&mandatory, depth + 1, false, conditions)? {
            Some(parent) => vec![parent],
            None => {
                debug!(
                    depth,
                    concept = %concept.address,
                    parents = ?addresses(&mandatory),
                    "could not source unnest inputs"
                );
                return Ok(None);
            }
        }
    };

    let mut outputs = vec![concept.address.clone()];
    outputs.extend(addresses(&local_optional));
    let base = planner.arena.insert(PlanNode::unnest(
        NodeCore::new(addresses(&mandatory), outputs.clone())
            .with_parents(parents)
            .with_depth(depth)
            .with_preexisting(conditions.cloned()),
        vec![concept.address.clone()],
    ));
    let wrapped = planner.arena.insert(PlanNode::merge(
        NodeCore::new(outputs.clone(), outputs)
            .with_parents(vec![base])
            .with_depth(depth)
            .with_preexisting(conditions.cloned()),
        None,
    ));
    Ok(Some(wrapped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerSettings;
    use crate::model::{
        Column, DataType, Datasource, Environment, Expr, Function, FunctionOp, Lineage,
    };
    use std::rc::Rc;

    fn tagged() -> Environment {
        let mut env = Environment::new();
        env.add_key("post_id", DataType::Integer);
        env.add_property("tags", DataType::Array(Box::new(DataType::String)), &["post_id"]);
        env.add_derived(
            "tag",
            DataType::String,
            Lineage::Function(Function {
                op: FunctionOp::Unnest,
                args: vec![Expr::concept("local.tags")],
            }),
        )
        .unwrap();
        env.add_datasource(Datasource::new(
            "posts",
            vec![Column::new("post_id", "post_id"), Column::new("tags", "tags")],
            ["post_id"],
        ))
        .unwrap();
        env
    }

    #[test]
    fn test_unnest_is_wrapped() {
        let env = tagged();
        let tag = env.concepts["local.tag"].clone();
        let post = env.concepts["local.post_id"].clone();
        let mut planner = Planner::new(Rc::new(env), PlannerSettings::default()).unwrap();
        let id = gen_unnest_node(&mut planner, &tag, &[post], 0, None)
            .unwrap()
            .unwrap();
        let outer = planner.arena.node(id);
        assert!(outer.is_merge());
        assert_eq!(outer.core().output_concepts, vec!["local.tag", "local.post_id"]);
        let PlanNode::Unnest(unnest) = planner.arena.node(outer.parents()[0]) else {
            panic!("expected unnest under the wrapper");
        };
        assert_eq!(unnest.unnest_concepts, vec!["local.tag"]);
        let resolved = planner.arena.resolve(id).unwrap();
        assert!(resolved.output_concepts.contains(&"local.tag".to_string()));
    }
}
