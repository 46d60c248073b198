//! Reference graph construction from an environment.

use std::collections::HashSet;

use tracing::debug;

use crate::error::{PlanningError, PlanningResult};
use crate::model::{Concept, Condition, Environment, Grain};

use super::{GraphDatasource, NodeId, ReferenceGraph};

// ============================================================================
// Construction Entry Point
// ============================================================================

impl ReferenceGraph {
    /// Build the graph for every concept and datasource in `env`.
    ///
    /// Construction happens in two phases:
    /// - Phase 1: concepts, recursively through lineage and pseudonyms
    /// - Phase 2: datasources, with availability edges both ways
    ///
    /// A concept whose lineage reaches itself fails with
    /// [`PlanningError::SelfReference`].
    pub fn from_environment(env: &Environment) -> PlanningResult<Self> {
        let mut graph = ReferenceGraph::new();
        let mut seen: HashSet<NodeId> = HashSet::new();

        for concept in env.concepts.values() {
            let mut lineage_stack = Vec::new();
            graph.add_concept(concept, env, &mut seen, &mut lineage_stack)?;
        }

        for datasource in env.datasources.values() {
            let ds_node = graph.add_datasource_node(GraphDatasource::Single(datasource.clone()));
            for address in datasource.output_concepts() {
                let concept = env.concept(&address)?;
                let c_node = graph.add_concept_node(concept);
                graph.add_edge(&ds_node, &c_node);
                graph.add_edge(&c_node, &ds_node);
            }
        }

        debug!(
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "built reference graph"
        );
        Ok(graph)
    }
}

// ============================================================================
// Phase 1: Concepts
// ============================================================================

impl ReferenceGraph {
    fn add_concept(
        &mut self,
        concept: &Concept,
        env: &Environment,
        seen: &mut HashSet<NodeId>,
        lineage_stack: &mut Vec<String>,
    ) -> PlanningResult<()> {
        if lineage_stack.contains(&concept.address) {
            return Err(PlanningError::SelfReference {
                address: concept.address.clone(),
            });
        }
        let node = NodeId::concept(concept);
        if !seen.insert(node.clone()) {
            return Ok(());
        }
        self.add_concept_node(concept);

        lineage_stack.push(concept.address.clone());
        for arg in concept.concept_arguments() {
            if arg == concept.address {
                return Err(PlanningError::SelfReference { address: arg });
            }
            let source = env.concept(&arg)?;
            let source_node = NodeId::concept(source);
            self.add_concept(source, env, seen, lineage_stack)?;
            self.add_edge(&node, &source_node);
        }
        lineage_stack.pop();

        for pseudonym in &concept.pseudonyms {
            let other = env
                .concepts
                .get(pseudonym)
                .ok_or_else(|| PlanningError::InvalidPseudonym {
                    concept: concept.address.clone(),
                    pseudonym: pseudonym.clone(),
                })?;
            let other_node = NodeId::concept(other);
            // Same root address at another grain would form a self-loop.
            if other_node.address() == node.address() {
                continue;
            }
            if self.has_edge(&node, &other_node) && self.has_edge(&other_node, &node) {
                continue;
            }
            self.add_pseudonym_edge(&node, &other_node);
            let mut fresh_stack = Vec::new();
            self.add_concept(other, env, seen, &mut fresh_stack)?;
        }
        Ok(())
    }

    /// Add a concept instance at a non-default grain, linked both ways to
    /// its default-grain node.
    pub fn add_concept_at_grain(&mut self, concept: &Concept, grain: Grain) -> NodeId {
        let default_node = self.add_concept_node(concept);
        let regrained = concept.with_grain(grain);
        let node = self.add_concept_node(&regrained);
        self.add_edge(&node, &default_node);
        self.add_edge(&default_node, &node);
        node
    }
}

// ============================================================================
// Condition pruning
// ============================================================================

/// Remove datasources that cannot serve a query under `condition`.
///
/// Unconditional datasources always stay. A conditionally complete extract
/// (`non_partial_for`) stays only if its condition matches the query
/// condition, or there is no query condition and partial data is accepted.
pub fn prune_sources_for_conditions(
    graph: &mut ReferenceGraph,
    accept_partial: bool,
    condition: Option<&Condition>,
) {
    let mut to_remove = Vec::new();
    for node in graph.datasource_nodes() {
        let keep = match graph.datasource(&node) {
            Some(GraphDatasource::Union(_)) => true,
            Some(GraphDatasource::Single(ds)) => match (&ds.non_partial_for, condition) {
                (None, _) => true,
                (Some(_), None) => accept_partial,
                (Some(extract), Some(query)) => extract == query,
            },
            None => true,
        };
        if !keep {
            to_remove.push(node);
        }
    }
    for node in to_remove {
        debug!(datasource = %node, "pruning datasource for condition mismatch");
        graph.remove_node(&node);
    }
}
