//! Arena owning every plan node of a planning pass.
//!
//! Nodes reference parents by [`PlanId`]. Each mutation stamps the node with
//! a fresh version; a cached resolution is reused only while the highest
//! version in its subtree is unchanged, so editing a parent invalidates
//! every consumer without walking consumers.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::rc::Rc;

use tracing::trace;

use crate::error::{PlanningError, PlanningResult};
use crate::model::{Condition, Environment, Grain};

use super::node::{NodeCore, PlanId, PlanNode};
use super::resolve::resolve_node;
use super::resolved::ResolvedDatasource;

#[derive(Debug, Clone)]
struct Slot {
    node: PlanNode,
    version: u64,
}

/// Owner of plan nodes and their memoized resolutions.
#[derive(Debug)]
pub struct PlanArena {
    environment: Rc<Environment>,
    slots: Vec<Slot>,
    clock: u64,
    cache: RefCell<HashMap<PlanId, (u64, Rc<ResolvedDatasource>)>>,
}

impl PlanArena {
    pub fn new(environment: Rc<Environment>) -> Self {
        Self {
            environment,
            slots: Vec::new(),
            clock: 0,
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn shared_environment(&self) -> Rc<Environment> {
        Rc::clone(&self.environment)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Add a node. Partial and nullable concepts left empty are inherited
    /// from the parents.
    pub fn insert(&mut self, mut node: PlanNode) -> PlanId {
        let parents = node.parents().to_vec();
        if !parents.is_empty() {
            let core = node.core();
            let partial = if core.partial_concepts.is_empty() {
                self.parent_partials(&parents, &core.output_concepts)
            } else {
                core.partial_concepts.clone()
            };
            let nullable = if core.nullable_concepts.is_empty() {
                self.parent_nullables(&parents, &core.output_concepts)
            } else {
                core.nullable_concepts.clone()
            };
            let core = node.core_mut();
            core.partial_concepts = partial;
            core.nullable_concepts = nullable;
        }
        let version = self.tick();
        let id = PlanId(self.slots.len());
        trace!(id = %id, node = %node, "inserted plan node");
        self.slots.push(Slot { node, version });
        id
    }

    /// Outputs partial on some parent and on every parent that outputs them.
    fn parent_partials(&self, parents: &[PlanId], outputs: &[String]) -> Vec<String> {
        outputs
            .iter()
            .filter(|address| {
                let providers: Vec<&NodeCore> = parents
                    .iter()
                    .map(|p| self.core(*p))
                    .filter(|c| c.output_concepts.contains(address))
                    .collect();
                !providers.is_empty()
                    && providers.iter().all(|c| c.partial_concepts.contains(address))
            })
            .cloned()
            .collect()
    }

    fn parent_nullables(&self, parents: &[PlanId], outputs: &[String]) -> Vec<String> {
        outputs
            .iter()
            .filter(|address| {
                parents
                    .iter()
                    .any(|p| self.core(*p).nullable_concepts.contains(address))
            })
            .cloned()
            .collect()
    }

    pub fn node(&self, id: PlanId) -> &PlanNode {
        &self.slots[id.0].node
    }

    pub fn core(&self, id: PlanId) -> &NodeCore {
        self.node(id).core()
    }

    pub fn version(&self, id: PlanId) -> u64 {
        self.slots[id.0].version
    }

    /// Mutable access to a node; bumps its version.
    pub fn node_mut(&mut self, id: PlanId) -> &mut PlanNode {
        let version = self.tick();
        let slot = &mut self.slots[id.0];
        slot.version = version;
        &mut slot.node
    }

    fn core_mut(&mut self, id: PlanId) -> &mut NodeCore {
        self.node_mut(id).core_mut()
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Append outputs, unhiding any that were hidden.
    pub fn add_output_concepts(&mut self, id: PlanId, concepts: &[String]) {
        let core = self.core_mut(id);
        for concept in concepts {
            if !core.output_concepts.contains(concept) {
                core.output_concepts.push(concept.clone());
            }
            core.hidden_concepts.remove(concept);
        }
    }

    /// Replace the outputs. Hidden concepts that remain outputs stay hidden.
    pub fn set_output_concepts(&mut self, id: PlanId, concepts: Vec<String>) {
        let core = self.core_mut(id);
        let mut outputs: Vec<String> = Vec::with_capacity(concepts.len());
        for concept in concepts {
            if !outputs.contains(&concept) {
                outputs.push(concept);
            }
        }
        core.hidden_concepts.retain(|h| outputs.contains(h));
        core.output_concepts = outputs;
    }

    pub fn hide_output_concepts(&mut self, id: PlanId, concepts: &[String]) {
        let core = self.core_mut(id);
        for concept in concepts {
            if core.output_concepts.contains(concept) {
                core.hidden_concepts.insert(concept.clone());
            }
        }
    }

    pub fn unhide_output_concepts(&mut self, id: PlanId, concepts: &[String]) {
        let core = self.core_mut(id);
        for concept in concepts {
            core.hidden_concepts.remove(concept);
        }
    }

    pub fn remove_output_concepts(&mut self, id: PlanId, concepts: &[String]) {
        let core = self.core_mut(id);
        core.output_concepts.retain(|c| !concepts.contains(c));
        core.hidden_concepts.retain(|c| !concepts.contains(c));
    }

    pub fn add_partial_concepts(&mut self, id: PlanId, concepts: &[String]) {
        let core = self.core_mut(id);
        for concept in concepts {
            if !core.partial_concepts.contains(concept) {
                core.partial_concepts.push(concept.clone());
            }
        }
    }

    /// AND a condition into the node. The node's rows now satisfy it, so it
    /// also becomes the preexisting condition.
    pub fn add_condition(&mut self, id: PlanId, condition: Condition) {
        let core = self.core_mut(id);
        let combined = match core.conditions.take() {
            Some(existing) if existing == condition || condition.is_child_of(&existing) => existing,
            existing => Condition::conjoin(existing, condition),
        };
        core.conditions = Some(combined);
        core.preexisting_conditions = core.conditions.clone();
    }

    pub fn set_preexisting_conditions(&mut self, id: PlanId, condition: Option<Condition>) {
        self.core_mut(id).preexisting_conditions = condition;
    }

    pub fn set_force_group(&mut self, id: PlanId, force_group: Option<bool>) {
        self.core_mut(id).force_group = force_group;
    }

    pub fn set_grain(&mut self, id: PlanId, grain: Option<Grain>) {
        self.core_mut(id).grain = grain;
    }

    pub fn set_whole_grain(&mut self, id: PlanId, whole_grain: bool) {
        self.core_mut(id).whole_grain = whole_grain;
    }

    /// Attach more parents. Fails if a new parent already depends on `id`.
    pub fn add_parents(&mut self, id: PlanId, parents: &[PlanId]) -> PlanningResult<()> {
        for parent in parents {
            if *parent == id || self.ancestors(*parent).contains(&id) {
                return Err(PlanningError::CyclicPlan {
                    node: self.node(id).to_string(),
                });
            }
        }
        let core = self.core_mut(id);
        for parent in parents {
            if !core.parents.contains(parent) {
                core.parents.push(*parent);
            }
        }
        Ok(())
    }

    pub fn add_existence_concepts(&mut self, id: PlanId, concepts: &[String]) {
        let core = self.core_mut(id);
        for concept in concepts {
            if !core.existence_concepts.contains(concept) {
                core.existence_concepts.push(concept.clone());
            }
        }
    }

    pub fn set_virtual_outputs(&mut self, id: PlanId, concepts: Vec<String>) {
        self.core_mut(id).virtual_output_concepts = concepts;
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Every node reachable through parent links, excluding `id`.
    pub fn ancestors(&self, id: PlanId) -> BTreeSet<PlanId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<PlanId> = self.node(id).parents().to_vec();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.node(next).parents().iter().copied());
            }
        }
        seen
    }

    /// Highest version anywhere in the subtree rooted at `id`.
    fn stamp(&self, id: PlanId) -> u64 {
        self.ancestors(id)
            .into_iter()
            .map(|p| self.version(p))
            .fold(self.version(id), u64::max)
    }

    /// Deep copy of the subtree rooted at `id`; later edits to the copy
    /// never reach the original.
    pub fn copy(&mut self, id: PlanId) -> PlanId {
        let mut mapping: BTreeMap<PlanId, PlanId> = BTreeMap::new();
        self.copy_into(id, &mut mapping)
    }

    fn copy_into(&mut self, id: PlanId, mapping: &mut BTreeMap<PlanId, PlanId>) -> PlanId {
        if let Some(existing) = mapping.get(&id) {
            return *existing;
        }
        let parents = self.node(id).parents().to_vec();
        let new_parents: Vec<PlanId> = parents
            .iter()
            .map(|p| self.copy_into(*p, mapping))
            .collect();
        let mut node = self.node(id).clone();
        node.core_mut().parents = new_parents;
        if let PlanNode::Merge(merge) = &mut node {
            if let Some(joins) = merge.node_joins.as_mut() {
                for join in joins {
                    join.left = mapping.get(&join.left).copied().unwrap_or(join.left);
                    join.right = mapping.get(&join.right).copied().unwrap_or(join.right);
                }
            }
        }
        let version = self.tick();
        let new_id = PlanId(self.slots.len());
        self.slots.push(Slot { node, version });
        mapping.insert(id, new_id);
        new_id
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolve a node, reusing the cached result while nothing in its
    /// subtree has changed.
    pub fn resolve(&self, id: PlanId) -> PlanningResult<Rc<ResolvedDatasource>> {
        let stamp = self.stamp(id);
        {
            let cache = self.cache.borrow();
            if let Some((cached_stamp, resolved)) = cache.get(&id) {
                if *cached_stamp == stamp {
                    return Ok(Rc::clone(resolved));
                }
            }
        }
        let node = self.node(id);
        let parents = node
            .parents()
            .iter()
            .map(|p| self.resolve(*p))
            .collect::<PlanningResult<Vec<_>>>()?;
        let resolved = Rc::new(resolve_node(self, node, parents)?);
        trace!(id = %id, identifier = %resolved.identifier, "resolved plan node");
        self.cache
            .borrow_mut()
            .insert(id, (stamp, Rc::clone(&resolved)));
        Ok(resolved)
    }

    /// Discard the cached resolution of `id` and resolve it again.
    pub fn rebuild_cache(&self, id: PlanId) -> PlanningResult<Rc<ResolvedDatasource>> {
        self.cache.borrow_mut().remove(&id);
        self.resolve(id)
    }

    /// Indented text rendering of the subtree rooted at `id`.
    pub fn explain(&self, id: PlanId) -> String {
        let mut out = String::new();
        self.explain_into(id, 0, &mut out);
        out
    }

    fn explain_into(&self, id: PlanId, depth: usize, out: &mut String) {
        let node = self.node(id);
        let core = node.core();
        let _ = write!(out, "{}{} {}", "  ".repeat(depth), id, node);
        if let Some(grain) = &core.grain {
            let _ = write!(out, " grain={}", grain.fingerprint());
        }
        if let Some(condition) = &core.conditions {
            let _ = write!(out, " where {}", condition);
        }
        if !core.partial_concepts.is_empty() {
            let _ = write!(out, " partial=[{}]", core.partial_concepts.join(","));
        }
        out.push('\n');
        for parent in node.parents() {
            self.explain_into(*parent, depth + 1, out);
        }
    }
}
