//! Plan node kinds.
//!
//! Every node shares a [`NodeCore`] (parents, concept sets, conditions,
//! grain); the enum variant carries what is specific to the kind.

use std::collections::BTreeSet;
use std::fmt;

use crate::model::{Condition, Datasource, Grain};

use super::resolved::{JoinType, SourceType};

/// Index of a node in a [`PlanArena`](super::PlanArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanId(pub(crate) usize);

impl PlanId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State shared by every node kind. Concepts are held by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeCore {
    pub parents: Vec<PlanId>,
    pub input_concepts: Vec<String>,
    pub output_concepts: Vec<String>,
    pub hidden_concepts: BTreeSet<String>,
    pub partial_concepts: Vec<String>,
    pub nullable_concepts: Vec<String>,
    /// Outputs satisfied through a pseudonym rather than a direct source.
    pub virtual_output_concepts: Vec<String>,
    /// Concepts read only by existence subqueries.
    pub existence_concepts: Vec<String>,
    pub conditions: Option<Condition>,
    /// Condition already applied upstream of this node's rows.
    pub preexisting_conditions: Option<Condition>,
    pub force_group: Option<bool>,
    pub grain: Option<Grain>,
    pub whole_grain: bool,
    pub depth: usize,
}

impl NodeCore {
    pub fn new(input_concepts: Vec<String>, output_concepts: Vec<String>) -> Self {
        Self {
            input_concepts: dedup(input_concepts),
            output_concepts: dedup(output_concepts),
            ..Default::default()
        }
    }

    pub fn with_parents(mut self, parents: Vec<PlanId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_grain(mut self, grain: Grain) -> Self {
        self.grain = Some(grain);
        self
    }

    pub fn with_force_group(mut self, force_group: Option<bool>) -> Self {
        self.force_group = force_group;
        self
    }

    pub fn with_partial(mut self, partial: Vec<String>) -> Self {
        self.partial_concepts = dedup(partial);
        self
    }

    pub fn with_nullable(mut self, nullable: Vec<String>) -> Self {
        self.nullable_concepts = dedup(nullable);
        self
    }

    pub fn with_hidden(mut self, hidden: impl IntoIterator<Item = String>) -> Self {
        self.hidden_concepts = hidden.into_iter().collect();
        self
    }

    pub fn with_existence(mut self, existence: Vec<String>) -> Self {
        self.existence_concepts = dedup(existence);
        self
    }

    /// Attach a row condition. The preexisting condition tracks it, AND-ed
    /// with any condition already applied upstream.
    pub fn with_conditions(mut self, conditions: Option<Condition>) -> Self {
        self.conditions = conditions;
        self.sync_preexisting();
        self
    }

    pub fn with_preexisting(mut self, preexisting: Option<Condition>) -> Self {
        self.preexisting_conditions = preexisting;
        self.sync_preexisting();
        self
    }

    fn sync_preexisting(&mut self) {
        match (&self.conditions, &self.preexisting_conditions) {
            (Some(cond), None) => self.preexisting_conditions = Some(cond.clone()),
            (Some(cond), Some(pre)) if cond != pre && !pre.is_child_of(cond) => {
                self.preexisting_conditions = Some(cond.clone().and(pre.clone()));
            }
            _ => {}
        }
    }

    /// Outputs not hidden from consumers.
    pub fn usable_outputs(&self) -> Vec<String> {
        self.output_concepts
            .iter()
            .filter(|c| !self.hidden_concepts.contains(*c))
            .cloned()
            .collect()
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Explicit join between two sibling nodes of a merge.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeJoin {
    pub left: PlanId,
    pub right: PlanId,
    pub concepts: Vec<String>,
    pub join_type: JoinType,
}

impl NodeJoin {
    pub fn new(left: PlanId, right: PlanId, concepts: Vec<String>, join_type: JoinType) -> Self {
        Self {
            left,
            right,
            concepts,
            join_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeNode {
    pub core: NodeCore,
    /// `None` infers joins from shared concepts; an empty list means no
    /// joins at all.
    pub node_joins: Option<Vec<NodeJoin>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectNode {
    pub core: NodeCore,
    pub datasource: Datasource,
    pub accept_partial: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnnestNode {
    pub core: NodeCore,
    pub unnest_concepts: Vec<String>,
}

/// A node in the plan tree.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    Select(SelectNode),
    Group(NodeCore),
    Filter(NodeCore),
    Window(NodeCore),
    Unnest(UnnestNode),
    Recursive(NodeCore),
    Union(NodeCore),
    Merge(MergeNode),
    Constant(NodeCore),
}

impl PlanNode {
    pub fn select(core: NodeCore, datasource: Datasource, accept_partial: bool) -> Self {
        PlanNode::Select(SelectNode {
            core,
            datasource,
            accept_partial,
        })
    }

    pub fn merge(core: NodeCore, node_joins: Option<Vec<NodeJoin>>) -> Self {
        PlanNode::Merge(MergeNode { core, node_joins })
    }

    pub fn unnest(core: NodeCore, unnest_concepts: Vec<String>) -> Self {
        PlanNode::Unnest(UnnestNode {
            core,
            unnest_concepts,
        })
    }

    pub fn core(&self) -> &NodeCore {
        match self {
            PlanNode::Select(node) => &node.core,
            PlanNode::Merge(node) => &node.core,
            PlanNode::Unnest(node) => &node.core,
            PlanNode::Group(core)
            | PlanNode::Filter(core)
            | PlanNode::Window(core)
            | PlanNode::Recursive(core)
            | PlanNode::Union(core)
            | PlanNode::Constant(core) => core,
        }
    }

    pub fn core_mut(&mut self) -> &mut NodeCore {
        match self {
            PlanNode::Select(node) => &mut node.core,
            PlanNode::Merge(node) => &mut node.core,
            PlanNode::Unnest(node) => &mut node.core,
            PlanNode::Group(core)
            | PlanNode::Filter(core)
            | PlanNode::Window(core)
            | PlanNode::Recursive(core)
            | PlanNode::Union(core)
            | PlanNode::Constant(core) => core,
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            PlanNode::Select(_) => SourceType::Select,
            PlanNode::Group(_) => SourceType::Group,
            PlanNode::Filter(_) => SourceType::Filter,
            PlanNode::Window(_) => SourceType::Window,
            PlanNode::Unnest(_) => SourceType::Unnest,
            PlanNode::Recursive(_) => SourceType::Recursive,
            PlanNode::Union(_) => SourceType::Union,
            PlanNode::Merge(_) => SourceType::Merge,
            PlanNode::Constant(_) => SourceType::Constant,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            PlanNode::Select(_) => "Select",
            PlanNode::Group(_) => "Group",
            PlanNode::Filter(_) => "Filter",
            PlanNode::Window(_) => "Window",
            PlanNode::Unnest(_) => "Unnest",
            PlanNode::Recursive(_) => "Recursive",
            PlanNode::Union(_) => "Union",
            PlanNode::Merge(_) => "Merge",
            PlanNode::Constant(_) => "Constant",
        }
    }

    pub fn parents(&self) -> &[PlanId] {
        &self.core().parents
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, PlanNode::Merge(_))
    }

    pub fn is_group(&self) -> bool {
        matches!(self, PlanNode::Group(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, PlanNode::Constant(_))
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outputs = &self.core().output_concepts;
        let mut shown: Vec<&str> = outputs.iter().take(3).map(String::as_str).collect();
        shown.sort();
        let mut contents = shown.join(",");
        if outputs.len() > 3 {
            contents.push_str(&format!("...{} more", outputs.len() - 3));
        }
        write!(f, "{}<{}>", self.kind_name(), contents)
    }
}
