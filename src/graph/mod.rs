//! Reference graph: the bipartite concept/datasource graph used for plan search.
//!
//! Nodes are either a concept at a grain or a datasource. Edges:
//! - datasource ↔ concept (both directions, availability)
//! - derived concept → argument concept (default-grain node)
//! - concept ↔ pseudonym concept (both directions)
//!
//! The graph is rebuilt from the [`Environment`](crate::model::Environment)
//! per compile. Search algorithms prune working copies, never the original.

mod builder;
pub mod steiner;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;

use crate::model::{Concept, Datasource, Grain};

pub use builder::prune_sources_for_conditions;

// ============================================================================
// Node identity
// ============================================================================

/// Structural node identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    /// A concept at a grain (the grain fingerprint excludes any condition).
    Concept { address: String, grain: String },
    Datasource { name: String },
}

impl NodeId {
    pub fn concept(concept: &Concept) -> Self {
        NodeId::Concept {
            address: concept.address.clone(),
            grain: concept.grain.fingerprint(),
        }
    }

    pub fn concept_at(address: &str, grain: &Grain) -> Self {
        NodeId::Concept {
            address: address.to_string(),
            grain: grain.fingerprint(),
        }
    }

    pub fn datasource(name: &str) -> Self {
        NodeId::Datasource {
            name: name.to_string(),
        }
    }

    pub fn is_concept(&self) -> bool {
        matches!(self, NodeId::Concept { .. })
    }

    pub fn is_datasource(&self) -> bool {
        matches!(self, NodeId::Datasource { .. })
    }

    /// Concept address, if this is a concept node.
    pub fn address(&self) -> Option<&str> {
        match self {
            NodeId::Concept { address, .. } => Some(address),
            NodeId::Datasource { .. } => None,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Concept { address, grain } => write!(f, "c~{}@{}", address, grain),
            NodeId::Datasource { name } => write!(f, "ds~{}", name),
        }
    }
}

/// Payload of a datasource node.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphDatasource {
    Single(Datasource),
    /// Structurally compatible partial datasources whose conditions together
    /// cover every row.
    Union(Vec<Datasource>),
}

impl GraphDatasource {
    pub fn name(&self) -> String {
        match self {
            GraphDatasource::Single(ds) => ds.identifier.clone(),
            GraphDatasource::Union(list) => list
                .iter()
                .map(|ds| ds.identifier.as_str())
                .collect::<Vec<_>>()
                .join("-"),
        }
    }

    pub fn grain(&self) -> Grain {
        match self {
            GraphDatasource::Single(ds) => ds.grain.clone(),
            GraphDatasource::Union(list) => list
                .iter()
                .fold(Grain::abstract_grain(), |acc, ds| acc.union(&ds.grain)),
        }
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Concept/datasource reference graph.
#[derive(Debug, Clone)]
pub struct ReferenceGraph {
    graph: StableDiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    concepts: HashMap<NodeId, Concept>,
    datasources: HashMap<NodeId, GraphDatasource>,
    pseudonyms: HashSet<(NodeId, NodeId)>,
}

impl ReferenceGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            concepts: HashMap::new(),
            datasources: HashMap::new(),
            pseudonyms: HashSet::new(),
        }
    }

    fn ensure_node(&mut self, id: &NodeId) -> NodeIndex {
        if let Some(idx) = self.index.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.index.insert(id.clone(), idx);
        idx
    }

    /// Add (or refresh) the node for a concept at its own grain.
    pub fn add_concept_node(&mut self, concept: &Concept) -> NodeId {
        let id = NodeId::concept(concept);
        self.ensure_node(&id);
        self.concepts.insert(id.clone(), concept.clone());
        id
    }

    pub fn add_datasource_node(&mut self, datasource: GraphDatasource) -> NodeId {
        let id = NodeId::datasource(&datasource.name());
        self.ensure_node(&id);
        self.datasources.insert(id.clone(), datasource);
        id
    }

    /// Add a directed edge; self-loops and duplicates are ignored.
    pub fn add_edge(&mut self, from: &NodeId, to: &NodeId) {
        if from == to {
            return;
        }
        let a = self.ensure_node(from);
        let b = self.ensure_node(to);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn add_pseudonym_edge(&mut self, a: &NodeId, b: &NodeId) {
        if a == b {
            return;
        }
        self.add_edge(a, b);
        self.add_edge(b, a);
        self.pseudonyms.insert((a.clone(), b.clone()));
        self.pseudonyms.insert((b.clone(), a.clone()));
    }

    pub fn is_pseudonym_edge(&self, a: &NodeId, b: &NodeId) -> bool {
        self.pseudonyms.contains(&(a.clone(), b.clone()))
    }

    pub fn remove_edge(&mut self, from: &NodeId, to: &NodeId) {
        if let (Some(a), Some(b)) = (self.index.get(from), self.index.get(to)) {
            if let Some(edge) = self.graph.find_edge(*a, *b) {
                self.graph.remove_edge(edge);
            }
        }
    }

    pub fn remove_node(&mut self, id: &NodeId) {
        if let Some(idx) = self.index.remove(id) {
            self.graph.remove_node(idx);
        }
        self.concepts.remove(id);
        self.datasources.remove(id);
        self.pseudonyms.retain(|(a, b)| a != id && b != id);
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn has_edge(&self, from: &NodeId, to: &NodeId) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(a), Some(b)) => self.graph.find_edge(*a, *b).is_some(),
            _ => false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Every node, in a stable order.
    pub fn nodes(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self.index.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn concept_nodes(&self) -> Vec<NodeId> {
        self.nodes().into_iter().filter(NodeId::is_concept).collect()
    }

    pub fn datasource_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .into_iter()
            .filter(NodeId::is_datasource)
            .collect()
    }

    /// Every directed edge, in a stable order.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        let mut out: Vec<(NodeId, NodeId)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a].clone(), self.graph[b].clone()))
            .collect();
        out.sort();
        out
    }

    pub fn concept(&self, id: &NodeId) -> Option<&Concept> {
        self.concepts.get(id)
    }

    pub fn datasource(&self, id: &NodeId) -> Option<&GraphDatasource> {
        self.datasources.get(id)
    }

    /// Concept nodes carrying `address`, at any grain.
    pub fn nodes_for_address(&self, address: &str) -> Vec<NodeId> {
        self.concept_nodes()
            .into_iter()
            .filter(|n| n.address() == Some(address))
            .collect()
    }

    fn directed(&self, id: &NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<NodeId> = self
            .graph
            .neighbors_directed(*idx, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn successors(&self, id: &NodeId) -> Vec<NodeId> {
        self.directed(id, Direction::Outgoing)
    }

    pub fn predecessors(&self, id: &NodeId) -> Vec<NodeId> {
        self.directed(id, Direction::Incoming)
    }

    /// Neighbors ignoring edge direction.
    pub fn neighbors(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = self.successors(id);
        out.extend(self.predecessors(id));
        out.sort();
        out.dedup();
        out
    }

    pub fn in_degree(&self, id: &NodeId) -> usize {
        self.predecessors(id).len()
    }

    pub fn degree(&self, id: &NodeId) -> usize {
        self.neighbors(id).len()
    }

    /// Weakly connected components, each as an ordered node set.
    pub fn connected_components(&self) -> Vec<BTreeSet<NodeId>> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut components = Vec::new();
        for start in self.nodes() {
            if seen.contains(&start) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut queue = VecDeque::from([start.clone()]);
            seen.insert(start);
            while let Some(current) = queue.pop_front() {
                for next in self.neighbors(&current) {
                    if seen.insert(next.clone()) {
                        queue.push_back(next);
                    }
                }
                component.insert(current);
            }
            components.push(component);
        }
        components
    }

    /// Shortest path ignoring edge direction (BFS).
    pub fn shortest_path(&self, from: &NodeId, to: &NodeId) -> Option<Vec<NodeId>> {
        if !self.contains(from) || !self.contains(to) {
            return None;
        }
        let mut parents: HashMap<NodeId, NodeId> = HashMap::new();
        let mut visited: HashSet<NodeId> = HashSet::from([from.clone()]);
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == to {
                let mut path = vec![current.clone()];
                let mut cursor = current;
                while let Some(parent) = parents.get(&cursor) {
                    path.push(parent.clone());
                    cursor = parent.clone();
                }
                path.reverse();
                return Some(path);
            }
            for next in self.neighbors(&current) {
                if visited.insert(next.clone()) {
                    parents.insert(next.clone(), current.clone());
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Induced subgraph over `keep`, carrying payloads and pseudonym marks.
    pub fn subgraph(&self, keep: &BTreeSet<NodeId>) -> ReferenceGraph {
        let mut out = ReferenceGraph::new();
        for id in keep {
            if !self.contains(id) {
                continue;
            }
            out.ensure_node(id);
            if let Some(concept) = self.concepts.get(id) {
                out.concepts.insert(id.clone(), concept.clone());
            }
            if let Some(ds) = self.datasources.get(id) {
                out.datasources.insert(id.clone(), ds.clone());
            }
        }
        for (a, b) in self.edges() {
            if keep.contains(&a) && keep.contains(&b) {
                out.add_edge(&a, &b);
            }
        }
        out.pseudonyms = self
            .pseudonyms
            .iter()
            .filter(|(a, b)| keep.contains(a) && keep.contains(b))
            .cloned()
            .collect();
        out
    }

    /// Copy with `remove` taken out.
    pub fn without(&self, remove: &BTreeSet<NodeId>) -> ReferenceGraph {
        let keep: BTreeSet<NodeId> = self
            .nodes()
            .into_iter()
            .filter(|n| !remove.contains(n))
            .collect();
        self.subgraph(&keep)
    }
}

impl Default for ReferenceGraph {
    fn default() -> Self {
        Self::new()
    }
}
