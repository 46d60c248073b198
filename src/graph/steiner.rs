//! Minimal connecting subgraph extraction.
//!
//! Kou–Markowsky–Berman 2-approximation of the Steiner tree over the
//! undirected view of a [`ReferenceGraph`]:
//!
//! ```text
//! terminals ──► metric closure (BFS distances)
//!           ──► MST of closure
//!           ──► expand closure edges into graph paths
//!           ──► MST of expansion
//!           ──► prune non-terminal leaves
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::min_spanning_tree;
use petgraph::data::Element;
use petgraph::graph::{NodeIndex, UnGraph};

use super::{NodeId, ReferenceGraph};

/// Node set of an approximate minimum tree connecting `terminals`.
///
/// Returns `None` if any terminal is missing or the terminals are not all
/// in one connected component.
pub fn steiner_tree(graph: &ReferenceGraph, terminals: &[NodeId]) -> Option<BTreeSet<NodeId>> {
    let terminals: Vec<NodeId> = terminals
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if terminals.iter().any(|t| !graph.contains(t)) {
        return None;
    }
    if terminals.len() <= 1 {
        return Some(terminals.into_iter().collect());
    }

    // Metric closure over the terminals
    let mut closure: UnGraph<usize, usize> = UnGraph::new_undirected();
    let closure_nodes: Vec<NodeIndex> = (0..terminals.len()).map(|i| closure.add_node(i)).collect();
    let mut paths: HashMap<(usize, usize), Vec<NodeId>> = HashMap::new();
    for i in 0..terminals.len() {
        for j in (i + 1)..terminals.len() {
            let path = graph.shortest_path(&terminals[i], &terminals[j])?;
            closure.add_edge(closure_nodes[i], closure_nodes[j], path.len() - 1);
            paths.insert((i, j), path);
        }
    }

    // Expand the closure MST back into graph paths
    let mut expanded_nodes: BTreeSet<NodeId> = BTreeSet::new();
    let mut expanded_edges: BTreeSet<(NodeId, NodeId)> = BTreeSet::new();
    for element in min_spanning_tree(&closure) {
        if let Element::Edge { source, target, .. } = element {
            let key = (source.min(target), source.max(target));
            let Some(path) = paths.get(&key) else {
                continue;
            };
            expanded_nodes.extend(path.iter().cloned());
            for pair in path.windows(2) {
                let (a, b) = ordered(&pair[0], &pair[1]);
                expanded_edges.insert((a, b));
            }
        }
    }

    // Spanning tree of the expansion
    let mut expansion: UnGraph<NodeId, usize> = UnGraph::new_undirected();
    let mut index: BTreeMap<NodeId, NodeIndex> = BTreeMap::new();
    for node in &expanded_nodes {
        index.insert(node.clone(), expansion.add_node(node.clone()));
    }
    for (a, b) in &expanded_edges {
        if let (Some(ia), Some(ib)) = (index.get(a), index.get(b)) {
            expansion.add_edge(*ia, *ib, 1);
        }
    }
    let mut adjacency: BTreeMap<NodeId, BTreeSet<NodeId>> = expanded_nodes
        .iter()
        .map(|n| (n.clone(), BTreeSet::new()))
        .collect();
    for element in min_spanning_tree(&expansion) {
        if let Element::Edge { source, target, .. } = element {
            let a = expansion[NodeIndex::new(source)].clone();
            let b = expansion[NodeIndex::new(target)].clone();
            adjacency.entry(a.clone()).or_default().insert(b.clone());
            adjacency.entry(b).or_default().insert(a);
        }
    }

    // Prune leaves that are not terminals
    let terminal_set: BTreeSet<NodeId> = terminals.into_iter().collect();
    loop {
        let leaf = adjacency
            .iter()
            .find(|(node, neighbors)| neighbors.len() <= 1 && !terminal_set.contains(*node))
            .map(|(node, _)| node.clone());
        let Some(leaf) = leaf else {
            break;
        };
        if let Some(neighbors) = adjacency.remove(&leaf) {
            for neighbor in neighbors {
                if let Some(set) = adjacency.get_mut(&neighbor) {
                    set.remove(&leaf);
                }
            }
        }
    }
    Some(adjacency.into_keys().collect())
}

fn ordered(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(name: &str) -> NodeId {
        NodeId::datasource(name)
    }

    #[test]
    fn test_single_terminal() {
        let mut g = ReferenceGraph::new();
        g.add_edge(&ds("a"), &ds("b"));
        let tree = steiner_tree(&g, &[ds("a")]).unwrap();
        assert_eq!(tree, BTreeSet::from([ds("a")]));
    }

    #[test]
    fn test_includes_bridge_and_drops_spurs() {
        // a - hub - b, with a spur hub - spur
        let mut g = ReferenceGraph::new();
        g.add_edge(&ds("a"), &ds("hub"));
        g.add_edge(&ds("hub"), &ds("b"));
        g.add_edge(&ds("hub"), &ds("spur"));
        let tree = steiner_tree(&g, &[ds("a"), ds("b")]).unwrap();
        assert_eq!(tree, BTreeSet::from([ds("a"), ds("b"), ds("hub")]));
    }

    #[test]
    fn test_shares_paths_between_terminals() {
        // Three terminals joined through one hub
        let mut g = ReferenceGraph::new();
        for leaf in ["a", "b", "c"] {
            g.add_edge(&ds(leaf), &ds("hub"));
        }
        g.add_edge(&ds("a"), &ds("long1"));
        g.add_edge(&ds("long1"), &ds("long2"));
        g.add_edge(&ds("long2"), &ds("b"));
        let tree = steiner_tree(&g, &[ds("a"), ds("b"), ds("c")]).unwrap();
        assert_eq!(tree.len(), 4);
        assert!(tree.contains(&ds("hub")));
    }

    #[test]
    fn test_disconnected_terminals() {
        let mut g = ReferenceGraph::new();
        g.add_edge(&ds("a"), &ds("b"));
        g.add_edge(&ds("c"), &ds("d"));
        assert!(steiner_tree(&g, &[ds("a"), ds("c")]).is_none());
    }
}
