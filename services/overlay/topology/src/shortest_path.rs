//! Single-source shortest path computation.

use crate::graph::{NetworkGraphLink, NodeId};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Minimal graph interface needed to derive a shortest-path tree
pub trait ShortestPathGraph {
    /// Add a vertex; adding a known vertex is a no-op
    fn add_vertex(&mut self, node: NodeId);

    /// Add a directed edge; unknown endpoints are added as vertices
    fn add_edge(&mut self, link: NetworkGraphLink);

    /// Compute, for every node reachable from `source`, the edge by which
    /// it is first reached. `source` itself is not part of the result.
    fn incoming_edges_from(&self, source: &NodeId) -> HashMap<NodeId, NetworkGraphLink>;
}

/// Dijkstra over uniformly weighted edges
#[derive(Debug, Default, Clone)]
pub struct DijkstraGraph {
    index: HashMap<NodeId, usize>,
    vertices: Vec<NodeId>,
    // Outgoing edges per vertex, in insertion order
    outgoing: Vec<Vec<(usize, NetworkGraphLink)>>,
}

impl DijkstraGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    fn vertex_index(&mut self, node: NodeId) -> usize {
        if let Some(&idx) = self.index.get(&node) {
            return idx;
        }
        let idx = self.vertices.len();
        self.index.insert(node.clone(), idx);
        self.vertices.push(node);
        self.outgoing.push(Vec::new());
        idx
    }
}

impl ShortestPathGraph for DijkstraGraph {
    fn add_vertex(&mut self, node: NodeId) {
        self.vertex_index(node);
    }

    fn add_edge(&mut self, link: NetworkGraphLink) {
        let from = self.vertex_index(link.source.clone());
        let to = self.vertex_index(link.target.clone());
        self.outgoing[from].push((to, link));
    }

    fn incoming_edges_from(&self, source: &NodeId) -> HashMap<NodeId, NetworkGraphLink> {
        let mut incoming = HashMap::new();
        let start = match self.index.get(source) {
            Some(&idx) => idx,
            None => return incoming,
        };

        let mut distances = vec![u32::MAX; self.vertices.len()];
        let mut previous: Vec<Option<&NetworkGraphLink>> = vec![None; self.vertices.len()];
        let mut unvisited: BinaryHeap<Reverse<(u32, usize)>> = BinaryHeap::new();

        distances[start] = 0;
        unvisited.push(Reverse((0, start)));

        while let Some(Reverse((current_dist, current))) = unvisited.pop() {
            // Skip if we've already found a better path
            if current_dist > distances[current] {
                continue;
            }

            for (neighbor, link) in &self.outgoing[current] {
                let new_dist = current_dist.saturating_add(1);
                // Strict comparison keeps the first edge found at equal cost
                if new_dist < distances[*neighbor] {
                    distances[*neighbor] = new_dist;
                    previous[*neighbor] = Some(link);
                    unvisited.push(Reverse((new_dist, *neighbor)));
                }
            }
        }

        for (idx, link) in previous.into_iter().enumerate() {
            if idx == start {
                continue;
            }
            if let Some(link) = link {
                incoming.insert(self.vertices[idx].clone(), link.clone());
            }
        }
        incoming
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(id: &str, source: &str, target: &str) -> NetworkGraphLink {
        NetworkGraphLink::new(id, NodeId::from(source), NodeId::from(target))
    }

    #[test]
    fn test_chain() {
        let mut graph = DijkstraGraph::new();
        graph.add_edge(link("ab", "a", "b"));
        graph.add_edge(link("bc", "b", "c"));
        graph.add_vertex(NodeId::from("isolated"));

        let incoming = graph.incoming_edges_from(&NodeId::from("a"));
        assert_eq!(incoming.len(), 2);
        assert_eq!(incoming[&NodeId::from("b")].link_id, "ab");
        assert_eq!(incoming[&NodeId::from("c")].link_id, "bc");
        assert!(!incoming.contains_key(&NodeId::from("a")));
        assert!(!incoming.contains_key(&NodeId::from("isolated")));
    }

    #[test]
    fn test_prefers_shorter_path() {
        let mut graph = DijkstraGraph::new();
        graph.add_edge(link("ab", "a", "b"));
        graph.add_edge(link("bc", "b", "c"));
        graph.add_edge(link("cd", "c", "d"));
        graph.add_edge(link("ad", "a", "d"));

        let incoming = graph.incoming_edges_from(&NodeId::from("a"));
        assert_eq!(incoming[&NodeId::from("d")].link_id, "ad");
    }

    #[test]
    fn test_parallel_links_first_wins() {
        let mut graph = DijkstraGraph::new();
        graph.add_edge(link("ab-1", "a", "b"));
        graph.add_edge(link("ab-2", "a", "b"));

        let incoming = graph.incoming_edges_from(&NodeId::from("a"));
        assert_eq!(incoming[&NodeId::from("b")].link_id, "ab-1");
    }

    #[test]
    fn test_unknown_source() {
        let graph = DijkstraGraph::new();
        assert!(graph.incoming_edges_from(&NodeId::from("x")).is_empty());
    }
}
