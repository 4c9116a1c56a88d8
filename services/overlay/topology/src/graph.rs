//! Network graph construction and frozen snapshots.
//!
//! A [`NetworkGraph`] is filled with nodes and links while topology
//! information arrives, then frozen into an immutable [`GraphSnapshot`] that
//! routing computations run against.

use crate::error::TopologyError;
use crate::shortest_path::{DijkstraGraph, ShortestPathGraph};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Identity of a network participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form of the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A directed, identified link between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkGraphLink {
    /// Link id, unique within a graph
    pub link_id: String,
    /// Sending node
    pub source: NodeId,
    /// Receiving node
    pub target: NodeId,
}

impl NetworkGraphLink {
    /// Create a link
    pub fn new(link_id: impl Into<String>, source: NodeId, target: NodeId) -> Self {
        Self {
            link_id: link_id.into(),
            source,
            target,
        }
    }
}

impl fmt::Display for NetworkGraphLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} --[{}]--> {}", self.source, self.link_id, self.target)
    }
}

#[derive(Debug, Clone, Default)]
struct GraphData {
    nodes: BTreeSet<NodeId>,
    links: BTreeMap<String, NetworkGraphLink>,
    /// Bumped on every change to the node or link sets
    revision: u64,
}

/// Mutable graph builder rooted at a local node
#[derive(Debug)]
pub struct NetworkGraph {
    local_node: NodeId,
    data: Mutex<GraphData>,
}

impl NetworkGraph {
    /// Create a graph containing only the local node
    pub fn new(local_node: NodeId) -> Self {
        let mut data = GraphData::default();
        data.nodes.insert(local_node.clone());
        Self {
            local_node,
            data: Mutex::new(data),
        }
    }

    /// Build a graph from a snapshot's nodes and links
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let data = GraphData {
            nodes: snapshot.nodes.clone(),
            links: snapshot
                .links
                .iter()
                .map(|l| (l.link_id.clone(), l.clone()))
                .collect(),
            revision: snapshot.revision,
        };
        Self {
            local_node: snapshot.local_node.clone(),
            data: Mutex::new(data),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GraphData> {
        // A panic while holding the lock cannot leave the sets half-updated
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The local node
    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// Add a node; returns false if it was already present
    pub fn add_node(&self, node: NodeId) -> bool {
        let mut data = self.lock();
        let added = data.nodes.insert(node);
        if added {
            data.revision += 1;
        }
        added
    }

    /// Add a link, implicitly adding both endpoints
    pub fn add_link(
        &self,
        link_id: impl Into<String>,
        source: NodeId,
        target: NodeId,
    ) -> Result<(), TopologyError> {
        let link = NetworkGraphLink::new(link_id, source, target);
        let mut data = self.lock();
        if data.links.contains_key(&link.link_id) {
            return Err(TopologyError::DuplicateLink(link.link_id));
        }
        data.nodes.insert(link.source.clone());
        data.nodes.insert(link.target.clone());
        data.links.insert(link.link_id.clone(), link);
        data.revision += 1;
        Ok(())
    }

    /// Remove a link by id
    pub fn remove_link(&self, link_id: &str) -> Option<NetworkGraphLink> {
        let mut data = self.lock();
        let removed = data.links.remove(link_id);
        if removed.is_some() {
            data.revision += 1;
        }
        removed
    }

    /// Remove a node and all links touching it
    pub fn remove_node(&self, node: &NodeId) -> Result<bool, TopologyError> {
        if *node == self.local_node {
            return Err(TopologyError::LocalNodeRemoval(node.clone()));
        }
        let mut data = self.lock();
        if !data.nodes.remove(node) {
            return Ok(false);
        }
        data.links
            .retain(|_, l| l.source != *node && l.target != *node);
        data.revision += 1;
        Ok(true)
    }

    /// Whether the node is part of the graph
    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.lock().nodes.contains(node)
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Number of links
    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    /// Number of changes applied since the graph was created
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Freeze the current content into an immutable snapshot
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        let data = self.lock();
        Arc::new(GraphSnapshot {
            local_node: self.local_node.clone(),
            nodes: data.nodes.clone(),
            links: data.links.values().cloned().collect(),
            revision: data.revision,
        })
    }

    /// Copy of this graph restricted to what the local node can reach.
    /// This graph is left unchanged.
    pub fn reduce_to_reachable(&self) -> NetworkGraph {
        NetworkGraph::from_snapshot(&self.snapshot().reduce_to_reachable())
    }
}

/// Immutable view of a network graph at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSnapshot {
    local_node: NodeId,
    nodes: BTreeSet<NodeId>,
    links: Vec<NetworkGraphLink>,
    revision: u64,
}

impl GraphSnapshot {
    /// Assemble a snapshot directly. Link endpoints are added as nodes; the
    /// local node is not added implicitly.
    pub fn new(
        local_node: NodeId,
        nodes: impl IntoIterator<Item = NodeId>,
        links: impl IntoIterator<Item = NetworkGraphLink>,
    ) -> Self {
        let mut nodes: BTreeSet<NodeId> = nodes.into_iter().collect();
        let mut by_id = BTreeMap::new();
        for link in links {
            nodes.insert(link.source.clone());
            nodes.insert(link.target.clone());
            by_id.insert(link.link_id.clone(), link);
        }
        Self {
            local_node,
            nodes,
            links: by_id.into_values().collect(),
            revision: 0,
        }
    }

    /// Same snapshot tagged with a graph revision
    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    /// Revision of the graph this snapshot was frozen from. Later snapshots
    /// of the same graph carry higher revisions.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// The local node
    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    /// All nodes in id order
    pub fn nodes(&self) -> &BTreeSet<NodeId> {
        &self.nodes
    }

    /// All links in id order
    pub fn links(&self) -> &[NetworkGraphLink] {
        &self.links
    }

    /// Whether the node is part of the snapshot
    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of links
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Links leaving `node`
    pub fn outgoing_links<'a>(
        &'a self,
        node: &'a NodeId,
    ) -> impl Iterator<Item = &'a NetworkGraphLink> + 'a {
        self.links.iter().filter(move |l| l.source == *node)
    }

    /// Links arriving at `node`
    pub fn incoming_links<'a>(
        &'a self,
        node: &'a NodeId,
    ) -> impl Iterator<Item = &'a NetworkGraphLink> + 'a {
        self.links.iter().filter(move |l| l.target == *node)
    }

    /// Shortest-path incoming edge for every node reachable from the local node
    pub fn shortest_path_incoming_edges(&self) -> HashMap<NodeId, NetworkGraphLink> {
        let mut graph = DijkstraGraph::new();
        for node in &self.nodes {
            graph.add_vertex(node.clone());
        }
        for link in &self.links {
            graph.add_edge(link.clone());
        }
        graph.incoming_edges_from(&self.local_node)
    }

    /// Copy restricted to nodes reachable from the local node and the links between them
    pub fn reduce_to_reachable(&self) -> GraphSnapshot {
        let mut reachable: BTreeSet<NodeId> =
            self.shortest_path_incoming_edges().into_keys().collect();
        reachable.insert(self.local_node.clone());

        let links: Vec<NetworkGraphLink> = self
            .links
            .iter()
            .filter(|l| reachable.contains(&l.source) && reachable.contains(&l.target))
            .cloned()
            .collect();

        debug!(
            "Reduced graph from {} nodes/{} links to {} nodes/{} links",
            self.nodes.len(),
            self.links.len(),
            reachable.len(),
            links.len()
        );

        GraphSnapshot {
            local_node: self.local_node.clone(),
            nodes: reachable,
            links,
            revision: self.revision,
        }
    }

    /// Render the snapshot as a Graphviz "dot" script
    pub fn to_graphviz(&self) -> String {
        let mut out = String::from("digraph overlay_network {\n");
        for node in &self.nodes {
            if *node == self.local_node {
                out.push_str(&format!("  \"{}\" [style=bold];\n", node));
            } else {
                out.push_str(&format!("  \"{}\";\n", node));
            }
        }
        for link in &self.links {
            out.push_str(&format!(
                "  \"{}\" -> \"{}\" [label=\"{}\"];\n",
                link.source, link.target, link.link_id
            ));
        }
        out.push_str("}\n");
        out
    }
}

impl fmt::Display for GraphSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Local Node Id: {}, Nodes: {}, Links: {}",
            self.local_node,
            self.nodes.len(),
            self.links.len()
        )?;
        writeln!(f, "Known Nodes:")?;
        for node in &self.nodes {
            let marker = if *node == self.local_node { "*" } else { "" };
            writeln!(
                f,
                "  {}{}, --{}-> * --{}->",
                node,
                marker,
                self.incoming_links(node).count(),
                self.outgoing_links(node).count()
            )?;
        }
        writeln!(f, "Links:")?;
        for link in &self.links {
            writeln!(f, "  {}", link)?;
        }
        Ok(())
    }
}
