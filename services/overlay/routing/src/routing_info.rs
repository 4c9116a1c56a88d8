//! Routing information derived from one topology snapshot.
//!
//! A single shortest-path run from the local node yields the incoming edge
//! of every reachable node. Next hops are resolved lazily from that map and
//! memoized for every node passed on the way; the spanning tree is built on
//! first request by grouping the incoming edges by their source node.
//!
//! Instances are never updated in place. A new snapshot produces a new
//! instance, and holders of an old one keep a consistent view.

use crate::error::RoutingError;
use overlay_topology::{GraphSnapshot, NetworkGraphLink, NodeId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Shortest-path tree rooted at the local node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanningTree {
    root: NodeId,
    children: BTreeMap<NodeId, Vec<NetworkGraphLink>>,
}

impl SpanningTree {
    fn from_incoming(root: NodeId, incoming: &HashMap<NodeId, NetworkGraphLink>) -> Self {
        let mut children: BTreeMap<NodeId, Vec<NetworkGraphLink>> = BTreeMap::new();
        for link in incoming.values() {
            children
                .entry(link.source.clone())
                .or_default()
                .push(link.clone());
        }
        for links in children.values_mut() {
            links.sort_by(|a, b| a.target.cmp(&b.target));
        }
        Self { root, children }
    }

    /// Root of the tree
    pub fn root(&self) -> &NodeId {
        &self.root
    }

    /// Links to the immediate children of `node`
    pub fn children_of(&self, node: &NodeId) -> &[NetworkGraphLink] {
        self.children.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All tree links
    pub fn links(&self) -> impl Iterator<Item = &NetworkGraphLink> {
        self.children.values().flatten()
    }

    /// Number of tree links
    pub fn link_count(&self) -> usize {
        self.children.values().map(Vec::len).sum()
    }

    fn fmt_subtree(&self, f: &mut fmt::Formatter<'_>, node: &NodeId, depth: usize) -> fmt::Result {
        for link in self.children_of(node) {
            writeln!(
                f,
                "{:indent$}--[{}]--> {}",
                "",
                link.link_id,
                link.target,
                indent = depth * 2
            )?;
            self.fmt_subtree(f, &link.target, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for SpanningTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.root)?;
        self.fmt_subtree(f, &self.root, 1)
    }
}

#[derive(Debug, Default)]
struct RoutingCache {
    next_hops: HashMap<NodeId, NetworkGraphLink>,
    spanning_tree: Option<Arc<SpanningTree>>,
    misses: u64,
}

/// Routing view over one frozen topology snapshot
#[derive(Debug)]
pub struct NetworkRoutingInformation {
    snapshot: Arc<GraphSnapshot>,
    reachable: BTreeSet<NodeId>,
    incoming: HashMap<NodeId, NetworkGraphLink>,
    cache: Mutex<RoutingCache>,
}

impl NetworkRoutingInformation {
    /// Run the shortest-path computation over `snapshot`
    pub fn from_snapshot(snapshot: Arc<GraphSnapshot>) -> Result<Self, RoutingError> {
        let local = snapshot.local_node().clone();
        if !snapshot.contains_node(&local) {
            return Err(RoutingError::LocalNodeMissing { local });
        }

        let incoming = snapshot.shortest_path_incoming_edges();
        let mut reachable: BTreeSet<NodeId> = incoming.keys().cloned().collect();
        reachable.insert(local.clone());

        debug!(
            "Computed routing information for {}: {} of {} nodes reachable",
            local,
            reachable.len(),
            snapshot.node_count()
        );

        Ok(Self {
            snapshot,
            reachable,
            incoming,
            cache: Mutex::new(RoutingCache::default()),
        })
    }

    fn cache(&self) -> MutexGuard<'_, RoutingCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The local node
    pub fn local_node(&self) -> &NodeId {
        self.snapshot.local_node()
    }

    /// The snapshot this information was computed from
    pub fn snapshot(&self) -> &Arc<GraphSnapshot> {
        &self.snapshot
    }

    /// Nodes reachable from the local node, including itself
    pub fn reachable_nodes(&self) -> &BTreeSet<NodeId> {
        &self.reachable
    }

    /// Whether `node` is reachable from the local node
    pub fn is_reachable(&self, node: &NodeId) -> bool {
        self.reachable.contains(node)
    }

    /// The link by which `node` is first reached, if reachable and not local
    pub fn incoming_edge(&self, node: &NodeId) -> Option<&NetworkGraphLink> {
        self.incoming.get(node)
    }

    fn check_target(&self, target: &NodeId) -> Result<(), RoutingError> {
        if target == self.local_node() {
            return Err(RoutingError::RouteToSelf {
                target: target.clone(),
            });
        }
        if !self.incoming.contains_key(target) {
            return Err(RoutingError::NoRoute {
                target: target.clone(),
            });
        }
        Ok(())
    }

    /// The outgoing link a message to `target` should be sent on
    pub fn next_link_towards(&self, target: &NodeId) -> Result<NetworkGraphLink, RoutingError> {
        self.check_target(target)?;

        let mut cache = self.cache();
        if let Some(link) = cache.next_hops.get(target) {
            return Ok(link.clone());
        }

        // Walk back until a node with a known next hop or the local node is found
        let local = self.local_node();
        let mut unresolved = Vec::new();
        let mut current = target;
        let next_hop = loop {
            if let Some(link) = cache.next_hops.get(current) {
                break link.clone();
            }
            let link = self
                .incoming
                .get(current)
                .ok_or_else(|| RoutingError::NoRoute {
                    target: target.clone(),
                })?;
            unresolved.push(current.clone());
            if link.source == *local {
                break link.clone();
            }
            current = &link.source;
        };

        for node in unresolved {
            cache.misses += 1;
            cache.next_hops.insert(node, next_hop.clone());
        }
        Ok(next_hop)
    }

    /// The full sequence of links from the local node to `target`
    pub fn route_to(&self, target: &NodeId) -> Result<Vec<NetworkGraphLink>, RoutingError> {
        self.check_target(target)?;

        let local = self.local_node();
        let mut route = Vec::new();
        let mut current = target;
        while current != local {
            let link = self
                .incoming
                .get(current)
                .ok_or_else(|| RoutingError::NoRoute {
                    target: target.clone(),
                })?;
            route.push(link.clone());
            current = &link.source;
        }
        route.reverse();
        Ok(route)
    }

    /// Shortest-path spanning tree from the local node
    pub fn spanning_tree(&self) -> Arc<SpanningTree> {
        let mut cache = self.cache();
        if let Some(tree) = &cache.spanning_tree {
            return tree.clone();
        }
        let tree = Arc::new(SpanningTree::from_incoming(
            self.local_node().clone(),
            &self.incoming,
        ));
        cache.spanning_tree = Some(tree.clone());
        tree
    }

    /// Next hop for every reachable node except the local one, in node order
    pub fn next_hop_table(&self) -> Vec<(NodeId, NetworkGraphLink)> {
        let mut table = Vec::with_capacity(self.incoming.len());
        for node in &self.reachable {
            if let Ok(link) = self.next_link_towards(node) {
                table.push((node.clone(), link));
            }
        }
        table
    }

    /// Number of nodes whose next hop had to be computed
    pub fn cache_misses(&self) -> u64 {
        self.cache().misses
    }

    /// Reset the cache miss counter
    pub fn reset_cache_misses(&self) {
        self.cache().misses = 0;
    }
}
