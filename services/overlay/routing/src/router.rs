//! Router trait and routing decision logic

use crate::error::RoutingError;
use async_trait::async_trait;
use overlay_topology::{GraphSnapshot, NetworkGraphLink, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Routing decision result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Send on this outgoing link
    Forward(NetworkGraphLink),
    /// Deliver locally (we are the destination)
    Local,
    /// Drop the message
    Drop(DropReason),
}

/// Reason for dropping a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropReason {
    /// No route to destination
    NoRoute,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoRoute => write!(f, "no route to destination"),
        }
    }
}

/// Routing context for making routing decisions
#[derive(Debug, Clone)]
pub struct RoutingContext {
    /// Originating node
    pub src_node: NodeId,
    /// Destination node
    pub dst_node: NodeId,
}

impl RoutingContext {
    /// Create a new routing context
    pub fn new(src_node: NodeId, dst_node: NodeId) -> Self {
        Self { src_node, dst_node }
    }
}

/// Router trait for making routing decisions
#[async_trait]
pub trait Router: Send + Sync {
    /// Make a routing decision for the given context
    async fn decide(&self, ctx: &RoutingContext) -> RoutingDecision;

    /// Get the local node ID
    fn local_node_id(&self) -> &NodeId;

    /// Check if a destination is reachable
    async fn is_reachable(&self, dst_node: &NodeId) -> bool;

    /// Get routing statistics
    async fn get_stats(&self) -> RouterStats;

    /// Replace the routing view with one computed from a new snapshot
    async fn update_topology(&self, snapshot: Arc<GraphSnapshot>) -> Result<(), RoutingError>;
}

/// Router statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStats {
    /// Local node ID
    pub local_node_id: NodeId,
    /// Number of reachable nodes, including the local node
    pub reachable_nodes: usize,
    /// Number of topology snapshots applied
    pub topology_epoch: u64,
    /// Next hops computed for the current snapshot
    pub cache_misses: u64,
    /// Number of routing decisions made
    pub decisions_made: u64,
    /// Number of messages forwarded
    pub messages_forwarded: u64,
    /// Number of messages delivered locally
    pub messages_local: u64,
    /// Number of messages dropped
    pub messages_dropped: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
}

impl RouterStats {
    /// Create new router statistics
    pub fn new(local_node_id: NodeId) -> Self {
        Self {
            local_node_id,
            reachable_nodes: 1,
            topology_epoch: 0,
            cache_misses: 0,
            decisions_made: 0,
            messages_forwarded: 0,
            messages_local: 0,
            messages_dropped: 0,
            drop_reasons: HashMap::new(),
        }
    }
}
