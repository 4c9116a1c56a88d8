//! Routing table backed by swappable routing information

use crate::error::RoutingError;
use crate::router::{DropReason, Router, RouterStats, RoutingContext, RoutingDecision};
use crate::routing_info::NetworkRoutingInformation;
use async_trait::async_trait;
use overlay_topology::{GraphSnapshot, NetworkGraph, NodeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Routing table answering decisions from the current topology snapshot
#[derive(Debug)]
pub struct RoutingTable {
    /// Local node ID
    local_node_id: NodeId,
    /// Routing view of the latest snapshot
    current: RwLock<Arc<NetworkRoutingInformation>>,
    /// Number of snapshots applied
    epoch: AtomicU64,
    /// Router statistics
    stats: RwLock<RouterStats>,
    /// Counters for statistics
    decisions_counter: AtomicU64,
    forwards_counter: AtomicU64,
    local_counter: AtomicU64,
    drops_counter: AtomicU64,
}

impl RoutingTable {
    /// Create a routing table that knows only the local node
    pub fn new(local_node_id: NodeId) -> Result<Self, RoutingError> {
        let initial = NetworkGraph::new(local_node_id).snapshot();
        Ok(Self::with_information(
            NetworkRoutingInformation::from_snapshot(initial)?,
            0,
        ))
    }

    /// Create a routing table from an initial snapshot
    pub fn from_snapshot(snapshot: Arc<GraphSnapshot>) -> Result<Self, RoutingError> {
        Ok(Self::with_information(
            NetworkRoutingInformation::from_snapshot(snapshot)?,
            1,
        ))
    }

    fn with_information(info: NetworkRoutingInformation, epoch: u64) -> Self {
        let local_node_id = info.local_node().clone();
        Self {
            current: RwLock::new(Arc::new(info)),
            epoch: AtomicU64::new(epoch),
            stats: RwLock::new(RouterStats::new(local_node_id.clone())),
            local_node_id,
            decisions_counter: AtomicU64::new(0),
            forwards_counter: AtomicU64::new(0),
            local_counter: AtomicU64::new(0),
            drops_counter: AtomicU64::new(0),
        }
    }

    /// Routing view of the latest snapshot. Callers keep a consistent view
    /// for as long as they hold the returned handle.
    pub async fn routing_information(&self) -> Arc<NetworkRoutingInformation> {
        self.current.read().await.clone()
    }

    /// Number of snapshots applied
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Update statistics for a routing decision
    async fn update_stats(&self, decision: &RoutingDecision) {
        self.decisions_counter.fetch_add(1, Ordering::Relaxed);

        match decision {
            RoutingDecision::Forward(_) => {
                self.forwards_counter.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::Local => {
                self.local_counter.fetch_add(1, Ordering::Relaxed);
            }
            RoutingDecision::Drop(reason) => {
                self.drops_counter.fetch_add(1, Ordering::Relaxed);

                let mut stats = self.stats.write().await;
                let reason_str = reason.to_string();
                *stats.drop_reasons.entry(reason_str).or_insert(0) += 1;
            }
        }
    }
}

#[async_trait]
impl Router for RoutingTable {
    async fn decide(&self, ctx: &RoutingContext) -> RoutingDecision {
        debug!(
            "Making routing decision: src={}, dst={}",
            ctx.src_node, ctx.dst_node
        );

        // Check if destination is local
        if ctx.dst_node == self.local_node_id {
            let decision = RoutingDecision::Local;
            self.update_stats(&decision).await;
            return decision;
        }

        let info = self.routing_information().await;
        let decision = match info.next_link_towards(&ctx.dst_node) {
            Ok(link) => RoutingDecision::Forward(link),
            Err(RoutingError::NoRoute { target }) => {
                debug!("No route to destination {}", target);
                RoutingDecision::Drop(DropReason::NoRoute)
            }
            Err(e) => {
                warn!("Unexpected routing failure for {}: {}", ctx.dst_node, e);
                RoutingDecision::Drop(DropReason::NoRoute)
            }
        };
        self.update_stats(&decision).await;
        decision
    }

    fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    async fn is_reachable(&self, dst_node: &NodeId) -> bool {
        if *dst_node == self.local_node_id {
            return true;
        }

        self.routing_information().await.is_reachable(dst_node)
    }

    async fn get_stats(&self) -> RouterStats {
        let info = self.routing_information().await;
        let mut stats = self.stats.write().await;

        // Update counters
        stats.decisions_made = self.decisions_counter.load(Ordering::Relaxed);
        stats.messages_forwarded = self.forwards_counter.load(Ordering::Relaxed);
        stats.messages_local = self.local_counter.load(Ordering::Relaxed);
        stats.messages_dropped = self.drops_counter.load(Ordering::Relaxed);
        stats.reachable_nodes = info.reachable_nodes().len();
        stats.cache_misses = info.cache_misses();
        stats.topology_epoch = self.epoch();

        stats.clone()
    }

    async fn update_topology(&self, snapshot: Arc<GraphSnapshot>) -> Result<(), RoutingError> {
        if *snapshot.local_node() != self.local_node_id {
            return Err(RoutingError::LocalNodeMissing {
                local: self.local_node_id.clone(),
            });
        }

        let revision = snapshot.revision();
        let info = Arc::new(NetworkRoutingInformation::from_snapshot(snapshot)?);
        let reachable = info.reachable_nodes().len();
        {
            let mut current = self.current.write().await;
            let applied = current.snapshot().revision();
            if revision < applied {
                debug!(
                    "Ignoring topology revision {}, revision {} is already applied",
                    revision, applied
                );
                return Err(RoutingError::StaleSnapshot {
                    revision,
                    current: applied,
                });
            }
            *current = info;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;

        info!(
            "Routing table updated with epoch {} at revision {} ({} reachable nodes)",
            epoch, revision, reachable
        );
        Ok(())
    }
}
