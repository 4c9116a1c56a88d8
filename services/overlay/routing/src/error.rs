//! Routing error types.

use overlay_topology::NodeId;
use thiserror::Error;

/// Routing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Target is not reachable from the local node
    #[error("no route to node {target}")]
    NoRoute {
        /// Requested target
        target: NodeId,
    },

    /// Target is the local node itself
    #[error("requested a route from node {target} to itself")]
    RouteToSelf {
        /// Requested target
        target: NodeId,
    },

    /// The snapshot does not contain its own local node
    #[error("local node {local} is not part of the network graph")]
    LocalNodeMissing {
        /// Local node of the snapshot
        local: NodeId,
    },

    /// The snapshot is older than the one already applied
    #[error("snapshot revision {revision} is older than the applied revision {current}")]
    StaleSnapshot {
        /// Revision of the rejected snapshot
        revision: u64,
        /// Revision currently in use
        current: u64,
    },
}
