//! Topology error types.

use crate::graph::NodeId;
use thiserror::Error;

/// Invalid graph modifications
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// A link with this id already exists
    #[error("duplicate link id {0}")]
    DuplicateLink(String),

    /// The local node cannot be removed from its own graph
    #[error("cannot remove local node {0}")]
    LocalNodeRemoval(NodeId),
}
