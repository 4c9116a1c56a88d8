//! Network graph, frozen snapshots, and shortest-path trees for the overlay.
//!
//! This crate provides topology representation for the overlay network:
//! a graph builder that collects nodes and links, immutable snapshots that
//! routing runs against, reachability reduction, and a Dijkstra
//! implementation behind a small shortest-path interface.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod graph;
pub mod shortest_path;

pub use error::TopologyError;
pub use graph::{GraphSnapshot, NetworkGraph, NetworkGraphLink, NodeId};
pub use shortest_path::{DijkstraGraph, ShortestPathGraph};
