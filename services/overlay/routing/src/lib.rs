//! Next-hop routing, full routes, and spanning trees for the overlay.
//!
//! This crate derives routing answers from frozen topology snapshots:
//! the outgoing link toward a destination, the complete path to it, and the
//! shortest-path spanning tree rooted at the local node. A [`RoutingTable`]
//! swaps in a new routing view per snapshot behind the [`Router`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod router;
pub mod routing_info;
pub mod table;

pub use error::RoutingError;
pub use router::*;
pub use routing_info::{NetworkRoutingInformation, SpanningTree};
pub use table::*;
