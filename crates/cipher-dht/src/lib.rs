//! Kademlia peer discovery for the mixing network.
//!
//! One well-known key (the network identifier) is served by every agent;
//! rendezvous records stored under it let agents find relayers and tree
//! peers. Transport is length-prefixed JSON over plain TCP; operators who
//! need confidentiality deploy behind an encrypted overlay.

pub mod id;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod routing;
pub mod transport;

pub use id::NodeId;
pub use node::DhtNode;
pub use peer::{validate_endpoint, Peer, PeerContact};
pub use routing::RoutingTable;

use std::time::Duration;

/// Bucket size.
pub const K: usize = 20;
/// Lookup parallelism.
pub const ALPHA: usize = 3;
/// Iterative lookup round cap.
pub const MAX_ROUNDS: usize = 10;
/// Per-RPC deadline.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);
/// Connections are torn down after this much silence.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Transport-wide connection cap, inbound and outbound together.
pub const MAX_CONNECTIONS: usize = 100;
/// Records kept per stored key.
pub const MAX_RECORDS_PER_KEY: usize = 64;
