//! Shared primitives for the cipher mixing agent.
//!
//! Everything the member crates agree on lives here: the process-wide
//! Poseidon engine, the versioned deposit-code envelope, field-element
//! encoding helpers, the error taxonomy, and the prover capability seam.

pub mod code;
pub mod error;
pub mod field;
pub mod poseidon;
pub mod prover;

pub use code::DepositCode;
pub use error::{Error, Result};

/// Network identifier baked into the binary. Both the DHT rendezvous key
/// and the lookup target `SHA-256(NETWORK_ID)` derive from this value.
pub const NETWORK_ID: &str = "cipher-agent-mainnet-v1";
