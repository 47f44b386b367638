//! Commitment-tree engine.
//!
//! Each chunk of the pool is a complete Merkle tree of height 20 over BN254
//! field elements, hashed with the shared Poseidon engine. Only ancestors of
//! real leaves are materialized; everything else falls back to the
//! pre-computed zero-subtree ladder. The [`TreeStore`] adds per-chunk
//! bookkeeping and a JSON disk cache.

pub mod store;
pub mod tree;
pub mod zero;

pub use store::{TreeSnapshot, TreeStore};
pub use tree::{InclusionPath, SparseTree, TREE_CAPACITY, TREE_HEIGHT};
pub use zero::zero_hash;
