//! Chain adapter.
//!
//! The pool contract itself is an external collaborator; the agent only
//! needs the small read/submit surface below. `RpcChain` talks to the
//! pool's JSON-RPC gateway; `MockChain` is the in-memory double used by
//! tests and offline runs. Every call is bounded by a caller-supplied
//! deadline.

pub mod mock;
pub mod rpc;

pub use mock::MockChain;
pub use rpc::RpcChain;

use ark_bn254::Fr;
use async_trait::async_trait;
use cipher_core::error::Result;
use cipher_core::prover::Groth16Proof;
use std::time::Duration;

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Monotonically-growing ID of the chunk currently accepting deposits.
    async fn current_chunk_id(&self, deadline: Duration) -> Result<u32>;

    /// Number of leaves the contract has recorded for a chunk.
    async fn leaf_count(&self, chunk: u32, deadline: Duration) -> Result<u64>;

    /// All leaves of a chunk, in insertion order.
    async fn fetch_leaves(&self, chunk: u32, deadline: Duration) -> Result<Vec<Fr>>;

    /// Submit a deposit; returns the transaction ID after chain acceptance.
    async fn submit_deposit(
        &self,
        proof: &Groth16Proof,
        amount: u64,
        chunk: u32,
        deadline: Duration,
    ) -> Result<String>;

    /// Submit a withdraw under our own account, publishing the nullifier
    /// hash.
    async fn submit_withdraw(
        &self,
        proof: &Groth16Proof,
        recipient: &str,
        chunk: u32,
        nullifier_hash: &str,
        deadline: Duration,
    ) -> Result<String>;

    /// Spendable balance of the agent account.
    async fn balance(&self, deadline: Duration) -> Result<u64>;
}
