//! In-memory chain double.
//!
//! Keeps per-chunk leaf vectors, the published-nullifier set and an agent
//! balance. Deposits append the commitment carried in the proof's public
//! signals, exactly as the contract extracts it on-chain.

use crate::ChainClient;
use ark_bn254::Fr;
use async_trait::async_trait;
use cipher_core::error::{Error, Result};
use cipher_core::field::fr_from_decimal;
use cipher_core::prover::{signal, Groth16Proof};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    chunks: HashMap<u32, Vec<Fr>>,
    nullifiers: HashSet<String>,
    balance: u64,
    current_chunk: u32,
    tx_counter: u64,
    offline: bool,
    fail_fetch: bool,
}

#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(balance: u64) -> Self {
        let chain = Self::default();
        chain.state.lock().expect("mock lock").balance = balance;
        chain
    }

    pub fn set_balance(&self, balance: u64) {
        self.state.lock().expect("mock lock").balance = balance;
    }

    pub fn set_current_chunk(&self, chunk: u32) {
        self.state.lock().expect("mock lock").current_chunk = chunk;
    }

    /// Simulate an unreachable gateway.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().expect("mock lock").offline = offline;
    }

    /// Fail only leaf reads, leaving the cheap queries up.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.state.lock().expect("mock lock").fail_fetch = fail;
    }

    /// Append a leaf as if another participant deposited.
    pub fn push_leaf(&self, chunk: u32, leaf: Fr) {
        self.state
            .lock()
            .expect("mock lock")
            .chunks
            .entry(chunk)
            .or_default()
            .push(leaf);
    }

    pub fn nullifier_published(&self, nullifier_hash: &str) -> bool {
        self.state
            .lock()
            .expect("mock lock")
            .nullifiers
            .contains(nullifier_hash)
    }

    fn check_online(state: &MockState) -> Result<()> {
        if state.offline {
            return Err(Error::ChainUnavailable("gateway offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn current_chunk_id(&self, _deadline: Duration) -> Result<u32> {
        let state = self.state.lock().expect("mock lock");
        Self::check_online(&state)?;
        Ok(state.current_chunk)
    }

    async fn leaf_count(&self, chunk: u32, _deadline: Duration) -> Result<u64> {
        let state = self.state.lock().expect("mock lock");
        Self::check_online(&state)?;
        Ok(state.chunks.get(&chunk).map_or(0, Vec::len) as u64)
    }

    async fn fetch_leaves(&self, chunk: u32, _deadline: Duration) -> Result<Vec<Fr>> {
        let state = self.state.lock().expect("mock lock");
        Self::check_online(&state)?;
        if state.fail_fetch {
            return Err(Error::ChainUnavailable("leaf storage unavailable".into()));
        }
        Ok(state.chunks.get(&chunk).cloned().unwrap_or_default())
    }

    async fn submit_deposit(
        &self,
        proof: &Groth16Proof,
        amount: u64,
        chunk: u32,
        _deadline: Duration,
    ) -> Result<String> {
        let mut state = self.state.lock().expect("mock lock");
        Self::check_online(&state)?;
        if !proof.is_well_formed() {
            return Err(Error::ChainRejected("malformed proof".into()));
        }
        if state.balance < amount {
            return Err(Error::ChainRejected("insufficient balance".into()));
        }
        let commitment = fr_from_decimal(proof.public_signal(0)?)?;
        state.balance -= amount;
        state.chunks.entry(chunk).or_default().push(commitment);
        state.tx_counter += 1;
        Ok(format!("mock-deposit-{}", state.tx_counter))
    }

    async fn submit_withdraw(
        &self,
        proof: &Groth16Proof,
        _recipient: &str,
        _chunk: u32,
        nullifier_hash: &str,
        _deadline: Duration,
    ) -> Result<String> {
        let mut state = self.state.lock().expect("mock lock");
        Self::check_online(&state)?;
        if !proof.is_well_formed() {
            return Err(Error::ChainRejected("malformed proof".into()));
        }
        if proof.public_signal(signal::NULLIFIER_HASH)? != nullifier_hash {
            return Err(Error::ChainRejected("nullifier hash disagrees with proof".into()));
        }
        if !state.nullifiers.insert(nullifier_hash.to_string()) {
            return Err(Error::ChainRejected("duplicate nullifier".into()));
        }
        state.tx_counter += 1;
        Ok(format!("mock-withdraw-{}", state.tx_counter))
    }

    async fn balance(&self, _deadline: Duration) -> Result<u64> {
        let state = self.state.lock().expect("mock lock");
        Self::check_online(&state)?;
        Ok(state.balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher_core::field::fr_to_decimal;
    use cipher_core::poseidon;
    use cipher_core::prover::{DepositWitness, Prover, StubProver, WithdrawWitness};

    const DEADLINE: Duration = Duration::from_secs(1);

    async fn deposit_proof(amount: u64) -> (Groth16Proof, Fr, Fr) {
        let nullifier = Fr::from(rand::random::<u64>());
        let secret = Fr::from(rand::random::<u64>());
        let witness = DepositWitness {
            nullifier,
            secret,
            amount,
            commitment: poseidon::commitment(nullifier, secret, amount),
        };
        (
            StubProver.prove_deposit(&witness).await.unwrap(),
            nullifier,
            secret,
        )
    }

    #[tokio::test]
    async fn deposit_appends_commitment_and_debits() {
        let chain = MockChain::with_balance(10_000_000);
        let (proof, _, _) = deposit_proof(1_000_000).await;
        let tx = chain
            .submit_deposit(&proof, 1_000_000, 0, DEADLINE)
            .await
            .unwrap();
        assert!(tx.starts_with("mock-deposit-"));
        assert_eq!(chain.leaf_count(0, DEADLINE).await.unwrap(), 1);
        assert_eq!(chain.balance(DEADLINE).await.unwrap(), 9_000_000);
        let leaves = chain.fetch_leaves(0, DEADLINE).await.unwrap();
        assert_eq!(
            fr_to_decimal(&leaves[0]),
            proof.public_signals[0]
        );
    }

    #[tokio::test]
    async fn duplicate_nullifier_is_rejected() {
        let chain = MockChain::with_balance(10_000_000);
        let (proof, nullifier, secret) = deposit_proof(1_000_000).await;
        chain
            .submit_deposit(&proof, 1_000_000, 0, DEADLINE)
            .await
            .unwrap();

        let leaf = poseidon::commitment(nullifier, secret, 1_000_000);
        let witness = WithdrawWitness {
            nullifier,
            secret,
            amount: 1_000_000,
            fee: 0,
            recipient: "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin".into(),
            root: leaf, // single-leaf fold with no siblings
            siblings: vec![],
            bits: vec![],
        };
        let withdraw = StubProver.prove_withdraw(&witness).await.unwrap();
        let hash = withdraw.public_signals[1].clone();

        chain
            .submit_withdraw(&withdraw, "r", 0, &hash, DEADLINE)
            .await
            .unwrap();
        assert!(chain.nullifier_published(&hash));
        let err = chain
            .submit_withdraw(&withdraw, "r", 0, &hash, DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChainRejected(reason) if reason.contains("duplicate")));
    }

    #[tokio::test]
    async fn offline_surfaces_chain_unavailable() {
        let chain = MockChain::new();
        chain.set_offline(true);
        assert!(matches!(
            chain.current_chunk_id(DEADLINE).await,
            Err(Error::ChainUnavailable(_))
        ));
    }
}
