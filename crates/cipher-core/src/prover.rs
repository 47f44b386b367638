//! Prover capability seam.
//!
//! Groth16 proving machinery is an external collaborator: the agent only
//! depends on the small surface below. `StubProver` is the in-memory double
//! used by tests and offline runs; the production sidecar client lives in
//! the agent crate where the HTTP stack is.
//!
//! Withdraw circuits expose their public inputs in a fixed order; the
//! relayer relies on it to recover the nullifier hash from a submitted
//! proof. That order is part of the circuit contract:
//! `[root, nullifier_hash, recipient, amount, fee]`.

use crate::error::{Error, Result};
use crate::field::{fr_from_be_bytes, fr_to_decimal};
use crate::poseidon;
use ark_bn254::Fr;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Withdraw public-signal positions.
pub mod signal {
    pub const ROOT: usize = 0;
    pub const NULLIFIER_HASH: usize = 1;
    pub const RECIPIENT: usize = 2;
    pub const AMOUNT: usize = 3;
    pub const FEE: usize = 4;
    pub const WITHDRAW_COUNT: usize = 5;
}

/// A Groth16 proof in the snarkjs JSON shape, plus the circuit's public
/// signals as decimal strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Groth16Proof {
    pub pi_a: Vec<String>,
    pub pi_b: Vec<Vec<String>>,
    pub pi_c: Vec<String>,
    pub protocol: String,
    pub curve: String,
    #[serde(rename = "publicSignals", default)]
    pub public_signals: Vec<String>,
}

impl Groth16Proof {
    /// Structural check used at the relayer surface. No pairing math
    /// happens here; relayed proofs are verified by the contract.
    pub fn is_well_formed(&self) -> bool {
        self.protocol == "groth16"
            && self.curve == "bn128"
            && self.pi_a.len() == 3
            && self.pi_c.len() == 3
            && self.pi_b.len() == 3
            && self.pi_b.iter().all(|pair| pair.len() == 2)
    }

    pub fn public_signal(&self, index: usize) -> Result<&str> {
        self.public_signals
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| Error::Integrity(format!("missing public signal {index}")))
    }
}

/// Witness for the deposit circuit.
#[derive(Debug, Clone)]
pub struct DepositWitness {
    pub nullifier: Fr,
    pub secret: Fr,
    pub amount: u64,
    pub commitment: Fr,
}

/// Witness for the withdraw circuit.
#[derive(Debug, Clone)]
pub struct WithdrawWitness {
    pub nullifier: Fr,
    pub secret: Fr,
    pub amount: u64,
    pub fee: u64,
    pub recipient: String,
    pub root: Fr,
    pub siblings: Vec<Fr>,
    pub bits: Vec<u8>,
}

/// Map a recipient address onto the scalar field the way the circuit does.
pub fn recipient_field(recipient: &str) -> Fr {
    let digest = Sha256::digest(recipient.as_bytes());
    // reduction mod the field order mirrors the circuit's byte packing
    fr_from_be_bytes(&digest).expect("sha256 digest is 32 bytes")
}

#[async_trait]
pub trait Prover: Send + Sync {
    async fn prove_deposit(&self, witness: &DepositWitness) -> Result<Groth16Proof>;
    async fn prove_withdraw(&self, witness: &WithdrawWitness) -> Result<Groth16Proof>;
}

/// Deterministic in-memory double.
///
/// Emits structurally valid proofs whose group elements are hashes of the
/// witness, and refuses witnesses that would not satisfy the real circuit
/// (wrong commitment, non-reproducing Merkle path), so pipeline tests fail
/// where the real prover would.
#[derive(Debug, Default, Clone)]
pub struct StubProver;

impl StubProver {
    fn element(tag: &str, seed: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tag.as_bytes());
        hasher.update(seed);
        let fr = fr_from_be_bytes(&hasher.finalize()).expect("sha256 digest is 32 bytes");
        fr_to_decimal(&fr)
    }

    fn proof_from_seed(seed: &[u8], public_signals: Vec<String>) -> Groth16Proof {
        Groth16Proof {
            pi_a: (0..3).map(|i| Self::element(&format!("a{i}"), seed)).collect(),
            pi_b: (0..3)
                .map(|i| (0..2).map(|j| Self::element(&format!("b{i}{j}"), seed)).collect())
                .collect(),
            pi_c: (0..3).map(|i| Self::element(&format!("c{i}"), seed)).collect(),
            protocol: "groth16".into(),
            curve: "bn128".into(),
            public_signals,
        }
    }
}

#[async_trait]
impl Prover for StubProver {
    async fn prove_deposit(&self, witness: &DepositWitness) -> Result<Groth16Proof> {
        let expected = poseidon::commitment(witness.nullifier, witness.secret, witness.amount);
        if expected != witness.commitment {
            return Err(Error::BadInput("commitment does not match witness".into()));
        }
        let seed = crate::field::fr_to_be_bytes(&witness.commitment);
        let signals = vec![
            fr_to_decimal(&witness.commitment),
            witness.amount.to_string(),
        ];
        Ok(Self::proof_from_seed(&seed, signals))
    }

    async fn prove_withdraw(&self, witness: &WithdrawWitness) -> Result<Groth16Proof> {
        if witness.siblings.len() != witness.bits.len() {
            return Err(Error::BadInput("path shape mismatch".into()));
        }
        // fold the inclusion path exactly as the circuit would
        let mut acc = poseidon::commitment(witness.nullifier, witness.secret, witness.amount);
        for (sibling, bit) in witness.siblings.iter().zip(&witness.bits) {
            acc = if *bit == 1 {
                poseidon::hash2(*sibling, acc)
            } else {
                poseidon::hash2(acc, *sibling)
            };
        }
        if acc != witness.root {
            return Err(Error::BadInput("merkle path does not reproduce root".into()));
        }

        let nullifier_hash = poseidon::nullifier_hash(witness.nullifier);
        let seed = crate::field::fr_to_be_bytes(&nullifier_hash);
        let signals = vec![
            fr_to_decimal(&witness.root),
            fr_to_decimal(&nullifier_hash),
            fr_to_decimal(&recipient_field(&witness.recipient)),
            witness.amount.to_string(),
            witness.fee.to_string(),
        ];
        Ok(Self::proof_from_seed(&seed, signals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::Zero;

    fn witness() -> DepositWitness {
        let nullifier = Fr::from(5u64);
        let secret = Fr::from(9u64);
        DepositWitness {
            nullifier,
            secret,
            amount: 100,
            commitment: poseidon::commitment(nullifier, secret, 100),
        }
    }

    #[tokio::test]
    async fn stub_deposit_proof_is_well_formed() {
        let proof = StubProver.prove_deposit(&witness()).await.unwrap();
        assert!(proof.is_well_formed());
        assert_eq!(proof.public_signals.len(), 2);
    }

    #[tokio::test]
    async fn stub_rejects_wrong_commitment() {
        let mut w = witness();
        w.commitment = Fr::zero();
        assert!(StubProver.prove_deposit(&w).await.is_err());
    }

    #[tokio::test]
    async fn stub_withdraw_carries_nullifier_hash() {
        let nullifier = Fr::from(5u64);
        let secret = Fr::from(9u64);
        let leaf = poseidon::commitment(nullifier, secret, 100);
        let sibling = Fr::from(77u64);
        let root = poseidon::hash2(leaf, sibling);
        let w = WithdrawWitness {
            nullifier,
            secret,
            amount: 100,
            fee: 0,
            recipient: "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin".into(),
            root,
            siblings: vec![sibling],
            bits: vec![0],
        };
        let proof = StubProver.prove_withdraw(&w).await.unwrap();
        assert_eq!(
            proof.public_signal(signal::NULLIFIER_HASH).unwrap(),
            fr_to_decimal(&poseidon::nullifier_hash(nullifier))
        );
    }

    #[tokio::test]
    async fn stub_rejects_bad_path() {
        let nullifier = Fr::from(5u64);
        let secret = Fr::from(9u64);
        let w = WithdrawWitness {
            nullifier,
            secret,
            amount: 100,
            fee: 0,
            recipient: "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin".into(),
            root: Fr::from(1u64),
            siblings: vec![Fr::zero()],
            bits: vec![0],
        };
        assert!(StubProver.prove_withdraw(&w).await.is_err());
    }

    #[test]
    fn malformed_proof_detected() {
        let mut proof = Groth16Proof {
            pi_a: vec!["1".into(); 3],
            pi_b: vec![vec!["1".into(); 2]; 3],
            pi_c: vec!["1".into(); 3],
            protocol: "groth16".into(),
            curve: "bn128".into(),
            public_signals: vec![],
        };
        assert!(proof.is_well_formed());
        proof.pi_b[1].pop();
        assert!(!proof.is_well_formed());
    }
}
