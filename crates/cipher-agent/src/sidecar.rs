//! Prover sidecar client.
//!
//! The Groth16 machinery runs out of process; witnesses go over as decimal
//! strings and come back as snarkjs-shaped proofs.

use async_trait::async_trait;
use cipher_core::error::{Error, Result};
use cipher_core::field::fr_to_decimal;
use cipher_core::prover::{DepositWitness, Groth16Proof, Prover, WithdrawWitness};
use serde_json::json;
use std::time::Duration;

/// Proof generation runs ~2 s; leave generous headroom.
const PROVE_DEADLINE: Duration = Duration::from_secs(60);

pub struct HttpProver {
    url: String,
    client: reqwest::Client,
}

impl HttpProver {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn prove(&self, circuit: &str, witness: serde_json::Value) -> Result<Groth16Proof> {
        let response = self
            .client
            .post(format!("{}/prove/{circuit}", self.url))
            .timeout(PROVE_DEADLINE)
            .json(&witness)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("prover {circuit}"))
                } else {
                    Error::Network(format!("prover {circuit}: {e}"))
                }
            })?;
        if !response.status().is_success() {
            return Err(Error::BadInput(format!(
                "prover rejected {circuit} witness: {}",
                response.status()
            )));
        }
        response
            .json::<Groth16Proof>()
            .await
            .map_err(|e| Error::Network(format!("prover {circuit}: {e}")))
    }
}

#[async_trait]
impl Prover for HttpProver {
    async fn prove_deposit(&self, witness: &DepositWitness) -> Result<Groth16Proof> {
        self.prove(
            "deposit",
            json!({
                "nullifier": fr_to_decimal(&witness.nullifier),
                "secret": fr_to_decimal(&witness.secret),
                "amount": witness.amount.to_string(),
                "commitment": fr_to_decimal(&witness.commitment),
            }),
        )
        .await
    }

    async fn prove_withdraw(&self, witness: &WithdrawWitness) -> Result<Groth16Proof> {
        self.prove(
            "withdraw",
            json!({
                "nullifier": fr_to_decimal(&witness.nullifier),
                "secret": fr_to_decimal(&witness.secret),
                "amount": witness.amount.to_string(),
                "fee": witness.fee.to_string(),
                "recipient": witness.recipient,
                "root": fr_to_decimal(&witness.root),
                "siblings": witness.siblings.iter().map(fr_to_decimal).collect::<Vec<_>>(),
                "bits": witness.bits,
            }),
        )
        .await
    }
}
