//! JSON-RPC client for the pool gateway.

use crate::ChainClient;
use ark_bn254::Fr;
use async_trait::async_trait;
use cipher_core::error::{Error, Result};
use cipher_core::field::fr_from_be_bytes;
use cipher_core::prover::Groth16Proof;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

#[derive(Clone)]
pub struct RpcChain {
    url: String,
    client: Client,
}

impl RpcChain {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: Client::new(),
        }
    }

    async fn call(&self, method: &str, params: Vec<Value>, deadline: Duration) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": "cipher-agent",
            "method": method,
            "params": params,
        });

        let response = timeout(deadline, self.client.post(&self.url).json(&payload).send())
            .await
            .map_err(|_| Error::Timeout(format!("rpc {method}")))?
            .map_err(|e| Error::ChainUnavailable(format!("{method}: {e}")))?;

        let body: RpcResponse = timeout(deadline, response.json())
            .await
            .map_err(|_| Error::Timeout(format!("rpc {method}")))?
            .map_err(|e| Error::ChainUnavailable(format!("{method}: {e}")))?;

        if let Some(error) = body.error {
            return Err(Error::ChainRejected(format!(
                "{} ({}): {}",
                method, error.code, error.message
            )));
        }
        body.result
            .ok_or_else(|| Error::ChainUnavailable(format!("{method}: no result")))
    }
}

#[async_trait]
impl ChainClient for RpcChain {
    async fn current_chunk_id(&self, deadline: Duration) -> Result<u32> {
        let result = self.call("pool_getCurrentChunk", vec![], deadline).await?;
        serde_json::from_value(result).map_err(|e| Error::ChainUnavailable(e.to_string()))
    }

    async fn leaf_count(&self, chunk: u32, deadline: Duration) -> Result<u64> {
        let result = self
            .call("pool_getLeafCount", vec![json!(chunk)], deadline)
            .await?;
        serde_json::from_value(result).map_err(|e| Error::ChainUnavailable(e.to_string()))
    }

    /// Read leaf batches in account order, stopping at the first missing
    /// batch. Each batch is hex-encoded, 32 big-endian bytes per leaf.
    async fn fetch_leaves(&self, chunk: u32, deadline: Duration) -> Result<Vec<Fr>> {
        timeout(deadline, async {
            let mut leaves = Vec::new();
            for batch_index in 0u32.. {
                let result = self
                    .call(
                        "pool_getLeafBatch",
                        vec![json!(chunk), json!(batch_index)],
                        deadline,
                    )
                    .await?;
                if result.is_null() {
                    break;
                }
                let batch: String = serde_json::from_value(result)
                    .map_err(|e| Error::ChainUnavailable(e.to_string()))?;
                let bytes = hex::decode(batch.trim_start_matches("0x"))
                    .map_err(|e| Error::Integrity(format!("leaf batch: {e}")))?;
                if bytes.len() % 32 != 0 {
                    return Err(Error::Integrity(format!(
                        "leaf batch of {} bytes is not 32-aligned",
                        bytes.len()
                    )));
                }
                for leaf in bytes.chunks_exact(32) {
                    leaves.push(fr_from_be_bytes(leaf)?);
                }
            }
            debug!(chunk, count = leaves.len(), "fetched chain leaves");
            Ok(leaves)
        })
        .await
        .map_err(|_| Error::Timeout(format!("fetch_leaves chunk {chunk}")))?
    }

    async fn submit_deposit(
        &self,
        proof: &Groth16Proof,
        amount: u64,
        chunk: u32,
        deadline: Duration,
    ) -> Result<String> {
        let proof_value =
            serde_json::to_value(proof).map_err(|e| Error::BadInput(e.to_string()))?;
        let result = self
            .call(
                "pool_submitDeposit",
                vec![proof_value, json!(amount), json!(chunk)],
                deadline,
            )
            .await?;
        serde_json::from_value(result).map_err(|e| Error::ChainUnavailable(e.to_string()))
    }

    async fn submit_withdraw(
        &self,
        proof: &Groth16Proof,
        recipient: &str,
        chunk: u32,
        nullifier_hash: &str,
        deadline: Duration,
    ) -> Result<String> {
        let proof_value =
            serde_json::to_value(proof).map_err(|e| Error::BadInput(e.to_string()))?;
        let result = self
            .call(
                "pool_submitWithdraw",
                vec![
                    proof_value,
                    json!(recipient),
                    json!(chunk),
                    json!(nullifier_hash),
                ],
                deadline,
            )
            .await?;
        serde_json::from_value(result).map_err(|e| Error::ChainUnavailable(e.to_string()))
    }

    async fn balance(&self, deadline: Duration) -> Result<u64> {
        let result = self.call("pool_getBalance", vec![], deadline).await?;
        serde_json::from_value(result).map_err(|e| Error::ChainUnavailable(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}
