//! Versioned deposit-code envelope.
//!
//! A deposit code is an opaque capability: whoever holds it can withdraw the
//! deposit it names. Version 1 is a fixed 77-byte layout, base58-wrapped for
//! transport:
//!
//! ```text
//! version:u8=1 | nullifier:32 | secret:32 | chunk_id:u32-BE | amount:u64-BE
//! ```

use crate::error::{Error, Result};
use crate::field::fr_from_be_bytes;
use crate::poseidon;
use ark_bn254::Fr;
use rand::rngs::OsRng;
use rand::RngCore;

pub const CODE_VERSION: u8 = 1;
pub const CODE_V1_LEN: usize = 1 + 32 + 32 + 4 + 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositCode {
    pub nullifier: [u8; 32],
    pub secret: [u8; 32],
    pub chunk_id: u32,
    pub amount: u64,
}

impl DepositCode {
    /// Draw fresh secret material from the OS CSPRNG.
    pub fn random(chunk_id: u32, amount: u64) -> Self {
        let mut nullifier = [0u8; 32];
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut nullifier);
        OsRng.fill_bytes(&mut secret);
        Self { nullifier, secret, chunk_id, amount }
    }

    pub fn nullifier_fr(&self) -> Result<Fr> {
        fr_from_be_bytes(&self.nullifier)
    }

    pub fn secret_fr(&self) -> Result<Fr> {
        fr_from_be_bytes(&self.secret)
    }

    /// The tree leaf this code spends: `Poseidon(nullifier, secret, amount)`.
    pub fn commitment(&self) -> Result<Fr> {
        Ok(poseidon::commitment(
            self.nullifier_fr()?,
            self.secret_fr()?,
            self.amount,
        ))
    }

    /// The double-spend tag published on-chain at withdraw time.
    pub fn nullifier_hash(&self) -> Result<Fr> {
        Ok(poseidon::nullifier_hash(self.nullifier_fr()?))
    }

    /// Encode is total: any code serializes.
    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(CODE_V1_LEN);
        buf.push(CODE_VERSION);
        buf.extend_from_slice(&self.nullifier);
        buf.extend_from_slice(&self.secret);
        buf.extend_from_slice(&self.chunk_id.to_be_bytes());
        buf.extend_from_slice(&self.amount.to_be_bytes());
        bs58::encode(buf).into_string()
    }

    pub fn decode(code: &str) -> Result<Self> {
        let bytes = bs58::decode(code)
            .into_vec()
            .map_err(|_| Error::BadEncoding)?;
        let version = *bytes.first().ok_or(Error::BadLength(0))?;
        if version != CODE_VERSION {
            return Err(Error::BadVersion(version));
        }
        if bytes.len() != CODE_V1_LEN {
            return Err(Error::BadLength(bytes.len()));
        }
        let mut nullifier = [0u8; 32];
        let mut secret = [0u8; 32];
        nullifier.copy_from_slice(&bytes[1..33]);
        secret.copy_from_slice(&bytes[33..65]);
        let chunk_id = u32::from_be_bytes(bytes[65..69].try_into().expect("4-byte slice"));
        let amount = u64::from_be_bytes(bytes[69..77].try_into().expect("8-byte slice"));
        Ok(Self { nullifier, secret, chunk_id, amount })
    }
}
