//! 256-bit node identifiers and the XOR metric.

use cipher_core::error::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Hash a caller-provided seed into an ID.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self(Sha256::digest(seed).into())
    }

    /// Hash 32 fresh random bytes into an ID.
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Lookup target for a DHT key: `SHA-256(key)`.
    pub fn for_key(key: &str) -> Self {
        Self::from_seed(key.as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::BadInput(format!("bad node id: {s:?}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::BadInput("node id must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// XOR distance to another ID.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// XOR distance, ordered as a 256-bit big-endian unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; 32]);

impl Distance {
    /// `255 − position_of_highest_set_bit`, or `None` for the zero distance
    /// (self), which is never inserted.
    pub fn bucket_index(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return Some(i * 8 + byte.leading_zeros() as usize);
            }
        }
        None
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}
