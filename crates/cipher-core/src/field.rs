//! BN254 scalar-field encoding helpers
//!
//! The contract stores leaves as 32-byte big-endian field elements; every
//! JSON surface (tree sharing, cache files, proofs) carries them as decimal
//! strings. Both encodings live here so no other crate touches arkworks
//! directly.

use crate::error::{Error, Result};
use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use std::str::FromStr;

/// Decode a 32-byte big-endian field element.
///
/// Values are reduced modulo the field order, matching the contract's
/// storage convention.
pub fn fr_from_be_bytes(bytes: &[u8]) -> Result<Fr> {
    if bytes.len() != 32 {
        return Err(Error::Integrity(format!(
            "field element must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(Fr::from_be_bytes_mod_order(bytes))
}

/// Encode a field element as 32 big-endian bytes.
pub fn fr_to_be_bytes(value: &Fr) -> [u8; 32] {
    let repr = value.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - repr.len()..].copy_from_slice(&repr);
    out
}

/// Render a field element as the decimal string used on JSON surfaces.
pub fn fr_to_decimal(value: &Fr) -> String {
    value.to_string()
}

/// Parse a decimal-string field element.
pub fn fr_from_decimal(s: &str) -> Result<Fr> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Integrity(format!("not a decimal field element: {s:?}")));
    }
    Fr::from_str(s).map_err(|_| Error::Integrity(format!("field element out of range: {s}")))
}
