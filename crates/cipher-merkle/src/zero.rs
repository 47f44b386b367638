//! Zero-subtree ladder.
//!
//! `Z[0] = 0` and `Z[l] = Poseidon(Z[l-1], Z[l-1])`. The ladder is derived
//! once per process from the same Poseidon parameters the contract uses, so
//! it matches the on-chain table by construction.

use crate::tree::TREE_HEIGHT;
use ark_bn254::Fr;
use ark_ff::Zero;
use cipher_core::poseidon;
use std::sync::OnceLock;

static LADDER: OnceLock<[Fr; TREE_HEIGHT + 1]> = OnceLock::new();

fn ladder() -> &'static [Fr; TREE_HEIGHT + 1] {
    LADDER.get_or_init(|| {
        let mut table = [Fr::zero(); TREE_HEIGHT + 1];
        for level in 1..=TREE_HEIGHT {
            table[level] = poseidon::hash2(table[level - 1], table[level - 1]);
        }
        table
    })
}

/// Root of a complete all-zero subtree of the given height.
///
/// `zero_hash(0)` is the empty leaf, `zero_hash(TREE_HEIGHT)` the root of an
/// empty chunk.
pub fn zero_hash(level: usize) -> Fr {
    ladder()[level]
}
