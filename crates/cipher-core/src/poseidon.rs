//! Process-wide Poseidon engine over the BN254 scalar field.
//!
//! The circuit and the commitment tree share one parameterization
//! (circom-compatible, RF=8), so a single engine serves both. The
//! `light_poseidon` hashers keep internal scratch state and therefore sit
//! behind mutexes; callers only see pure functions. `init()` is invoked
//! eagerly at agent start so the first user-visible operation does not pay
//! the parameter-derivation cost.

use ark_bn254::Fr;
use ark_ff::Zero;
use light_poseidon::{Poseidon, PoseidonHasher};
use std::sync::{Mutex, OnceLock};

struct Engine {
    arity2: Mutex<Poseidon<Fr>>,
    arity3: Mutex<Poseidon<Fr>>,
}

static ENGINE: OnceLock<Engine> = OnceLock::new();

fn engine() -> &'static Engine {
    ENGINE.get_or_init(|| Engine {
        arity2: Mutex::new(
            Poseidon::<Fr>::new_circom(2).expect("poseidon width-2 parameters"),
        ),
        arity3: Mutex::new(
            Poseidon::<Fr>::new_circom(3).expect("poseidon width-3 parameters"),
        ),
    })
}

/// Force parameter derivation now instead of on the first hash.
pub fn init() {
    let _ = engine();
}

/// `Poseidon(a, b)`, the tree combiner.
pub fn hash2(a: Fr, b: Fr) -> Fr {
    engine()
        .arity2
        .lock()
        .expect("poseidon lock")
        .hash(&[a, b])
        .expect("arity-2 input count is fixed")
}

/// `Poseidon(a, b, c)`, the commitment hash.
pub fn hash3(a: Fr, b: Fr, c: Fr) -> Fr {
    engine()
        .arity3
        .lock()
        .expect("poseidon lock")
        .hash(&[a, b, c])
        .expect("arity-3 input count is fixed")
}

/// `commitment = Poseidon(nullifier, secret, amount)`.
///
/// Argument order is part of the circuit contract.
pub fn commitment(nullifier: Fr, secret: Fr, amount: u64) -> Fr {
    hash3(nullifier, secret, Fr::from(amount))
}

/// `nullifier_hash = Poseidon(nullifier, 0)`, published on-chain at
/// withdraw time.
pub fn nullifier_hash(nullifier: Fr) -> Fr {
    hash2(nullifier, Fr::zero())
}
