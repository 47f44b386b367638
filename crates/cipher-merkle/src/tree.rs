//! Sparse fixed-height Merkle tree over BN254 field elements.
//!
//! Leaves occupy indices `0..n` at level 0; level `TREE_HEIGHT` holds the
//! root. Because leaves are always a prefix, the materialized nodes at level
//! `l` are exactly indices `0..ceil(n / 2^l)`; the node map never holds
//! anything else, and missing children resolve to the zero ladder.

use crate::zero::zero_hash;
use ark_bn254::Fr;
use cipher_core::error::{Error, Result};
use cipher_core::poseidon;
use std::collections::HashMap;

pub const TREE_HEIGHT: usize = 20;
pub const TREE_CAPACITY: usize = 1 << TREE_HEIGHT;

/// Inclusion path for one leaf. A value type: nothing borrows the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionPath {
    /// Sibling per level, leaf level first.
    pub siblings: Vec<Fr>,
    /// 1 where the running index is a right child.
    pub bits: Vec<u8>,
    /// Root the path folds back to.
    pub root: Fr,
}

impl InclusionPath {
    /// Fold the path from a leaf back to a root, the way the circuit does.
    pub fn fold(&self, leaf: Fr) -> Fr {
        self.siblings
            .iter()
            .zip(&self.bits)
            .fold(leaf, |acc, (sibling, bit)| {
                if *bit == 1 {
                    poseidon::hash2(*sibling, acc)
                } else {
                    poseidon::hash2(acc, *sibling)
                }
            })
    }
}

#[derive(Debug, Clone)]
pub struct SparseTree {
    leaves: Vec<Fr>,
    /// Internal nodes keyed by `(level, index)`, levels `1..=TREE_HEIGHT`.
    nodes: HashMap<(u8, u32), Fr>,
    root: Fr,
}

impl SparseTree {
    pub fn empty() -> Self {
        Self {
            leaves: Vec::new(),
            nodes: HashMap::new(),
            root: zero_hash(TREE_HEIGHT),
        }
    }

    /// Full build: write the leaves, then fill parents bottom-up wherever at
    /// least one child is present.
    pub fn build(leaves: Vec<Fr>) -> Result<Self> {
        if leaves.len() > TREE_CAPACITY {
            return Err(Error::Capacity(format!(
                "{} leaves exceed chunk capacity {TREE_CAPACITY}",
                leaves.len()
            )));
        }
        let mut tree = Self {
            leaves,
            nodes: HashMap::new(),
            root: zero_hash(TREE_HEIGHT),
        };
        let mut width = tree.leaves.len();
        for level in 1..=TREE_HEIGHT {
            width = width.div_ceil(2);
            if width == 0 {
                break;
            }
            for index in 0..width {
                let value = poseidon::hash2(
                    tree.node(level - 1, 2 * index),
                    tree.node(level - 1, 2 * index + 1),
                );
                tree.nodes.insert((level as u8, index as u32), value);
            }
        }
        tree.root = tree.node(TREE_HEIGHT, 0);
        Ok(tree)
    }

    /// Append one leaf and rehash just its path to the root.
    pub fn append(&mut self, leaf: Fr) -> Result<()> {
        if self.leaves.len() >= TREE_CAPACITY {
            return Err(Error::Capacity(format!(
                "chunk is full at {TREE_CAPACITY} leaves"
            )));
        }
        let mut index = self.leaves.len();
        self.leaves.push(leaf);
        for level in 1..=TREE_HEIGHT {
            index /= 2;
            let value = poseidon::hash2(
                self.node(level - 1, 2 * index),
                self.node(level - 1, 2 * index + 1),
            );
            self.nodes.insert((level as u8, index as u32), value);
        }
        self.root = self.node(TREE_HEIGHT, 0);
        Ok(())
    }

    /// Node value at `(level, index)`; absent nodes resolve to the zero
    /// ladder at that level.
    pub fn node(&self, level: usize, index: usize) -> Fr {
        if level == 0 {
            return self
                .leaves
                .get(index)
                .copied()
                .unwrap_or_else(|| zero_hash(0));
        }
        self.nodes
            .get(&(level as u8, index as u32))
            .copied()
            .unwrap_or_else(|| zero_hash(level))
    }

    pub fn root(&self) -> Fr {
        self.root
    }

    pub fn leaves(&self) -> &[Fr] {
        &self.leaves
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Whether this tree's leaves are a (possibly equal) prefix of `other`.
    pub fn is_prefix_of(&self, other: &[Fr]) -> bool {
        self.leaves.len() <= other.len() && self.leaves == other[..self.leaves.len()]
    }

    /// Inclusion path for the leaf at `index`.
    pub fn path(&self, index: usize) -> Result<InclusionPath> {
        if index >= self.leaves.len() {
            return Err(Error::NotFound(format!(
                "leaf {index} not in tree of {} leaves",
                self.leaves.len()
            )));
        }
        let mut siblings = Vec::with_capacity(TREE_HEIGHT);
        let mut bits = Vec::with_capacity(TREE_HEIGHT);
        let mut cursor = index;
        for level in 0..TREE_HEIGHT {
            siblings.push(self.node(level, cursor ^ 1));
            bits.push((cursor & 1) as u8);
            cursor /= 2;
        }
        Ok(InclusionPath {
            siblings,
            bits,
            root: self.root,
        })
    }

    /// Deterministic per-level serialization of the node map: for each level
    /// `1..=TREE_HEIGHT`, nodes `0..ceil(n / 2^level)` in index order.
    pub fn flatten_nodes(&self) -> Vec<Fr> {
        let mut out = Vec::new();
        let mut width = self.leaves.len();
        for level in 1..=TREE_HEIGHT {
            width = width.div_ceil(2);
            for index in 0..width {
                out.push(self.node(level, index));
            }
        }
        out
    }

    /// Number of entries `flatten_nodes` produces for a given leaf count.
    pub fn flat_len(leaf_count: usize) -> usize {
        let mut total = 0;
        let mut width = leaf_count;
        for _ in 1..=TREE_HEIGHT {
            width = width.div_ceil(2);
            total += width;
        }
        total
    }

    /// Reassemble a tree from leaves plus a `flatten_nodes` image, without
    /// rehashing. The caller is responsible for having checked `flat_len`.
    pub fn from_parts(leaves: Vec<Fr>, flat: &[Fr]) -> Result<Self> {
        if leaves.len() > TREE_CAPACITY {
            return Err(Error::Capacity(format!(
                "{} leaves exceed chunk capacity {TREE_CAPACITY}",
                leaves.len()
            )));
        }
        if flat.len() != Self::flat_len(leaves.len()) {
            return Err(Error::Integrity(format!(
                "node image has {} entries, expected {}",
                flat.len(),
                Self::flat_len(leaves.len())
            )));
        }
        let mut nodes = HashMap::new();
        let mut cursor = 0;
        let mut width = leaves.len();
        for level in 1..=TREE_HEIGHT {
            width = width.div_ceil(2);
            for index in 0..width {
                nodes.insert((level as u8, index as u32), flat[cursor]);
                cursor += 1;
            }
        }
        let root = nodes
            .get(&(TREE_HEIGHT as u8, 0))
            .copied()
            .unwrap_or_else(|| zero_hash(TREE_HEIGHT));
        Ok(Self { leaves, nodes, root })
    }
}
