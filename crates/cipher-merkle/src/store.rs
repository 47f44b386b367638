//! Per-chunk tree bookkeeping and the JSON disk cache.
//!
//! The store is the single owner of replica state: the HTTP surface reads
//! snapshots out of it, the sync path feeds chain leaves into it, and every
//! successful mutation refreshes `trees/chunk-<id>.json`. The API is
//! synchronous; long rebuilds belong on a blocking worker, not the reactor.

use crate::tree::{InclusionPath, SparseTree};
use ark_bn254::Fr;
use cipher_core::error::{Error, Result};
use cipher_core::field::{fr_from_decimal, fr_to_decimal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Wire/disk image of one chunk replica. Field names are shared with the
/// `/tree/{chunk}` endpoint and the cache files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub chunk_id: u32,
    pub leaves: Vec<String>,
    /// Per-level prefix image of the node map; empty means leaves-only.
    pub tree: Vec<String>,
    pub root: String,
    pub leaf_count: usize,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl TreeSnapshot {
    pub fn of(chunk_id: u32, tree: &SparseTree) -> Self {
        Self {
            chunk_id,
            leaves: tree.leaves().iter().map(fr_to_decimal).collect(),
            tree: tree.flatten_nodes().iter().map(fr_to_decimal).collect(),
            root: fr_to_decimal(&tree.root()),
            leaf_count: tree.leaf_count(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    fn decode_leaves(&self) -> Result<Vec<Fr>> {
        self.leaves.iter().map(|s| fr_from_decimal(s)).collect()
    }

    /// Reassemble without rehashing. Requires a complete, consistent node
    /// image; fails `Integrity` otherwise.
    pub fn into_tree(&self) -> Result<SparseTree> {
        if self.leaf_count != self.leaves.len() {
            return Err(Error::Integrity(format!(
                "leafCount {} disagrees with {} leaves",
                self.leaf_count,
                self.leaves.len()
            )));
        }
        let leaves = self.decode_leaves()?;
        let flat = self
            .tree
            .iter()
            .map(|s| fr_from_decimal(s))
            .collect::<Result<Vec<_>>>()?;
        let tree = SparseTree::from_parts(leaves, &flat)?;
        if fr_to_decimal(&tree.root()) != self.root {
            return Err(Error::Integrity("declared root disagrees with node image".into()));
        }
        Ok(tree)
    }

    /// Rebuild from leaves alone and check the declared root. This is the
    /// path for material fetched from untrusted peers.
    pub fn into_verified_tree(&self) -> Result<SparseTree> {
        let tree = SparseTree::build(self.decode_leaves()?)?;
        if fr_to_decimal(&tree.root()) != self.root {
            return Err(Error::Integrity("declared root disagrees with rebuilt tree".into()));
        }
        Ok(tree)
    }
}

pub struct TreeStore {
    dir: PathBuf,
    trees: RwLock<HashMap<u32, SparseTree>>,
}

impl TreeStore {
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            dir,
            trees: RwLock::new(HashMap::new()),
        })
    }

    pub fn leaf_count(&self, chunk: u32) -> Option<usize> {
        self.trees
            .read()
            .expect("tree lock")
            .get(&chunk)
            .map(SparseTree::leaf_count)
    }

    pub fn root(&self, chunk: u32) -> Option<Fr> {
        self.trees
            .read()
            .expect("tree lock")
            .get(&chunk)
            .map(SparseTree::root)
    }

    /// Chunks this replica can serve to peers.
    pub fn advertised_chunks(&self) -> Vec<u32> {
        let mut chunks: Vec<u32> = self
            .trees
            .read()
            .expect("tree lock")
            .keys()
            .copied()
            .collect();
        chunks.sort_unstable();
        chunks
    }

    pub fn snapshot(&self, chunk: u32) -> Option<TreeSnapshot> {
        self.trees
            .read()
            .expect("tree lock")
            .get(&chunk)
            .map(|tree| TreeSnapshot::of(chunk, tree))
    }

    pub fn path(&self, chunk: u32, leaf_index: usize) -> Result<InclusionPath> {
        self.trees
            .read()
            .expect("tree lock")
            .get(&chunk)
            .ok_or_else(|| Error::NotFound(format!("no tree for chunk {chunk}")))?
            .path(leaf_index)
    }

    /// Linear scan for a commitment's leaf index.
    pub fn find_commitment(&self, chunk: u32, commitment: &Fr) -> Option<usize> {
        self.trees
            .read()
            .expect("tree lock")
            .get(&chunk)
            .and_then(|tree| tree.leaves().iter().position(|leaf| leaf == commitment))
    }

    /// Bring the chunk replica in line with the on-chain leaf sequence:
    /// incremental append while our prefix agrees, full rebuild otherwise.
    pub fn sync(&self, chunk: u32, chain_leaves: &[Fr]) -> Result<()> {
        {
            let mut trees = self.trees.write().expect("tree lock");
            let tree = trees.entry(chunk).or_insert_with(SparseTree::empty);
            if tree.is_prefix_of(chain_leaves) {
                for leaf in &chain_leaves[tree.leaf_count()..] {
                    tree.append(*leaf)?;
                }
            } else {
                warn!(chunk, "leaf prefix diverged from chain, rebuilding");
                *tree = SparseTree::build(chain_leaves.to_vec())?;
            }
        }
        self.write_cache(chunk)
    }

    /// Replace the replica for a chunk outright (peer fetch, cache load).
    pub fn install(&self, chunk: u32, tree: SparseTree) -> Result<()> {
        self.trees.write().expect("tree lock").insert(chunk, tree);
        self.write_cache(chunk)
    }

    fn cache_path(&self, chunk: u32) -> PathBuf {
        self.dir.join(format!("chunk-{chunk}.json"))
    }

    /// Load the on-disk cache for a chunk into memory. A complete node image
    /// installs as-is; a leaves-only file triggers a full rebuild; anything
    /// inconsistent is discarded.
    pub fn load_cached(&self, chunk: u32) -> Result<bool> {
        let path = self.cache_path(chunk);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let snapshot: TreeSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(chunk, error = %e, "discarding unreadable tree cache");
                return Ok(false);
            }
        };
        if snapshot.chunk_id != chunk {
            warn!(chunk, found = snapshot.chunk_id, "discarding mislabeled tree cache");
            return Ok(false);
        }
        let loaded = if snapshot.tree.is_empty() && !snapshot.leaves.is_empty() {
            snapshot
                .decode_leaves()
                .and_then(SparseTree::build)
        } else {
            snapshot.into_tree()
        };
        match loaded {
            Ok(tree) => {
                debug!(chunk, leaves = tree.leaf_count(), "tree cache loaded");
                self.install(chunk, tree)?;
                Ok(true)
            }
            Err(e) => {
                warn!(chunk, error = %e, "discarding inconsistent tree cache");
                Ok(false)
            }
        }
    }

    fn write_cache(&self, chunk: u32) -> Result<()> {
        let Some(snapshot) = self.snapshot(chunk) else {
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| Error::Disk(e.to_string()))?;
        let path = self.cache_path(chunk);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: u64) -> Vec<Fr> {
        (1..=n).map(Fr::from).collect()
    }

    fn store() -> (tempfile::TempDir, TreeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TreeStore::open(dir.path().join("trees")).unwrap();
        (dir, store)
    }

    #[test]
    fn sync_then_reload_from_cache() {
        let (dir, store) = store();
        store.sync(1, &sample(4)).unwrap();
        let root = store.root(1).unwrap();

        // fresh store over the same directory: cache hit installs the tree
        let reopened = TreeStore::open(dir.path().join("trees")).unwrap();
        assert!(reopened.load_cached(1).unwrap());
        assert_eq!(reopened.root(1), Some(root));
        assert_eq!(reopened.leaf_count(1), Some(4));
    }

    #[test]
    fn missing_cache_is_not_an_error() {
        let (_dir, store) = store();
        assert!(!store.load_cached(9).unwrap());
    }

    #[test]
    fn corrupt_cache_is_discarded() {
        let (dir, store) = store();
        store.sync(2, &sample(2)).unwrap();
        let path = dir.path().join("trees").join("chunk-2.json");
        fs::write(&path, b"{ not json").unwrap();
        let reopened = TreeStore::open(dir.path().join("trees")).unwrap();
        assert!(!reopened.load_cached(2).unwrap());
    }

    #[test]
    fn tampered_root_is_discarded() {
        let (dir, store) = store();
        store.sync(3, &sample(3)).unwrap();
        let path = dir.path().join("trees").join("chunk-3.json");
        let mut snapshot: TreeSnapshot =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        snapshot.root = "12345".into();
        fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();
        let reopened = TreeStore::open(dir.path().join("trees")).unwrap();
        assert!(!reopened.load_cached(3).unwrap());
    }

    #[test]
    fn leaves_only_cache_rebuilds() {
        let (dir, store) = store();
        store.sync(4, &sample(3)).unwrap();
        let expected = store.root(4).unwrap();
        let path = dir.path().join("trees").join("chunk-4.json");
        let mut snapshot: TreeSnapshot =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        snapshot.tree.clear();
        fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let reopened = TreeStore::open(dir.path().join("trees")).unwrap();
        assert!(reopened.load_cached(4).unwrap());
        assert_eq!(reopened.root(4), Some(expected));
    }

    #[test]
    fn divergent_prefix_rebuilds() {
        let (_dir, store) = store();
        store.sync(5, &sample(3)).unwrap();
        let mut diverged = sample(3);
        diverged[0] = Fr::from(42u64);
        diverged.push(Fr::from(43u64));
        store.sync(5, &diverged).unwrap();
        assert_eq!(store.leaf_count(5), Some(4));
        assert_eq!(store.root(5), Some(SparseTree::build(diverged).unwrap().root()));
    }

    #[test]
    fn commitment_scan() {
        let (_dir, store) = store();
        store.sync(6, &sample(5)).unwrap();
        assert_eq!(store.find_commitment(6, &Fr::from(3u64)), Some(2));
        assert_eq!(store.find_commitment(6, &Fr::from(9u64)), None);
    }

    #[test]
    fn peer_snapshot_verification_catches_lies() {
        let tree = SparseTree::build(sample(4)).unwrap();
        let mut snapshot = TreeSnapshot::of(7, &tree);
        assert!(snapshot.into_verified_tree().is_ok());
        snapshot.leaves[1] = fr_to_decimal(&Fr::from(99u64));
        assert!(matches!(
            snapshot.into_verified_tree(),
            Err(Error::Integrity(_))
        ));
    }
}
