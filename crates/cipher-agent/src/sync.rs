//! Tree synchronization.
//!
//! Load order for a chunk: on-chain leaf count → in-memory replica →
//! incremental update → disk cache → peer fetch → full rebuild from chain.
//! Every successful path leaves the disk cache fresh (the store refreshes
//! it on each mutation).

use crate::peers::PeerBook;
use cipher_chain::ChainClient;
use cipher_core::error::{Error, Result};
use cipher_merkle::{TreeSnapshot, TreeStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Deadline on chain reads during sync.
const CHAIN_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline on a peer tree download.
const PEER_FETCH_DEADLINE: Duration = Duration::from_secs(10);

pub struct TreeSync {
    store: Arc<TreeStore>,
    chain: Arc<dyn ChainClient>,
    peers: Arc<PeerBook>,
    client: reqwest::Client,
}

impl TreeSync {
    pub fn new(store: Arc<TreeStore>, chain: Arc<dyn ChainClient>, peers: Arc<PeerBook>) -> Self {
        Self {
            store,
            chain,
            peers,
            client: reqwest::Client::new(),
        }
    }

    pub fn store(&self) -> &Arc<TreeStore> {
        &self.store
    }

    /// Bring the replica for `chunk` up to the on-chain leaf count.
    pub async fn load_tree(&self, chunk: u32) -> Result<()> {
        let chain_count = self.chain.leaf_count(chunk, CHAIN_DEADLINE).await? as usize;

        if let Some(local) = self.store.leaf_count(chunk) {
            if local == chain_count {
                return Ok(());
            }
            // a replica exists but lags (or diverged): feed it the chain
            // leaves and let the store decide append vs rebuild
            return self.sync_from_chain(chunk).await;
        }

        // cold start: disk cache first
        let store = Arc::clone(&self.store);
        let cached = tokio::task::spawn_blocking(move || store.load_cached(chunk))
            .await
            .map_err(|e| Error::Disk(e.to_string()))??;
        if cached {
            if self.store.leaf_count(chunk) == Some(chain_count) {
                debug!(chunk, "tree cache is current");
                return Ok(());
            }
            return self.sync_from_chain(chunk).await;
        }

        // then the peer layer
        match self.fetch_complete_tree(chunk, chain_count).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => warn!(chunk, error = %e, "peer tree fetch failed"),
        }

        // last resort: rebuild from chain storage
        self.sync_from_chain(chunk).await
    }

    async fn sync_from_chain(&self, chunk: u32) -> Result<()> {
        let leaves = self.chain.fetch_leaves(chunk, CHAIN_DEADLINE).await?;
        let store = Arc::clone(&self.store);
        let count = leaves.len();
        tokio::task::spawn_blocking(move || store.sync(chunk, &leaves))
            .await
            .map_err(|e| Error::Disk(e.to_string()))??;
        info!(chunk, leaves = count, "tree synced from chain");
        Ok(())
    }

    /// Try to download a complete tree from peers, preferring those that
    /// advertise the chunk. The download is only installed after an
    /// in-process rebuild reproduces its declared root and its leaf count
    /// matches the chain.
    pub async fn fetch_complete_tree(&self, chunk: u32, expected_count: usize) -> Result<bool> {
        let mut candidates = self.peers.snapshot();
        candidates.sort_by_key(|p| !p.trees.contains(&chunk));

        for peer in candidates {
            let url = format!("http://{}:{}/tree/{chunk}", peer.host, peer.port);
            let snapshot = match self.download_snapshot(&url).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    debug!(url, error = %e, "peer tree download failed");
                    continue;
                }
            };
            if snapshot.leaf_count != expected_count {
                debug!(
                    url,
                    got = snapshot.leaf_count,
                    expected = expected_count,
                    "peer tree has wrong leaf count"
                );
                continue;
            }
            let store = Arc::clone(&self.store);
            let installed = tokio::task::spawn_blocking(move || {
                let tree = snapshot.into_verified_tree()?;
                store.install(chunk, tree)
            })
            .await
            .map_err(|e| Error::Disk(e.to_string()))?;
            match installed {
                Ok(()) => {
                    info!(chunk, host = peer.host, "tree installed from peer");
                    return Ok(true);
                }
                Err(e) => warn!(chunk, host = peer.host, error = %e, "peer tree rejected"),
            }
        }
        Ok(false)
    }

    async fn download_snapshot(&self, url: &str) -> Result<TreeSnapshot> {
        let response = self
            .client
            .get(url)
            .timeout(PEER_FETCH_DEADLINE)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::NotFound(format!("{url}: {}", response.status())));
        }
        response
            .json::<TreeSnapshot>()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }
}
