//! HTTP peer book and LAN beacon.
//!
//! Peers here are tree/relayer HTTP endpoints, learned from DHT rendezvous
//! records and LAN announce datagrams. Entries expire after two minutes of
//! silence; the surviving set is persisted to `known-peers.json` on stop
//! and during cleanup.

use cipher_core::error::{Error, Result};
use cipher_dht::validate_endpoint;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

pub const PEERS_FILE: &str = "known-peers.json";
/// Peers silent for longer than this are garbage-collected.
pub const PEER_TTL: Duration = Duration::from_secs(120);
/// Beacon cadence.
pub const BEACON_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeer {
    pub host: String,
    pub port: u16,
    /// Milliseconds since the epoch.
    pub last_seen: i64,
    #[serde(default)]
    pub trees: Vec<u32>,
}

pub struct PeerBook {
    path: PathBuf,
    dev_mode: bool,
    peers: Mutex<HashMap<String, KnownPeer>>,
}

impl PeerBook {
    /// Load and validate the persisted peer set; invalid rows are dropped.
    pub fn load(data_dir: &std::path::Path, dev_mode: bool) -> Self {
        let path = data_dir.join(PEERS_FILE);
        let mut peers = HashMap::new();
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<Vec<KnownPeer>>(&raw) {
                Ok(list) => {
                    for peer in list {
                        if validate_endpoint(&peer.host, peer.port, dev_mode).is_ok() {
                            peers.insert(format!("{}:{}", peer.host, peer.port), peer);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "discarding unreadable known-peers file"),
            }
        }
        debug!(count = peers.len(), "peer book loaded");
        Self {
            path,
            dev_mode,
            peers: Mutex::new(peers),
        }
    }

    /// Record (or refresh) a peer endpoint.
    pub fn record(&self, host: &str, port: u16, trees: Vec<u32>) -> Result<()> {
        validate_endpoint(host, port, self.dev_mode)?;
        let mut peers = self.peers.lock().expect("peer lock");
        let entry = peers
            .entry(format!("{host}:{port}"))
            .or_insert_with(|| KnownPeer {
                host: host.to_string(),
                port,
                last_seen: 0,
                trees: Vec::new(),
            });
        entry.last_seen = chrono::Utc::now().timestamp_millis();
        if !trees.is_empty() {
            entry.trees = trees;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<KnownPeer> {
        let mut list: Vec<KnownPeer> = self
            .peers
            .lock()
            .expect("peer lock")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        list
    }

    pub fn len(&self) -> usize {
        self.peers.lock().expect("peer lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired peers and rewrite the on-disk set.
    pub fn cleanup(&self) {
        let horizon = chrono::Utc::now().timestamp_millis() - PEER_TTL.as_millis() as i64;
        let removed = {
            let mut peers = self.peers.lock().expect("peer lock");
            let before = peers.len();
            peers.retain(|_, p| p.last_seen >= horizon);
            before - peers.len()
        };
        if removed > 0 {
            debug!(removed, "expired peers dropped");
        }
        if let Err(e) = self.save() {
            warn!(error = %e, "failed to persist peer book");
        }
    }

    pub fn save(&self) -> Result<()> {
        let list = self.snapshot();
        let body = serde_json::to_vec_pretty(&list).map_err(|e| Error::Disk(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BeaconPayload {
    #[serde(rename = "type")]
    kind: String,
    port: u16,
    trees: Vec<u32>,
    timestamp: i64,
    /// Per-process tag so a node can recognize its own broadcast echo.
    #[serde(default)]
    nonce: u64,
}

/// LAN beacon: broadcast our announce datagram every 30 s and record peers
/// from datagrams we receive (ignoring our own).
pub async fn run_beacon(
    peers: Arc<PeerBook>,
    store: Arc<cipher_merkle::TreeStore>,
    http_port: u16,
    beacon_port: u16,
    extra_broadcast: Vec<String>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", beacon_port))
        .await
        .map_err(|e| Error::Network(format!("beacon bind: {e}")))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::Network(e.to_string()))?;

    let mut targets = vec!["255.255.255.255".to_string()];
    targets.extend(extra_broadcast);

    let nonce: u64 = rand::random();
    let mut ticker = tokio::time::interval(BEACON_INTERVAL);
    let mut buf = [0u8; 2048];
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        tokio::select! {
            _ = ticker.tick() => {
                let payload = json!(BeaconPayload {
                    kind: "announce".into(),
                    port: http_port,
                    trees: store.advertised_chunks(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    nonce,
                });
                let bytes = payload.to_string();
                for target in &targets {
                    if let Err(e) = socket.send_to(bytes.as_bytes(), (target.as_str(), beacon_port)).await {
                        trace!(target, error = %e, "beacon send failed");
                    }
                }
            }
            received = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = received else { continue };
                let Ok(payload) = serde_json::from_slice::<BeaconPayload>(&buf[..len]) else {
                    continue;
                };
                if payload.kind != "announce" || payload.nonce == nonce {
                    continue; // not an announce, or our own echo
                }
                let host = from.ip().to_string();
                if peers.record(&host, payload.port, payload.trees).is_ok() {
                    trace!(host, port = payload.port, "peer recorded from beacon");
                }
            }
        }
    }
}
