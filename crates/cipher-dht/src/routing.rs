//! K-buckets and the routing table.

use crate::id::NodeId;
use crate::peer::Peer;
use crate::K;
use std::collections::HashMap;
use std::time::Instant;
use tracing::trace;

/// Peers per /24 before further additions from that subnet are refused.
pub const SUBNET_CAP: usize = 5;

/// Ordered bucket, newest at the tail. No eviction probing: a full bucket
/// ignores unknown peers.
#[derive(Debug, Default)]
pub struct KBucket {
    entries: Vec<Peer>,
}

impl KBucket {
    /// Move an existing entry to the tail, or append when there is room.
    /// Returns whether the peer is now present.
    pub fn touch(&mut self, peer: Peer) -> bool {
        if let Some(pos) = self.entries.iter().position(|p| p.id == peer.id) {
            let mut entry = self.entries.remove(pos);
            entry.host = peer.host;
            entry.port = peer.port;
            entry.last_seen = Instant::now();
            self.entries.push(entry);
            return true;
        }
        if self.entries.len() >= K {
            return false;
        }
        self.entries.push(peer);
        true
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.iter().any(|p| p.id == *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.entries.iter()
    }

    /// Newest entry, if any.
    pub fn tail(&self) -> Option<&Peer> {
        self.entries.last()
    }
}

pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            buckets: (0..256).map(|_| KBucket::default()).collect(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Insert or refresh a peer. Self-IDs are ignored; new IPv4 peers are
    /// refused once their /24 already holds `SUBNET_CAP` entries.
    pub fn touch(&mut self, peer: Peer) -> bool {
        let Some(bucket) = self.self_id.distance(&peer.id).bucket_index() else {
            return false;
        };
        if !self.buckets[bucket].contains(&peer.id) {
            if let Some(subnet) = peer.subnet() {
                if self.subnet_population(&subnet) >= SUBNET_CAP {
                    trace!(%peer.id, subnet, "subnet cap reached, peer dropped");
                    return false;
                }
            }
        }
        self.buckets[bucket].touch(peer)
    }

    fn subnet_population(&self, subnet: &str) -> usize {
        self.iter()
            .filter(|p| p.subnet().as_deref() == Some(subnet))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.buckets.iter().flat_map(KBucket::iter)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket(&self, index: usize) -> &KBucket {
        &self.buckets[index]
    }

    /// Up to `k` known peers, closest to `target` first.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.iter().cloned().collect();
        peers.sort_by_key(|p| p.id.distance(target));
        peers.truncate(k);
        peers
    }
}
