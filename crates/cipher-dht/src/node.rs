//! DHT node: server loop, message handlers, iterative lookup and the
//! rendezvous operations built on it.

use crate::id::NodeId;
use crate::peer::{validate_endpoint, Peer, PeerContact};
use crate::protocol::{
    new_tx_id, read_frame, write_envelope, Envelope, FindNodeData, FindValueData, MessageKind,
    NodesData, PingData, StoreData, ValueData,
};
use crate::routing::RoutingTable;
use crate::transport::Transport;
use crate::{ALPHA, IDLE_TIMEOUT, K, MAX_CONNECTIONS, MAX_RECORDS_PER_KEY, MAX_ROUNDS};
use cipher_core::error::{Error, Result};
use cipher_core::NETWORK_ID;
use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

pub struct DhtNode {
    id: NodeId,
    port: AtomicU16,
    allow_private: bool,
    table: Mutex<RoutingTable>,
    records: Mutex<HashMap<String, Vec<Value>>>,
    transport: Transport,
    limit: Arc<Semaphore>,
}

impl DhtNode {
    pub fn new(id: NodeId, allow_private: bool) -> Arc<Self> {
        let limit = Arc::new(Semaphore::new(MAX_CONNECTIONS));
        Arc::new(Self {
            id,
            port: AtomicU16::new(0),
            allow_private,
            table: Mutex::new(RoutingTable::new(id)),
            records: Mutex::new(HashMap::new()),
            transport: Transport::new(Arc::clone(&limit)),
            limit,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Listening port; zero until `serve` has bound.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    /// Copy of the routing table contents, closest to `target` first.
    pub fn closest_known(&self, target: &NodeId, k: usize) -> Vec<Peer> {
        self.table.lock().expect("table lock").closest(target, k)
    }

    pub fn peer_count(&self) -> usize {
        self.table.lock().expect("table lock").len()
    }

    /// Bind the server socket and spawn the accept loop.
    pub async fn serve(self: &Arc<Self>, bind: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| Error::Network(format!("bind {bind}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?;
        self.port.store(addr.port(), Ordering::Relaxed);
        info!(%addr, id = %self.id, "dht listening");

        let node = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "dht accept failed");
                        continue;
                    }
                };
                let Ok(permit) = node.limit.clone().try_acquire_owned() else {
                    drop(stream); // at the connection cap
                    continue;
                };
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    let _permit = permit;
                    node.handle_connection(stream, remote).await;
                });
            }
        });
        Ok(addr)
    }

    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) {
        trace!(%remote, "inbound dht connection");
        let (mut read_half, mut write_half) = stream.into_split();
        loop {
            let frame = match timeout(IDLE_TIMEOUT, read_frame(&mut read_half)).await {
                Ok(Ok(Some(frame))) => frame,
                _ => break,
            };
            // malformed messages are silently discarded
            let Ok(env) = serde_json::from_slice::<Envelope>(&frame) else {
                continue;
            };
            if let Some(reply) = self.dispatch(&env, &remote) {
                if write_envelope(&mut write_half, &reply).await.is_err() {
                    break;
                }
            }
        }
        trace!(%remote, "inbound dht connection closed");
    }

    fn dispatch(&self, env: &Envelope, remote: &SocketAddr) -> Option<Envelope> {
        self.touch_sender(env, remote);
        let my_id = self.id.to_hex();
        match env.kind {
            MessageKind::Ping => Some(env.reply(MessageKind::Pong, my_id, Value::Null)),
            MessageKind::FindNode => {
                let data: FindNodeData = serde_json::from_value(env.data.clone()).ok()?;
                let target = NodeId::from_hex(&data.target).ok()?;
                Some(env.reply(MessageKind::Nodes, my_id, self.nodes_payload(&target)))
            }
            MessageKind::Store => {
                let mut data: StoreData = serde_json::from_value(env.data.clone()).ok()?;
                if let Value::Object(map) = &mut data.value {
                    // record where the sender actually came from, unless it
                    // declared a public host itself
                    map.entry("host".to_string())
                        .or_insert_with(|| Value::String(remote.ip().to_string()));
                }
                self.store_record(&data.key, data.value);
                Some(env.reply(MessageKind::Stored, my_id, Value::Null))
            }
            MessageKind::FindValue => {
                let data: FindValueData = serde_json::from_value(env.data.clone()).ok()?;
                let records = self.records.lock().expect("records lock");
                match records.get(&data.key) {
                    Some(list) if !list.is_empty() => {
                        let payload = serde_json::to_value(ValueData {
                            value: Value::Array(list.clone()),
                        })
                        .ok()?;
                        Some(env.reply(MessageKind::Value, my_id, payload))
                    }
                    _ => {
                        drop(records);
                        let target = NodeId::for_key(&data.key);
                        Some(env.reply(MessageKind::Nodes, my_id, self.nodes_payload(&target)))
                    }
                }
            }
            // responses arriving on the server path have no pending slot
            MessageKind::Pong
            | MessageKind::Nodes
            | MessageKind::Stored
            | MessageKind::Value => None,
        }
    }

    fn nodes_payload(&self, target: &NodeId) -> Value {
        let nodes = self
            .closest_known(target, K)
            .iter()
            .map(Peer::contact)
            .collect();
        serde_json::to_value(NodesData { nodes }).unwrap_or(Value::Null)
    }

    /// Every valid inbound message refreshes the sender's bucket. The
    /// sender's listening port rides in `data.port`; without it we only see
    /// an ephemeral TCP port and skip the insert.
    fn touch_sender(&self, env: &Envelope, remote: &SocketAddr) {
        let Ok(sender) = NodeId::from_hex(&env.id) else {
            return;
        };
        if sender == self.id {
            return;
        }
        let Some(port) = env.data.get("port").and_then(Value::as_u64) else {
            return;
        };
        let Ok(port) = u16::try_from(port) else {
            return;
        };
        let host = remote.ip().to_string();
        if validate_endpoint(&host, port, self.allow_private).is_ok() {
            self.table
                .lock()
                .expect("table lock")
                .touch(Peer::new(sender, host, port));
        }
    }

    fn store_record(&self, key: &str, value: Value) {
        let mut records = self.records.lock().expect("records lock");
        let list = records.entry(key.to_string()).or_default();
        let canonical = value.to_string();
        if list.iter().any(|existing| existing.to_string() == canonical) {
            return;
        }
        if list.len() >= MAX_RECORDS_PER_KEY {
            list.remove(0);
        }
        list.push(value);
    }

    async fn rpc(&self, host: &str, port: u16, kind: MessageKind, data: Value) -> Result<Envelope> {
        let env = Envelope::new(kind, self.id.to_hex(), Some(new_tx_id()), data);
        self.transport.request(host, port, env).await
    }

    /// PING a peer. A PONG inserts it into the routing table: only peers
    /// that responded are ever added by the client path.
    pub async fn ping(&self, host: &str, port: u16) -> Result<NodeId> {
        let data = serde_json::to_value(PingData {
            port: Some(self.port()),
        })
        .map_err(|e| Error::Network(e.to_string()))?;
        let reply = self.rpc(host, port, MessageKind::Ping, data).await?;
        if reply.kind != MessageKind::Pong {
            return Err(Error::Network(format!("expected PONG, got {:?}", reply.kind)));
        }
        let responder = NodeId::from_hex(&reply.id)?;
        if responder != self.id && validate_endpoint(host, port, self.allow_private).is_ok() {
            self.table
                .lock()
                .expect("table lock")
                .touch(Peer::new(responder, host, port));
        }
        Ok(responder)
    }

    async fn find_node(&self, peer: &Peer, target: &NodeId) -> Result<Vec<Peer>> {
        let data = serde_json::to_value(FindNodeData {
            target: target.to_hex(),
            port: Some(self.port()),
        })
        .map_err(|e| Error::Network(e.to_string()))?;
        let reply = self
            .rpc(&peer.host, peer.port, MessageKind::FindNode, data)
            .await?;
        if reply.kind != MessageKind::Nodes {
            return Err(Error::Network(format!("expected NODES, got {:?}", reply.kind)));
        }
        self.table.lock().expect("table lock").touch(peer.clone());
        let data: NodesData = serde_json::from_value(reply.data)
            .map_err(|e| Error::Network(format!("bad NODES payload: {e}")))?;
        Ok(data
            .nodes
            .into_iter()
            .filter_map(|contact| contact.into_peer(self.allow_private).ok())
            .filter(|p| p.id != self.id)
            .collect())
    }

    /// Iterative lookup: seed with the K closest local peers, then query up
    /// to α unqueried candidates per round, merging replies into the
    /// shortlist, until nothing is left to ask or the round cap hits.
    pub async fn lookup(&self, target: NodeId) -> Vec<Peer> {
        let mut shortlist: HashMap<NodeId, Peer> = self
            .closest_known(&target, K)
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let mut queried: HashSet<NodeId> = HashSet::new();

        for round in 0..MAX_ROUNDS {
            let mut candidates: Vec<Peer> = shortlist
                .values()
                .filter(|p| !queried.contains(&p.id))
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by_key(|p| p.id.distance(&target));
            candidates.truncate(ALPHA);
            for peer in &candidates {
                queried.insert(peer.id);
            }

            let replies = join_all(
                candidates
                    .iter()
                    .map(|peer| self.find_node(peer, &target)),
            )
            .await;
            let mut learned = 0usize;
            for reply in replies.into_iter().flatten() {
                for peer in reply {
                    if let Entry::Vacant(slot) = shortlist.entry(peer.id) {
                        slot.insert(peer);
                        learned += 1;
                    }
                }
            }
            trace!(round, learned, shortlist = shortlist.len(), "lookup round");
        }

        let mut result: Vec<Peer> = shortlist.into_values().collect();
        result.sort_by_key(|p| p.id.distance(&target));
        result.truncate(K);
        result
    }

    /// Publish our rendezvous record at the K nodes closest to the network
    /// key. Individual store failures are absorbed.
    pub async fn announce(&self, http_port: u16, public_host: Option<&str>) -> usize {
        let mut record = json!({
            "node_id": self.id.to_hex(),
            "http_port": http_port,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        if let Some(host) = public_host {
            record["host"] = Value::String(host.to_string());
        }
        // we may ourselves be among the closest nodes to the key
        self.store_record(NETWORK_ID, record.clone());

        let closest = self.lookup(NodeId::for_key(NETWORK_ID)).await;
        let stores = closest.iter().map(|peer| async {
            let data = serde_json::to_value(StoreData {
                key: NETWORK_ID.to_string(),
                value: record.clone(),
                port: Some(self.port()),
            })
            .map_err(|e| Error::Network(e.to_string()))?;
            let reply = self
                .rpc(&peer.host, peer.port, MessageKind::Store, data)
                .await?;
            if reply.kind == MessageKind::Stored {
                Ok(())
            } else {
                Err(Error::Network("store not acknowledged".into()))
            }
        });
        let stored = join_all(stores)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count();
        debug!(stored, total = closest.len(), "announce complete");
        stored
    }

    /// Collect rendezvous records from the nodes closest to the network
    /// key, deduplicated by canonical JSON.
    pub async fn find_agents(&self) -> Vec<Value> {
        let closest = self.lookup(NodeId::for_key(NETWORK_ID)).await;
        let queries = closest.iter().map(|peer| async {
            let data = serde_json::to_value(FindValueData {
                key: NETWORK_ID.to_string(),
                port: Some(self.port()),
            })
            .ok()?;
            let reply = self
                .rpc(&peer.host, peer.port, MessageKind::FindValue, data)
                .await
                .ok()?;
            if reply.kind != MessageKind::Value {
                return None;
            }
            let data: ValueData = serde_json::from_value(reply.data).ok()?;
            match data.value {
                Value::Array(records) => Some(records),
                other => Some(vec![other]),
            }
        });

        let mut seen = HashSet::new();
        let mut agents = Vec::new();
        let local = self
            .records
            .lock()
            .expect("records lock")
            .get(NETWORK_ID)
            .cloned()
            .unwrap_or_default();
        for record in local
            .into_iter()
            .chain(join_all(queries).await.into_iter().flatten().flatten())
        {
            if seen.insert(record.to_string()) {
                agents.push(record);
            }
        }
        agents
    }

    /// Join the network through a seed peer, then populate nearby buckets.
    pub async fn bootstrap(&self, host: &str, port: u16) -> Result<()> {
        validate_endpoint(host, port, self.allow_private)?;
        let seed = self.ping(host, port).await?;
        debug!(%seed, host, port, "bootstrap seed responded");
        self.lookup(self.id).await;
        Ok(())
    }
}
