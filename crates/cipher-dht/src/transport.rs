//! Pooled request/response transport.
//!
//! One TCP connection per remote endpoint, shared by every in-flight RPC to
//! it. Responses are matched to callers strictly by transaction ID through
//! the pending map; a reply whose `tx_id` is unknown is discarded. Readers
//! enforce the idle timeout and return their connection slot when the
//! stream dies.

use crate::protocol::{read_frame, write_envelope, Envelope};
use crate::{IDLE_TIMEOUT, RPC_TIMEOUT};
use cipher_core::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;
use tracing::{debug, trace};

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>;
type ConnMap = Arc<tokio::sync::Mutex<HashMap<String, mpsc::Sender<Envelope>>>>;

pub struct Transport {
    pending: Pending,
    conns: ConnMap,
    limit: Arc<Semaphore>,
}

impl Transport {
    /// `limit` caps connections transport-wide; the server side shares it.
    pub fn new(limit: Arc<Semaphore>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            conns: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            limit,
        }
    }

    /// Send a request and await its reply. The envelope must carry a
    /// transaction ID; expiry of the RPC deadline frees the pending slot.
    pub async fn request(&self, host: &str, port: u16, env: Envelope) -> Result<Envelope> {
        let tx_id = env
            .tx_id
            .clone()
            .ok_or_else(|| Error::BadInput("request without tx_id".into()))?;
        let addr = format!("{host}:{port}");

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(tx_id.clone(), reply_tx);

        if let Err(e) = self.send(&addr, env).await {
            self.pending.lock().expect("pending lock").remove(&tx_id);
            return Err(e);
        }

        match timeout(RPC_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().expect("pending lock").remove(&tx_id);
                Err(Error::Network(format!("connection to {addr} closed")))
            }
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&tx_id);
                Err(Error::Timeout(format!("rpc to {addr}")))
            }
        }
    }

    async fn send(&self, addr: &str, env: Envelope) -> Result<()> {
        let sender = self.sender_for(addr).await?;
        if sender.send(env.clone()).await.is_ok() {
            return Ok(());
        }
        // stale entry: the connection died since we last used it
        self.conns.lock().await.remove(addr);
        let sender = self.sender_for(addr).await?;
        sender
            .send(env)
            .await
            .map_err(|_| Error::Network(format!("connection to {addr} closed")))
    }

    async fn sender_for(&self, addr: &str) -> Result<mpsc::Sender<Envelope>> {
        let mut conns = self.conns.lock().await;
        if let Some(sender) = conns.get(addr) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
            conns.remove(addr);
        }

        let permit = self
            .limit
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::Capacity("transport connection limit".into()))?;
        let stream = timeout(RPC_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {addr}")))?
            .map_err(|e| Error::Network(format!("connect to {addr}: {e}")))?;
        trace!(addr, "outbound connection opened");

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Envelope>(32);

        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                if write_envelope(&mut write_half, &env).await.is_err() {
                    break;
                }
            }
        });

        let pending = Arc::clone(&self.pending);
        let reader_conns = Arc::clone(&self.conns);
        let owned_addr = addr.to_string();
        let this_conn = tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let mut read_half = read_half;
            loop {
                let frame = match timeout(IDLE_TIMEOUT, read_frame(&mut read_half)).await {
                    Ok(Ok(Some(frame))) => frame,
                    _ => break,
                };
                let Ok(reply) = serde_json::from_slice::<Envelope>(&frame) else {
                    continue; // malformed frames are silently discarded
                };
                let Some(tx_id) = reply.tx_id.clone() else {
                    continue;
                };
                let waiter = pending.lock().expect("pending lock").remove(&tx_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => trace!(tx_id, "reply with no pending request dropped"),
                }
            }
            debug!(addr = owned_addr, "outbound connection closed");
            let mut map = conns.lock().await;
            // a replacement may already be registered under this address
            if map
                .get(&owned_addr)
                .is_some_and(|cur| cur.same_channel(&this_conn))
            {
                map.remove(&owned_addr);
            }
        });

        conns_for_insert
            .lock()
            .await
            .insert(addr.to_string(), tx.clone());
        Ok(tx)
    }
}
