//! Agent orchestrator.
//!
//! Owns the lifecycle of every subsystem and drives the deposit/withdraw
//! pipelines and the auto-mix loop. Background tasks: DHT server, HTTP
//! server, LAN beacon, peer cleanup, periodic re-announce, relayer queue
//! processor and the optional tree refresh timer.

use crate::book::{DepositBook, DepositRecord, PENDING_REF};
use crate::config::AgentConfig;
use crate::peers::{self, KnownPeer, PeerBook};
use crate::relayer::{random_delay, RelayerService};
use crate::share::{self, AppState};
use crate::sync::TreeSync;
use crate::wallet::{self, AgentWallet};
use cipher_chain::ChainClient;
use cipher_core::error::{Error, Result};
use cipher_core::field::fr_to_decimal;
use cipher_core::poseidon;
use cipher_core::prover::{DepositWitness, Groth16Proof, Prover, WithdrawWitness};
use cipher_core::DepositCode;
use cipher_dht::{DhtNode, NodeId};
use cipher_merkle::TreeStore;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const CHAIN_DEADLINE: Duration = Duration::from_secs(30);
/// Relayer status probes get a short leash.
const PROBE_DEADLINE: Duration = Duration::from_secs(2);
/// Relayer submission POST.
const RELAY_DEADLINE: Duration = Duration::from_secs(30);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(300);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const ERROR_COOLDOWN: Duration = Duration::from_secs(60);

pub struct DepositOutcome {
    pub tx_id: String,
    pub commitment: String,
    pub deposit_code: String,
}

#[derive(Debug)]
pub struct WithdrawOutcome {
    /// Relayer queue ID the deposit record now references.
    pub reference: String,
    /// `host:port` of the chosen relayer; `None` for self-service.
    pub relayer: Option<String>,
}

pub struct Agent {
    cfg: AgentConfig,
    wallet: AgentWallet,
    book: Arc<DepositBook>,
    store: Arc<TreeStore>,
    chain: Arc<dyn ChainClient>,
    prover: Arc<dyn Prover>,
    dht: Arc<DhtNode>,
    peers: Arc<PeerBook>,
    relayer: Arc<RelayerService>,
    state: Arc<AppState>,
    sync: TreeSync,
    stop: Arc<AtomicBool>,
    client: reqwest::Client,
}

impl Agent {
    pub async fn new(
        cfg: AgentConfig,
        chain: Arc<dyn ChainClient>,
        prover: Arc<dyn Prover>,
    ) -> Result<Self> {
        // pay the Poseidon parameter cost now, not on the first operation
        poseidon::init();

        let wallet = AgentWallet::load_or_create(&cfg.data_dir, cfg.wallet_path.as_deref())?;
        let book = Arc::new(DepositBook::open(&cfg.data_dir).await?);
        let store = Arc::new(TreeStore::open(cfg.data_dir.join("trees"))?);
        let peers = Arc::new(PeerBook::load(&cfg.data_dir, cfg.dev_mode));
        let dht = DhtNode::new(NodeId::from_seed(&wallet.public_key_bytes()), cfg.dev_mode);
        let relayer = RelayerService::new(cfg.relayer.clone(), Arc::clone(&chain));
        let state = Arc::new(AppState {
            store: Arc::clone(&store),
            peers: Arc::clone(&peers),
            relayer: Arc::clone(&relayer),
            http_port: AtomicU16::new(cfg.http_port),
        });
        let sync = TreeSync::new(Arc::clone(&store), Arc::clone(&chain), Arc::clone(&peers));

        info!(address = %wallet.address(), node_id = %dht.id(), "agent initialized");
        Ok(Self {
            cfg,
            wallet,
            book,
            store,
            chain,
            prover,
            dht,
            peers,
            relayer,
            state,
            sync,
            stop: Arc::new(AtomicBool::new(false)),
            client: reqwest::Client::new(),
        })
    }

    /// Bind listeners and spawn the background tasks. Bind failures are
    /// unrecoverable and returned to the caller.
    pub async fn start(&self) -> Result<()> {
        let dht_addr = self
            .dht
            .serve(SocketAddr::from(([0, 0, 0, 0], self.cfg.dht_port)))
            .await?;

        let listener =
            tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], self.cfg.http_port)))
                .await
                .map_err(|e| Error::Network(format!("http bind: {e}")))?;
        let http_addr = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?;
        self.state.http_port.store(http_addr.port(), Ordering::Relaxed);
        let app = share::router(Arc::clone(&self.state))
            .into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "http server exited");
            }
        });
        info!(dht = %dht_addr, http = %http_addr, "listeners up");

        {
            let peers = Arc::clone(&self.peers);
            let store = Arc::clone(&self.store);
            let stop = Arc::clone(&self.stop);
            let http_port = http_addr.port();
            let beacon_port = self.cfg.beacon_port;
            let broadcast = self.cfg.beacon_broadcast.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    peers::run_beacon(peers, store, http_port, beacon_port, broadcast, stop).await
                {
                    warn!(error = %e, "lan beacon exited");
                }
            });
        }

        {
            let peers = Arc::clone(&self.peers);
            let stop = Arc::clone(&self.stop);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
                loop {
                    ticker.tick().await;
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    peers.cleanup();
                }
            });
        }

        for (host, port) in &self.cfg.bootstrap {
            match self.dht.bootstrap(host, *port).await {
                Ok(()) => info!(host, port, "bootstrapped"),
                Err(e) => warn!(host, port, error = %e, "bootstrap failed"),
            }
        }

        {
            let dht = Arc::clone(&self.dht);
            let peers = Arc::clone(&self.peers);
            let stop = Arc::clone(&self.stop);
            let http_port = http_addr.port();
            let public_host = self.cfg.public_host.clone();
            tokio::spawn(async move {
                loop {
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    dht.announce(http_port, public_host.as_deref()).await;
                    record_agents(&dht, &peers).await;
                    tokio::time::sleep(ANNOUNCE_INTERVAL).await;
                }
            });
        }

        tokio::spawn(
            Arc::clone(&self.relayer).run_processor(Arc::clone(&self.stop)),
        );

        if let Some(every) = self.cfg.tree_refresh {
            let sync_chain = Arc::clone(&self.chain);
            let store = Arc::clone(&self.store);
            let peers = Arc::clone(&self.peers);
            let stop = Arc::clone(&self.stop);
            tokio::spawn(async move {
                let sync = TreeSync::new(store, sync_chain.clone(), peers);
                loop {
                    tokio::time::sleep(every).await;
                    if stop.load(Ordering::Relaxed) {
                        return;
                    }
                    match sync_chain.current_chunk_id(CHAIN_DEADLINE).await {
                        Ok(chunk) => {
                            if let Err(e) = sync.load_tree(chunk).await {
                                warn!(chunk, error = %e, "background tree refresh failed");
                            }
                        }
                        Err(e) => debug!(error = %e, "chunk id poll failed"),
                    }
                }
            });
        }

        Ok(())
    }

    /// Ask the network to stop and flush persisted state.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.peers.save() {
            warn!(error = %e, "failed to persist peers on stop");
        }
        info!("agent stopping");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn http_port(&self) -> u16 {
        self.state.http_port.load(Ordering::Relaxed)
    }

    pub fn wallet(&self) -> &AgentWallet {
        &self.wallet
    }

    pub fn dht(&self) -> &Arc<DhtNode> {
        &self.dht
    }

    pub fn peers(&self) -> &Arc<PeerBook> {
        &self.peers
    }

    pub fn book(&self) -> &Arc<DepositBook> {
        &self.book
    }

    pub fn store(&self) -> &Arc<TreeStore> {
        &self.store
    }

    pub fn tree_sync(&self) -> &TreeSync {
        &self.sync
    }

    pub fn relayer_service(&self) -> &Arc<RelayerService> {
        &self.relayer
    }

    /// Deposit `amount` into the pool. The record enters the book only
    /// after the chain accepted the transaction.
    pub async fn deposit(&self, amount: u64) -> Result<DepositOutcome> {
        let chunk = self.chain.current_chunk_id(CHAIN_DEADLINE).await?;
        let code = DepositCode::random(chunk, amount);
        let commitment = code.commitment()?;
        let witness = DepositWitness {
            nullifier: code.nullifier_fr()?,
            secret: code.secret_fr()?,
            amount,
            commitment,
        };
        let proof = self.prover.prove_deposit(&witness).await?;
        let tx_id = self
            .chain
            .submit_deposit(&proof, amount, chunk, CHAIN_DEADLINE)
            .await?;

        let deposit_code = code.encode();
        self.book
            .add(DepositRecord {
                code: deposit_code.clone(),
                commitment: fr_to_decimal(&commitment),
                amount,
                tx_id: tx_id.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                withdrawn: false,
                withdraw_ref: None,
            })
            .await?;

        info!(tx_id, chunk, amount, "deposit accepted");
        if self.cfg.debug_secrets {
            debug!(code = deposit_code, "deposit code");
        }
        Ok(DepositOutcome {
            tx_id,
            commitment: fr_to_decimal(&commitment),
            deposit_code,
        })
    }

    /// Withdraw the oldest unwithdrawn deposit of `amount` to `recipient`
    /// through the best available relayer.
    pub async fn withdraw(&self, amount: u64, recipient: &str) -> Result<WithdrawOutcome> {
        let record = self
            .book
            .find_unwithdrawn(Some(amount))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no unwithdrawn deposit of {amount}")))?;
        let code = DepositCode::decode(&record.code)?;

        self.sync.load_tree(code.chunk_id).await?;
        let commitment = code.commitment()?;
        let leaf_index = self
            .store
            .find_commitment(code.chunk_id, &commitment)
            .ok_or_else(|| Error::NotFound("commitment not present in tree".into()))?;
        let path = self.store.path(code.chunk_id, leaf_index)?;

        let witness = WithdrawWitness {
            nullifier: code.nullifier_fr()?,
            secret: code.secret_fr()?,
            amount,
            fee: 0,
            recipient: recipient.to_string(),
            root: path.root,
            siblings: path.siblings,
            bits: path.bits,
        };
        let proof = self.prover.prove_withdraw(&witness).await?;
        let chosen = self.select_relayer().await;

        // pre-mark: the flip must land on disk before any network call so a
        // crash cannot double-spend this deposit
        self.book.mark_withdrawn(&record.code, PENDING_REF).await?;

        let submission = match &chosen {
            Some(peer) => {
                self.submit_to_relayer(peer, &proof, recipient, amount, code.chunk_id)
                    .await
            }
            None => {
                debug!("no relayer responded, using self-service queue");
                let (queue_id, _) = self.relayer.enqueue(
                    proof.clone(),
                    recipient.to_string(),
                    amount,
                    code.chunk_id,
                );
                Ok(queue_id)
            }
        };

        match submission {
            Ok(reference) => {
                self.book.set_reference(&record.code, &reference).await?;
                info!(reference, "withdrawal handed to relayer");
                Ok(WithdrawOutcome {
                    reference,
                    relayer: chosen.map(|p| format!("{}:{}", p.host, p.port)),
                })
            }
            Err(e) => {
                if let Err(rollback) = self.book.unmark(&record.code).await {
                    error!(error = %rollback, "pre-mark rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Probe every known peer's relayer and pick the shortest queue.
    async fn select_relayer(&self) -> Option<KnownPeer> {
        let candidates = self.peers.snapshot();
        if candidates.is_empty() {
            return None;
        }
        let probes = candidates.into_iter().map(|peer| {
            let client = self.client.clone();
            async move {
                let url = format!("http://{}:{}/relayer/status", peer.host, peer.port);
                let response = client.get(&url).timeout(PROBE_DEADLINE).send().await.ok()?;
                let status = response.json::<serde_json::Value>().await.ok()?;
                let queue_length = status.get("queueLength")?.as_u64()?;
                Some((peer, queue_length))
            }
        });
        futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .min_by_key(|(_, queue_length)| *queue_length)
            .map(|(peer, _)| peer)
    }

    async fn submit_to_relayer(
        &self,
        peer: &KnownPeer,
        proof: &Groth16Proof,
        recipient: &str,
        amount: u64,
        chunk_id: u32,
    ) -> Result<String> {
        let url = format!("http://{}:{}/relayer/submit", peer.host, peer.port);
        let body = json!({
            "proof": proof,
            "recipient": recipient,
            "amount": amount,
            "chunkId": chunk_id,
        });
        let response = self
            .client
            .post(&url)
            .timeout(RELAY_DEADLINE)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("relayer {url}"))
                } else {
                    Error::Network(format!("relayer {url}: {e}"))
                }
            })?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "relayer {url} answered {}",
                response.status()
            )));
        }
        let reply: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("relayer {url}: {e}")))?;
        reply
            .get("queueId")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Network(format!("relayer {url}: no queueId")))
    }

    /// Deposit, wait, withdraw to a fresh key, wait, repeat. Every failure
    /// cools down for a minute and resumes.
    pub async fn run_auto_mix(&self) {
        let started = Instant::now();
        info!(denomination = self.cfg.denomination, "auto-mix loop started");
        while !self.should_stop(started) {
            if let Err(e) = self.mix_round(started).await {
                warn!(error = %e, "mix round failed, cooling down");
                self.sleep_interruptible(ERROR_COOLDOWN).await;
            }
        }
        info!("auto-mix loop stopped");
    }

    fn should_stop(&self, started: Instant) -> bool {
        if self.stop.load(Ordering::Relaxed) {
            return true;
        }
        self.cfg
            .mix
            .deadline
            .is_some_and(|limit| started.elapsed() >= limit)
    }

    async fn mix_round(&self, started: Instant) -> Result<()> {
        let denomination = self.cfg.denomination;
        let balance = self.chain.balance(CHAIN_DEADLINE).await?;
        if balance < denomination {
            return Err(Error::Capacity(format!(
                "balance {balance} below denomination {denomination}"
            )));
        }

        self.deposit(denomination).await?;
        self.sleep_interruptible(random_delay(
            self.cfg.mix.withdraw_min,
            self.cfg.mix.withdraw_max,
        ))
        .await;
        if self.should_stop(started) {
            return Ok(());
        }

        let chunk = self.chain.current_chunk_id(CHAIN_DEADLINE).await?;
        self.sync.load_tree(chunk).await?;
        let recipient = wallet::fresh_recipient();
        self.withdraw(denomination, &recipient).await?;

        self.sleep_interruptible(random_delay(
            self.cfg.mix.deposit_min,
            self.cfg.mix.deposit_max,
        ))
        .await;
        Ok(())
    }

    /// Sleep in one-second slices so the stop flag stays responsive.
    async fn sleep_interruptible(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stop.load(Ordering::Relaxed) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
        }
    }
}

/// Fold DHT rendezvous records into the HTTP peer book.
async fn record_agents(dht: &Arc<DhtNode>, peers: &Arc<PeerBook>) {
    let own_id = dht.id().to_hex();
    for record in dht.find_agents().await {
        if record.get("node_id").and_then(serde_json::Value::as_str) == Some(own_id.as_str()) {
            continue;
        }
        let Some(host) = record.get("host").and_then(serde_json::Value::as_str) else {
            continue;
        };
        let Some(port) = record
            .get("http_port")
            .and_then(serde_json::Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
        else {
            continue;
        };
        if peers.record(host, port, Vec::new()).is_ok() {
            debug!(host, port, "peer recorded from dht");
        }
    }
}
