//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// State directory; `~/.cipher-agent` unless overridden.
    pub data_dir: PathBuf,
    /// Tree-sharing and relayer HTTP port.
    pub http_port: u16,
    /// Kademlia port.
    pub dht_port: u16,
    /// LAN beacon UDP port.
    pub beacon_port: u16,
    /// Pool gateway JSON-RPC endpoint.
    pub rpc_url: String,
    /// Prover sidecar endpoint; the in-process stub is used when absent.
    pub prover_url: Option<String>,
    /// Seed peers as `(host, dht_port)`.
    pub bootstrap: Vec<(String, u16)>,
    /// Host to advertise instead of letting peers record the observed one.
    pub public_host: Option<String>,
    /// Accept RFC-1918 peers (local testnets).
    pub dev_mode: bool,
    /// Gate the few log lines that would reveal secret material.
    pub debug_secrets: bool,
    /// Fixed denomination this agent mixes.
    pub denomination: u64,
    /// Explicit wallet key path instead of `<data-dir>/agent-wallet.json`.
    pub wallet_path: Option<PathBuf>,
    /// Extra beacon broadcast addresses beside the limited broadcast.
    pub beacon_broadcast: Vec<String>,
    /// Background tree refresh cadence; disabled when `None`.
    pub tree_refresh: Option<Duration>,
    pub relayer: RelayerConfig,
    pub mix: MixConfig,
}

#[derive(Debug, Clone)]
pub struct RelayerConfig {
    /// Unlinkability delay bounds for queued withdrawals.
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Flat fee advertised on `/relayer/status`.
    pub fee: u64,
    pub rate_limit: RateLimitConfig,
    /// Submission body cap in bytes.
    pub max_body: usize,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests: usize,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct MixConfig {
    /// Wait between withdraw completion and the next deposit.
    pub deposit_min: Duration,
    pub deposit_max: Duration,
    /// Wait between a deposit and its withdrawal.
    pub withdraw_min: Duration,
    pub withdraw_max: Duration,
    /// Optional wall-clock bound on the whole loop.
    pub deadline: Option<Duration>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".cipher-agent"),
            http_port: 8550,
            dht_port: 8549,
            beacon_port: 8548,
            rpc_url: "http://127.0.0.1:8899".into(),
            prover_url: None,
            bootstrap: Vec::new(),
            public_host: None,
            dev_mode: false,
            debug_secrets: false,
            denomination: 1_000_000,
            wallet_path: None,
            beacon_broadcast: Vec::new(),
            tree_refresh: Some(Duration::from_secs(300)),
            relayer: RelayerConfig::default(),
            mix: MixConfig::default(),
        }
    }
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            fee: 0,
            rate_limit: RateLimitConfig {
                requests: 10,
                window: Duration::from_secs(60),
            },
            max_body: 1024 * 1024,
        }
    }
}

impl Default for MixConfig {
    fn default() -> Self {
        Self {
            deposit_min: Duration::from_secs(300),
            deposit_max: Duration::from_secs(900),
            withdraw_min: Duration::from_secs(600),
            withdraw_max: Duration::from_secs(1800),
            deadline: None,
        }
    }
}
