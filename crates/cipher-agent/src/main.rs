//! cipher-agent - privacy mixer agent for a fixed-denomination pool
//!
//! Every agent is simultaneously a shielded-pool client, a commitment-tree
//! replica, a Kademlia participant and a delayed relayer for other agents.

use anyhow::{Context, Result};
use cipher_agent::agent::Agent;
use cipher_agent::config::AgentConfig;
use cipher_agent::sidecar::HttpProver;
use cipher_chain::{ChainClient, MockChain, RpcChain};
use cipher_core::prover::{Prover, StubProver};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cipher-agent")]
#[command(about = "Peer-to-peer privacy mixer agent")]
#[command(version)]
struct Cli {
    /// State directory (default: ~/.cipher-agent)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Pool gateway JSON-RPC endpoint
    #[arg(long, default_value = "http://127.0.0.1:8899")]
    rpc_url: String,

    /// Prover sidecar endpoint (in-process stub when omitted)
    #[arg(long)]
    prover_url: Option<String>,

    /// Tree-sharing / relayer HTTP port
    #[arg(long, default_value = "8550")]
    http_port: u16,

    /// Kademlia DHT port
    #[arg(long, default_value = "8549")]
    dht_port: u16,

    /// LAN beacon UDP port
    #[arg(long, default_value = "8548")]
    beacon_port: u16,

    /// Seed peers, host:port, repeatable
    #[arg(long = "bootstrap")]
    bootstrap: Vec<String>,

    /// Public host to advertise to the network
    #[arg(long)]
    public_host: Option<String>,

    /// Wallet key file instead of <data-dir>/agent-wallet.json
    #[arg(long)]
    wallet: Option<PathBuf>,

    /// Accept RFC-1918 peers (local testnets)
    #[arg(long)]
    dev: bool,

    /// Run against an in-memory chain instead of the gateway
    #[arg(long)]
    offline: bool,

    /// Log secret material (deposit codes) at debug level
    #[arg(long)]
    debug_secrets: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Run the agent with the auto-mix loop
    Run {
        /// Stop mixing after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Serve tree and relayer traffic but never mix our own funds
        #[arg(long)]
        serve_only: bool,
    },

    /// Make a single deposit
    Deposit {
        /// Amount in base units
        #[arg(short, long, default_value = "1000000")]
        amount: u64,
    },

    /// Withdraw one pending deposit
    Withdraw {
        /// Amount in base units
        #[arg(short, long, default_value = "1000000")]
        amount: u64,

        /// Recipient address; a fresh key when omitted
        #[arg(short, long)]
        recipient: Option<String>,
    },

    /// Show deposit book and peer summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("cipher_agent=info".parse().expect("static directive"))
                .add_directive("cipher_dht=info".parse().expect("static directive")),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let chain: Arc<dyn ChainClient> = if cli.offline {
        tracing::warn!("running against an in-memory chain");
        Arc::new(MockChain::with_balance(u64::MAX / 2))
    } else {
        Arc::new(RpcChain::new(&config.rpc_url))
    };
    let prover: Arc<dyn Prover> = match &config.prover_url {
        Some(url) => Arc::new(HttpProver::new(url)),
        None => Arc::new(StubProver),
    };

    let agent = Agent::new(config, chain, prover)
        .await
        .context("agent initialization failed")?;

    match cli.command {
        Command::Run { serve_only, .. } => {
            agent.start().await.context("agent start failed")?;
            if serve_only {
                tokio::signal::ctrl_c().await?;
            } else {
                let mixing = agent.run_auto_mix();
                tokio::select! {
                    _ = mixing => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            agent.stop();
        }
        Command::Deposit { amount } => {
            let outcome = agent.deposit(amount).await?;
            println!("tx:         {}", outcome.tx_id);
            println!("commitment: {}", outcome.commitment);
            println!("code:       {}", outcome.deposit_code);
        }
        Command::Withdraw { amount, recipient } => {
            agent.start().await.context("agent start failed")?;
            let recipient =
                recipient.unwrap_or_else(cipher_agent::wallet::fresh_recipient);
            let outcome = agent.withdraw(amount, &recipient).await?;
            match outcome.relayer {
                Some(relayer) => println!("queued at {relayer} as {}", outcome.reference),
                None => println!("queued locally as {}", outcome.reference),
            }
            agent.stop();
        }
        Command::Status => {
            let records = agent.book().all().await?;
            let pending = records.iter().filter(|r| !r.withdrawn).count();
            println!("address:   {}", agent.wallet().address());
            println!("deposits:  {} ({} pending)", records.len(), pending);
            println!("chunks:    {:?}", agent.store().advertised_chunks());
            println!("peers:     {}", agent.peers().len());
        }
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = AgentConfig {
        http_port: cli.http_port,
        dht_port: cli.dht_port,
        beacon_port: cli.beacon_port,
        rpc_url: cli.rpc_url.clone(),
        prover_url: cli.prover_url.clone(),
        public_host: cli.public_host.clone(),
        dev_mode: cli.dev,
        debug_secrets: cli.debug_secrets,
        wallet_path: cli.wallet.clone(),
        ..AgentConfig::default()
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    for seed in &cli.bootstrap {
        let (host, port) = seed
            .rsplit_once(':')
            .with_context(|| format!("bootstrap peer {seed:?} is not host:port"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("bootstrap peer {seed:?} has a bad port"))?;
        config.bootstrap.push((host.to_string(), port));
    }
    if let Command::Run {
        duration: Some(seconds),
        ..
    } = &cli.command
    {
        config.mix.deadline = Some(Duration::from_secs(*seconds));
    }
    Ok(config)
}
