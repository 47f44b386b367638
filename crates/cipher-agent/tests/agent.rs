//! End-to-end agent scenarios against the in-memory chain.

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use cipher_agent::agent::Agent;
use cipher_agent::config::{AgentConfig, RateLimitConfig, RelayerConfig};
use cipher_agent::wallet::fresh_recipient;
use cipher_chain::{ChainClient, MockChain};
use cipher_core::field::fr_to_decimal;
use cipher_core::prover::StubProver;
use cipher_core::DepositCode;
use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const DENOM: u64 = 1_000_000;

fn test_config(dir: &Path) -> AgentConfig {
    AgentConfig {
        data_dir: dir.to_path_buf(),
        http_port: 0,
        dht_port: 0,
        beacon_port: 0,
        dev_mode: true,
        tree_refresh: None,
        relayer: RelayerConfig {
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            fee: 0,
            rate_limit: RateLimitConfig {
                requests: 10,
                window: Duration::from_secs(60),
            },
            max_body: 1024 * 1024,
        },
        ..AgentConfig::default()
    }
}

async fn make_agent(dir: &Path, chain: Arc<MockChain>) -> Agent {
    Agent::new(test_config(dir), chain, Arc::new(StubProver))
        .await
        .expect("agent init")
}

async fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn deposit_withdraw_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::with_balance(10 * DENOM));
    let agent = make_agent(dir.path(), Arc::clone(&chain)).await;
    agent.start().await.unwrap();

    let outcome = agent.deposit(DENOM).await.unwrap();
    let code = DepositCode::decode(&outcome.deposit_code).unwrap();
    assert_eq!(
        fr_to_decimal(&code.commitment().unwrap()),
        outcome.commitment,
        "returned commitment must equal Poseidon(nullifier, secret, amount)"
    );

    agent.tree_sync().load_tree(0).await.unwrap();
    assert_eq!(agent.store().leaf_count(0), Some(1));
    let path = agent.store().path(0, 0).unwrap();
    assert_eq!(path.fold(code.commitment().unwrap()), path.root);

    // no peers: the withdrawal self-services through our own queue
    let withdrawal = agent.withdraw(DENOM, &fresh_recipient()).await.unwrap();
    assert!(withdrawal.relayer.is_none());

    let records = agent.book().all().await.unwrap();
    assert!(records[0].withdrawn);
    assert_eq!(
        records[0].withdraw_ref.as_deref(),
        Some(withdrawal.reference.as_str())
    );

    let nullifier_hash = fr_to_decimal(&code.nullifier_hash().unwrap());
    let chain_probe = Arc::clone(&chain);
    wait_until(
        move || chain_probe.nullifier_published(&nullifier_hash),
        "queued withdrawal to reach the chain",
    )
    .await;
    let service = Arc::clone(agent.relayer_service());
    wait_until(
        move || service.status().queue_length == 0,
        "queue to drain",
    )
    .await;
    agent.stop();
}

#[tokio::test]
async fn withdraw_succeeds_after_restart_against_larger_tree() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::with_balance(10 * DENOM));

    let agent = make_agent(dir.path(), Arc::clone(&chain)).await;
    agent.deposit(DENOM).await.unwrap();
    drop(agent); // crash before any withdrawal

    // the pool grew while we were down
    chain.push_leaf(0, ark_bn254::Fr::from(777u64));
    chain.push_leaf(0, ark_bn254::Fr::from(778u64));

    let reborn = make_agent(dir.path(), Arc::clone(&chain)).await;
    let withdrawal = reborn.withdraw(DENOM, &fresh_recipient()).await.unwrap();
    assert!(!withdrawal.reference.is_empty());
    assert_eq!(reborn.store().leaf_count(0), Some(3));
    let records = reborn.book().all().await.unwrap();
    assert!(records[0].withdrawn);
}

async fn spawn_broken_relayer() -> SocketAddr {
    let app = Router::new()
        .route(
            "/relayer/status",
            get(|| async {
                Json(json!({"queueLength": 0, "processing": false, "fee": 0, "maxDelay": 1000}))
            }),
        )
        .route(
            "/relayer/submit",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "simulated outage"})),
                )
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn relayer_failure_rolls_the_premark_back() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::with_balance(10 * DENOM));
    let agent = make_agent(dir.path(), Arc::clone(&chain)).await;

    let outcome = agent.deposit(DENOM).await.unwrap();
    let code = DepositCode::decode(&outcome.deposit_code).unwrap();

    let relayer = spawn_broken_relayer().await;
    agent
        .peers()
        .record("127.0.0.1", relayer.port(), Vec::new())
        .unwrap();

    let err = agent.withdraw(DENOM, &fresh_recipient()).await.unwrap_err();
    assert!(err.to_string().contains("500"), "{err}");

    // rollback restored spendability and nothing reached the chain
    let record = agent
        .book()
        .find_unwithdrawn(Some(DENOM))
        .await
        .unwrap()
        .expect("deposit must be spendable again");
    assert!(!record.withdrawn);
    assert_eq!(record.withdraw_ref, None);
    let nullifier_hash = fr_to_decimal(&code.nullifier_hash().unwrap());
    assert!(!chain.nullifier_published(&nullifier_hash));
}

#[tokio::test]
async fn tree_syncs_from_peer_when_chain_reads_fail() {
    let leaves: Vec<ark_bn254::Fr> = (1..=3u64).map(ark_bn254::Fr::from).collect();

    // node a serves chunk 1 over http
    let dir_a = tempfile::tempdir().unwrap();
    let chain_a = Arc::new(MockChain::new());
    for leaf in &leaves {
        chain_a.push_leaf(1, *leaf);
    }
    let a = make_agent(dir_a.path(), Arc::clone(&chain_a)).await;
    a.start().await.unwrap();
    a.tree_sync().load_tree(1).await.unwrap();
    let root_a = a.store().root(1).unwrap();

    // node b can see counts but not leaf storage, so only the peer path works
    let dir_b = tempfile::tempdir().unwrap();
    let chain_b = Arc::new(MockChain::new());
    for leaf in &leaves {
        chain_b.push_leaf(1, *leaf);
    }
    chain_b.set_fail_fetch(true);
    let b = make_agent(dir_b.path(), Arc::clone(&chain_b)).await;
    b.peers()
        .record("127.0.0.1", a.http_port(), vec![1])
        .unwrap();

    b.tree_sync().load_tree(1).await.unwrap();
    assert_eq!(b.store().root(1), Some(root_a));
    assert_eq!(b.store().leaf_count(1), Some(3));
    a.stop();
}

fn submission_body() -> serde_json::Value {
    json!({
        "proof": {
            "pi_a": ["1", "2", "3"],
            "pi_b": [["1", "2"], ["3", "4"], ["5", "6"]],
            "pi_c": ["7", "8", "9"],
            "protocol": "groth16",
            "curve": "bn128",
        },
        "recipient": "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin",
        "amount": 1_000_000u64,
        "chunkId": 0,
    })
}

#[tokio::test]
async fn rate_limit_boundary_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::new());
    let mut config = test_config(dir.path());
    config.relayer.rate_limit = RateLimitConfig {
        requests: 3,
        window: Duration::from_millis(1000),
    };
    let agent = Agent::new(config, chain, Arc::new(StubProver))
        .await
        .unwrap();
    agent.start().await.unwrap();

    let url = format!("http://127.0.0.1:{}/relayer/submit", agent.http_port());
    let client = reqwest::Client::new();
    for _ in 0..3 {
        let response = client.post(&url).json(&submission_body()).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], json!(true));
        assert!(body["queueId"].is_string());
    }
    let response = client.post(&url).json(&submission_body()).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let response = client.post(&url).json(&submission_body()).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    agent.stop();
}

#[tokio::test]
async fn http_surface_serves_tree_peers_and_health() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::new());
    chain.push_leaf(0, ark_bn254::Fr::from(41u64));
    let agent = make_agent(dir.path(), Arc::clone(&chain)).await;
    agent.start().await.unwrap();
    agent.tree_sync().load_tree(0).await.unwrap();

    let base = format!("http://127.0.0.1:{}", agent.http_port());
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["port"], json!(agent.http_port()));
    assert_eq!(health["chunks"], json!([0]));

    let missing = client.get(format!("{base}/tree/99")).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(body["error"], "Tree not found");

    let tree: serde_json::Value = client
        .get(format!("{base}/tree/0"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tree["chunkId"], json!(0));
    assert_eq!(tree["leafCount"], json!(1));
    assert_eq!(
        tree["root"],
        json!(fr_to_decimal(&agent.store().root(0).unwrap()))
    );

    agent.peers().record("8.8.8.8", 8550, vec![3]).unwrap();
    let peers: serde_json::Value = client
        .get(format!("{base}/peers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(peers["count"], json!(1));
    assert_eq!(peers["peers"][0]["host"], "8.8.8.8");
    assert_eq!(peers["peers"][0]["trees"], json!([3]));
    agent.stop();
}

#[tokio::test]
async fn withdraw_without_matching_deposit_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(MockChain::with_balance(10 * DENOM));
    let agent = make_agent(dir.path(), chain).await;
    let err = agent.withdraw(DENOM, &fresh_recipient()).await.unwrap_err();
    assert!(matches!(err, cipher_core::Error::NotFound(_)));
}
