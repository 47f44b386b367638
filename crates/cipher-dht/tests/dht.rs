//! Multi-node DHT tests over loopback sockets.

use cipher_dht::node::DhtNode;
use cipher_dht::protocol::{
    new_tx_id, read_frame, write_envelope, write_frame, Envelope, MessageKind, PingData,
};
use cipher_dht::NodeId;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

async fn spawn_node() -> (Arc<DhtNode>, SocketAddr) {
    let node = DhtNode::new(NodeId::random(), true);
    let addr = node
        .serve("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind loopback");
    (node, addr)
}

#[tokio::test]
async fn ping_populates_both_tables() {
    let (a, _) = spawn_node().await;
    let (b, b_addr) = spawn_node().await;

    let responder = a.ping("127.0.0.1", b_addr.port()).await.unwrap();
    assert_eq!(responder, b.id());
    // a learned b from the PONG, b learned a from the inbound PING
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);
}

#[tokio::test]
async fn bootstrap_reaches_second_hop() {
    let (a, _a_addr) = spawn_node().await;
    let (b, b_addr) = spawn_node().await;
    let (c, _c_addr) = spawn_node().await;

    c.bootstrap("127.0.0.1", b_addr.port()).await.unwrap();
    a.bootstrap("127.0.0.1", b_addr.port()).await.unwrap();

    let found = a.lookup(c.id()).await;
    assert!(
        found.iter().any(|p| p.id == c.id()),
        "lookup should surface a peer known only to the seed"
    );
}

#[tokio::test]
async fn lookup_result_is_monotonically_improving() {
    let (a, _) = spawn_node().await;
    let (b, b_addr) = spawn_node().await;
    let mut tail = Vec::new();
    for _ in 0..4 {
        let (n, _) = spawn_node().await;
        n.bootstrap("127.0.0.1", b_addr.port()).await.unwrap();
        tail.push(n);
    }
    a.bootstrap("127.0.0.1", b_addr.port()).await.unwrap();

    let target = NodeId::random();
    let seed_best = a
        .closest_known(&target, cipher_dht::K)
        .first()
        .map(|p| p.id.distance(&target));
    let result = a.lookup(target).await;
    assert!(!result.is_empty());
    let result_best = result[0].id.distance(&target);
    if let Some(seed_best) = seed_best {
        assert!(result_best <= seed_best);
    }
    for pair in result.windows(2) {
        assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
    }
}

#[tokio::test]
async fn isolated_announce_serves_own_record() {
    let (a, _) = spawn_node().await;
    assert!(a.find_agents().await.is_empty());

    let stored_remotely = a.announce(8550, None).await;
    assert_eq!(stored_remotely, 0);

    let agents = a.find_agents().await;
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0]["node_id"], Value::String(a.id().to_hex()));
    assert_eq!(agents[0]["http_port"], 8550);
}

#[tokio::test]
async fn two_nodes_discover_each_other() {
    let (a, a_addr) = spawn_node().await;
    let (b, _) = spawn_node().await;

    a.announce(8550, None).await;
    b.bootstrap("127.0.0.1", a_addr.port()).await.unwrap();
    assert!(b.announce(8551, None).await >= 1);
    a.announce(8550, None).await;

    let from_a = a.find_agents().await;
    let from_b = b.find_agents().await;
    for agents in [&from_a, &from_b] {
        let ids: Vec<_> = agents.iter().map(|r| r["node_id"].clone()).collect();
        assert!(ids.contains(&Value::String(a.id().to_hex())), "{ids:?}");
        assert!(ids.contains(&Value::String(b.id().to_hex())), "{ids:?}");
    }
    // the record b pushed to a was augmented with b's observed host
    let b_record = from_a
        .iter()
        .find(|r| r["node_id"] == Value::String(b.id().to_hex()))
        .unwrap();
    assert_eq!(b_record["host"], Value::String("127.0.0.1".into()));
}

#[tokio::test]
async fn malformed_frames_are_silently_discarded() {
    let (a, a_addr) = spawn_node().await;
    let mut stream = TcpStream::connect(a_addr).await.unwrap();

    // garbage first: the connection must survive it
    write_frame(&mut stream, b"this is not json").await.unwrap();

    let tx_id = new_tx_id();
    let ping = Envelope::new(
        MessageKind::Ping,
        NodeId::random().to_hex(),
        Some(tx_id.clone()),
        serde_json::to_value(PingData { port: Some(9001) }).unwrap(),
    );
    write_envelope(&mut stream, &ping).await.unwrap();

    let frame = read_frame(&mut stream).await.unwrap().unwrap();
    let reply: Envelope = serde_json::from_slice(&frame).unwrap();
    assert_eq!(reply.kind, MessageKind::Pong);
    assert_eq!(reply.tx_id, Some(tx_id));
    assert_eq!(reply.id, a.id().to_hex());
}

#[tokio::test]
async fn find_value_without_records_returns_nodes() {
    let (_a, a_addr) = spawn_node().await;
    let mut stream = TcpStream::connect(a_addr).await.unwrap();

    let env = Envelope::new(
        MessageKind::FindValue,
        NodeId::random().to_hex(),
        Some(new_tx_id()),
        serde_json::json!({"key": "some-unknown-key"}),
    );
    write_envelope(&mut stream, &env).await.unwrap();

    let frame = read_frame(&mut stream).await.unwrap().unwrap();
    let reply: Envelope = serde_json::from_slice(&frame).unwrap();
    assert_eq!(reply.kind, MessageKind::Nodes);
    assert!(reply.data["nodes"].is_array());
}
