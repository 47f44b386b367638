//! Tree-sharing and relayer HTTP surface.
//!
//! `GET /tree/{chunk}`, `GET /peers`, `GET /health` serve replica state to
//! other agents; `POST /relayer/submit` and `GET /relayer/status` expose
//! the relayer. CORS is restricted to loopback origins.

use crate::peers::PeerBook;
use crate::relayer::RelayerService;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cipher_core::prover::Groth16Proof;
use cipher_merkle::TreeStore;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::debug;

pub struct AppState {
    pub store: Arc<TreeStore>,
    pub peers: Arc<PeerBook>,
    pub relayer: Arc<RelayerService>,
    /// Actual bound port, set once the listener exists.
    pub http_port: AtomicU16,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost"),
            HeaderValue::from_static("http://127.0.0.1"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    // the handler enforces the advertised cap with a JSON 413; this outer
    // limit only bounds what we are willing to buffer at all
    let hard_limit = state.relayer.max_body() + 1024;

    Router::new()
        .route("/tree/{chunk}", get(get_tree))
        .route("/peers", get(get_peers))
        .route("/health", get(get_health))
        .route("/relayer/submit", post(relayer_submit))
        .route("/relayer/status", get(relayer_status))
        .layer(cors)
        .layer(DefaultBodyLimit::max(hard_limit))
        .with_state(state)
}

async fn get_tree(State(state): State<Arc<AppState>>, Path(chunk): Path<u32>) -> Response {
    match state.store.snapshot(chunk) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Tree not found"})),
        )
            .into_response(),
    }
}

async fn get_peers(State(state): State<Arc<AppState>>) -> Response {
    let peers = state.peers.snapshot();
    Json(json!({"count": peers.len(), "peers": peers})).into_response()
}

async fn get_health(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "chunks": state.store.advertised_chunks(),
        "port": state.http_port.load(Ordering::Relaxed),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
    .into_response()
}

async fn relayer_status(State(state): State<Arc<AppState>>) -> Response {
    Json(state.relayer.status()).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub proof: Groth16Proof,
    pub recipient: String,
    pub amount: u64,
    pub chunk_id: u32,
}

/// Submission pipeline, checks strictly in order: body size, source rate
/// limit, structural validation, enqueue.
async fn relayer_submit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    if body.len() > state.relayer.max_body() {
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
    }
    if !state.relayer.admit(addr.ip()) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
    }
    let request: SubmitRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "relayer submission rejected: unparseable body");
            return error_response(StatusCode::BAD_REQUEST, "malformed request body");
        }
    };
    if let Err(reason) = validate_submission(&request) {
        debug!(reason, "relayer submission rejected");
        return error_response(StatusCode::BAD_REQUEST, reason);
    }

    let (queue_id, estimated) = state.relayer.enqueue(
        request.proof,
        request.recipient,
        request.amount,
        request.chunk_id,
    );
    Json(json!({
        "success": true,
        "queueId": queue_id,
        "estimatedExecutionTime": estimated,
    }))
    .into_response()
}

const MAX_AMOUNT: u64 = 1_000_000_000_000;
const MAX_CHUNK_ID: u32 = 1000;

fn validate_submission(request: &SubmitRequest) -> std::result::Result<(), &'static str> {
    if !request.proof.is_well_formed() {
        return Err("proof is not a groth16/bn128 proof");
    }
    if !(32..=44).contains(&request.recipient.len())
        || bs58::decode(&request.recipient).into_vec().is_err()
    {
        return Err("recipient is not a base58 address");
    }
    if request.amount == 0 || request.amount > MAX_AMOUNT {
        return Err("amount out of range");
    }
    if request.chunk_id > MAX_CHUNK_ID {
        return Err("chunk id out of range");
    }
    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
