//! Wire protocol: `u32-BE length | UTF-8 JSON` frames and the message
//! envelope `{type, id, tx_id?, data?}`.

use crate::peer::PeerContact;
use cipher_core::error::{Error, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames above this are treated as hostile and drop the connection.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "FIND_NODE")]
    FindNode,
    #[serde(rename = "NODES")]
    Nodes,
    #[serde(rename = "STORE")]
    Store,
    #[serde(rename = "STORED")]
    Stored,
    #[serde(rename = "FIND_VALUE")]
    FindValue,
    #[serde(rename = "VALUE")]
    Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender's node ID, hex.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageKind, id: String, tx_id: Option<String>, data: Value) -> Self {
        Self { kind, id, tx_id, data }
    }

    /// Reply envelope mirroring this request's transaction ID.
    pub fn reply(&self, kind: MessageKind, id: String, data: Value) -> Self {
        Self::new(kind, id, self.tx_id.clone(), data)
    }
}

/// 64-bit transaction token as hex.
pub fn new_tx_id() -> String {
    format!("{:016x}", OsRng.next_u64())
}

// request/response payloads carried in `data`

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeData {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesData {
    pub nodes: Vec<PeerContact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreData {
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindValueData {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueData {
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Read one frame. `Ok(None)` means clean EOF at a frame boundary; an
/// oversized or short frame is an error and the caller drops the stream.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Network(e.to_string())),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Capacity(format!("frame of {len} bytes")));
    }
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    Ok(Some(payload))
}

pub async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Capacity(format!("frame of {} bytes", payload.len())));
    }
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    Ok(())
}

pub async fn write_envelope<S: AsyncWrite + Unpin>(stream: &mut S, env: &Envelope) -> Result<()> {
    let payload = serde_json::to_vec(env).map_err(|e| Error::Network(e.to_string()))?;
    write_frame(stream, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let env = Envelope::new(
            MessageKind::Ping,
            "ab".repeat(32),
            Some(new_tx_id()),
            serde_json::json!({"port": 8549}),
        );
        let mut writer = std::io::Cursor::new(Vec::new());
        write_envelope(&mut writer, &env).await.unwrap();

        let mut cursor = std::io::Cursor::new(writer.into_inner());
        let frame = read_frame(&mut cursor).await.unwrap().unwrap();
        let parsed: Envelope = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed.kind, MessageKind::Ping);
        assert_eq!(parsed.tx_id, env.tx_id);
    }

    #[tokio::test]
    async fn eof_at_boundary_is_clean() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN + 1) as u32).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[test]
    fn wire_shape_matches_protocol() {
        let env = Envelope::new(
            MessageKind::FindNode,
            "00".repeat(32),
            Some("0011223344556677".into()),
            serde_json::to_value(FindNodeData {
                target: "ff".repeat(32),
                port: None,
            })
            .unwrap(),
        );
        let json: Value = serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(json["type"], "FIND_NODE");
        assert!(json["data"]["target"].is_string());
        assert!(json.get("data").unwrap().get("port").is_none());
    }

    #[test]
    fn tx_ids_are_64_bit_hex() {
        let tx = new_tx_id();
        assert_eq!(tx.len(), 16);
        assert!(tx.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
