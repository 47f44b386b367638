//! Peer records and endpoint validation.

use crate::id::NodeId;
use cipher_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Instant;

/// A live routing-table entry.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub last_seen: Instant,
}

impl Peer {
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            last_seen: Instant::now(),
        }
    }

    pub fn contact(&self) -> PeerContact {
        PeerContact {
            id: self.id.to_hex(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// The /24 prefix used for the subnet cap, when the host is an IPv4
    /// literal.
    pub fn subnet(&self) -> Option<String> {
        let ip: Ipv4Addr = self.host.parse().ok()?;
        let [a, b, c, _] = ip.octets();
        Some(format!("{a}.{b}.{c}"))
    }
}

/// Wire shape of a peer inside `NODES` responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerContact {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl PeerContact {
    pub fn into_peer(self, allow_private: bool) -> Result<Peer> {
        validate_endpoint(&self.host, self.port, allow_private)?;
        Ok(Peer::new(NodeId::from_hex(&self.id)?, self.host, self.port))
    }
}

/// Host/port validity shared by the DHT and the HTTP peer book.
///
/// Hosts are domain names or IPv4 dotted-quads. In production mode the
/// RFC-1918 ranges are rejected; loopback stays allowed so a node can always
/// talk to itself.
pub fn validate_endpoint(host: &str, port: u16, allow_private: bool) -> Result<()> {
    if !(1024..=65535).contains(&port) {
        return Err(Error::BadInput(format!("port {port} outside 1024..65535")));
    }
    if host.is_empty() {
        return Err(Error::BadInput("empty host".into()));
    }
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        if !allow_private && is_private_ipv4(&ip) {
            return Err(Error::BadInput(format!("private address {ip} rejected")));
        }
        return Ok(());
    }
    if !is_hostname(host) {
        return Err(Error::BadInput(format!("invalid host {host:?}")));
    }
    Ok(())
}

fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
}

fn is_hostname(host: &str) -> bool {
    if host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_public_and_loopback() {
        assert!(validate_endpoint("8.8.8.8", 8549, false).is_ok());
        assert!(validate_endpoint("127.0.0.1", 8549, false).is_ok());
        assert!(validate_endpoint("relay.example.org", 8549, false).is_ok());
    }

    #[test]
    fn rejects_private_ranges_in_production() {
        for host in ["10.0.0.1", "172.16.0.1", "172.31.255.255", "192.168.1.1"] {
            assert!(validate_endpoint(host, 8549, false).is_err(), "{host}");
            assert!(validate_endpoint(host, 8549, true).is_ok(), "{host} (dev)");
        }
        // 172.32/12 is outside the private block
        assert!(validate_endpoint("172.32.0.1", 8549, false).is_ok());
    }

    #[test]
    fn rejects_bad_ports() {
        assert!(validate_endpoint("8.8.8.8", 0, false).is_err());
        assert!(validate_endpoint("8.8.8.8", 1023, false).is_err());
        assert!(validate_endpoint("8.8.8.8", 1024, false).is_ok());
    }

    #[test]
    fn rejects_bad_hosts() {
        assert!(validate_endpoint("", 8549, false).is_err());
        assert!(validate_endpoint("bad host", 8549, false).is_err());
        assert!(validate_endpoint("-leading.example", 8549, false).is_err());
        assert!(validate_endpoint("under_score.example", 8549, false).is_err());
    }

    #[test]
    fn subnet_prefix() {
        let peer = Peer::new(NodeId::random(), "1.2.3.4", 8549);
        assert_eq!(peer.subnet().as_deref(), Some("1.2.3"));
        let named = Peer::new(NodeId::random(), "relay.example.org", 8549);
        assert_eq!(named.subnet(), None);
    }
}
