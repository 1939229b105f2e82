//! braid transport layer.
//!
//! Turns an opaque duplex channel (TCP, or an in-memory pair in tests) into
//! reliable per-peer connections: an ordered outbound queue with bounded
//! retries, high/low watermark backpressure, ping/pong liveness with RTT
//! measurement, and an [`Endpoint`] that owns every connection of a process
//! and hands inbound payloads to the protocol layer.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use braid_transport::{Endpoint, EndpointConfig, NodeId, PeerAddress, PeerInfo, PeerKind};
//!
//! # async fn example() -> Result<(), braid_transport::TransportError> {
//! let local = PeerInfo::new(NodeId::new("node-1"), PeerKind::Node);
//! let bind = PeerAddress::new("127.0.0.1:7700");
//! let (endpoint, mut events) = Endpoint::bind_tcp(local, &bind, EndpointConfig::new()).await?;
//!
//! let peer = endpoint.connect(&PeerAddress::new("127.0.0.1:7701")).await?;
//! endpoint.send(&peer, bytes::Bytes::from_static(b"hello")).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod endpoint;
mod error;
mod frame;
mod queue;

pub mod channel;
pub mod tcp;

pub use config::{ChannelTuning, EndpointConfig};
pub use endpoint::{Endpoint, EndpointEvent};
pub use error::TransportError;
pub use frame::{Frame, Handshake, MAX_FRAME_SIZE};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// braid network identity — an operator-assigned name, unique per network.
///
/// Cheap to clone; displayed and parsed as the bare string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl FromStr for NodeId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TransportError::InvalidNodeId(s.to_string()));
        }
        Ok(Self::new(s))
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A dialable address, `host:port` for the TCP transport, free-form for the
/// in-memory one.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(Arc<str>);

impl PeerAddress {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(Arc::from(address.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        Ok(Self::new(s))
    }
}

impl serde::Serialize for PeerAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What a peer is in the overlay. Exchanged during the handshake; the tracker
/// uses it to tell data nodes, storage nodes and other trackers apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PeerKind {
    Node,
    Storage,
    Tracker,
}

impl PeerKind {
    /// Storage nodes are regular nodes that also serve historical data.
    pub fn is_storage(&self) -> bool {
        matches!(self, PeerKind::Storage)
    }
}

/// Identity announced during the handshake: who we are, what we are, and the
/// address other peers can dial us back on (absent for nodes that do not
/// accept inbound connections).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub kind: PeerKind,
    pub address: Option<PeerAddress>,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, kind: PeerKind) -> Self {
        Self {
            node_id,
            kind,
            address: None,
        }
    }

    pub fn with_address(mut self, address: PeerAddress) -> Self {
        self.address = Some(address);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrips_as_string() {
        let id = NodeId::new("node-1");
        assert_eq!(id.to_string(), "node-1");
        assert_eq!("node-1".parse::<NodeId>().unwrap(), id);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"node-1\"");
    }

    #[test]
    fn empty_node_id_is_rejected() {
        assert!("".parse::<NodeId>().is_err());
    }

    #[test]
    fn peer_info_builder() {
        let info = PeerInfo::new(NodeId::new("s1"), PeerKind::Storage)
            .with_address(PeerAddress::new("127.0.0.1:9000"));
        assert!(info.kind.is_storage());
        assert_eq!(info.address.unwrap().as_str(), "127.0.0.1:9000");
    }
}
