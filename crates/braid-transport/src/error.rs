use crate::{NodeId, PeerAddress};

/// Errors returned by the braid transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: PeerAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {address} failed: {reason}")]
    Connect { address: PeerAddress, reason: String },

    #[error("connection attempt to {address} timed out")]
    ConnectTimeout { address: PeerAddress },

    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: PeerAddress, reason: String },

    #[error("send to {peer} failed after {tries} attempts")]
    SendFailed { peer: NodeId, tries: u32 },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("peer {0} is not connected")]
    NotConnected(NodeId),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("invalid node id: {0:?}")]
    InvalidNodeId(String),

    #[error("invalid peer address: {0:?}")]
    InvalidAddress(String),

    #[error("endpoint is shut down")]
    Shutdown,
}

impl From<rmp_serde::encode::Error> for TransportError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TransportError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TransportError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TransportError::Decode(e.to_string())
    }
}
