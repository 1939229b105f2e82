use braid_transport::{NodeId, TransportError};

use crate::identifiers::MessageRef;

/// Errors surfaced by the protocol layer.
///
/// Recoverable conditions only. A message referencing a stream that was
/// never set up indicates a logic bug in the caller and panics instead of
/// appearing here.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A message's previous reference does not precede the message itself.
    #[error("invalid numbering: previous reference {previous} is not before {current}")]
    InvalidNumbering {
        previous: MessageRef,
        current: MessageRef,
    },

    /// A message's previous reference points outside the retained window.
    #[error("gap mismatch: previous reference {previous} not in window (latest seen {latest})")]
    GapMismatch {
        previous: MessageRef,
        latest: MessageRef,
    },

    /// A connection attempt did not complete within the configured timeout.
    #[error("connection attempt to {node} timed out")]
    ConnectionTimeout { node: NodeId },

    /// A dial towards a peer failed outright.
    #[error("dial to {node} failed: {reason}")]
    DialFailed { node: NodeId, reason: String },

    /// The peer is not known to the tracker or not connected.
    #[error("unknown peer: {node}")]
    UnknownPeer { node: NodeId },

    #[error("invalid stream key: {0:?}")]
    InvalidStreamKey(String),

    /// A resend was cancelled before it completed.
    #[error("resend {request_id} cancelled")]
    ResendCancelled { request_id: String },

    /// A relayed resend stopped producing events before completing.
    #[error("resend via {peer} stalled")]
    ResendStalled { peer: NodeId },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Encode(String),

    #[error("deserialization error: {0}")]
    Decode(String),

    /// The runtime the request was sent to has shut down.
    #[error("runtime has shut down")]
    Shutdown,
}

impl From<rmp_serde::encode::Error> for NetworkError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        NetworkError::Encode(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for NetworkError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        NetworkError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_invalid_numbering() {
        let err = NetworkError::InvalidNumbering {
            previous: MessageRef::new(10, 1),
            current: MessageRef::new(10, 1),
        };
        assert_eq!(
            err.to_string(),
            "invalid numbering: previous reference 10:1 is not before 10:1"
        );
    }

    #[test]
    fn test_display_gap_mismatch() {
        let err = NetworkError::GapMismatch {
            previous: MessageRef::new(5, 0),
            latest: MessageRef::new(90, 2),
        };
        assert_eq!(
            err.to_string(),
            "gap mismatch: previous reference 5:0 not in window (latest seen 90:2)"
        );
    }

    #[test]
    fn test_display_connection_timeout() {
        let err = NetworkError::ConnectionTimeout {
            node: NodeId::new("node-7"),
        };
        assert_eq!(err.to_string(), "connection attempt to node-7 timed out");
    }

    #[test]
    fn test_display_unknown_peer() {
        let err = NetworkError::UnknownPeer {
            node: NodeId::new("ghost"),
        };
        assert_eq!(err.to_string(), "unknown peer: ghost");
    }

    #[test]
    fn test_display_resend_stalled() {
        let err = NetworkError::ResendStalled {
            peer: NodeId::new("slow"),
        };
        assert_eq!(err.to_string(), "resend via slow stalled");
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err: NetworkError = TransportError::Shutdown.into();
        assert_eq!(err.to_string(), TransportError::Shutdown.to_string());
    }

    #[test]
    fn test_decode_error_converts() {
        let err: NetworkError =
            rmp_serde::from_slice::<String>(&[0xc1]).unwrap_err().into();
        assert!(matches!(err, NetworkError::Decode(_)));
    }
}
