//! Wire messages exchanged between nodes and trackers.
//!
//! Everything on the wire is one [`WireMessage`] encoded with MessagePack
//! inside a transport frame. Peers dispatch on the variant and on the kind
//! of peer the frame arrived from; unexpected variants are logged and
//! dropped, never an error.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use braid_transport::{NodeId, PeerAddress};

use crate::error::NetworkError;
use crate::identifiers::{MessageId, MessageRef, StreamPartition};

/// A published message travelling through the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Unique identity: stream, chain position and chain.
    pub id: MessageId,
    /// Position of the previous message in the same chain, if any.
    pub previous_ref: Option<MessageRef>,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}

impl StreamMessage {
    pub fn new(id: MessageId, previous_ref: Option<MessageRef>, payload: Vec<u8>) -> Self {
        Self {
            id,
            previous_ref,
            payload,
        }
    }
}

/// What historical span a resend request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResendKind {
    /// The newest `count` messages of the stream partition.
    Last { count: u64 },
    /// Everything from `from` onwards, optionally narrowed to one chain.
    From {
        from: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
    /// Everything between `from` and `to` inclusive, optionally narrowed.
    Range {
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
}

/// A request for historical messages, answered by [`ResendResponse`]s and
/// unicasts carrying the same `request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendRequest {
    pub request_id: String,
    pub stream: StreamPartition,
    pub kind: ResendKind,
}

impl ResendRequest {
    /// New request with a fresh random id.
    pub fn new(stream: StreamPartition, kind: ResendKind) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            stream,
            kind,
        }
    }
}

/// Control responses bracketing a resend answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResendResponse {
    /// Historical data exists and unicasts are about to flow.
    Resending {
        request_id: String,
        stream: StreamPartition,
    },
    /// All historical data for the request has been sent.
    Resent {
        request_id: String,
        stream: StreamPartition,
    },
    /// No historical data is available for the request.
    NoResend {
        request_id: String,
        stream: StreamPartition,
    },
}

impl ResendResponse {
    pub fn request_id(&self) -> &str {
        match self {
            ResendResponse::Resending { request_id, .. }
            | ResendResponse::Resent { request_id, .. }
            | ResendResponse::NoResend { request_id, .. } => request_id,
        }
    }
}

/// Per-stream neighbor report inside a [`Status`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub inbound_nodes: Vec<NodeId>,
    pub outbound_nodes: Vec<NodeId>,
    /// Counter of the last topology instruction applied for this stream.
    pub counter: u64,
}

/// Full self-report a node sends to its trackers.
///
/// Always the complete current state, never a delta. The tracker replaces
/// whatever it previously knew about the sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Neighbor sets per subscribed stream partition.
    pub streams: BTreeMap<StreamPartition, StreamStatus>,
    /// Smoothed round-trip times to connected peers, in milliseconds.
    pub rtts: BTreeMap<NodeId, u64>,
    /// Free-form physical location, if the operator configured one.
    pub location: Option<String>,
    /// When the node started, milliseconds since the Unix epoch.
    pub started: u64,
}

/// A topology assignment from tracker to node: the complete neighbor set
/// the node should converge to for one stream partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub stream: StreamPartition,
    pub node_ids: Vec<NodeId>,
    /// Monotonic per (node, stream); stale instructions are discarded.
    pub counter: u64,
}

/// Failure kinds a tracker reports back to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorResponseKind {
    UnknownPeer,
}

/// Explicit error envelope, e.g. for a failed address lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorResponseKind,
    /// What the error refers to, e.g. the peer that could not be resolved.
    pub target: NodeId,
}

/// Every message that can cross the wire between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    // ── node ⇄ node ─────────────────────────────────────────────────────
    /// Real-time propagation of a stream message.
    Broadcast(StreamMessage),
    /// Historical message addressed to one requester.
    Unicast {
        request_id: String,
        message: StreamMessage,
    },
    ResendRequest(ResendRequest),
    ResendResponse(ResendResponse),

    // ── node → tracker ──────────────────────────────────────────────────
    Status(Box<Status>),
    StorageNodesRequest { stream: StreamPartition },
    NodeAddressRequest { node: NodeId },

    // ── tracker → node ──────────────────────────────────────────────────
    Instruction(Instruction),
    StorageNodesResponse {
        stream: StreamPartition,
        node_ids: Vec<NodeId>,
    },
    NodeAddressResponse {
        node: NodeId,
        address: PeerAddress,
    },
    ErrorResponse(ErrorResponse),
}

impl WireMessage {
    /// Encode for the transport layer.
    pub fn to_bytes(&self) -> Result<Bytes, NetworkError> {
        rmp_serde::to_vec(self)
            .map(Bytes::from)
            .map_err(Into::into)
    }

    /// Decode a received frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, NetworkError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}
