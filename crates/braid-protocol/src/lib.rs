//! Braid protocol layer.
//!
//! Implements message propagation, overlay topology coordination, and
//! historical-data relaying on top of `braid-transport` (framed TCP or
//! in-memory channels).
//!
//! Wire format: MessagePack (compact binary).
//! Roles: network nodes propagate stream data; trackers steer the overlay.

pub mod buffer;
pub mod dedup;
pub mod error;
pub mod identifiers;
pub mod messages;
pub mod node;
pub mod resend;
pub mod storage;
pub mod streams;
pub mod throttler;
pub mod topology;
pub mod tracker;

pub use buffer::{MessageBuffer, SeenButNotPropagated};
pub use dedup::DuplicateMessageDetector;
pub use error::NetworkError;
pub use identifiers::{ChainKey, MessageId, MessageRef, NodeId, StreamPartition};
pub use messages::{
    ErrorResponse, ErrorResponseKind, Instruction, ResendKind, ResendRequest, ResendResponse,
    Status, StreamMessage, StreamStatus, WireMessage,
};
pub use node::{Node, NodeChannels, NodeCommand, NodeConfig, NodeEvent, NodeHandle};
pub use resend::{
    AskNeighborsStrategy, LocalResendStrategy, RelayedResendEvent, ResendHandler, ResendRelay,
    ResendStrategy, StorageNodeStrategy,
};
pub use storage::{MemoryStorage, Storage};
pub use streams::{StreamManager, StreamState};
pub use throttler::InstructionThrottler;
pub use topology::{
    FixedRandomness, InstructionCounter, OverlayTopology, Randomness, StdRandomness,
    TopologyInstruction,
};
pub use tracker::{
    Tracker, TrackerChannels, TrackerCommand, TrackerConfig, TrackerEvent, TrackerHandle,
    TrackerState,
};
