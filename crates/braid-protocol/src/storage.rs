//! Historical message storage.
//!
//! Storage nodes answer resend requests from a [`Storage`] backend. The
//! in-memory implementation keeps messages ordered by chain position and
//! is what the test networks and the bundled storage role run on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::NetworkError;
use crate::identifiers::{MessageRef, StreamPartition};
use crate::messages::{ResendKind, StreamMessage};

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// The newest `count` messages of the stream, oldest first.
    async fn request_last(
        &self,
        stream: &StreamPartition,
        count: u64,
    ) -> Result<Vec<StreamMessage>, NetworkError>;

    /// Messages at or after `from`, optionally narrowed to one chain.
    async fn request_from(
        &self,
        stream: &StreamPartition,
        from: MessageRef,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> Result<Vec<StreamMessage>, NetworkError>;

    /// Messages between `from` and `to` inclusive, optionally narrowed.
    async fn request_range(
        &self,
        stream: &StreamPartition,
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> Result<Vec<StreamMessage>, NetworkError>;

    /// Persist one message. Storing the same identity twice is a no-op.
    async fn store(&self, message: StreamMessage) -> Result<(), NetworkError>;

    /// Dispatch a resend request to the matching query.
    async fn request(
        &self,
        stream: &StreamPartition,
        kind: &ResendKind,
    ) -> Result<Vec<StreamMessage>, NetworkError> {
        match kind {
            ResendKind::Last { count } => self.request_last(stream, *count).await,
            ResendKind::From {
                from,
                publisher_id,
                msg_chain_id,
            } => {
                self.request_from(stream, *from, publisher_id.as_deref(), msg_chain_id.as_deref())
                    .await
            }
            ResendKind::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            } => {
                self.request_range(
                    stream,
                    *from,
                    *to,
                    publisher_id.as_deref(),
                    msg_chain_id.as_deref(),
                )
                .await
            }
        }
    }
}

/// Sort key: chain position first so scans run in chronological order.
type ChronoKey = (u64, u64, String, String);

fn chrono_key(message: &StreamMessage) -> ChronoKey {
    (
        message.id.timestamp,
        message.id.sequence_number,
        message.id.publisher_id.clone(),
        message.id.msg_chain_id.clone(),
    )
}

fn chain_matches(
    message: &StreamMessage,
    publisher_id: Option<&str>,
    msg_chain_id: Option<&str>,
) -> bool {
    publisher_id.is_none_or(|p| message.id.publisher_id == p)
        && msg_chain_id.is_none_or(|c| message.id.msg_chain_id == c)
}

/// Volatile storage backend ordered by `(timestamp, sequence)`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    streams: Mutex<HashMap<StreamPartition, BTreeMap<ChronoKey, StreamMessage>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages held for a stream.
    pub fn count(&self, stream: &StreamPartition) -> usize {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.get(stream).map_or(0, |messages| messages.len())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn request_last(
        &self,
        stream: &StreamPartition,
        count: u64,
    ) -> Result<Vec<StreamMessage>, NetworkError> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(messages) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let mut newest: Vec<StreamMessage> = messages
            .values()
            .rev()
            .take(count as usize)
            .cloned()
            .collect();
        newest.reverse();
        Ok(newest)
    }

    async fn request_from(
        &self,
        stream: &StreamPartition,
        from: MessageRef,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> Result<Vec<StreamMessage>, NetworkError> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(messages) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .values()
            .filter(|message| message.id.reference() >= from)
            .filter(|message| chain_matches(message, publisher_id, msg_chain_id))
            .cloned()
            .collect())
    }

    async fn request_range(
        &self,
        stream: &StreamPartition,
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<&str>,
        msg_chain_id: Option<&str>,
    ) -> Result<Vec<StreamMessage>, NetworkError> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let Some(messages) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .values()
            .filter(|message| {
                let reference = message.id.reference();
                reference >= from && reference <= to
            })
            .filter(|message| chain_matches(message, publisher_id, msg_chain_id))
            .cloned()
            .collect())
    }

    async fn store(&self, message: StreamMessage) -> Result<(), NetworkError> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .entry(message.id.stream.clone())
            .or_default()
            .insert(chrono_key(&message), message);
        Ok(())
    }
}
