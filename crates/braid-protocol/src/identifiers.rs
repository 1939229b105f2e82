use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use braid_transport::NodeId;

use crate::error::NetworkError;

/// A stream partition — the unit of subscription, topology and propagation.
///
/// Every overlay topology, neighbor set and resend request is scoped to one
/// of these. The canonical string form is `"<stream_id>::<partition>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamPartition {
    stream_id: String,
    partition: u32,
}

impl StreamPartition {
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Canonical map key, `"<stream_id>::<partition>"`.
    pub fn key(&self) -> String {
        format!("{}::{}", self.stream_id, self.partition)
    }
}

impl fmt::Display for StreamPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.stream_id, self.partition)
    }
}

impl FromStr for StreamPartition {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream_id, partition) = s
            .rsplit_once("::")
            .ok_or_else(|| NetworkError::InvalidStreamKey(s.to_owned()))?;
        if stream_id.is_empty() {
            return Err(NetworkError::InvalidStreamKey(s.to_owned()));
        }
        let partition = partition
            .parse::<u32>()
            .map_err(|_| NetworkError::InvalidStreamKey(s.to_owned()))?;
        Ok(Self::new(stream_id, partition))
    }
}

/// Position of a message within a publisher's chain: `(timestamp, sequence)`.
///
/// Ordering is lexicographic, timestamp first. Multiple messages sharing a
/// timestamp are disambiguated by the sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MessageRef {
    pub timestamp: u64,
    pub sequence_number: u64,
}

impl MessageRef {
    pub fn new(timestamp: u64, sequence_number: u64) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.sequence_number)
    }
}

/// Globally unique identity of a stream message.
///
/// Two messages are the same message exactly when all five components match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub stream: StreamPartition,
    pub timestamp: u64,
    pub sequence_number: u64,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

impl MessageId {
    pub fn new(
        stream: StreamPartition,
        timestamp: u64,
        sequence_number: u64,
        publisher_id: impl Into<String>,
        msg_chain_id: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            timestamp,
            sequence_number,
            publisher_id: publisher_id.into(),
            msg_chain_id: msg_chain_id.into(),
        }
    }

    /// The chain position of this message.
    pub fn reference(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_number)
    }

    /// The chain this message belongs to, as a dedup map key.
    pub fn chain_key(&self) -> ChainKey {
        ChainKey {
            stream: self.stream.clone(),
            publisher_id: self.publisher_id.clone(),
            msg_chain_id: self.msg_chain_id.clone(),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.stream,
            self.publisher_id,
            self.msg_chain_id,
            self.reference()
        )
    }
}

/// Identifies one publisher chain within a stream partition.
///
/// Duplicate detection runs independently per chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainKey {
    pub stream: StreamPartition,
    pub publisher_id: String,
    pub msg_chain_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_partition_key_roundtrip() {
        let sp = StreamPartition::new("stream-1", 3);
        assert_eq!(sp.key(), "stream-1::3");
        let parsed: StreamPartition = sp.key().parse().unwrap();
        assert_eq!(parsed, sp);
    }

    #[test]
    fn test_stream_partition_parse_rejects_garbage() {
        assert!("no-separator".parse::<StreamPartition>().is_err());
        assert!("::7".parse::<StreamPartition>().is_err());
        assert!("stream::not-a-number".parse::<StreamPartition>().is_err());
    }

    #[test]
    fn test_stream_id_containing_separator_still_parses() {
        // rsplit keeps everything before the last separator as the id.
        let sp = StreamPartition::new("a::b", 1);
        let parsed: StreamPartition = sp.key().parse().unwrap();
        assert_eq!(parsed.stream_id(), "a::b");
        assert_eq!(parsed.partition(), 1);
    }

    #[test]
    fn test_message_ref_ordering_is_lexicographic() {
        assert!(MessageRef::new(1, 5) < MessageRef::new(2, 0));
        assert!(MessageRef::new(2, 0) < MessageRef::new(2, 1));
        assert_eq!(MessageRef::new(3, 3), MessageRef::new(3, 3));
    }

    #[test]
    fn test_message_id_reference_and_chain_key() {
        let id = MessageId::new(
            StreamPartition::new("s", 0),
            100,
            2,
            "publisher-a",
            "chain-1",
        );
        assert_eq!(id.reference(), MessageRef::new(100, 2));
        let key = id.chain_key();
        assert_eq!(key.publisher_id, "publisher-a");
        assert_eq!(key.msg_chain_id, "chain-1");
        assert_eq!(key.stream, StreamPartition::new("s", 0));
    }
}
