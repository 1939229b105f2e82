//! The concrete resend strategies, tried in this order on a full node:
//! local storage, then the stream's neighbors, then tracker-discovered
//! storage nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use braid_transport::NodeId;

use crate::error::NetworkError;
use crate::messages::{ResendRequest, StreamMessage};
use crate::storage::Storage;

use super::{forward, RelayedResendEvent, ResendRelay, ResendStrategy};

/// How long a relayed answer may stay silent before the peer is given up on.
pub const DEFAULT_MAX_INACTIVITY: Duration = Duration::from_secs(5 * 60);

/// Answers from this node's own storage backend.
pub struct LocalResendStrategy {
    storage: Arc<dyn Storage>,
}

impl LocalResendStrategy {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ResendStrategy for LocalResendStrategy {
    async fn resend(
        &self,
        request: &ResendRequest,
        out: &mpsc::Sender<StreamMessage>,
    ) -> Result<usize, NetworkError> {
        let messages = self.storage.request(&request.stream, &request.kind).await?;
        let mut delivered = 0;
        for message in messages {
            forward(out, message, &request.request_id).await?;
            delivered += 1;
        }
        Ok(delivered)
    }
}

/// Relays the request to the stream's neighbors, one at a time. The first
/// neighbor that yields anything settles the request.
pub struct AskNeighborsStrategy {
    relay: Arc<dyn ResendRelay>,
    max_inactivity: Duration,
}

impl AskNeighborsStrategy {
    pub fn new(relay: Arc<dyn ResendRelay>, max_inactivity: Duration) -> Self {
        Self {
            relay,
            max_inactivity,
        }
    }
}

#[async_trait]
impl ResendStrategy for AskNeighborsStrategy {
    async fn resend(
        &self,
        request: &ResendRequest,
        out: &mpsc::Sender<StreamMessage>,
    ) -> Result<usize, NetworkError> {
        for peer in self.relay.neighbor_candidates(&request.stream).await {
            match relay_through(&*self.relay, &peer, request, out, self.max_inactivity).await {
                Ok(0) => continue,
                Ok(delivered) => return Ok(delivered),
                Err(err @ NetworkError::ResendCancelled { .. }) => return Err(err),
                Err(err) => {
                    debug!(peer = %peer, error = %err, "neighbor resend failed, trying next");
                    continue;
                }
            }
        }
        Ok(0)
    }
}

/// Discovers storage nodes through the tracker, connects to them and
/// proxies the request.
pub struct StorageNodeStrategy {
    relay: Arc<dyn ResendRelay>,
    max_inactivity: Duration,
}

impl StorageNodeStrategy {
    pub fn new(relay: Arc<dyn ResendRelay>, max_inactivity: Duration) -> Self {
        Self {
            relay,
            max_inactivity,
        }
    }
}

#[async_trait]
impl ResendStrategy for StorageNodeStrategy {
    async fn resend(
        &self,
        request: &ResendRequest,
        out: &mpsc::Sender<StreamMessage>,
    ) -> Result<usize, NetworkError> {
        let storage_nodes = self.relay.find_storage_nodes(&request.stream).await?;
        for node in storage_nodes {
            if let Err(err) = self.relay.connect_to(&node).await {
                debug!(node = %node, error = %err, "could not reach storage node");
                continue;
            }
            match relay_through(&*self.relay, &node, request, out, self.max_inactivity).await {
                Ok(0) => continue,
                Ok(delivered) => return Ok(delivered),
                Err(err @ NetworkError::ResendCancelled { .. }) => return Err(err),
                Err(err) => {
                    debug!(node = %node, error = %err, "storage node resend failed");
                    continue;
                }
            }
        }
        Ok(0)
    }
}

/// Open a relayed answer from one peer and forward it until it completes,
/// the peer reports nothing, or it stays silent past `max_inactivity`.
async fn relay_through(
    relay: &dyn ResendRelay,
    peer: &NodeId,
    request: &ResendRequest,
    out: &mpsc::Sender<StreamMessage>,
    max_inactivity: Duration,
) -> Result<usize, NetworkError> {
    let mut events = relay.relay_request(peer, request).await?;
    let mut delivered = 0;
    loop {
        let event = match timeout(max_inactivity, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                return Err(NetworkError::ResendStalled { peer: peer.clone() });
            }
        };
        match event {
            RelayedResendEvent::Resending => {}
            RelayedResendEvent::Message(message) => {
                forward(out, message, &request.request_id).await?;
                delivered += 1;
            }
            RelayedResendEvent::Resent | RelayedResendEvent::NoResend => break,
        }
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::identifiers::{MessageId, StreamPartition};
    use crate::messages::ResendKind;
    use crate::storage::MemoryStorage;

    fn stream() -> StreamPartition {
        StreamPartition::new("s", 0)
    }

    fn request() -> ResendRequest {
        ResendRequest::new(stream(), ResendKind::Last { count: 10 })
    }

    fn message(ts: u64) -> StreamMessage {
        StreamMessage::new(MessageId::new(stream(), ts, 0, "p", "c"), None, vec![])
    }

    /// Scripted relay: peers answer with a fixed event list; peers without
    /// a script accept the request and stay silent forever.
    struct MockRelay {
        candidates: Vec<NodeId>,
        storage_nodes: Vec<NodeId>,
        scripts: HashMap<NodeId, Vec<RelayedResendEvent>>,
        unreachable: Vec<NodeId>,
        relay_calls: AtomicUsize,
        held_open: Mutex<Vec<mpsc::Sender<RelayedResendEvent>>>,
    }

    impl MockRelay {
        fn new() -> Self {
            Self {
                candidates: vec![],
                storage_nodes: vec![],
                scripts: HashMap::new(),
                unreachable: vec![],
                relay_calls: AtomicUsize::new(0),
                held_open: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl ResendRelay for MockRelay {
        async fn neighbor_candidates(&self, _stream: &StreamPartition) -> Vec<NodeId> {
            self.candidates.clone()
        }

        async fn relay_request(
            &self,
            peer: &NodeId,
            _request: &ResendRequest,
        ) -> Result<mpsc::Receiver<RelayedResendEvent>, NetworkError> {
            self.relay_calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            match self.scripts.get(peer) {
                Some(events) => {
                    for event in events {
                        let _ = tx.try_send(event.clone());
                    }
                }
                None => {
                    // Silent peer: keep the channel open without events.
                    self.held_open
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(tx);
                }
            }
            Ok(rx)
        }

        async fn find_storage_nodes(
            &self,
            _stream: &StreamPartition,
        ) -> Result<Vec<NodeId>, NetworkError> {
            Ok(self.storage_nodes.clone())
        }

        async fn connect_to(&self, node: &NodeId) -> Result<(), NetworkError> {
            if self.unreachable.contains(node) {
                Err(NetworkError::ConnectionTimeout { node: node.clone() })
            } else {
                Ok(())
            }
        }
    }

    async fn run(
        strategy: &dyn ResendStrategy,
        request: &ResendRequest,
    ) -> (Result<usize, NetworkError>, Vec<u64>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = strategy.resend(request, &tx).await;
        drop(tx);
        let mut stamps = Vec::new();
        while let Some(message) = rx.recv().await {
            stamps.push(message.id.timestamp);
        }
        (result, stamps)
    }

    #[tokio::test]
    async fn test_local_strategy_serves_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        for ts in [1, 2, 3] {
            storage.store(message(ts)).await.unwrap();
        }
        let strategy = LocalResendStrategy::new(storage);
        let (result, stamps) = run(&strategy, &request()).await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_local_strategy_with_empty_storage_yields_zero() {
        let strategy = LocalResendStrategy::new(Arc::new(MemoryStorage::new()));
        let (result, stamps) = run(&strategy, &request()).await;
        assert_eq!(result.unwrap(), 0);
        assert!(stamps.is_empty());
    }

    #[tokio::test]
    async fn test_neighbors_are_asked_one_at_a_time_until_one_yields() {
        let mut relay = MockRelay::new();
        let empty = NodeId::new("empty");
        let full = NodeId::new("full");
        let spare = NodeId::new("spare");
        relay.candidates = vec![empty.clone(), full.clone(), spare.clone()];
        relay
            .scripts
            .insert(empty.clone(), vec![RelayedResendEvent::NoResend]);
        relay.scripts.insert(
            full.clone(),
            vec![
                RelayedResendEvent::Resending,
                RelayedResendEvent::Message(message(7)),
                RelayedResendEvent::Message(message(8)),
                RelayedResendEvent::Resent,
            ],
        );
        let relay = Arc::new(relay);
        let strategy = AskNeighborsStrategy::new(relay.clone(), DEFAULT_MAX_INACTIVITY);
        let (result, stamps) = run(&strategy, &request()).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(stamps, vec![7, 8]);
        // The third candidate was never contacted.
        assert_eq!(relay.relay_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_neighbor_is_abandoned_after_inactivity() {
        let mut relay = MockRelay::new();
        let silent = NodeId::new("silent");
        relay.candidates = vec![silent];
        let strategy =
            AskNeighborsStrategy::new(Arc::new(relay), Duration::from_secs(1));
        let (result, stamps) = run(&strategy, &request()).await;
        // The stalled peer is skipped; with nobody else the answer is empty.
        assert_eq!(result.unwrap(), 0);
        assert!(stamps.is_empty());
    }

    #[tokio::test]
    async fn test_no_candidates_yields_zero() {
        let strategy =
            AskNeighborsStrategy::new(Arc::new(MockRelay::new()), DEFAULT_MAX_INACTIVITY);
        let (result, _) = run(&strategy, &request()).await;
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_storage_discovery_connects_and_proxies() {
        let mut relay = MockRelay::new();
        let dead = NodeId::new("dead-storage");
        let live = NodeId::new("live-storage");
        relay.storage_nodes = vec![dead.clone(), live.clone()];
        relay.unreachable = vec![dead];
        relay.scripts.insert(
            live,
            vec![
                RelayedResendEvent::Message(message(42)),
                RelayedResendEvent::Resent,
            ],
        );
        let relay = Arc::new(relay);
        let strategy = StorageNodeStrategy::new(relay.clone(), DEFAULT_MAX_INACTIVITY);
        let (result, stamps) = run(&strategy, &request()).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(stamps, vec![42]);
        // Only the reachable storage node was asked.
        assert_eq!(relay.relay_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_storage_discovery_with_no_storage_nodes_yields_zero() {
        let strategy =
            StorageNodeStrategy::new(Arc::new(MockRelay::new()), DEFAULT_MAX_INACTIVITY);
        let (result, _) = run(&strategy, &request()).await;
        assert_eq!(result.unwrap(), 0);
    }
}
