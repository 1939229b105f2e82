/// Node runtime — integrates the protocol modules into a live event loop.
///
/// The runtime owns an `Endpoint` (transport) and all per-node protocol
/// state (stream manager, duplicate detectors, message buffer, instruction
/// throttler, resend handler). It exposes a channel-based API so the
/// application never touches raw bytes or protocol internals.
mod r#loop;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use braid_metrics::Registry;
use braid_transport::{Endpoint, EndpointEvent, PeerAddress};
use tokio::sync::{mpsc, oneshot};

use crate::buffer::{
    DEFAULT_BUFFER_MAX_SIZE, DEFAULT_BUFFER_TTL, DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL,
};
use crate::dedup::DEFAULT_WINDOW_CAPACITY;
use crate::error::NetworkError;
use crate::identifiers::{MessageRef, NodeId, StreamPartition};
use crate::messages::{ResendKind, ResendRequest, StreamMessage};
use crate::resend::{
    AskNeighborsStrategy, LocalResendStrategy, ResendHandler, ResendStrategy,
    StorageNodeStrategy, DEFAULT_MAX_INACTIVITY,
};
use crate::storage::Storage;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the node runtime.
pub struct NodeConfig {
    /// Tracker addresses dialed at startup and redialed by maintenance.
    pub trackers: Vec<PeerAddress>,
    /// Free-form location string reported to trackers.
    pub location: Option<String>,
    /// Per-chain window size for duplicate detection.
    pub dedup_window: usize,
    /// Timeout for a single dial towards an instructed neighbor.
    pub connect_timeout: Duration,
    /// Grace period before dropping a peer that shares no streams with us.
    pub disconnection_wait: Duration,
    /// Quiet period used to coalesce status reports per tracker.
    pub status_debounce: Duration,
    /// Cadence of tracker redial attempts.
    pub maintenance_interval: Duration,
    /// How long messages without a forwarding target stay buffered.
    pub buffer_ttl: Duration,
    /// Cap on the number of buffered messages across all streams.
    pub buffer_max_size: usize,
    /// How many message identities are remembered as seen but not propagated.
    pub seen_capacity: usize,
    /// How long those identities are remembered.
    pub seen_ttl: Duration,
    /// Silence tolerated from a peer answering a relayed resend.
    pub resend_inactivity: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            trackers: Vec::new(),
            location: None,
            dedup_window: DEFAULT_WINDOW_CAPACITY,
            connect_timeout: Duration::from_secs(2),
            disconnection_wait: Duration::from_secs(30),
            status_debounce: Duration::from_secs(1),
            maintenance_interval: Duration::from_secs(5),
            buffer_ttl: DEFAULT_BUFFER_TTL,
            buffer_max_size: DEFAULT_BUFFER_MAX_SIZE,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            seen_ttl: DEFAULT_SEEN_TTL,
            resend_inactivity: DEFAULT_MAX_INACTIVITY,
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the node event loop.
pub enum NodeCommand {
    /// Join a stream partition so trackers assign us neighbors.
    Subscribe { stream: StreamPartition },
    /// Leave a stream partition and drop its neighbors.
    Unsubscribe { stream: StreamPartition },
    /// Inject a locally published message into the propagation path.
    Publish { message: StreamMessage },
    /// Request historical messages; answers arrive on the replied channel.
    Resend {
        request: ResendRequest,
        reply: oneshot::Sender<mpsc::Receiver<StreamMessage>>,
    },
    /// Add a tracker address and dial it right away.
    AddTracker { address: PeerAddress },
    /// Query: neighbors of one stream partition.
    GetNeighbors {
        stream: StreamPartition,
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    /// Query: stream partitions this node is set up for.
    GetSubscriptions {
        reply: oneshot::Sender<Vec<StreamPartition>>,
    },
    /// Query: counter snapshot of the runtime metrics.
    GetMetrics {
        reply: oneshot::Sender<BTreeMap<String, u64>>,
    },
    /// Graceful shutdown.
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Protocol-level events the application may want to observe.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A neighbor was attached to one of our stream partitions.
    Subscribed {
        stream: StreamPartition,
        node: NodeId,
    },
    /// A neighbor was detached from one of our stream partitions.
    Unsubscribed {
        stream: StreamPartition,
        node: NodeId,
    },
    /// A peer connected at the transport level.
    NodeConnected { node: NodeId },
    /// A peer disconnected at the transport level.
    NodeDisconnected { node: NodeId },
    /// A message was accepted for the first time (publisher order preserved).
    UnseenMessage {
        message: StreamMessage,
        source: Option<NodeId>,
    },
    /// A propagation attempt towards a neighbor failed.
    PropagationFailed {
        stream: StreamPartition,
        node: NodeId,
    },
}

// ── NodeHandle (app-facing API) ──────────────────────────────────────

/// Handle to communicate with a running node.
///
/// Cheap to clone. All methods are non-blocking channel sends.
#[derive(Clone)]
pub struct NodeHandle {
    cmd_tx: mpsc::Sender<NodeCommand>,
    local_id: NodeId,
}

impl NodeHandle {
    /// This node's identity.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Join a stream partition. Idempotent.
    pub async fn subscribe(&self, stream: StreamPartition) -> Result<(), NetworkError> {
        self.cmd_tx
            .send(NodeCommand::Subscribe { stream })
            .await
            .map_err(|_| NetworkError::Shutdown)
    }

    /// Leave a stream partition. Ignored when not subscribed.
    pub async fn unsubscribe(&self, stream: StreamPartition) -> Result<(), NetworkError> {
        self.cmd_tx
            .send(NodeCommand::Unsubscribe { stream })
            .await
            .map_err(|_| NetworkError::Shutdown)
    }

    /// Publish a message into its stream partition.
    ///
    /// The runtime subscribes to the partition on first publish, checks the
    /// publisher chain, and forwards to the current neighbors.
    pub async fn publish(&self, message: StreamMessage) -> Result<(), NetworkError> {
        self.cmd_tx
            .send(NodeCommand::Publish { message })
            .await
            .map_err(|_| NetworkError::Shutdown)
    }

    /// Request the last `count` historical messages of a stream partition.
    pub async fn resend_last(
        &self,
        stream: StreamPartition,
        count: u64,
    ) -> Result<mpsc::Receiver<StreamMessage>, NetworkError> {
        self.resend(ResendRequest::new(stream, ResendKind::Last { count }))
            .await
    }

    /// Request historical messages from `from` onwards, optionally narrowed
    /// to one publisher and message chain.
    pub async fn resend_from(
        &self,
        stream: StreamPartition,
        from: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    ) -> Result<mpsc::Receiver<StreamMessage>, NetworkError> {
        self.resend(ResendRequest::new(
            stream,
            ResendKind::From {
                from,
                publisher_id,
                msg_chain_id,
            },
        ))
        .await
    }

    /// Request historical messages between `from` and `to` inclusive.
    pub async fn resend_range(
        &self,
        stream: StreamPartition,
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    ) -> Result<mpsc::Receiver<StreamMessage>, NetworkError> {
        self.resend(ResendRequest::new(
            stream,
            ResendKind::Range {
                from,
                to,
                publisher_id,
                msg_chain_id,
            },
        ))
        .await
    }

    async fn resend(
        &self,
        request: ResendRequest,
    ) -> Result<mpsc::Receiver<StreamMessage>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::Resend { request, reply: tx })
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        rx.await.map_err(|_| NetworkError::Shutdown)
    }

    /// Add a tracker address and dial it right away.
    pub async fn add_tracker(&self, address: PeerAddress) -> Result<(), NetworkError> {
        self.cmd_tx
            .send(NodeCommand::AddTracker { address })
            .await
            .map_err(|_| NetworkError::Shutdown)
    }

    /// Neighbors of one stream partition. Empty when not subscribed.
    pub async fn neighbors(&self, stream: StreamPartition) -> Vec<NodeId> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NodeCommand::GetNeighbors { stream, reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Stream partitions this node is currently set up for.
    pub async fn subscriptions(&self) -> Vec<StreamPartition> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NodeCommand::GetSubscriptions { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Counter snapshot of the runtime metrics.
    pub async fn metrics(&self) -> BTreeMap<String, u64> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NodeCommand::GetMetrics { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(NodeCommand::Shutdown).await;
    }
}

// ── NodeChannels ─────────────────────────────────────────────────────

/// Channels returned to the application when the node starts.
pub struct NodeChannels {
    /// Handle to send commands to the runtime.
    pub handle: NodeHandle,
    /// Receive protocol-level events.
    pub events: mpsc::Receiver<NodeEvent>,
}

// ── Node ─────────────────────────────────────────────────────────────

/// The node runtime — spawn it and communicate via channels.
pub struct Node;

impl Node {
    /// Create and start the node runtime.
    ///
    /// Takes ownership of the `Endpoint` and its event receiver. Passing a
    /// `Storage` makes this node answer resend requests from its own history
    /// before relaying them. Spawns the event loop as a tokio task.
    pub fn spawn(
        endpoint: Endpoint,
        endpoint_events: mpsc::Receiver<EndpointEvent>,
        storage: Option<Arc<dyn Storage>>,
        config: NodeConfig,
    ) -> NodeChannels {
        let local_id = endpoint.local_node_id().clone();
        let registry = Registry::new();

        // Command channel (app → runtime)
        let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(64);

        // Event channel (runtime → app)
        let (event_tx, event_rx) = mpsc::channel::<NodeEvent>(256);

        // Relay channel (resend strategies → runtime)
        let (relay_tx, relay_rx) = mpsc::channel::<r#loop::RelayRequest>(32);
        let relay = Arc::new(r#loop::LoopRelay::new(relay_tx));

        // Strategies consulted for any request, local or relayed.
        let mut shared: Vec<Box<dyn ResendStrategy>> = Vec::new();
        if let Some(storage) = storage {
            shared.push(Box::new(LocalResendStrategy::new(storage)));
        }
        // Strategies consulted for local requests only. Relayed requests
        // never fan out further, which keeps relay chains one hop deep.
        let local_only: Vec<Box<dyn ResendStrategy>> = vec![
            Box::new(AskNeighborsStrategy::new(
                relay.clone(),
                config.resend_inactivity,
            )),
            Box::new(StorageNodeStrategy::new(relay, config.resend_inactivity)),
        ];

        let resend_errors = registry.counter("node.resend_errors");
        let resends = ResendHandler::new(shared, local_only, move |err| {
            resend_errors.inc();
            tracing::warn!(error = %err, "resend strategy failed");
        });

        // Spawn the event loop
        tokio::spawn(r#loop::node_loop(
            endpoint,
            endpoint_events,
            cmd_rx,
            relay_rx,
            event_tx,
            resends,
            registry,
            config,
        ));

        NodeChannels {
            handle: NodeHandle { cmd_tx, local_id },
            events: event_rx,
        }
    }
}
