/// Tracker runtime — topology coordination for the overlay.
///
/// The tracker never touches stream data. It listens for node status
/// reports, keeps one overlay topology per stream partition, and issues
/// the connect/disconnect instructions that hold every node's neighbor
/// count at the configured bound. It also serves storage-node discovery
/// and peer address lookups.
mod r#loop;
pub mod state;

pub use state::{NodeRecord, StatusOutcome, TrackerState};

use std::collections::BTreeMap;
use std::time::Duration;

use braid_metrics::Registry;
use braid_transport::{Endpoint, EndpointEvent, PeerKind};
use tokio::sync::{mpsc, oneshot};

use crate::identifiers::{NodeId, StreamPartition};

/// Default neighbor bound per node and stream partition.
pub const DEFAULT_MAX_NEIGHBORS: usize = 4;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for the tracker runtime.
pub struct TrackerConfig {
    /// Neighbor bound the topologies converge to.
    pub max_neighbors: usize,
    /// Cadence of instruction rounds.
    pub instruction_interval: Duration,
    /// Seed for the topology randomness; pin it for reproducible rounds.
    pub seed: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
            instruction_interval: Duration::from_secs(5),
            seed: None,
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the embedding application sends to the tracker event loop.
pub enum TrackerCommand {
    /// Query: adjacency snapshot of every stream partition.
    GetTopologies {
        reply: oneshot::Sender<BTreeMap<StreamPartition, BTreeMap<NodeId, Vec<NodeId>>>>,
    },
    /// Query: counter snapshot of the runtime metrics.
    GetMetrics {
        reply: oneshot::Sender<BTreeMap<String, u64>>,
    },
    /// Graceful shutdown.
    Shutdown,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Observability events; protocol behavior never depends on them.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    /// A peer registered with the tracker.
    NodeJoined { node: NodeId, kind: PeerKind },
    /// A registered peer disconnected.
    NodeLeft { node: NodeId },
    /// A status report was ingested.
    StatusReceived {
        node: NodeId,
        updated: usize,
        stale: usize,
    },
    /// An instruction round sent out at least one instruction.
    InstructionsIssued { count: usize },
}

// ── TrackerHandle (app-facing API) ───────────────────────────────────

/// Handle to communicate with a running tracker. Cheap to clone.
#[derive(Clone)]
pub struct TrackerHandle {
    cmd_tx: mpsc::Sender<TrackerCommand>,
    local_id: NodeId,
}

impl TrackerHandle {
    /// This tracker's identity.
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Adjacency snapshot of every stream partition.
    pub async fn topologies(
        &self,
    ) -> BTreeMap<StreamPartition, BTreeMap<NodeId, Vec<NodeId>>> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(TrackerCommand::GetTopologies { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Counter snapshot of the runtime metrics.
    pub async fn metrics(&self) -> BTreeMap<String, u64> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(TrackerCommand::GetMetrics { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Graceful shutdown.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(TrackerCommand::Shutdown).await;
    }
}

// ── TrackerChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the tracker starts.
pub struct TrackerChannels {
    /// Handle to send commands to the runtime.
    pub handle: TrackerHandle,
    /// Receive observability events.
    pub events: mpsc::Receiver<TrackerEvent>,
}

// ── Tracker ──────────────────────────────────────────────────────────

/// The tracker runtime — spawn it and communicate via channels.
pub struct Tracker;

impl Tracker {
    /// Create and start the tracker runtime.
    ///
    /// Takes ownership of the `Endpoint` and its event receiver. Spawns
    /// the event loop as a tokio task.
    pub fn spawn(
        endpoint: Endpoint,
        endpoint_events: mpsc::Receiver<EndpointEvent>,
        config: TrackerConfig,
    ) -> TrackerChannels {
        let local_id = endpoint.local_node_id().clone();
        let registry = Registry::new();

        // Command channel (app → runtime)
        let (cmd_tx, cmd_rx) = mpsc::channel::<TrackerCommand>(64);

        // Event channel (runtime → app)
        let (event_tx, event_rx) = mpsc::channel::<TrackerEvent>(256);

        // Spawn the event loop
        tokio::spawn(r#loop::tracker_loop(
            endpoint,
            endpoint_events,
            cmd_rx,
            event_tx,
            registry,
            config,
        ));

        TrackerChannels {
            handle: TrackerHandle { cmd_tx, local_id },
            events: event_rx,
        }
    }
}
