//! The tracker runtime event loop.
//!
//! A single async task owning the tracker state. Status reports and
//! lookup requests arrive as transport events; instruction rounds run on
//! a fixed interval, independent of status arrival.

use std::sync::Arc;

use braid_metrics::{Counter, Registry};
use braid_transport::{Endpoint, EndpointEvent};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::NetworkError;
use crate::identifiers::NodeId;
use crate::messages::{ErrorResponse, ErrorResponseKind, WireMessage};
use crate::topology::{Randomness, StdRandomness};

use super::state::TrackerState;
use super::{TrackerCommand, TrackerConfig, TrackerEvent};

struct TrackerMetrics {
    registry: Registry,
    statuses_received: Arc<Counter>,
    stale_status_entries: Arc<Counter>,
    rounds: Arc<Counter>,
    instructions_sent: Arc<Counter>,
    instruction_send_failures: Arc<Counter>,
    storage_node_requests: Arc<Counter>,
    address_lookups: Arc<Counter>,
    unknown_peer_lookups: Arc<Counter>,
    decode_failures: Arc<Counter>,
}

impl TrackerMetrics {
    fn new(registry: Registry) -> Self {
        Self {
            statuses_received: registry.counter("tracker.statuses_received"),
            stale_status_entries: registry.counter("tracker.stale_status_entries"),
            rounds: registry.counter("tracker.rounds"),
            instructions_sent: registry.counter("tracker.instructions_sent"),
            instruction_send_failures: registry.counter("tracker.instruction_send_failures"),
            storage_node_requests: registry.counter("tracker.storage_node_requests"),
            address_lookups: registry.counter("tracker.address_lookups"),
            unknown_peer_lookups: registry.counter("tracker.unknown_peer_lookups"),
            decode_failures: registry.counter("tracker.decode_failures"),
            registry,
        }
    }
}

struct TrackerCtx {
    endpoint: Endpoint,
    events: mpsc::Sender<TrackerEvent>,
    metrics: TrackerMetrics,
}

/// Main event loop — owns all tracker state.
pub(super) async fn tracker_loop(
    endpoint: Endpoint,
    mut endpoint_events: mpsc::Receiver<EndpointEvent>,
    mut cmd_rx: mpsc::Receiver<TrackerCommand>,
    event_tx: mpsc::Sender<TrackerEvent>,
    registry: Registry,
    config: TrackerConfig,
) {
    let mut state = TrackerState::new(config.max_neighbors);
    let mut rng = match config.seed {
        Some(seed) => StdRandomness::seeded(seed),
        None => StdRandomness::new(),
    };
    let ctx = TrackerCtx {
        endpoint,
        events: event_tx,
        metrics: TrackerMetrics::new(registry),
    };

    let mut rounds = interval(config.instruction_interval);
    rounds.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The immediate first tick would balance an empty graph.
    rounds.tick().await;

    info!(tracker = %ctx.endpoint.local_node_id(), "tracker runtime started");

    loop {
        tokio::select! {
            // ── 1. Transport events ─────────────────────────────
            event = endpoint_events.recv() => {
                match event {
                    Some(event) => on_endpoint_event(&mut state, &ctx, event).await,
                    None => break,
                }
            }

            // ── 2. Commands from the application ────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(TrackerCommand::Shutdown) | None => break,
                    Some(cmd) => on_command(&state, &ctx, cmd),
                }
            }

            // ── 3. Timer: instruction round ─────────────────────
            _ = rounds.tick() => {
                run_round(&mut state, &mut rng, &ctx).await;
            }
        }
    }

    // Graceful shutdown
    ctx.endpoint.shutdown().await;
    info!(tracker = %ctx.endpoint.local_node_id(), "tracker runtime stopped");
}

async fn on_endpoint_event(state: &mut TrackerState, ctx: &TrackerCtx, event: EndpointEvent) {
    match event {
        EndpointEvent::PeerConnected { peer, info } => {
            debug!(peer = %peer, kind = ?info.kind, "peer registered");
            state.register(peer.clone(), info.kind, info.address);
            let _ = ctx
                .events
                .send(TrackerEvent::NodeJoined {
                    node: peer,
                    kind: info.kind,
                })
                .await;
        }
        EndpointEvent::PeerDisconnected { peer, reason } => {
            if !state.is_registered(&peer) {
                return;
            }
            let affected = state.deregister(&peer);
            debug!(
                peer = %peer,
                reason = %reason,
                streams = affected.len(),
                "peer deregistered"
            );
            let _ = ctx.events.send(TrackerEvent::NodeLeft { node: peer }).await;
        }
        EndpointEvent::Message { peer, payload } => match WireMessage::from_bytes(&payload) {
            Ok(message) => on_wire_message(state, ctx, peer, message).await,
            Err(err) => {
                ctx.metrics.decode_failures.inc();
                debug!(peer = %peer, error = %err, "undecodable frame dropped");
            }
        },
        EndpointEvent::HighBackPressure { peer } => {
            debug!(peer = %peer, "peer under back pressure");
        }
        EndpointEvent::LowBackPressure { peer } => {
            debug!(peer = %peer, "peer back pressure cleared");
        }
        EndpointEvent::RttMeasured { .. } => {}
    }
}

async fn on_wire_message(
    state: &mut TrackerState,
    ctx: &TrackerCtx,
    peer: NodeId,
    message: WireMessage,
) {
    match message {
        WireMessage::Status(status) => {
            ctx.metrics.statuses_received.inc();
            let outcome = state.process_status(&peer, &status);
            if outcome.stale > 0 {
                ctx.metrics.stale_status_entries.inc_by(outcome.stale as u64);
            }
            debug!(
                peer = %peer,
                updated = outcome.updated,
                stale = outcome.stale,
                vanished = outcome.vanished,
                "status ingested"
            );
            let _ = ctx
                .events
                .send(TrackerEvent::StatusReceived {
                    node: peer,
                    updated: outcome.updated,
                    stale: outcome.stale,
                })
                .await;
        }
        WireMessage::StorageNodesRequest { stream } => {
            ctx.metrics.storage_node_requests.inc();
            let node_ids = state.storage_nodes_for(&peer);
            debug!(peer = %peer, stream = %stream, found = node_ids.len(), "storage nodes requested");
            let response = WireMessage::StorageNodesResponse { stream, node_ids };
            if let Err(err) = send_encoded(&ctx.endpoint, &peer, &response).await {
                debug!(peer = %peer, error = %err, "storage node response failed");
            }
        }
        WireMessage::NodeAddressRequest { node } => {
            ctx.metrics.address_lookups.inc();
            let response = match state.address_of(&node) {
                Some(address) => WireMessage::NodeAddressResponse {
                    node,
                    address: address.clone(),
                },
                None => {
                    // Never a silent drop: the asking node is waiting.
                    ctx.metrics.unknown_peer_lookups.inc();
                    debug!(peer = %peer, node = %node, "address lookup for unknown peer");
                    WireMessage::ErrorResponse(ErrorResponse {
                        kind: ErrorResponseKind::UnknownPeer,
                        target: node,
                    })
                }
            };
            if let Err(err) = send_encoded(&ctx.endpoint, &peer, &response).await {
                debug!(peer = %peer, error = %err, "address response failed");
            }
        }
        _ => {
            debug!(peer = %peer, "unexpected message from peer");
        }
    }
}

fn on_command(state: &TrackerState, ctx: &TrackerCtx, cmd: TrackerCommand) {
    match cmd {
        TrackerCommand::GetTopologies { reply } => {
            let _ = reply.send(state.topology_snapshot());
        }
        TrackerCommand::GetMetrics { reply } => {
            let _ = reply.send(ctx.metrics.registry.snapshot());
        }
        // Intercepted by the event loop.
        TrackerCommand::Shutdown => {}
    }
}

/// One balancing round: form and apply edge changes per stream, then send
/// every touched node its full new neighbor set.
async fn run_round(state: &mut TrackerState, rng: &mut dyn Randomness, ctx: &TrackerCtx) {
    ctx.metrics.rounds.inc();
    let issued = state.instruction_round(rng);
    if issued.is_empty() {
        return;
    }
    let count = issued.len();
    for (node, instruction) in issued {
        debug!(
            node = %node,
            stream = %instruction.stream,
            counter = instruction.counter,
            neighbors = instruction.node_ids.len(),
            "instructing node"
        );
        let message = WireMessage::Instruction(instruction);
        match send_encoded(&ctx.endpoint, &node, &message).await {
            Ok(()) => ctx.metrics.instructions_sent.inc(),
            Err(err) => {
                // The node likely disconnected mid-round; its departure
                // event will clean the topology up.
                ctx.metrics.instruction_send_failures.inc();
                warn!(node = %node, error = %err, "instruction send failed");
            }
        }
    }
    let _ = ctx
        .events
        .send(TrackerEvent::InstructionsIssued { count })
        .await;
}

async fn send_encoded(
    endpoint: &Endpoint,
    peer: &NodeId,
    message: &WireMessage,
) -> Result<(), NetworkError> {
    let bytes = message.to_bytes()?;
    endpoint.send(peer, bytes).await.map_err(Into::into)
}
