/// The node runtime event loop.
///
/// A single async task that owns all mutable node state and multiplexes
/// over transport events, application commands, resend relay requests,
/// spawned dial results and timers. Everything that touches the state runs
/// on this task; dials and resend answers run as spawned tasks and report
/// back through channels.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use braid_metrics::{Counter, Registry};
use braid_transport::{Endpoint, EndpointEvent, PeerAddress, PeerInfo, PeerKind};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::buffer::{MessageBuffer, SeenButNotPropagated};
use crate::error::NetworkError;
use crate::identifiers::{NodeId, StreamPartition};
use crate::messages::{
    ErrorResponse, ErrorResponseKind, Instruction, ResendRequest, ResendResponse, Status,
    StreamMessage, StreamStatus, WireMessage,
};
use crate::resend::{RelayedResendEvent, ResendHandler, ResendRelay};
use crate::streams::StreamManager;
use crate::throttler::InstructionThrottler;

use super::{NodeCommand, NodeConfig, NodeEvent};

const RELAY_BUFFER: usize = 64;

// ── Relay bridge (resend strategies → loop) ─────────────────────────

/// What the resend strategies ask the event loop for.
pub(super) enum RelayRequest {
    Candidates {
        stream: StreamPartition,
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    OpenRelay {
        peer: NodeId,
        request: ResendRequest,
        reply: oneshot::Sender<Result<mpsc::Receiver<RelayedResendEvent>, NetworkError>>,
    },
    FindStorageNodes {
        stream: StreamPartition,
        reply: oneshot::Sender<Result<Vec<NodeId>, NetworkError>>,
    },
    EnsureConnected {
        node: NodeId,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
}

/// [`ResendRelay`] backed by the event loop. Strategies run on their own
/// tasks, so every call is a round trip over the relay channel.
pub(super) struct LoopRelay {
    requests: mpsc::Sender<RelayRequest>,
}

impl LoopRelay {
    pub(super) fn new(requests: mpsc::Sender<RelayRequest>) -> Self {
        Self { requests }
    }
}

#[async_trait]
impl ResendRelay for LoopRelay {
    async fn neighbor_candidates(&self, stream: &StreamPartition) -> Vec<NodeId> {
        let (tx, rx) = oneshot::channel();
        let request = RelayRequest::Candidates {
            stream: stream.clone(),
            reply: tx,
        };
        if self.requests.send(request).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn relay_request(
        &self,
        peer: &NodeId,
        request: &ResendRequest,
    ) -> Result<mpsc::Receiver<RelayedResendEvent>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        let command = RelayRequest::OpenRelay {
            peer: peer.clone(),
            request: request.clone(),
            reply: tx,
        };
        self.requests
            .send(command)
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        rx.await.map_err(|_| NetworkError::Shutdown)?
    }

    async fn find_storage_nodes(
        &self,
        stream: &StreamPartition,
    ) -> Result<Vec<NodeId>, NetworkError> {
        let (tx, rx) = oneshot::channel();
        let command = RelayRequest::FindStorageNodes {
            stream: stream.clone(),
            reply: tx,
        };
        self.requests
            .send(command)
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        rx.await.map_err(|_| NetworkError::Shutdown)?
    }

    async fn connect_to(&self, node: &NodeId) -> Result<(), NetworkError> {
        let (tx, rx) = oneshot::channel();
        let command = RelayRequest::EnsureConnected {
            node: node.clone(),
            reply: tx,
        };
        self.requests
            .send(command)
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        rx.await.map_err(|_| NetworkError::Shutdown)?
    }
}

// ── Internal messages (spawned tasks → loop) ────────────────────────

enum Internal {
    DialFinished {
        node: NodeId,
        result: Result<(), NetworkError>,
    },
    AddressLookupTimedOut {
        node: NodeId,
    },
    InboundWaitTimedOut {
        node: NodeId,
    },
    TrackerDialDone {
        address: PeerAddress,
        error: Option<String>,
    },
}

// ── Loop state ──────────────────────────────────────────────────────

/// A message parked until the stream has an outbound neighbor again.
type BufferedMessage = (StreamMessage, Option<NodeId>);

/// One topology instruction whose neighbor dials have not all settled.
struct InFlightInstruction {
    stream: StreamPartition,
    tracker: NodeId,
    counter: u64,
    pending: BTreeSet<NodeId>,
    failed: Vec<NodeId>,
    cancelled: bool,
}

/// All protocol state the loop mutates.
struct NodeState {
    streams: StreamManager,
    buffer: MessageBuffer<BufferedMessage>,
    seen: SeenButNotPropagated,
    throttler: InstructionThrottler,
    current_instruction: Option<InFlightInstruction>,
    peer_kinds: HashMap<NodeId, PeerKind>,
    peer_addresses: HashMap<NodeId, PeerAddress>,
    trackers: BTreeSet<NodeId>,
    tracker_list: Vec<PeerAddress>,
    rtts: BTreeMap<NodeId, u64>,
    started: u64,
}

impl NodeState {
    fn new(config: &NodeConfig) -> Self {
        Self {
            streams: StreamManager::new(config.dedup_window),
            buffer: MessageBuffer::new(config.buffer_ttl, config.buffer_max_size),
            seen: SeenButNotPropagated::with(config.seen_capacity, config.seen_ttl),
            throttler: InstructionThrottler::new(),
            current_instruction: None,
            peer_kinds: HashMap::new(),
            peer_addresses: HashMap::new(),
            trackers: BTreeSet::new(),
            tracker_list: config.trackers.clone(),
            rtts: BTreeMap::new(),
            started: now_ms(),
        }
    }
}

/// An outbound relayed resend we are reading answers for.
struct OpenRelayEntry {
    peer: NodeId,
    sink: mpsc::Sender<RelayedResendEvent>,
}

/// Async work the loop has started and not finished.
#[derive(Default)]
struct PendingWork {
    /// request_id → where its unicasts and responses are forwarded.
    relays: HashMap<String, OpenRelayEntry>,
    /// Waiters for a tracker's storage-node answer, per stream.
    storage_lookups: HashMap<StreamPartition, Vec<oneshot::Sender<Result<Vec<NodeId>, NetworkError>>>>,
    /// Dials under way. An entry with no waiters still marks the dial.
    dials: HashMap<NodeId, Vec<oneshot::Sender<Result<(), NetworkError>>>>,
    tracker_dials: HashSet<PeerAddress>,
    /// Debounced status deadlines, per tracker.
    status_due: HashMap<NodeId, Instant>,
    /// Grace deadlines for connections without shared streams.
    disconnect_due: HashMap<NodeId, Instant>,
}

struct NodeMetrics {
    registry: Registry,
    unseen_messages: Arc<Counter>,
    duplicate_messages: Arc<Counter>,
    invalid_numbering: Arc<Counter>,
    gap_mismatches: Arc<Counter>,
    propagations: Arc<Counter>,
    propagation_failures: Arc<Counter>,
    buffered_messages: Arc<Counter>,
    buffer_evictions: Arc<Counter>,
    buffer_expirations: Arc<Counter>,
    instructions_handled: Arc<Counter>,
    instruction_dial_failures: Arc<Counter>,
    resend_requests: Arc<Counter>,
    statuses_sent: Arc<Counter>,
    decode_failures: Arc<Counter>,
}

impl NodeMetrics {
    fn new(registry: Registry) -> Self {
        Self {
            unseen_messages: registry.counter("node.unseen_messages"),
            duplicate_messages: registry.counter("node.duplicate_messages"),
            invalid_numbering: registry.counter("node.invalid_numbering"),
            gap_mismatches: registry.counter("node.gap_mismatches"),
            propagations: registry.counter("node.propagations"),
            propagation_failures: registry.counter("node.propagation_failures"),
            buffered_messages: registry.counter("node.buffered_messages"),
            buffer_evictions: registry.counter("node.buffer_evictions"),
            buffer_expirations: registry.counter("node.buffer_expirations"),
            instructions_handled: registry.counter("node.instructions_handled"),
            instruction_dial_failures: registry.counter("node.instruction_dial_failures"),
            resend_requests: registry.counter("node.resend_requests"),
            statuses_sent: registry.counter("node.statuses_sent"),
            decode_failures: registry.counter("node.decode_failures"),
            registry,
        }
    }
}

/// Shared effect executors; everything here is cheap to clone or borrow.
struct NodeCtx {
    endpoint: Arc<Endpoint>,
    local_id: NodeId,
    events: mpsc::Sender<NodeEvent>,
    internal: mpsc::Sender<Internal>,
    resends: ResendHandler,
    metrics: NodeMetrics,
    config: NodeConfig,
}

// ── Event loop ──────────────────────────────────────────────────────

/// Main event loop — owns all node state.
#[allow(clippy::too_many_arguments)]
pub(super) async fn node_loop(
    endpoint: Endpoint,
    mut endpoint_events: mpsc::Receiver<EndpointEvent>,
    mut cmd_rx: mpsc::Receiver<NodeCommand>,
    mut relay_rx: mpsc::Receiver<RelayRequest>,
    event_tx: mpsc::Sender<NodeEvent>,
    resends: ResendHandler,
    registry: Registry,
    config: NodeConfig,
) {
    let (internal_tx, mut internal_rx) = mpsc::channel::<Internal>(64);
    let mut state = NodeState::new(&config);
    let mut pending = PendingWork::default();
    let ctx = NodeCtx {
        local_id: endpoint.local_node_id().clone(),
        endpoint: Arc::new(endpoint),
        events: event_tx,
        internal: internal_tx,
        resends,
        metrics: NodeMetrics::new(registry),
        config,
    };

    // ── Timers ──────────────────────────────────────────────────────
    // The first maintenance tick fires immediately and dials the trackers.
    let mut maintenance = interval(ctx.config.maintenance_interval);
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep = interval(Duration::from_secs(1));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    sweep.tick().await;

    info!(node = %ctx.local_id, "node runtime started");

    loop {
        let status_deadline = pending.status_due.values().min().copied();
        let disconnect_deadline = pending.disconnect_due.values().min().copied();

        tokio::select! {
            // ── 1. Transport events ─────────────────────────────
            event = endpoint_events.recv() => {
                match event {
                    Some(event) => on_endpoint_event(&mut state, &mut pending, &ctx, event).await,
                    None => break,
                }
            }

            // ── 2. Commands from the application ────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(cmd) => on_command(&mut state, &mut pending, &ctx, cmd).await,
                }
            }

            // ── 3. Requests from resend strategies ──────────────
            Some(request) = relay_rx.recv() => {
                on_relay_request(&mut state, &mut pending, &ctx, request).await;
            }

            // ── 4. Results from spawned tasks ───────────────────
            Some(message) = internal_rx.recv() => {
                on_internal(&mut state, &mut pending, &ctx, message).await;
            }

            // ── 5. Timer: tracker maintenance ───────────────────
            _ = maintenance.tick() => {
                dial_missing_trackers(&state, &mut pending, &ctx);
            }

            // ── 6. Timer: expiry sweep ──────────────────────────
            _ = sweep.tick() => {
                let dropped = state.buffer.expire_at(mono_now());
                if dropped > 0 {
                    ctx.metrics.buffer_expirations.inc_by(dropped as u64);
                    debug!(dropped, "expired buffered messages");
                }
                pending.relays.retain(|_, entry| !entry.sink.is_closed());
            }

            // ── 7. Timer: due status reports ────────────────────
            _ = sleep_until_next(status_deadline), if status_deadline.is_some() => {
                flush_due_statuses(&state, &mut pending, &ctx).await;
            }

            // ── 8. Timer: due disconnections ────────────────────
            _ = sleep_until_next(disconnect_deadline), if disconnect_deadline.is_some() => {
                flush_due_disconnects(&state, &mut pending, &ctx).await;
            }
        }
    }

    // Graceful shutdown
    ctx.resends.stop();
    ctx.endpoint.shutdown().await;
    info!(node = %ctx.local_id, "node runtime stopped");
}

async fn sleep_until_next(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

// ── Transport event handlers ────────────────────────────────────────

async fn on_endpoint_event(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    event: EndpointEvent,
) {
    match event {
        EndpointEvent::PeerConnected { peer, info } => {
            on_peer_connected(state, pending, ctx, peer, info).await;
        }
        EndpointEvent::PeerDisconnected { peer, reason } => {
            on_peer_disconnected(state, pending, ctx, peer, reason).await;
        }
        EndpointEvent::Message { peer, payload } => match WireMessage::from_bytes(&payload) {
            Ok(message) => on_wire_message(state, pending, ctx, peer, message).await,
            Err(err) => {
                ctx.metrics.decode_failures.inc();
                debug!(peer = %peer, error = %err, "undecodable frame dropped");
            }
        },
        EndpointEvent::RttMeasured { peer, rtt_ms } => {
            state.rtts.insert(peer, rtt_ms);
        }
        EndpointEvent::HighBackPressure { peer } => {
            debug!(peer = %peer, "peer under back pressure");
        }
        EndpointEvent::LowBackPressure { peer } => {
            debug!(peer = %peer, "peer back pressure cleared");
        }
    }
}

async fn on_peer_connected(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    peer: NodeId,
    info: PeerInfo,
) {
    debug!(peer = %peer, kind = ?info.kind, "peer connected");
    state.peer_kinds.insert(peer.clone(), info.kind);
    if let Some(address) = info.address {
        state.peer_addresses.insert(peer.clone(), address);
    }
    if info.kind == PeerKind::Tracker {
        state.trackers.insert(peer.clone());
        // Report right away so the tracker can place us in its next round.
        pending.status_due.insert(peer.clone(), Instant::now());
    } else {
        let _ = ctx
            .events
            .send(NodeEvent::NodeConnected { node: peer.clone() })
            .await;
    }
    if let Some(waiters) = pending.dials.remove(&peer) {
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }
    settle_instruction_target(state, pending, ctx, &peer, true).await;
}

async fn on_peer_disconnected(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    peer: NodeId,
    reason: String,
) {
    debug!(peer = %peer, reason = %reason, "peer disconnected");
    let kind = state.peer_kinds.remove(&peer);
    state.peer_addresses.remove(&peer);
    state.rtts.remove(&peer);
    pending.disconnect_due.remove(&peer);

    if kind == Some(PeerKind::Tracker) {
        state.trackers.remove(&peer);
        pending.status_due.remove(&peer);
        // Storage lookups parked on a tracker would never answer now.
        // Resolving them empty lets the strategies fall through.
        for (_, waiters) in pending.storage_lookups.drain() {
            for waiter in waiters {
                let _ = waiter.send(Ok(Vec::new()));
            }
        }
        return;
    }

    ctx.resends.stop_resends_of_node(&peer);
    // Closing the sinks ends the relayed answers this peer was serving us.
    pending.relays.retain(|_, entry| entry.peer != peer);

    let affected = state.streams.remove_node_from_all_streams(&peer);
    for stream in &affected {
        let _ = ctx
            .events
            .send(NodeEvent::Unsubscribed {
                stream: stream.clone(),
                node: peer.clone(),
            })
            .await;
    }
    if !affected.is_empty() {
        schedule_status_all(state, pending, ctx);
    }
    let _ = ctx
        .events
        .send(NodeEvent::NodeDisconnected { node: peer.clone() })
        .await;

    settle_instruction_target(state, pending, ctx, &peer, false).await;
}

async fn on_wire_message(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    peer: NodeId,
    message: WireMessage,
) {
    if state.peer_kinds.get(&peer).copied() == Some(PeerKind::Tracker) {
        on_tracker_message(state, pending, ctx, peer, message).await;
    } else {
        on_node_message(state, pending, ctx, peer, message).await;
    }
}

// ── Node peer messages ──────────────────────────────────────────────

async fn on_node_message(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    peer: NodeId,
    message: WireMessage,
) {
    match message {
        WireMessage::Broadcast(message) => {
            on_data(state, pending, ctx, message, Some(peer)).await;
        }
        WireMessage::Unicast {
            request_id,
            message,
        } => {
            let stale = match pending.relays.get(&request_id) {
                Some(entry) => entry
                    .sink
                    .send(RelayedResendEvent::Message(message))
                    .await
                    .is_err(),
                None => {
                    debug!(peer = %peer, request_id = %request_id, "unsolicited unicast dropped");
                    false
                }
            };
            if stale {
                pending.relays.remove(&request_id);
            }
        }
        WireMessage::ResendResponse(response) => {
            on_resend_response(pending, response).await;
        }
        WireMessage::ResendRequest(request) => {
            ctx.metrics.resend_requests.inc();
            debug!(peer = %peer, request_id = %request.request_id, "resend requested");
            let answers = ctx.resends.handle_request(request.clone(), Some(peer.clone()));
            spawn_resend_answer(ctx, peer, request, answers);
        }
        _ => {
            debug!(peer = %peer, "unexpected message from node peer");
        }
    }
}

async fn on_resend_response(pending: &mut PendingWork, response: ResendResponse) {
    let request_id = response.request_id().to_owned();
    match response {
        ResendResponse::Resending { .. } => {
            let stale = match pending.relays.get(&request_id) {
                Some(entry) => entry.sink.send(RelayedResendEvent::Resending).await.is_err(),
                None => false,
            };
            if stale {
                pending.relays.remove(&request_id);
            }
        }
        ResendResponse::Resent { .. } => {
            if let Some(entry) = pending.relays.remove(&request_id) {
                let _ = entry.sink.send(RelayedResendEvent::Resent).await;
            }
        }
        ResendResponse::NoResend { .. } => {
            if let Some(entry) = pending.relays.remove(&request_id) {
                let _ = entry.sink.send(RelayedResendEvent::NoResend).await;
            }
        }
    }
}

/// Forwards one resend answer to its requester as wire messages.
fn spawn_resend_answer(
    ctx: &NodeCtx,
    peer: NodeId,
    request: ResendRequest,
    mut answers: mpsc::Receiver<StreamMessage>,
) {
    let endpoint = ctx.endpoint.clone();
    tokio::spawn(async move {
        let mut delivered = 0u64;
        while let Some(message) = answers.recv().await {
            if delivered == 0 {
                let opening = WireMessage::ResendResponse(ResendResponse::Resending {
                    request_id: request.request_id.clone(),
                    stream: request.stream.clone(),
                });
                if send_encoded(&endpoint, &peer, &opening).await.is_err() {
                    return;
                }
            }
            let unicast = WireMessage::Unicast {
                request_id: request.request_id.clone(),
                message,
            };
            if send_encoded(&endpoint, &peer, &unicast).await.is_err() {
                return;
            }
            delivered += 1;
        }
        let closing = if delivered > 0 {
            ResendResponse::Resent {
                request_id: request.request_id.clone(),
                stream: request.stream.clone(),
            }
        } else {
            ResendResponse::NoResend {
                request_id: request.request_id.clone(),
                stream: request.stream.clone(),
            }
        };
        let _ = send_encoded(&endpoint, &peer, &WireMessage::ResendResponse(closing)).await;
        debug!(request_id = %request.request_id, delivered, "resend answer sent");
    });
}

// ── Tracker messages ────────────────────────────────────────────────

async fn on_tracker_message(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    tracker: NodeId,
    message: WireMessage,
) {
    match message {
        WireMessage::Instruction(instruction) => {
            on_instruction(state, pending, ctx, tracker, instruction).await;
        }
        WireMessage::StorageNodesResponse { stream, node_ids } => {
            if let Some(waiters) = pending.storage_lookups.remove(&stream) {
                for waiter in waiters {
                    let _ = waiter.send(Ok(node_ids.clone()));
                }
            }
        }
        WireMessage::NodeAddressResponse { node, address } => {
            state.peer_addresses.insert(node.clone(), address.clone());
            if pending.dials.contains_key(&node) {
                spawn_dial(ctx, node, address);
            }
        }
        WireMessage::ErrorResponse(response) => {
            on_tracker_error(state, pending, ctx, response).await;
        }
        _ => {
            debug!(tracker = %tracker, "unexpected message from tracker");
        }
    }
}

async fn on_tracker_error(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    response: ErrorResponse,
) {
    match response.kind {
        ErrorResponseKind::UnknownPeer => {
            let node = response.target;
            debug!(node = %node, "tracker does not know the peer");
            if let Some(waiters) = pending.dials.remove(&node) {
                for waiter in waiters {
                    let _ = waiter.send(Err(NetworkError::UnknownPeer { node: node.clone() }));
                }
            }
            settle_instruction_target(state, pending, ctx, &node, false).await;
        }
    }
}

// ── Instructions ────────────────────────────────────────────────────

async fn on_instruction(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    tracker: NodeId,
    instruction: Instruction,
) {
    // Only the tracker responsible for the stream may steer it.
    let assigned = assigned_tracker(&state.trackers, &instruction.stream.key());
    if assigned != Some(&tracker) {
        warn!(
            tracker = %tracker,
            stream = %instruction.stream,
            "instruction from unassigned tracker ignored"
        );
        return;
    }
    if state.streams.is_set_up(&instruction.stream)
        && instruction.counter <= state.streams.counter(&instruction.stream)
    {
        debug!(
            stream = %instruction.stream,
            counter = instruction.counter,
            "stale instruction ignored"
        );
        return;
    }
    let next = state.throttler.add(instruction, tracker);
    pump_instructions(state, pending, ctx, next).await;
}

/// Starts queued instructions until one has to wait on dials.
async fn pump_instructions(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    mut next: Option<(Instruction, NodeId)>,
) {
    while let Some((instruction, tracker)) = next.take() {
        let stream = instruction.stream.clone();

        // An instruction can go stale while queued behind another one.
        if state.streams.is_set_up(&stream)
            && instruction.counter <= state.streams.counter(&stream)
        {
            debug!(stream = %stream, counter = instruction.counter, "discarding stale instruction");
            next = state.throttler.finish();
            continue;
        }

        if !state.streams.is_set_up(&stream) {
            state.streams.set_up_stream(stream.clone());
            schedule_status_all(state, pending, ctx);
        }

        let instructed: BTreeSet<NodeId> = instruction
            .node_ids
            .iter()
            .filter(|node| **node != ctx.local_id)
            .cloned()
            .collect();
        let current = state.streams.neighbors_of(&stream);

        // Detach neighbors the tracker no longer assigns to us.
        let dropped: Vec<NodeId> = current.difference(&instructed).cloned().collect();
        for node in &dropped {
            state.streams.remove_node_from_stream(&stream, node);
            let _ = ctx
                .events
                .send(NodeEvent::Unsubscribed {
                    stream: stream.clone(),
                    node: node.clone(),
                })
                .await;
            if !state.streams.is_node_present(node) {
                schedule_disconnect(state, pending, ctx, node);
            }
        }

        // Attach what is already connected, dial the rest.
        let mut waiting = Vec::new();
        for node in &instructed {
            if current.contains(node) {
                continue;
            }
            if ctx.endpoint.is_connected(node).await {
                attach_neighbor(state, pending, ctx, &stream, node).await;
            } else {
                waiting.push(node.clone());
            }
        }

        let mut failed = Vec::new();
        let mut pending_targets = BTreeSet::new();
        for node in waiting {
            // Both peers receive the same pairing, so exactly one of them
            // may dial: the lower id. The higher id waits for the inbound
            // connection instead of racing it with a dial of its own.
            let outcome = if ctx.local_id < node {
                ensure_dialing(state, pending, ctx, &node).await
            } else {
                await_inbound(pending, ctx, &node);
                Ok(())
            };
            match outcome {
                Ok(()) => {
                    pending_targets.insert(node);
                }
                Err(err) => {
                    debug!(node = %node, error = %err, "cannot reach instructed neighbor");
                    ctx.metrics.instruction_dial_failures.inc();
                    failed.push(node);
                }
            }
        }

        if pending_targets.is_empty() {
            state.streams.set_counter(&stream, instruction.counter);
            ctx.metrics.instructions_handled.inc();
            report_instruction_done(pending, ctx, &stream, &tracker, &failed);
            next = state.throttler.finish();
            continue;
        }

        state.current_instruction = Some(InFlightInstruction {
            stream,
            tracker,
            counter: instruction.counter,
            pending: pending_targets,
            failed,
            cancelled: false,
        });
        break;
    }
}

/// Removes a dial target from the in-flight instruction and finishes the
/// instruction once the last target settled. Safe to call for nodes that
/// are no such target.
async fn settle_instruction_target(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    node: &NodeId,
    connected: bool,
) {
    let (stream, cancelled, done) = {
        let Some(inflight) = state.current_instruction.as_mut() else {
            return;
        };
        if !inflight.pending.remove(node) {
            return;
        }
        if !connected {
            inflight.failed.push(node.clone());
        }
        (
            inflight.stream.clone(),
            inflight.cancelled,
            inflight.pending.is_empty(),
        )
    };
    if connected && !cancelled {
        attach_neighbor(state, pending, ctx, &stream, node).await;
    }
    if !connected {
        ctx.metrics.instruction_dial_failures.inc();
    }
    if done {
        complete_instruction(state, pending, ctx).await;
    }
}

async fn complete_instruction(state: &mut NodeState, pending: &mut PendingWork, ctx: &NodeCtx) {
    let Some(inflight) = state.current_instruction.take() else {
        return;
    };
    if !inflight.cancelled && state.streams.is_set_up(&inflight.stream) {
        state.streams.set_counter(&inflight.stream, inflight.counter);
    }
    ctx.metrics.instructions_handled.inc();
    report_instruction_done(pending, ctx, &inflight.stream, &inflight.tracker, &inflight.failed);
    let next = state.throttler.finish();
    pump_instructions(state, pending, ctx, next).await;
}

fn report_instruction_done(
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    stream: &StreamPartition,
    tracker: &NodeId,
    failed: &[NodeId],
) {
    if failed.is_empty() {
        debug!(stream = %stream, "instruction handled");
        schedule_status(pending, ctx, tracker);
    } else {
        warn!(
            stream = %stream,
            failed = failed.len(),
            "instruction handled with unreachable neighbors"
        );
        // Report immediately so the tracker can re-plan.
        pending.status_due.insert(tracker.clone(), Instant::now());
    }
}

/// Makes a node a neighbor on both directions of a stream and flushes
/// anything parked for it.
async fn attach_neighbor(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    stream: &StreamPartition,
    node: &NodeId,
) {
    if !state.streams.is_set_up(stream) {
        return;
    }
    state.streams.add_inbound_node(stream, node);
    state.streams.add_outbound_node(stream, node);
    pending.disconnect_due.remove(node);
    let _ = ctx
        .events
        .send(NodeEvent::Subscribed {
            stream: stream.clone(),
            node: node.clone(),
        })
        .await;
    drain_buffer(state, ctx, stream).await;
}

// ── Dialing ─────────────────────────────────────────────────────────

/// Starts connecting to a node unless a dial is already under way. When
/// the address is unknown it is looked up through a tracker first; the
/// dial then continues on the tracker's answer.
async fn ensure_dialing(
    state: &NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    node: &NodeId,
) -> Result<(), NetworkError> {
    if pending.dials.contains_key(node) {
        return Ok(());
    }
    if let Some(address) = state.peer_addresses.get(node) {
        pending.dials.insert(node.clone(), Vec::new());
        spawn_dial(ctx, node.clone(), address.clone());
        return Ok(());
    }
    let Some(tracker) = state.trackers.iter().next() else {
        return Err(NetworkError::UnknownPeer { node: node.clone() });
    };
    send_encoded(
        &ctx.endpoint,
        tracker,
        &WireMessage::NodeAddressRequest { node: node.clone() },
    )
    .await?;
    pending.dials.insert(node.clone(), Vec::new());

    // The lookup leg gets its own watchdog; a tracker that never answers
    // must not wedge the instruction.
    let internal = ctx.internal.clone();
    let lookup_timeout = ctx.config.connect_timeout;
    let node = node.clone();
    tokio::spawn(async move {
        tokio::time::sleep(lookup_timeout).await;
        let _ = internal
            .send(Internal::AddressLookupTimedOut { node })
            .await;
    });
    Ok(())
}

/// Marks a wait for the peer's own dial, bounded by the connect timeout.
/// The pending entry is resolved by `PeerConnected` like a dial would be.
fn await_inbound(pending: &mut PendingWork, ctx: &NodeCtx, node: &NodeId) {
    if pending.dials.contains_key(node) {
        return;
    }
    pending.dials.insert(node.clone(), Vec::new());
    let internal = ctx.internal.clone();
    let wait = ctx.config.connect_timeout;
    let node = node.clone();
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        let _ = internal.send(Internal::InboundWaitTimedOut { node }).await;
    });
}

fn spawn_dial(ctx: &NodeCtx, node: NodeId, address: PeerAddress) {
    let endpoint = ctx.endpoint.clone();
    let internal = ctx.internal.clone();
    let connect_timeout = ctx.config.connect_timeout;
    tokio::spawn(async move {
        let result = match timeout(connect_timeout, endpoint.connect(&address)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(NetworkError::Transport(err)),
            Err(_) => Err(NetworkError::ConnectionTimeout { node: node.clone() }),
        };
        let _ = internal.send(Internal::DialFinished { node, result }).await;
    });
}

async fn on_internal(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    message: Internal,
) {
    match message {
        Internal::DialFinished { node, result } => {
            if let Err(err) = &result {
                debug!(node = %node, error = %err, "dial failed");
            }
            let ok = result.is_ok();
            if let Some(waiters) = pending.dials.remove(&node) {
                for waiter in waiters {
                    let answer = match &result {
                        Ok(()) => Ok(()),
                        Err(err) => Err(copy_dial_error(err, &node)),
                    };
                    let _ = waiter.send(answer);
                }
            }
            // Successful dials settle through the PeerConnected event.
            if !ok {
                settle_instruction_target(state, pending, ctx, &node, false).await;
            }
        }
        Internal::AddressLookupTimedOut { node } => {
            // The answer arrived in time when the address is known now.
            if state.peer_addresses.contains_key(&node) {
                return;
            }
            let Some(waiters) = pending.dials.remove(&node) else {
                return;
            };
            debug!(node = %node, "address lookup timed out");
            for waiter in waiters {
                let _ = waiter.send(Err(NetworkError::ConnectionTimeout { node: node.clone() }));
            }
            settle_instruction_target(state, pending, ctx, &node, false).await;
        }
        Internal::InboundWaitTimedOut { node } => {
            // An entry already gone means the peer dialed us in time.
            let Some(waiters) = pending.dials.remove(&node) else {
                return;
            };
            debug!(node = %node, "peer never dialed back");
            for waiter in waiters {
                let _ = waiter.send(Err(NetworkError::ConnectionTimeout { node: node.clone() }));
            }
            settle_instruction_target(state, pending, ctx, &node, false).await;
        }
        Internal::TrackerDialDone { address, error } => {
            pending.tracker_dials.remove(&address);
            if let Some(error) = error {
                debug!(address = %address, error = %error, "tracker dial failed");
            }
        }
    }
}

fn copy_dial_error(err: &NetworkError, node: &NodeId) -> NetworkError {
    match err {
        NetworkError::ConnectionTimeout { .. } => {
            NetworkError::ConnectionTimeout { node: node.clone() }
        }
        NetworkError::UnknownPeer { .. } => NetworkError::UnknownPeer { node: node.clone() },
        other => NetworkError::DialFailed {
            node: node.clone(),
            reason: other.to_string(),
        },
    }
}

fn dial_missing_trackers(state: &NodeState, pending: &mut PendingWork, ctx: &NodeCtx) {
    let connected: HashSet<&PeerAddress> = state
        .trackers
        .iter()
        .filter_map(|tracker| state.peer_addresses.get(tracker))
        .collect();
    for address in &state.tracker_list {
        if connected.contains(address) || pending.tracker_dials.contains(address) {
            continue;
        }
        pending.tracker_dials.insert(address.clone());
        let endpoint = ctx.endpoint.clone();
        let internal = ctx.internal.clone();
        let address = address.clone();
        tokio::spawn(async move {
            let error = endpoint.connect(&address).await.err().map(|e| e.to_string());
            let _ = internal
                .send(Internal::TrackerDialDone { address, error })
                .await;
        });
    }
}

// ── Data path ───────────────────────────────────────────────────────

async fn on_data(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    message: StreamMessage,
    source: Option<NodeId>,
) {
    let stream = message.id.stream.clone();
    if !state.streams.is_set_up(&stream) {
        state.streams.set_up_stream(stream.clone());
        schedule_status_all(state, pending, ctx);
    }
    match state.streams.mark_and_check(&message.id, message.previous_ref) {
        Ok(true) => {
            ctx.metrics.unseen_messages.inc();
            let _ = ctx
                .events
                .send(NodeEvent::UnseenMessage {
                    message: message.clone(),
                    source: source.clone(),
                })
                .await;
            propagate(state, ctx, message, source).await;
        }
        Ok(false) => {
            if state.seen.contains_at(&message.id, mono_now()) {
                // Accepted earlier but never forwarded; forward it now.
                propagate(state, ctx, message, source).await;
            } else {
                ctx.metrics.duplicate_messages.inc();
                debug!(id = %message.id, "duplicate dropped");
            }
        }
        Err(err @ NetworkError::InvalidNumbering { .. }) => {
            ctx.metrics.invalid_numbering.inc();
            debug!(id = %message.id, error = %err, "message rejected");
        }
        Err(err @ NetworkError::GapMismatch { .. }) => {
            ctx.metrics.gap_mismatches.inc();
            warn!(id = %message.id, error = %err, "message rejected");
        }
        Err(err) => {
            warn!(id = %message.id, error = %err, "message rejected");
        }
    }
}

/// Sends a message to every outbound neighbor except its source. Without
/// a target the message is parked in the buffer and remembered as seen
/// but not propagated.
async fn propagate(
    state: &mut NodeState,
    ctx: &NodeCtx,
    message: StreamMessage,
    source: Option<NodeId>,
) {
    let stream = message.id.stream.clone();
    let targets: Vec<NodeId> = state
        .streams
        .outbound_nodes(&stream)
        .into_iter()
        .filter(|node| Some(node) != source.as_ref())
        .collect();

    if targets.is_empty() {
        state.seen.insert_at(message.id.clone(), mono_now());
        if state
            .buffer
            .put_at(&stream, (message, source), mono_now())
            .is_some()
        {
            ctx.metrics.buffer_evictions.inc();
        }
        ctx.metrics.buffered_messages.inc();
        return;
    }

    let bytes = match WireMessage::Broadcast(message.clone()).to_bytes() {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(id = %message.id, error = %err, "cannot encode broadcast");
            return;
        }
    };
    for node in targets {
        match ctx.endpoint.send(&node, bytes.clone()).await {
            Ok(()) => ctx.metrics.propagations.inc(),
            Err(err) => {
                ctx.metrics.propagation_failures.inc();
                debug!(node = %node, error = %err, "propagation failed");
                let _ = ctx
                    .events
                    .send(NodeEvent::PropagationFailed {
                        stream: stream.clone(),
                        node,
                    })
                    .await;
            }
        }
    }
    state.seen.remove(&message.id);
}

async fn drain_buffer(state: &mut NodeState, ctx: &NodeCtx, stream: &StreamPartition) {
    let parked = state.buffer.pop_all(stream);
    if parked.is_empty() {
        return;
    }
    debug!(stream = %stream, count = parked.len(), "draining buffered messages");
    for (message, source) in parked {
        propagate(state, ctx, message, source).await;
    }
}

// ── Application commands ────────────────────────────────────────────

async fn on_command(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    cmd: NodeCommand,
) {
    match cmd {
        NodeCommand::Subscribe { stream } => {
            if !state.streams.is_set_up(&stream) {
                state.streams.set_up_stream(stream.clone());
                info!(stream = %stream, "subscribed");
                schedule_status_all(state, pending, ctx);
            }
        }
        NodeCommand::Unsubscribe { stream } => {
            unsubscribe(state, pending, ctx, &stream).await;
        }
        NodeCommand::Publish { message } => {
            on_data(state, pending, ctx, message, None).await;
        }
        NodeCommand::Resend { request, reply } => {
            let answers = ctx.resends.handle_request(request, None);
            let _ = reply.send(answers);
        }
        NodeCommand::AddTracker { address } => {
            if !state.tracker_list.contains(&address) {
                state.tracker_list.push(address);
            }
            dial_missing_trackers(state, pending, ctx);
        }
        NodeCommand::GetNeighbors { stream, reply } => {
            let neighbors = if state.streams.is_set_up(&stream) {
                state.streams.neighbors_of(&stream).into_iter().collect()
            } else {
                Vec::new()
            };
            let _ = reply.send(neighbors);
        }
        NodeCommand::GetSubscriptions { reply } => {
            let mut streams: Vec<StreamPartition> = state.streams.streams().cloned().collect();
            streams.sort();
            let _ = reply.send(streams);
        }
        NodeCommand::GetMetrics { reply } => {
            let _ = reply.send(ctx.metrics.registry.snapshot());
        }
        // Intercepted by the event loop.
        NodeCommand::Shutdown => {}
    }
}

async fn unsubscribe(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    stream: &StreamPartition,
) {
    if !state.streams.is_set_up(stream) {
        return;
    }
    state.throttler.remove_stream(stream);
    if let Some(inflight) = state.current_instruction.as_mut() {
        if inflight.stream == *stream {
            inflight.cancelled = true;
        }
    }
    let parked = state.buffer.clear(stream);
    if parked > 0 {
        debug!(stream = %stream, parked, "dropped buffered messages");
    }
    let neighbors = state.streams.neighbors_of(stream);
    state.streams.remove_stream(stream);
    for node in neighbors {
        let _ = ctx
            .events
            .send(NodeEvent::Unsubscribed {
                stream: stream.clone(),
                node: node.clone(),
            })
            .await;
        if !state.streams.is_node_present(&node) {
            schedule_disconnect(state, pending, ctx, &node);
        }
    }
    info!(stream = %stream, "unsubscribed");
    schedule_status_all(state, pending, ctx);
}

// ── Resend relay requests ───────────────────────────────────────────

async fn on_relay_request(
    state: &mut NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    request: RelayRequest,
) {
    match request {
        RelayRequest::Candidates { stream, reply } => {
            let candidates = if state.streams.is_set_up(&stream) {
                state.streams.neighbors_of(&stream).into_iter().collect()
            } else {
                Vec::new()
            };
            let _ = reply.send(candidates);
        }
        RelayRequest::OpenRelay {
            peer,
            request,
            reply,
        } => {
            let (sink, events) = mpsc::channel(RELAY_BUFFER);
            let message = WireMessage::ResendRequest(request.clone());
            match send_encoded(&ctx.endpoint, &peer, &message).await {
                Ok(()) => {
                    pending
                        .relays
                        .insert(request.request_id.clone(), OpenRelayEntry { peer, sink });
                    let _ = reply.send(Ok(events));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            }
        }
        RelayRequest::FindStorageNodes { stream, reply } => {
            let Some(tracker) = assigned_tracker(&state.trackers, &stream.key()) else {
                let _ = reply.send(Ok(Vec::new()));
                return;
            };
            let tracker = tracker.clone();
            let message = WireMessage::StorageNodesRequest {
                stream: stream.clone(),
            };
            match send_encoded(&ctx.endpoint, &tracker, &message).await {
                Ok(()) => {
                    pending.storage_lookups.entry(stream).or_default().push(reply);
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            }
        }
        RelayRequest::EnsureConnected { node, reply } => {
            if ctx.endpoint.is_connected(&node).await {
                let _ = reply.send(Ok(()));
                return;
            }
            match ensure_dialing(state, pending, ctx, &node).await {
                Ok(()) => {
                    pending.dials.entry(node).or_default().push(reply);
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }
}

// ── Statuses and disconnect grace ───────────────────────────────────

fn schedule_status(pending: &mut PendingWork, ctx: &NodeCtx, tracker: &NodeId) {
    // Debounce: re-triggering pushes the deadline out.
    pending
        .status_due
        .insert(tracker.clone(), Instant::now() + ctx.config.status_debounce);
}

fn schedule_status_all(state: &NodeState, pending: &mut PendingWork, ctx: &NodeCtx) {
    for tracker in &state.trackers {
        schedule_status(pending, ctx, tracker);
    }
}

async fn flush_due_statuses(state: &NodeState, pending: &mut PendingWork, ctx: &NodeCtx) {
    let now = Instant::now();
    let due: Vec<NodeId> = pending
        .status_due
        .iter()
        .filter(|(_, at)| **at <= now)
        .map(|(tracker, _)| tracker.clone())
        .collect();
    for tracker in due {
        pending.status_due.remove(&tracker);
        let status = build_status(state, ctx);
        match send_encoded(&ctx.endpoint, &tracker, &WireMessage::Status(Box::new(status))).await {
            Ok(()) => ctx.metrics.statuses_sent.inc(),
            Err(err) => debug!(tracker = %tracker, error = %err, "status send failed"),
        }
    }
}

fn build_status(state: &NodeState, ctx: &NodeCtx) -> Status {
    let mut streams = BTreeMap::new();
    for (stream, entry) in state.streams.entries() {
        streams.insert(
            stream.clone(),
            StreamStatus {
                inbound_nodes: entry.inbound().iter().cloned().collect(),
                outbound_nodes: entry.outbound().iter().cloned().collect(),
                counter: entry.counter(),
            },
        );
    }
    Status {
        streams,
        rtts: state.rtts.clone(),
        location: ctx.config.location.clone(),
        started: state.started,
    }
}

fn schedule_disconnect(
    state: &NodeState,
    pending: &mut PendingWork,
    ctx: &NodeCtx,
    node: &NodeId,
) {
    let Some(kind) = state.peer_kinds.get(node) else {
        return;
    };
    if *kind == PeerKind::Tracker {
        return;
    }
    // Keep the earliest deadline when rescheduled.
    pending
        .disconnect_due
        .entry(node.clone())
        .or_insert_with(|| Instant::now() + ctx.config.disconnection_wait);
}

async fn flush_due_disconnects(state: &NodeState, pending: &mut PendingWork, ctx: &NodeCtx) {
    let now = Instant::now();
    let due: Vec<NodeId> = pending
        .disconnect_due
        .iter()
        .filter(|(_, at)| **at <= now)
        .map(|(node, _)| node.clone())
        .collect();
    for node in due {
        pending.disconnect_due.remove(&node);
        if state.streams.is_node_present(&node) {
            // Regained a shared stream within the grace period.
            continue;
        }
        debug!(node = %node, "dropping connection without shared streams");
        let _ = ctx.endpoint.disconnect(&node, "no shared streams").await;
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

async fn send_encoded(
    endpoint: &Endpoint,
    peer: &NodeId,
    message: &WireMessage,
) -> Result<(), NetworkError> {
    let bytes = message.to_bytes()?;
    endpoint.send(peer, bytes).await.map_err(Into::into)
}

/// Deterministically maps a key onto one of the connected trackers, so
/// every node agrees which tracker owns which stream partition.
fn assigned_tracker<'a>(trackers: &'a BTreeSet<NodeId>, key: &str) -> Option<&'a NodeId> {
    if trackers.is_empty() {
        return None;
    }
    let hash = key
        .bytes()
        .fold(0u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)));
    trackers.iter().nth((hash % trackers.len() as u64) as usize)
}

fn mono_now() -> std::time::Instant {
    Instant::now().into_std()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
