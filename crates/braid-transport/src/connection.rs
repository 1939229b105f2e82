//! Per-peer connection actor.
//!
//! Each established peer link runs one [`ConnectionActor`] task. The actor
//! owns the outbound [`MessageQueue`] and the channel event stream, and is the
//! only place that touches the sink. Delivery semantics:
//!
//! * messages drain strictly in enqueue order, retries included
//! * a failed head is retried after a fixed delay, up to `max_send_tries`
//! * when buffered bytes cross the high watermark the drain pauses until the
//!   channel reports the low watermark again
//! * pings run on a fixed interval; missing too many pongs closes the link

use crate::channel::{ChannelEvent, ChannelSink};
use crate::endpoint::EndpointEvent;
use crate::queue::MessageQueue;
use crate::{EndpointConfig, Frame, NodeId, TransportError};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

pub(crate) type SendReply = oneshot::Sender<Result<(), TransportError>>;

pub(crate) enum ConnCommand {
    Send {
        payload: Bytes,
        reply: Option<SendReply>,
    },
    Close {
        reason: String,
    },
}

pub(crate) struct ConnectionActor {
    peer: NodeId,
    sink: Box<dyn ChannelSink>,
    channel_events: mpsc::Receiver<ChannelEvent>,
    commands: mpsc::Receiver<ConnCommand>,
    events: mpsc::Sender<EndpointEvent>,
    config: EndpointConfig,
}

impl ConnectionActor {
    pub(crate) fn new(
        peer: NodeId,
        sink: Box<dyn ChannelSink>,
        channel_events: mpsc::Receiver<ChannelEvent>,
        commands: mpsc::Receiver<ConnCommand>,
        events: mpsc::Sender<EndpointEvent>,
        config: EndpointConfig,
    ) -> Self {
        Self {
            peer,
            sink,
            channel_events,
            commands,
            events,
            config,
        }
    }

    /// Runs until the link closes, for whatever reason. Returns the close
    /// reason. Messages still queued at that point are dropped without
    /// resolving their delivery receipts.
    pub(crate) async fn run(self) -> String {
        let ConnectionActor {
            peer,
            sink,
            mut channel_events,
            mut commands,
            events,
            config,
        } = self;

        let mut queue = MessageQueue::new(config.queue_max_size);
        let mut paused = false;
        let mut retry_at: Option<Instant> = None;
        let mut ping_attempts: u32 = 0;
        let mut rtt_start: Option<Instant> = None;

        let mut ping_timer = tokio::time::interval(config.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so pings start one
        // interval after establishment.
        ping_timer.tick().await;

        let close_reason = loop {
            tokio::select! {
                maybe_cmd = commands.recv() => match maybe_cmd {
                    Some(ConnCommand::Send { payload, reply }) => {
                        if let Some(evicted) = queue.add(payload, reply) {
                            let tries = evicted.tries();
                            tracing::warn!(peer = %peer, "outbound queue full, dropping oldest message");
                            evicted.resolve(Err(TransportError::SendFailed {
                                peer: peer.clone(),
                                tries,
                            }));
                        }
                        flush_outbound(
                            sink.as_ref(), &mut queue, &mut paused, &mut retry_at,
                            &events, &peer, &config,
                        )
                        .await;
                    }
                    Some(ConnCommand::Close { reason }) => break reason,
                    // The endpoint dropped its handle to this link.
                    None => break "connection dropped".to_string(),
                },

                maybe_event = channel_events.recv() => match maybe_event {
                    Some(ChannelEvent::Message(data)) => {
                        if let Some(reason) = handle_inbound_frame(
                            data, sink.as_ref(), &peer, &events,
                            &mut ping_attempts, &rtt_start,
                        )
                        .await
                        {
                            break reason;
                        }
                    }
                    Some(ChannelEvent::BufferLow) => {
                        if paused {
                            paused = false;
                            let _ = events.try_send(EndpointEvent::LowBackPressure {
                                peer: peer.clone(),
                            });
                            flush_outbound(
                                sink.as_ref(), &mut queue, &mut paused, &mut retry_at,
                                &events, &peer, &config,
                            )
                            .await;
                        }
                    }
                    Some(ChannelEvent::Closed { reason }) => break reason,
                    None => break "channel event stream ended".to_string(),
                },

                _ = sleep_until_opt(retry_at), if retry_at.is_some() => {
                    retry_at = None;
                    flush_outbound(
                        sink.as_ref(), &mut queue, &mut paused, &mut retry_at,
                        &events, &peer, &config,
                    )
                    .await;
                }

                _ = ping_timer.tick() => {
                    if ping_attempts >= config.max_ping_pong_attempts {
                        break "pong not received".to_string();
                    }
                    rtt_start = Some(Instant::now());
                    match Frame::Ping.encode() {
                        Ok(frame) => {
                            if let Err(e) = sink.send(frame).await {
                                tracing::debug!(peer = %peer, "ping send failed: {e}");
                            }
                        }
                        Err(e) => tracing::warn!(peer = %peer, "ping encode failed: {e}"),
                    }
                    ping_attempts += 1;
                }
            }
        };

        sink.close(&close_reason).await;
        tracing::debug!(peer = %peer, reason = %close_reason, "connection closed");
        close_reason
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Drains the queue head by head until it is empty, the drain pauses on the
/// high watermark, or a send failure schedules a retry.
async fn flush_outbound(
    sink: &dyn ChannelSink,
    queue: &mut MessageQueue,
    paused: &mut bool,
    retry_at: &mut Option<Instant>,
    events: &mpsc::Sender<EndpointEvent>,
    peer: &NodeId,
    config: &EndpointConfig,
) {
    loop {
        if queue.is_empty() || *paused || retry_at.is_some() {
            return;
        }
        if sink.buffered_amount() >= config.buffer_high {
            *paused = true;
            let _ = events.try_send(EndpointEvent::HighBackPressure { peer: peer.clone() });
            return;
        }

        let (size, payload) = match queue.peek() {
            Some(item) => (item.payload().len(), item.payload().clone()),
            None => return,
        };

        // Oversized messages can never go through; fail them without retries.
        if size > sink.max_frame_size() {
            if let Some(item) = queue.pop() {
                item.resolve(Err(TransportError::MessageTooLarge {
                    size,
                    max: sink.max_frame_size(),
                }));
            }
            continue;
        }

        match sink.send(payload).await {
            Ok(()) => {
                if let Some(item) = queue.pop() {
                    item.resolve(Ok(()));
                }
            }
            Err(e) => {
                tracing::debug!(peer = %peer, "send attempt failed: {e}");
                if let Some(tries) = queue.bump_head_tries() {
                    if tries >= config.max_send_tries {
                        if let Some(item) = queue.pop() {
                            tracing::warn!(
                                peer = %peer,
                                tries,
                                "dropping message after repeated send failures"
                            );
                            item.resolve(Err(TransportError::SendFailed {
                                peer: peer.clone(),
                                tries,
                            }));
                        }
                    }
                }
                *retry_at = Some(Instant::now() + config.retry_delay);
                return;
            }
        }
    }
}

/// Returns `Some(reason)` when the frame means the connection must close.
async fn handle_inbound_frame(
    data: Bytes,
    sink: &dyn ChannelSink,
    peer: &NodeId,
    events: &mpsc::Sender<EndpointEvent>,
    ping_attempts: &mut u32,
    rtt_start: &Option<Instant>,
) -> Option<String> {
    match Frame::decode(&data) {
        Ok(Frame::Payload(payload)) => {
            let delivered = events
                .send(EndpointEvent::Message {
                    peer: peer.clone(),
                    payload: Bytes::from(payload),
                })
                .await;
            if delivered.is_err() {
                return Some("endpoint event channel closed".to_string());
            }
            None
        }
        Ok(Frame::Ping) => {
            match Frame::Pong.encode() {
                Ok(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        tracing::debug!(peer = %peer, "pong send failed: {e}");
                    }
                }
                Err(e) => tracing::warn!(peer = %peer, "pong encode failed: {e}"),
            }
            None
        }
        Ok(Frame::Pong) => {
            *ping_attempts = 0;
            if let Some(start) = rtt_start {
                let _ = events.try_send(EndpointEvent::RttMeasured {
                    peer: peer.clone(),
                    rtt_ms: start.elapsed().as_millis() as u64,
                });
            }
            None
        }
        Ok(Frame::Handshake(_)) => {
            tracing::warn!(peer = %peer, "unexpected handshake frame on established link");
            None
        }
        Err(e) => {
            tracing::warn!(peer = %peer, "dropping undecodable frame: {e}");
            None
        }
    }
}
