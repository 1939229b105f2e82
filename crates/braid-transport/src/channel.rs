//! The opaque duplex channel seam.
//!
//! A channel moves whole frames between two endpoints and reports
//! `message`/`buffer-low`/`closed` events; everything above it (queueing,
//! retries, watermark pausing, ping/pong) lives in the connection layer.
//! Production uses the TCP implementation in [`crate::tcp`]; tests and local
//! simulations use [`memory`].

use crate::{PeerAddress, TransportError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Events surfaced by a channel to the connection that owns it.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One inbound frame.
    Message(Bytes),
    /// The outbound buffer drained below the low watermark.
    BufferLow,
    /// The channel is gone; no further events follow.
    Closed { reason: String },
}

/// Outbound half of a duplex channel. `send` resolves once the transport has
/// accepted the frame into its buffer, not when the peer has read it.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Bytes accepted but not yet flushed to the wire.
    fn buffered_amount(&self) -> usize;

    fn max_frame_size(&self) -> usize;

    /// Idempotent. The peer observes a `Closed` event.
    async fn close(&self, reason: &str);
}

/// One freshly opened channel: its sink plus the event stream feeding the
/// owning connection.
pub struct ChannelHandle {
    pub remote_address: PeerAddress,
    pub sink: Box<dyn ChannelSink>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("remote_address", &self.remote_address)
            .finish()
    }
}

/// Dials outbound channels.
#[async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    async fn connect(&self, address: &PeerAddress) -> Result<ChannelHandle, TransportError>;
}

/// Accepts inbound channels.
#[async_trait]
pub trait ChannelListener: Send + 'static {
    /// Next inbound channel; `None` once the listener is gone.
    async fn accept(&mut self) -> Option<ChannelHandle>;

    fn local_address(&self) -> PeerAddress;
}

pub mod memory {
    //! In-memory channels: a process-local network keyed by address. Frames
    //! are delivered immediately, so `buffered_amount` is always zero and
    //! buffer-low is never signalled; watermark behavior is exercised against
    //! fake sinks in the connection tests instead.

    use super::*;
    use crate::ChannelTuning;

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    const EVENT_BUFFER: usize = 256;

    type AcceptorMap = Arc<Mutex<HashMap<PeerAddress, mpsc::Sender<ChannelHandle>>>>;

    /// A named in-process network. Clone shares the same address space.
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        acceptors: AcceptorMap,
        tuning: ChannelTuning,
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_tuning(tuning: ChannelTuning) -> Self {
            Self {
                acceptors: Arc::default(),
                tuning,
            }
        }

        /// Register a listener at `address`, replacing any previous one.
        pub fn listen(&self, address: &PeerAddress) -> MemoryListener {
            let (tx, rx) = mpsc::channel(16);
            self.acceptors
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(address.clone(), tx);
            MemoryListener {
                address: address.clone(),
                incoming: rx,
            }
        }

        pub fn factory(&self) -> MemoryChannelFactory {
            MemoryChannelFactory {
                acceptors: self.acceptors.clone(),
                tuning: self.tuning,
            }
        }
    }

    pub struct MemoryChannelFactory {
        acceptors: AcceptorMap,
        tuning: ChannelTuning,
    }

    #[async_trait]
    impl ChannelFactory for MemoryChannelFactory {
        async fn connect(&self, address: &PeerAddress) -> Result<ChannelHandle, TransportError> {
            let acceptor = {
                let acceptors = self.acceptors.lock().unwrap_or_else(|e| e.into_inner());
                acceptors.get(address).cloned()
            };
            let acceptor = acceptor.ok_or_else(|| TransportError::Connect {
                address: address.clone(),
                reason: "no listener at address".into(),
            })?;

            let (dialer, accepted) = pair(address.clone(), self.tuning.max_frame_size);
            acceptor
                .send(accepted)
                .await
                .map_err(|_| TransportError::Connect {
                    address: address.clone(),
                    reason: "listener is gone".into(),
                })?;
            Ok(dialer)
        }
    }

    pub struct MemoryListener {
        address: PeerAddress,
        incoming: mpsc::Receiver<ChannelHandle>,
    }

    #[async_trait]
    impl ChannelListener for MemoryListener {
        async fn accept(&mut self) -> Option<ChannelHandle> {
            self.incoming.recv().await
        }

        fn local_address(&self) -> PeerAddress {
            self.address.clone()
        }
    }

    struct MemorySink {
        to_peer: mpsc::Sender<ChannelEvent>,
        to_self: mpsc::Sender<ChannelEvent>,
        closed: Arc<AtomicBool>,
        max_frame_size: usize,
    }

    #[async_trait]
    impl ChannelSink for MemorySink {
        async fn send(&self, data: Bytes) -> Result<(), TransportError> {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::ChannelClosed("memory channel closed".into()));
            }
            if data.len() > self.max_frame_size {
                return Err(TransportError::MessageTooLarge {
                    size: data.len(),
                    max: self.max_frame_size,
                });
            }
            self.to_peer
                .send(ChannelEvent::Message(data))
                .await
                .map_err(|_| TransportError::ChannelClosed("peer is gone".into()))
        }

        fn buffered_amount(&self) -> usize {
            0
        }

        fn max_frame_size(&self) -> usize {
            self.max_frame_size
        }

        async fn close(&self, reason: &str) {
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let _ = self
                .to_peer
                .send(ChannelEvent::Closed {
                    reason: reason.to_string(),
                })
                .await;
            let _ = self
                .to_self
                .send(ChannelEvent::Closed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Build the two connected ends of one channel.
    fn pair(dialed_address: PeerAddress, max_frame_size: usize) -> (ChannelHandle, ChannelHandle) {
        let (a_tx, a_rx) = mpsc::channel(EVENT_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(EVENT_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));

        let dialer = ChannelHandle {
            remote_address: dialed_address.clone(),
            sink: Box::new(MemorySink {
                to_peer: b_tx.clone(),
                to_self: a_tx.clone(),
                closed: closed.clone(),
                max_frame_size,
            }),
            events: a_rx,
        };
        let accepted = ChannelHandle {
            remote_address: PeerAddress::new(format!("memory-dialer->{dialed_address}")),
            sink: Box::new(MemorySink {
                to_peer: a_tx,
                to_self: b_tx,
                closed,
                max_frame_size,
            }),
            events: b_rx,
        };
        (dialer, accepted)
    }
}
