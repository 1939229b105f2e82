//! The endpoint: one listening socket plus one actor per established peer.
//!
//! Channels start anonymous. The dialer sends a [`Handshake`] frame naming
//! itself, the acceptor answers with its own, and only then does either side
//! register the link and start a [`ConnectionActor`](crate::connection) for
//! it. Links are keyed by [`NodeId`]; a second channel to an already linked
//! peer is closed on sight and the established link kept.

use crate::channel::{ChannelEvent, ChannelFactory, ChannelHandle, ChannelListener};
use crate::connection::{ConnCommand, ConnectionActor};
use crate::tcp::{TcpChannelFactory, TcpChannelListener};
use crate::{EndpointConfig, Frame, Handshake, NodeId, PeerAddress, PeerInfo, TransportError};

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

const CMD_BUFFER: usize = 64;

/// Everything an endpoint reports to its owner.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    PeerConnected { peer: NodeId, info: PeerInfo },
    PeerDisconnected { peer: NodeId, reason: String },
    Message { peer: NodeId, payload: Bytes },
    HighBackPressure { peer: NodeId },
    LowBackPressure { peer: NodeId },
    RttMeasured { peer: NodeId, rtt_ms: u64 },
}

struct PeerLink {
    commands: mpsc::Sender<ConnCommand>,
    info: PeerInfo,
}

struct EndpointInner {
    local: PeerInfo,
    config: EndpointConfig,
    factory: Box<dyn ChannelFactory>,
    links: Mutex<HashMap<NodeId, PeerLink>>,
    events: mpsc::Sender<EndpointEvent>,
}

/// Owns the accept loop and the per-peer connection actors.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    local_address: PeerAddress,
    accept_task: JoinHandle<()>,
}

impl Endpoint {
    /// Starts an endpoint on an already bound listener. The returned receiver
    /// carries every [`EndpointEvent`]; dropping it eventually closes all
    /// connections as their actors fail to deliver.
    pub fn start(
        local: PeerInfo,
        listener: Box<dyn ChannelListener>,
        factory: Box<dyn ChannelFactory>,
        config: EndpointConfig,
    ) -> (Self, mpsc::Receiver<EndpointEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let local_address = listener.local_address();
        let inner = Arc::new(EndpointInner {
            local,
            config,
            factory,
            links: Mutex::new(HashMap::new()),
            events: event_tx,
        });
        let accept_task = tokio::spawn(accept_loop(inner.clone(), listener));
        (
            Self {
                inner,
                local_address,
                accept_task,
            },
            event_rx,
        )
    }

    /// Binds a TCP listener and starts an endpoint on it. When `local`
    /// carries no advertised address it is filled in with the resolved bind
    /// address, so peers learn where to dial back.
    pub async fn bind_tcp(
        mut local: PeerInfo,
        bind_address: &PeerAddress,
        config: EndpointConfig,
    ) -> Result<(Self, mpsc::Receiver<EndpointEvent>), TransportError> {
        let tuning = config.channel_tuning();
        let listener = TcpChannelListener::bind(bind_address, tuning).await?;
        if local.address.is_none() {
            local.address = Some(listener.local_address());
        }
        let factory = TcpChannelFactory::new(tuning);
        Ok(Self::start(
            local,
            Box::new(listener),
            Box::new(factory),
            config,
        ))
    }

    pub fn local_info(&self) -> &PeerInfo {
        &self.inner.local
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.inner.local.node_id
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    /// Dials, handshakes, and registers the peer. Returns the peer's id, also
    /// when a link to it already existed.
    pub async fn connect(&self, address: &PeerAddress) -> Result<NodeId, TransportError> {
        let attempt = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            dial_handshake(&self.inner, address),
        )
        .await;
        match attempt {
            Ok(Ok((handle, info))) => {
                let peer = info.node_id.clone();
                register(&self.inner, handle, info).await;
                Ok(peer)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::ConnectTimeout {
                address: address.clone(),
            }),
        }
    }

    /// Fire-and-forget send. Delivery failures surface only in logs and, when
    /// the link dies, as a `PeerDisconnected` event.
    pub async fn send(&self, peer: &NodeId, payload: Bytes) -> Result<(), TransportError> {
        let commands = self.link_commands(peer).await?;
        commands
            .send(ConnCommand::Send {
                payload,
                reply: None,
            })
            .await
            .map_err(|_| TransportError::NotConnected(peer.clone()))
    }

    /// Send with a delivery receipt. The receiver resolves once the payload
    /// is handed to the wire, or errs when it is dropped. A closed connection
    /// drops pending receipts without resolving them.
    pub async fn send_tracked(
        &self,
        peer: &NodeId,
        payload: Bytes,
    ) -> Result<oneshot::Receiver<Result<(), TransportError>>, TransportError> {
        let commands = self.link_commands(peer).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands
            .send(ConnCommand::Send {
                payload,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| TransportError::NotConnected(peer.clone()))?;
        Ok(reply_rx)
    }

    pub async fn disconnect(&self, peer: &NodeId, reason: &str) -> Result<(), TransportError> {
        let commands = self.link_commands(peer).await?;
        commands
            .send(ConnCommand::Close {
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| TransportError::NotConnected(peer.clone()))
    }

    pub async fn is_connected(&self, peer: &NodeId) -> bool {
        self.inner.links.lock().await.contains_key(peer)
    }

    pub async fn connected_peers(&self) -> Vec<NodeId> {
        self.inner.links.lock().await.keys().cloned().collect()
    }

    pub async fn peer_info(&self, peer: &NodeId) -> Option<PeerInfo> {
        self.inner.links.lock().await.get(peer).map(|l| l.info.clone())
    }

    /// Stops accepting and closes every link. Connection actors emit their
    /// `PeerDisconnected` events before the event stream ends.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        let commands: Vec<mpsc::Sender<ConnCommand>> = {
            let links = self.inner.links.lock().await;
            links.values().map(|l| l.commands.clone()).collect()
        };
        for link in commands {
            let _ = link
                .send(ConnCommand::Close {
                    reason: "endpoint shutting down".to_string(),
                })
                .await;
        }
    }

    async fn link_commands(
        &self,
        peer: &NodeId,
    ) -> Result<mpsc::Sender<ConnCommand>, TransportError> {
        self.inner
            .links
            .lock()
            .await
            .get(peer)
            .map(|l| l.commands.clone())
            .ok_or_else(|| TransportError::NotConnected(peer.clone()))
    }
}

async fn accept_loop(inner: Arc<EndpointInner>, mut listener: Box<dyn ChannelListener>) {
    while let Some(handle) = listener.accept().await {
        tracing::debug!(remote = %handle.remote_address, "accepted channel");
        tokio::spawn(accept_handshake(inner.clone(), handle));
    }
    tracing::debug!("listener closed, accept loop ending");
}

/// Acceptor side of the handshake: wait for the dialer to name itself,
/// answer with our own identity, then register.
async fn accept_handshake(inner: Arc<EndpointInner>, mut handle: ChannelHandle) {
    let remote = handle.remote_address.clone();
    let waited = tokio::time::timeout(
        inner.config.handshake_timeout,
        recv_handshake(&mut handle, &remote),
    )
    .await;
    let info = match waited {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            tracing::warn!(remote = %remote, "handshake failed: {e}");
            handle.sink.close("handshake failed").await;
            return;
        }
        Err(_) => {
            tracing::warn!(remote = %remote, "handshake timed out");
            handle.sink.close("handshake timeout").await;
            return;
        }
    };

    let reply = Handshake {
        peer: inner.local.clone(),
    };
    let sent = match Frame::Handshake(reply).encode() {
        Ok(frame) => handle.sink.send(frame).await,
        Err(e) => Err(e),
    };
    if let Err(e) = sent {
        tracing::warn!(remote = %remote, "handshake reply failed: {e}");
        handle.sink.close("handshake failed").await;
        return;
    }

    register(&inner, handle, info).await;
}

/// Dialer side: open the channel, name ourselves, wait for the peer's answer.
async fn dial_handshake(
    inner: &Arc<EndpointInner>,
    address: &PeerAddress,
) -> Result<(ChannelHandle, PeerInfo), TransportError> {
    let mut handle = inner.factory.connect(address).await?;
    let hello = Handshake {
        peer: inner.local.clone(),
    };
    handle.sink.send(Frame::Handshake(hello).encode()?).await?;
    let info = recv_handshake(&mut handle, address).await?;
    Ok((handle, info))
}

async fn recv_handshake(
    handle: &mut ChannelHandle,
    remote: &PeerAddress,
) -> Result<PeerInfo, TransportError> {
    loop {
        match handle.events.recv().await {
            Some(ChannelEvent::Message(data)) => match Frame::decode(&data) {
                Ok(Frame::Handshake(h)) => return Ok(h.peer),
                Ok(_) => continue,
                Err(e) => {
                    return Err(TransportError::Handshake {
                        address: remote.clone(),
                        reason: e.to_string(),
                    })
                }
            },
            Some(ChannelEvent::BufferLow) => continue,
            Some(ChannelEvent::Closed { reason }) => {
                return Err(TransportError::Handshake {
                    address: remote.clone(),
                    reason,
                })
            }
            None => {
                return Err(TransportError::Handshake {
                    address: remote.clone(),
                    reason: "channel closed before handshake".to_string(),
                })
            }
        }
    }
}

/// Registers the link and spawns its actor. A link to the peer already in
/// place wins; the new channel is closed.
async fn register(inner: &Arc<EndpointInner>, handle: ChannelHandle, info: PeerInfo) {
    let peer = info.node_id.clone();
    if peer == inner.local.node_id {
        tracing::warn!(peer = %peer, "refusing connection to self");
        handle.sink.close("connection to self").await;
        return;
    }

    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_BUFFER);
    {
        let mut links = inner.links.lock().await;
        if links.contains_key(&peer) {
            drop(links);
            tracing::debug!(peer = %peer, "duplicate connection, keeping the established link");
            handle.sink.close("duplicate connection").await;
            return;
        }
        links.insert(
            peer.clone(),
            PeerLink {
                commands: cmd_tx.clone(),
                info: info.clone(),
            },
        );
    }

    tracing::debug!(peer = %peer, "peer connected");
    let _ = inner
        .events
        .send(EndpointEvent::PeerConnected {
            peer: peer.clone(),
            info,
        })
        .await;

    let actor = ConnectionActor::new(
        peer.clone(),
        handle.sink,
        handle.events,
        cmd_rx,
        inner.events.clone(),
        inner.config.clone(),
    );
    let inner = inner.clone();
    tokio::spawn(async move {
        let reason = actor.run().await;
        {
            let mut links = inner.links.lock().await;
            let ours = links
                .get(&peer)
                .is_some_and(|link| link.commands.same_channel(&cmd_tx));
            if ours {
                links.remove(&peer);
            }
        }
        let _ = inner
            .events
            .send(EndpointEvent::PeerDisconnected { peer, reason })
            .await;
    });
}
