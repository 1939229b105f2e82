//! TCP channels: length-prefixed frames over a socket, with a writer task
//! that tracks buffered bytes for watermark signalling and a reader task that
//! surfaces frames and close reasons as [`ChannelEvent`]s.

use crate::channel::{ChannelEvent, ChannelFactory, ChannelHandle, ChannelListener, ChannelSink};
use crate::frame::{read_framed, write_framed};
use crate::{ChannelTuning, PeerAddress, TransportError};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const EVENT_BUFFER: usize = 256;
const WRITER_BUFFER: usize = 64;

pub struct TcpChannelFactory {
    tuning: ChannelTuning,
}

impl TcpChannelFactory {
    pub fn new(tuning: ChannelTuning) -> Self {
        Self { tuning }
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn connect(&self, address: &PeerAddress) -> Result<ChannelHandle, TransportError> {
        let stream = TcpStream::connect(address.as_str()).await.map_err(|e| {
            TransportError::Connect {
                address: address.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(spawn_channel(stream, address.clone(), self.tuning))
    }
}

pub struct TcpChannelListener {
    address: PeerAddress,
    listener: TcpListener,
    tuning: ChannelTuning,
}

impl TcpChannelListener {
    pub async fn bind(address: &PeerAddress, tuning: ChannelTuning) -> Result<Self, TransportError> {
        let listener =
            TcpListener::bind(address.as_str())
                .await
                .map_err(|e| TransportError::Bind {
                    address: address.clone(),
                    source: e,
                })?;
        // Resolve ":0" style binds to the actual port.
        let address = listener
            .local_addr()
            .map(|a| PeerAddress::new(a.to_string()))
            .unwrap_or_else(|_| address.clone());
        Ok(Self {
            address,
            listener,
            tuning,
        })
    }
}

#[async_trait]
impl ChannelListener for TcpChannelListener {
    async fn accept(&mut self) -> Option<ChannelHandle> {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    return Some(spawn_channel(
                        stream,
                        PeerAddress::new(remote.to_string()),
                        self.tuning,
                    ));
                }
                Err(e) => {
                    // Transient (EMFILE and friends); keep accepting.
                    tracing::warn!("tcp accept failed: {e}");
                }
            }
        }
    }

    fn local_address(&self) -> PeerAddress {
        self.address.clone()
    }
}

fn spawn_channel(
    stream: TcpStream,
    remote_address: PeerAddress,
    tuning: ChannelTuning,
) -> ChannelHandle {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (write_tx, write_rx) = mpsc::channel(WRITER_BUFFER);
    let buffered = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));

    tokio::spawn(reader_task(
        read_half,
        event_tx.clone(),
        tuning.max_frame_size,
        closed.clone(),
    ));
    tokio::spawn(writer_task(
        write_half,
        write_rx,
        buffered.clone(),
        event_tx,
        tuning.buffer_low,
    ));

    ChannelHandle {
        remote_address,
        sink: Box::new(TcpSink {
            write_tx,
            buffered,
            closed,
            max_frame_size: tuning.max_frame_size,
        }),
        events: event_rx,
    }
}

struct TcpSink {
    write_tx: mpsc::Sender<WriterCmd>,
    buffered: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    max_frame_size: usize,
}

enum WriterCmd {
    Frame(Bytes),
    Shutdown,
}

#[async_trait]
impl ChannelSink for TcpSink {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ChannelClosed("tcp channel closed".into()));
        }
        if data.len() > self.max_frame_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }
        self.buffered.fetch_add(data.len(), Ordering::AcqRel);
        if let Err(e) = self.write_tx.send(WriterCmd::Frame(data)).await {
            if let WriterCmd::Frame(data) = e.0 {
                self.buffered.fetch_sub(data.len(), Ordering::AcqRel);
            }
            return Err(TransportError::ChannelClosed("tcp writer is gone".into()));
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("closing tcp channel: {reason}");
        let _ = self.write_tx.send(WriterCmd::Shutdown).await;
    }
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    events: mpsc::Sender<ChannelEvent>,
    max_frame_size: usize,
    closed: Arc<AtomicBool>,
) {
    loop {
        match read_framed(&mut read_half, max_frame_size).await {
            Ok(data) => {
                if events.send(ChannelEvent::Message(data.into())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // Suppress the event when this side initiated the close.
                if !closed.load(Ordering::Acquire) {
                    let _ = events
                        .send(ChannelEvent::Closed {
                            reason: e.to_string(),
                        })
                        .await;
                }
                return;
            }
        }
    }
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut commands: mpsc::Receiver<WriterCmd>,
    buffered: Arc<AtomicUsize>,
    events: mpsc::Sender<ChannelEvent>,
    buffer_low: usize,
) {
    use tokio::io::AsyncWriteExt;

    while let Some(cmd) = commands.recv().await {
        match cmd {
            WriterCmd::Frame(data) => {
                let len = data.len();
                let result = write_framed(&mut write_half, &data).await;
                let before = buffered.fetch_sub(len, Ordering::AcqRel);
                if result.is_err() {
                    // Socket is dead; the reader surfaces the close reason.
                    break;
                }
                let after = before.saturating_sub(len);
                if before >= buffer_low && after < buffer_low {
                    let _ = events.try_send(ChannelEvent::BufferLow);
                }
            }
            WriterCmd::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}
