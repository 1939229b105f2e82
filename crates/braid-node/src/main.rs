//! Network node daemon.
//!
//! Runs the propagation runtime against one or more trackers. Three modes:
//! a plain relay (`run`, optionally storage-backed), a subscriber that
//! prints incoming messages as JSON lines (`subscribe`), and a publisher
//! that turns stdin lines into one message chain (`publish`).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};

use braid_protocol::{
    MemoryStorage, MessageId, MessageRef, Node, NodeChannels, NodeConfig, NodeEvent, Storage,
    StreamMessage, StreamPartition,
};
use braid_transport::{Endpoint, EndpointConfig, NodeId, PeerAddress, PeerInfo, PeerKind};

#[derive(Parser)]
#[command(name = "braid-node", about = "Stream propagation node for the braid network")]
struct Cli {
    /// Node identity, unique per network.
    #[arg(long, default_value = "node-1")]
    id: String,

    /// Address to accept peer connections on.
    #[arg(long, default_value = "0.0.0.0:30301")]
    listen: String,

    /// Tracker address; repeat the flag for more than one.
    #[arg(long = "tracker", required = true)]
    trackers: Vec<String>,

    /// Free-form location string reported to trackers.
    #[arg(long)]
    location: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relay streams as the trackers assign them.
    Run {
        /// Also answer resends, keeping everything seen in memory.
        #[arg(long)]
        storage: bool,
    },

    /// Subscribe to a stream partition and print messages as JSON lines.
    Subscribe {
        /// Stream id.
        #[arg(long)]
        stream: String,
        /// Partition number.
        #[arg(long, default_value = "0")]
        partition: u32,
    },

    /// Publish stdin lines as one message chain of a stream partition.
    Publish {
        /// Stream id.
        #[arg(long)]
        stream: String,
        /// Partition number.
        #[arg(long, default_value = "0")]
        partition: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let storage = match cli.command {
        Command::Run { storage: true } => Some(Arc::new(MemoryStorage::new())),
        _ => None,
    };
    let kind = if storage.is_some() {
        PeerKind::Storage
    } else {
        PeerKind::Node
    };

    let local = PeerInfo::new(NodeId::new(&cli.id), kind);
    let listen = PeerAddress::new(&cli.listen);
    let (endpoint, events) = Endpoint::bind_tcp(local, &listen, EndpointConfig::new()).await?;

    eprintln!("braid-node v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Node ID: {}", endpoint.local_node_id());
    eprintln!("Listening on: {}", endpoint.local_address());

    let config = NodeConfig {
        trackers: cli.trackers.iter().map(PeerAddress::new).collect(),
        location: cli.location.clone(),
        ..NodeConfig::default()
    };
    let channels = Node::spawn(
        endpoint,
        events,
        storage.clone().map(|s| s as Arc<dyn Storage>),
        config,
    );

    match cli.command {
        Command::Run { .. } => run(channels, storage).await,
        Command::Subscribe { stream, partition } => {
            subscribe(channels, StreamPartition::new(stream, partition)).await
        }
        Command::Publish { stream, partition } => {
            publish(channels, StreamPartition::new(stream, partition), cli.id).await
        }
    }
}

/// Relay mode: log protocol events; with storage, persist everything seen.
async fn run(
    mut channels: NodeChannels,
    storage: Option<Arc<MemoryStorage>>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                channels.handle.shutdown().await;
                return Ok(());
            }
            event = channels.events.recv() => {
                let Some(event) = event else { return Ok(()) };
                handle_event(event, storage.as_deref()).await;
            }
        }
    }
}

/// Subscriber mode: print every accepted message of the stream to stdout.
async fn subscribe(mut channels: NodeChannels, stream: StreamPartition) -> anyhow::Result<()> {
    channels.handle.subscribe(stream.clone()).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                channels.handle.shutdown().await;
                return Ok(());
            }
            event = channels.events.recv() => {
                let Some(event) = event else { return Ok(()) };
                match event {
                    NodeEvent::UnseenMessage { message, .. } if message.id.stream == stream => {
                        println!("{}", render(&message));
                    }
                    other => handle_event(other, None).await,
                }
            }
        }
    }
}

/// Publisher mode: every stdin line becomes the next message of one chain.
async fn publish(
    mut channels: NodeChannels,
    stream: StreamPartition,
    publisher: String,
) -> anyhow::Result<()> {
    channels.handle.subscribe(stream.clone()).await?;

    let chain = uuid::Uuid::new_v4().to_string();
    let mut previous: Option<MessageRef> = None;
    let mut last_timestamp = 0u64;
    let mut sequence = 0u64;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                channels.handle.shutdown().await;
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("input finished");
                    channels.handle.shutdown().await;
                    return Ok(());
                };
                let timestamp = now_millis();
                if timestamp == last_timestamp {
                    sequence += 1;
                } else {
                    last_timestamp = timestamp;
                    sequence = 0;
                }
                let id = MessageId::new(
                    stream.clone(),
                    timestamp,
                    sequence,
                    publisher.clone(),
                    chain.clone(),
                );
                let message = StreamMessage::new(id, previous, line.into_bytes());
                previous = Some(message.id.reference());
                channels.handle.publish(message).await?;
            }
            event = channels.events.recv() => {
                let Some(event) = event else { return Ok(()) };
                handle_event(event, None).await;
            }
        }
    }
}

async fn handle_event(event: NodeEvent, storage: Option<&MemoryStorage>) {
    match event {
        NodeEvent::Subscribed { stream, node } => {
            info!(stream = %stream, node = %node, "neighbor attached");
        }
        NodeEvent::Unsubscribed { stream, node } => {
            info!(stream = %stream, node = %node, "neighbor detached");
        }
        NodeEvent::NodeConnected { node } => {
            debug!(node = %node, "peer connected");
        }
        NodeEvent::NodeDisconnected { node } => {
            debug!(node = %node, "peer disconnected");
        }
        NodeEvent::UnseenMessage { message, .. } => {
            debug!(id = %message.id, "message accepted");
            if let Some(storage) = storage {
                if let Err(err) = storage.store(message).await {
                    warn!(error = %err, "message not stored");
                }
            }
        }
        NodeEvent::PropagationFailed { stream, node } => {
            warn!(stream = %stream, node = %node, "propagation failed");
        }
    }
}

fn render(message: &StreamMessage) -> String {
    serde_json::json!({
        "stream": message.id.stream.key(),
        "timestamp": message.id.timestamp,
        "sequence": message.id.sequence_number,
        "publisher": message.id.publisher_id,
        "chain": message.id.msg_chain_id,
        "payload": String::from_utf8_lossy(&message.payload),
    })
    .to_string()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
