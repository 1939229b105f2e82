//! Tracker daemon.
//!
//! Accepts node connections, ingests status reports, runs instruction
//! rounds, and optionally serves read-only diagnostics over HTTP.

mod http;

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info};

use braid_protocol::{Tracker, TrackerConfig, TrackerEvent};
use braid_transport::{Endpoint, EndpointConfig, NodeId, PeerAddress, PeerInfo, PeerKind};

#[derive(Parser)]
#[command(name = "braid-tracker", about = "Topology tracker for the braid network")]
struct Cli {
    /// Tracker identity, unique per network.
    #[arg(long, default_value = "tracker-1")]
    id: String,

    /// Address to accept peer connections on.
    #[arg(long, default_value = "0.0.0.0:30300")]
    listen: String,

    /// Bind address for the HTTP diagnostics endpoint; off when absent.
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Neighbor bound every stream topology converges to.
    #[arg(long, default_value = "4")]
    max_neighbors: usize,

    /// Milliseconds between instruction rounds.
    #[arg(long, default_value = "5000")]
    instruction_interval: u64,

    /// Seed for the topology randomness; pin it for reproducible rounds.
    #[arg(long)]
    seed: Option<u64>,
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

    let local = PeerInfo::new(NodeId::new(&cli.id), PeerKind::Tracker);
    let listen = PeerAddress::new(&cli.listen);
    let (endpoint, events) = Endpoint::bind_tcp(local, &listen, EndpointConfig::new()).await?;

    eprintln!("braid-tracker v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Tracker ID: {}", endpoint.local_node_id());
    eprintln!("Listening on: {}", endpoint.local_address());

    let config = TrackerConfig {
        max_neighbors: cli.max_neighbors,
        instruction_interval: Duration::from_millis(cli.instruction_interval),
        seed: cli.seed,
    };
    let mut channels = Tracker::spawn(endpoint, events, config);

    if let Some(addr) = cli.http {
        let handle = channels.handle.clone();
        tokio::spawn(async move {
            if let Err(err) = http::serve(addr, handle).await {
                error!(error = %err, "diagnostics server failed");
            }
        });
    }

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
                    TrackerEvent::NodeJoined { node, kind } => {
                        info!(node = %node, kind = ?kind, "node joined");
                    }
                    TrackerEvent::NodeLeft { node } => {
                        info!(node = %node, "node left");
                    }
                    TrackerEvent::StatusReceived { node, updated, stale } => {
                        debug!(node = %node, updated, stale, "status received");
                    }
                    TrackerEvent::InstructionsIssued { count } => {
                        debug!(count, "instructions issued");
                    }
                }
            }
        }
    }
}
