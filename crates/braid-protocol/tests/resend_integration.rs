//! End-to-end resend tests over the in-memory transport.
//!
//! A storage node carries pre-seeded history; requesters pull it back
//! either through a stream neighbor or, when not subscribed at all, by
//! discovering the storage node through the tracker and opening a direct
//! relay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use braid_protocol::{
    MemoryStorage, MessageId, MessageRef, Node, NodeChannels, NodeConfig, NodeHandle, Storage,
    StreamMessage, StreamPartition, Tracker, TrackerChannels, TrackerConfig,
};
use braid_transport::channel::memory::MemoryNetwork;
use braid_transport::{
    Endpoint, EndpointConfig, EndpointEvent, NodeId, PeerAddress, PeerInfo, PeerKind,
};

const CONVERGE: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(25);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}

fn stream() -> StreamPartition {
    StreamPartition::new("telemetry", 0)
}

fn message(timestamp: u64) -> StreamMessage {
    StreamMessage::new(
        MessageId::new(stream(), timestamp, 0, "publisher-1", "chain-1"),
        None,
        timestamp.to_be_bytes().to_vec(),
    )
}

fn endpoint(
    network: &MemoryNetwork,
    name: &str,
    kind: PeerKind,
) -> (Endpoint, mpsc::Receiver<EndpointEvent>, PeerAddress) {
    let address = PeerAddress::new(format!("mem://{name}"));
    let info = PeerInfo::new(NodeId::new(name), kind).with_address(address.clone());
    let (endpoint, events) = Endpoint::start(
        info,
        Box::new(network.listen(&address)),
        Box::new(network.factory()),
        EndpointConfig::new(),
    );
    (endpoint, events, address)
}

fn spawn_tracker(network: &MemoryNetwork) -> (TrackerChannels, PeerAddress) {
    let (endpoint, events, address) = endpoint(network, "tracker-1", PeerKind::Tracker);
    let channels = Tracker::spawn(
        endpoint,
        events,
        TrackerConfig {
            instruction_interval: Duration::from_millis(50),
            seed: Some(11),
            ..TrackerConfig::default()
        },
    );
    (channels, address)
}

fn fast_config(tracker: &PeerAddress) -> NodeConfig {
    NodeConfig {
        trackers: vec![tracker.clone()],
        status_debounce: Duration::from_millis(20),
        maintenance_interval: Duration::from_millis(100),
        ..NodeConfig::default()
    }
}

fn spawn_node(network: &MemoryNetwork, name: &str, tracker: &PeerAddress) -> NodeChannels {
    let (endpoint, events, _) = endpoint(network, name, PeerKind::Node);
    Node::spawn(endpoint, events, None, fast_config(tracker))
}

/// Storage node whose history is served out of the given store.
fn spawn_storage_node(
    network: &MemoryNetwork,
    name: &str,
    tracker: &PeerAddress,
    history: Arc<MemoryStorage>,
) -> NodeChannels {
    let (endpoint, events, _) = endpoint(network, name, PeerKind::Storage);
    Node::spawn(
        endpoint,
        events,
        Some(history as Arc<dyn Storage>),
        fast_config(tracker),
    )
}

/// History with one message at each of the given timestamps.
async fn seeded_history(timestamps: &[u64]) -> Arc<MemoryStorage> {
    let history = Arc::new(MemoryStorage::new());
    for &timestamp in timestamps {
        history
            .store(message(timestamp))
            .await
            .expect("seeding storage");
    }
    history
}

async fn await_metric_at_least(handle: &NodeHandle, name: &str, minimum: u64) {
    timeout(CONVERGE, async {
        loop {
            let metrics = handle.metrics().await;
            if metrics.get(name).copied().unwrap_or(0) >= minimum {
                return;
            }
            sleep(POLL).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("metric {name} never reached {minimum}"));
}

/// Collects a whole resend answer, returning the delivered timestamps.
async fn collect_timestamps(mut answers: mpsc::Receiver<StreamMessage>) -> Vec<u64> {
    let mut timestamps = Vec::new();
    loop {
        match timeout(CONVERGE, answers.recv()).await.expect("resend stalled") {
            Some(delivered) => timestamps.push(delivered.id.timestamp),
            None => return timestamps,
        }
    }
}

/// Integration test: resend served through tracker-side discovery.
///
/// Scenario: the requester is not subscribed to the stream, so it has no
/// neighbors to ask. It discovers the storage node through the tracker,
/// dials it and relays the answer back through a fresh connection.
#[tokio::test]
async fn test_resend_last_is_served_by_a_discovered_storage_node() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_tracker, tracker_addr) = spawn_tracker(&network);

    let history = seeded_history(&[10, 20, 30]).await;
    let storage = spawn_storage_node(&network, "storage-1", &tracker_addr, history);
    let requester = spawn_node(&network, "node-r", &tracker_addr);

    // Both peers must have checked in before discovery can work.
    await_metric_at_least(&storage.handle, "node.statuses_sent", 1).await;
    await_metric_at_least(&requester.handle, "node.statuses_sent", 1).await;

    let answers = requester.handle.resend_last(stream(), 2).await.unwrap();
    assert_eq!(collect_timestamps(answers).await, vec![20, 30]);

    let metrics = storage.handle.metrics().await;
    assert_eq!(metrics.get("node.resend_requests").copied(), Some(1));
}

/// Integration test: resend served by a storage node that is already a
/// stream neighbor.
///
/// Scenario: the requester subscribes; the tracker pairs it with the
/// storage node (storage nodes join every stream topology). The neighbor
/// answers from its local history, no discovery required.
#[tokio::test]
async fn test_resend_is_served_by_a_storage_neighbor() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_tracker, tracker_addr) = spawn_tracker(&network);

    let history = seeded_history(&[10, 20, 30]).await;
    let storage = spawn_storage_node(&network, "storage-1", &tracker_addr, history);
    let requester = spawn_node(&network, "node-r", &tracker_addr);

    requester.handle.subscribe(stream()).await.unwrap();

    // The pair converges once the tracker has wired them.
    timeout(CONVERGE, async {
        loop {
            let neighbors = requester.handle.neighbors(stream()).await;
            if neighbors == [storage.handle.local_id().clone()] {
                return;
            }
            sleep(POLL).await;
        }
    })
    .await
    .expect("storage neighbor was never attached");

    let answers = requester.handle.resend_last(stream(), 3).await.unwrap();
    assert_eq!(collect_timestamps(answers).await, vec![10, 20, 30]);
}

/// Integration test: a resend with no history anywhere closes empty.
///
/// Scenario: no storage node in the network. Every strategy comes up
/// empty and the answer channel closes without delivering anything.
#[tokio::test]
async fn test_resend_without_history_closes_empty() {
    init_tracing();
    let network = MemoryNetwork::new();
    let (_tracker, tracker_addr) = spawn_tracker(&network);

    let requester = spawn_node(&network, "node-r", &tracker_addr);
    await_metric_at_least(&requester.handle, "node.statuses_sent", 1).await;

    let answers = requester.handle.resend_last(stream(), 5).await.unwrap();
    assert!(collect_timestamps(answers).await.is_empty());
}
