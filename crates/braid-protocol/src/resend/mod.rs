//! Historical-data resends.
//!
//! A [`ResendHandler`] answers one request by walking an ordered list of
//! strategies: the first strategy that yields at least one message settles
//! the request, a strategy yielding nothing passes it along, and a failing
//! strategy reports to the error sink and passes it along too. An empty
//! final answer is a valid outcome, not an error.
//!
//! Requests arriving from remote peers only consult the strategies marked
//! as shared (in practice the local storage), so a relayed request cannot
//! fan out into further relays.

mod strategies;

pub use strategies::{
    AskNeighborsStrategy, LocalResendStrategy, StorageNodeStrategy, DEFAULT_MAX_INACTIVITY,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use braid_transport::NodeId;

use crate::error::NetworkError;
use crate::identifiers::StreamPartition;
use crate::messages::{ResendRequest, StreamMessage};

const RESPONSE_BUFFER: usize = 64;

/// What a relayed resend produces at the requesting side, in arrival
/// order: an optional `Resending`, any number of `Message`s, then either
/// `Resent` or `NoResend`.
#[derive(Debug, Clone)]
pub enum RelayedResendEvent {
    Resending,
    Message(StreamMessage),
    Resent,
    NoResend,
}

/// Network services the relaying strategies need from the node runtime.
#[async_trait]
pub trait ResendRelay: Send + Sync + 'static {
    /// Peers worth asking for historical data on this stream.
    async fn neighbor_candidates(&self, stream: &StreamPartition) -> Vec<NodeId>;

    /// Forward the request to a peer and stream its answer back.
    async fn relay_request(
        &self,
        peer: &NodeId,
        request: &ResendRequest,
    ) -> Result<mpsc::Receiver<RelayedResendEvent>, NetworkError>;

    /// Ask the tracker which storage nodes serve this stream.
    async fn find_storage_nodes(
        &self,
        stream: &StreamPartition,
    ) -> Result<Vec<NodeId>, NetworkError>;

    /// Make sure a connection to the node exists, dialing if necessary.
    async fn connect_to(&self, node: &NodeId) -> Result<(), NetworkError>;
}

/// One way of answering a resend request.
#[async_trait]
pub trait ResendStrategy: Send + Sync + 'static {
    /// Stream matching messages into `out`. Returns how many were sent;
    /// zero means this strategy has nothing for the request.
    async fn resend(
        &self,
        request: &ResendRequest,
        out: &mpsc::Sender<StreamMessage>,
    ) -> Result<usize, NetworkError>;
}

/// Push one answer to the requester, translating a gone requester into
/// cancellation.
pub(crate) async fn forward(
    out: &mpsc::Sender<StreamMessage>,
    message: StreamMessage,
    request_id: &str,
) -> Result<(), NetworkError> {
    out.send(message)
        .await
        .map_err(|_| NetworkError::ResendCancelled {
            request_id: request_id.to_owned(),
        })
}

struct OngoingResend {
    source: Option<NodeId>,
    abort: AbortHandle,
}

struct HandlerInner {
    shared_strategies: Vec<Box<dyn ResendStrategy>>,
    local_only_strategies: Vec<Box<dyn ResendStrategy>>,
    error_sink: Box<dyn Fn(NetworkError) + Send + Sync>,
    ongoing: Mutex<HashMap<String, OngoingResend>>,
}

/// Drives resend requests through the configured strategies.
#[derive(Clone)]
pub struct ResendHandler {
    inner: Arc<HandlerInner>,
}

impl ResendHandler {
    /// `shared_strategies` serve every request; `local_only_strategies`
    /// additionally serve requests originating on this node.
    pub fn new(
        shared_strategies: Vec<Box<dyn ResendStrategy>>,
        local_only_strategies: Vec<Box<dyn ResendStrategy>>,
        error_sink: impl Fn(NetworkError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(HandlerInner {
                shared_strategies,
                local_only_strategies,
                error_sink: Box::new(error_sink),
                ongoing: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Answer a request. `source` is the remote peer the request came
    /// from, or `None` for a request made on this node. Messages flow out
    /// of the returned receiver; it closing marks the end of the answer.
    pub fn handle_request(
        &self,
        request: ResendRequest,
        source: Option<NodeId>,
    ) -> mpsc::Receiver<StreamMessage> {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let inner = self.inner.clone();
        let local = source.is_none();
        let request_id = request.request_id.clone();

        // The ongoing lock is held across the spawn so the task cannot
        // deregister itself before it has been registered.
        let mut ongoing = self.inner.ongoing.lock().unwrap_or_else(|e| e.into_inner());
        let task = tokio::spawn({
            let request_id = request_id.clone();
            async move {
                run_strategies(&inner, &request, local, &tx).await;
                let mut ongoing = inner.ongoing.lock().unwrap_or_else(|e| e.into_inner());
                ongoing.remove(&request_id);
            }
        });
        ongoing.insert(
            request_id,
            OngoingResend {
                source,
                abort: task.abort_handle(),
            },
        );
        rx
    }

    /// Abort every resend requested by a departing peer.
    pub fn stop_resends_of_node(&self, node: &NodeId) {
        let mut ongoing = self.inner.ongoing.lock().unwrap_or_else(|e| e.into_inner());
        ongoing.retain(|request_id, entry| {
            if entry.source.as_ref() == Some(node) {
                debug!(%request_id, peer = %node, "aborting resend of departed peer");
                entry.abort.abort();
                false
            } else {
                true
            }
        });
    }

    /// Abort all in-flight resends.
    pub fn stop(&self) {
        let mut ongoing = self.inner.ongoing.lock().unwrap_or_else(|e| e.into_inner());
        for entry in ongoing.values() {
            entry.abort.abort();
        }
        ongoing.clear();
    }

    #[cfg(test)]
    fn ongoing_count(&self) -> usize {
        self.inner
            .ongoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

async fn run_strategies(
    inner: &HandlerInner,
    request: &ResendRequest,
    local: bool,
    out: &mpsc::Sender<StreamMessage>,
) {
    let local_only = if local {
        &inner.local_only_strategies[..]
    } else {
        &[]
    };
    for strategy in inner.shared_strategies.iter().chain(local_only) {
        match strategy.resend(request, out).await {
            Ok(0) => continue,
            Ok(delivered) => {
                debug!(
                    request_id = %request.request_id,
                    delivered,
                    "resend answered"
                );
                return;
            }
            Err(NetworkError::ResendCancelled { .. }) => return,
            Err(err) => {
                (inner.error_sink)(err);
                continue;
            }
        }
    }
}
