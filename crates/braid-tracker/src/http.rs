//! Read-only HTTP diagnostics.
//!
//! Serves the tracker's bookkeeping as JSON:
//!
//! - `GET /topology/` — every stream partition, `key → node → [neighbors]`
//! - `GET /topology/{stream}/` — all partitions of one stream
//! - `GET /topology/{stream}/{partition}/` — a single partition
//! - `GET /metrics/` — counter snapshot

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::StatusCode;
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info};

use braid_protocol::TrackerHandle;
use braid_transport::NodeId;

/// Accept loop. One task per connection; the service queries the tracker
/// runtime through its handle.
pub async fn serve(addr: SocketAddr, handle: TrackerHandle) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "diagnostics listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let service = DiagnosticsService {
            handle: handle.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(error = %err, "diagnostics connection error");
            }
        });
    }
}

#[derive(Clone)]
struct DiagnosticsService {
    handle: TrackerHandle,
}

impl Service<Request<Incoming>> for DiagnosticsService {
    type Response = Response<String>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<Incoming>) -> Self::Future {
        let handle = self.handle.clone();
        let method = request.method().clone();
        let path = request.uri().path().to_owned();
        Box::pin(async move {
            if method != Method::GET {
                return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "GET only"));
            }
            let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
            let response = match segments.as_slice() {
                &["topology"] => json_response(topology_json(&handle, None, None).await),
                &["topology", stream_id] => {
                    json_response(topology_json(&handle, Some(stream_id), None).await)
                }
                &["topology", stream_id, partition] => match partition.parse::<u32>() {
                    Ok(partition) => json_response(
                        topology_json(&handle, Some(stream_id), Some(partition)).await,
                    ),
                    Err(_) => plain(StatusCode::BAD_REQUEST, "partition must be a number"),
                },
                &["metrics"] => json_response(json!(handle.metrics().await)),
                _ => plain(StatusCode::NOT_FOUND, "unknown path"),
            };
            Ok(response)
        })
    }
}

/// Adjacency snapshot, optionally narrowed to one stream or one partition.
async fn topology_json(
    handle: &TrackerHandle,
    stream_id: Option<&str>,
    partition: Option<u32>,
) -> Value {
    let topologies = handle.topologies().await;
    let mut out = serde_json::Map::new();
    for (stream, nodes) in topologies {
        if stream_id.is_some_and(|id| id != stream.stream_id()) {
            continue;
        }
        if partition.is_some_and(|p| p != stream.partition()) {
            continue;
        }
        out.insert(stream.key(), adjacency_json(&nodes));
    }
    Value::Object(out)
}

fn adjacency_json(nodes: &BTreeMap<NodeId, Vec<NodeId>>) -> Value {
    let mut map = serde_json::Map::new();
    for (node, neighbors) in nodes {
        let list = neighbors
            .iter()
            .map(|neighbor| Value::String(neighbor.to_string()))
            .collect();
        map.insert(node.to_string(), Value::Array(list));
    }
    Value::Object(map)
}

fn json_response(value: Value) -> Response<String> {
    let mut response = Response::new(value.to_string());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn plain(status: StatusCode, message: &str) -> Response<String> {
    let mut response = Response::new(message.to_owned());
    *response.status_mut() = status;
    response
}
