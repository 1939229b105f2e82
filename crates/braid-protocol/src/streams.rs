//! Per-stream bookkeeping on a node.
//!
//! Tracks which stream partitions the node participates in, the inbound and
//! outbound neighbor sets for each, the last applied instruction counter,
//! and the duplicate detectors for every publisher chain seen on the
//! stream. Asking about a stream that was never set up is a logic bug and
//! panics.

use std::collections::{BTreeSet, HashMap};

use braid_transport::NodeId;

use crate::dedup::DuplicateMessageDetector;
use crate::error::NetworkError;
use crate::identifiers::{ChainKey, MessageId, MessageRef, StreamPartition};

/// Node-local state of one stream partition.
#[derive(Debug, Default)]
pub struct StreamState {
    inbound: BTreeSet<NodeId>,
    outbound: BTreeSet<NodeId>,
    counter: u64,
}

impl StreamState {
    pub fn inbound(&self) -> &BTreeSet<NodeId> {
        &self.inbound
    }

    pub fn outbound(&self) -> &BTreeSet<NodeId> {
        &self.outbound
    }

    /// Counter of the last instruction applied for this stream.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

#[derive(Debug)]
pub struct StreamManager {
    streams: HashMap<StreamPartition, StreamState>,
    detectors: HashMap<ChainKey, DuplicateMessageDetector>,
    window_capacity: usize,
}

impl StreamManager {
    /// `window_capacity` bounds each chain's duplicate-detection window.
    pub fn new(window_capacity: usize) -> Self {
        Self {
            streams: HashMap::new(),
            detectors: HashMap::new(),
            window_capacity,
        }
    }

    pub fn set_up_stream(&mut self, stream: StreamPartition) {
        let previous = self.streams.insert(stream.clone(), StreamState::default());
        if previous.is_some() {
            panic!("stream {stream} is already set up");
        }
    }

    pub fn is_set_up(&self, stream: &StreamPartition) -> bool {
        self.streams.contains_key(stream)
    }

    /// Tear down a stream and its detectors.
    pub fn remove_stream(&mut self, stream: &StreamPartition) {
        if self.streams.remove(stream).is_none() {
            panic!("stream {stream} is not set up");
        }
        self.detectors.retain(|key, _| key.stream != *stream);
    }

    /// Run the message through its chain's duplicate detector.
    ///
    /// Returns `Ok(true)` for a first sighting, `Ok(false)` for a
    /// duplicate. Panics when the stream is not set up.
    pub fn mark_and_check(
        &mut self,
        id: &MessageId,
        previous: Option<MessageRef>,
    ) -> Result<bool, NetworkError> {
        self.assert_set_up(&id.stream);
        let capacity = self.window_capacity;
        self.detectors
            .entry(id.chain_key())
            .or_insert_with(|| DuplicateMessageDetector::with_capacity(capacity))
            .mark_and_check(previous, id.reference())
    }

    pub fn add_inbound_node(&mut self, stream: &StreamPartition, node: &NodeId) {
        self.state_mut(stream).inbound.insert(node.clone());
    }

    pub fn add_outbound_node(&mut self, stream: &StreamPartition, node: &NodeId) {
        self.state_mut(stream).outbound.insert(node.clone());
    }

    /// Remove a node from one stream's neighbor sets. Returns whether it
    /// was present in either direction.
    pub fn remove_node_from_stream(&mut self, stream: &StreamPartition, node: &NodeId) -> bool {
        let state = self.state_mut(stream);
        let was_inbound = state.inbound.remove(node);
        let was_outbound = state.outbound.remove(node);
        was_inbound || was_outbound
    }

    /// Remove a node from every stream. Returns the streams it was part of.
    pub fn remove_node_from_all_streams(&mut self, node: &NodeId) -> Vec<StreamPartition> {
        let mut affected = Vec::new();
        for (stream, state) in self.streams.iter_mut() {
            let was_inbound = state.inbound.remove(node);
            let was_outbound = state.outbound.remove(node);
            if was_inbound || was_outbound {
                affected.push(stream.clone());
            }
        }
        affected.sort();
        affected
    }

    pub fn inbound_nodes(&self, stream: &StreamPartition) -> Vec<NodeId> {
        self.state(stream).inbound.iter().cloned().collect()
    }

    pub fn outbound_nodes(&self, stream: &StreamPartition) -> Vec<NodeId> {
        self.state(stream).outbound.iter().cloned().collect()
    }

    /// Union of both neighbor sets for a stream.
    pub fn neighbors_of(&self, stream: &StreamPartition) -> BTreeSet<NodeId> {
        let state = self.state(stream);
        state.inbound.union(&state.outbound).cloned().collect()
    }

    /// Whether the node is a neighbor on any stream.
    pub fn is_node_present(&self, node: &NodeId) -> bool {
        self.streams
            .values()
            .any(|state| state.inbound.contains(node) || state.outbound.contains(node))
    }

    pub fn set_counter(&mut self, stream: &StreamPartition, counter: u64) {
        self.state_mut(stream).counter = counter;
    }

    pub fn counter(&self, stream: &StreamPartition) -> u64 {
        self.state(stream).counter
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamPartition> {
        self.streams.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&StreamPartition, &StreamState)> {
        self.streams.iter()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn assert_set_up(&self, stream: &StreamPartition) {
        if !self.streams.contains_key(stream) {
            panic!("stream {stream} is not set up");
        }
    }

    fn state(&self, stream: &StreamPartition) -> &StreamState {
        match self.streams.get(stream) {
            Some(state) => state,
            None => panic!("stream {stream} is not set up"),
        }
    }

    fn state_mut(&mut self, stream: &StreamPartition) -> &mut StreamState {
        match self.streams.get_mut(stream) {
            Some(state) => state,
            None => panic!("stream {stream} is not set up"),
        }
    }
}
