//! Tracker state: one overlay topology per stream partition, fed by node
//! status reports and drained by periodic instruction rounds.
//!
//! Pure logic: no I/O, no clocks. The event loop feeds it statuses and
//! departures and executes the instructions a round returns.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use braid_transport::{NodeId, PeerAddress, PeerKind};

use crate::identifiers::StreamPartition;
use crate::messages::{Instruction, Status};
use crate::topology::{InstructionCounter, OverlayTopology, Randomness, TopologyInstruction};

/// What the tracker remembers about one registered peer.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub kind: PeerKind,
    pub address: Option<PeerAddress>,
    /// Round-trip times the node itself reported, for diagnostics.
    pub rtts: BTreeMap<NodeId, u64>,
    pub location: Option<String>,
    /// Node start time, milliseconds since the Unix epoch.
    pub started: u64,
}

/// Outcome of ingesting one status report.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StatusOutcome {
    /// Stream entries applied to their topologies.
    pub updated: usize,
    /// Stream entries dropped because their echoed counter was stale.
    pub stale: usize,
    /// Streams the node previously reported but no longer does.
    pub vanished: usize,
}

pub struct TrackerState {
    max_neighbors: usize,
    topologies: BTreeMap<StreamPartition, OverlayTopology>,
    counters: InstructionCounter,
    nodes: HashMap<NodeId, NodeRecord>,
    /// Streams each node mentioned in its latest status.
    reported: HashMap<NodeId, BTreeSet<StreamPartition>>,
    storage_nodes: BTreeSet<NodeId>,
}

impl TrackerState {
    pub fn new(max_neighbors: usize) -> Self {
        Self {
            max_neighbors,
            topologies: BTreeMap::new(),
            counters: InstructionCounter::new(),
            nodes: HashMap::new(),
            reported: HashMap::new(),
            storage_nodes: BTreeSet::new(),
        }
    }

    /// Register a connected peer. Storage nodes join every existing stream
    /// topology right away so instruction rounds wire them in.
    pub fn register(&mut self, node: NodeId, kind: PeerKind, address: Option<PeerAddress>) {
        self.nodes.insert(
            node.clone(),
            NodeRecord {
                kind,
                address,
                rtts: BTreeMap::new(),
                location: None,
                started: 0,
            },
        );
        if kind == PeerKind::Storage {
            self.storage_nodes.insert(node.clone());
            for topology in self.topologies.values_mut() {
                if !topology.contains(&node) {
                    topology.update(&node, []);
                }
            }
        }
    }

    /// Remove a departed peer from every topology it was part of. Returns
    /// the streams that lost the node; topologies left without any
    /// non-storage member are dropped.
    pub fn deregister(&mut self, node: &NodeId) -> Vec<StreamPartition> {
        self.nodes.remove(node);
        self.storage_nodes.remove(node);
        self.reported.remove(node);
        self.counters.remove_node(node);

        let mut affected = Vec::new();
        for (stream, topology) in &mut self.topologies {
            if topology.contains(node) {
                topology.leave(node);
                affected.push(stream.clone());
            }
        }
        self.prune_topologies();
        affected
    }

    pub fn is_registered(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn address_of(&self, node: &NodeId) -> Option<&PeerAddress> {
        self.nodes.get(node).and_then(|record| record.address.as_ref())
    }

    /// All storage nodes except the requester itself.
    pub fn storage_nodes_for(&self, requester: &NodeId) -> Vec<NodeId> {
        self.storage_nodes
            .iter()
            .filter(|node| *node != requester)
            .cloned()
            .collect()
    }

    /// Ingest a full status report from a node.
    ///
    /// Entries echoing a counter behind the last issued instruction are
    /// stale: the node has not applied that instruction yet, so its report
    /// describes a state the instruction already obsoleted. Streams the
    /// node stopped reporting are left.
    pub fn process_status(&mut self, node: &NodeId, status: &Status) -> StatusOutcome {
        let mut outcome = StatusOutcome::default();
        if let Some(record) = self.nodes.get_mut(node) {
            record.rtts = status.rtts.clone();
            record.location = status.location.clone();
            record.started = status.started;
        }

        let mut mentioned = BTreeSet::new();
        for (stream, entry) in &status.streams {
            mentioned.insert(stream.clone());
            if !self.counters.is_current(node, stream, entry.counter) {
                outcome.stale += 1;
                continue;
            }
            let topology = self
                .topologies
                .entry(stream.clone())
                .or_insert_with(|| new_topology(self.max_neighbors, &self.storage_nodes));
            let neighbors = entry
                .inbound_nodes
                .iter()
                .chain(entry.outbound_nodes.iter())
                .cloned();
            topology.update(node, neighbors);
            outcome.updated += 1;
        }

        let previous = self.reported.insert(node.clone(), mentioned.clone());
        for vanished in previous.unwrap_or_default().difference(&mentioned) {
            if let Some(topology) = self.topologies.get_mut(vanished) {
                topology.leave(node);
                outcome.vanished += 1;
            }
        }
        if outcome.vanished > 0 {
            self.prune_topologies();
        }
        outcome
    }

    /// Run one balancing round over every stream.
    ///
    /// Per stream, every member's open or excess slots are resolved with
    /// [`OverlayTopology::form_instructions`]; each edge change is applied
    /// immediately so later members see it. Every node touched by a change
    /// gets one instruction carrying its full post-round neighbor set and a
    /// fresh counter.
    pub fn instruction_round(&mut self, rng: &mut dyn Randomness) -> Vec<(NodeId, Instruction)> {
        let mut out = Vec::new();
        for (stream, topology) in &mut self.topologies {
            let mut touched = BTreeSet::new();
            for node in topology.node_ids() {
                for change in topology.form_instructions(&node, rng) {
                    topology.apply(&change);
                    match &change {
                        TopologyInstruction::Connect {
                            source,
                            destination,
                        }
                        | TopologyInstruction::Disconnect {
                            source,
                            destination,
                        } => {
                            touched.insert(source.clone());
                            touched.insert(destination.clone());
                        }
                    }
                }
            }
            for node in touched {
                let node_ids: Vec<NodeId> = topology
                    .neighbors(&node)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                let counter = self.counters.set_or_increment(&node, stream);
                out.push((
                    node.clone(),
                    Instruction {
                        stream: stream.clone(),
                        node_ids,
                        counter,
                    },
                ));
            }
        }
        out
    }

    /// Adjacency of every stream, for the diagnostic endpoints.
    pub fn topology_snapshot(&self) -> BTreeMap<StreamPartition, BTreeMap<NodeId, Vec<NodeId>>> {
        self.topologies
            .iter()
            .map(|(stream, topology)| (stream.clone(), topology.state()))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn stream_count(&self) -> usize {
        self.topologies.len()
    }

    /// Drop topologies no subscriber reports any more. Storage nodes are
    /// members of every topology, so a topology whose members are all
    /// storage nodes is effectively empty.
    fn prune_topologies(&mut self) {
        let storage = &self.storage_nodes;
        let counters = &mut self.counters;
        self.topologies.retain(|stream, topology| {
            let alive = topology
                .node_ids()
                .iter()
                .any(|node| !storage.contains(node));
            if !alive {
                counters.remove_stream(stream);
            }
            alive
        });
    }
}

fn new_topology(max_neighbors: usize, storage_nodes: &BTreeSet<NodeId>) -> OverlayTopology {
    let mut topology = OverlayTopology::new(max_neighbors);
    for node in storage_nodes {
        topology.update(node, []);
    }
    topology
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StreamStatus;
    use crate::topology::FixedRandomness;

    fn n(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn s(partition: u32) -> StreamPartition {
        StreamPartition::new("stream", partition)
    }

    fn status_with(streams: &[(StreamPartition, Vec<NodeId>, u64)]) -> Status {
        let mut map = BTreeMap::new();
        for (stream, neighbors, counter) in streams {
            map.insert(
                stream.clone(),
                StreamStatus {
                    inbound_nodes: neighbors.clone(),
                    outbound_nodes: neighbors.clone(),
                    counter: *counter,
                },
            );
        }
        Status {
            streams: map,
            ..Status::default()
        }
    }

    #[test]
    fn test_first_status_creates_topology() {
        let mut state = TrackerState::new(4);
        state.register(n("a"), PeerKind::Node, None);
        let outcome = state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        assert_eq!(outcome.updated, 1);
        assert_eq!(state.stream_count(), 1);
        let snapshot = state.topology_snapshot();
        assert!(snapshot[&s(0)].contains_key(&n("a")));
    }

    #[test]
    fn test_stale_entries_are_dropped() {
        let mut state = TrackerState::new(4);
        state.register(n("a"), PeerKind::Node, None);
        state.register(n("b"), PeerKind::Node, None);
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        state.process_status(&n("b"), &status_with(&[(s(0), vec![], 0)]));
        let issued = state.instruction_round(&mut FixedRandomness);
        let counter = issued
            .iter()
            .find(|(node, _)| *node == n("a"))
            .map(|(_, instruction)| instruction.counter)
            .unwrap();
        // Echoing a counter behind the issued one is stale.
        let outcome = state.process_status(&n("a"), &status_with(&[(s(0), vec![], counter - 1)]));
        assert_eq!(outcome, StatusOutcome { updated: 0, stale: 1, vanished: 0 });
        // Echoing the issued counter is current again.
        let outcome =
            state.process_status(&n("a"), &status_with(&[(s(0), vec![n("b")], counter)]));
        assert_eq!(outcome.updated, 1);
    }

    #[test]
    fn test_vanished_stream_removes_node_from_topology() {
        let mut state = TrackerState::new(4);
        state.register(n("a"), PeerKind::Node, None);
        state.register(n("b"), PeerKind::Node, None);
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0), (s(1), vec![], 0)]));
        state.process_status(&n("b"), &status_with(&[(s(0), vec![], 0)]));
        assert_eq!(state.stream_count(), 2);
        // a stops reporting partition 1; nobody else has it.
        let outcome = state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        assert_eq!(outcome.vanished, 1);
        assert_eq!(state.stream_count(), 1);
        assert!(state.topology_snapshot().contains_key(&s(0)));
    }

    #[test]
    fn test_deregister_prunes_empty_topologies() {
        let mut state = TrackerState::new(4);
        state.register(n("a"), PeerKind::Node, None);
        state.register(n("b"), PeerKind::Node, None);
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        state.process_status(&n("b"), &status_with(&[(s(0), vec![], 0), (s(1), vec![], 0)]));
        let affected = state.deregister(&n("b"));
        assert_eq!(affected, vec![s(0), s(1)]);
        assert!(!state.is_registered(&n("b")));
        // Partition 1 lost its only member; partition 0 keeps a.
        assert_eq!(state.stream_count(), 1);
        assert!(state.topology_snapshot().contains_key(&s(0)));
    }

    #[test]
    fn test_storage_nodes_join_existing_and_new_topologies() {
        let mut state = TrackerState::new(4);
        state.register(n("a"), PeerKind::Node, None);
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        state.register(n("store"), PeerKind::Storage, None);
        assert!(state.topology_snapshot()[&s(0)].contains_key(&n("store")));
        // A topology created later picks the storage node up as well.
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0), (s(1), vec![], 0)]));
        assert!(state.topology_snapshot()[&s(1)].contains_key(&n("store")));
    }

    #[test]
    fn test_storage_only_topology_is_dropped() {
        let mut state = TrackerState::new(4);
        state.register(n("store"), PeerKind::Storage, None);
        state.register(n("a"), PeerKind::Node, None);
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        assert_eq!(state.stream_count(), 1);
        state.deregister(&n("a"));
        // Only the storage node remains; the topology goes away.
        assert_eq!(state.stream_count(), 0);
    }

    #[test]
    fn test_storage_nodes_for_excludes_requester() {
        let mut state = TrackerState::new(4);
        state.register(n("s1"), PeerKind::Storage, None);
        state.register(n("s2"), PeerKind::Storage, None);
        assert_eq!(state.storage_nodes_for(&n("s1")), vec![n("s2")]);
        assert_eq!(state.storage_nodes_for(&n("other")), vec![n("s1"), n("s2")]);
    }

    #[test]
    fn test_round_connects_two_lone_nodes_symmetrically() {
        let mut state = TrackerState::new(4);
        state.register(n("a"), PeerKind::Node, None);
        state.register(n("b"), PeerKind::Node, None);
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        state.process_status(&n("b"), &status_with(&[(s(0), vec![], 0)]));
        let issued = state.instruction_round(&mut FixedRandomness);
        assert_eq!(issued.len(), 2);
        let for_a = issued.iter().find(|(node, _)| *node == n("a")).unwrap();
        let for_b = issued.iter().find(|(node, _)| *node == n("b")).unwrap();
        assert_eq!(for_a.1.node_ids, vec![n("b")]);
        assert_eq!(for_b.1.node_ids, vec![n("a")]);
        assert_eq!(for_a.1.counter, 1);
        assert_eq!(for_b.1.counter, 1);
    }

    #[test]
    fn test_round_is_quiet_once_converged() {
        let mut state = TrackerState::new(4);
        state.register(n("a"), PeerKind::Node, None);
        state.register(n("b"), PeerKind::Node, None);
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        state.process_status(&n("b"), &status_with(&[(s(0), vec![], 0)]));
        let first = state.instruction_round(&mut FixedRandomness);
        assert!(!first.is_empty());
        // The round already applied its changes to the tracker's view.
        let second = state.instruction_round(&mut FixedRandomness);
        assert!(second.is_empty());
    }

    #[test]
    fn test_round_counters_increment_per_issue() {
        let mut state = TrackerState::new(2);
        state.register(n("a"), PeerKind::Node, None);
        state.register(n("b"), PeerKind::Node, None);
        state.register(n("c"), PeerKind::Node, None);
        state.process_status(&n("a"), &status_with(&[(s(0), vec![], 0)]));
        state.process_status(&n("b"), &status_with(&[(s(0), vec![], 0)]));
        let issued = state.instruction_round(&mut FixedRandomness);
        assert!(issued.iter().all(|(_, i)| i.counter == 1));
        // A later joiner forces another edge; re-instructed nodes advance.
        state.process_status(&n("c"), &status_with(&[(s(0), vec![], 0)]));
        let issued = state.instruction_round(&mut FixedRandomness);
        for (node, instruction) in &issued {
            if *node == n("c") {
                assert_eq!(instruction.counter, 1);
            } else {
                assert_eq!(instruction.counter, 2);
            }
        }
    }
}
