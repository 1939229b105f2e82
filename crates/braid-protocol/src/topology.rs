//! Overlay topology management on the tracker side.
//!
//! One [`OverlayTopology`] exists per stream partition. It holds a
//! symmetric adjacency over the nodes subscribed to that partition and
//! forms connect/disconnect instructions that steer every node towards the
//! configured target degree. All randomness flows through the
//! [`Randomness`] strategy so formation is reproducible under test.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};

use braid_transport::NodeId;

use crate::identifiers::StreamPartition;

/// Randomness used by instruction formation.
pub trait Randomness: Send {
    /// Fair coin flip, used to balance which side of a new edge dials.
    fn coin_flip(&mut self) -> bool;
    /// Shuffle candidates in place.
    fn shuffle_nodes(&mut self, nodes: &mut [NodeId]);
    /// Pick one element, `None` when empty.
    fn pick<'a>(&mut self, nodes: &'a [NodeId]) -> Option<&'a NodeId>;
}

/// Production strategy backed by [`StdRng`].
#[derive(Debug)]
pub struct StdRandomness {
    rng: StdRng,
}

impl StdRandomness {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Reproducible variant for simulations.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for StdRandomness {
    fn default() -> Self {
        Self::new()
    }
}

impl Randomness for StdRandomness {
    fn coin_flip(&mut self) -> bool {
        self.rng.random_bool(0.5)
    }

    fn shuffle_nodes(&mut self, nodes: &mut [NodeId]) {
        nodes.shuffle(&mut self.rng);
    }

    fn pick<'a>(&mut self, nodes: &'a [NodeId]) -> Option<&'a NodeId> {
        nodes.choose(&mut self.rng)
    }
}

/// Fully deterministic strategy: heads on every flip, no shuffling, always
/// the first pick. Instruction formation becomes a pure function of the
/// topology state.
#[derive(Debug, Default)]
pub struct FixedRandomness;

impl Randomness for FixedRandomness {
    fn coin_flip(&mut self) -> bool {
        true
    }

    fn shuffle_nodes(&mut self, _nodes: &mut [NodeId]) {}

    fn pick<'a>(&mut self, nodes: &'a [NodeId]) -> Option<&'a NodeId> {
        nodes.first()
    }
}

/// One edge change for a node pair. `source` is the side expected to act:
/// for a connect, the dialer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyInstruction {
    Connect {
        source: NodeId,
        destination: NodeId,
    },
    Disconnect {
        source: NodeId,
        destination: NodeId,
    },
}

/// Symmetric neighbor graph of one stream partition.
#[derive(Debug)]
pub struct OverlayTopology {
    max_neighbors_per_node: usize,
    nodes: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl OverlayTopology {
    pub fn new(max_neighbors_per_node: usize) -> Self {
        assert!(
            max_neighbors_per_node > 0,
            "max neighbors per node must be positive"
        );
        Self {
            max_neighbors_per_node,
            nodes: BTreeMap::new(),
        }
    }

    pub fn max_neighbors_per_node(&self) -> usize {
        self.max_neighbors_per_node
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn neighbors(&self, node: &NodeId) -> Option<&BTreeSet<NodeId>> {
        self.nodes.get(node)
    }

    /// Replace a node's reported neighbor set, keeping the graph symmetric.
    ///
    /// The node is added if absent. Reported ids that are unknown to this
    /// topology, and the node's own id, are dropped.
    pub fn update(&mut self, node: &NodeId, neighbors: impl IntoIterator<Item = NodeId>) {
        self.nodes.entry(node.clone()).or_default();
        let new_neighbors: BTreeSet<NodeId> = neighbors
            .into_iter()
            .filter(|id| id != node && self.nodes.contains_key(id))
            .collect();
        let previous = match self.nodes.get_mut(node) {
            Some(set) => std::mem::replace(set, new_neighbors.clone()),
            None => BTreeSet::new(),
        };
        for removed in previous.difference(&new_neighbors) {
            if let Some(set) = self.nodes.get_mut(removed) {
                set.remove(node);
            }
        }
        for added in &new_neighbors {
            if let Some(set) = self.nodes.get_mut(added) {
                set.insert(node.clone());
            }
        }
    }

    /// Remove a node entirely. Returns its former neighbors.
    pub fn leave(&mut self, node: &NodeId) -> Vec<NodeId> {
        match self.nodes.remove(node) {
            Some(neighbors) => {
                for neighbor in &neighbors {
                    if let Some(set) = self.nodes.get_mut(neighbor) {
                        set.remove(node);
                    }
                }
                neighbors.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// Form the edge changes that move `node` towards the target degree.
    ///
    /// The topology itself is not modified; callers apply the returned
    /// instructions with [`OverlayTopology::apply`] once they decide to act
    /// on them.
    pub fn form_instructions(
        &self,
        node: &NodeId,
        rng: &mut dyn Randomness,
    ) -> Vec<TopologyInstruction> {
        let Some(neighbors) = self.nodes.get(node) else {
            return Vec::new();
        };

        // Over target degree: shed random excess edges and stop there.
        if neighbors.len() > self.max_neighbors_per_node {
            let excess = neighbors.len() - self.max_neighbors_per_node;
            let mut candidates: Vec<NodeId> = neighbors.iter().cloned().collect();
            rng.shuffle_nodes(&mut candidates);
            return candidates
                .into_iter()
                .take(excess)
                .map(|destination| TopologyInstruction::Disconnect {
                    source: node.clone(),
                    destination,
                })
                .collect();
        }

        let missing = self.max_neighbors_per_node - neighbors.len();
        if missing == 0 {
            return Vec::new();
        }

        // Fill open slots from non-neighbors that still have spare
        // capacity. Shuffle first so the stable degree sort breaks ties
        // randomly while preferring the least loaded peers.
        let mut with_spare: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, set)| {
                *id != node && !neighbors.contains(*id) && set.len() < self.max_neighbors_per_node
            })
            .map(|(id, _)| id.clone())
            .collect();
        rng.shuffle_nodes(&mut with_spare);
        with_spare.sort_by_key(|id| self.degree_of(id));

        let mut instructions = Vec::new();
        for destination in with_spare.into_iter().take(missing) {
            // The coin decides which side dials so connection load spreads.
            let instruction = if rng.coin_flip() {
                TopologyInstruction::Connect {
                    source: node.clone(),
                    destination,
                }
            } else {
                TopologyInstruction::Connect {
                    source: destination,
                    destination: node.clone(),
                }
            };
            instructions.push(instruction);
        }

        // Slots that could not be filled: free capacity elsewhere by
        // breaking an edge of a saturated non-neighbor, one disconnect per
        // two open slots. The freed peers become candidates next round.
        let still_missing = missing - instructions.len();
        if still_missing > 0 {
            let mut saturated: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(id, set)| {
                    *id != node
                        && !neighbors.contains(*id)
                        && set.len() >= self.max_neighbors_per_node
                })
                .map(|(id, _)| id.clone())
                .collect();
            rng.shuffle_nodes(&mut saturated);
            for candidate in saturated.into_iter().take(still_missing / 2) {
                let candidate_neighbors: Vec<NodeId> = match self.nodes.get(&candidate) {
                    Some(set) => set.iter().cloned().collect(),
                    None => continue,
                };
                if let Some(victim) = rng.pick(&candidate_neighbors) {
                    instructions.push(TopologyInstruction::Disconnect {
                        source: candidate.clone(),
                        destination: victim.clone(),
                    });
                }
            }
        }

        instructions
    }

    /// Apply one instruction to the adjacency. Unknown endpoints and self
    /// edges are ignored.
    pub fn apply(&mut self, instruction: &TopologyInstruction) {
        match instruction {
            TopologyInstruction::Connect {
                source,
                destination,
            } => {
                if source == destination
                    || !self.nodes.contains_key(source)
                    || !self.nodes.contains_key(destination)
                {
                    return;
                }
                if let Some(set) = self.nodes.get_mut(source) {
                    set.insert(destination.clone());
                }
                if let Some(set) = self.nodes.get_mut(destination) {
                    set.insert(source.clone());
                }
            }
            TopologyInstruction::Disconnect {
                source,
                destination,
            } => {
                if let Some(set) = self.nodes.get_mut(source) {
                    set.remove(destination);
                }
                if let Some(set) = self.nodes.get_mut(destination) {
                    set.remove(source);
                }
            }
        }
    }

    /// Snapshot of the adjacency with sorted neighbor lists.
    pub fn state(&self) -> BTreeMap<NodeId, Vec<NodeId>> {
        self.nodes
            .iter()
            .map(|(id, set)| (id.clone(), set.iter().cloned().collect()))
            .collect()
    }

    fn degree_of(&self, node: &NodeId) -> usize {
        self.nodes.get(node).map_or(0, |set| set.len())
    }
}

/// Monotonic instruction counters per `(node, stream)` pair.
///
/// Nodes echo the counter of the last instruction they applied in their
/// status reports; entries echoing an older counter than the last issued
/// one describe a state the instruction already obsoleted and are dropped.
#[derive(Debug, Default)]
pub struct InstructionCounter {
    counters: HashMap<NodeId, HashMap<StreamPartition, u64>>,
}

impl InstructionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump and return the counter to stamp on the next instruction.
    pub fn set_or_increment(&mut self, node: &NodeId, stream: &StreamPartition) -> u64 {
        let counter = self
            .counters
            .entry(node.clone())
            .or_default()
            .entry(stream.clone())
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Whether a status entry echoing `counter` reflects the latest
    /// instruction issued to the node for the stream.
    pub fn is_current(&self, node: &NodeId, stream: &StreamPartition, counter: u64) -> bool {
        match self.counters.get(node).and_then(|per_stream| per_stream.get(stream)) {
            Some(issued) => counter >= *issued,
            None => true,
        }
    }

    pub fn remove_node(&mut self, node: &NodeId) {
        self.counters.remove(node);
    }

    pub fn remove_stream(&mut self, stream: &StreamPartition) {
        for per_stream in self.counters.values_mut() {
            per_stream.remove(stream);
        }
        self.counters.retain(|_, per_stream| !per_stream.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn assert_symmetric(topology: &OverlayTopology) {
        for id in topology.node_ids() {
            for neighbor in topology.neighbors(&id).into_iter().flatten() {
                assert!(
                    topology
                        .neighbors(neighbor)
                        .is_some_and(|set| set.contains(&id)),
                    "edge {id} -> {neighbor} has no mirror"
                );
            }
        }
    }

    #[test]
    fn test_update_keeps_graph_symmetric() {
        let mut topology = OverlayTopology::new(4);
        topology.update(&n("a"), []);
        topology.update(&n("b"), [n("a")]);
        topology.update(&n("c"), [n("a"), n("b")]);
        assert_symmetric(&topology);
        assert!(topology.neighbors(&n("a")).unwrap().contains(&n("b")));
        assert!(topology.neighbors(&n("a")).unwrap().contains(&n("c")));
    }

    #[test]
    fn test_update_drops_unknown_and_self() {
        let mut topology = OverlayTopology::new(4);
        topology.update(&n("a"), [n("a"), n("ghost")]);
        assert!(topology.neighbors(&n("a")).unwrap().is_empty());
        assert!(!topology.contains(&n("ghost")));
    }

    #[test]
    fn test_update_removes_stale_mirror_edges() {
        let mut topology = OverlayTopology::new(4);
        topology.update(&n("a"), []);
        topology.update(&n("b"), [n("a")]);
        assert!(topology.neighbors(&n("a")).unwrap().contains(&n("b")));
        // b now reports no neighbors: the a side must forget b too.
        topology.update(&n("b"), []);
        assert!(topology.neighbors(&n("a")).unwrap().is_empty());
        assert_symmetric(&topology);
    }

    #[test]
    fn test_leave_returns_former_neighbors() {
        let mut topology = OverlayTopology::new(4);
        topology.update(&n("a"), []);
        topology.update(&n("b"), [n("a")]);
        topology.update(&n("c"), [n("a")]);
        let former = topology.leave(&n("a"));
        assert_eq!(former, vec![n("b"), n("c")]);
        assert!(!topology.contains(&n("a")));
        assert!(topology.neighbors(&n("b")).unwrap().is_empty());
        assert_symmetric(&topology);
    }

    #[test]
    fn test_two_empty_nodes_get_one_connect_instruction() {
        let mut topology = OverlayTopology::new(3);
        topology.update(&n("node-1"), []);
        topology.update(&n("node-2"), []);
        let instructions = topology.form_instructions(&n("node-1"), &mut FixedRandomness);
        assert_eq!(
            instructions,
            vec![TopologyInstruction::Connect {
                source: n("node-1"),
                destination: n("node-2"),
            }]
        );
    }

    #[test]
    fn test_excess_degree_produces_only_disconnects() {
        let mut topology = OverlayTopology::new(2);
        for id in ["a", "b", "c", "d"] {
            topology.update(&n(id), []);
        }
        topology.update(&n("a"), [n("b"), n("c"), n("d")]);
        let instructions = topology.form_instructions(&n("a"), &mut FixedRandomness);
        assert_eq!(instructions.len(), 1);
        assert!(matches!(
            instructions[0],
            TopologyInstruction::Disconnect { ref source, .. } if *source == n("a")
        ));
    }

    #[test]
    fn test_fill_prefers_least_loaded_candidates() {
        let mut topology = OverlayTopology::new(3);
        for id in ["a", "b", "c", "x", "y"] {
            topology.update(&n(id), []);
        }
        // Candidate b carries one edge, candidate c carries none.
        topology.update(&n("b"), [n("x")]);
        // a has one slot left and is not connected to b or c.
        topology.update(&n("a"), [n("x"), n("y")]);
        let instructions = topology.form_instructions(&n("a"), &mut FixedRandomness);
        assert_eq!(
            instructions,
            vec![TopologyInstruction::Connect {
                source: n("a"),
                destination: n("c"),
            }]
        );
    }

    #[test]
    fn test_saturated_mesh_gets_slot_freeing_disconnect() {
        let mut topology = OverlayTopology::new(2);
        for id in ["a", "b", "c", "d"] {
            topology.update(&n(id), []);
        }
        // b, c, d form a triangle, each at the target degree.
        topology.update(&n("b"), [n("c"), n("d")]);
        topology.update(&n("c"), [n("b"), n("d")]);
        let instructions = topology.form_instructions(&n("a"), &mut FixedRandomness);
        // Two open slots, no spare capacity anywhere: one freeing disconnect.
        assert_eq!(
            instructions,
            vec![TopologyInstruction::Disconnect {
                source: n("b"),
                destination: n("c"),
            }]
        );
    }

    #[test]
    fn test_single_open_slot_frees_nothing() {
        let mut topology = OverlayTopology::new(1);
        for id in ["a", "b", "c"] {
            topology.update(&n(id), []);
        }
        topology.update(&n("b"), [n("c")]);
        let instructions = topology.form_instructions(&n("a"), &mut FixedRandomness);
        // One open slot: 1 / 2 rounds down to zero disconnects.
        assert!(instructions.is_empty());
    }

    #[test]
    fn test_form_instructions_for_unknown_node_is_empty() {
        let topology = OverlayTopology::new(2);
        assert!(topology
            .form_instructions(&n("nope"), &mut FixedRandomness)
            .is_empty());
    }

    #[test]
    fn test_apply_connect_and_disconnect() {
        let mut topology = OverlayTopology::new(2);
        topology.update(&n("a"), []);
        topology.update(&n("b"), []);
        topology.apply(&TopologyInstruction::Connect {
            source: n("a"),
            destination: n("b"),
        });
        assert!(topology.neighbors(&n("a")).unwrap().contains(&n("b")));
        assert_symmetric(&topology);
        topology.apply(&TopologyInstruction::Disconnect {
            source: n("b"),
            destination: n("a"),
        });
        assert!(topology.neighbors(&n("a")).unwrap().is_empty());
        // Unknown endpoints are ignored.
        topology.apply(&TopologyInstruction::Connect {
            source: n("a"),
            destination: n("ghost"),
        });
        assert!(topology.neighbors(&n("a")).unwrap().is_empty());
    }

    #[test]
    fn test_state_snapshot_is_sorted() {
        let mut topology = OverlayTopology::new(3);
        topology.update(&n("b"), []);
        topology.update(&n("a"), [n("b")]);
        let state = topology.state();
        let keys: Vec<_> = state.keys().cloned().collect();
        assert_eq!(keys, vec![n("a"), n("b")]);
        assert_eq!(state[&n("b")], vec![n("a")]);
    }

    #[test]
    fn test_seeded_randomness_is_reproducible() {
        let mut first = StdRandomness::seeded(7);
        let mut second = StdRandomness::seeded(7);
        let flips: Vec<bool> = (0..16).map(|_| first.coin_flip()).collect();
        let again: Vec<bool> = (0..16).map(|_| second.coin_flip()).collect();
        assert_eq!(flips, again);
    }

    #[test]
    fn test_instruction_counter_increments_per_pair() {
        let mut counters = InstructionCounter::new();
        let s0 = StreamPartition::new("s", 0);
        let s1 = StreamPartition::new("s", 1);
        assert_eq!(counters.set_or_increment(&n("a"), &s0), 1);
        assert_eq!(counters.set_or_increment(&n("a"), &s0), 2);
        assert_eq!(counters.set_or_increment(&n("a"), &s1), 1);
        assert_eq!(counters.set_or_increment(&n("b"), &s0), 1);
    }

    #[test]
    fn test_instruction_counter_staleness() {
        let mut counters = InstructionCounter::new();
        let s0 = StreamPartition::new("s", 0);
        // Nothing issued yet: any echo is current.
        assert!(counters.is_current(&n("a"), &s0, 0));
        counters.set_or_increment(&n("a"), &s0);
        counters.set_or_increment(&n("a"), &s0);
        assert!(!counters.is_current(&n("a"), &s0, 1));
        assert!(counters.is_current(&n("a"), &s0, 2));
        assert!(counters.is_current(&n("a"), &s0, 3));
    }

    #[test]
    fn test_instruction_counter_removal() {
        let mut counters = InstructionCounter::new();
        let s0 = StreamPartition::new("s", 0);
        counters.set_or_increment(&n("a"), &s0);
        counters.remove_node(&n("a"));
        assert!(counters.is_current(&n("a"), &s0, 0));
        counters.set_or_increment(&n("b"), &s0);
        counters.remove_stream(&s0);
        assert!(counters.is_current(&n("b"), &s0, 0));
    }
}
