//! Property tests for the overlay topology.
//!
//! Whatever sequence of status updates, departures and balancing rounds
//! runs, the adjacency must stay symmetric, free of self loops and confined
//! to registered nodes, and a full balancing pass must respect the degree
//! bound.

use std::collections::BTreeSet;

use proptest::prelude::*;

use braid_protocol::{NodeId, OverlayTopology, Randomness, StdRandomness};

/// Ids are drawn from a small universe so operations collide often.
const UNIVERSE: usize = 8;

fn node(index: usize) -> NodeId {
    NodeId::new(format!("node-{index:02}"))
}

#[derive(Debug, Clone)]
enum Op {
    /// A status report: the node claims this neighbor set. Indexes past the
    /// universe produce ids the topology has never seen.
    Update { node: usize, reported: Vec<usize> },
    Leave { node: usize },
    /// One balancing pass: form and apply instructions for every member.
    Round,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..UNIVERSE, proptest::collection::vec(0..UNIVERSE + 2, 0..6))
            .prop_map(|(node, reported)| Op::Update { node, reported }),
        1 => (0..UNIVERSE).prop_map(|node| Op::Leave { node }),
        1 => Just(Op::Round),
    ]
}

fn run_round(topology: &mut OverlayTopology, rng: &mut dyn Randomness) {
    for id in topology.node_ids() {
        for instruction in topology.form_instructions(&id, rng) {
            topology.apply(&instruction);
        }
    }
}

fn run_ops(max_neighbors: usize, seed: u64, ops: &[Op]) -> OverlayTopology {
    let mut topology = OverlayTopology::new(max_neighbors);
    let mut rng = StdRandomness::seeded(seed);
    for op in ops {
        match op {
            Op::Update { node: index, reported } => {
                let id = node(*index);
                topology.update(&id, reported.iter().map(|other| node(*other)));
            }
            Op::Leave { node: index } => {
                topology.leave(&node(*index));
            }
            Op::Round => run_round(&mut topology, &mut rng),
        }
    }
    topology
}

proptest! {
    /// Whatever mix of updates, leaves and rounds runs, every edge has a
    /// mirror, no node neighbors itself and no edge points outside the
    /// registered membership.
    #[test]
    fn graph_invariants_hold_under_any_operation_mix(
        ops in proptest::collection::vec(op_strategy(), 1..40),
        seed in any::<u64>(),
        max_neighbors in 1..6usize,
    ) {
        let topology = run_ops(max_neighbors, seed, &ops);
        let members: BTreeSet<NodeId> = topology.node_ids().into_iter().collect();
        for id in &members {
            let neighbors = topology.neighbors(id).expect("member has an entry");
            prop_assert!(!neighbors.contains(id), "self loop at {}", id);
            for neighbor in neighbors {
                prop_assert!(
                    members.contains(neighbor),
                    "edge from {} to unregistered {}",
                    id,
                    neighbor
                );
                let back = topology.neighbors(neighbor).expect("member has an entry");
                prop_assert!(
                    back.contains(id),
                    "edge {} -> {} has no mirror",
                    id,
                    neighbor
                );
            }
        }
    }

    /// Status reports may inflate a node's degree arbitrarily, but one full
    /// balancing pass sheds the excess everywhere.
    #[test]
    fn full_round_restores_the_degree_bound(
        ops in proptest::collection::vec(op_strategy(), 1..40),
        seed in any::<u64>(),
        max_neighbors in 1..6usize,
    ) {
        let mut topology = run_ops(max_neighbors, seed, &ops);
        let mut rng = StdRandomness::seeded(seed ^ 0x00ba_1a9c);
        run_round(&mut topology, &mut rng);
        for id in topology.node_ids() {
            let degree = topology.neighbors(&id).map_or(0, |set| set.len());
            prop_assert!(
                degree <= max_neighbors,
                "node {} sits at degree {}, bound {}",
                id,
                degree,
                max_neighbors
            );
        }
    }

    /// A node that left is gone from the membership and from every
    /// remaining neighbor set.
    #[test]
    fn leave_erases_every_edge(
        ops in proptest::collection::vec(op_strategy(), 1..40),
        seed in any::<u64>(),
        which in 0..UNIVERSE,
    ) {
        let mut topology = run_ops(3, seed, &ops);
        let target = node(which);
        topology.leave(&target);
        prop_assert!(!topology.contains(&target));
        for id in topology.node_ids() {
            let neighbors = topology.neighbors(&id).expect("member has an entry");
            prop_assert!(!neighbors.contains(&target));
        }
    }
}
