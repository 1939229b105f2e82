//! Serialization of topology-instruction handling.
//!
//! Acting on an instruction involves dialing peers and can take seconds.
//! The throttler admits one instruction at a time; instructions arriving
//! meanwhile are queued, and a newer instruction for a stream that is
//! already queued replaces the queued one in place, so only the newest
//! assignment per stream ever runs.

use std::collections::VecDeque;

use braid_transport::NodeId;

use crate::identifiers::StreamPartition;
use crate::messages::Instruction;

#[derive(Debug, Default)]
pub struct InstructionThrottler {
    queue: VecDeque<(Instruction, NodeId)>,
    in_flight: bool,
}

impl InstructionThrottler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an instruction. Returns it back when nothing is in flight and
    /// it should be handled right away; otherwise it is queued (or folded
    /// into the queued entry for the same stream) and `None` is returned.
    pub fn add(&mut self, instruction: Instruction, tracker: NodeId) -> Option<(Instruction, NodeId)> {
        if let Some(slot) = self
            .queue
            .iter_mut()
            .find(|(queued, _)| queued.stream == instruction.stream)
        {
            *slot = (instruction, tracker);
            return None;
        }
        self.queue.push_back((instruction, tracker));
        self.next_if_idle()
    }

    /// The in-flight handler finished; returns the next instruction to
    /// handle, if any is queued.
    pub fn finish(&mut self) -> Option<(Instruction, NodeId)> {
        self.in_flight = false;
        self.next_if_idle()
    }

    /// Drop queued instructions for a stream that is going away.
    pub fn remove_stream(&mut self, stream: &StreamPartition) {
        self.queue.retain(|(queued, _)| queued.stream != *stream);
    }

    /// Forget everything queued and the in-flight marker. The caller is
    /// responsible for cancelling the handler it started.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.in_flight = false;
    }

    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.queue.is_empty()
    }

    fn next_if_idle(&mut self) -> Option<(Instruction, NodeId)> {
        if self.in_flight {
            return None;
        }
        let next = self.queue.pop_front()?;
        self.in_flight = true;
        Some(next)
    }
}
