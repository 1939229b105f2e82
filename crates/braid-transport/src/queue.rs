use crate::TransportError;

use bytes::Bytes;
use std::cmp::{Ord, Ordering, Reverse};
use std::collections::BinaryHeap;
use tokio::sync::oneshot;

/// One queued outbound message. Ordered by its insertion number so delivery
/// order matches enqueue order even when the head cycles through retries.
pub(crate) struct QueueItem {
    no: u64,
    payload: Bytes,
    tries: u32,
    reply: Option<oneshot::Sender<Result<(), TransportError>>>,
}

impl QueueItem {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Fire the delivery promise. Dropping an item without resolving leaves
    /// the promise unresolved, which is what a cooperative close wants.
    pub fn resolve(mut self, result: Result<(), TransportError>) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(result);
        }
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.no == other.no
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.no.cmp(&other.no)
    }
}

/// Outbound message queue for one connection: a min-heap keyed by a
/// process-local monotonic counter. The counter is never reset for the
/// lifetime of the queue.
pub(crate) struct MessageQueue {
    heap: BinaryHeap<Reverse<QueueItem>>,
    next_no: u64,
    max_size: usize,
}

impl MessageQueue {
    pub const DEFAULT_MAX_SIZE: usize = 500;

    pub fn new(max_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_no: 0,
            max_size,
        }
    }

    /// Enqueue a message. When the queue is full the oldest entry is evicted
    /// and returned so the caller can fail its promise.
    pub fn add(
        &mut self,
        payload: Bytes,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) -> Option<QueueItem> {
        let evicted = if self.heap.len() >= self.max_size {
            self.pop()
        } else {
            None
        };
        let no = self.next_no;
        self.next_no += 1;
        self.heap.push(Reverse(QueueItem {
            no,
            payload,
            tries: 0,
            reply,
        }));
        evicted
    }

    /// The message that must go out next.
    pub fn peek(&self) -> Option<&QueueItem> {
        self.heap.peek().map(|Reverse(item)| item)
    }

    pub fn pop(&mut self) -> Option<QueueItem> {
        self.heap.pop().map(|Reverse(item)| item)
    }

    /// Record a failed flush attempt on the head; returns its new try count.
    pub fn bump_head_tries(&mut self) -> Option<u32> {
        let mut head = self.heap.peek_mut()?;
        head.0.tries += 1;
        Some(head.0.tries)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn pops_in_enqueue_order() {
        let mut queue = MessageQueue::new(10);
        queue.add(payload("m1"), None);
        queue.add(payload("m2"), None);
        queue.add(payload("m3"), None);

        assert_eq!(queue.pop().unwrap().payload(), &payload("m1"));
        assert_eq!(queue.pop().unwrap().payload(), &payload("m2"));
        assert_eq!(queue.pop().unwrap().payload(), &payload("m3"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn retries_do_not_reorder() {
        let mut queue = MessageQueue::new(10);
        queue.add(payload("m1"), None);
        queue.add(payload("m2"), None);

        assert_eq!(queue.bump_head_tries(), Some(1));
        assert_eq!(queue.bump_head_tries(), Some(2));
        let head = queue.peek().unwrap();
        assert_eq!(head.payload(), &payload("m1"));
        assert_eq!(head.tries(), 2);
        assert_eq!(queue.pop().unwrap().payload(), &payload("m1"));
        assert_eq!(queue.pop().unwrap().payload(), &payload("m2"));
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let mut queue = MessageQueue::new(2);
        queue.add(payload("m1"), None);
        queue.add(payload("m2"), None);
        let evicted = queue.add(payload("m3"), None).unwrap();
        assert_eq!(evicted.payload(), &payload("m1"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().payload(), &payload("m2"));
        assert_eq!(queue.pop().unwrap().payload(), &payload("m3"));
    }

    #[test]
    fn numbering_is_monotonic_across_pops() {
        let mut queue = MessageQueue::new(2);
        queue.add(payload("m1"), None);
        queue.pop();
        queue.add(payload("m2"), None);
        queue.add(payload("m3"), None);
        // m2 was enqueued after m1 was popped and still precedes m3.
        assert_eq!(queue.pop().unwrap().payload(), &payload("m2"));
        assert_eq!(queue.pop().unwrap().payload(), &payload("m3"));
    }

    #[tokio::test]
    async fn resolve_fires_the_promise() {
        let mut queue = MessageQueue::new(2);
        let (tx, rx) = oneshot::channel();
        queue.add(payload("m1"), Some(tx));
        queue.pop().unwrap().resolve(Ok(()));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropped_item_leaves_promise_unresolved() {
        let mut queue = MessageQueue::new(2);
        let (tx, rx) = oneshot::channel();
        queue.add(payload("m1"), Some(tx));
        drop(queue.pop());
        // Receiver observes cancellation, not an error value.
        assert!(rx.await.is_err());
    }
}
