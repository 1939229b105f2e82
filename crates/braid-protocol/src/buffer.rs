//! Holding areas for messages that cannot be propagated yet.
//!
//! [`MessageBuffer`] parks messages for streams with no outbound neighbors
//! until a neighbor appears or a TTL lapses. [`SeenButNotPropagated`]
//! remembers the identities of such parked first sightings so a second
//! copy arriving meanwhile is still treated as propagatable rather than as
//! a plain duplicate.
//!
//! Both are pure data structures; callers supply `now` so the runtime's
//! clock (including a paused test clock) drives expiry.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::identifiers::{MessageId, StreamPartition};

pub const DEFAULT_BUFFER_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_BUFFER_MAX_SIZE: usize = 10_000;

/// Time- and size-bounded buffer of undeliverable messages, keyed by
/// stream partition.
#[derive(Debug)]
pub struct MessageBuffer<M> {
    entries: HashMap<StreamPartition, VecDeque<(M, Instant)>>,
    ttl: Duration,
    max_size: usize,
    size: usize,
}

impl<M> MessageBuffer<M> {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        assert!(max_size > 0, "buffer size must be positive");
        Self {
            entries: HashMap::new(),
            ttl,
            max_size,
            size: 0,
        }
    }

    /// Buffer a message. When the buffer is full the oldest entry across
    /// all streams is evicted and returned.
    pub fn put_at(&mut self, stream: &StreamPartition, message: M, now: Instant) -> Option<M> {
        let evicted = if self.size >= self.max_size {
            self.evict_oldest()
        } else {
            None
        };
        self.entries
            .entry(stream.clone())
            .or_default()
            .push_back((message, now));
        self.size += 1;
        evicted
    }

    /// Drain every buffered message for a stream, oldest first.
    pub fn pop_all(&mut self, stream: &StreamPartition) -> Vec<M> {
        match self.entries.remove(stream) {
            Some(queue) => {
                self.size -= queue.len();
                queue.into_iter().map(|(message, _)| message).collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop entries older than the TTL. Returns how many were dropped.
    pub fn expire_at(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut dropped = 0;
        self.entries.retain(|_, queue| {
            while queue
                .front()
                .is_some_and(|(_, buffered_at)| *buffered_at + ttl <= now)
            {
                queue.pop_front();
                dropped += 1;
            }
            !queue.is_empty()
        });
        self.size -= dropped;
        dropped
    }

    /// Discard everything buffered for a stream. Returns how many entries
    /// were dropped.
    pub fn clear(&mut self, stream: &StreamPartition) -> usize {
        match self.entries.remove(stream) {
            Some(queue) => {
                self.size -= queue.len();
                queue.len()
            }
            None => 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn evict_oldest(&mut self) -> Option<M> {
        let oldest_stream = self
            .entries
            .iter()
            .filter_map(|(stream, queue)| queue.front().map(|(_, at)| (stream.clone(), *at)))
            .min_by_key(|(_, at)| *at)
            .map(|(stream, _)| stream)?;
        let queue = self.entries.get_mut(&oldest_stream)?;
        let evicted = queue.pop_front().map(|(message, _)| message);
        if queue.is_empty() {
            self.entries.remove(&oldest_stream);
        }
        if evicted.is_some() {
            self.size -= 1;
        }
        evicted
    }
}

pub const DEFAULT_SEEN_CAPACITY: usize = 50_000;
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(60);

/// LRU set of message identities that were seen but parked in the buffer.
///
/// Entries also age out after a TTL so a stream that stays neighborless
/// does not keep stale identities alive forever.
#[derive(Debug)]
pub struct SeenButNotPropagated {
    cache: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl SeenButNotPropagated {
    pub fn new() -> Self {
        Self::with(DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL)
    }

    pub fn with(capacity: usize, ttl: Duration) -> Self {
        let capacity = match NonZeroUsize::new(capacity) {
            Some(capacity) => capacity,
            None => panic!("seen capacity must be positive"),
        };
        Self {
            cache: LruCache::new(capacity),
            ttl,
        }
    }

    pub fn insert_at(&mut self, id: MessageId, now: Instant) {
        self.cache.put(id, now);
    }

    pub fn remove(&mut self, id: &MessageId) {
        self.cache.pop(id);
    }

    pub fn contains_at(&mut self, id: &MessageId, now: Instant) -> bool {
        match self.cache.peek(id) {
            Some(seen_at) if *seen_at + self.ttl > now => true,
            Some(_) => {
                self.cache.pop(id);
                false
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for SeenButNotPropagated {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(n: u32) -> StreamPartition {
        StreamPartition::new("s", n)
    }

    fn id(ts: u64) -> MessageId {
        MessageId::new(stream(0), ts, 0, "p", "c")
    }

    #[test]
    fn test_buffer_drains_in_insertion_order() {
        let mut buffer = MessageBuffer::new(DEFAULT_BUFFER_TTL, 10);
        let now = Instant::now();
        assert!(buffer.put_at(&stream(0), "a", now).is_none());
        assert!(buffer.put_at(&stream(0), "b", now).is_none());
        assert!(buffer.put_at(&stream(1), "x", now).is_none());
        assert_eq!(buffer.size(), 3);
        assert_eq!(buffer.pop_all(&stream(0)), vec!["a", "b"]);
        assert_eq!(buffer.size(), 1);
        assert!(buffer.pop_all(&stream(0)).is_empty());
    }

    #[test]
    fn test_buffer_expires_by_ttl() {
        let mut buffer = MessageBuffer::new(Duration::from_secs(60), 10);
        let t0 = Instant::now();
        buffer.put_at(&stream(0), "old", t0);
        buffer.put_at(&stream(0), "young", t0 + Duration::from_secs(30));
        assert_eq!(buffer.expire_at(t0 + Duration::from_secs(61)), 1);
        assert_eq!(buffer.pop_all(&stream(0)), vec!["young"]);
    }

    #[test]
    fn test_full_buffer_evicts_globally_oldest() {
        let mut buffer = MessageBuffer::new(DEFAULT_BUFFER_TTL, 2);
        let t0 = Instant::now();
        buffer.put_at(&stream(1), "oldest", t0);
        buffer.put_at(&stream(0), "middle", t0 + Duration::from_secs(1));
        let evicted = buffer.put_at(&stream(0), "newest", t0 + Duration::from_secs(2));
        assert_eq!(evicted, Some("oldest"));
        assert_eq!(buffer.size(), 2);
        assert!(buffer.pop_all(&stream(1)).is_empty());
    }

    #[test]
    fn test_clear_reports_dropped_count() {
        let mut buffer = MessageBuffer::new(DEFAULT_BUFFER_TTL, 10);
        let now = Instant::now();
        buffer.put_at(&stream(0), 1, now);
        buffer.put_at(&stream(0), 2, now);
        assert_eq!(buffer.clear(&stream(0)), 2);
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.clear(&stream(0)), 0);
    }

    #[test]
    fn test_seen_remembers_until_ttl() {
        let mut seen = SeenButNotPropagated::with(10, Duration::from_secs(60));
        let t0 = Instant::now();
        seen.insert_at(id(1), t0);
        assert!(seen.contains_at(&id(1), t0 + Duration::from_secs(59)));
        assert!(!seen.contains_at(&id(1), t0 + Duration::from_secs(60)));
        // Expired entry was dropped eagerly.
        assert!(seen.is_empty());
    }

    #[test]
    fn test_seen_capacity_evicts_least_recent() {
        let mut seen = SeenButNotPropagated::with(2, Duration::from_secs(60));
        let t0 = Instant::now();
        seen.insert_at(id(1), t0);
        seen.insert_at(id(2), t0);
        seen.insert_at(id(3), t0);
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains_at(&id(1), t0));
        assert!(seen.contains_at(&id(2), t0));
        assert!(seen.contains_at(&id(3), t0));
    }

    #[test]
    fn test_seen_remove() {
        let mut seen = SeenButNotPropagated::new();
        let t0 = Instant::now();
        seen.insert_at(id(1), t0);
        seen.remove(&id(1));
        assert!(!seen.contains_at(&id(1), t0));
    }
}
