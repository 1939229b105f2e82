//! Per-chain duplicate detection.
//!
//! Each publisher chain gets its own [`DuplicateMessageDetector`] holding a
//! bounded, ordered window of recently seen chain positions. Arrivals are
//! classified as new or duplicate; violations of chain numbering surface as
//! errors for the caller to drop and count, never to crash on.

use std::collections::BTreeSet;

use crate::error::NetworkError;
use crate::identifiers::MessageRef;

/// Entries retained per chain before the oldest are evicted.
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

#[derive(Debug)]
pub struct DuplicateMessageDetector {
    window: BTreeSet<MessageRef>,
    capacity: usize,
}

impl DuplicateMessageDetector {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be positive");
        Self {
            window: BTreeSet::new(),
            capacity,
        }
    }

    /// Classify an arrival and record it.
    ///
    /// Returns `Ok(true)` when the message is new, `Ok(false)` when it is a
    /// duplicate of something in the window. The first message of a chain is
    /// always new. A `previous` that does not precede `current` is an
    /// [`NetworkError::InvalidNumbering`]; a `previous` that falls outside
    /// the retained window is a [`NetworkError::GapMismatch`], meaning the
    /// chain cannot be stitched to what we have seen.
    pub fn mark_and_check(
        &mut self,
        previous: Option<MessageRef>,
        current: MessageRef,
    ) -> Result<bool, NetworkError> {
        if let Some(previous) = previous {
            if previous >= current {
                return Err(NetworkError::InvalidNumbering { previous, current });
            }
        }

        if self.window.is_empty() {
            self.window.insert(current);
            return Ok(true);
        }

        if self.window.contains(&current) {
            return Ok(false);
        }

        if let Some(previous) = previous {
            if !self.window.contains(&previous) {
                let latest = self.window.last().copied().unwrap_or(current);
                return Err(NetworkError::GapMismatch { previous, latest });
            }
        }

        self.window.insert(current);
        while self.window.len() > self.capacity {
            self.window.pop_first();
        }
        Ok(true)
    }

    /// Number of retained chain positions.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

impl Default for DuplicateMessageDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(timestamp: u64, seq: u64) -> MessageRef {
        MessageRef::new(timestamp, seq)
    }

    #[test]
    fn test_chain_in_order_is_all_new() {
        let mut d = DuplicateMessageDetector::new();
        assert!(d.mark_and_check(None, r(1, 0)).unwrap());
        assert!(d.mark_and_check(Some(r(1, 0)), r(2, 0)).unwrap());
        assert!(d.mark_and_check(Some(r(2, 0)), r(3, 0)).unwrap());
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn test_replay_is_a_duplicate() {
        let mut d = DuplicateMessageDetector::new();
        assert!(d.mark_and_check(None, r(1, 0)).unwrap());
        assert!(d.mark_and_check(Some(r(1, 0)), r(2, 0)).unwrap());
        assert!(!d.mark_and_check(Some(r(1, 0)), r(2, 0)).unwrap());
        assert!(!d.mark_and_check(None, r(1, 0)).unwrap());
    }

    #[test]
    fn test_first_message_with_previous_ref_is_accepted() {
        // A node joining mid-stream sees a chained message first.
        let mut d = DuplicateMessageDetector::new();
        assert!(d.mark_and_check(Some(r(4, 0)), r(5, 0)).unwrap());
    }

    #[test]
    fn test_previous_not_before_current_is_invalid_numbering() {
        let mut d = DuplicateMessageDetector::new();
        let err = d.mark_and_check(Some(r(2, 0)), r(2, 0)).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidNumbering { .. }));
        let err = d.mark_and_check(Some(r(3, 1)), r(3, 0)).unwrap_err();
        assert!(matches!(err, NetworkError::InvalidNumbering { .. }));
        // Nothing was recorded.
        assert!(d.is_empty());
    }

    #[test]
    fn test_unknown_previous_is_a_gap_mismatch() {
        let mut d = DuplicateMessageDetector::new();
        assert!(d.mark_and_check(None, r(1, 0)).unwrap());
        let err = d.mark_and_check(Some(r(7, 0)), r(8, 0)).unwrap_err();
        match err {
            NetworkError::GapMismatch { previous, latest } => {
                assert_eq!(previous, r(7, 0));
                assert_eq!(latest, r(1, 0));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_out_of_order_arrivals_stitch_back_together() {
        let mut d = DuplicateMessageDetector::new();
        assert!(d.mark_and_check(None, r(1, 0)).unwrap());
        // 3 overtakes 2 but still chains from 1.
        assert!(d.mark_and_check(Some(r(1, 0)), r(3, 0)).unwrap());
        assert!(d.mark_and_check(Some(r(1, 0)), r(2, 0)).unwrap());
        assert!(!d.mark_and_check(Some(r(1, 0)), r(2, 0)).unwrap());
    }

    #[test]
    fn test_window_evicts_oldest_at_capacity() {
        let mut d = DuplicateMessageDetector::with_capacity(3);
        for ts in 1..=5 {
            let previous = if ts == 1 { None } else { Some(r(ts - 1, 0)) };
            assert!(d.mark_and_check(previous, r(ts, 0)).unwrap());
        }
        assert_eq!(d.len(), 3);
        // A reference to an evicted position can no longer be stitched.
        let err = d.mark_and_check(Some(r(1, 0)), r(6, 0)).unwrap_err();
        assert!(matches!(err, NetworkError::GapMismatch { .. }));
    }

    #[test]
    #[should_panic(expected = "window capacity must be positive")]
    fn test_zero_capacity_panics() {
        let _ = DuplicateMessageDetector::with_capacity(0);
    }
}
