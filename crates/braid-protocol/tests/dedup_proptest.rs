//! Property tests for per-chain duplicate detection.

use proptest::prelude::*;

use braid_protocol::{DuplicateMessageDetector, MessageRef, NetworkError};

proptest! {
    /// An in-order chain is accepted in full; replaying it reports every
    /// message as a duplicate.
    #[test]
    fn ordered_chain_accepts_then_rejects_replay(len in 1..60u64) {
        let mut detector = DuplicateMessageDetector::new();
        let refs: Vec<MessageRef> = (0..len).map(|i| MessageRef::new(100 + i, 0)).collect();
        for (i, current) in refs.iter().enumerate() {
            let previous = if i == 0 { None } else { Some(refs[i - 1]) };
            prop_assert!(matches!(detector.mark_and_check(previous, *current), Ok(true)));
        }
        for (i, current) in refs.iter().enumerate() {
            let previous = if i == 0 { None } else { Some(refs[i - 1]) };
            prop_assert!(matches!(detector.mark_and_check(previous, *current), Ok(false)));
        }
    }

    /// Unchained messages: each distinct position is accepted exactly once,
    /// whatever the arrival order, and every repeat is flagged.
    #[test]
    fn unchained_positions_accept_once(
        positions in proptest::collection::btree_set((0..1000u64, 0..4u64), 1..60)
            .prop_map(|set| set.into_iter().collect::<Vec<_>>())
            .prop_shuffle(),
    ) {
        let mut detector = DuplicateMessageDetector::new();
        for &(timestamp, sequence) in &positions {
            prop_assert!(matches!(
                detector.mark_and_check(None, MessageRef::new(timestamp, sequence)),
                Ok(true)
            ));
        }
        for &(timestamp, sequence) in &positions {
            prop_assert!(matches!(
                detector.mark_and_check(None, MessageRef::new(timestamp, sequence)),
                Ok(false)
            ));
        }
    }

    /// A previous reference at or past the message itself is invalid and
    /// leaves no trace in the window.
    #[test]
    fn non_monotonic_previous_is_rejected(
        timestamp in 0..1000u64,
        sequence in 0..10u64,
        ahead in 0..5u64,
    ) {
        let mut detector = DuplicateMessageDetector::new();
        let current = MessageRef::new(timestamp, sequence);
        let previous = MessageRef::new(timestamp, sequence + ahead);
        let rejected = matches!(
            detector.mark_and_check(Some(previous), current),
            Err(NetworkError::InvalidNumbering { .. })
        );
        prop_assert!(rejected);
        prop_assert!(detector.is_empty());
    }

    /// A chained message whose previous reference was never seen is flagged
    /// as a gap rather than accepted silently.
    #[test]
    fn missing_previous_reports_a_gap(base in 0..500u64, distance in 1..50u64) {
        let mut detector = DuplicateMessageDetector::new();
        prop_assert!(matches!(
            detector.mark_and_check(None, MessageRef::new(base, 0)),
            Ok(true)
        ));
        let previous = MessageRef::new(base + distance, 0);
        let current = MessageRef::new(base + distance + 1, 0);
        let gap_flagged = matches!(
            detector.mark_and_check(Some(previous), current),
            Err(NetworkError::GapMismatch { .. })
        );
        prop_assert!(gap_flagged);
    }

    /// The retained window never outgrows its capacity.
    #[test]
    fn window_stays_within_capacity(count in 1..400u64, capacity in 1..50usize) {
        let mut detector = DuplicateMessageDetector::with_capacity(capacity);
        for i in 0..count {
            let _ = detector.mark_and_check(None, MessageRef::new(i, 0));
        }
        prop_assert!(detector.len() <= capacity);
    }
}
