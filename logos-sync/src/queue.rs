//! Ordered buffer of remote step batches.
//!
//! Batches are kept sorted by start version ascending; among batches that
//! start at the same version the one reaching further sorts first, and
//! exact ties keep arrival order. `drain` releases only batches that are
//! contiguous with the known document version, so the document model sees
//! a strictly increasing, gap-free sequence whatever the arrival order.
//!
//! Each pending batch meets one of four fates while draining:
//!
//! - accepted: it starts exactly at the current version
//! - obsolete: it ends at or before the current version and is discarded
//! - trimmed: it starts before the current version but ends after it, so
//!   the already-applied prefix is dropped and the rest is accepted
//! - gap: it starts after the current version; draining stops there
//!
//! ```text
//! current = 10
//!
//!   pending: [10→12] [10→11] [11→14] [15→16]
//!              │        │       │        │
//!            accept   obsolete  trim     gap (14 ≠ 15): stop, keep queued
//!                               to 12→14
//! ```

use std::cmp::Reverse;
use std::collections::VecDeque;

use crate::error::SyncError;
use crate::protocol::StepBatch;

/// A version discontinuity found while draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Version the next batch had to start at.
    pub expected: u64,
    /// Version the lowest pending batch actually starts at.
    pub found: u64,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Batches to forward, in version order.
    pub accepted: Vec<StepBatch>,
    /// Batches dropped because everything they carry is already applied.
    pub discarded: usize,
    pub gap: Option<Gap>,
}

impl DrainOutcome {
    pub fn gap_detected(&self) -> bool {
        self.gap.is_some()
    }

    /// Version reached after the accepted batches, if any were accepted.
    pub fn reached_version(&self) -> Option<u64> {
        self.accepted.last().map(|b| b.version)
    }
}

#[derive(Debug, Default)]
pub struct StepQueue {
    pending: VecDeque<StepBatch>,
}

fn sort_key(batch: &StepBatch) -> (u64, Reverse<u64>) {
    (batch.start_version().unwrap_or(0), Reverse(batch.version))
}

impl StepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a batch at its sorted position. Malformed batches are refused.
    pub fn enqueue(&mut self, batch: StepBatch) -> Result<(), SyncError> {
        batch.validate()?;
        let key = sort_key(&batch);
        let pos = self.pending.partition_point(|b| sort_key(b) <= key);
        self.pending.insert(pos, batch);
        Ok(())
    }

    /// Release every batch contiguous with `current_version`.
    ///
    /// Stops at the first gap, leaving the offending batch queued.
    pub fn drain(&mut self, current_version: u64) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();
        let mut current = current_version;

        while let Some(first) = self.pending.front() {
            let expected = current + first.len() as u64;

            if first.version > expected {
                outcome.gap = Some(Gap {
                    expected: current,
                    found: first.start_version().unwrap_or(0),
                });
                log::debug!(
                    "Gap: batch starts at {} but document is at {}",
                    first.start_version().unwrap_or(0),
                    current
                );
                break;
            }

            let Some(mut batch) = self.pending.pop_front() else {
                break;
            };

            if batch.version == expected {
                current = batch.version;
                outcome.accepted.push(batch);
            } else if batch.version <= current {
                log::debug!(
                    "Discarding obsolete batch ending at {} (document at {})",
                    batch.version,
                    current
                );
                outcome.discarded += 1;
            } else {
                // Starts before `current` but ends after it: drop the
                // prefix that is already applied.
                let applied = (expected - batch.version) as usize;
                batch.steps.drain(..applied);
                log::debug!(
                    "Trimmed {} applied steps from batch ending at {}",
                    applied,
                    batch.version
                );
                current = batch.version;
                outcome.accepted.push(batch);
            }
        }

        outcome
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending batches in sorted order.
    pub fn pending(&self) -> impl Iterator<Item = &StepBatch> {
        self.pending.iter()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Step;

    fn step(tag: u8) -> Step {
        Step::new("remote", vec![tag])
    }

    fn batch(version: u64, tags: &[u8]) -> StepBatch {
        StepBatch::new(version, tags.iter().map(|t| step(*t)).collect())
    }

    fn versions(batches: &[StepBatch]) -> Vec<u64> {
        batches.iter().map(|b| b.version).collect()
    }

    #[test]
    fn test_contiguous_batch_accepted() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(9, &[1, 2, 3, 4])).unwrap();

        let outcome = queue.drain(5);
        assert_eq!(versions(&outcome.accepted), vec![9]);
        assert!(!outcome.gap_detected());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_larger_reach_sorts_first_and_shorter_is_obsolete() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(12, &[1, 2])).unwrap();
        queue.enqueue(batch(11, &[1])).unwrap();

        let order: Vec<u64> = queue.pending().map(|b| b.version).collect();
        assert_eq!(order, vec![12, 11]);

        let outcome = queue.drain(10);
        assert_eq!(versions(&outcome.accepted), vec![12]);
        assert_eq!(outcome.discarded, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shorter_first_arrival_still_sorted_behind() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(11, &[1])).unwrap();
        queue.enqueue(batch(12, &[1, 2])).unwrap();

        let outcome = queue.drain(10);
        assert_eq!(versions(&outcome.accepted), vec![12]);
        assert_eq!(outcome.reached_version(), Some(12));
    }

    #[test]
    fn test_gap_keeps_batch_queued() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(9, &[1, 2])).unwrap();

        let outcome = queue.drain(5);
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.gap, Some(Gap { expected: 5, found: 7 }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_out_of_order_arrival_forwarded_in_order() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(8, &[7, 8])).unwrap();
        queue.enqueue(batch(4, &[3, 4])).unwrap();
        queue.enqueue(batch(6, &[5, 6])).unwrap();

        // 2→4 is missing
        let outcome = queue.drain(0);
        assert!(outcome.gap_detected());
        assert_eq!(queue.len(), 3);

        queue.enqueue(batch(2, &[1, 2])).unwrap();
        let outcome = queue.drain(0);
        assert_eq!(versions(&outcome.accepted), vec![2, 4, 6, 8]);
        assert!(!outcome.gap_detected());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_redelivery_is_noop() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(3, &[1, 2, 3])).unwrap();
        queue.enqueue(batch(2, &[1, 2])).unwrap();

        let outcome = queue.drain(3);
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.discarded, 2);
        assert!(!outcome.gap_detected());
    }

    #[test]
    fn test_straddling_batch_is_trimmed() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(12, &[9, 10, 11])).unwrap();

        let outcome = queue.drain(10);
        assert_eq!(outcome.accepted.len(), 1);
        let accepted = &outcome.accepted[0];
        assert_eq!(accepted.version, 12);
        assert_eq!(accepted.steps, vec![step(10), step(11)]);
    }

    #[test]
    fn test_drain_stops_after_gap_even_with_later_contiguous() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(3, &[1])).unwrap();
        queue.enqueue(batch(1, &[0])).unwrap();

        let outcome = queue.drain(0);
        assert_eq!(versions(&outcome.accepted), vec![1]);
        assert_eq!(outcome.gap, Some(Gap { expected: 1, found: 2 }));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_equal_keys_keep_arrival_order() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(2, &[1, 2])).unwrap();
        queue.enqueue(batch(2, &[3, 4])).unwrap();

        let outcome = queue.drain(0);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].steps, vec![step(1), step(2)]);
        assert_eq!(outcome.discarded, 1);
    }

    #[test]
    fn test_malformed_batches_refused() {
        let mut queue = StepQueue::new();
        assert!(queue.enqueue(StepBatch::new(5, Vec::new())).is_err());
        assert!(queue.enqueue(batch(1, &[1, 2])).is_err());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_empty_queue() {
        let mut queue = StepQueue::new();
        let outcome = queue.drain(7);
        assert_eq!(outcome, DrainOutcome::default());
    }

    #[test]
    fn test_clear() {
        let mut queue = StepQueue::new();
        queue.enqueue(batch(9, &[1])).unwrap();
        queue.clear();
        assert!(queue.is_empty());
    }
}
