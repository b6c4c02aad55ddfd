//! Per-sequence-space ordering
//!
//! A sequence space is identified by (sender, receiver, delivery mode).
//! Senders number sequential messages when their first fragment goes out.
//! Receivers deliver best-effort sequential messages only if they are newer
//! than the last one delivered, and hold guaranteed sequential messages until
//! every older message has arrived.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::message::DeliveryMode;

/// Identity of one sequence space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceKey {
    pub sender: u64,
    pub receiver: u64,
    pub delivery: DeliveryMode,
}

impl SequenceKey {
    pub fn new(sender: u64, receiver: u64, delivery: DeliveryMode) -> Self {
        Self {
            sender,
            receiver,
            delivery,
        }
    }
}

// ----------------------------------------------------------------------------
// Sender Side
// ----------------------------------------------------------------------------

/// Hands out the next sequence number for each space
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    next: HashMap<SequenceKey, u32>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, key: SequenceKey) -> u32 {
        let slot = self.next.entry(key).or_insert(0);
        let seq = *slot;
        *slot = slot.wrapping_add(1);
        seq
    }

    /// Forget every space that involves an endpoint that is gone
    pub fn forget(&mut self, id: u64) {
        self.next.retain(|key, _| key.sender != id && key.receiver != id);
    }
}

// ----------------------------------------------------------------------------
// Receiver Side
// ----------------------------------------------------------------------------

/// Outcome of offering a sequential message to the tracker
#[derive(Debug, PartialEq, Eq)]
pub enum SequenceOutcome<T> {
    /// Messages now deliverable, oldest first
    Deliver(Vec<T>),
    /// Held until older messages arrive
    Buffered,
    /// Older than something already delivered
    Stale,
    /// Reorder buffer is full; the message was dropped
    Overflow,
}

#[derive(Debug)]
struct SpaceState<T> {
    /// Best effort: last delivered; guaranteed: next expected
    cursor: Option<u32>,
    held: BTreeMap<u32, T>,
}

impl<T> Default for SpaceState<T> {
    fn default() -> Self {
        Self {
            cursor: None,
            held: BTreeMap::new(),
        }
    }
}

/// Receive-side ordering across all sequence spaces of one device
#[derive(Debug)]
pub struct SequenceTracker<T> {
    spaces: HashMap<SequenceKey, SpaceState<T>>,
    reorder_limit: usize,
    stale_drops: u64,
}

impl<T> SequenceTracker<T> {
    pub fn new(reorder_limit: usize) -> Self {
        Self {
            spaces: HashMap::new(),
            reorder_limit,
            stale_drops: 0,
        }
    }

    pub fn accept(&mut self, key: SequenceKey, seq: u32, message: T) -> SequenceOutcome<T> {
        let limit = self.reorder_limit;
        let space = self.spaces.entry(key).or_default();
        let outcome = match key.delivery {
            DeliveryMode::BestEffort => {
                if space.cursor.is_some_and(|last| seq <= last) {
                    SequenceOutcome::Stale
                } else {
                    space.cursor = Some(seq);
                    SequenceOutcome::Deliver(vec![message])
                }
            }
            DeliveryMode::Guaranteed => {
                let expected = space.cursor.unwrap_or(0);
                if seq < expected || space.held.contains_key(&seq) {
                    SequenceOutcome::Stale
                } else if seq == expected {
                    let mut ready = vec![message];
                    let mut next = expected.wrapping_add(1);
                    while let Some(held) = space.held.remove(&next) {
                        ready.push(held);
                        next = next.wrapping_add(1);
                    }
                    space.cursor = Some(next);
                    SequenceOutcome::Deliver(ready)
                } else if space.held.len() >= limit {
                    SequenceOutcome::Overflow
                } else {
                    space.held.insert(seq, message);
                    SequenceOutcome::Buffered
                }
            }
        };
        if matches!(outcome, SequenceOutcome::Stale | SequenceOutcome::Overflow) {
            self.stale_drops += 1;
        }
        outcome
    }

    /// Messages dropped as stale or for lack of buffer space
    pub fn dropped(&self) -> u64 {
        self.stale_drops
    }

    /// Messages currently held for reordering
    pub fn held(&self) -> usize {
        self.spaces.values().map(|space| space.held.len()).sum()
    }

    pub fn forget(&mut self, id: u64) {
        self.spaces.retain(|key, _| key.sender != id && key.receiver != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_numbers_each_space_independently() {
        let mut allocator = SequenceAllocator::new();
        let a = SequenceKey::new(1, 2, DeliveryMode::Guaranteed);
        let b = SequenceKey::new(1, 3, DeliveryMode::Guaranteed);
        let c = SequenceKey::new(1, 2, DeliveryMode::BestEffort);
        assert_eq!(allocator.next(a), 0);
        assert_eq!(allocator.next(a), 1);
        assert_eq!(allocator.next(b), 0);
        assert_eq!(allocator.next(c), 0);
        allocator.forget(2);
        assert_eq!(allocator.next(a), 0);
        assert_eq!(allocator.next(b), 1);
    }

    #[test]
    fn test_best_effort_drops_older_messages() {
        let key = SequenceKey::new(1, 2, DeliveryMode::BestEffort);
        let mut tracker = SequenceTracker::new(8);
        assert_eq!(tracker.accept(key, 0, "a"), SequenceOutcome::Deliver(vec!["a"]));
        assert_eq!(tracker.accept(key, 2, "c"), SequenceOutcome::Deliver(vec!["c"]));
        assert_eq!(tracker.accept(key, 1, "b"), SequenceOutcome::Stale);
        assert_eq!(tracker.dropped(), 1);
    }

    #[test]
    fn test_guaranteed_holds_until_gap_fills() {
        let key = SequenceKey::new(1, 2, DeliveryMode::Guaranteed);
        let mut tracker = SequenceTracker::new(8);
        assert_eq!(tracker.accept(key, 2, "c"), SequenceOutcome::Buffered);
        assert_eq!(tracker.accept(key, 1, "b"), SequenceOutcome::Buffered);
        assert_eq!(tracker.held(), 2);
        assert_eq!(
            tracker.accept(key, 0, "a"),
            SequenceOutcome::Deliver(vec!["a", "b", "c"])
        );
        assert_eq!(tracker.accept(key, 1, "b"), SequenceOutcome::Stale);
        assert_eq!(tracker.held(), 0);
    }

    #[test]
    fn test_reorder_buffer_bound() {
        let key = SequenceKey::new(1, 2, DeliveryMode::Guaranteed);
        let mut tracker = SequenceTracker::new(1);
        assert_eq!(tracker.accept(key, 1, 1), SequenceOutcome::Buffered);
        assert_eq!(tracker.accept(key, 2, 2), SequenceOutcome::Overflow);
    }
}
