//! Double-buffered state change queue
//!
//! Producers enqueue payloads as things happen. `publish` hands everything
//! queued since the previous call to the caller as owned `StateChange`
//! values and moves their release bookkeeping into a concurrent map keyed by
//! token. The caller returns each change through `finish` exactly once, in
//! any order and across overlapping batches, which yields the handles and
//! release actions to settle.
//!
//! The queue does not touch handle tables itself: whoever enqueues is
//! responsible for taking a reference on every handle the payload lists,
//! and whoever finishes releases them.

use core::fmt;
use core::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::errors::{PartyError, Result};
use crate::handle::RawHandle;

/// Implemented by state change payload enums
pub trait StateChangePayload {
    /// Every handle this change mentions; each is kept alive until the
    /// change is finished
    fn handles(&self) -> SmallVec<[RawHandle; 4]>;

    /// Short variant name for logging
    fn kind_name(&self) -> &'static str;
}

/// Opaque identity of one published state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateChangeToken(u64);

impl StateChangeToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// State Change
// ----------------------------------------------------------------------------

/// A published state change
///
/// Deliberately not `Clone`: it must be moved back into `finish`, after
/// which it can no longer be read.
#[derive(Debug)]
pub struct StateChange<C> {
    token: StateChangeToken,
    epoch: u64,
    payload: C,
}

impl<C> StateChange<C> {
    pub fn token(&self) -> StateChangeToken {
        self.token
    }

    /// Publish epoch in which this change was handed out
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn payload(&self) -> &C {
        &self.payload
    }
}

impl<C> Deref for StateChange<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.payload
    }
}

/// Bookkeeping settled when a change is finished
#[derive(Debug)]
pub struct PendingRelease<A> {
    pub handles: SmallVec<[RawHandle; 4]>,
    pub actions: SmallVec<[A; 1]>,
}

#[derive(Debug)]
struct Queued<C, A> {
    token: StateChangeToken,
    payload: C,
    release: PendingRelease<A>,
}

// ----------------------------------------------------------------------------
// Queue
// ----------------------------------------------------------------------------

/// Token map plus publish barrier
#[derive(Debug)]
pub struct StateChangeQueue<C, A> {
    next_token: AtomicU64,
    publish_epoch: AtomicU64,
    pending: Mutex<Vec<Queued<C, A>>>,
    outstanding: DashMap<StateChangeToken, PendingRelease<A>>,
}

impl<C: StateChangePayload, A> Default for StateChangeQueue<C, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: StateChangePayload, A> StateChangeQueue<C, A> {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            publish_epoch: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            outstanding: DashMap::new(),
        }
    }

    /// Buffer a change until the next publish
    pub fn enqueue<I>(&self, payload: C, actions: I) -> StateChangeToken
    where
        I: IntoIterator<Item = A>,
    {
        let token = StateChangeToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let release = PendingRelease {
            handles: payload.handles(),
            actions: actions.into_iter().collect(),
        };
        tracing::trace!(token = token.0, kind = payload.kind_name(), "state change queued");
        self.pending.lock().push(Queued {
            token,
            payload,
            release,
        });
        token
    }

    /// Hand out everything queued since the previous publish
    pub fn publish(&self) -> Vec<StateChange<C>> {
        let drained = std::mem::take(&mut *self.pending.lock());
        let epoch = self.publish_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        drained
            .into_iter()
            .map(|queued| {
                self.outstanding.insert(queued.token, queued.release);
                StateChange {
                    token: queued.token,
                    epoch,
                    payload: queued.payload,
                }
            })
            .collect()
    }

    /// Accept a published change back; each token may be finished once
    pub fn finish(&self, token: StateChangeToken) -> Result<PendingRelease<A>> {
        self.outstanding
            .remove(&token)
            .map(|(_, release)| release)
            .ok_or(PartyError::UnknownStateChange { token: token.0 })
    }

    /// Whether a token was published and not yet finished
    pub fn is_outstanding(&self, token: StateChangeToken) -> bool {
        self.outstanding.contains_key(&token)
    }

    /// Drop every queued and outstanding change, returning their releases
    pub fn drain_all(&self) -> Vec<PendingRelease<A>> {
        let mut releases: Vec<_> = std::mem::take(&mut *self.pending.lock())
            .into_iter()
            .map(|queued| queued.release)
            .collect();
        let tokens: Vec<_> = self.outstanding.iter().map(|entry| *entry.key()).collect();
        for token in tokens {
            if let Some((_, release)) = self.outstanding.remove(&token) {
                releases.push(release);
            }
        }
        releases
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn publish_epoch(&self) -> u64 {
        self.publish_epoch.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{Entity, HandleKind, HandleTable};
    use smallvec::smallvec;

    struct Thing;

    impl Entity for Thing {
        const KIND: HandleKind = HandleKind::Device;
    }

    #[derive(Debug)]
    enum Change {
        Plain(u32),
        About(RawHandle),
    }

    impl StateChangePayload for Change {
        fn handles(&self) -> SmallVec<[RawHandle; 4]> {
            match self {
                Change::Plain(_) => SmallVec::new(),
                Change::About(handle) => smallvec![*handle],
            }
        }

        fn kind_name(&self) -> &'static str {
            match self {
                Change::Plain(_) => "Plain",
                Change::About(_) => "About",
            }
        }
    }

    fn plain(change: &StateChange<Change>) -> Option<u32> {
        match change.payload() {
            Change::Plain(n) => Some(*n),
            Change::About(_) => None,
        }
    }

    #[test]
    fn test_publish_returns_everything_since_previous_call() {
        let queue: StateChangeQueue<Change, ()> = StateChangeQueue::new();
        queue.enqueue(Change::Plain(1), None);
        queue.enqueue(Change::Plain(2), None);

        let first = queue.publish();
        assert_eq!(first.iter().map(plain).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
        assert!(queue.publish().is_empty());
        assert_eq!(queue.outstanding_len(), 2);
        assert_eq!(queue.publish_epoch(), 2);

        queue.enqueue(Change::Plain(3), None);
        let second = queue.publish();
        assert_eq!(second.len(), 1);
        assert_eq!(plain(&second[0]), Some(3));
        assert!(second[0].epoch() > first[0].epoch());
    }

    #[test]
    fn test_finish_out_of_order_and_exactly_once() {
        let queue: StateChangeQueue<Change, &'static str> = StateChangeQueue::new();
        queue.enqueue(Change::Plain(1), Some("first"));
        queue.enqueue(Change::Plain(2), Some("second"));
        let mut published = queue.publish();

        let last = published.pop().unwrap();
        let first = published.pop().unwrap();
        let token = last.token();
        assert_eq!(queue.finish(token).unwrap().actions.as_slice(), &["second"]);
        assert!(matches!(
            queue.finish(token),
            Err(PartyError::UnknownStateChange { .. })
        ));
        assert_eq!(queue.finish(first.token()).unwrap().actions.as_slice(), &["first"]);
        assert_eq!(queue.outstanding_len(), 0);
    }

    #[test]
    fn test_release_lists_payload_handles() {
        let mut table = HandleTable::new();
        let handle = table.allocate(Thing);
        let queue: StateChangeQueue<Change, ()> = StateChangeQueue::new();
        queue.enqueue(Change::About(handle.raw()), None);
        table.add_ref(handle).unwrap();
        table.mark_pending_destroy(handle).unwrap();

        let change = queue.publish().pop().unwrap();
        assert!(matches!(&*change, Change::About(_)));
        let release = queue.finish(change.token()).unwrap();
        for raw in release.handles {
            let typed = raw.typed::<Thing>().unwrap();
            table.release(typed).unwrap();
        }
        assert!(!table.contains(handle));
    }

    #[test]
    fn test_drain_all_collects_pending_and_outstanding() {
        let queue: StateChangeQueue<Change, u8> = StateChangeQueue::new();
        queue.enqueue(Change::Plain(1), Some(1));
        let _published = queue.publish();
        queue.enqueue(Change::Plain(2), Some(2));
        assert_eq!(queue.drain_all().len(), 2);
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.outstanding_len(), 0);
    }
}
