//! The dispatch queue: waiting entries plus the in-flight registry.
//!
//! Every feed passes through [`DispatchQueue::register`] before it can be
//! fetched, which is what guarantees at most one queued-or-running entry per
//! feed.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio_util::sync::CancellationToken;

use crate::storage::{FeedId, FeedRef};

/// A feed waiting for (or holding) a fetch slot.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub feed: FeedRef,
    /// Enqueued regardless of the feed's due time.
    pub forced: bool,
    /// Triggered by the user; fetched with the shorter urgent timeout.
    pub urgent: bool,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(feed: FeedRef, forced: bool, urgent: bool, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            feed,
            forced,
            urgent,
            enqueued_at,
        }
    }

    pub fn feed_id(&self) -> FeedId {
        self.feed.id
    }
}

#[derive(Debug)]
struct InFlight {
    entry: QueueEntry,
    cancel: CancellationToken,
    /// Put the entry back at the front of the queue once its cancellation lands.
    requeue: bool,
    /// The feed was removed from the store; drop whatever the task reports.
    discarded: bool,
}

/// What to do with a finished task.
#[derive(Debug)]
pub(crate) struct Finished {
    pub entry: QueueEntry,
    pub discarded: bool,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchQueue {
    waiting: VecDeque<QueueEntry>,
    waiting_ids: HashSet<FeedId>,
    in_flight: HashMap<FeedId, InFlight>,
}

impl DispatchQueue {
    /// Adds `entry` unless its feed is already queued or in flight.
    pub fn register(&mut self, entry: QueueEntry) -> bool {
        let id = entry.feed_id();
        if self.contains(id) {
            tracing::trace!(feed_id = %id, "Feed already registered, skipping");
            return false;
        }
        self.waiting_ids.insert(id);
        self.waiting.push_back(entry);
        true
    }

    pub fn contains(&self, id: FeedId) -> bool {
        self.waiting_ids.contains(&id) || self.in_flight.contains_key(&id)
    }

    pub fn is_in_flight(&self, id: FeedId) -> bool {
        self.in_flight.contains_key(&id)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.in_flight.is_empty()
    }

    /// Pops the next waiting entry if fewer than `limit` fetches are running.
    ///
    /// The caller must hand the entry back through [`DispatchQueue::start`].
    pub fn next_dispatchable(&mut self, limit: usize) -> Option<QueueEntry> {
        if self.in_flight.len() >= limit {
            return None;
        }
        let entry = self.waiting.pop_front()?;
        self.waiting_ids.remove(&entry.feed_id());
        Some(entry)
    }

    /// Marks `entry` as running under `cancel`.
    pub fn start(&mut self, entry: QueueEntry, cancel: CancellationToken) {
        self.in_flight.insert(
            entry.feed_id(),
            InFlight {
                entry,
                cancel,
                requeue: false,
                discarded: false,
            },
        );
    }

    /// Releases the slot held by `id`.
    ///
    /// Entries cancelled with `requeue` go back to the front of the queue and
    /// stay registered; `None` is returned for them and for unknown ids.
    pub fn finish(&mut self, id: FeedId) -> Option<Finished> {
        let flight = self.in_flight.remove(&id)?;
        if flight.requeue && !flight.discarded {
            self.waiting_ids.insert(id);
            self.waiting.push_front(flight.entry);
            return None;
        }
        Some(Finished {
            entry: flight.entry,
            discarded: flight.discarded,
        })
    }

    /// Cancels every running fetch. With `requeue`, each entry is retried
    /// first once its task has wound down.
    pub fn cancel_in_flight(&mut self, requeue: bool) -> usize {
        for flight in self.in_flight.values_mut() {
            flight.requeue = requeue;
            flight.cancel.cancel();
        }
        self.in_flight.len()
    }

    /// Forgets a feed: drops its waiting entry and cancels its running fetch.
    pub fn remove(&mut self, id: FeedId) -> bool {
        let mut found = false;
        if self.waiting_ids.remove(&id) {
            self.waiting.retain(|e| e.feed_id() != id);
            found = true;
        }
        if let Some(flight) = self.in_flight.get_mut(&id) {
            flight.discarded = true;
            flight.cancel.cancel();
            found = true;
        }
        found
    }

    /// Drops the waiting entry for `id` if it was queued only because the
    /// feed came due. Forced entries stay.
    pub fn drop_unforced_waiting(&mut self, id: FeedId) -> bool {
        if !self.waiting.iter().any(|e| e.feed_id() == id && !e.forced) {
            return false;
        }
        self.waiting.retain(|e| e.feed_id() != id);
        self.waiting_ids.remove(&id);
        true
    }

    /// Replaces the feed snapshot of a waiting entry (e.g. after a URL change).
    pub fn refresh_waiting(&mut self, feed: &FeedRef) {
        if let Some(entry) = self.waiting.iter_mut().find(|e| e.feed_id() == feed.id) {
            entry.feed = feed.clone();
        }
    }

    /// Drops all waiting entries and cancels everything in flight.
    pub fn clear(&mut self) {
        self.waiting.clear();
        self.waiting_ids.clear();
        for flight in self.in_flight.values_mut() {
            flight.discarded = true;
            flight.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::policy::RefreshInterval;

    fn feed(id: i64) -> FeedRef {
        FeedRef {
            id: FeedId(id),
            url: format!("https://example.com/{id}.xml"),
            site_url: None,
            interval: RefreshInterval::default(),
            has_icon: false,
        }
    }

    fn entry(id: i64) -> QueueEntry {
        QueueEntry::new(feed(id), false, false, Utc::now())
    }

    #[test]
    fn test_register_deduplicates_waiting_and_running() {
        let mut queue = DispatchQueue::default();
        assert!(queue.register(entry(1)));
        assert!(!queue.register(entry(1)));

        let e = queue.next_dispatchable(4).unwrap();
        queue.start(e, CancellationToken::new());
        assert!(!queue.register(entry(1)));
        assert!(queue.is_in_flight(FeedId(1)));
    }

    #[test]
    fn test_limit_bounds_dispatch() {
        let mut queue = DispatchQueue::default();
        for id in 0..10 {
            queue.register(entry(id));
        }
        let mut started = Vec::new();
        while let Some(e) = queue.next_dispatchable(4) {
            started.push(e.feed_id());
            queue.start(e, CancellationToken::new());
        }
        assert_eq!(started, vec![FeedId(0), FeedId(1), FeedId(2), FeedId(3)]);
        assert_eq!(queue.waiting_len(), 6);

        queue.finish(FeedId(1)).unwrap();
        let next = queue.next_dispatchable(4).unwrap();
        assert_eq!(next.feed_id(), FeedId(4));
    }

    #[test]
    fn test_requeued_cancellation_goes_to_front() {
        let mut queue = DispatchQueue::default();
        queue.register(entry(1));
        queue.register(entry(2));
        let first = queue.next_dispatchable(1).unwrap();
        let token = CancellationToken::new();
        queue.start(first, token.clone());

        assert_eq!(queue.cancel_in_flight(true), 1);
        assert!(token.is_cancelled());
        assert!(queue.finish(FeedId(1)).is_none());
        assert!(queue.contains(FeedId(1)));

        let again = queue.next_dispatchable(1).unwrap();
        assert_eq!(again.feed_id(), FeedId(1));
    }

    #[test]
    fn test_remove_discards_running_fetch() {
        let mut queue = DispatchQueue::default();
        queue.register(entry(7));
        queue.register(entry(8));
        let e = queue.next_dispatchable(4).unwrap();
        let token = CancellationToken::new();
        queue.start(e, token.clone());

        assert!(queue.remove(FeedId(7)));
        assert!(queue.remove(FeedId(8)));
        assert!(token.is_cancelled());
        assert_eq!(queue.waiting_len(), 0);

        let finished = queue.finish(FeedId(7)).unwrap();
        assert!(finished.discarded);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_drop_unforced_waiting_keeps_forced_entries() {
        let mut queue = DispatchQueue::default();
        queue.register(entry(1));
        queue.register(QueueEntry::new(feed(2), true, true, Utc::now()));

        assert!(queue.drop_unforced_waiting(FeedId(1)));
        assert!(!queue.drop_unforced_waiting(FeedId(2)));
        assert!(!queue.drop_unforced_waiting(FeedId(3)));
        assert!(!queue.contains(FeedId(1)));
        assert!(queue.contains(FeedId(2)));
        assert_eq!(queue.waiting_len(), 1);
    }
}
