//! Notifications published by the scheduler and its status snapshot.

use chrono::{DateTime, TimeDelta, Utc};

use crate::feed::FetchErrorKind;
use crate::storage::FeedId;

/// Control-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Nothing queued or in flight
    Idle,
    /// At least one fetch is queued or running
    Running,
    /// Dispatch suspended by request; due feeds accumulate
    Paused,
    /// Network reported unreachable; nothing is dispatched
    OfflineWaiting,
}

/// Informational events broadcast to every subscriber.
///
/// Delivery is best-effort: a lagging subscriber misses events rather than
/// slowing the scheduler down.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Number of fetches currently in flight; `0` means idle
    Progress { in_flight: usize },
    /// A fetch finished and its outcome was persisted
    FeedCompleted {
        feed_id: FeedId,
        changed: bool,
        error: Option<FetchErrorKind>,
        consecutive_errors: u32,
    },
    IconUpdated { feed_id: FeedId },
    NetworkStatusChanged { reachable: bool },
    /// The single wake-up timer moved (`None` = no timer armed)
    ScheduleChanged { next_wake: Option<DateTime<Utc>> },
    /// Aggregate progress of a background batch
    BatchProgress { batch: u64, remaining: usize },
    PhaseChanged(SchedulerPhase),
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStatus {
    pub phase: SchedulerPhase,
    pub in_flight: usize,
    pub queued: usize,
    /// Icon lookups still running
    pub icons_in_flight: usize,
    pub paused: bool,
    pub online: bool,
    pub next_wake: Option<DateTime<Utc>>,
}

impl SchedulerStatus {
    /// True while any fetch is queued or running.
    pub fn is_updating(&self) -> bool {
        self.in_flight > 0 || self.queued > 0
    }

    /// True when no feed or icon work is outstanding.
    pub fn is_idle(&self) -> bool {
        !self.is_updating() && self.icons_in_flight == 0
    }

    /// Time left until the wake-up timer fires, zero if it is overdue.
    pub fn time_until_next_update(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.next_wake
            .map(|wake| (wake - now).max(TimeDelta::zero()))
    }
}

/// Summary delivered when a `download_list` batch finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    /// Feeds fetched successfully (changed or not)
    pub completed: usize,
    pub failed: Vec<(FeedId, FetchErrorKind)>,
    /// Feeds dropped before finishing (deleted, shut down, or already queued elsewhere)
    pub skipped: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed.len() + self.skipped
    }
}
