//! Refresh scheduling: when each feed is due, and the actor that fetches it.
//!
//! - [`policy`] - intervals, due checks and error backoff (pure)
//! - [`state`] - per-feed schedule state and conditional-request tokens
//! - [`queue`] - de-duplicating dispatch queue
//! - [`scheduler`] - the control loop and its handle
//! - [`events`] - notifications emitted by the scheduler
//! - [`network`] - optional reachability monitor feeding the scheduler

pub mod events;
pub mod network;
pub mod policy;
pub mod queue;
pub mod scheduler;
pub mod state;

pub use events::{BatchReport, SchedulerEvent, SchedulerPhase, SchedulerStatus};
pub use network::ReachabilityMonitor;
pub use policy::{RefreshInterval, RefreshPolicy, TimeUnit, DEFAULT_BACKOFF_CAP};
pub use queue::QueueEntry;
pub use scheduler::{Scheduler, SchedulerError, SchedulerHandle, SchedulerOptions};
pub use state::{ConditionalCacheState, ScheduleState};
