//! The refresh control loop.
//!
//! [`Scheduler`] is a single tokio task owning the dispatch queue, the
//! pause/online flags and the one wake-up timer. Everything else talks to it
//! through a [`SchedulerHandle`]: commands arrive on an mpsc channel, fetch
//! and icon tasks report back on a second channel, and notifications go out
//! on a broadcast channel. All state mutation happens inside the loop, one
//! message at a time.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{BatchReport, SchedulerEvent, SchedulerPhase, SchedulerStatus};
use super::policy::RefreshPolicy;
use super::queue::{DispatchQueue, QueueEntry};
use super::state::ScheduleState;
use crate::feed::{
    build_client, FetchErrorKind, FetchOptions, FetchOutcome, FetchTask, IconFetchTask,
    IconOptions, IconOutcome, IconRequest, DEFAULT_MAX_FEED_SIZE, DEFAULT_MAX_ICON_SIZE,
    DEFAULT_MAX_REDIRECTS,
};
use crate::storage::{FeedId, FeedRef, FeedStore, StoreError};

const COMMAND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 256;
const MAX_CONCURRENT_ICON_FETCHES: usize = 2;
/// Upper bound on a single timer sleep; the loop re-arms after waking.
const MAX_TIMER_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);
/// Floor between now and the next wake-up so an overdue feed cannot spin the loop.
const MIN_WAKE_DELAY_SECS: i64 = 1;

pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 6;
pub const DEFAULT_USER_AGENT: &str = concat!("feedwatch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Persistence failed; the loop has stopped
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    /// The scheduler task is gone
    #[error("Scheduler is not running")]
    Stopped,

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Runtime knobs for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrent_fetches: usize,
    pub policy: RefreshPolicy,
    /// Timeout for background fetches
    pub request_timeout: Duration,
    /// Timeout for user-initiated fetches
    pub urgent_request_timeout: Duration,
    pub max_redirects: usize,
    pub max_feed_size_bytes: usize,
    pub max_icon_size_bytes: usize,
    pub icon_dir: PathBuf,
    pub user_agent: String,
    pub allow_private_hosts: bool,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            policy: RefreshPolicy::default(),
            request_timeout: Duration::from_secs(90),
            urgent_request_timeout: Duration::from_secs(30),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_feed_size_bytes: DEFAULT_MAX_FEED_SIZE,
            max_icon_size_bytes: DEFAULT_MAX_ICON_SIZE,
            icon_dir: std::env::temp_dir().join("feedwatch-icons"),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            allow_private_hosts: false,
        }
    }
}

enum Command {
    ScheduleNext,
    ForceUpdate(FeedId),
    ForceUpdateAll,
    DownloadList {
        feeds: Vec<FeedRef>,
        user_initiated: bool,
        reply: oneshot::Sender<BatchReport>,
    },
    Pause,
    Resume,
    NetworkChanged(bool),
    FeedRemoved(FeedId),
    IntervalChanged(FeedId),
    RefreshAllIcons,
    Status(oneshot::Sender<SchedulerStatus>),
    Shutdown,
}

enum Completion {
    Fetch { feed_id: FeedId, outcome: FetchOutcome },
    Icon { feed_id: FeedId, outcome: IconOutcome },
}

/// How one feed ended as far as a batch is concerned.
enum BatchResult {
    Completed,
    Failed(FetchErrorKind),
    Skipped,
}

struct Batch {
    id: u64,
    pending: HashSet<FeedId>,
    user_initiated: bool,
    report: BatchReport,
    reply: oneshot::Sender<BatchReport>,
}

/// Cloneable entry point into a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerHandle {
    /// New receiver for scheduler notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Queues every due feed and re-arms the wake-up timer.
    pub async fn schedule_next_feed(&self) -> Result<(), SchedulerError> {
        self.send(Command::ScheduleNext).await
    }

    /// Fetches one feed now, regardless of its due time.
    pub async fn force_update(&self, feed_id: FeedId) -> Result<(), SchedulerError> {
        self.send(Command::ForceUpdate(feed_id)).await
    }

    /// Fetches every enabled feed now, earliest due first.
    pub async fn force_update_all(&self) -> Result<(), SchedulerError> {
        self.send(Command::ForceUpdateAll).await
    }

    /// Fetches `feeds` as one batch; the receiver resolves once all of them
    /// have finished.
    pub async fn download_list(
        &self,
        feeds: Vec<FeedRef>,
        user_initiated: bool,
    ) -> Result<oneshot::Receiver<BatchReport>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DownloadList {
            feeds,
            user_initiated,
            reply,
        })
        .await?;
        Ok(rx)
    }

    /// Stops dispatching new fetches. Running fetches finish normally.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send(Command::Resume).await
    }

    /// Reports network reachability. Going offline cancels running fetches.
    pub async fn network_changed(&self, reachable: bool) -> Result<(), SchedulerError> {
        self.send(Command::NetworkChanged(reachable)).await
    }

    /// The feed was deleted from the store; forget it without writing.
    pub async fn feed_removed(&self, feed_id: FeedId) -> Result<(), SchedulerError> {
        self.send(Command::FeedRemoved(feed_id)).await
    }

    /// The feed's interval changed in the store.
    pub async fn interval_changed(&self, feed_id: FeedId) -> Result<(), SchedulerError> {
        self.send(Command::IntervalChanged(feed_id)).await
    }

    /// Re-resolves the icon of every feed.
    pub async fn refresh_all_icons(&self) -> Result<(), SchedulerError> {
        self.send(Command::RefreshAllIcons).await
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Cancels all queued and running work and stops the loop.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send(Command::Shutdown).await
    }

    /// Waits until no fetch or icon lookup is queued or running.
    ///
    /// Never returns while paused or offline with work queued.
    pub async fn wait_until_idle(&self) -> Result<(), SchedulerError> {
        let mut events = self.subscribe();
        loop {
            if self.status().await?.is_idle() {
                return Ok(());
            }
            // Any event (or a quiet second) is a reason to look again
            let _ = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        }
    }
}

/// The actor behind [`SchedulerHandle`].
pub struct Scheduler {
    store: Arc<dyn FeedStore>,
    options: SchedulerOptions,
    client: reqwest::Client,
    queue: DispatchQueue,
    paused: bool,
    online: bool,
    phase: SchedulerPhase,
    next_wake: Option<DateTime<Utc>>,
    reported_in_flight: usize,
    events: broadcast::Sender<SchedulerEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    /// Parent of every task token; cancelled on shutdown
    root: CancellationToken,
    icon_slots: Arc<Semaphore>,
    icons_in_flight: HashSet<FeedId>,
    batches: Vec<Batch>,
    next_batch_id: u64,
}

impl Scheduler {
    /// Starts the scheduler on the current tokio runtime.
    ///
    /// The join handle resolves when the loop stops: `Ok` after
    /// [`SchedulerHandle::shutdown`] (or once every handle is dropped), `Err`
    /// on a storage failure.
    pub fn spawn(
        store: Arc<dyn FeedStore>,
        mut options: SchedulerOptions,
    ) -> Result<(SchedulerHandle, JoinHandle<Result<(), SchedulerError>>), SchedulerError> {
        options.max_concurrent_fetches = options.max_concurrent_fetches.max(1);
        let client = build_client(&options.user_agent)?;
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let scheduler = Scheduler {
            store,
            options,
            client,
            queue: DispatchQueue::default(),
            paused: false,
            online: true,
            phase: SchedulerPhase::Idle,
            next_wake: None,
            reported_in_flight: 0,
            events: event_tx.clone(),
            completions: completion_tx,
            root: CancellationToken::new(),
            icon_slots: Arc::new(Semaphore::new(MAX_CONCURRENT_ICON_FETCHES)),
            icons_in_flight: HashSet::new(),
            batches: Vec::new(),
            next_batch_id: 1,
        };

        let handle = SchedulerHandle {
            commands: command_tx,
            events: event_tx,
        };
        let task = tokio::spawn(scheduler.run(command_rx, completion_rx));
        Ok((handle, task))
    }

    async fn run(
        mut self,
        commands: mpsc::Receiver<Command>,
        completions: mpsc::UnboundedReceiver<Completion>,
    ) -> Result<(), SchedulerError> {
        tracing::info!(
            max_concurrent = self.options.max_concurrent_fetches,
            backoff_cap = self.options.policy.backoff_cap,
            "Scheduler started"
        );
        let result = self.event_loop(commands, completions).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Scheduler stopped on storage failure");
        }
        self.stop();
        result
    }

    async fn event_loop(
        &mut self,
        mut commands: mpsc::Receiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) -> Result<(), SchedulerError> {
        self.schedule_next_feed().await?;

        loop {
            let wake = self.next_wake.map(timer_deadline);
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        tracing::info!("Scheduler shutting down");
                        return Ok(());
                    }
                    Some(command) => self.handle_command(command).await?,
                },
                Some(done) = completions.recv() => match done {
                    Completion::Fetch { feed_id, outcome } => {
                        self.on_fetch_finished(feed_id, outcome).await?;
                    }
                    Completion::Icon { feed_id, outcome } => {
                        self.on_icon_finished(feed_id, outcome).await?;
                    }
                },
                _ = sleep_until_wake(wake), if wake.is_some() => {
                    tracing::debug!("Wake-up timer fired");
                    self.next_wake = None;
                    self.schedule_next_feed().await?;
                }
            }
            self.publish_state();
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), SchedulerError> {
        match command {
            Command::ScheduleNext => self.schedule_next_feed().await,
            Command::ForceUpdate(feed_id) => self.force_update(feed_id).await,
            Command::ForceUpdateAll => self.force_update_all().await,
            Command::DownloadList {
                feeds,
                user_initiated,
                reply,
            } => self.download_list(feeds, user_initiated, reply).await,
            Command::Pause => {
                if !self.paused {
                    tracing::info!(in_flight = self.queue.in_flight_len(), "Refresh paused");
                    self.paused = true;
                }
                self.rearm_timer().await
            }
            Command::Resume => {
                if self.paused {
                    tracing::info!(queued = self.queue.waiting_len(), "Refresh resumed");
                    self.paused = false;
                }
                self.schedule_next_feed().await
            }
            Command::NetworkChanged(reachable) => self.network_changed(reachable).await,
            Command::FeedRemoved(feed_id) => self.feed_removed(feed_id).await,
            Command::IntervalChanged(feed_id) => {
                if let Some(feed) = self.store.read_feed(feed_id).await? {
                    tracing::debug!(feed_id = %feed_id, interval = %feed.interval, "Refresh interval changed");
                    if !feed.interval.is_enabled() && self.queue.drop_unforced_waiting(feed_id) {
                        tracing::debug!(feed_id = %feed_id, "Refresh disabled, queued fetch dropped");
                        self.settle_batches(feed_id, BatchResult::Skipped);
                    } else {
                        self.queue.refresh_waiting(&feed);
                    }
                }
                self.schedule_next_feed().await
            }
            Command::RefreshAllIcons => self.refresh_all_icons().await,
            Command::Status(reply) => {
                let _ = reply.send(self.status());
                Ok(())
            }
            // Handled by the loop
            Command::Shutdown => Ok(()),
        }
    }

    /// Schedule state of a feed, `None` if the feed has been deleted.
    async fn read_state(&self, feed_id: FeedId) -> Result<Option<ScheduleState>, SchedulerError> {
        match self.store.read_schedule_state(feed_id).await {
            Ok(state) => Ok(Some(state)),
            Err(StoreError::FeedNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn can_dispatch(&self) -> bool {
        self.online && !self.paused
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            phase: self.current_phase(),
            in_flight: self.queue.in_flight_len(),
            queued: self.queue.waiting_len(),
            icons_in_flight: self.icons_in_flight.len(),
            paused: self.paused,
            online: self.online,
            next_wake: self.next_wake,
        }
    }

    fn current_phase(&self) -> SchedulerPhase {
        if !self.online {
            SchedulerPhase::OfflineWaiting
        } else if self.paused {
            SchedulerPhase::Paused
        } else if self.queue.is_idle() {
            SchedulerPhase::Idle
        } else {
            SchedulerPhase::Running
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Emits progress and phase events for whatever changed since last time.
    fn publish_state(&mut self) {
        let in_flight = self.queue.in_flight_len();
        if in_flight != self.reported_in_flight {
            self.reported_in_flight = in_flight;
            self.emit(SchedulerEvent::Progress { in_flight });
        }
        let phase = self.current_phase();
        if phase != self.phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "Scheduler phase changed");
            self.phase = phase;
            self.emit(SchedulerEvent::PhaseChanged(phase));
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Queues every due feed (earliest first), dispatches what the
    /// concurrency limit allows, and re-arms the timer.
    async fn schedule_next_feed(&mut self) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let mut due = Vec::new();
        for feed in self.store.list_feeds_needing_update(false).await? {
            if self.queue.contains(feed.id) {
                continue;
            }
            let Some(state) = self.read_state(feed.id).await? else {
                continue;
            };
            if self.options.policy.is_due(feed.interval, &state, now) {
                due.push((state.next_scheduled, feed));
            }
        }
        // Never-fetched feeds (None) sort first
        due.sort_by_key(|(next, feed)| (*next, feed.id));
        for (_, feed) in due {
            tracing::debug!(feed_id = %feed.id, url = %feed.url, "Feed is due");
            self.queue.register(QueueEntry::new(feed, false, false, now));
        }

        self.pump().await?;
        self.rearm_timer().await
    }

    /// Starts waiting fetches until the concurrency limit is reached.
    async fn pump(&mut self) -> Result<(), SchedulerError> {
        if !self.can_dispatch() {
            return Ok(());
        }
        while let Some(entry) = self.queue.next_dispatchable(self.options.max_concurrent_fetches) {
            self.dispatch(entry).await?;
        }
        Ok(())
    }

    async fn dispatch(&mut self, mut entry: QueueEntry) -> Result<(), SchedulerError> {
        let feed_id = entry.feed_id();
        // Due entries may have waited out a pause or an outage; recheck the feed
        if !entry.forced {
            match self.store.read_feed(feed_id).await? {
                Some(feed) if feed.interval.is_enabled() => entry.feed = feed,
                Some(_) => {
                    tracing::debug!(feed_id = %feed_id, "Refresh disabled while queued, not dispatching");
                    self.settle_batches(feed_id, BatchResult::Skipped);
                    return Ok(());
                }
                None => {
                    tracing::debug!(feed_id = %feed_id, "Queued feed no longer exists");
                    self.settle_batches(feed_id, BatchResult::Skipped);
                    return Ok(());
                }
            }
        }
        let Some(state) = self.read_state(feed_id).await? else {
            tracing::debug!(feed_id = %feed_id, "Queued feed no longer exists");
            self.settle_batches(feed_id, BatchResult::Skipped);
            return Ok(());
        };
        let options = FetchOptions {
            timeout: if entry.urgent {
                self.options.urgent_request_timeout
            } else {
                self.options.request_timeout
            },
            max_redirects: self.options.max_redirects,
            max_body_bytes: self.options.max_feed_size_bytes,
            allow_private_hosts: self.options.allow_private_hosts,
        };
        let task = FetchTask::new(self.client.clone(), entry.feed.url.clone(), state.cache, options);
        let cancel = self.root.child_token();

        tracing::debug!(
            feed_id = %feed_id,
            url = %entry.feed.url,
            forced = entry.forced,
            urgent = entry.urgent,
            "Dispatching fetch"
        );
        self.queue.start(entry, cancel.clone());

        let completions = self.completions.clone();
        tokio::spawn(async move {
            let outcome = task.run(cancel).await;
            let _ = completions.send(Completion::Fetch { feed_id, outcome });
        });
        Ok(())
    }

    /// Points the single wake-up timer at the earliest future due time of any
    /// feed not already queued.
    async fn rearm_timer(&mut self) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let floor = now + TimeDelta::seconds(MIN_WAKE_DELAY_SECS);
        let mut earliest: Option<DateTime<Utc>> = None;

        for feed in self.store.list_feeds().await? {
            if !feed.interval.is_enabled() || self.queue.contains(feed.id) {
                continue;
            }
            let Some(state) = self.read_state(feed.id).await? else {
                continue;
            };
            let wake = state.next_scheduled.unwrap_or(now).max(floor);
            earliest = Some(earliest.map_or(wake, |e| e.min(wake)));
        }

        if earliest != self.next_wake {
            self.next_wake = earliest;
            match earliest {
                Some(at) => tracing::debug!(next_wake = %at, "Wake-up timer armed"),
                None => tracing::debug!("Wake-up timer cleared"),
            }
            self.emit(SchedulerEvent::ScheduleChanged { next_wake: earliest });
        }
        Ok(())
    }

    async fn force_update(&mut self, feed_id: FeedId) -> Result<(), SchedulerError> {
        let Some(feed) = self.store.read_feed(feed_id).await? else {
            tracing::warn!(feed_id = %feed_id, "Forced update for unknown feed ignored");
            return Ok(());
        };
        if !self.queue.register(QueueEntry::new(feed, true, true, Utc::now())) {
            tracing::debug!(feed_id = %feed_id, "Feed already queued, forced update merged");
        }
        self.pump().await?;
        self.rearm_timer().await
    }

    async fn force_update_all(&mut self) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let mut feeds = Vec::new();
        for feed in self.store.list_feeds_needing_update(true).await? {
            if let Some(state) = self.read_state(feed.id).await? {
                feeds.push((state.next_scheduled, feed));
            }
        }
        feeds.sort_by_key(|(next, feed)| (*next, feed.id));

        let mut added = 0usize;
        for (_, feed) in feeds {
            if self.queue.register(QueueEntry::new(feed, true, true, now)) {
                added += 1;
            }
        }
        tracing::info!(added, "Forced update of all feeds");

        self.pump().await?;
        self.rearm_timer().await
    }

    async fn download_list(
        &mut self,
        feeds: Vec<FeedRef>,
        user_initiated: bool,
        reply: oneshot::Sender<BatchReport>,
    ) -> Result<(), SchedulerError> {
        let now = Utc::now();
        let id = self.next_batch_id;
        self.next_batch_id += 1;

        let mut pending = HashSet::new();
        for feed in feeds {
            let feed_id = feed.id;
            // A feed already queued elsewhere still counts toward this batch
            self.queue
                .register(QueueEntry::new(feed, true, user_initiated, now));
            pending.insert(feed_id);
        }
        tracing::info!(batch = id, feeds = pending.len(), user_initiated, "Batch download queued");

        if pending.is_empty() {
            let _ = reply.send(BatchReport::default());
            return Ok(());
        }
        if !user_initiated {
            self.emit(SchedulerEvent::BatchProgress {
                batch: id,
                remaining: pending.len(),
            });
        }
        self.batches.push(Batch {
            id,
            pending,
            user_initiated,
            report: BatchReport::default(),
            reply,
        });

        self.pump().await?;
        self.rearm_timer().await
    }

    async fn network_changed(&mut self, reachable: bool) -> Result<(), SchedulerError> {
        if reachable == self.online {
            return Ok(());
        }
        self.online = reachable;
        self.emit(SchedulerEvent::NetworkStatusChanged { reachable });

        if reachable {
            tracing::info!("Network reachable, resuming refresh");
            self.schedule_next_feed().await
        } else {
            let cancelled = self.queue.cancel_in_flight(true);
            tracing::info!(cancelled, "Network unreachable, waiting");
            Ok(())
        }
    }

    async fn feed_removed(&mut self, feed_id: FeedId) -> Result<(), SchedulerError> {
        let running = self.queue.is_in_flight(feed_id);
        if self.queue.remove(feed_id) {
            tracing::debug!(feed_id = %feed_id, running, "Removed feed dropped from queue");
            // A running fetch settles its batches when the cancelled task reports back
            if !running {
                self.settle_batches(feed_id, BatchResult::Skipped);
            }
        }
        self.rearm_timer().await
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    async fn on_fetch_finished(
        &mut self,
        feed_id: FeedId,
        outcome: FetchOutcome,
    ) -> Result<(), SchedulerError> {
        let Some(finished) = self.queue.finish(feed_id) else {
            tracing::debug!(feed_id = %feed_id, "Cancelled fetch requeued");
            return self.pump().await;
        };

        if finished.discarded {
            tracing::debug!(feed_id = %feed_id, "Dropping result for removed feed");
            self.settle_batches(feed_id, BatchResult::Skipped);
            return self.schedule_next_feed().await;
        }

        if outcome.is_cancelled() {
            // State stays exactly as it was, so the feed remains eligible
            self.settle_batches(feed_id, BatchResult::Skipped);
            return self.schedule_next_feed().await;
        }

        let Some(feed) = self.store.read_feed(feed_id).await? else {
            tracing::debug!(feed_id = %feed_id, "Feed deleted during fetch, result dropped");
            self.settle_batches(feed_id, BatchResult::Skipped);
            return self.schedule_next_feed().await;
        };

        let now = Utc::now();
        let policy = self.options.policy;
        let Some(mut state) = self.read_state(feed_id).await? else {
            self.settle_batches(feed_id, BatchResult::Skipped);
            return self.schedule_next_feed().await;
        };
        let result = match outcome.resolved() {
            FetchOutcome::Success(update) => {
                state.record_success(
                    &policy,
                    feed.interval,
                    now,
                    Some((
                        update.validators.etag.as_deref(),
                        update.validators.last_modified.as_deref(),
                    )),
                );
                BatchResult::Completed
            }
            FetchOutcome::NotModified => {
                state.record_success(&policy, feed.interval, now, None);
                BatchResult::Completed
            }
            FetchOutcome::Failed { kind, .. } => {
                state.record_failure(&policy, feed.interval, now);
                tracing::warn!(
                    feed_id = %feed_id,
                    url = %feed.url,
                    error = %kind,
                    consecutive_errors = state.consecutive_errors,
                    next = ?state.next_scheduled,
                    "Feed fetch failed"
                );
                BatchResult::Failed(kind.clone())
            }
            FetchOutcome::Cancelled | FetchOutcome::Redirected { .. } => BatchResult::Skipped,
        };

        self.store.write_schedule_state(feed_id, &state).await?;
        self.store.write_fetch_result(feed_id, &outcome).await?;

        let changed = outcome.content_changed();
        tracing::debug!(
            feed_id = %feed_id,
            outcome = outcome.label(),
            new_url = ?outcome.new_url(),
            next = ?state.next_scheduled,
            forced = finished.entry.forced,
            queued_ms = (now - finished.entry.enqueued_at).num_milliseconds(),
            "Fetch completed"
        );

        if !self.is_background_only(feed_id) {
            self.emit(SchedulerEvent::FeedCompleted {
                feed_id,
                changed,
                error: outcome.error().cloned(),
                consecutive_errors: state.consecutive_errors,
            });
        }
        self.settle_batches(feed_id, result);

        if let Some(update) = outcome.update() {
            if !feed.has_icon {
                self.spawn_icon_fetch(IconRequest {
                    feed_id,
                    feed_url: outcome.new_url().map_or_else(|| feed.url.clone(), str::to_owned),
                    site_url: update.feed.site_url.clone().or(feed.site_url),
                    hint: update.icon_hint.clone(),
                });
            }
        }

        self.schedule_next_feed().await
    }

    /// True when the feed is only being fetched for background batches,
    /// which report aggregate progress instead of per-feed events.
    fn is_background_only(&self, feed_id: FeedId) -> bool {
        let mut background = false;
        for batch in self.batches.iter().filter(|b| b.pending.contains(&feed_id)) {
            if batch.user_initiated {
                return false;
            }
            background = true;
        }
        background
    }

    fn settle_batches(&mut self, feed_id: FeedId, result: BatchResult) {
        let mut progress = Vec::new();
        for batch in &mut self.batches {
            if !batch.pending.remove(&feed_id) {
                continue;
            }
            match &result {
                BatchResult::Completed => batch.report.completed += 1,
                BatchResult::Failed(kind) => batch.report.failed.push((feed_id, kind.clone())),
                BatchResult::Skipped => batch.report.skipped += 1,
            }
            if !batch.user_initiated {
                progress.push((batch.id, batch.pending.len()));
            }
        }
        for (batch, remaining) in progress {
            self.emit(SchedulerEvent::BatchProgress { batch, remaining });
        }

        let (done, open): (Vec<Batch>, Vec<Batch>) = std::mem::take(&mut self.batches)
            .into_iter()
            .partition(|b| b.pending.is_empty());
        self.batches = open;
        for batch in done {
            tracing::info!(
                batch = batch.id,
                completed = batch.report.completed,
                failed = batch.report.failed.len(),
                skipped = batch.report.skipped,
                "Batch download finished"
            );
            let _ = batch.reply.send(batch.report);
        }
    }

    // ------------------------------------------------------------------------
    // Icons
    // ------------------------------------------------------------------------

    fn spawn_icon_fetch(&mut self, request: IconRequest) {
        let feed_id = request.feed_id;
        if !self.icons_in_flight.insert(feed_id) {
            return;
        }
        let options = IconOptions {
            timeout: self.options.request_timeout,
            max_bytes: self.options.max_icon_size_bytes,
            icon_dir: self.options.icon_dir.clone(),
            allow_private_hosts: self.options.allow_private_hosts,
        };
        let task = IconFetchTask::new(self.client.clone(), request, options);
        let cancel = self.root.child_token();
        let slots = Arc::clone(&self.icon_slots);
        let completions = self.completions.clone();

        tracing::debug!(feed_id = %feed_id, "Icon lookup started");
        tokio::spawn(async move {
            let outcome = match slots.acquire_owned().await {
                Ok(_permit) => task.run(cancel).await,
                Err(_) => IconOutcome::Cancelled,
            };
            let _ = completions.send(Completion::Icon { feed_id, outcome });
        });
    }

    async fn refresh_all_icons(&mut self) -> Result<(), SchedulerError> {
        let feeds = self.store.list_feeds().await?;
        tracing::info!(feeds = feeds.len(), "Refreshing all icons");
        for feed in feeds {
            self.spawn_icon_fetch(IconRequest {
                feed_id: feed.id,
                feed_url: feed.url,
                site_url: feed.site_url,
                hint: None,
            });
        }
        Ok(())
    }

    async fn on_icon_finished(
        &mut self,
        feed_id: FeedId,
        outcome: IconOutcome,
    ) -> Result<(), SchedulerError> {
        self.icons_in_flight.remove(&feed_id);
        match outcome {
            IconOutcome::Found(icon) => {
                if self.store.read_feed(feed_id).await?.is_none() {
                    tracing::debug!(feed_id = %feed_id, "Icon for removed feed dropped");
                    return Ok(());
                }
                tracing::debug!(
                    feed_id = %feed_id,
                    source = %icon.source_url,
                    path = %icon.path.display(),
                    "Icon updated"
                );
                self.store.write_icon(feed_id, &icon).await?;
                self.emit(SchedulerEvent::IconUpdated { feed_id });
            }
            IconOutcome::NotFound => {
                tracing::debug!(feed_id = %feed_id, "No icon found");
            }
            IconOutcome::Cancelled => {}
        }
        Ok(())
    }

    /// Cancels everything and answers pending batches with what they have.
    fn stop(&mut self) {
        self.queue.clear();
        self.root.cancel();
        for mut batch in self.batches.drain(..) {
            batch.report.skipped += batch.pending.len();
            let _ = batch.reply.send(batch.report);
        }
        self.publish_state();
    }
}

fn timer_deadline(wake: DateTime<Utc>) -> Instant {
    let delay = (wake - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_TIMER_SLEEP);
    Instant::now() + delay
}

async fn sleep_until_wake(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
