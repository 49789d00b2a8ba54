//! In-process [`FeedStore`] for tests and embedders that keep their own
//! persistence.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{FeedId, FeedRef, FeedStore, StoreError};
use crate::feed::{FeedIcon, FetchErrorKind, FetchOutcome};
use crate::schedule::{RefreshInterval, ScheduleState};

/// What the last written fetch result amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedResult {
    Updated { articles: usize },
    NotModified,
    Failed(FetchErrorKind),
}

#[derive(Debug)]
struct MemoryFeed {
    url: String,
    site_url: Option<String>,
    title: Option<String>,
    interval: RefreshInterval,
    state: ScheduleState,
    last_result: Option<RecordedResult>,
    results_written: usize,
    icon: Option<FeedIcon>,
}

#[derive(Debug)]
struct Inner {
    next_id: i64,
    default_interval: RefreshInterval,
    feeds: BTreeMap<FeedId, MemoryFeed>,
    failing: bool,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(RefreshInterval::default())
    }
}

impl MemoryStore {
    /// Empty store; new feeds get `default_interval`.
    pub fn new(default_interval: RefreshInterval) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                default_interval,
                feeds: BTreeMap::new(),
                failing: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for trait calls, honouring injected failures.
    fn lock_checked(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        let inner = self.lock();
        if inner.failing {
            return Err(StoreError::Failure("storage unavailable".to_owned()));
        }
        Ok(inner)
    }

    pub fn insert_feed(&self, url: impl Into<String>) -> FeedId {
        let interval = self.lock().default_interval;
        self.insert_feed_with_interval(url, interval)
    }

    pub fn insert_feed_with_interval(&self, url: impl Into<String>, interval: RefreshInterval) -> FeedId {
        let mut inner = self.lock();
        let id = FeedId(inner.next_id);
        inner.next_id += 1;
        inner.feeds.insert(
            id,
            MemoryFeed {
                url: url.into(),
                site_url: None,
                title: None,
                interval,
                state: ScheduleState::default(),
                last_result: None,
                results_written: 0,
                icon: None,
            },
        );
        id
    }

    pub fn remove_feed(&self, id: FeedId) -> bool {
        self.lock().feeds.remove(&id).is_some()
    }

    pub fn set_interval(&self, id: FeedId, interval: RefreshInterval) {
        if let Some(feed) = self.lock().feeds.get_mut(&id) {
            feed.interval = interval;
        }
    }

    pub fn set_site_url(&self, id: FeedId, site_url: impl Into<String>) {
        if let Some(feed) = self.lock().feeds.get_mut(&id) {
            feed.site_url = Some(site_url.into());
        }
    }

    pub fn set_schedule_state(&self, id: FeedId, state: ScheduleState) {
        if let Some(feed) = self.lock().feeds.get_mut(&id) {
            feed.state = state;
        }
    }

    pub fn schedule_state(&self, id: FeedId) -> Option<ScheduleState> {
        self.lock().feeds.get(&id).map(|f| f.state.clone())
    }

    pub fn last_result(&self, id: FeedId) -> Option<RecordedResult> {
        self.lock().feeds.get(&id).and_then(|f| f.last_result.clone())
    }

    /// Number of fetch results written for the feed.
    pub fn results_written(&self, id: FeedId) -> usize {
        self.lock().feeds.get(&id).map_or(0, |f| f.results_written)
    }

    pub fn feed_url(&self, id: FeedId) -> Option<String> {
        self.lock().feeds.get(&id).map(|f| f.url.clone())
    }

    pub fn feed_title(&self, id: FeedId) -> Option<String> {
        self.lock().feeds.get(&id).and_then(|f| f.title.clone())
    }

    pub fn icon(&self, id: FeedId) -> Option<FeedIcon> {
        self.lock().feeds.get(&id).and_then(|f| f.icon.clone())
    }

    /// Makes every [`FeedStore`] call fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }
}

fn feed_ref(id: FeedId, feed: &MemoryFeed) -> FeedRef {
    FeedRef {
        id,
        url: feed.url.clone(),
        site_url: feed.site_url.clone(),
        interval: feed.interval,
        has_icon: feed.icon.is_some(),
    }
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn list_feeds_needing_update(&self, force_all: bool) -> Result<Vec<FeedRef>, StoreError> {
        let now = chrono::Utc::now();
        let inner = self.lock_checked()?;
        let mut due: Vec<_> = inner
            .feeds
            .iter()
            .filter(|(_, f)| f.interval.is_enabled())
            .filter(|(_, f)| force_all || f.state.next_scheduled.map_or(true, |next| next <= now))
            .map(|(id, f)| (f.state.next_scheduled, feed_ref(*id, f)))
            .collect();
        due.sort_by_key(|(next, feed)| (*next, feed.id));
        Ok(due.into_iter().map(|(_, feed)| feed).collect())
    }

    async fn list_feeds(&self) -> Result<Vec<FeedRef>, StoreError> {
        let inner = self.lock_checked()?;
        Ok(inner.feeds.iter().map(|(id, f)| feed_ref(*id, f)).collect())
    }

    async fn read_feed(&self, id: FeedId) -> Result<Option<FeedRef>, StoreError> {
        let inner = self.lock_checked()?;
        Ok(inner.feeds.get(&id).map(|f| feed_ref(id, f)))
    }

    async fn read_schedule_state(&self, id: FeedId) -> Result<ScheduleState, StoreError> {
        let inner = self.lock_checked()?;
        inner
            .feeds
            .get(&id)
            .map(|f| f.state.clone())
            .ok_or(StoreError::FeedNotFound(id))
    }

    async fn write_schedule_state(&self, id: FeedId, state: &ScheduleState) -> Result<(), StoreError> {
        let mut inner = self.lock_checked()?;
        if let Some(feed) = inner.feeds.get_mut(&id) {
            feed.state = state.clone();
        }
        Ok(())
    }

    async fn write_fetch_result(&self, id: FeedId, outcome: &FetchOutcome) -> Result<(), StoreError> {
        let mut inner = self.lock_checked()?;
        let Some(feed) = inner.feeds.get_mut(&id) else {
            return Ok(());
        };

        let recorded = match outcome.resolved() {
            FetchOutcome::Success(update) => {
                if update.feed.title.is_some() {
                    feed.title = update.feed.title.clone();
                }
                if update.feed.site_url.is_some() {
                    feed.site_url = update.feed.site_url.clone();
                }
                RecordedResult::Updated {
                    articles: update.feed.articles.len(),
                }
            }
            FetchOutcome::NotModified => RecordedResult::NotModified,
            FetchOutcome::Failed { kind, .. } => RecordedResult::Failed(kind.clone()),
            FetchOutcome::Cancelled | FetchOutcome::Redirected { .. } => return Ok(()),
        };
        if let Some(new_url) = outcome.new_url() {
            feed.url = new_url.to_owned();
        }
        feed.last_result = Some(recorded);
        feed.results_written += 1;
        Ok(())
    }

    async fn write_icon(&self, id: FeedId, icon: &FeedIcon) -> Result<(), StoreError> {
        let mut inner = self.lock_checked()?;
        if let Some(feed) = inner.feeds.get_mut(&id) {
            feed.icon = Some(icon.clone());
        }
        Ok(())
    }
}
