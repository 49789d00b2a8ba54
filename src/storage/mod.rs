//! The persistence contract the scheduler writes through, and two stores
//! implementing it.
//!
//! The scheduler never owns feed identity. It sees a [`FeedRef`] snapshot for
//! the duration of one fetch and reads/writes [`ScheduleState`] through a
//! [`FeedStore`]. Any [`StoreError`] is treated as fatal by the scheduler.
//!
//! - [`MemoryStore`] - in-process store for tests and embedders
//! - [`Database`] - SQLite store used by the daemon

mod articles;
mod feeds;
mod memory;
mod schema;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::feed::{FeedIcon, FetchOutcome};
use crate::schedule::{RefreshInterval, ScheduleState};

pub use articles::StoredArticle;
pub use memory::{MemoryStore, RecordedResult};
pub use schema::Database;

/// Identifier of a feed in the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId(pub i64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The view of a feed the scheduler works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRef {
    pub id: FeedId,
    pub url: String,
    /// Website of the feed, used to look up an icon.
    pub site_url: Option<String>,
    pub interval: RefreshInterval,
    pub has_icon: bool,
}

/// Storage failures. Fatal to the scheduler.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The feed does not exist in the store
    #[error("Feed {0} not found")]
    FeedNotFound(FeedId),

    /// Backend could not complete the operation
    #[error("Storage failure: {0}")]
    Failure(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Everything the scheduler needs from persistent storage.
///
/// Writes addressed to a feed that no longer exists are silently dropped;
/// reading its schedule state yields [`StoreError::FeedNotFound`].
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Feeds with refresh enabled; with `force_all == false` only those whose
    /// stored next-scheduled time has passed (or was never set).
    async fn list_feeds_needing_update(&self, force_all: bool) -> Result<Vec<FeedRef>, StoreError>;

    /// Every registered feed, including those with refresh disabled.
    async fn list_feeds(&self) -> Result<Vec<FeedRef>, StoreError>;

    /// Current view of one feed, `None` once it has been deleted.
    async fn read_feed(&self, id: FeedId) -> Result<Option<FeedRef>, StoreError>;

    async fn read_schedule_state(&self, id: FeedId) -> Result<ScheduleState, StoreError>;

    async fn write_schedule_state(&self, id: FeedId, state: &ScheduleState) -> Result<(), StoreError>;

    /// Persists what a fetch produced: articles, the error text, or a new URL.
    async fn write_fetch_result(&self, id: FeedId, outcome: &FetchOutcome) -> Result<(), StoreError>;

    /// Records a freshly downloaded icon and where its file lives.
    async fn write_icon(&self, id: FeedId, icon: &FeedIcon) -> Result<(), StoreError>;
}
