use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::articles::upsert_articles;
use super::schema::Database;
use super::{FeedId, FeedRef, FeedStore, StoreError};
use crate::feed::{FeedIcon, FetchOutcome};
use crate::schedule::{ConditionalCacheState, RefreshInterval, ScheduleState, TimeUnit};

/// id, url, site_url, refresh_amount, refresh_unit, has_icon
type FeedRow = (i64, String, Option<String>, i32, String, bool);

/// next_scheduled, consecutive_errors, etag, last_modified
type StateRow = (Option<i64>, i64, Option<String>, Option<String>);

const FEED_COLUMNS: &str = "f.id, f.url, f.site_url, f.refresh_amount, f.refresh_unit, \
     EXISTS(SELECT 1 FROM icons i WHERE i.feed_id = f.id) AS has_icon";

fn feed_from_row((id, url, site_url, amount, unit, has_icon): FeedRow) -> Result<FeedRef, StoreError> {
    let unit: TimeUnit = unit
        .parse()
        .map_err(|e: String| StoreError::Failure(format!("feed {id}: {e}")))?;
    Ok(FeedRef {
        id: FeedId(id),
        url,
        site_url,
        interval: RefreshInterval::new(amount, unit),
        has_icon,
    })
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Registers a feed, or returns the id of the feed already at `url`.
    pub async fn insert_feed(&self, url: &str, interval: RefreshInterval) -> Result<FeedId, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO feeds (url, refresh_amount, refresh_unit) VALUES (?, ?, ?) \
             ON CONFLICT(url) DO UPDATE SET url = excluded.url \
             RETURNING id",
        )
        .bind(url)
        .bind(interval.amount)
        .bind(interval.unit.as_str())
        .fetch_one(&self.pool)
        .await?;
        tracing::debug!(feed_id = row.0, url = %url, "Feed registered");
        Ok(FeedId(row.0))
    }

    /// Deletes a feed with its articles and icon record. Returns false if it
    /// did not exist.
    pub async fn remove_feed(&self, id: FeedId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Changes the refresh interval. The stored next-scheduled time is kept.
    pub async fn set_refresh_interval(&self, id: FeedId, interval: RefreshInterval) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE feeds SET refresh_amount = ?, refresh_unit = ? WHERE id = ?")
            .bind(interval.amount)
            .bind(interval.unit.as_str())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(id));
        }
        Ok(())
    }

    pub async fn feed_title(&self, id: FeedId) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> = sqlx::query_as("SELECT title FROM feeds WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.0))
    }

    /// Error text of the last failed fetch, cleared by the next success.
    pub async fn last_error(&self, id: FeedId) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> = sqlx::query_as("SELECT last_error FROM feeds WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.0))
    }

    pub async fn icon_path(&self, id: FeedId) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT path FROM icons WHERE feed_id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }
}

#[async_trait]
impl FeedStore for Database {
    async fn list_feeds_needing_update(&self, force_all: bool) -> Result<Vec<FeedRef>, StoreError> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds f \
             WHERE f.refresh_amount > 0 \
               AND (? OR f.next_scheduled IS NULL OR f.next_scheduled <= ?) \
             ORDER BY f.next_scheduled ASC, f.id ASC"
        );
        let rows: Vec<FeedRow> = sqlx::query_as(&sql)
            .bind(force_all)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(feed_from_row).collect()
    }

    async fn list_feeds(&self) -> Result<Vec<FeedRef>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds f ORDER BY f.id");
        let rows: Vec<FeedRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(feed_from_row).collect()
    }

    async fn read_feed(&self, id: FeedId) -> Result<Option<FeedRef>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds f WHERE f.id = ?");
        let row: Option<FeedRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(feed_from_row).transpose()
    }

    async fn read_schedule_state(&self, id: FeedId) -> Result<ScheduleState, StoreError> {
        let row: Option<StateRow> = sqlx::query_as(
            "SELECT next_scheduled, consecutive_errors, etag, last_modified FROM feeds WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        let (next_scheduled, errors, etag, last_modified) = row.ok_or(StoreError::FeedNotFound(id))?;
        Ok(ScheduleState {
            next_scheduled: next_scheduled.and_then(millis_to_datetime),
            consecutive_errors: u32::try_from(errors).unwrap_or(0),
            cache: ConditionalCacheState::new(etag, last_modified),
        })
    }

    async fn write_schedule_state(&self, id: FeedId, state: &ScheduleState) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE feeds SET next_scheduled = ?, consecutive_errors = ?, etag = ?, last_modified = ? \
             WHERE id = ?",
        )
        .bind(state.next_scheduled.map(|t| t.timestamp_millis()))
        .bind(i64::from(state.consecutive_errors))
        .bind(&state.cache.etag)
        .bind(&state.cache.last_modified)
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn write_fetch_result(&self, id: FeedId, outcome: &FetchOutcome) -> Result<(), StoreError> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        if let Some(new_url) = outcome.new_url() {
            // Another feed may already own the new URL; keep the old one then
            let result = sqlx::query("UPDATE OR IGNORE feeds SET url = ? WHERE id = ?")
                .bind(new_url)
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                tracing::warn!(feed_id = %id, new_url = %new_url, "Feed URL not updated after redirect");
            } else {
                tracing::info!(feed_id = %id, new_url = %new_url, "Feed moved, URL updated");
            }
        }

        match outcome.resolved() {
            FetchOutcome::Success(update) => {
                sqlx::query(
                    "UPDATE feeds SET title = COALESCE(?, title), site_url = COALESCE(?, site_url), \
                     last_error = NULL, last_fetched = ? WHERE id = ?",
                )
                .bind(&update.feed.title)
                .bind(&update.feed.site_url)
                .bind(now)
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
                // Articles belong to a feed row; skip them if it is gone
                let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM feeds WHERE id = ?")
                    .bind(id.0)
                    .fetch_optional(&mut *tx)
                    .await?;
                if exists.is_some() {
                    let new_articles = upsert_articles(&mut tx, id, &update.feed.articles).await?;
                    tracing::debug!(feed_id = %id, new_articles, "Articles stored");
                }
            }
            FetchOutcome::NotModified => {
                sqlx::query("UPDATE feeds SET last_error = NULL, last_fetched = ? WHERE id = ?")
                    .bind(now)
                    .bind(id.0)
                    .execute(&mut *tx)
                    .await?;
            }
            FetchOutcome::Failed { kind, .. } => {
                sqlx::query("UPDATE feeds SET last_error = ? WHERE id = ?")
                    .bind(kind.to_string())
                    .bind(id.0)
                    .execute(&mut *tx)
                    .await?;
            }
            FetchOutcome::Cancelled | FetchOutcome::Redirected { .. } => {}
        }

        tx.commit().await?;
        Ok(())
    }

    async fn write_icon(&self, id: FeedId, icon: &FeedIcon) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO icons (feed_id, path, source_url, width, height, updated_at) \
             SELECT ?, ?, ?, ?, ?, ? WHERE EXISTS(SELECT 1 FROM feeds WHERE id = ?) \
             ON CONFLICT(feed_id) DO UPDATE SET path = excluded.path, source_url = excluded.source_url, \
             width = excluded.width, height = excluded.height, updated_at = excluded.updated_at",
        )
        .bind(id.0)
        .bind(icon.path.to_string_lossy().into_owned())
        .bind(&icon.source_url)
        .bind(i64::from(icon.width))
        .bind(i64::from(icon.height))
        .bind(Utc::now().timestamp_millis())
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
