//! Per-feed schedule state and HTTP conditional-request tokens.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};

use super::policy::{RefreshInterval, RefreshPolicy};

/// Entity tag and Last-Modified tokens remembered from the last `200` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalCacheState {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ConditionalCacheState {
    pub fn new(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            etag: normalize_etag(etag),
            last_modified: normalize_token(last_modified),
        }
    }

    /// Replaces both tokens with the headers of a fresh `200` response.
    ///
    /// A missing header clears the stored token: if the server stopped sending
    /// it, a stale token must not keep being replayed.
    pub fn apply_response(&self, etag: Option<&str>, last_modified: Option<&str>) -> Self {
        Self::new(etag.map(str::to_owned), last_modified.map(str::to_owned))
    }

    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }

    /// `If-None-Match` / `If-Modified-Since` for the tokens currently held.
    pub fn request_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(etag) = &self.etag {
            match HeaderValue::from_str(etag) {
                Ok(value) => {
                    headers.insert(IF_NONE_MATCH, value);
                }
                Err(_) => tracing::debug!(etag = %etag, "Skipping unrepresentable ETag"),
            }
        }
        if let Some(modified) = &self.last_modified {
            match HeaderValue::from_str(modified) {
                Ok(value) => {
                    headers.insert(IF_MODIFIED_SINCE, value);
                }
                Err(_) => tracing::debug!(last_modified = %modified, "Skipping unrepresentable Last-Modified"),
            }
        }
        headers
    }
}

fn normalize_token(token: Option<String>) -> Option<String> {
    token
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty())
}

/// Some servers append `-gzip` to the ETag when the body was compressed but
/// still treat it as the same version; keep the canonical form.
///
/// Only a trailing suffix (inside the closing quote, if any) is removed.
fn normalize_etag(etag: Option<String>) -> Option<String> {
    normalize_token(etag).map(|t| {
        if let Some(stem) = t.strip_suffix("-gzip\"") {
            format!("{stem}\"")
        } else if let Some(stem) = t.strip_suffix("-gzip") {
            stem.to_owned()
        } else {
            t
        }
    })
}

/// Scheduling metadata for one feed.
///
/// `next_scheduled == None` means the feed was never fetched and is due as
/// soon as its interval is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub next_scheduled: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub cache: ConditionalCacheState,
}

impl ScheduleState {
    /// Records a `200` (with its validators) or a `304` (`validators == None`).
    ///
    /// Resets the error counter and schedules one interval ahead. A `304`
    /// leaves the caching tokens untouched.
    pub fn record_success(
        &mut self,
        policy: &RefreshPolicy,
        interval: RefreshInterval,
        now: DateTime<Utc>,
        validators: Option<(Option<&str>, Option<&str>)>,
    ) {
        self.consecutive_errors = 0;
        if let Some(next) = policy.next_after_success(interval, now) {
            self.next_scheduled = Some(next);
        }
        if let Some((etag, last_modified)) = validators {
            self.cache = self.cache.apply_response(etag, last_modified);
        }
    }

    /// Records a failed attempt and postpones the feed with exponential backoff.
    pub fn record_failure(
        &mut self,
        policy: &RefreshPolicy,
        interval: RefreshInterval,
        now: DateTime<Utc>,
    ) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if let Some(next) = policy.next_after_error(interval, self.consecutive_errors, now) {
            self.next_scheduled = Some(next);
        }
    }
}
