use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE, ETAG, LAST_MODIFIED, LOCATION};
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::feed::discovery::{
    find_feed_link_in_html, find_icon_link_in_html, looks_like_html, resolve_url,
};
use crate::feed::parser::{parse_feed, ParsedFeed};
use crate::schedule::ConditionalCacheState;
use crate::util::validate_url;

pub const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Why a single feed fetch failed.
///
/// These are recovered locally by the scheduler (backoff + notification) and
/// never abort the refresh loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// DNS, connection, TLS or mid-transfer failure
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),
    /// The whole fetch exceeded its time budget
    #[error("Request timed out")]
    Timeout,
    /// Final response was neither 2xx nor 304
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Body could not be parsed as RSS/Atom and linked to no feed
    #[error("Parse error: {0}")]
    Parse(String),
    /// The feed (or a redirect target) is not a fetchable URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Response body exceeded the configured size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Redirect chain longer than the configured limit
    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),
}

impl FetchErrorKind {
    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchErrorKind::Timeout
        } else if err.is_builder() {
            FetchErrorKind::InvalidUrl(err.to_string())
        } else {
            FetchErrorKind::NetworkUnreachable(err.to_string())
        }
    }
}

/// Caching validators sent with a `200` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResponseValidators {
    fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            etag: read(ETAG),
            last_modified: read(LAST_MODIFIED),
        }
    }
}

/// Payload of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub feed: ParsedFeed,
    pub validators: ResponseValidators,
    /// Absolute icon URL declared by the page or the feed, if any
    pub icon_hint: Option<String>,
}

/// The single result of a [`FetchTask`].
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Success(FeedUpdate),
    NotModified,
    /// The feed now lives at `new_url`; `outcome` is the `Success` or
    /// `NotModified` obtained there.
    Redirected {
        new_url: String,
        outcome: Box<FetchOutcome>,
    },
    Failed {
        kind: FetchErrorKind,
        status: Option<u16>,
    },
    Cancelled,
}

impl FetchOutcome {
    pub fn failed(kind: FetchErrorKind) -> Self {
        let status = match kind {
            FetchErrorKind::HttpStatus(code) => Some(code),
            _ => None,
        };
        FetchOutcome::Failed { kind, status }
    }

    /// The outcome behind any redirect wrapper.
    pub fn resolved(&self) -> &FetchOutcome {
        match self {
            FetchOutcome::Redirected { outcome, .. } => outcome.resolved(),
            other => other,
        }
    }

    pub fn new_url(&self) -> Option<&str> {
        match self {
            FetchOutcome::Redirected { new_url, .. } => Some(new_url),
            _ => None,
        }
    }

    /// True when new content was downloaded and parsed.
    pub fn content_changed(&self) -> bool {
        matches!(self.resolved(), FetchOutcome::Success(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.resolved(), FetchOutcome::Cancelled)
    }

    pub fn error(&self) -> Option<&FetchErrorKind> {
        match self.resolved() {
            FetchOutcome::Failed { kind, .. } => Some(kind),
            _ => None,
        }
    }

    pub fn update(&self) -> Option<&FeedUpdate> {
        match self.resolved() {
            FetchOutcome::Success(update) => Some(update),
            _ => None,
        }
    }

    /// Short name used in logs.
    pub fn label(&self) -> &'static str {
        match self.resolved() {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::NotModified => "not_modified",
            FetchOutcome::Failed { .. } => "failed",
            FetchOutcome::Cancelled => "cancelled",
            FetchOutcome::Redirected { .. } => "redirected",
        }
    }
}

/// Limits applied to one fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Budget for the whole request/redirect/parse cycle
    pub timeout: Duration,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
    /// Permit localhost and private network addresses
    pub allow_private_hosts: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_body_bytes: DEFAULT_MAX_FEED_SIZE,
            allow_private_hosts: false,
        }
    }
}

/// Builds the HTTP client shared by feed and icon fetches.
///
/// Automatic redirects are disabled: [`FetchTask`] follows them itself so it
/// knows where the feed ended up.
pub fn build_client(user_agent: &str) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(15))
        .build()
}

/// One conditional GET + parse cycle for one feed.
pub struct FetchTask {
    client: reqwest::Client,
    url: String,
    cache: ConditionalCacheState,
    options: FetchOptions,
}

impl FetchTask {
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        cache: ConditionalCacheState,
        options: FetchOptions,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            cache,
            options,
        }
    }

    /// Runs the fetch until it completes or `cancel` fires.
    ///
    /// Cancellation drops the in-flight request and any partially read body
    /// and yields [`FetchOutcome::Cancelled`].
    pub async fn run(self, cancel: CancellationToken) -> FetchOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(url = %self.url, "Fetch cancelled");
                FetchOutcome::Cancelled
            }
            outcome = self.fetch() => outcome,
        }
    }

    async fn fetch(&self) -> FetchOutcome {
        match tokio::time::timeout(self.options.timeout, self.fetch_inner()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(kind)) => FetchOutcome::failed(kind),
            Err(_) => FetchOutcome::failed(FetchErrorKind::Timeout),
        }
    }

    fn validate(&self, url: &str) -> Result<Url, FetchErrorKind> {
        validate_url(url, self.options.allow_private_hosts)
            .map_err(|e| FetchErrorKind::InvalidUrl(e.to_string()))
    }

    async fn fetch_inner(&self) -> Result<FetchOutcome, FetchErrorKind> {
        let requested = self.validate(&self.url)?;
        let mut current = requested.clone();
        let mut conditional = self.cache.request_headers();
        let mut redirects = 0usize;
        let mut page_icon: Option<String> = None;
        let mut discovered = false;
        // Cleared by any temporary hop; only a permanent move rewrites the feed URL
        let mut moved = true;

        loop {
            let response = self
                .client
                .get(current.clone())
                .headers(conditional.clone())
                .send()
                .await
                .map_err(|e| FetchErrorKind::from_reqwest(&e))?;
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                return Ok(redirected(&requested, &current, moved, FetchOutcome::NotModified));
            }

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or(FetchErrorKind::HttpStatus(status.as_u16()))?;
                redirects += 1;
                if redirects > self.options.max_redirects {
                    return Err(FetchErrorKind::TooManyRedirects(self.options.max_redirects));
                }
                if !matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::PERMANENT_REDIRECT) {
                    moved = false;
                }
                let target = resolve_url(location, current.as_str());
                tracing::debug!(
                    from = %current,
                    to = %target,
                    status = status.as_u16(),
                    "Following redirect"
                );
                current = self.validate(&target)?;
                continue;
            }

            if !status.is_success() {
                return Err(FetchErrorKind::HttpStatus(status.as_u16()));
            }

            let validators = ResponseValidators::from_headers(response.headers());
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_owned();
            let bytes = read_limited_bytes(response, self.options.max_body_bytes).await?;

            let parse_err = match parse_feed(&bytes) {
                Ok(feed) => {
                    let icon_hint = page_icon.or_else(|| {
                        feed.icon_url
                            .as_deref()
                            .map(|icon| resolve_url(icon, current.as_str()))
                    });
                    let update = FeedUpdate {
                        feed,
                        validators,
                        icon_hint,
                    };
                    return Ok(redirected(&requested, &current, moved, FetchOutcome::Success(update)));
                }
                Err(e) => e,
            };

            // An HTML page may point at the real feed; follow it once
            if !discovered && looks_like_html(&content_type, &bytes) {
                let html = String::from_utf8_lossy(&bytes);
                if let Some(feed_url) = find_feed_link_in_html(&html, current.as_str()) {
                    tracing::debug!(page = %current, feed = %feed_url, "Discovered feed link in HTML page");
                    page_icon = find_icon_link_in_html(&html, current.as_str());
                    current = self.validate(&feed_url)?;
                    discovered = true;
                    // Stored validators belong to the page, not the discovered feed
                    conditional = HeaderMap::new();
                    continue;
                }
            }

            return Err(FetchErrorKind::Parse(parse_err.to_string()));
        }
    }
}

/// Wraps `outcome` in [`FetchOutcome::Redirected`] when the feed moved for good.
fn redirected(requested: &Url, current: &Url, moved: bool, outcome: FetchOutcome) -> FetchOutcome {
    if !moved || requested == current {
        outcome
    } else {
        FetchOutcome::Redirected {
            new_url: current.to_string(),
            outcome: Box::new(outcome),
        }
    }
}

/// Reads a response body, enforcing `limit` and the advertised Content-Length.
pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchErrorKind> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchErrorKind::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchErrorKind::from_reqwest(&e))?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchErrorKind::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchErrorKind::NetworkUnreachable(format!(
                "incomplete response: expected {expected} bytes, received {}",
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}
