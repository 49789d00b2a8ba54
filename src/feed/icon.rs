//! Favicon lookup and download.
//!
//! Candidates are tried in order: the hint found while fetching the feed, the
//! icon declared by the site's home page, then `/favicon.ico` at the site and
//! feed origins. The first candidate that decodes as an image wins and is
//! written to `{icon_dir}/{feed_id}.{ext}`.

use image::ImageFormat;
use reqwest::header::LOCATION;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::feed::discovery::{find_icon_link_in_html, favicon_url, resolve_url};
use crate::feed::fetcher::read_limited_bytes;
use crate::storage::FeedId;
use crate::util::validate_url;

pub const DEFAULT_MAX_ICON_SIZE: usize = 1024 * 1024; // 1MB
const MAX_ICON_REDIRECTS: usize = 5;
/// Only the head of a home page is needed to find its `<link rel="icon">`
const MAX_PAGE_SIZE: usize = 512 * 1024;

/// A decoded icon stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedIcon {
    pub source_url: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IconOutcome {
    Found(FeedIcon),
    NotFound,
    Cancelled,
}

/// Where to look for one feed's icon.
#[derive(Debug, Clone)]
pub struct IconRequest {
    pub feed_id: FeedId,
    pub feed_url: String,
    pub site_url: Option<String>,
    /// Icon URL discovered while fetching the feed
    pub hint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IconOptions {
    pub timeout: Duration,
    pub max_bytes: usize,
    pub icon_dir: PathBuf,
    pub allow_private_hosts: bool,
}

pub struct IconFetchTask {
    client: reqwest::Client,
    request: IconRequest,
    options: IconOptions,
}

impl IconFetchTask {
    pub fn new(client: reqwest::Client, request: IconRequest, options: IconOptions) -> Self {
        Self {
            client,
            request,
            options,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> IconOutcome {
        let feed_id = self.request.feed_id;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => IconOutcome::Cancelled,
            found = tokio::time::timeout(self.options.timeout, self.find_icon()) => match found {
                Ok(Some(icon)) => IconOutcome::Found(icon),
                Ok(None) => IconOutcome::NotFound,
                Err(_) => {
                    tracing::debug!(feed_id = %feed_id, "Icon lookup timed out");
                    IconOutcome::NotFound
                }
            },
        }
    }

    async fn find_icon(&self) -> Option<FeedIcon> {
        let mut tried = HashSet::new();

        if let Some(hint) = &self.request.hint {
            if let Some(icon) = self.try_candidate(hint, &mut tried).await {
                return Some(icon);
            }
        }

        if let Some(site) = &self.request.site_url {
            if let Some(link) = self.icon_link_from_page(site).await {
                if let Some(icon) = self.try_candidate(&link, &mut tried).await {
                    return Some(icon);
                }
            }
            if let Some(favicon) = favicon_url(site) {
                if let Some(icon) = self.try_candidate(&favicon, &mut tried).await {
                    return Some(icon);
                }
            }
        }

        let favicon = favicon_url(&self.request.feed_url)?;
        self.try_candidate(&favicon, &mut tried).await
    }

    async fn icon_link_from_page(&self, site: &str) -> Option<String> {
        let (final_url, bytes) = self.download(site, MAX_PAGE_SIZE).await?;
        let html = String::from_utf8_lossy(&bytes);
        find_icon_link_in_html(&html, &final_url)
    }

    async fn try_candidate(&self, url: &str, tried: &mut HashSet<String>) -> Option<FeedIcon> {
        if !tried.insert(url.to_owned()) {
            return None;
        }
        let (_, bytes) = self.download(url, self.options.max_bytes).await?;

        let format = match image::guess_format(&bytes) {
            Ok(format) => format,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Icon candidate is not an image");
                return None;
            }
        };
        let decoded = match image::load_from_memory_with_format(&bytes, format) {
            Ok(img) => img,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Icon candidate failed to decode");
                return None;
            }
        };
        if decoded.width() == 0 || decoded.height() == 0 {
            return None;
        }

        let path = match write_icon_file(&self.options.icon_dir, self.request.feed_id, format, &bytes).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(feed_id = %self.request.feed_id, error = %e, "Failed to save icon");
                return None;
            }
        };

        Some(FeedIcon {
            source_url: url.to_owned(),
            format,
            width: decoded.width(),
            height: decoded.height(),
            path,
        })
    }

    /// GETs `url`, following a few redirects, and returns the final URL with
    /// the body.
    async fn download(&self, url: &str, limit: usize) -> Option<(String, Vec<u8>)> {
        let mut current = validate_url(url, self.options.allow_private_hosts).ok()?;

        for _ in 0..=MAX_ICON_REDIRECTS {
            let response = match self.client.get(current.clone()).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(url = %current, error = %e, "Icon request failed");
                    return None;
                }
            };
            let status = response.status();

            if status.is_redirection() {
                let location = response.headers().get(LOCATION)?.to_str().ok()?;
                let target = resolve_url(location, current.as_str());
                current = validate_url(&target, self.options.allow_private_hosts).ok()?;
                continue;
            }
            if !status.is_success() {
                tracing::debug!(url = %current, status = status.as_u16(), "Icon request rejected");
                return None;
            }

            let bytes = read_limited_bytes(response, limit).await.ok()?;
            return Some((current.to_string(), bytes));
        }

        None
    }
}

/// Writes the icon next to a temporary name and renames it into place, so a
/// reader never sees a partial file and an existing icon survives failures.
pub(crate) async fn write_icon_file(
    dir: &Path,
    feed_id: FeedId,
    format: ImageFormat,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let ext = format.extensions_str().first().copied().unwrap_or("img");
    let path = dir.join(format!("{feed_id}.{ext}"));
    let tmp = dir.join(format!(".{feed_id}.{ext}.part"));

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(path)
}
