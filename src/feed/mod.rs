//! Fetching and parsing individual feeds.
//!
//! - [`parser`] - RSS/Atom parsing via `feed-rs`
//! - [`discovery`] - feed and icon `<link>` discovery in HTML pages
//! - [`fetcher`] - one cancellable conditional GET per feed
//! - [`icon`] - favicon lookup, decoding and storage
//!
//! Tasks here know nothing about scheduling. The scheduler creates them,
//! hands them a cancellation token and consumes their single outcome.

pub mod discovery;
pub mod fetcher;
pub mod icon;
pub mod parser;

pub use discovery::{favicon_url, find_feed_link_in_html, find_icon_link_in_html};
pub use fetcher::{
    build_client, FeedUpdate, FetchErrorKind, FetchOptions, FetchOutcome, FetchTask,
    ResponseValidators, DEFAULT_MAX_FEED_SIZE, DEFAULT_MAX_REDIRECTS,
};
pub use icon::{FeedIcon, IconFetchTask, IconOptions, IconOutcome, IconRequest, DEFAULT_MAX_ICON_SIZE};
pub use parser::{parse_feed, ParsedArticle, ParsedFeed};
