//! Background refresh engine for RSS/Atom subscriptions.
//!
//! `feedwatch` keeps a set of independently configured feeds up to date. Each
//! feed has its own refresh interval, HTTP caching tokens and failure history;
//! the [`Scheduler`](schedule::Scheduler) decides which feed is due, bounds how
//! many fetches run at once, reacts to network reachability changes and writes
//! every outcome back through a [`FeedStore`](storage::FeedStore).
//!
//! # Architecture
//!
//! - [`schedule`] - refresh policy, per-feed schedule state, the dispatch queue
//!   and the scheduler actor
//! - [`feed`] - the per-feed fetch pipeline (conditional GET, redirects, HTML
//!   auto-discovery, parsing) and icon fetching
//! - [`storage`] - the store contract plus in-memory and SQLite implementations
//! - [`config`] - TOML configuration
//! - [`util`] - URL validation

pub mod config;
pub mod feed;
pub mod schedule;
pub mod storage;
pub mod util;
