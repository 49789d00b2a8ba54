//! End-to-end scheduler behaviour against a mock HTTP server and the
//! in-memory store.

use chrono::{DateTime, TimeDelta, Utc};
use pretty_assertions::assert_eq;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedwatch::feed::FetchErrorKind;
use feedwatch::schedule::{
    RefreshInterval, ScheduleState, Scheduler, SchedulerError, SchedulerEvent, SchedulerHandle,
    SchedulerOptions, SchedulerPhase, SchedulerStatus, TimeUnit,
};
use feedwatch::storage::{FeedId, FeedStore, MemoryStore, RecordedResult};

const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Test Feed</title>
    <item><guid>a1</guid><title>Article 1</title></item>
    <item><guid>a2</guid><title>Article 2</title></item>
  </channel>
</rss>"#;

fn options(max_concurrent_fetches: usize) -> SchedulerOptions {
    SchedulerOptions {
        max_concurrent_fetches,
        request_timeout: Duration::from_secs(10),
        urgent_request_timeout: Duration::from_secs(10),
        icon_dir: std::env::temp_dir().join(format!("feedwatch-it-icons-{}", std::process::id())),
        allow_private_hosts: true,
        ..SchedulerOptions::default()
    }
}

fn rss() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(VALID_RSS)
        .insert_header("Content-Type", "application/rss+xml")
}

/// Schedule state of a feed that is not due for another hour.
fn not_due() -> ScheduleState {
    ScheduleState {
        next_scheduled: Some(Utc::now() + TimeDelta::hours(1)),
        ..ScheduleState::default()
    }
}

fn spawn(
    store: &Arc<MemoryStore>,
    options: SchedulerOptions,
) -> (SchedulerHandle, tokio::task::JoinHandle<Result<(), SchedulerError>>) {
    let store: Arc<dyn FeedStore> = store.clone();
    Scheduler::spawn(store, options).unwrap()
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_status(
    handle: &SchedulerHandle,
    check: impl Fn(&SchedulerStatus) -> bool,
) -> SchedulerStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = handle.status().await.unwrap();
        if check(&status) {
            return status;
        }
        assert!(Instant::now() < deadline, "status not reached: {status:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn assert_close(actual: Option<DateTime<Utc>>, expected: DateTime<Utc>) {
    let actual = actual.expect("next_scheduled should be set");
    let drift = (actual - expected).num_seconds().abs();
    assert!(drift <= 5, "expected ~{expected}, got {actual}");
}

#[tokio::test]
async fn test_never_fetched_feed_is_refreshed_and_rescheduled() {
    let server = MockServer::start().await;
    Mock::given(path("/feed"))
        .respond_with(rss().insert_header("ETag", "\"v1\""))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new(RefreshInterval::new(30, TimeUnit::Minutes)));
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    let (handle, _task) = spawn(&store, options(4));
    let mut events = handle.subscribe();

    wait_until(|| store.last_result(id).is_some()).await;
    let started = Utc::now();

    assert_eq!(
        store.last_result(id),
        Some(RecordedResult::Updated { articles: 2 })
    );
    assert_eq!(store.feed_title(id).as_deref(), Some("Test Feed"));
    let state = store.schedule_state(id).unwrap();
    assert_eq!(state.consecutive_errors, 0);
    assert_eq!(state.cache.etag.as_deref(), Some("\"v1\""));
    assert_close(state.next_scheduled, started + TimeDelta::seconds(1800));

    let completed = loop {
        match events.recv().await.unwrap() {
            SchedulerEvent::FeedCompleted { feed_id, changed, .. } => break (feed_id, changed),
            _ => continue,
        }
    };
    assert_eq!(completed, (id, true));

    let status = wait_status(&handle, |s| !s.is_updating()).await;
    assert_close(status.next_wake, started + TimeDelta::seconds(1800));
    assert!(status.time_until_next_update(Utc::now()).unwrap() > TimeDelta::minutes(25));
}

#[tokio::test]
async fn test_disabled_feed_is_never_scheduled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(rss())
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    store.insert_feed_with_interval(format!("{}/feed", server.uri()), RefreshInterval::disabled());
    let (handle, _task) = spawn(&store, options(4));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.phase, SchedulerPhase::Idle);
    server.verify().await;
}

#[tokio::test]
async fn test_concurrency_limit_bounds_forced_updates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(rss().set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let ids: Vec<FeedId> = (0..10)
        .map(|i| {
            let id = store.insert_feed(format!("{}/feed/{i}", server.uri()));
            store.set_schedule_state(id, not_due());
            id
        })
        .collect();
    let (handle, _task) = spawn(&store, options(4));

    handle.force_update_all().await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.in_flight, 4);
    assert_eq!(status.queued, 6);
    assert_eq!(status.phase, SchedulerPhase::Running);

    wait_status(&handle, |s| !s.is_updating()).await;
    for id in ids {
        assert_eq!(store.results_written(id), 1);
    }
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.iter().filter(|r| r.url.path().starts_with("/feed/")).count(), 10);
}

#[tokio::test]
async fn test_duplicate_force_update_dispatches_once() {
    let server = MockServer::start().await;
    Mock::given(path("/feed"))
        .respond_with(rss().set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    store.set_schedule_state(id, not_due());
    let (handle, _task) = spawn(&store, options(4));

    handle.force_update(id).await.unwrap();
    handle.force_update(id).await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.in_flight + status.queued, 1);

    wait_status(&handle, |s| !s.is_updating()).await;
    assert_eq!(store.results_written(id), 1);
    server.verify().await;
}

#[tokio::test]
async fn test_network_loss_cancels_and_restore_redispatches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(rss().set_delay(Duration::from_millis(1500)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let ids: Vec<FeedId> = (0..3)
        .map(|i| {
            let id = store.insert_feed(format!("{}/feed/{i}", server.uri()));
            store.set_schedule_state(id, not_due());
            id
        })
        .collect();
    let (handle, _task) = spawn(&store, options(4));
    let mut events = handle.subscribe();

    handle.force_update_all().await.unwrap();
    assert_eq!(handle.status().await.unwrap().in_flight, 3);

    handle.network_changed(false).await.unwrap();
    let status = wait_status(&handle, |s| s.in_flight == 0).await;
    assert_eq!(status.phase, SchedulerPhase::OfflineWaiting);
    assert_eq!(status.queued, 3);
    assert!(!status.online);
    for id in &ids {
        assert_eq!(store.results_written(*id), 0);
        assert_untouched(&store, *id);
    }

    let offline = loop {
        if let SchedulerEvent::NetworkStatusChanged { reachable } = events.recv().await.unwrap() {
            break reachable;
        }
    };
    assert!(!offline);

    handle.network_changed(true).await.unwrap();
    wait_status(&handle, |s| !s.is_updating()).await;
    for id in &ids {
        assert_eq!(store.results_written(*id), 1);
        assert_eq!(store.schedule_state(*id).unwrap().consecutive_errors, 0);
    }
}

/// A cancelled fetch leaves the stored state as it was.
fn assert_untouched(store: &MemoryStore, id: FeedId) {
    let state = store.schedule_state(id).unwrap();
    assert_eq!(state.consecutive_errors, 0);
    assert!(state.cache.is_empty());
    assert!(state.next_scheduled.unwrap() > Utc::now());
}

#[tokio::test]
async fn test_failures_back_off_and_success_resets() {
    let server = MockServer::start().await;
    Mock::given(path("/feed"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new(RefreshInterval::new(10, TimeUnit::Minutes)));
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    store.set_schedule_state(id, not_due());
    let (handle, _task) = spawn(&store, options(4));
    let mut events = handle.subscribe();

    handle.force_update(id).await.unwrap();
    wait_until(|| store.results_written(id) == 1).await;
    let state = store.schedule_state(id).unwrap();
    assert_eq!(state.consecutive_errors, 1);
    assert_close(state.next_scheduled, Utc::now() + TimeDelta::seconds(1200));
    assert_eq!(
        store.last_result(id),
        Some(RecordedResult::Failed(FetchErrorKind::HttpStatus(500)))
    );

    let failure = loop {
        if let SchedulerEvent::FeedCompleted { error, consecutive_errors, .. } = events.recv().await.unwrap() {
            break (error, consecutive_errors);
        }
    };
    assert_eq!(failure, (Some(FetchErrorKind::HttpStatus(500)), 1));

    handle.force_update(id).await.unwrap();
    wait_until(|| store.results_written(id) == 2).await;
    let state = store.schedule_state(id).unwrap();
    assert_eq!(state.consecutive_errors, 2);
    assert_close(state.next_scheduled, Utc::now() + TimeDelta::seconds(2400));

    server.reset().await;
    Mock::given(path("/feed")).respond_with(rss()).mount(&server).await;

    handle.force_update(id).await.unwrap();
    wait_until(|| store.results_written(id) == 3).await;
    let state = store.schedule_state(id).unwrap();
    assert_eq!(state.consecutive_errors, 0);
    assert_close(state.next_scheduled, Utc::now() + TimeDelta::seconds(600));
}

#[tokio::test]
async fn test_not_modified_keeps_validators() {
    let server = MockServer::start().await;
    Mock::given(path("/feed"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    let mut state = not_due();
    state.cache = feedwatch::schedule::ConditionalCacheState::new(Some("\"v1\"".into()), None);
    state.consecutive_errors = 3;
    store.set_schedule_state(id, state);
    let (handle, _task) = spawn(&store, options(4));

    handle.force_update(id).await.unwrap();
    wait_until(|| store.results_written(id) == 1).await;

    assert_eq!(store.last_result(id), Some(RecordedResult::NotModified));
    let state = store.schedule_state(id).unwrap();
    assert_eq!(state.cache.etag.as_deref(), Some("\"v1\""));
    assert_eq!(state.consecutive_errors, 0);
    server.verify().await;
}

#[tokio::test]
async fn test_success_without_validators_clears_tokens() {
    let server = MockServer::start().await;
    Mock::given(path("/feed")).respond_with(rss()).mount(&server).await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    let mut state = not_due();
    state.cache = feedwatch::schedule::ConditionalCacheState::new(
        Some("\"stale\"".into()),
        Some("Mon, 01 Jan 2024 00:00:00 GMT".into()),
    );
    store.set_schedule_state(id, state);
    let (handle, _task) = spawn(&store, options(4));

    handle.force_update(id).await.unwrap();
    wait_until(|| store.results_written(id) == 1).await;
    assert!(store.schedule_state(id).unwrap().cache.is_empty());
}

#[tokio::test]
async fn test_redirect_rewrites_feed_url() {
    let server = MockServer::start().await;
    Mock::given(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
        .mount(&server)
        .await;
    Mock::given(path("/new")).respond_with(rss()).mount(&server).await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/old", server.uri()));
    let (_handle, _task) = spawn(&store, options(4));

    wait_until(|| store.results_written(id) == 1).await;
    assert_eq!(store.feed_url(id), Some(format!("{}/new", server.uri())));
}

#[tokio::test]
async fn test_pause_holds_dispatch_until_resume() {
    let server = MockServer::start().await;
    Mock::given(path("/feed")).respond_with(rss()).mount(&server).await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    store.set_schedule_state(id, not_due());
    let (handle, _task) = spawn(&store, options(4));

    handle.pause().await.unwrap();
    handle.force_update(id).await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.phase, SchedulerPhase::Paused);
    assert_eq!((status.in_flight, status.queued), (0, 1));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.results_written(id), 0);

    handle.resume().await.unwrap();
    wait_until(|| store.results_written(id) == 1).await;
    let status = wait_status(&handle, |s| !s.is_updating()).await;
    assert!(!status.paused);
}

#[tokio::test]
async fn test_pause_lets_running_fetch_finish() {
    let server = MockServer::start().await;
    Mock::given(path("/feed"))
        .respond_with(rss().set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    store.set_schedule_state(id, not_due());
    let (handle, _task) = spawn(&store, options(4));

    handle.force_update(id).await.unwrap();
    handle.pause().await.unwrap();
    wait_until(|| store.results_written(id) == 1).await;
    assert_eq!(
        store.last_result(id),
        Some(RecordedResult::Updated { articles: 2 })
    );
}

#[tokio::test]
async fn test_download_list_reports_batch() {
    let server = MockServer::start().await;
    Mock::given(path("/ok/1")).respond_with(rss()).mount(&server).await;
    Mock::given(path("/ok/2")).respond_with(rss()).mount(&server).await;
    Mock::given(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let mut feeds = Vec::new();
    for p in ["/ok/1", "/ok/2", "/missing"] {
        let id = store.insert_feed(format!("{}{p}", server.uri()));
        store.set_schedule_state(id, not_due());
        feeds.push(store.read_feed(id).await.unwrap().unwrap());
    }
    let missing = feeds[2].id;
    let (handle, _task) = spawn(&store, options(2));
    let mut events = handle.subscribe();

    let report = handle.download_list(feeds, false).await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), report)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, vec![(missing, FetchErrorKind::HttpStatus(404))]);
    assert_eq!(report.total(), 3);

    // Background batches report aggregate progress, not per-feed completions
    let mut saw_final_progress = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SchedulerEvent::BatchProgress { remaining: 0, .. } => saw_final_progress = true,
            SchedulerEvent::FeedCompleted { .. } => panic!("unexpected per-feed event"),
            _ => {}
        }
    }
    assert!(saw_final_progress);
}

#[tokio::test]
async fn test_removed_feed_fetch_is_discarded() {
    let server = MockServer::start().await;
    Mock::given(path("/feed"))
        .respond_with(rss().set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    let (handle, _task) = spawn(&store, options(4));

    wait_status(&handle, |s| s.in_flight == 1).await;
    store.remove_feed(id);
    handle.feed_removed(id).await.unwrap();

    let status = wait_status(&handle, |s| !s.is_updating()).await;
    assert_eq!(status.phase, SchedulerPhase::Idle);
    assert_eq!(status.next_wake, None);
}

#[tokio::test]
async fn test_timer_fires_when_feed_becomes_due() {
    let server = MockServer::start().await;
    Mock::given(path("/feed")).respond_with(rss()).mount(&server).await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    let due_at = Utc::now() + TimeDelta::milliseconds(1500);
    store.set_schedule_state(
        id,
        ScheduleState {
            next_scheduled: Some(due_at),
            ..ScheduleState::default()
        },
    );
    let (handle, _task) = spawn(&store, options(4));

    let status = handle.status().await.unwrap();
    assert_eq!(status.next_wake, Some(due_at));
    assert_eq!(store.results_written(id), 0);

    wait_until(|| store.results_written(id) == 1).await;
    assert!(Utc::now() >= due_at);
}

#[tokio::test]
async fn test_interval_change_enables_overdue_feed() {
    let server = MockServer::start().await;
    Mock::given(path("/feed")).respond_with(rss()).mount(&server).await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed_with_interval(format!("{}/feed", server.uri()), RefreshInterval::disabled());
    let (handle, _task) = spawn(&store, options(4));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.results_written(id), 0);

    store.set_interval(id, RefreshInterval::new(1, TimeUnit::Hours));
    handle.interval_changed(id).await.unwrap();
    wait_until(|| store.results_written(id) == 1).await;
}

fn png_bytes() -> Vec<u8> {
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(16, 16));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

#[tokio::test]
async fn test_icon_fetched_after_first_success() {
    let server = MockServer::start().await;
    Mock::given(path("/feed")).respond_with(rss()).mount(&server).await;
    Mock::given(path("/favicon.ico"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    let (handle, _task) = spawn(&store, options(4));
    let mut events = handle.subscribe();

    let updated = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(SchedulerEvent::IconUpdated { feed_id }) = events.recv().await {
                break feed_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(updated, id);

    let icon = store.icon(id).unwrap();
    assert_eq!((icon.width, icon.height), (16, 16));
    assert!(icon.path.exists());
}

#[tokio::test]
async fn test_storage_failure_stops_scheduler() {
    let store = Arc::new(MemoryStore::default());
    store.insert_feed("https://example.com/feed");
    store.set_failing(true);

    let (handle, task) = spawn(&store, options(4));
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(SchedulerError::Storage(_))));
    assert!(matches!(handle.status().await, Err(SchedulerError::Stopped)));
}

#[tokio::test]
async fn test_shutdown_resolves_pending_batch() {
    let server = MockServer::start().await;
    Mock::given(path("/feed"))
        .respond_with(rss().set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    store.set_schedule_state(id, not_due());
    let feed = store.read_feed(id).await.unwrap().unwrap();
    let (handle, task) = spawn(&store, options(4));

    let report = handle.download_list(vec![feed], true).await.unwrap();
    handle.shutdown().await.unwrap();

    let report = report.await.unwrap();
    assert_eq!(report.skipped, 1);
    assert!(task.await.unwrap().is_ok());
    assert_eq!(store.results_written(id), 0);
}

/// Pauses, lets the feed come due, and returns once it sits in the queue.
async fn queue_while_paused(store: &MemoryStore, handle: &SchedulerHandle, id: FeedId) {
    handle.pause().await.unwrap();
    store.set_schedule_state(
        id,
        ScheduleState {
            next_scheduled: Some(Utc::now() - TimeDelta::seconds(1)),
            ..ScheduleState::default()
        },
    );
    handle.schedule_next_feed().await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!((status.in_flight, status.queued), (0, 1));
}

#[tokio::test]
async fn test_feed_disabled_while_queued_is_not_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(rss())
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    store.set_schedule_state(id, not_due());
    let (handle, _task) = spawn(&store, options(4));
    queue_while_paused(&store, &handle, id).await;

    store.set_interval(id, RefreshInterval::disabled());
    handle.interval_changed(id).await.unwrap();
    assert_eq!(handle.status().await.unwrap().queued, 0);

    handle.resume().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.status().await.unwrap();
    assert_eq!(status.phase, SchedulerPhase::Idle);
    assert_eq!(status.next_wake, None);
    assert_eq!(store.results_written(id), 0);
    server.verify().await;
}

#[tokio::test]
async fn test_queued_feed_rechecked_at_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(rss())
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed(format!("{}/feed", server.uri()));
    store.set_schedule_state(id, not_due());
    let (handle, _task) = spawn(&store, options(4));
    queue_while_paused(&store, &handle, id).await;

    // Disabled in the store without telling the scheduler
    store.set_interval(id, RefreshInterval::disabled());
    handle.resume().await.unwrap();

    let status = wait_status(&handle, |s| !s.is_updating()).await;
    assert_eq!(status.phase, SchedulerPhase::Idle);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.results_written(id), 0);
    server.verify().await;
}

#[tokio::test]
async fn test_forced_update_of_disabled_feed_still_runs() {
    let server = MockServer::start().await;
    Mock::given(path("/feed")).respond_with(rss()).mount(&server).await;

    let store = Arc::new(MemoryStore::default());
    let id = store.insert_feed_with_interval(format!("{}/feed", server.uri()), RefreshInterval::disabled());
    let (handle, _task) = spawn(&store, options(4));

    handle.force_update(id).await.unwrap();
    wait_until(|| store.results_written(id) == 1).await;
    assert_eq!(
        store.last_result(id),
        Some(RecordedResult::Updated { articles: 2 })
    );
}

#[tokio::test]
async fn test_refresh_all_icons_covers_every_feed() {
    let server = MockServer::start().await;
    Mock::given(path("/favicon.ico"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(png_bytes()))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::default());
    let bare = store.insert_feed(format!("{}/feed/bare", server.uri()));
    let known = store.insert_feed(format!("{}/feed/known", server.uri()));
    for id in [bare, known] {
        store.set_schedule_state(id, not_due());
    }
    let stale = feedwatch::feed::FeedIcon {
        source_url: "https://old.example/icon.png".to_owned(),
        format: image::ImageFormat::Png,
        width: 1,
        height: 1,
        path: std::env::temp_dir().join("feedwatch-stale-icon.png"),
    };
    store.write_icon(known, &stale).await.unwrap();

    let (handle, _task) = spawn(&store, options(4));
    let mut events = handle.subscribe();
    handle.refresh_all_icons().await.unwrap();

    let mut updated = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while updated.len() < 2 {
            if let Ok(SchedulerEvent::IconUpdated { feed_id }) = events.recv().await {
                updated.push(feed_id);
            }
        }
    })
    .await
    .unwrap();
    updated.sort();
    assert_eq!(updated, vec![bare, known]);

    for id in [bare, known] {
        let icon = store.icon(id).unwrap();
        assert!(icon.source_url.ends_with("/favicon.ico"), "{}", icon.source_url);
        assert_eq!((icon.width, icon.height), (16, 16));
    }
    let status = wait_status(&handle, |s| s.is_idle()).await;
    assert_eq!(status.icons_in_flight, 0);
}
