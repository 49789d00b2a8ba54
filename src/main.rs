use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use feedwatch::config::Config;
use feedwatch::schedule::{ReachabilityMonitor, Scheduler, SchedulerEvent, SchedulerHandle};
use feedwatch::storage::Database;
use feedwatch::util::validate_url;

/// Get the config directory path (~/.config/feedwatch/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedwatch"))
}

#[derive(Parser, Debug)]
#[command(name = "feedwatch", about = "Background feed refresh daemon")]
struct Args {
    /// Config file (default: ~/.config/feedwatch/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database (default: ~/.config/feedwatch/feeds.db)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Register a feed URL before starting (repeatable)
    #[arg(long = "add", value_name = "URL")]
    add: Vec<String>,

    /// Refresh every feed once, wait until done, then exit
    #[arg(long)]
    once: bool,

    /// Re-resolve the icon of every feed
    #[arg(long)]
    refresh_icons: bool,
}

/// Logs every scheduler event until the scheduler goes away.
async fn log_events(handle: SchedulerHandle, cancel: CancellationToken) {
    let mut events = handle.subscribe();
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SchedulerEvent::FeedCompleted {
                feed_id,
                changed,
                error: Some(error),
                consecutive_errors,
            }) => {
                tracing::warn!(feed_id = %feed_id, changed, error = %error, consecutive_errors, "Feed failed");
            }
            Ok(SchedulerEvent::FeedCompleted { feed_id, changed, .. }) => {
                tracing::info!(feed_id = %feed_id, changed, "Feed refreshed");
            }
            Ok(SchedulerEvent::NetworkStatusChanged { reachable }) => {
                tracing::info!(reachable, "Network status changed");
            }
            Ok(SchedulerEvent::ScheduleChanged { next_wake }) => {
                tracing::debug!(next_wake = ?next_wake, "Next refresh rescheduled");
            }
            Ok(event) => tracing::debug!(event = ?event, "Scheduler event"),
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Event logger lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access to the data directory
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args.db.clone().unwrap_or_else(|| config_dir.join("feeds.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = Database::open(db_path_str)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    for url in &args.add {
        let url = validate_url(url, config.allow_private_hosts)
            .with_context(|| format!("Refusing to add feed '{url}'"))?;
        let id = db
            .insert_feed(url.as_str(), config.default_refresh)
            .await
            .context("Failed to register feed")?;
        println!("Registered feed {id}: {url}");
    }

    let data_dir = db_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir.clone());
    let options = config.scheduler_options(&data_dir);
    let (handle, scheduler_task) =
        Scheduler::spawn(Arc::new(db), options).context("Failed to start scheduler")?;

    let cancel = CancellationToken::new();
    let logger = tokio::spawn(log_events(handle.clone(), cancel.child_token()));

    if let Some(target) = &config.reachability_target {
        let monitor = ReachabilityMonitor::new(handle.clone(), target.clone(), cancel.child_token())
            .with_poll_interval(config.reachability_interval());
        tokio::spawn(monitor.run());
    }

    if args.refresh_icons {
        handle.refresh_all_icons().await?;
    }

    let outcome = if args.once {
        handle.force_update_all().await?;
        handle.wait_until_idle().await?;
        handle.shutdown().await?;
        scheduler_task.await
    } else {
        let mut scheduler_task = scheduler_task;
        tokio::select! {
            joined = &mut scheduler_task => joined,
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted, shutting down");
                // The scheduler may already be gone after a storage failure
                let _ = handle.shutdown().await;
                scheduler_task.await
            }
        }
    };

    cancel.cancel();
    drop(handle);
    let _ = logger.await;

    outcome
        .context("Scheduler task panicked")?
        .context("Scheduler stopped")?;
    Ok(())
}
