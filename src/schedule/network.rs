//! Network reachability probing.
//!
//! [`ReachabilityMonitor`] periodically opens a TCP connection to a known
//! endpoint and tells the scheduler when reachability *changes*. It reports
//! transitions only, not every poll.
//!
//! ```rust,ignore
//! let monitor = ReachabilityMonitor::new(handle.clone(), "1.1.1.1:443", cancel.child_token());
//! tokio::spawn(monitor.run());
//! ```

use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::scheduler::SchedulerHandle;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ReachabilityMonitor {
    scheduler: SchedulerHandle,
    target: String,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl ReachabilityMonitor {
    /// Polls `target` (`host:port`) until `cancel` fires.
    pub fn new(scheduler: SchedulerHandle, target: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            scheduler,
            target: target.into(),
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub async fn run(self) {
        // The scheduler starts out assuming the network is up
        let mut last_reachable = true;
        info!(target = %self.target, "reachability monitor started");

        loop {
            let reachable = tokio::select! {
                _ = self.cancel.cancelled() => break,
                reachable = is_reachable(&self.target) => reachable,
            };

            if reachable != last_reachable {
                if reachable {
                    info!(target = %self.target, "network reachable again");
                } else {
                    warn!(target = %self.target, "network unreachable");
                }
                if self.scheduler.network_changed(reachable).await.is_err() {
                    // Scheduler is gone; nothing left to report to
                    break;
                }
                last_reachable = reachable;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("reachability monitor stopped");
    }
}

/// True if a TCP connection to `target` succeeds within the connect timeout.
pub async fn is_reachable(target: &str) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(target)).await,
        Ok(Ok(_))
    )
}
