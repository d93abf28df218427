//! Per-source auto-sync loop.
//!
//! Each enabled source with a non-zero interval gets one loop task that
//! sleeps until the next tick (or a stop signal) and runs a full pass.

use crate::service::SyncService;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable state of one loop.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoopStatus {
    /// Last successful pass
    pub last_run: Option<DateTime<Utc>>,
    /// Error of the latest pass, cleared on success
    pub last_error: Option<String>,
    pub run_count: u64,
    pub error_count: u64,
}

/// Auto-sync loop for a single source.
///
/// - First pass fires one interval after start
/// - Transient failures are recorded and the loop keeps ticking
/// - A configuration error stops the loop until it is restarted
/// - Cancellation is only observed between passes; a running pass finishes
pub struct SourceRunner {
    source_id: String,
    period: Duration,
    service: Arc<SyncService>,
    status: Arc<Mutex<LoopStatus>>,
}

impl SourceRunner {
    pub fn new(source_id: String, period: Duration, service: Arc<SyncService>) -> Self {
        Self {
            source_id,
            period,
            service,
            status: Arc::new(Mutex::new(LoopStatus::default())),
        }
    }

    /// Returns a clone of the status tracker for external monitoring.
    pub fn status(&self) -> Arc<Mutex<LoopStatus>> {
        Arc::clone(&self.status)
    }

    /// Spawns the loop. It exits when `token` is cancelled.
    pub fn start(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                source_id = %self.source_id,
                interval_secs = self.period.as_secs(),
                "Auto-sync loop started"
            );

            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!(source_id = %self.source_id, "Auto-sync loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                if !self.tick().await {
                    break;
                }
            }
        })
    }

    /// Runs one pass. Returns `false` when the loop must stop.
    async fn tick(&self) -> bool {
        debug!(source_id = %self.source_id, "Auto-sync tick");
        if let Err(e) = self.service.mark_attempt(&self.source_id) {
            warn!(source_id = %self.source_id, error = %e, "Failed to record sync attempt");
        }

        match self.service.run_sync_once(&self.source_id).await {
            Ok(_) => {
                let mut status = self.status.lock().await;
                status.last_run = Some(Utc::now());
                status.last_error = None;
                status.run_count += 1;
                true
            }
            Err(e) => {
                let mut status = self.status.lock().await;
                status.last_error = Some(e.to_string());
                status.error_count += 1;

                if e.is_configuration() {
                    error!(
                        source_id = %self.source_id,
                        error = %e,
                        "Configuration error, auto-sync loop stopping"
                    );
                    false
                } else {
                    warn!(
                        source_id = %self.source_id,
                        error = %e,
                        "Auto-sync pass failed, retrying next tick"
                    );
                    true
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source_store::SourceStore;
    use crate::testing::{fixture, source, Behavior};

    const MINUTE: Duration = Duration::from_secs(60);

    fn runner(fx: &crate::testing::Fixture) -> SourceRunner {
        SourceRunner::new("admin/scim".to_string(), MINUTE, Arc::clone(&fx.service))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_pass_waits_one_interval() {
        let fx = fixture(&[source("scim", 1)], Behavior::Succeed, Duration::ZERO);
        let runner = runner(&fx);
        let status = runner.status();
        let token = CancellationToken::new();
        let handle = runner.start(token.clone());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fx.counters.fetches(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.counters.fetches(), 1);
        assert_eq!(status.lock().await.run_count, 1);

        tokio::time::sleep(MINUTE).await;
        assert_eq!(status.lock().await.run_count, 2);

        let stored = fx.sources.get_source("admin/scim").unwrap().unwrap();
        assert!(stored.last_attempt_time.is_some());
        assert!(stored.last_sync_time.is_some());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_keep_ticking() {
        let fx = fixture(&[source("scim", 1)], Behavior::FailNetwork, Duration::ZERO);
        let runner = runner(&fx);
        let status = runner.status();
        let token = CancellationToken::new();
        let handle = runner.start(token.clone());

        tokio::time::sleep(Duration::from_secs(3 * 60 + 1)).await;

        let snapshot = status.lock().await.clone();
        assert_eq!(snapshot.error_count, 3);
        assert_eq!(snapshot.run_count, 0);
        assert!(snapshot.last_error.unwrap().contains("HTTP 503"));
        assert!(!handle.is_finished());

        let stored = fx.sources.get_source("admin/scim").unwrap().unwrap();
        assert_eq!(stored.error_text.lines().count(), 3);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_error_stops_loop() {
        let fx = fixture(&[source("scim", 1)], Behavior::FailConfiguration, Duration::ZERO);
        let runner = runner(&fx);
        let status = runner.status();
        let handle = runner.start(CancellationToken::new());

        handle.await.unwrap();

        let snapshot = status.lock().await.clone();
        assert_eq!(snapshot.error_count, 1);
        assert!(snapshot.last_error.unwrap().contains("configuration error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_tick() {
        let fx = fixture(&[source("scim", 1)], Behavior::Succeed, Duration::ZERO);
        let token = CancellationToken::new();
        let handle = runner(&fx).start(token.clone());

        token.cancel();
        handle.await.unwrap();
        assert_eq!(fx.counters.fetches(), 0);
    }
}
