//! Auto-sync manager - owns the per-source loop registry.
//!
//! Start, stop and restart of one source are serialized by a per-source
//! lock, so a restart always stops and awaits the old loop before the new
//! one is spawned. Two loops for the same source never run at once. The
//! registry mutex is only held to insert, remove or read handles, never
//! while a loop drains.

use crate::runner::{LoopStatus, SourceRunner};
use crate::service::SyncService;
use dashmap::DashMap;
use dirsync::{SyncError, SyncResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upper bound on a loop interval (one year).
const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Running loop of one source.
struct LoopHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
    status: Arc<Mutex<LoopStatus>>,
}

impl LoopHandle {
    /// Signals the loop and waits for it to exit.
    async fn stop(self, source_id: &str) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(source_id = %source_id, error = %e, "Auto-sync loop ended abnormally");
        }
    }
}

/// Loop state reported to the admin API.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct LoopSnapshot {
    /// `false` once a loop stopped itself after a configuration error
    pub running: bool,
    #[serde(flatten)]
    pub status: LoopStatus,
}

/// Auto-synchronizer: one loop per enabled source.
///
/// # Responsibilities
/// - Start a loop for every enabled source at startup
/// - Replace, stop and inspect individual loops
/// - Stop everything on shutdown
pub struct AutoSynchronizer {
    service: Arc<SyncService>,
    loops: Mutex<HashMap<String, LoopHandle>>,
    /// Per-source start/stop serialization
    transitions: DashMap<String, Arc<Mutex<()>>>,
}

impl AutoSynchronizer {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            service,
            loops: Mutex::new(HashMap::new()),
            transitions: DashMap::new(),
        }
    }

    fn transition_lock(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.transitions.entry(id.to_string()).or_default().value())
    }

    pub fn service(&self) -> &Arc<SyncService> {
        &self.service
    }

    /// Starts (or restarts) the loop of source `id`.
    ///
    /// The source must exist, be enabled and have a non-zero interval.
    pub async fn start_auto_sync(&self, id: &str) -> SyncResult<()> {
        let source = self
            .service
            .sources()
            .get_source(id)?
            .ok_or_else(|| SyncError::configuration(format!("source '{}' not found", id)))?;
        if !source.is_enabled {
            return Err(SyncError::configuration(format!("source '{}' is disabled", id)));
        }
        if source.auto_sync == 0 {
            return Err(SyncError::configuration(format!(
                "source '{}' has no auto-sync interval",
                id
            )));
        }

        let transition = self.transition_lock(id);
        let _transition = transition.lock().await;
        let old = self.loops.lock().await.remove(id);
        if let Some(old) = old {
            old.stop(id).await;
            info!(source_id = %id, "Stopped existing auto-sync loop before restart");
        }

        let period = Duration::from_secs(source.auto_sync.saturating_mul(60)).min(MAX_INTERVAL);
        let runner = SourceRunner::new(id.to_string(), period, Arc::clone(&self.service));
        let token = CancellationToken::new();
        let status = runner.status();
        let handle = runner.start(token.clone());
        self.loops
            .lock()
            .await
            .insert(id.to_string(), LoopHandle { token, handle, status });

        info!(source_id = %id, interval_minutes = source.auto_sync, "Auto-sync scheduled");
        Ok(())
    }

    /// Stops the loop of `id`. Returns `false` when none was registered.
    pub async fn stop_auto_sync(&self, id: &str) -> bool {
        let transition = self.transition_lock(id);
        let _transition = transition.lock().await;
        let removed = self.loops.lock().await.remove(id);
        match removed {
            Some(handle) => {
                handle.stop(id).await;
                info!(source_id = %id, "Auto-sync stopped");
                true
            }
            None => false,
        }
    }

    /// Starts a loop for every enabled source with a non-zero interval.
    ///
    /// # Returns
    /// Number of loops started
    pub async fn start_all(&self) -> SyncResult<usize> {
        let sources = self.service.sources().list_sources()?;
        let mut started = 0;
        for source in sources.iter().filter(|s| s.is_enabled && s.auto_sync > 0) {
            let id = source.id();
            match self.start_auto_sync(&id).await {
                Ok(()) => started += 1,
                Err(e) => warn!(source_id = %id, error = %e, "Failed to start auto-sync"),
            }
        }
        info!(started, total = sources.len(), "Auto-sync loops started");
        Ok(started)
    }

    /// Stops every loop and waits for all of them.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, LoopHandle)> = self.loops.lock().await.drain().collect();
        if !drained.is_empty() {
            info!(loop_count = drained.len(), "Stopping auto-sync loops");
        }
        for (id, handle) in drained {
            handle.stop(&id).await;
        }
    }

    /// Snapshot of every registered loop.
    pub async fn status(&self) -> HashMap<String, LoopSnapshot> {
        let entries: Vec<(String, bool, Arc<Mutex<LoopStatus>>)> = {
            let loops = self.loops.lock().await;
            loops
                .iter()
                .map(|(id, l)| (id.clone(), !l.handle.is_finished(), Arc::clone(&l.status)))
                .collect()
        };

        let mut snapshot = HashMap::with_capacity(entries.len());
        for (id, running, status) in entries {
            let status = status.lock().await.clone();
            snapshot.insert(id, LoopSnapshot { running, status });
        }
        snapshot
    }

    /// True when a loop for `id` is registered and has not exited.
    pub async fn is_running(&self, id: &str) -> bool {
        self.loops
            .lock()
            .await
            .get(id)
            .is_some_and(|l| !l.handle.is_finished())
    }
}

impl Drop for AutoSynchronizer {
    fn drop(&mut self) {
        // Best-effort cancellation (try_lock since Drop is sync)
        if let Ok(loops) = self.loops.try_lock() {
            for l in loops.values() {
                l.token.cancel();
            }
        }
    }
}
