//! Single-source sync entry point shared by the scheduler and the admin API.

use crate::reconcile::{Reconciler, SyncReport};
use crate::registry::{build_provider, ProviderContext};
use crate::source_store::{error_line, SourceStore};
use crate::{Provider, SourceConfig};
use chrono::Utc;
use dashmap::DashMap;
use dirsync::invalidation::{InvalidationChannel, PolicyOperation};
use dirsync::store::IdentityStore;
use dirsync::{SyncError, SyncResult};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Builds a fresh provider for one run.
pub type ProviderFactory =
    Arc<dyn Fn(&SourceConfig) -> SyncResult<Box<dyn Provider>> + Send + Sync>;

/// Factory backed by the provider registry.
pub fn registry_factory(ctx: ProviderContext) -> ProviderFactory {
    Arc::new(move |source: &SourceConfig| build_provider(source, &ctx))
}

/// Runs reconciliation passes and keeps the source bookkeeping current.
///
/// Runs of one source are serialized through a per-source async mutex, so a
/// scheduled tick and an on-demand request never interleave. Different
/// sources run concurrently.
pub struct SyncService {
    sources: Arc<dyn SourceStore>,
    identities: Arc<dyn IdentityStore>,
    channel: InvalidationChannel,
    factory: ProviderFactory,
    locks: DashMap<String, Arc<Mutex<()>>>,
    batch_size: usize,
}

impl SyncService {
    pub fn new(
        sources: Arc<dyn SourceStore>,
        identities: Arc<dyn IdentityStore>,
        channel: InvalidationChannel,
        factory: ProviderFactory,
        batch_size: usize,
    ) -> Self {
        Self {
            sources,
            identities,
            channel,
            factory,
            locks: DashMap::new(),
            batch_size,
        }
    }

    pub fn sources(&self) -> &Arc<dyn SourceStore> {
        &self.sources
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }

    fn load(&self, id: &str) -> SyncResult<SourceConfig> {
        self.sources
            .get_source(id)?
            .ok_or_else(|| SyncError::configuration(format!("source '{}' not found", id)))
    }

    /// Runs one full pass for source `id`.
    ///
    /// Success advances `last_sync_time` to the start of the pass. Any
    /// failure is appended to the source's error text and returned.
    pub async fn run_sync_once(&self, id: &str) -> SyncResult<SyncReport> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let source = self.load(id)?;
        let started = Utc::now();
        info!(source_id = %id, provider = %source.provider_type, "Sync started");

        match self.run_pass(&source).await {
            Ok(report) => {
                self.sources.set_last_sync_time(id, started)?;
                for message in &report.errors {
                    self.record_error(id, message);
                }
                if report.changed() {
                    if let Err(e) = self
                        .channel
                        .publish(&source.organization, PolicyOperation::Update)
                        .await
                    {
                        warn!(source_id = %id, error = %e, "Failed to publish policy change");
                    }
                }
                info!(
                    source_id = %id,
                    inserted = report.inserted,
                    updated = report.updated,
                    skipped = report.skipped,
                    "Sync complete"
                );
                Ok(report)
            }
            Err(e) => {
                error!(source_id = %id, kind = e.kind(), error = %e, "Sync failed");
                self.record_error(id, &e.to_string());
                Err(e)
            }
        }
    }

    /// Builds, initializes and checks the provider of `id` without syncing.
    pub async fn test_connection(&self, id: &str) -> SyncResult<()> {
        let source = self.load(id)?;
        let mut provider = (self.factory)(&source)?;
        let result = match provider.init_adapter().await {
            Ok(()) => provider.test_connection().await,
            Err(e) => Err(e),
        };
        close_provider(provider.as_mut(), id).await;
        result
    }

    /// Stamps `last_attempt_time` before a scheduled pass.
    pub fn mark_attempt(&self, id: &str) -> SyncResult<()> {
        self.sources.set_last_attempt_time(id, Utc::now())?;
        Ok(())
    }

    async fn run_pass(&self, source: &SourceConfig) -> SyncResult<SyncReport> {
        let mut provider = (self.factory)(source)?;
        let result = match provider.init_adapter().await {
            Ok(()) => {
                let identities = self.identities.as_ref();
                Reconciler::new(provider.as_ref(), identities, source, self.batch_size)
                    .run()
                    .await
            }
            Err(e) => Err(e),
        };
        close_provider(provider.as_mut(), &source.id()).await;
        result
    }

    fn record_error(&self, id: &str, message: &str) {
        if let Err(e) = self.sources.append_error_text(id, &error_line(Utc::now(), message)) {
            warn!(source_id = %id, error = %e, "Failed to append error text");
        }
    }
}

async fn close_provider(provider: &mut dyn Provider, id: &str) {
    if let Err(e) = provider.close().await {
        warn!(source_id = %id, error = %e, "Failed to close provider");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, source, Behavior};
    use std::time::Duration;

    const DELAY: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_success_advances_last_sync_time() {
        let fx = fixture(&[source("scim", 0)], Behavior::Succeed, DELAY);

        let report = fx.service.run_sync_once("admin/scim").await.unwrap();
        assert_eq!(report.inserted, 1);

        let stored = fx.sources.get_source("admin/scim").unwrap().unwrap();
        assert!(stored.last_sync_time.is_some());
        assert!(stored.error_text.is_empty());
        assert_eq!(fx.counters.closed(), 1);
    }

    #[tokio::test]
    async fn test_failure_appends_error_text_and_keeps_last_sync_time() {
        let fx = fixture(&[source("scim", 0)], Behavior::FailNetwork, DELAY);

        let err = fx.service.run_sync_once("admin/scim").await.unwrap_err();
        assert_eq!(err.kind(), "transient_network");
        fx.service.run_sync_once("admin/scim").await.unwrap_err();

        let stored = fx.sources.get_source("admin/scim").unwrap().unwrap();
        assert!(stored.last_sync_time.is_none());
        assert_eq!(stored.error_text.lines().count(), 2);
        assert!(stored.error_text.contains("HTTP 503"));
        assert_eq!(fx.counters.closed(), 2);
    }

    #[tokio::test]
    async fn test_init_failure_still_closes_provider() {
        let fx = fixture(&[source("scim", 0)], Behavior::FailConfiguration, DELAY);

        let err = fx.service.run_sync_once("admin/scim").await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(fx.counters.fetches(), 0);
        assert_eq!(fx.counters.closed(), 1);
    }

    #[tokio::test]
    async fn test_unknown_source_is_configuration_error() {
        let fx = fixture(&[], Behavior::Succeed, DELAY);
        let err = fx.service.run_sync_once("admin/missing").await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_runs_of_one_source_are_serialized() {
        let fx = fixture(&[source("scim", 0), source("other", 0)], Behavior::Succeed, DELAY);

        let runs: Vec<_> = ["admin/scim", "admin/scim", "admin/scim"]
            .into_iter()
            .map(|id| {
                let service = Arc::clone(&fx.service);
                tokio::spawn(async move { service.run_sync_once(id).await })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }

        assert_eq!(fx.counters.max_active.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(fx.counters.closed(), 3);
    }

    #[tokio::test]
    async fn test_connection_check_closes_provider() {
        let fx = fixture(&[source("scim", 0)], Behavior::Succeed, DELAY);
        fx.service.test_connection("admin/scim").await.unwrap();
        assert_eq!(fx.counters.fetches(), 0);
        assert_eq!(fx.counters.closed(), 1);
    }
}
