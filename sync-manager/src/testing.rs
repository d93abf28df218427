//! Fixtures shared by the service, runner and manager tests.

use crate::service::{ProviderFactory, SyncService};
use crate::source_store::SqliteSourceStore;
use crate::{Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::invalidation::InvalidationChannel;
use dirsync::store::SqliteIdentityStore;
use dirsync::{CanonicalUser, SyncError, SyncResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Behavior {
    Succeed,
    FailNetwork,
    FailConfiguration,
}

/// Counters shared by every provider one factory hands out.
#[derive(Default)]
pub(crate) struct Counters {
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub fetches: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Counters {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedProvider {
    counters: Arc<Counters>,
    behavior: Behavior,
    delay: Duration,
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Scim
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        match self.behavior {
            Behavior::FailConfiguration => {
                Err(SyncError::configuration("client secret (password) is required"))
            }
            _ => Ok(()),
        }
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let now = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(now, Ordering::SeqCst);
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.counters.active.fetch_sub(1, Ordering::SeqCst);

        if self.behavior == Behavior::FailNetwork {
            return Err(SyncError::network("HTTP 503 Service Unavailable"));
        }
        Ok(vec![CanonicalUser {
            id: "1".to_string(),
            name: "alice".to_string(),
            ..Default::default()
        }])
    }

    async fn test_connection(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// An enabled source syncing every `auto_sync` minutes into `acme`.
pub(crate) fn source(name: &str, auto_sync: u64) -> SourceConfig {
    SourceConfig {
        owner: "admin".to_string(),
        name: name.to_string(),
        organization: "acme".to_string(),
        provider_type: "SCIM".to_string(),
        auto_sync,
        is_enabled: true,
        ..Default::default()
    }
}

pub(crate) struct Fixture {
    pub service: Arc<SyncService>,
    pub sources: Arc<SqliteSourceStore>,
    pub counters: Arc<Counters>,
}

/// A service over in-memory stores whose providers follow `behavior`.
pub(crate) fn fixture(sources: &[SourceConfig], behavior: Behavior, delay: Duration) -> Fixture {
    let store = Arc::new(SqliteSourceStore::new(":memory:", None).unwrap());
    for source in sources {
        store.save_source(source).unwrap();
    }
    let counters = Arc::new(Counters::default());
    let factory_counters = Arc::clone(&counters);
    let factory: ProviderFactory = Arc::new(move |_: &SourceConfig| {
        Ok(Box::new(ScriptedProvider {
            counters: Arc::clone(&factory_counters),
            behavior,
            delay,
        }) as Box<dyn Provider>)
    });
    let service = SyncService::new(
        store.clone(),
        Arc::new(SqliteIdentityStore::new(":memory:").unwrap()),
        InvalidationChannel::disabled("pod-test".to_string()),
        factory,
        100,
    );
    Fixture {
        service: Arc::new(service),
        sources: store,
        counters,
    }
}
