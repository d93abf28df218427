use anyhow::{Context, Result};
use async_trait::async_trait;
use dirsync::config::DirsyncConfig;
use dirsync::invalidation::{InvalidationChannel, PolicyChange, PolicyReloader};
use dirsync::secrets::SecretCipher;
use dirsync::store::SqliteIdentityStore;
use std::sync::Arc;
use std::time::Duration;
use sync_manager::api::{create_router, ApiState};
use sync_manager::registry::ProviderContext;
use sync_manager::service::registry_factory;
use sync_manager::{AutoSynchronizer, SqliteSourceStore, SyncService};
use tracing::{info, warn};

/// Standalone deployments have no policy cache; remote changes are only logged.
struct LoggingReloader;

#[async_trait]
impl PolicyReloader for LoggingReloader {
    async fn reload(&self, change: &PolicyChange) -> Result<()> {
        info!(
            entity_id = %change.entity_id,
            operation = ?change.operation,
            origin_id = %change.origin_id,
            "Remote policy change received"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sync_manager=info,dirsync=info".into()),
        )
        .init();

    info!("Sync manager starting...");

    let config = DirsyncConfig::load().context("Failed to load configuration")?;
    info!(
        identity_db = %config.store.identity_db,
        sources_db = %config.store.sources_db,
        api_port = config.api.port,
        batch_size = config.sync.batch_size,
        "Configuration loaded"
    );

    let cipher = match config.store.encryption_key.as_deref() {
        Some(key) => Some(
            SecretCipher::from_base64_key(key).context("Invalid DIRSYNC_ENCRYPTION_KEY")?,
        ),
        None => {
            warn!("No encryption key configured, source secrets are stored unsealed");
            None
        }
    };

    let sources = Arc::new(
        SqliteSourceStore::new(&config.store.sources_db, cipher)
            .context("Failed to initialize source store")?,
    );
    let identities = Arc::new(
        SqliteIdentityStore::new(&config.store.identity_db)
            .context("Failed to initialize identity store")?,
    );
    info!("Stores initialized");

    let channel = InvalidationChannel::connect(&config.invalidation).await;
    let subscriber = channel
        .subscribe(Arc::new(LoggingReloader))
        .await
        .context("Failed to subscribe to policy changes")?;

    let factory = registry_factory(ProviderContext {
        tunnel: None,
        http_timeout: Duration::from_secs(config.sync.http_timeout_secs),
    });
    let service = Arc::new(SyncService::new(
        sources,
        identities,
        channel,
        factory,
        config.sync.batch_size,
    ));

    let manager = Arc::new(AutoSynchronizer::new(Arc::clone(&service)));
    if config.sync.start_on_boot {
        let started = manager.start_all().await?;
        info!(loops_started = started, "Auto-synchronizer started");
    }

    // Start HTTP API server
    let router = create_router(ApiState {
        manager: Arc::clone(&manager),
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api.port))
        .await
        .context("Failed to bind admin API port")?;
    info!(port = config.api.port, "Admin API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Admin API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    if let Some(handle) = subscriber {
        handle.abort();
    }
    manager.shutdown().await;
    info!("Sync manager stopped");

    Ok(())
}
