use anyhow::{Context, Result};
use serde::Deserialize;

pub use crate::invalidation::InvalidationConfig;

/// Complete dirsync configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirsyncConfig {
    #[serde(default)]
    pub invalidation: InvalidationConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Local SQLite stores
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_identity_db")]
    pub identity_db: String,
    #[serde(default = "default_sources_db")]
    pub sources_db: String,
    /// Base64-encoded 32-byte key sealing source secrets
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_identity_db() -> String {
    "identity.db".to_string()
}

fn default_sources_db() -> String {
    "sources.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            identity_db: default_identity_db(),
            sources_db: default_sources_db(),
            encryption_key: None,
        }
    }
}

/// Reconciliation and scheduling knobs
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Records per identity-store insert batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound for a single provider HTTP request
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Start a loop for every enabled source on boot
    #[serde(default = "default_start_on_boot")]
    pub start_on_boot: bool,
}

fn default_batch_size() -> usize {
    100
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_start_on_boot() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            http_timeout_secs: default_http_timeout_secs(),
            start_on_boot: default_start_on_boot(),
        }
    }
}

/// Admin API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

fn default_api_port() -> u16 {
    3002
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

impl DirsyncConfig {
    /// Loads `DIRSYNC_CONFIG` (when set) and applies environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("DIRSYNC_CONFIG") {
            Ok(path) => load_config(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables win over file values.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("NATS_URL") {
            self.invalidation.url = Some(v).filter(|u| !u.is_empty());
        }
        if let Ok(v) = std::env::var("DIRSYNC_IDENTITY_DB") {
            self.store.identity_db = v;
        }
        if let Ok(v) = std::env::var("DIRSYNC_SOURCES_DB") {
            self.store.sources_db = v;
        }
        if let Ok(v) = std::env::var("DIRSYNC_ENCRYPTION_KEY") {
            self.store.encryption_key = Some(v);
        }
        if let Ok(v) = std::env::var("DIRSYNC_API_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.api.port = port;
            }
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<DirsyncConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse config file {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DirsyncConfig::default();
        assert_eq!(config.invalidation.subject, "dirsync.policy.change");
        assert_eq!(config.store.identity_db, "identity.db");
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.sync.http_timeout_secs, 30);
        assert!(config.sync.start_on_boot);
        assert_eq!(config.api.port, 3002);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [invalidation]
            url = "nats://nats.internal:4222"
            subject = "acme.policy.change"
            origin_id = "pod-a"

            [store]
            identity_db = "/var/lib/dirsync/identity.db"
            sources_db = "/var/lib/dirsync/sources.db"

            [sync]
            batch_size = 250
            http_timeout_secs = 60
            start_on_boot = false

            [api]
            port = 8080
        "#;

        let config: DirsyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.invalidation.url.as_deref(), Some("nats://nats.internal:4222"));
        assert_eq!(config.invalidation.origin_id.as_deref(), Some("pod-a"));
        assert_eq!(config.store.sources_db, "/var/lib/dirsync/sources.db");
        assert_eq!(config.sync.batch_size, 250);
        assert!(!config.sync.start_on_boot);
        assert_eq!(config.api.port, 8080);
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
            [sync]
            batch_size = 10
        "#;

        let config: DirsyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.http_timeout_secs, 30);
        assert_eq!(config.store.sources_db, "sources.db");
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dirsync.toml");
        std::fs::write(&path, "[api]\nport = 9000\n").unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.api.port, 9000);
        assert!(load_config("/nonexistent/dirsync.toml").is_err());
    }
}
