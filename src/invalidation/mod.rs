//! Cross-instance policy cache invalidation.
//!
//! Instances sharing one backing store announce policy-affecting changes on a
//! broadcast subject. Every other instance reloads the named policy object;
//! the publishing instance ignores its own messages.
//!
//! # Wire format
//! ```json
//! {"entityId": "acme", "operation": "update", "timestamp": "2025-01-01T00:00:00Z", "originId": "pod-web-1"}
//! ```

mod channel;

pub use channel::{Dispatch, InvalidationChannel, InvalidationConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of change carried by a [`PolicyChange`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOperation {
    Add,
    Remove,
    Update,
    Reload,
}

/// One invalidation message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChange {
    /// Name of the cached policy object to reload
    pub entity_id: String,
    pub operation: PolicyOperation,
    pub timestamp: DateTime<Utc>,
    /// Identity of the publishing instance
    pub origin_id: String,
}

/// Reload hook of the policy engine. Called for every foreign change.
#[async_trait]
pub trait PolicyReloader: Send + Sync {
    async fn reload(&self, change: &PolicyChange) -> anyhow::Result<()>;
}

/// Builds this process's origin id.
///
/// Uses `HOSTNAME`, then `POD_NAME`, then the system hostname, with dots
/// replaced by dashes. Falls back to a random id.
pub fn generate_origin_id() -> String {
    let from_env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
    let host = from_env("HOSTNAME").or_else(|| from_env("POD_NAME")).or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
    });

    match host {
        Some(host) => format!("pod-{}", host.trim().replace('.', "-")),
        None => format!("pod-{:016x}", rand::random::<u64>()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let change = PolicyChange {
            entity_id: "acme".to_string(),
            operation: PolicyOperation::Reload,
            timestamp: "2025-03-01T12:00:00Z".parse().unwrap(),
            origin_id: "pod-web-1".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&change).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "entityId": "acme",
                "operation": "reload",
                "timestamp": "2025-03-01T12:00:00Z",
                "originId": "pod-web-1"
            })
        );
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let raw = r#"{"entityId":"a","operation":"purge","timestamp":"2025-03-01T12:00:00Z","originId":"x"}"#;
        assert!(serde_json::from_str::<PolicyChange>(raw).is_err());
    }

    #[test]
    fn test_origin_id_shape() {
        let id = generate_origin_id();
        assert!(id.starts_with("pod-"));
        assert!(!id.contains('.'));
        assert!(id.len() > 4);
    }
}
