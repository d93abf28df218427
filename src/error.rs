//! Error taxonomy for provider and reconciliation failures.
//!
//! The variant decides the retry policy: scheduled runs record everything
//! except [`SyncError::Configuration`] and keep ticking, on-demand runs
//! propagate to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid credential/field. Never retried automatically.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Timeout, connection reset or upstream 5xx. Retried on the next tick.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Write attempted against a provider without writeback.
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    /// Some records of a batch failed; the rest stay committed.
    #[error("{failed} of {attempted} records failed: {detail}")]
    PartialBatch {
        attempted: usize,
        failed: usize,
        detail: String,
    },

    /// Provider response did not have the expected shape.
    #[error("unexpected response shape: {0}")]
    SchemaMismatch(String),

    /// Identity or configuration store failure.
    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        SyncError::Configuration(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        SyncError::TransientNetwork(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        SyncError::SchemaMismatch(msg.into())
    }

    pub fn unsupported(provider: impl Into<String>, operation: &'static str) -> Self {
        SyncError::Unsupported {
            provider: provider.into(),
            operation,
        }
    }

    /// Configuration errors stop a scheduled loop instead of being retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SyncError::Configuration(_))
    }

    /// Short machine-readable kind, used in logs and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::TransientNetwork(_) => "transient_network",
            SyncError::Unsupported { .. } => "unsupported",
            SyncError::PartialBatch { .. } => "partial_batch",
            SyncError::SchemaMismatch(_) => "schema_mismatch",
            SyncError::Store(_) => "store",
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_configuration_flag() {
        let err = SyncError::configuration("client secret (password) is required");
        assert!(err.is_configuration());
        assert_eq!(err.kind(), "configuration");
        assert_eq!(
            err.to_string(),
            "configuration error: client secret (password) is required"
        );

        let err = SyncError::unsupported("okta", "add_user");
        assert!(!err.is_configuration());
        assert_eq!(err.to_string(), "okta does not support add_user");
    }

    #[test]
    fn test_store_error_keeps_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("Failed to insert users");
        let err: SyncError = inner.into();
        assert_eq!(err.kind(), "store");
        assert!(err.to_string().contains("Failed to insert users: disk full"));
    }
}
