use super::{generate_origin_id, PolicyChange, PolicyOperation, PolicyReloader};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Invalidation channel configuration.
///
/// `url = None` disables cross-instance invalidation entirely.
#[derive(Clone, Debug, Deserialize)]
pub struct InvalidationConfig {
    #[serde(default = "default_url")]
    pub url: Option<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Overrides the generated origin id
    #[serde(default)]
    pub origin_id: Option<String>,
}

fn default_url() -> Option<String> {
    std::env::var("NATS_URL").ok().filter(|u| !u.is_empty())
}

fn default_subject() -> String {
    "dirsync.policy.change".to_string()
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            subject: default_subject(),
            origin_id: None,
        }
    }
}

/// Outcome of handling one incoming payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Published by this instance, not acted upon
    OwnMessage,
    Reloaded,
    Malformed,
    ReloadFailed,
}

/// NATS-backed publish/subscribe of [`PolicyChange`] messages.
///
/// Without a connection every operation is a no-op, which degrades the
/// system to single-instance behaviour without failing callers.
#[derive(Clone)]
pub struct InvalidationChannel {
    client: Option<async_nats::Client>,
    subject: String,
    origin_id: String,
}

impl InvalidationChannel {
    /// Connects to NATS. A missing URL or a failed connection yields a disabled channel.
    pub async fn connect(config: &InvalidationConfig) -> Self {
        let origin_id = config.origin_id.clone().unwrap_or_else(generate_origin_id);

        let Some(url) = config.url.as_deref() else {
            info!("Invalidation channel not configured, running single-instance");
            return Self::disabled(origin_id);
        };

        match async_nats::connect(url).await {
            Ok(client) => {
                info!(
                    url = %url,
                    subject = %config.subject,
                    origin_id = %origin_id,
                    "Invalidation channel connected"
                );
                Self {
                    client: Some(client),
                    subject: config.subject.clone(),
                    origin_id,
                }
            }
            Err(e) => {
                warn!(
                    url = %url,
                    error = %e,
                    "Failed to connect invalidation channel, running single-instance"
                );
                Self::disabled(origin_id)
            }
        }
    }

    /// A channel that never publishes or receives.
    pub fn disabled(origin_id: String) -> Self {
        Self {
            client: None,
            subject: default_subject(),
            origin_id,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    /// Announces a change of `entity_id` to the other instances.
    pub async fn publish(&self, entity_id: &str, operation: PolicyOperation) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };

        let change = PolicyChange {
            entity_id: entity_id.to_string(),
            operation,
            timestamp: Utc::now(),
            origin_id: self.origin_id.clone(),
        };
        let payload = serde_json::to_vec(&change).context("Failed to serialize policy change")?;

        debug!(
            entity_id = %entity_id,
            operation = ?operation,
            subject = %self.subject,
            "Publishing policy change"
        );
        client
            .publish(self.subject.clone(), payload.into())
            .await
            .with_context(|| format!("Failed to publish policy change to '{}'", self.subject))?;
        Ok(())
    }

    /// Starts the subscriber task. Returns `None` when the channel is disabled.
    pub async fn subscribe(
        &self,
        reloader: Arc<dyn PolicyReloader>,
    ) -> Result<Option<JoinHandle<()>>> {
        let Some(client) = &self.client else {
            return Ok(None);
        };

        let mut subscriber = client
            .subscribe(self.subject.clone())
            .await
            .with_context(|| format!("Failed to subscribe to '{}'", self.subject))?;

        let channel = self.clone();
        let handle = tokio::spawn(async move {
            info!(subject = %channel.subject, "Policy change subscriber started");
            while let Some(message) = subscriber.next().await {
                channel.dispatch(&message.payload, reloader.as_ref()).await;
            }
            warn!(subject = %channel.subject, "Policy change subscription closed");
        });
        Ok(Some(handle))
    }

    /// Handles one raw message: drops our own, reloads on everything else.
    pub async fn dispatch(&self, payload: &[u8], reloader: &dyn PolicyReloader) -> Dispatch {
        let change: PolicyChange = match serde_json::from_slice(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed policy change message");
                return Dispatch::Malformed;
            }
        };

        if change.origin_id == self.origin_id {
            return Dispatch::OwnMessage;
        }

        info!(
            entity_id = %change.entity_id,
            operation = ?change.operation,
            origin_id = %change.origin_id,
            "Reloading policy after remote change"
        );
        match reloader.reload(&change).await {
            Ok(()) => Dispatch::Reloaded,
            Err(e) => {
                warn!(entity_id = %change.entity_id, error = %e, "Policy reload failed");
                Dispatch::ReloadFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReloader {
        reloaded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PolicyReloader for RecordingReloader {
        async fn reload(&self, change: &PolicyChange) -> Result<()> {
            self.reloaded.lock().unwrap().push(change.entity_id.clone());
            Ok(())
        }
    }

    struct FailingReloader;

    #[async_trait]
    impl PolicyReloader for FailingReloader {
        async fn reload(&self, _change: &PolicyChange) -> Result<()> {
            anyhow::bail!("policy table unreachable")
        }
    }

    fn message(entity: &str, origin: &str) -> Vec<u8> {
        serde_json::to_vec(&PolicyChange {
            entity_id: entity.to_string(),
            operation: PolicyOperation::Update,
            timestamp: Utc::now(),
            origin_id: origin.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_own_message_never_reloads() {
        let channel = InvalidationChannel::disabled("pod-self".to_string());
        let reloader = RecordingReloader::default();

        let outcome = channel.dispatch(&message("acme", "pod-self"), &reloader).await;

        assert_eq!(outcome, Dispatch::OwnMessage);
        assert!(reloader.reloaded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_message_reloads_named_entity() {
        let channel = InvalidationChannel::disabled("pod-self".to_string());
        let reloader = RecordingReloader::default();

        let outcome = channel.dispatch(&message("acme", "pod-other"), &reloader).await;

        assert_eq!(outcome, Dispatch::Reloaded);
        assert_eq!(*reloader.reloaded.lock().unwrap(), vec!["acme".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_and_failing_reload_are_contained() {
        let channel = InvalidationChannel::disabled("pod-self".to_string());

        let outcome = channel.dispatch(b"{not json", &FailingReloader).await;
        assert_eq!(outcome, Dispatch::Malformed);

        let outcome = channel.dispatch(&message("acme", "pod-other"), &FailingReloader).await;
        assert_eq!(outcome, Dispatch::ReloadFailed);
    }

    #[tokio::test]
    async fn test_disabled_channel_is_noop() {
        let channel = InvalidationChannel::connect(&InvalidationConfig {
            url: None,
            subject: default_subject(),
            origin_id: Some("pod-test".to_string()),
        })
        .await;

        assert!(!channel.is_enabled());
        assert_eq!(channel.origin_id(), "pod-test");
        channel.publish("acme", PolicyOperation::Add).await.unwrap();
        let handle = channel
            .subscribe(Arc::new(RecordingReloader::default()))
            .await
            .unwrap();
        assert!(handle.is_none());
    }
}
