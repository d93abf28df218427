pub mod api;
pub mod transformer;

use crate::providers::{http::build_client, require};
use crate::{Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::dedup_users;
use dirsync::{CanonicalUser, SyncResult};
use std::time::Duration;
use tracing::info;

use self::api::ScimClient;
use self::transformer::scim_user_to_canonical;

/// SCIM 2.0 provider. `host` is the service provider base URL
/// (e.g. `https://idp.example.com/scim/v2`).
pub struct ScimProvider {
    source: SourceConfig,
    http_client: reqwest::Client,
}

impl ScimProvider {
    pub fn new(source: SourceConfig, timeout: Duration) -> SyncResult<Self> {
        Ok(Self {
            source,
            http_client: build_client(timeout)?,
        })
    }

    fn client(&self) -> SyncResult<ScimClient> {
        let base_url = require(&self.source.host, "SCIM endpoint URL (host)")?;
        Ok(ScimClient::new(
            self.http_client.clone(),
            base_url,
            &self.source.user,
            &self.source.password,
        ))
    }
}

#[async_trait]
impl Provider for ScimProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Scim
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        self.client().map(|_| ())
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let scim_users = self.client()?.fetch_all_users().await?;
        let users = dedup_users(scim_users.iter().map(scim_user_to_canonical).collect());
        info!(source = %self.source.id(), fetched = users.len(), "SCIM users fetched");
        Ok(users)
    }

    async fn test_connection(&self) -> SyncResult<()> {
        self.client()?.fetch_users_page(1, 1).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn source(host: &str) -> SourceConfig {
        SourceConfig {
            owner: "admin".to_string(),
            name: "scim".to_string(),
            provider_type: "SCIM".to_string(),
            host: host.to_string(),
            password: "token".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_users_are_deduplicated() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/Users?startIndex=1&count=100")
            .with_status(200)
            .with_body(
                r#"{"totalResults":3,"Resources":[
                    {"id":"1","userName":"alice","displayName":"Alice"},
                    {"id":"1","userName":"alice-dup","displayName":"Shadow"},
                    {"id":"","userName":"ghost"}
                ]}"#,
            )
            .create_async()
            .await;

        let mut provider =
            ScimProvider::new(source(&server.url()), Duration::from_secs(5)).unwrap();
        provider.init_adapter().await.unwrap();
        let users = provider.get_original_users().await.unwrap();

        assert_eq!(users.len(), 1);
        assert_eq!(users[0].display_name, "Alice");
    }

    #[tokio::test]
    async fn test_missing_host_is_configuration_error() {
        let mut provider = ScimProvider::new(source(""), Duration::from_secs(5)).unwrap();
        assert!(provider.init_adapter().await.unwrap_err().is_configuration());
        assert!(provider.test_connection().await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_writeback_is_unsupported() {
        let provider =
            ScimProvider::new(source("http://localhost"), Duration::from_secs(5)).unwrap();
        let err = provider.add_user(&CanonicalUser::default()).await.unwrap_err();
        assert_eq!(err.kind(), "unsupported");
        assert_eq!(err.to_string(), "SCIM does not support AddUser");
    }
}
