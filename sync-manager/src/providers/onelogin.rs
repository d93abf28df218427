//! OneLogin provider. `host` is the region code (`us`, `eu`) or a full API
//! domain, `user` the client id and `password` the client secret.

use crate::providers::http::{build_client, check_response, classify, send_json};
use crate::providers::{bare_host, require};
use crate::{Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::{dedup_users, display_name_fallback};
use dirsync::{CanonicalUser, SyncError, SyncResult};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_REGION: &str = "us";

#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    error: bool,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    access_token: String,
}

/// Token endpoint answer; older tenants wrap the token in `data`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    data: Vec<TokenData>,
    #[serde(default)]
    status: ApiStatus,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    after_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    status: ApiStatus,
    #[serde(default)]
    data: Vec<OneLoginUser>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
pub struct OneLoginUser {
    pub id: i64,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub title: String,
    /// 1 = active; 0 unactivated, 2 suspended, 3 locked, 4 password expired
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

pub struct OneLoginProvider {
    source: SourceConfig,
    http_client: Client,
    base_url: Option<String>,
    access_token: Option<String>,
}

impl OneLoginProvider {
    pub fn new(source: SourceConfig, timeout: Duration) -> SyncResult<Self> {
        Ok(Self {
            source,
            http_client: build_client(timeout)?,
            base_url: None,
            access_token: None,
        })
    }

    /// Create a provider against a custom API base URL (for testing).
    pub fn with_base_url(
        source: SourceConfig,
        timeout: Duration,
        base_url: String,
    ) -> SyncResult<Self> {
        Ok(Self {
            base_url: Some(base_url),
            ..Self::new(source, timeout)?
        })
    }

    /// `api.{region}.onelogin.com`, or the host itself when it is a domain.
    fn api_base(&self) -> String {
        if let Some(url) = &self.base_url {
            return url.trim_end_matches('/').to_string();
        }
        let region = match bare_host(&self.source.host) {
            "" => DEFAULT_REGION,
            region => region,
        };
        if region.contains('.') {
            format!("https://{}", region)
        } else {
            format!("https://api.{}.onelogin.com", region)
        }
    }

    async fn fetch_token(&self) -> SyncResult<String> {
        let client_id = require(&self.source.user, "client id (user)")?;
        let client_secret = require(&self.source.password, "client secret (password)")?;

        let url = format!("{}/auth/oauth2/v2/token", self.api_base());
        let request = self
            .http_client
            .post(&url)
            .basic_auth(client_id, Some(client_secret))
            .json(&serde_json::json!({ "grant_type": "client_credentials" }));
        let token: TokenResponse = send_json("OneLogin", request).await?;

        if token.status.error {
            return Err(SyncError::configuration(format!(
                "OneLogin token request failed: {} - {}",
                token.status.kind, token.status.message
            )));
        }
        token
            .access_token
            .or_else(|| token.data.into_iter().next().map(|d| d.access_token))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::configuration("OneLogin returned an empty access token"))
    }

    async fn token(&self) -> SyncResult<String> {
        match &self.access_token {
            Some(token) => Ok(token.clone()),
            None => self.fetch_token().await,
        }
    }

    async fn fetch_page(
        &self,
        token: &str,
        after_cursor: Option<&str>,
        limit: u32,
    ) -> SyncResult<(Vec<OneLoginUser>, Option<String>)> {
        let mut url = format!("{}/api/2/users?limit={}", self.api_base(), limit);
        if let Some(cursor) = after_cursor {
            url.push_str(&format!("&after_cursor={}", urlencoding::encode(cursor)));
        }

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| classify("OneLogin", e))?;
        let response = check_response("OneLogin", response).await?;
        let header_cursor = response
            .headers()
            .get("after-cursor")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| classify("OneLogin", e))?;

        // v2 tenants answer with a bare array and cursor headers
        if let Ok(users) = serde_json::from_str::<Vec<OneLoginUser>>(&body) {
            return Ok((users, header_cursor.filter(|c| !c.is_empty())));
        }
        let page: UsersResponse = serde_json::from_str(&body)
            .map_err(|e| {
                SyncError::schema(format!("OneLogin returned an unexpected payload: {}", e))
            })?;
        if page.status.error {
            return Err(SyncError::network(format!(
                "OneLogin users request failed: {} - {}",
                page.status.kind, page.status.message
            )));
        }
        let cursor = page.pagination.after_cursor.or(header_cursor).filter(|c| !c.is_empty());
        Ok((page.data, cursor))
    }
}

/// Transform a OneLogin user into a canonical user.
pub fn onelogin_user_to_canonical(onelogin: &OneLoginUser) -> CanonicalUser {
    let login = if onelogin.username.is_empty() { &onelogin.email } else { &onelogin.username };
    let mut user = CanonicalUser {
        id: onelogin.id.to_string(),
        name: login.clone(),
        display_name: display_name_fallback("", "", &onelogin.firstname, &onelogin.lastname, login),
        first_name: onelogin.firstname.clone(),
        last_name: onelogin.lastname.clone(),
        email: onelogin.email.clone(),
        phone: onelogin.phone.clone(),
        title: onelogin.title.clone(),
        created_time: onelogin.created_at.clone(),
        updated_time: onelogin.updated_at.clone(),
        is_forbidden: onelogin.status != 1,
        ..Default::default()
    };
    for (key, value) in [("company", &onelogin.company), ("department", &onelogin.department)] {
        if !value.is_empty() {
            user.properties.insert(key.to_string(), value.clone());
        }
    }
    user
}

#[async_trait]
impl Provider for OneLoginProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OneLogin
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        if self.access_token.is_none() {
            self.access_token = Some(self.fetch_token().await?);
        }
        Ok(())
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let token = self.token().await?;
        let mut fetched = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let (page, next) = self.fetch_page(&token, cursor.as_deref(), 100).await?;
            debug!(returned = page.len(), "OneLogin page");
            if page.is_empty() {
                break;
            }
            fetched.extend(page.iter().map(onelogin_user_to_canonical));
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let users = dedup_users(fetched);
        info!(source = %self.source.id(), fetched = users.len(), "OneLogin users fetched");
        Ok(users)
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let token = self.token().await?;
        self.fetch_page(&token, None, 1).await.map(|_| ())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.access_token = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn source(host: &str) -> SourceConfig {
        SourceConfig {
            owner: "admin".to_string(),
            name: "onelogin".to_string(),
            provider_type: "OneLogin".to_string(),
            host: host.to_string(),
            user: "client".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_mapping() {
        let cases = [(0, true), (1, false), (2, true), (3, true), (4, true), (5, true)];
        for (status, forbidden) in cases {
            let user = OneLoginUser {
                id: 7,
                status,
                ..Default::default()
            };
            assert_eq!(
                onelogin_user_to_canonical(&user).is_forbidden,
                forbidden,
                "status {}",
                status
            );
        }
    }

    #[test]
    fn test_api_base_from_region() {
        let timeout = Duration::from_secs(5);
        assert_eq!(
            OneLoginProvider::new(source(""), timeout).unwrap().api_base(),
            "https://api.us.onelogin.com"
        );
        assert_eq!(
            OneLoginProvider::new(source("eu"), timeout).unwrap().api_base(),
            "https://api.eu.onelogin.com"
        );
        assert_eq!(
            OneLoginProvider::new(source("acme.onelogin.com"), timeout).unwrap().api_base(),
            "https://acme.onelogin.com"
        );
    }

    #[tokio::test]
    async fn test_cursor_paging() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("POST", "/auth/oauth2/v2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ol-token","token_type":"bearer","expires_in":36000}"#)
            .create_async()
            .await;
        let _page1 = server
            .mock("GET", "/api/2/users?limit=100")
            .match_header("authorization", "Bearer ol-token")
            .with_status(200)
            .with_body(r#"{"status":{"error":false},"data":[{"id":1,"username":"amy","status":1}],"pagination":{"after_cursor":"c2"}}"#)
            .create_async()
            .await;
        let _page2 = server
            .mock("GET", "/api/2/users?limit=100&after_cursor=c2")
            .with_status(200)
            .with_body(r#"[{"id":2,"username":"ben","status":2}]"#)
            .create_async()
            .await;

        let mut provider =
            OneLoginProvider::with_base_url(source("us"), Duration::from_secs(5), server.url())
                .unwrap();
        provider.init_adapter().await.unwrap();
        let users = provider.get_original_users().await.unwrap();

        assert_eq!(users.len(), 2);
        assert_eq!(users[0].id, "1");
        assert!(users[1].is_forbidden);
    }
}
