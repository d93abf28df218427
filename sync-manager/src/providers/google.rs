//! Google Workspace provider over the Admin SDK Directory API.
//!
//! `password` holds the service-account JSON key and `host` the admin email
//! the service account impersonates (domain-wide delegation).

use crate::providers::http::{build_client, send_json};
use crate::providers::require;
use crate::{Capabilities, Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use chrono::Utc;
use dirsync::model::{dedup_groups, dedup_users, display_name_fallback};
use dirsync::{CanonicalGroup, CanonicalUser, SyncError, SyncResult};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const DIRECTORY_BASE_URL: &str = "https://admin.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPES: &str = "https://www.googleapis.com/auth/admin.directory.user.readonly \
                      https://www.googleapis.com/auth/admin.directory.group.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// The fields of a service-account key file this provider needs.
#[derive(Debug, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleName {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleUser {
    pub id: String,
    #[serde(default)]
    pub primary_email: String,
    #[serde(default)]
    pub name: GoogleName,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub thumbnail_photo_url: String,
    #[serde(default)]
    pub creation_time: String,
    #[serde(default)]
    pub org_unit_path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct GoogleGroup {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsersPage {
    #[serde(default)]
    users: Vec<GoogleUser>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupsPage {
    #[serde(default)]
    groups: Vec<GoogleGroup>,
    next_page_token: Option<String>,
}

trait Paged {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Paged for UsersPage {
    type Item = GoogleUser;
    fn into_parts(self) -> (Vec<GoogleUser>, Option<String>) {
        (self.users, self.next_page_token)
    }
}

impl Paged for GroupsPage {
    type Item = GoogleGroup;
    fn into_parts(self) -> (Vec<GoogleGroup>, Option<String>) {
        (self.groups, self.next_page_token)
    }
}

pub struct GoogleWorkspaceProvider {
    source: SourceConfig,
    http_client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl GoogleWorkspaceProvider {
    pub fn new(source: SourceConfig, timeout: Duration) -> SyncResult<Self> {
        Self::with_base_url(source, timeout, DIRECTORY_BASE_URL.to_string())
    }

    /// Create a provider against a custom Directory API base URL (for testing).
    pub fn with_base_url(
        source: SourceConfig,
        timeout: Duration,
        base_url: String,
    ) -> SyncResult<Self> {
        Ok(Self {
            source,
            http_client: build_client(timeout)?,
            base_url,
            access_token: None,
        })
    }

    fn service_account(&self) -> SyncResult<ServiceAccountKey> {
        let raw = require(&self.source.password, "service account key (password)")?;
        serde_json::from_str(raw)
            .map_err(|e| {
                SyncError::configuration(format!("service account key is not valid JSON: {}", e))
            })
    }

    /// Signs the RS256 assertion for the JWT bearer grant.
    pub fn signed_assertion(&self, key: &ServiceAccountKey) -> SyncResult<String> {
        let subject = require(&self.source.host, "admin email (host)")?;
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &key.client_email,
            sub: subject,
            scope: SCOPES,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| {
                SyncError::configuration(format!("service account private key is invalid: {}", e))
            })?;
        encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| {
                SyncError::configuration(format!(
                    "failed to sign service account assertion: {}",
                    e
                ))
            })
    }

    async fn fetch_token(&self) -> SyncResult<String> {
        let key = self.service_account()?;
        let assertion = self.signed_assertion(&key)?;
        let request = self
            .http_client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())]);
        let token: TokenResponse = send_json("Google Workspace", request).await?;
        Ok(token.access_token)
    }

    async fn token(&self) -> SyncResult<String> {
        match &self.access_token {
            Some(token) => Ok(token.clone()),
            None => self.fetch_token().await,
        }
    }

    /// Follows `nextPageToken` from `path` (which already carries a query).
    async fn fetch_all<P>(&self, path: &str) -> SyncResult<Vec<P::Item>>
    where
        P: Paged + DeserializeOwned,
    {
        let token = self.token().await?;
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!("{}{}", self.base_url, path);
            if let Some(t) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(t)));
            }
            let request = self.http_client.get(&url).bearer_auth(&token);
            let page: P = send_json("Google Workspace", request).await?;
            let (batch, next) = page.into_parts();
            debug!(url = %url, returned = batch.len(), "Directory page");
            if batch.is_empty() {
                break;
            }
            items.extend(batch);
            match next.filter(|t| !t.is_empty()) {
                Some(t) => page_token = Some(t),
                None => break,
            }
        }
        Ok(items)
    }
}

/// Transform a Directory API user into a canonical user.
pub fn google_user_to_canonical(google: &GoogleUser) -> CanonicalUser {
    let mut user = CanonicalUser {
        id: google.id.clone(),
        name: google.primary_email.clone(),
        email: google.primary_email.clone(),
        display_name: display_name_fallback(
            "",
            &google.name.full_name,
            &google.name.given_name,
            &google.name.family_name,
            &google.primary_email,
        ),
        first_name: google.name.given_name.clone(),
        last_name: google.name.family_name.clone(),
        avatar: google.thumbnail_photo_url.clone(),
        created_time: google.creation_time.clone(),
        is_forbidden: google.suspended,
        is_admin: google.is_admin,
        ..Default::default()
    };
    if !google.org_unit_path.is_empty() {
        user.properties.insert("orgUnitPath".to_string(), google.org_unit_path.clone());
    }
    user
}

/// Groups are keyed locally by their email address.
pub fn google_group_to_canonical(group: &GoogleGroup) -> CanonicalGroup {
    CanonicalGroup {
        id: group.id.clone(),
        name: group.email.clone(),
        display_name: group.name.clone(),
        description: group.description.clone(),
        email: group.email.clone(),
        is_top_group: true,
        ..Default::default()
    }
}

#[async_trait]
impl Provider for GoogleWorkspaceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleWorkspace
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            groups: true,
            user_groups: true,
            ..Default::default()
        }
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        if self.access_token.is_none() {
            self.access_token = Some(self.fetch_token().await?);
        }
        Ok(())
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let google_users = self
            .fetch_all::<UsersPage>("/admin/directory/v1/users?customer=my_customer&maxResults=500")
            .await?;
        let users = dedup_users(google_users.iter().map(google_user_to_canonical).collect());
        info!(source = %self.source.id(), fetched = users.len(), "Google Workspace users fetched");
        Ok(users)
    }

    async fn get_original_groups(&self) -> SyncResult<Vec<CanonicalGroup>> {
        let groups = self
            .fetch_all::<GroupsPage>("/admin/directory/v1/groups?customer=my_customer&maxResults=500")
            .await?;
        Ok(dedup_groups(groups.iter().map(google_group_to_canonical).collect()))
    }

    async fn get_original_user_groups(&self, user_id: &str) -> SyncResult<Vec<String>> {
        let path = format!("/admin/directory/v1/groups?userKey={}", urlencoding::encode(user_id));
        let groups = self.fetch_all::<GroupsPage>(&path).await?;
        Ok(groups.into_iter().map(|g| g.email).collect())
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let token = self.token().await?;
        let url = format!(
            "{}/admin/directory/v1/users?customer=my_customer&maxResults=1",
            self.base_url
        );
        send_json::<UsersPage>("Google Workspace", self.http_client.get(&url).bearer_auth(&token))
            .await
            .map(|_| ())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.access_token = None;
        Ok(())
    }
}
