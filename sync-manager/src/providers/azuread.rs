//! Azure AD (Microsoft Entra ID) provider over Microsoft Graph.
//!
//! `host` is the tenant id, `user` the application (client) id and `password`
//! the client secret. Tokens come from the client-credentials grant.

use crate::providers::http::{build_client, send_json};
use crate::providers::require;
use crate::{Capabilities, Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::{dedup_groups, dedup_users, display_name_fallback, first_non_empty};
use dirsync::{CanonicalGroup, CanonicalUser, SyncError, SyncResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GraphPage<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureUser {
    pub id: String,
    #[serde(default)]
    pub user_principal_name: String,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub mail: Option<String>,
    pub mobile_phone: Option<String>,
    #[serde(default)]
    pub business_phones: Vec<String>,
    pub job_title: Option<String>,
    pub office_location: Option<String>,
    pub preferred_language: Option<String>,
    pub department: Option<String>,
    pub account_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureGroup {
    #[serde(default)]
    pub id: String,
    pub display_name: Option<String>,
    pub mail_nickname: Option<String>,
    pub description: Option<String>,
    pub mail: Option<String>,
    #[serde(default)]
    pub group_types: Vec<String>,
    #[serde(rename = "@odata.type")]
    pub odata_type: Option<String>,
}

impl AzureGroup {
    /// Local group name: display name, else mail nickname, else id.
    pub fn local_name(&self) -> String {
        first_non_empty(&[
            self.display_name.as_deref().unwrap_or_default(),
            self.mail_nickname.as_deref().unwrap_or_default(),
            self.id.as_str(),
        ])
        .to_string()
    }
}

pub struct AzureAdProvider {
    source: SourceConfig,
    http_client: Client,
    login_base_url: String,
    graph_base_url: String,
    access_token: Option<String>,
}

impl AzureAdProvider {
    pub fn new(source: SourceConfig, timeout: Duration) -> SyncResult<Self> {
        Self::with_base_urls(
            source,
            timeout,
            LOGIN_BASE_URL.to_string(),
            GRAPH_BASE_URL.to_string(),
        )
    }

    /// Create a provider with custom login and Graph base URLs (for testing).
    pub fn with_base_urls(
        source: SourceConfig,
        timeout: Duration,
        login_base_url: String,
        graph_base_url: String,
    ) -> SyncResult<Self> {
        Ok(Self {
            source,
            http_client: build_client(timeout)?,
            login_base_url,
            graph_base_url,
            access_token: None,
        })
    }

    async fn fetch_token(&self) -> SyncResult<String> {
        let tenant = require(&self.source.host, "tenant id (host)")?;
        let client_id = require(&self.source.user, "client id (user)")?;
        let client_secret = require(&self.source.password, "client secret (password)")?;

        let url = format!("{}/{}/oauth2/v2.0/token", self.login_base_url, tenant);
        let request = self.http_client.post(&url).form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("scope", GRAPH_SCOPE),
        ]);
        let token: TokenResponse = send_json("Azure AD", request).await?;
        if token.access_token.is_empty() {
            return Err(SyncError::configuration("Azure AD returned an empty access token"));
        }
        Ok(token.access_token)
    }

    async fn token(&self) -> SyncResult<String> {
        match &self.access_token {
            Some(token) => Ok(token.clone()),
            None => self.fetch_token().await,
        }
    }

    /// Follows `@odata.nextLink` from `path` until the last page.
    async fn fetch_all<T: DeserializeOwned>(&self, path: &str) -> SyncResult<Vec<T>> {
        let token = self.token().await?;
        let mut next = Some(format!("{}{}", self.graph_base_url, path));
        let mut items = Vec::new();

        while let Some(url) = next.take() {
            let page: GraphPage<T> =
                send_json("Azure AD", self.http_client.get(&url).bearer_auth(&token)).await?;
            debug!(url = %url, returned = page.value.len(), "Graph page");
            if page.value.is_empty() {
                break;
            }
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }
}

/// Transform a Graph user into a canonical user.
pub fn azure_user_to_canonical(azure: &AzureUser) -> CanonicalUser {
    let given = azure.given_name.as_deref().unwrap_or_default();
    let surname = azure.surname.as_deref().unwrap_or_default();
    let mut user = CanonicalUser {
        id: azure.id.clone(),
        name: azure.user_principal_name.clone(),
        display_name: display_name_fallback(
            azure.display_name.as_deref().unwrap_or_default(),
            "",
            given,
            surname,
            &azure.user_principal_name,
        ),
        first_name: given.to_string(),
        last_name: surname.to_string(),
        email: first_non_empty(&[
            azure.mail.as_deref().unwrap_or_default(),
            azure.user_principal_name.as_str(),
        ])
        .to_string(),
        phone: first_non_empty(&[
            azure.mobile_phone.as_deref().unwrap_or_default(),
            azure.business_phones.first().map(String::as_str).unwrap_or_default(),
        ])
        .to_string(),
        title: azure.job_title.clone().unwrap_or_default(),
        location: azure.office_location.clone().unwrap_or_default(),
        language: azure.preferred_language.clone().unwrap_or_default(),
        is_forbidden: azure.account_enabled == Some(false),
        ..Default::default()
    };
    if let Some(department) = azure.department.as_deref().filter(|d| !d.is_empty()) {
        user.properties.insert("department".to_string(), department.to_string());
    }
    user
}

/// Transform a Graph group into a canonical group.
pub fn azure_group_to_canonical(group: &AzureGroup) -> CanonicalGroup {
    let group_type = if group.group_types.iter().any(|t| t == "Unified") {
        "Unified"
    } else {
        "Security"
    };
    CanonicalGroup {
        id: group.id.clone(),
        name: group.local_name(),
        display_name: group.display_name.clone().unwrap_or_default(),
        description: group.description.clone().unwrap_or_default(),
        group_type: group_type.to_string(),
        email: group.mail.clone().unwrap_or_default(),
        is_top_group: true,
        ..Default::default()
    }
}

#[async_trait]
impl Provider for AzureAdProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureAd
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
        let azure_users: Vec<AzureUser> = self.fetch_all("/v1.0/users?$top=999").await?;
        let users = dedup_users(azure_users.iter().map(azure_user_to_canonical).collect());
        info!(source = %self.source.id(), fetched = users.len(), "Azure AD users fetched");
        Ok(users)
    }

    async fn get_original_groups(&self) -> SyncResult<Vec<CanonicalGroup>> {
        let groups: Vec<AzureGroup> = self.fetch_all("/v1.0/groups?$top=999").await?;
        Ok(dedup_groups(groups.iter().map(azure_group_to_canonical).collect()))
    }

    async fn get_original_user_groups(&self, user_id: &str) -> SyncResult<Vec<String>> {
        let path = format!("/v1.0/users/{}/memberOf", urlencoding::encode(user_id));
        let memberships: Vec<AzureGroup> = self.fetch_all(&path).await?;
        Ok(memberships
            .iter()
            .filter(|m| m.odata_type.as_deref().map_or(true, |t| t == "#microsoft.graph.group"))
            .map(AzureGroup::local_name)
            .collect())
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let token = self.token().await?;
        let url = format!("{}/v1.0/users?$top=1", self.graph_base_url);
        let request = self.http_client.get(&url).bearer_auth(&token);
        send_json::<GraphPage<AzureUser>>("Azure AD", request)
            .await
            .map(|_| ())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.access_token = None;
        Ok(())
    }
}
