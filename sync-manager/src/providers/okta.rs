//! Okta provider: `GET /api/v1/users` with SSWS token auth and `Link` paging.

use crate::providers::http::{build_client, check_response, classify};
use crate::providers::{bare_host, require};
use crate::{Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::{dedup_users, display_name_fallback, first_non_empty};
use dirsync::{CanonicalUser, SyncError, SyncResult, UserField};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const PAGE_LIMIT: u32 = 200;

/// Statuses that still allow sign-in.
const ACTIVE_STATUSES: [&str; 4] = ["ACTIVE", "PROVISIONED", "RECOVERY", "PASSWORD_EXPIRED"];

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OktaProfile {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub mobile_phone: String,
    #[serde(default)]
    pub primary_phone: String,
    #[serde(default)]
    pub street_address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub preferred_language: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub organization: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OktaUser {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub profile: OktaProfile,
}

pub struct OktaProvider {
    source: SourceConfig,
    http_client: Client,
    base_url: Option<String>,
}

impl OktaProvider {
    pub fn new(source: SourceConfig, timeout: Duration) -> SyncResult<Self> {
        Ok(Self {
            source,
            http_client: build_client(timeout)?,
            base_url: None,
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

    fn first_page_url(&self) -> SyncResult<String> {
        let base = match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let host = require(&self.source.host, "Okta domain (host)")?;
                format!("https://{}", bare_host(host))
            }
        };
        Ok(format!("{}/api/v1/users?limit={}", base, PAGE_LIMIT))
    }

    async fn fetch_page(&self, url: &str) -> SyncResult<(Vec<OktaUser>, Option<String>)> {
        let token = require(&self.source.password, "Okta API token (password)")?;
        let response = self
            .http_client
            .get(url)
            .header("Authorization", format!("SSWS {}", token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| classify("Okta", e))?;
        let response = check_response("Okta", response).await?;

        let next = response
            .headers()
            .get_all("link")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(next_link);

        let body = response.text().await.map_err(|e| classify("Okta", e))?;
        let users = serde_json::from_str(&body)
            .map_err(|e| SyncError::schema(format!("Okta returned an unexpected payload: {}", e)))?;
        Ok((users, next))
    }
}

/// Extracts the `rel="next"` target from a `Link` header value.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.trim().split_once(';')?;
        params
            .split(';')
            .any(|p| p.trim() == r#"rel="next""#)
            .then(|| target.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    })
}

/// Transform an Okta user into a canonical user.
pub fn okta_user_to_canonical(okta: &OktaUser) -> CanonicalUser {
    let profile = &okta.profile;
    let mut user = CanonicalUser {
        id: okta.id.clone(),
        name: profile.login.clone(),
        display_name: display_name_fallback(
            &profile.display_name,
            "",
            &profile.first_name,
            &profile.last_name,
            &profile.login,
        ),
        first_name: profile.first_name.clone(),
        last_name: profile.last_name.clone(),
        email: first_non_empty(&[profile.email.as_str(), profile.login.as_str()]).to_string(),
        phone: first_non_empty(&[profile.mobile_phone.as_str(), profile.primary_phone.as_str()])
            .to_string(),
        title: profile.title.clone(),
        language: profile.preferred_language.clone(),
        region: profile.country_code.clone(),
        created_time: okta.created.clone(),
        updated_time: okta.last_updated.clone(),
        is_forbidden: !ACTIVE_STATUSES.contains(&okta.status.as_str()),
        ..Default::default()
    };

    user.address = [&profile.street_address, &profile.city, &profile.state, &profile.zip_code]
        .into_iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect();

    for (key, value) in [
        ("department", &profile.department),
        ("organization", &profile.organization),
        ("timezone", &profile.timezone),
    ] {
        if !value.is_empty() {
            user.properties.insert(key.to_string(), value.clone());
        }
    }
    user
}

#[async_trait]
impl Provider for OktaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Okta
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        self.first_page_url()?;
        require(&self.source.password, "Okta API token (password)")?;
        Ok(())
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let mut next = Some(self.first_page_url()?);
        let mut fetched = Vec::new();

        while let Some(url) = next.take() {
            let (page, following) = self.fetch_page(&url).await?;
            debug!(returned = page.len(), "Okta page");
            if page.is_empty() {
                break;
            }
            fetched.extend(page.iter().map(okta_user_to_canonical));
            next = following;
        }

        let users = dedup_users(fetched);
        info!(source = %self.source.id(), fetched = users.len(), "Okta users fetched");
        Ok(users)
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let url = self.first_page_url()?.replace(&format!("limit={}", PAGE_LIMIT), "limit=1");
        self.fetch_page(&url).await.map(|_| ())
    }

    fn update_time_field(&self) -> Option<UserField> {
        Some(UserField::UpdatedTime)
    }
}
