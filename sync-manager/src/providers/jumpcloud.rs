use crate::providers::http::{build_client, send_json};
use crate::providers::{bare_host, require};
use crate::{Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::{dedup_users, display_name_fallback};
use dirsync::{CanonicalUser, SyncResult};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_HOST: &str = "console.jumpcloud.com";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct JumpCloudPhone {
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpCloudAddress {
    #[serde(default)]
    pub street_address: String,
    #[serde(default)]
    pub extended_address: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub country: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpCloudUser {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(rename = "displayname", default)]
    pub display_name: String,
    #[serde(rename = "middlename", default)]
    pub middle_name: String,
    #[serde(default)]
    pub job_title: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub activated: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub phone_numbers: Vec<JumpCloudPhone>,
    #[serde(default)]
    pub addresses: Vec<JumpCloudAddress>,
    #[serde(default)]
    pub created: String,
}

/// `{"totalCount": n, "results": [...]}` envelope of `/api/systemusers`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemUsersPage {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    results: Vec<JumpCloudUser>,
}

/// JumpCloud system users, authenticated with the `x-api-key` header.
pub struct JumpCloudProvider {
    source: SourceConfig,
    http_client: Client,
    base_url: Option<String>,
}

impl JumpCloudProvider {
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

    fn users_url(&self) -> String {
        match &self.base_url {
            Some(url) => format!("{}/api/systemusers", url.trim_end_matches('/')),
            None => {
                let host = match bare_host(&self.source.host) {
                    "" => DEFAULT_HOST,
                    host => host,
                };
                format!("https://{}/api/systemusers", host)
            }
        }
    }

    async fn fetch_page(&self, skip: usize, limit: usize) -> SyncResult<SystemUsersPage> {
        let api_key = require(&self.source.password, "API key (password)")?;
        let url = format!("{}?limit={}&skip={}", self.users_url(), limit, skip);
        let request = self
            .http_client
            .get(&url)
            .header("x-api-key", api_key)
            .header("Accept", "application/json");
        send_json("JumpCloud", request).await
    }
}

/// Transform a JumpCloud system user into a canonical user.
pub fn jumpcloud_user_to_canonical(jc: &JumpCloudUser) -> CanonicalUser {
    let mut user = CanonicalUser {
        id: jc.id.clone(),
        name: jc.username.clone(),
        display_name: display_name_fallback(
            &jc.display_name,
            "",
            &jc.firstname,
            &jc.lastname,
            &jc.username,
        ),
        first_name: jc.firstname.clone(),
        last_name: jc.lastname.clone(),
        email: jc.email.clone(),
        title: jc.job_title.clone(),
        location: jc.location.clone(),
        phone: jc.phone_numbers.first().map(|p| p.number.clone()).unwrap_or_default(),
        created_time: jc.created.clone(),
        is_forbidden: !jc.activated || jc.suspended,
        ..Default::default()
    };

    if let Some(address) = jc.addresses.first() {
        user.address = [
            &address.street_address,
            &address.extended_address,
            &address.locality,
            &address.region,
            &address.postal_code,
            &address.country,
        ]
        .into_iter()
        .filter(|s| !s.is_empty())
        .cloned()
        .collect();
    }

    for (key, value) in [
        ("department", &jc.department),
        ("company", &jc.company),
        ("middleName", &jc.middle_name),
    ] {
        if !value.is_empty() {
            user.properties.insert(key.to_string(), value.clone());
        }
    }
    user
}

#[async_trait]
impl Provider for JumpCloudProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::JumpCloud
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        require(&self.source.password, "API key (password)").map(|_| ())
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let mut fetched = Vec::new();
        let mut skip = 0;

        loop {
            let page = self.fetch_page(skip, PAGE_SIZE).await?;
            debug!(skip, returned = page.results.len(), total = page.total_count, "JumpCloud page");
            if page.results.is_empty() {
                break;
            }
            skip += page.results.len();
            fetched.extend(page.results.iter().map(jumpcloud_user_to_canonical));
            let exhausted = page.total_count > 0 && skip >= page.total_count;
            if page.results.len() < PAGE_SIZE || exhausted {
                break;
            }
        }

        let users = dedup_users(fetched);
        info!(source = %self.source.id(), fetched = users.len(), "JumpCloud users fetched");
        Ok(users)
    }

    async fn test_connection(&self) -> SyncResult<()> {
        self.fetch_page(0, 1).await.map(|_| ())
    }
}
