use dirsync::SyncResult;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::providers::http::{classify, read_json};

pub const PAGE_SIZE: usize = 100;

/// SCIM 2.0 multi-valued attribute (emails, phoneNumbers, photos).
#[derive(Debug, Default, Deserialize)]
pub struct ScimValue {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScimName {
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub formatted: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScimAddress {
    #[serde(default)]
    pub formatted: String,
    #[serde(default)]
    pub street_address: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub primary: bool,
}

/// Enterprise User extension (RFC 7643 section 4.3).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterpriseExtension {
    #[serde(default)]
    pub employee_number: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub department: String,
}

/// SCIM 2.0 User resource.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScimUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub name: ScimName,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub nick_name: String,
    /// Absent means active
    pub active: Option<bool>,
    #[serde(default)]
    pub emails: Vec<ScimValue>,
    #[serde(default)]
    pub phone_numbers: Vec<ScimValue>,
    #[serde(default)]
    pub addresses: Vec<ScimAddress>,
    #[serde(default)]
    pub photos: Vec<ScimValue>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub preferred_language: String,
    #[serde(default)]
    pub locale: String,
    #[serde(rename = "urn:ietf:params:scim:schemas:extension:enterprise:2.0:User")]
    pub enterprise: Option<EnterpriseExtension>,
}

/// SCIM 2.0 ListResponse.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScimListResponse {
    #[serde(default)]
    pub total_results: usize,
    #[serde(rename = "Resources", default)]
    pub resources: Vec<ScimUser>,
}

/// HTTP client for a SCIM 2.0 service provider.
///
/// Uses Basic auth when both user and password are set, else a Bearer token.
pub struct ScimClient {
    http_client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl ScimClient {
    pub fn new(http_client: Client, base_url: &str, user: &str, password: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// Fetch one page of users starting at the 1-based `start_index`.
    pub async fn fetch_users_page(
        &self,
        start_index: usize,
        count: usize,
    ) -> SyncResult<ScimListResponse> {
        let url = format!("{}/Users?startIndex={}&count={}", self.base_url, start_index, count);
        let mut request = self
            .http_client
            .get(&url)
            .header("Accept", "application/scim+json")
            .header("Content-Type", "application/scim+json");

        if !self.user.is_empty() && !self.password.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        } else if !self.password.is_empty() {
            request = request.bearer_auth(&self.password);
        }

        let response = request.send().await.map_err(|e| classify("SCIM", e))?;
        read_json("SCIM", response).await
    }

    /// Fetch every user, stopping at `totalResults` or the first empty page.
    pub async fn fetch_all_users(&self) -> SyncResult<Vec<ScimUser>> {
        let mut users = Vec::new();
        let mut start_index = 1;

        loop {
            let page = self.fetch_users_page(start_index, PAGE_SIZE).await?;
            debug!(
                start_index,
                returned = page.resources.len(),
                total = page.total_results,
                "SCIM page"
            );

            if page.resources.is_empty() {
                break;
            }
            users.extend(page.resources);
            if users.len() >= page.total_results {
                break;
            }
            start_index += PAGE_SIZE;
        }

        Ok(users)
    }
}
