//! Lark (Feishu) provider. `user` is the app id, `password` the app secret
//! and `host` an optional API domain.

use crate::providers::http::{build_client, send_json};
use crate::providers::{check_vendor_code, require};
use crate::{Capabilities, Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::{dedup_groups, dedup_users, first_non_empty};
use dirsync::{CanonicalGroup, CanonicalUser, CompanyInfo, SyncResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_DOMAIN: &str = "https://open.larksuite.com";
const ROOT_DEPARTMENT: &str = "0";
const PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    has_more: bool,
    page_token: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LarkDepartment {
    #[serde(default)]
    pub department_id: String,
    #[serde(default)]
    pub open_department_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_department_id: String,
    #[serde(default)]
    pub leader_user_id: String,
}

impl LarkDepartment {
    fn key(&self) -> &str {
        first_non_empty(&[self.department_id.as_str(), self.open_department_id.as_str()])
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LarkAvatar {
    #[serde(default)]
    pub avatar_72: String,
    #[serde(default)]
    pub avatar_240: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LarkStatus {
    #[serde(default)]
    pub is_frozen: bool,
    #[serde(default)]
    pub is_resigned: bool,
    #[serde(default)]
    pub is_activated: bool,
    #[serde(default)]
    pub is_exited: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LarkUser {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub union_id: String,
    #[serde(default)]
    pub open_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub en_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub mobile: String,
    #[serde(default)]
    pub gender: i32,
    pub avatar: Option<LarkAvatar>,
    pub status: Option<LarkStatus>,
    #[serde(default)]
    pub department_ids: Vec<String>,
    #[serde(default)]
    pub job_title: String,
    #[serde(default)]
    pub city: String,
}

#[derive(Debug, Default, Deserialize)]
struct TenantQuery {
    tenant: Option<Tenant>,
}

#[derive(Debug, Default, Deserialize)]
struct Tenant {
    #[serde(default)]
    name: String,
    #[serde(default)]
    domain: String,
    avatar: Option<LarkAvatar>,
}

pub struct LarkProvider {
    source: SourceConfig,
    http_client: Client,
    domain: String,
    access_token: Option<String>,
}

impl LarkProvider {
    pub fn new(source: SourceConfig, timeout: Duration) -> SyncResult<Self> {
        let domain = match source.host.trim().trim_end_matches('/') {
            "" => DEFAULT_DOMAIN.to_string(),
            host if host.starts_with("http") => host.to_string(),
            host => format!("https://{}", host),
        };
        Ok(Self {
            source,
            http_client: build_client(timeout)?,
            domain,
            access_token: None,
        })
    }

    async fn fetch_token(&self) -> SyncResult<String> {
        let app_id = require(&self.source.user, "app id (user)")?;
        let app_secret = require(&self.source.password, "app secret (password)")?;
        let url = format!("{}/open-apis/auth/v3/tenant_access_token/internal", self.domain);
        let request = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({ "app_id": app_id, "app_secret": app_secret }));
        let token: TokenResponse = send_json("Lark", request).await?;
        check_vendor_code("Lark", "gettoken", token.code, &token.msg)?;
        Ok(token.tenant_access_token)
    }

    async fn token(&self) -> SyncResult<String> {
        match &self.access_token {
            Some(token) => Ok(token.clone()),
            None => self.fetch_token().await,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        token: &str,
        path_and_query: &str,
    ) -> SyncResult<Option<T>> {
        let url = format!("{}/open-apis/{}", self.domain, path_and_query);
        let envelope: Envelope<T> =
            send_json("Lark", self.http_client.get(&url).bearer_auth(token)).await?;
        let call = path_and_query.split('?').next().unwrap_or(path_and_query);
        check_vendor_code("Lark", call, envelope.code, &envelope.msg)?;
        Ok(envelope.data)
    }

    /// Collects every page of a `page_token`-paged listing.
    async fn get_all<T: DeserializeOwned>(
        &self,
        token: &str,
        path_and_query: &str,
    ) -> SyncResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = format!("{}&page_size={}", path_and_query, PAGE_SIZE);
            if let Some(t) = &page_token {
                query.push_str(&format!("&page_token={}", urlencoding::encode(t)));
            }
            let Some(page) = self.get::<Page<T>>(token, &query).await? else { break };
            debug!(call = %path_and_query, returned = page.items.len(), "Lark page");
            if page.items.is_empty() {
                break;
            }
            items.extend(page.items);
            match page.page_token.filter(|t| page.has_more && !t.is_empty()) {
                Some(t) => page_token = Some(t),
                None => break,
            }
        }
        Ok(items)
    }

    async fn fetch_departments(&self, token: &str) -> SyncResult<Vec<LarkDepartment>> {
        self.get_all(
            token,
            &format!("contact/v3/departments?parent_department_id={}&fetch_child=true", ROOT_DEPARTMENT),
        )
        .await
    }
}

/// Transform a Lark user into a canonical user. `Name` falls back from
/// `user_id` to `union_id` to `open_id`.
pub fn lark_user_to_canonical(
    lark: &LarkUser,
    departments: &HashMap<String, String>,
) -> CanonicalUser {
    let key =
        first_non_empty(&[lark.user_id.as_str(), lark.union_id.as_str(), lark.open_id.as_str()]);
    let avatar = lark
        .avatar
        .as_ref()
        .map(|a| first_non_empty(&[a.avatar_240.as_str(), a.avatar_72.as_str()]).to_string())
        .unwrap_or_default();
    let is_forbidden = lark
        .status
        .as_ref()
        .is_some_and(|s| s.is_frozen || s.is_resigned || !s.is_activated || s.is_exited);

    CanonicalUser {
        id: key.to_string(),
        name: key.to_string(),
        display_name: first_non_empty(&[lark.name.as_str(), lark.en_name.as_str(), key])
            .to_string(),
        email: lark.email.clone(),
        phone: lark.mobile.clone(),
        title: lark.job_title.clone(),
        location: lark.city.clone(),
        avatar,
        gender: gender_name(lark.gender),
        is_forbidden,
        groups: lark
            .department_ids
            .iter()
            .filter_map(|id| departments.get(id).cloned())
            .collect(),
        ..Default::default()
    }
}

fn gender_name(code: i32) -> String {
    match code {
        1 => "Male".to_string(),
        2 => "Female".to_string(),
        _ => String::new(),
    }
}

#[async_trait]
impl Provider for LarkProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Lark
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            groups: true,
            company: true,
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
        let token = self.token().await?;
        let departments = self.fetch_departments(&token).await?;
        let names: HashMap<String, String> = departments
            .iter()
            .map(|d| (d.key().to_string(), d.name.clone()))
            .collect();

        let mut department_ids = vec![ROOT_DEPARTMENT.to_string()];
        department_ids.extend(departments.iter().map(|d| d.key().to_string()));

        let mut fetched = Vec::new();
        for department_id in &department_ids {
            let path = format!(
                "contact/v3/users/find_by_department?department_id={}",
                urlencoding::encode(department_id)
            );
            let lark_users: Vec<LarkUser> = self.get_all(&token, &path).await?;
            fetched.extend(lark_users.iter().map(|u| lark_user_to_canonical(u, &names)));
        }

        let users = dedup_users(fetched);
        info!(
            source = %self.source.id(),
            departments = department_ids.len(),
            fetched = users.len(),
            "Lark users fetched"
        );
        Ok(users)
    }

    async fn get_original_groups(&self) -> SyncResult<Vec<CanonicalGroup>> {
        let token = self.token().await?;
        let departments = self.fetch_departments(&token).await?;
        let names: HashMap<&str, &str> =
            departments.iter().map(|d| (d.key(), d.name.as_str())).collect();

        let groups = departments
            .iter()
            .map(|d| CanonicalGroup {
                id: d.key().to_string(),
                name: d.name.clone(),
                display_name: d.name.clone(),
                group_type: "Physical".to_string(),
                manager: d.leader_user_id.clone(),
                parent_id: names
                    .get(d.parent_department_id.as_str())
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
                is_top_group: d.parent_department_id.is_empty()
                    || d.parent_department_id == ROOT_DEPARTMENT,
                ..Default::default()
            })
            .collect();
        Ok(dedup_groups(groups))
    }

    async fn get_company_info(&self) -> SyncResult<CompanyInfo> {
        let token = self.token().await?;
        let query: TenantQuery =
            self.get(&token, "tenant/v2/tenant/query").await?.unwrap_or_default();
        let tenant = query.tenant.unwrap_or_default();
        Ok(CompanyInfo {
            name: tenant.name.clone(),
            display_name: tenant.name,
            logo: tenant
                .avatar
                .map(|a| {
                    first_non_empty(&[a.avatar_240.as_str(), a.avatar_72.as_str()]).to_string()
                })
                .unwrap_or_default(),
            website_url: if tenant.domain.is_empty() {
                String::new()
            } else {
                format!("https://{}", tenant.domain)
            },
        })
    }

    async fn test_connection(&self) -> SyncResult<()> {
        self.fetch_token().await.map(|_| ())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.access_token = None;
        Ok(())
    }
}
