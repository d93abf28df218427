//! DingTalk provider. `user` is the app key and `password` the app secret.
//!
//! Departments become groups; users are listed per department and then
//! enriched through `topapi/v2/user/get`.

use crate::providers::http::{build_client, send_json};
use crate::providers::{check_vendor_code, require};
use crate::{Capabilities, Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::{dedup_groups, dedup_users, first_non_empty};
use dirsync::{CanonicalGroup, CanonicalUser, SyncResult};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info};

const BASE_URL: &str = "https://oapi.dingtalk.com";
const ROOT_DEPARTMENT: i64 = 1;
const PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    access_token: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DingTalkDepartment {
    pub dept_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_id: i64,
}

#[derive(Debug, Deserialize)]
struct SimpleUser {
    userid: String,
}

#[derive(Debug, Deserialize)]
struct SimpleUserPage {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: i64,
    #[serde(default)]
    list: Vec<SimpleUser>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DingTalkUser {
    pub userid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub mobile: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub job_number: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub dept_id_list: Vec<i64>,
    #[serde(default)]
    pub admin: bool,
}

pub struct DingTalkProvider {
    source: SourceConfig,
    http_client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl DingTalkProvider {
    pub fn new(source: SourceConfig, timeout: Duration) -> SyncResult<Self> {
        Self::with_base_url(source, timeout, BASE_URL.to_string())
    }

    /// Create a provider against a custom API base URL (for testing).
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

    async fn fetch_token(&self) -> SyncResult<String> {
        let app_key = require(&self.source.user, "app key (user)")?;
        let app_secret = require(&self.source.password, "app secret (password)")?;
        let url = format!(
            "{}/gettoken?appkey={}&appsecret={}",
            self.base_url,
            urlencoding::encode(app_key),
            urlencoding::encode(app_secret)
        );
        let token: TokenResponse = send_json("DingTalk", self.http_client.get(&url)).await?;
        check_vendor_code("DingTalk", "gettoken", token.errcode, &token.errmsg)?;
        Ok(token.access_token)
    }

    async fn token(&self) -> SyncResult<String> {
        match &self.access_token {
            Some(token) => Ok(token.clone()),
            None => self.fetch_token().await,
        }
    }

    /// POSTs a `topapi` call and unwraps the `result` envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        body: serde_json::Value,
    ) -> SyncResult<Option<T>> {
        let url = format!("{}/{}?access_token={}", self.base_url, path, urlencoding::encode(token));
        let envelope: Envelope<T> =
            send_json("DingTalk", self.http_client.post(&url).json(&body)).await?;
        check_vendor_code("DingTalk", path, envelope.errcode, &envelope.errmsg)?;
        Ok(envelope.result)
    }

    /// Walks the department tree breadth-first from the root department.
    async fn fetch_departments(&self, token: &str) -> SyncResult<Vec<DingTalkDepartment>> {
        let root: DingTalkDepartment = self
            .call(
                token,
                "topapi/v2/department/get",
                serde_json::json!({ "dept_id": ROOT_DEPARTMENT }),
            )
            .await?
            .unwrap_or(DingTalkDepartment {
                dept_id: ROOT_DEPARTMENT,
                ..Default::default()
            });

        let mut departments = vec![root];
        let mut queue = VecDeque::from([ROOT_DEPARTMENT]);
        let mut seen = HashSet::from([ROOT_DEPARTMENT]);

        while let Some(parent) = queue.pop_front() {
            let children: Vec<DingTalkDepartment> = self
                .call(
                    token,
                    "topapi/v2/department/listsub",
                    serde_json::json!({ "dept_id": parent }),
                )
                .await?
                .unwrap_or_default();
            for child in children {
                if seen.insert(child.dept_id) {
                    queue.push_back(child.dept_id);
                    departments.push(child);
                }
            }
        }
        Ok(departments)
    }

    async fn fetch_department_user_ids(
        &self,
        token: &str,
        dept_id: i64,
    ) -> SyncResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut cursor = 0;
        loop {
            let page: Option<SimpleUserPage> = self
                .call(
                    token,
                    "topapi/user/listsimple",
                    serde_json::json!({ "dept_id": dept_id, "cursor": cursor, "size": PAGE_SIZE }),
                )
                .await?;
            let Some(page) = page else { break };
            debug!(dept_id, returned = page.list.len(), "DingTalk page");
            if page.list.is_empty() {
                break;
            }
            ids.extend(page.list.into_iter().map(|u| u.userid));
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }
        Ok(ids)
    }
}

/// Department names keyed by id; the root takes the organization name when unnamed.
fn department_names(
    departments: &[DingTalkDepartment],
    fallback_root: &str,
) -> HashMap<i64, String> {
    departments
        .iter()
        .map(|d| {
            let name = if d.name.is_empty() && d.dept_id == ROOT_DEPARTMENT {
                fallback_root.to_string()
            } else {
                d.name.clone()
            };
            (d.dept_id, name)
        })
        .collect()
}

/// Transform a DingTalk user into a canonical user. `Name` is the job number,
/// falling back to the user id.
pub fn dingtalk_user_to_canonical(
    dt: &DingTalkUser,
    departments: &HashMap<i64, String>,
) -> CanonicalUser {
    CanonicalUser {
        id: dt.userid.clone(),
        name: first_non_empty(&[dt.job_number.as_str(), dt.userid.as_str()]).to_string(),
        display_name: first_non_empty(&[dt.name.as_str(), dt.userid.as_str()]).to_string(),
        email: dt.email.clone(),
        phone: dt.mobile.clone(),
        avatar: dt.avatar.clone(),
        title: dt.title.clone(),
        is_forbidden: !dt.active,
        is_admin: dt.admin,
        groups: dt
            .dept_id_list
            .iter()
            .filter_map(|id| departments.get(id).cloned())
            .filter(|name| !name.is_empty())
            .collect(),
        ..Default::default()
    }
}

#[async_trait]
impl Provider for DingTalkProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DingTalk
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            groups: true,
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
        let names = department_names(&departments, &self.source.organization);

        let mut seen = HashSet::new();
        let mut fetched = Vec::new();
        for department in &departments {
            for user_id in self.fetch_department_user_ids(&token, department.dept_id).await? {
                if !seen.insert(user_id.clone()) {
                    continue;
                }
                let detail: Option<DingTalkUser> = self
                    .call(&token, "topapi/v2/user/get", serde_json::json!({ "userid": user_id }))
                    .await?;
                if let Some(detail) = detail {
                    fetched.push(dingtalk_user_to_canonical(&detail, &names));
                }
            }
        }

        let users = dedup_users(fetched);
        info!(
            source = %self.source.id(),
            departments = departments.len(),
            fetched = users.len(),
            "DingTalk users fetched"
        );
        Ok(users)
    }

    async fn get_original_groups(&self) -> SyncResult<Vec<CanonicalGroup>> {
        let token = self.token().await?;
        let departments = self.fetch_departments(&token).await?;
        let names = department_names(&departments, &self.source.organization);

        let groups = departments
            .iter()
            .map(|d| CanonicalGroup {
                id: d.dept_id.to_string(),
                name: names.get(&d.dept_id).cloned().unwrap_or_default(),
                display_name: names.get(&d.dept_id).cloned().unwrap_or_default(),
                group_type: "Physical".to_string(),
                parent_id: names.get(&d.parent_id).cloned().unwrap_or_default(),
                is_top_group: d.dept_id == ROOT_DEPARTMENT,
                ..Default::default()
            })
            .collect();
        Ok(dedup_groups(groups))
    }

    async fn test_connection(&self) -> SyncResult<()> {
        self.fetch_token().await.map(|_| ())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.access_token = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn source() -> SourceConfig {
        SourceConfig {
            owner: "admin".to_string(),
            name: "dingtalk".to_string(),
            organization: "acme".to_string(),
            provider_type: "DingTalk".to_string(),
            user: "app-key".to_string(),
            password: "app-secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_mapping() {
        let names = HashMap::new();
        let mut dt = DingTalkUser {
            userid: "u1".to_string(),
            active: false,
            ..Default::default()
        };
        assert!(dingtalk_user_to_canonical(&dt, &names).is_forbidden);
        dt.active = true;
        assert!(!dingtalk_user_to_canonical(&dt, &names).is_forbidden);
    }

    #[test]
    fn test_name_prefers_job_number() {
        let names = HashMap::from([(1, "acme".to_string()), (2, "Sales".to_string())]);
        let dt = DingTalkUser {
            userid: "u1".to_string(),
            name: "Li Lei".to_string(),
            job_number: "E1001".to_string(),
            dept_id_list: vec![2, 99],
            active: true,
            ..Default::default()
        };
        let user = dingtalk_user_to_canonical(&dt, &names);
        assert_eq!(user.name, "E1001");
        assert_eq!(user.display_name, "Li Lei");
        assert_eq!(user.groups.iter().cloned().collect::<Vec<_>>(), vec!["Sales".to_string()]);

        let dt = DingTalkUser {
            userid: "u2".to_string(),
            ..Default::default()
        };
        assert_eq!(dingtalk_user_to_canonical(&dt, &names).name, "u2");
    }

    #[tokio::test]
    async fn test_departments_and_users() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("GET", "/gettoken?appkey=app-key&appsecret=app-secret")
            .with_status(200)
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"dt-token","expires_in":7200}"#)
            .create_async()
            .await;
        let _root = server
            .mock("POST", "/topapi/v2/department/get?access_token=dt-token")
            .with_status(200)
            .with_body(r#"{"errcode":0,"result":{"dept_id":1,"name":"Acme"}}"#)
            .create_async()
            .await;
        let _sub_root = server
            .mock("POST", "/topapi/v2/department/listsub?access_token=dt-token")
            .match_body(Matcher::PartialJson(serde_json::json!({"dept_id": 1})))
            .with_status(200)
            .with_body(r#"{"errcode":0,"result":[{"dept_id":2,"name":"Sales","parent_id":1}]}"#)
            .create_async()
            .await;
        let _sub_sales = server
            .mock("POST", "/topapi/v2/department/listsub?access_token=dt-token")
            .match_body(Matcher::PartialJson(serde_json::json!({"dept_id": 2})))
            .with_status(200)
            .with_body(r#"{"errcode":0,"result":[]}"#)
            .create_async()
            .await;
        let _list_root = server
            .mock("POST", "/topapi/user/listsimple?access_token=dt-token")
            .match_body(Matcher::PartialJson(serde_json::json!({"dept_id": 1})))
            .with_status(200)
            .with_body(r#"{"errcode":0,"result":{"has_more":false,"list":[{"userid":"u1"}]}}"#)
            .create_async()
            .await;
        let _list_sales = server
            .mock("POST", "/topapi/user/listsimple?access_token=dt-token")
            .match_body(Matcher::PartialJson(serde_json::json!({"dept_id": 2})))
            .with_status(200)
            .with_body(r#"{"errcode":0,"result":{"has_more":false,"list":[{"userid":"u1"},{"userid":"u2"}]}}"#)
            .create_async()
            .await;
        let _detail_u1 = server
            .mock("POST", "/topapi/v2/user/get?access_token=dt-token")
            .match_body(Matcher::PartialJson(serde_json::json!({"userid": "u1"})))
            .with_status(200)
            .with_body(r#"{"errcode":0,"result":{"userid":"u1","name":"Han","active":true,"dept_id_list":[1,2]}}"#)
            .create_async()
            .await;
        let _detail_u2 = server
            .mock("POST", "/topapi/v2/user/get?access_token=dt-token")
            .match_body(Matcher::PartialJson(serde_json::json!({"userid": "u2"})))
            .with_status(200)
            .with_body(r#"{"errcode":0,"result":{"userid":"u2","name":"Mei","active":false,"dept_id_list":[2]}}"#)
            .create_async()
            .await;

        let mut provider =
            DingTalkProvider::with_base_url(source(), Duration::from_secs(5), server.url())
                .unwrap();
        provider.init_adapter().await.unwrap();

        let users = provider.get_original_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert!(users[0].groups.contains("Sales"));
        assert!(users[1].is_forbidden);

        let groups = provider.get_original_groups().await.unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups[0].is_top_group);
        assert_eq!(groups[1].parent_id, "Acme");
    }

    #[tokio::test]
    async fn test_bad_secret_is_configuration_error() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("GET", "/gettoken?appkey=app-key&appsecret=app-secret")
            .with_status(200)
            .with_body(r#"{"errcode":40089,"errmsg":"invalid appkey or appsecret"}"#)
            .create_async()
            .await;

        let mut provider =
            DingTalkProvider::with_base_url(source(), Duration::from_secs(5), server.url())
                .unwrap();
        assert!(provider.init_adapter().await.unwrap_err().is_configuration());
    }
}
