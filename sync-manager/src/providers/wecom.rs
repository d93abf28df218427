//! WeCom (WeChat Work) provider. `user` is the corp id, `password` the
//! corp secret.

use crate::providers::http::{build_client, send_json};
use crate::providers::{check_vendor_code, require};
use crate::{Capabilities, Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::{dedup_groups, dedup_users};
use dirsync::{CanonicalGroup, CanonicalUser, SyncResult};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const BASE_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin";

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
pub struct WeComDepartment {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "parentid", default)]
    pub parent_id: i64,
}

#[derive(Debug, Deserialize)]
struct DepartmentList {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    department: Vec<WeComDepartment>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WeComUser {
    pub userid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub department: Vec<i64>,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub mobile: String,
    /// "1" male, "2" female
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub avatar: String,
    /// 1 activated, 2 disabled, 4 not activated, 5 quit
    #[serde(default)]
    pub status: i32,
    pub enable: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(default)]
    userlist: Vec<WeComUser>,
}

pub struct WeComProvider {
    source: SourceConfig,
    http_client: Client,
    base_url: String,
    access_token: Option<String>,
}

impl WeComProvider {
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
        let corp_id = require(&self.source.user, "corp id (user)")?;
        let corp_secret = require(&self.source.password, "corp secret (password)")?;
        let url = format!(
            "{}/gettoken?corpid={}&corpsecret={}",
            self.base_url,
            urlencoding::encode(corp_id),
            urlencoding::encode(corp_secret)
        );
        let token: TokenResponse = send_json("WeCom", self.http_client.get(&url)).await?;
        check_vendor_code("WeCom", "gettoken", token.errcode, &token.errmsg)?;
        Ok(token.access_token)
    }

    async fn token(&self) -> SyncResult<String> {
        match &self.access_token {
            Some(token) => Ok(token.clone()),
            None => self.fetch_token().await,
        }
    }

    async fn fetch_departments(&self, token: &str) -> SyncResult<Vec<WeComDepartment>> {
        let url = format!(
            "{}/department/list?access_token={}",
            self.base_url,
            urlencoding::encode(token)
        );
        let list: DepartmentList = send_json("WeCom", self.http_client.get(&url)).await?;
        check_vendor_code("WeCom", "department/list", list.errcode, &list.errmsg)?;
        Ok(list.department)
    }

    async fn fetch_department_users(
        &self,
        token: &str,
        department_id: i64,
    ) -> SyncResult<Vec<WeComUser>> {
        let url = format!(
            "{}/user/list?access_token={}&department_id={}",
            self.base_url,
            urlencoding::encode(token),
            department_id
        );
        let list: UserList = send_json("WeCom", self.http_client.get(&url)).await?;
        check_vendor_code("WeCom", "user/list", list.errcode, &list.errmsg)?;
        debug!(department_id, returned = list.userlist.len(), "WeCom department users");
        Ok(list.userlist)
    }
}

/// Transform a WeCom member into a canonical user.
pub fn wecom_user_to_canonical(
    wecom: &WeComUser,
    departments: &HashMap<i64, String>,
) -> CanonicalUser {
    CanonicalUser {
        id: wecom.userid.clone(),
        name: wecom.userid.clone(),
        display_name: wecom.name.clone(),
        email: wecom.email.clone(),
        phone: wecom.mobile.clone(),
        avatar: wecom.avatar.clone(),
        title: wecom.position.clone(),
        gender: match wecom.gender.as_str() {
            "1" => "Male".to_string(),
            "2" => "Female".to_string(),
            _ => String::new(),
        },
        is_forbidden: matches!(wecom.status, 2 | 4 | 5) || wecom.enable == Some(0),
        groups: wecom
            .department
            .iter()
            .filter_map(|id| departments.get(id).cloned())
            .collect(),
        ..Default::default()
    }
}

#[async_trait]
impl Provider for WeComProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WeCom
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
        let names: HashMap<i64, String> =
            departments.iter().map(|d| (d.id, d.name.clone())).collect();

        let mut fetched = Vec::new();
        for department in &departments {
            let members = self.fetch_department_users(&token, department.id).await?;
            fetched.extend(members.iter().map(|m| wecom_user_to_canonical(m, &names)));
        }

        let users = dedup_users(fetched);
        info!(
            source = %self.source.id(),
            departments = departments.len(),
            fetched = users.len(),
            "WeCom users fetched"
        );
        Ok(users)
    }

    async fn get_original_groups(&self) -> SyncResult<Vec<CanonicalGroup>> {
        let token = self.token().await?;
        let departments = self.fetch_departments(&token).await?;
        let names: HashMap<i64, &str> =
            departments.iter().map(|d| (d.id, d.name.as_str())).collect();

        let groups = departments
            .iter()
            .map(|d| CanonicalGroup {
                id: d.id.to_string(),
                name: d.name.clone(),
                display_name: d.name.clone(),
                group_type: "Virtual".to_string(),
                parent_id: names.get(&d.parent_id).map(|n| n.to_string()).unwrap_or_default(),
                is_top_group: d.parent_id == 0 || !names.contains_key(&d.parent_id),
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
    use mockito::Server;

    fn source() -> SourceConfig {
        SourceConfig {
            owner: "admin".to_string(),
            name: "wecom".to_string(),
            provider_type: "WeCom".to_string(),
            user: "ww123".to_string(),
            password: "corp-secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_mapping() {
        let names = HashMap::new();
        let cases = [
            (1, Some(1), false),
            (1, None, false),
            (2, Some(1), true),
            (4, Some(1), true),
            (5, Some(1), true),
            (1, Some(0), true),
        ];
        for (status, enable, forbidden) in cases {
            let member = WeComUser {
                userid: "zhangsan".to_string(),
                status,
                enable,
                ..Default::default()
            };
            assert_eq!(wecom_user_to_canonical(&member, &names).is_forbidden, forbidden);
        }
    }

    #[tokio::test]
    async fn test_bad_corp_secret_is_configuration_error() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("GET", "/gettoken?corpid=ww123&corpsecret=corp-secret")
            .with_status(200)
            .with_body(r#"{"errcode":40001,"errmsg":"invalid credential"}"#)
            .create_async()
            .await;

        let mut provider =
            WeComProvider::with_base_url(source(), Duration::from_secs(5), server.url()).unwrap();
        let err = provider.init_adapter().await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_users_across_departments() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("GET", "/gettoken?corpid=ww123&corpsecret=corp-secret")
            .with_status(200)
            .with_body(r#"{"errcode":0,"errmsg":"ok","access_token":"wx-tok","expires_in":7200}"#)
            .create_async()
            .await;
        let _departments = server
            .mock("GET", "/department/list?access_token=wx-tok")
            .with_status(200)
            .with_body(r#"{"errcode":0,"department":[{"id":1,"name":"Acme","parentid":0},{"id":2,"name":"Sales","parentid":1}]}"#)
            .create_async()
            .await;
        let _root = server
            .mock("GET", "/user/list?access_token=wx-tok&department_id=1")
            .with_status(200)
            .with_body(r#"{"errcode":0,"userlist":[{"userid":"boss","name":"Boss","department":[1,2],"gender":"2","status":1,"enable":1}]}"#)
            .create_async()
            .await;
        let _sales = server
            .mock("GET", "/user/list?access_token=wx-tok&department_id=2")
            .with_status(200)
            .with_body(r#"{"errcode":0,"userlist":[
                {"userid":"boss","name":"Boss","department":[1,2],"status":1},
                {"userid":"rep","name":"Rep","department":[2],"status":5}
            ]}"#)
            .create_async()
            .await;

        let mut provider =
            WeComProvider::with_base_url(source(), Duration::from_secs(5), server.url()).unwrap();
        provider.init_adapter().await.unwrap();

        let users = provider.get_original_users().await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].gender, "Female");
        assert_eq!(users[0].groups.len(), 2);
        assert!(users[1].is_forbidden);

        let groups = provider.get_original_groups().await.unwrap();
        assert_eq!(groups[0].group_type, "Virtual");
        assert!(groups[0].is_top_group);
        assert_eq!(groups[1].parent_id, "Acme");
    }
}
