//! AWS IAM provider. `user` is the access key id, `password` the secret
//! access key and `host` the region.

use crate::providers::require;
use crate::{Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use chrono::{DateTime, SecondsFormat, Utc};
use dirsync::model::dedup_users;
use dirsync::{CanonicalUser, SyncError, SyncResult};
use tracing::{debug, info, warn};

const DEFAULT_REGION: &str = "us-east-1";
const MAX_ITEMS: i32 = 1000;

/// IAM user as read from `ListUsers` plus its `ListUserTags` answer.
#[derive(Clone, Debug, Default)]
pub struct IamUserRecord {
    pub user_id: String,
    pub user_name: String,
    pub arn: String,
    pub path: String,
    pub create_date: Option<DateTime<Utc>>,
    pub tags: Vec<(String, String)>,
}

impl IamUserRecord {
    fn from_sdk(user: &aws_sdk_iam::types::User) -> Self {
        let created = user.create_date();
        Self {
            user_id: user.user_id().to_string(),
            user_name: user.user_name().to_string(),
            arn: user.arn().to_string(),
            path: user.path().to_string(),
            create_date: DateTime::from_timestamp(created.secs(), created.subsec_nanos()),
            tags: Vec::new(),
        }
    }
}

/// Transform an IAM user into a canonical user.
///
/// Well-known tags (`email`, `phone`, `displayName`, `firstName`,
/// `lastName`, `title`, `department`) override profile fields; every tag is
/// also kept as a `tag:{key}` property.
pub fn iam_user_to_canonical(record: &IamUserRecord) -> CanonicalUser {
    let mut user = CanonicalUser {
        id: record.user_id.clone(),
        name: record.user_name.clone(),
        display_name: record.user_name.clone(),
        created_time: record
            .create_date
            .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default(),
        ..Default::default()
    };
    if !record.arn.is_empty() {
        user.properties.insert("arn".to_string(), record.arn.clone());
    }
    if !record.path.is_empty() {
        user.properties.insert("path".to_string(), record.path.clone());
    }

    for (key, value) in &record.tags {
        user.properties.insert(format!("tag:{}", key), value.clone());
        if value.is_empty() {
            continue;
        }
        let normalized: String = key
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "email" => user.email = value.clone(),
            "phone" => user.phone = value.clone(),
            "displayname" => user.display_name = value.clone(),
            "firstname" => user.first_name = value.clone(),
            "lastname" => user.last_name = value.clone(),
            "title" => user.title = value.clone(),
            "department" => {
                user.properties.insert("department".to_string(), value.clone());
            }
            _ => {}
        }
    }
    user
}

/// Bad keys and denied calls are configuration problems; everything else
/// is retried.
fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> SyncError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let detail = format!("AWS IAM {} failed: {}", operation, DisplayErrorContext(&err));
    let rejected = matches!(
        err.code(),
        Some(
            "InvalidClientTokenId"
                | "SignatureDoesNotMatch"
                | "AccessDenied"
                | "AccessDeniedException"
        )
    );
    match err {
        _ if rejected => SyncError::configuration(detail),
        SdkError::ConstructionFailure(_) => SyncError::configuration(detail),
        _ => SyncError::network(detail),
    }
}

pub struct AwsIamProvider {
    source: SourceConfig,
    client: Option<aws_sdk_iam::Client>,
}

impl AwsIamProvider {
    pub fn new(source: SourceConfig) -> Self {
        Self { source, client: None }
    }

    fn region(&self) -> String {
        match self.source.host.trim() {
            "" => DEFAULT_REGION.to_string(),
            region => region.to_string(),
        }
    }

    async fn build_client(&self) -> SyncResult<aws_sdk_iam::Client> {
        let access_key = require(&self.source.user, "AWS access key id (user)")?;
        let secret_key = require(&self.source.password, "AWS secret access key (password)")?;
        let credentials = aws_sdk_iam::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "dirsync-source",
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(self.region()))
            .credentials_provider(credentials)
            .load()
            .await;
        Ok(aws_sdk_iam::Client::new(&sdk_config))
    }

    async fn client(&self) -> SyncResult<aws_sdk_iam::Client> {
        match &self.client {
            Some(client) => Ok(client.clone()),
            None => self.build_client().await,
        }
    }

    async fn fetch_tags(
        &self,
        client: &aws_sdk_iam::Client,
        user_name: &str,
    ) -> Vec<(String, String)> {
        match client.list_user_tags().user_name(user_name).send().await {
            Ok(output) => output
                .tags()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect(),
            Err(e) => {
                warn!(
                    user = %user_name,
                    error = %DisplayErrorContext(&e),
                    "Failed to list IAM user tags"
                );
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Provider for AwsIamProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AwsIam
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        if self.client.is_none() {
            self.client = Some(self.build_client().await?);
        }
        Ok(())
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let client = self.client().await?;
        let iam_users = client
            .list_users()
            .max_items(MAX_ITEMS)
            .into_paginator()
            .items()
            .send()
            .try_collect()
            .await
            .map_err(|e| classify("ListUsers", e))?;
        debug!(returned = iam_users.len(), "IAM users listed");

        let mut fetched = Vec::with_capacity(iam_users.len());
        for iam_user in &iam_users {
            let mut record = IamUserRecord::from_sdk(iam_user);
            record.tags = self.fetch_tags(&client, &record.user_name).await;
            fetched.push(iam_user_to_canonical(&record));
        }

        let users = dedup_users(fetched);
        info!(
            source = %self.source.id(),
            region = %self.region(),
            fetched = users.len(),
            "AWS IAM users fetched"
        );
        Ok(users)
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let client = self.client().await?;
        client
            .list_users()
            .max_items(1)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify("ListUsers", e))
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.client = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> IamUserRecord {
        IamUserRecord {
            user_id: "AIDAEXAMPLE1".to_string(),
            user_name: "deploy-bot".to_string(),
            arn: "arn:aws:iam::123456789012:user/ops/deploy-bot".to_string(),
            path: "/ops/".to_string(),
            create_date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_profile_mapping() {
        let user = iam_user_to_canonical(&record());
        assert_eq!(user.id, "AIDAEXAMPLE1");
        assert_eq!(user.name, "deploy-bot");
        assert_eq!(user.display_name, "deploy-bot");
        assert_eq!(user.created_time, "2024-03-01T12:30:00Z");
        assert_eq!(user.properties["arn"], "arn:aws:iam::123456789012:user/ops/deploy-bot");
        assert_eq!(user.properties["path"], "/ops/");
    }

    #[test]
    fn test_tag_enrichment() {
        let mut record = record();
        record.tags = vec![
            ("Email".to_string(), "bot@example.com".to_string()),
            ("display_name".to_string(), "Deploy Bot".to_string()),
            ("first-name".to_string(), "Deploy".to_string()),
            ("Department".to_string(), "Platform".to_string()),
            ("cost-center".to_string(), "42".to_string()),
        ];
        let user = iam_user_to_canonical(&record);

        assert_eq!(user.email, "bot@example.com");
        assert_eq!(user.display_name, "Deploy Bot");
        assert_eq!(user.first_name, "Deploy");
        assert_eq!(user.properties["department"], "Platform");
        assert_eq!(user.properties["tag:cost-center"], "42");
        assert_eq!(user.properties["tag:Email"], "bot@example.com");
    }

    #[test]
    fn test_default_region() {
        let provider = AwsIamProvider::new(SourceConfig::default());
        assert_eq!(provider.region(), "us-east-1");

        let provider = AwsIamProvider::new(SourceConfig {
            host: "eu-west-1".to_string(),
            ..Default::default()
        });
        assert_eq!(provider.region(), "eu-west-1");
    }

    #[tokio::test]
    async fn test_missing_keys_are_configuration_errors() {
        let mut provider = AwsIamProvider::new(SourceConfig {
            user: "AKIAEXAMPLE".to_string(),
            ..Default::default()
        });
        let err = provider.init_adapter().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("secret access key"));
    }
}
