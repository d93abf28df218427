//! Provider registry - maps a source's `type` to its adapter.

use crate::providers::{
    awsiam::AwsIamProvider, azuread::AzureAdProvider, database::DatabaseProvider,
    dingtalk::DingTalkProvider, google::GoogleWorkspaceProvider, jumpcloud::JumpCloudProvider,
    lark::LarkProvider, ldap::LdapProvider, okta::OktaProvider, onelogin::OneLoginProvider,
    scim::ScimProvider, wecom::WeComProvider,
};
use crate::tunnel::TunnelProvider;
use crate::{Provider, SourceConfig};
use dirsync::SyncError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Every supported upstream directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Ldap,
    ActiveDirectory,
    Scim,
    AzureAd,
    GoogleWorkspace,
    Okta,
    OneLogin,
    JumpCloud,
    DingTalk,
    Lark,
    WeCom,
    AwsIam,
    Database,
    Keycloak,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 14] = [
        ProviderKind::Ldap,
        ProviderKind::ActiveDirectory,
        ProviderKind::Scim,
        ProviderKind::AzureAd,
        ProviderKind::GoogleWorkspace,
        ProviderKind::Okta,
        ProviderKind::OneLogin,
        ProviderKind::JumpCloud,
        ProviderKind::DingTalk,
        ProviderKind::Lark,
        ProviderKind::WeCom,
        ProviderKind::AwsIam,
        ProviderKind::Database,
        ProviderKind::Keycloak,
    ];

    /// The `type` string stored in source configurations.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ldap => "LDAP",
            ProviderKind::ActiveDirectory => "Active Directory",
            ProviderKind::Scim => "SCIM",
            ProviderKind::AzureAd => "Azure AD",
            ProviderKind::GoogleWorkspace => "Google Workspace",
            ProviderKind::Okta => "Okta",
            ProviderKind::OneLogin => "OneLogin",
            ProviderKind::JumpCloud => "JumpCloud",
            ProviderKind::DingTalk => "DingTalk",
            ProviderKind::Lark => "Lark",
            ProviderKind::WeCom => "WeCom",
            ProviderKind::AwsIam => "AWS IAM",
            ProviderKind::Database => "Database",
            ProviderKind::Keycloak => "Keycloak",
        }
    }

    /// Database-style providers join on the configured key column and hash
    /// the configured columns.
    pub fn is_table_mapped(&self) -> bool {
        matches!(self, ProviderKind::Database | ProviderKind::Keycloak)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = SyncError;

    /// Case-insensitive; spaces, `_` and `-` are ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();

        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().replace(' ', "").to_ascii_lowercase() == normalized)
            .ok_or_else(|| SyncError::configuration(format!("unknown source type '{}'", s)))
    }
}

/// Shared collaborators handed to every provider at construction.
#[derive(Clone)]
pub struct ProviderContext {
    pub tunnel: Option<Arc<dyn TunnelProvider>>,
    pub http_timeout: Duration,
}

impl Default for ProviderContext {
    fn default() -> Self {
        Self {
            tunnel: None,
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// Builds the adapter for `source`. An unknown type is a configuration error.
pub fn build_provider(
    source: &SourceConfig,
    ctx: &ProviderContext,
) -> Result<Box<dyn Provider>, SyncError> {
    let kind: ProviderKind = source.provider_type.parse()?;
    let timeout = ctx.http_timeout;

    let provider: Box<dyn Provider> = match kind {
        ProviderKind::Ldap | ProviderKind::ActiveDirectory => {
            Box::new(LdapProvider::new(kind, source.clone(), timeout))
        }
        ProviderKind::Scim => Box::new(ScimProvider::new(source.clone(), timeout)?),
        ProviderKind::AzureAd => Box::new(AzureAdProvider::new(source.clone(), timeout)?),
        ProviderKind::GoogleWorkspace => {
            Box::new(GoogleWorkspaceProvider::new(source.clone(), timeout)?)
        }
        ProviderKind::Okta => Box::new(OktaProvider::new(source.clone(), timeout)?),
        ProviderKind::OneLogin => Box::new(OneLoginProvider::new(source.clone(), timeout)?),
        ProviderKind::JumpCloud => Box::new(JumpCloudProvider::new(source.clone(), timeout)?),
        ProviderKind::DingTalk => Box::new(DingTalkProvider::new(source.clone(), timeout)?),
        ProviderKind::Lark => Box::new(LarkProvider::new(source.clone(), timeout)?),
        ProviderKind::WeCom => Box::new(WeComProvider::new(source.clone(), timeout)?),
        ProviderKind::AwsIam => Box::new(AwsIamProvider::new(source.clone())),
        ProviderKind::Database | ProviderKind::Keycloak => {
            Box::new(DatabaseProvider::new(kind, source.clone(), ctx.tunnel.clone()))
        }
    };
    Ok(provider)
}
