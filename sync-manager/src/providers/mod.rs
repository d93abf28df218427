pub mod awsiam;
pub mod azuread;
pub mod database;
pub mod dingtalk;
pub mod google;
pub mod http;
pub mod jumpcloud;
pub mod lark;
pub mod ldap;
pub mod okta;
pub mod onelogin;
pub mod scim;
pub mod wecom;

use dirsync::{SyncError, SyncResult};

/// Rejects an empty configuration value with a message naming the field.
pub(crate) fn require<'a>(value: &'a str, what: &str) -> SyncResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(SyncError::configuration(format!("{} is required", what)))
    } else {
        Ok(trimmed)
    }
}

/// Strips any scheme and trailing slash from a host setting.
pub(crate) fn bare_host(host: &str) -> &str {
    let host = host.trim();
    let host = host
        .strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host);
    host.trim_end_matches('/')
}

/// Checks the `errcode`/`code` envelope used by the DingTalk, Lark and WeCom APIs.
///
/// A failed token exchange means bad credentials; any other failure is
/// retried on the next run.
pub(crate) fn check_vendor_code(
    provider: &str,
    call: &str,
    code: i64,
    message: &str,
) -> SyncResult<()> {
    match code {
        0 => Ok(()),
        _ if call == "gettoken" => Err(SyncError::configuration(format!(
            "{} rejected credentials: code={}, msg={}",
            provider, code, message
        ))),
        _ => Err(SyncError::network(format!(
            "{} {} failed: code={}, msg={}",
            provider, call, code, message
        ))),
    }
}

/// Picks the entry flagged primary, else the first one.
pub(crate) fn primary_or_first<T>(items: &[T], is_primary: impl Fn(&T) -> bool) -> Option<&T> {
    items.iter().find(|item| is_primary(item)).or_else(|| items.first())
}
