use crate::registry::ProviderKind;
use async_trait::async_trait;
use dirsync::{CanonicalGroup, CanonicalUser, CompanyInfo, SyncError, SyncResult, UserField};

/// Optional extensions a provider implements on top of the user fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `get_original_groups` returns the upstream group list
    pub groups: bool,
    /// Membership needs a per-user `get_original_user_groups` lookup
    pub user_groups: bool,
    /// `get_company_info` returns organization metadata
    pub company: bool,
    /// `add_user` / `update_user` write to the upstream directory
    pub writeback: bool,
}

/// Adapter interface for external identity directories.
///
/// Every provider translates one upstream system into the canonical record
/// shape. Providers own their connection state (tokens, pools, sessions);
/// configuration comes from the [`SourceConfig`](crate::SourceConfig) they
/// were built from.
///
/// # Lifecycle
/// 1. The registry builds the provider from the source configuration
/// 2. The engine calls `init_adapter()` (idempotent)
/// 3. The engine fetches company info, groups and users as capabilities allow
/// 4. Writeback-capable providers receive `add_user()` for local-only users
/// 5. The engine calls `close()` (safe to repeat)
///
/// # Example
/// ```no_run
/// use sync_manager::{Provider, ProviderKind};
/// use async_trait::async_trait;
/// use dirsync::{CanonicalUser, SyncResult};
///
/// struct StaticDirectory(Vec<CanonicalUser>);
///
/// #[async_trait]
/// impl Provider for StaticDirectory {
///     fn kind(&self) -> ProviderKind {
///         ProviderKind::Scim
///     }
///
///     async fn init_adapter(&mut self) -> SyncResult<()> {
///         Ok(())
///     }
///
///     async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
///         Ok(self.0.clone())
///     }
///
///     async fn test_connection(&self) -> SyncResult<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Establishes sessions, exchanges credentials for tokens, opens pools.
    ///
    /// Calling it on an initialized provider is a no-op.
    async fn init_adapter(&mut self) -> SyncResult<()>;

    /// Fetches every upstream user, following pagination to the end.
    ///
    /// The result is deduplicated by id with the first occurrence winning,
    /// and records without an id are dropped.
    ///
    /// # Error Handling
    /// - Missing credentials or rejected auth → `Configuration`
    /// - Timeouts, resets, 5xx → `TransientNetwork`
    /// - Unexpected payload shape → `SchemaMismatch`
    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>>;

    async fn get_original_groups(&self) -> SyncResult<Vec<CanonicalGroup>> {
        Err(SyncError::unsupported(self.kind().as_str(), "GetOriginalGroups"))
    }

    /// Names of the groups `user_id` belongs to.
    async fn get_original_user_groups(&self, _user_id: &str) -> SyncResult<Vec<String>> {
        Err(SyncError::unsupported(self.kind().as_str(), "GetOriginalUserGroups"))
    }

    async fn get_company_info(&self) -> SyncResult<CompanyInfo> {
        Err(SyncError::unsupported(self.kind().as_str(), "GetCompanyInfo"))
    }

    async fn add_user(&self, _user: &CanonicalUser) -> SyncResult<()> {
        Err(SyncError::unsupported(self.kind().as_str(), "AddUser"))
    }

    async fn update_user(&self, _user: &CanonicalUser) -> SyncResult<()> {
        Err(SyncError::unsupported(self.kind().as_str(), "UpdateUser"))
    }

    /// Cheap check proving the credentials and endpoint work.
    async fn test_connection(&self) -> SyncResult<()>;

    /// Releases sessions and pools. Safe to call repeatedly.
    async fn close(&mut self) -> SyncResult<()> {
        Ok(())
    }

    /// Field joining fetched and local records.
    fn key_field(&self) -> UserField {
        UserField::Id
    }

    /// Fields covered by the change signature.
    fn hashed_fields(&self) -> Vec<UserField> {
        UserField::default_hashed()
    }

    /// Field carrying the upstream modification time, when the provider has one.
    fn update_time_field(&self) -> Option<UserField> {
        None
    }
}
