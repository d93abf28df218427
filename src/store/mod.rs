//! Identity-store collaborator interface.
//!
//! The reconciler reads and writes local users, groups and organizations only
//! through [`IdentityStore`]. Implementations own their concurrency safety;
//! callers never lock around them.

mod sqlite;

pub use sqlite::SqliteIdentityStore;

use crate::model::{CanonicalGroup, CanonicalUser, CompanyInfo, UserField};
use anyhow::Result;

/// A persisted user together with the change signature recorded at its last write.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredUser {
    pub user: CanonicalUser,
    pub signature: String,
}

/// Field-level update of one user.
#[derive(Clone, Debug, PartialEq)]
pub struct UserPatch {
    /// Fields to overwrite
    pub fields: Vec<UserField>,
    /// Source of the new values; only `fields` are read from it
    pub values: CanonicalUser,
    /// Signature to store alongside the patched record
    pub signature: String,
}

/// Metadata drift of one group. `None` leaves the stored value alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupPatch {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub group_type: Option<String>,
    pub manager: Option<String>,
    pub email: Option<String>,
    pub parent_id: Option<String>,
    pub is_top_group: Option<bool>,
}

impl GroupPatch {
    /// Builds the patch turning `local` into `fetched`, or `None` when nothing drifted.
    pub fn between(local: &CanonicalGroup, fetched: &CanonicalGroup) -> Option<GroupPatch> {
        if !fetched.drifted_from(local) {
            return None;
        }
        fn changed(old: &str, new: &str) -> Option<String> {
            (old != new).then(|| new.to_string())
        }
        Some(GroupPatch {
            display_name: changed(&local.display_name, &fetched.display_name),
            description: changed(&local.description, &fetched.description),
            group_type: changed(&local.group_type, &fetched.group_type),
            manager: changed(&local.manager, &fetched.manager),
            email: changed(&local.email, &fetched.email),
            parent_id: changed(&local.parent_id, &fetched.parent_id),
            is_top_group: (local.is_top_group != fetched.is_top_group)
                .then_some(fetched.is_top_group),
        })
    }

    pub fn apply(&self, group: &mut CanonicalGroup) {
        if let Some(v) = &self.display_name {
            group.display_name = v.clone();
        }
        if let Some(v) = &self.description {
            group.description = v.clone();
        }
        if let Some(v) = &self.group_type {
            group.group_type = v.clone();
        }
        if let Some(v) = &self.manager {
            group.manager = v.clone();
        }
        if let Some(v) = &self.email {
            group.email = v.clone();
        }
        if let Some(v) = &self.parent_id {
            group.parent_id = v.clone();
        }
        if let Some(v) = self.is_top_group {
            group.is_top_group = v;
        }
    }
}

/// Local persistence of identities, scoped by organization name.
pub trait IdentityStore: Send + Sync {
    /// Returns every user of `org` with its stored signature.
    fn find_users(&self, org: &str) -> Result<Vec<StoredUser>>;

    /// Inserts a batch atomically: either every record lands or none does.
    fn insert_users(&self, org: &str, batch: &[StoredUser]) -> Result<()>;

    /// Overwrites the patched fields of the user with external id `id`.
    fn patch_user(&self, org: &str, id: &str, patch: &UserPatch) -> Result<()>;

    fn find_groups(&self, org: &str) -> Result<Vec<CanonicalGroup>>;

    fn insert_groups(&self, org: &str, batch: &[CanonicalGroup]) -> Result<()>;

    fn patch_group(&self, org: &str, name: &str, patch: &GroupPatch) -> Result<()>;

    /// Creates the organization or merges non-empty `fields` into it.
    fn find_or_create_organization(&self, name: &str, fields: &CompanyInfo) -> Result<CompanyInfo>;
}
