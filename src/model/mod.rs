//! Canonical record model shared by every provider and the reconciler.
//!
//! Providers translate their native records into [`CanonicalUser`],
//! [`CanonicalGroup`] and [`CompanyInfo`]. The reconciler only ever sees
//! these shapes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::warn;

#[cfg(test)]
mod tests;

/// Provider-agnostic user record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalUser {
    /// Stable external id (join key for diffing)
    pub id: String,
    /// Local login name, unique within the organization once persisted
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub gender: String,
    /// Names of the groups this user belongs to
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Provider-specific extras
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub is_forbidden: bool,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub created_time: String,
    /// Provider-side modification time, used by incremental sync
    #[serde(default)]
    pub updated_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password_salt: String,
}

/// Provider-agnostic group record. Groups are matched locally by `name`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub group_type: String,
    #[serde(default)]
    pub manager: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub is_top_group: bool,
}

/// Organizational metadata exposed by some providers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyInfo {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub website_url: String,
}

/// Addressable field of a [`CanonicalUser`].
///
/// Column mappings, hashed-column lists and patches all refer to fields
/// through this enum instead of by string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UserField {
    Id,
    Name,
    DisplayName,
    FirstName,
    LastName,
    Email,
    Phone,
    Title,
    Address,
    Location,
    Region,
    Language,
    Avatar,
    Gender,
    Groups,
    Properties,
    IsForbidden,
    IsAdmin,
    CreatedTime,
    UpdatedTime,
    Password,
    PasswordSalt,
}

impl UserField {
    pub const ALL: [UserField; 22] = [
        UserField::Id,
        UserField::Name,
        UserField::DisplayName,
        UserField::FirstName,
        UserField::LastName,
        UserField::Email,
        UserField::Phone,
        UserField::Title,
        UserField::Address,
        UserField::Location,
        UserField::Region,
        UserField::Language,
        UserField::Avatar,
        UserField::Gender,
        UserField::Groups,
        UserField::Properties,
        UserField::IsForbidden,
        UserField::IsAdmin,
        UserField::CreatedTime,
        UserField::UpdatedTime,
        UserField::Password,
        UserField::PasswordSalt,
    ];

    /// Fields hashed when a provider declares no explicit subset.
    ///
    /// Timestamps and secrets are excluded: API providers stamp `CreatedTime`
    /// on every fetch and never return passwords.
    pub fn default_hashed() -> Vec<UserField> {
        Self::ALL
            .iter()
            .copied()
            .filter(|f| {
                !matches!(
                    f,
                    UserField::CreatedTime
                        | UserField::UpdatedTime
                        | UserField::Password
                        | UserField::PasswordSalt
                )
            })
            .collect()
    }

    /// Resolves a mapping name such as `"DisplayName"` or `"display_name"`.
    pub fn parse(name: &str) -> Option<UserField> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().to_lowercase() == normalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserField::Id => "Id",
            UserField::Name => "Name",
            UserField::DisplayName => "DisplayName",
            UserField::FirstName => "FirstName",
            UserField::LastName => "LastName",
            UserField::Email => "Email",
            UserField::Phone => "Phone",
            UserField::Title => "Title",
            UserField::Address => "Address",
            UserField::Location => "Location",
            UserField::Region => "Region",
            UserField::Language => "Language",
            UserField::Avatar => "Avatar",
            UserField::Gender => "Gender",
            UserField::Groups => "Groups",
            UserField::Properties => "Properties",
            UserField::IsForbidden => "IsForbidden",
            UserField::IsAdmin => "IsAdmin",
            UserField::CreatedTime => "CreatedTime",
            UserField::UpdatedTime => "UpdatedTime",
            UserField::Password => "Password",
            UserField::PasswordSalt => "PasswordSalt",
        }
    }
}

impl std::fmt::Display for UserField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CanonicalUser {
    /// Flattens one field to the string form used for hashing and SQL writeback.
    pub fn field_value(&self, field: UserField) -> String {
        match field {
            UserField::Id => self.id.clone(),
            UserField::Name => self.name.clone(),
            UserField::DisplayName => self.display_name.clone(),
            UserField::FirstName => self.first_name.clone(),
            UserField::LastName => self.last_name.clone(),
            UserField::Email => self.email.clone(),
            UserField::Phone => self.phone.clone(),
            UserField::Title => self.title.clone(),
            UserField::Address => self.address.join("|"),
            UserField::Location => self.location.clone(),
            UserField::Region => self.region.clone(),
            UserField::Language => self.language.clone(),
            UserField::Avatar => self.avatar.clone(),
            UserField::Gender => self.gender.clone(),
            UserField::Groups => self.groups.iter().cloned().collect::<Vec<_>>().join(","),
            UserField::Properties => self
                .properties
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(","),
            UserField::IsForbidden => self.is_forbidden.to_string(),
            UserField::IsAdmin => self.is_admin.to_string(),
            UserField::CreatedTime => self.created_time.clone(),
            UserField::UpdatedTime => self.updated_time.clone(),
            UserField::Password => self.password.clone(),
            UserField::PasswordSalt => self.password_salt.clone(),
        }
    }

    /// Sets one field from its string form.
    ///
    /// `Address` becomes a single-line address, `Groups` is comma separated
    /// and booleans accept `1`/`true`/`yes` in any case.
    pub fn set_field(&mut self, field: UserField, value: &str) {
        match field {
            UserField::Id => self.id = value.to_string(),
            UserField::Name => self.name = value.to_string(),
            UserField::DisplayName => self.display_name = value.to_string(),
            UserField::FirstName => self.first_name = value.to_string(),
            UserField::LastName => self.last_name = value.to_string(),
            UserField::Email => self.email = value.to_string(),
            UserField::Phone => self.phone = value.to_string(),
            UserField::Title => self.title = value.to_string(),
            UserField::Address => {
                self.address = if value.is_empty() {
                    Vec::new()
                } else {
                    vec![value.to_string()]
                }
            }
            UserField::Location => self.location = value.to_string(),
            UserField::Region => self.region = value.to_string(),
            UserField::Language => self.language = value.to_string(),
            UserField::Avatar => self.avatar = value.to_string(),
            UserField::Gender => self.gender = value.to_string(),
            UserField::Groups => {
                self.groups = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            UserField::Properties => {
                for pair in value.split(',') {
                    if let Some((k, v)) = pair.split_once('=') {
                        self.properties.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
            UserField::IsForbidden => self.is_forbidden = parse_bool(value),
            UserField::IsAdmin => self.is_admin = parse_bool(value),
            UserField::CreatedTime => self.created_time = value.to_string(),
            UserField::UpdatedTime => self.updated_time = value.to_string(),
            UserField::Password => self.password = value.to_string(),
            UserField::PasswordSalt => self.password_salt = value.to_string(),
        }
    }

    /// Copies `fields` from `other` into `self`.
    pub fn apply_fields(&mut self, other: &CanonicalUser, fields: &[UserField]) {
        for field in fields {
            match field {
                UserField::Address => self.address = other.address.clone(),
                UserField::Groups => self.groups = other.groups.clone(),
                UserField::Properties => self.properties = other.properties.clone(),
                f => self.set_field(*f, &other.field_value(*f)),
            }
        }
    }

    /// Lists the fields (out of `candidates`) whose values differ from `other`.
    pub fn changed_fields(
        &self,
        other: &CanonicalUser,
        candidates: &[UserField],
    ) -> Vec<UserField> {
        candidates
            .iter()
            .copied()
            .filter(|f| self.field_value(*f) != other.field_value(*f))
            .collect()
    }
}

impl CanonicalGroup {
    /// Compares the metadata that is patched on drift.
    pub fn drifted_from(&self, local: &CanonicalGroup) -> bool {
        self.display_name != local.display_name
            || self.description != local.description
            || self.group_type != local.group_type
            || self.manager != local.manager
            || self.email != local.email
            || self.parent_id != local.parent_id
            || self.is_top_group != local.is_top_group
    }
}

/// Change signature: SHA-256 over the given field values joined by `|`.
pub fn signature(user: &CanonicalUser, fields: &[UserField]) -> String {
    let joined = fields
        .iter()
        .map(|f| user.field_value(*f))
        .collect::<Vec<_>>()
        .join("|");
    digest(&joined)
}

/// Hex SHA-256 of a string.
pub fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Display-name fallback shared by all providers.
///
/// Explicit name, then formatted name, then `first last`, then login.
pub fn display_name_fallback(
    explicit: &str,
    formatted: &str,
    first: &str,
    last: &str,
    login: &str,
) -> String {
    let full = format!("{} {}", first.trim(), last.trim());
    let picked = [explicit.trim(), formatted.trim(), full.trim(), login.trim()]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string();
    picked
}

/// Returns the first non-empty string.
pub fn first_non_empty<'a>(values: &[&'a str]) -> &'a str {
    values.iter().copied().find(|v| !v.is_empty()).unwrap_or("")
}

/// Deduplicates users by id. The first occurrence wins; records with an empty
/// id are dropped with a warning.
pub fn dedup_users(users: Vec<CanonicalUser>) -> Vec<CanonicalUser> {
    let mut seen = HashSet::new();
    let mut result = Vec::with_capacity(users.len());
    for user in users {
        if user.id.is_empty() {
            warn!(name = %user.name, "Dropping user record with empty id");
            continue;
        }
        if seen.insert(user.id.clone()) {
            result.push(user);
        }
    }
    result
}

/// First occurrence per key wins; records with an empty key are dropped.
pub fn dedup_by_key(users: Vec<CanonicalUser>, key_field: UserField) -> Vec<CanonicalUser> {
    let mut seen = HashSet::new();
    let mut result = Vec::with_capacity(users.len());
    for user in users {
        let key = user.field_value(key_field);
        if key.is_empty() {
            warn!(
                key_field = %key_field,
                name = %user.name,
                "Dropping fetched user with empty key"
            );
            continue;
        }
        if seen.insert(key) {
            result.push(user);
        }
    }
    result
}

/// Deduplicates groups by name, first occurrence wins.
pub fn dedup_groups(groups: Vec<CanonicalGroup>) -> Vec<CanonicalGroup> {
    let mut seen = HashSet::new();
    groups
        .into_iter()
        .filter(|g| {
            if g.name.is_empty() {
                warn!(id = %g.id, "Dropping group record with empty name");
                return false;
            }
            seen.insert(g.name.clone())
        })
        .collect()
}

/// Lenient boolean parsing for database and directory values.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "t"
    )
}
