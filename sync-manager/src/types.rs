use chrono::{DateTime, Utc};
use dirsync::UserField;
use serde::{Deserialize, Serialize};

/// A configured source: one named connection to an external directory.
///
/// The record is owned by the configuration store; the engine only advances
/// `last_sync_time`, the scheduler only touches `last_attempt_time`, and both
/// append to `error_text`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub owner: String,
    pub name: String,
    /// Organization whose users and groups this source feeds
    pub organization: String,
    /// Provider type name, e.g. `"SCIM"`, `"Okta"`, `"Keycloak"`
    #[serde(rename = "type")]
    pub provider_type: String,

    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,

    /// `mysql`, `postgres` or `mssql`
    #[serde(default)]
    pub database_type: String,
    #[serde(default)]
    pub ssl_mode: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    #[serde(default)]
    pub ssh: Option<SshSettings>,

    #[serde(default)]
    pub table_columns: Vec<TableColumn>,
    #[serde(default)]
    pub avatar_base_url: String,

    #[serde(default)]
    pub base_dn: String,
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub enable_ssl: bool,

    /// Auto-sync interval in minutes; 0 disables the loop
    #[serde(default)]
    pub auto_sync: u64,
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_attempt_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read_only: bool,
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub error_text: String,
}

impl SourceConfig {
    /// `owner/name`, the id used by the scheduler and the admin API.
    pub fn id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Key column: the one flagged `is_key`, else the one named `id`, else the first.
    pub fn key_column(&self) -> Option<&TableColumn> {
        self.table_columns
            .iter()
            .rev()
            .find(|c| c.is_key)
            .or_else(|| self.table_columns.iter().find(|c| c.name == "id"))
            .or_else(|| self.table_columns.first())
    }

    /// Canonical fields of the columns flagged `is_hashed`.
    pub fn hashed_fields(&self) -> Vec<UserField> {
        self.table_columns
            .iter()
            .filter(|c| c.is_hashed)
            .filter_map(|c| c.field())
            .collect()
    }

    /// Canonical field mapped as the update-tracking column, if any.
    pub fn update_time_field(&self) -> Option<UserField> {
        self.table_columns
            .iter()
            .filter_map(|c| c.field())
            .find(|f| *f == UserField::UpdatedTime)
    }
}

/// Mapping of one source column to one canonical field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    /// Column name in the source; `a+b` concatenates columns with a space
    pub name: String,
    /// Column type hint for writeback: `string`, `integer` or `boolean`
    #[serde(rename = "type", default)]
    pub column_type: String,
    /// Canonical field name, e.g. `DisplayName`
    pub casdoor_name: String,
    #[serde(default)]
    pub is_key: bool,
    #[serde(default)]
    pub is_hashed: bool,
    #[serde(default)]
    pub values: Vec<String>,
}

impl TableColumn {
    pub fn field(&self) -> Option<UserField> {
        UserField::parse(&self.casdoor_name)
    }
}

/// SSH jump settings for database sources behind a bastion.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SshSettings {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// PEM private key; preferred over `password` when set
    #[serde(default)]
    pub cert: String,
}

fn default_ssh_port() -> u16 {
    22
}
