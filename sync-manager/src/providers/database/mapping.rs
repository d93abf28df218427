//! Column mapping between source rows and canonical users.

use crate::types::{SourceConfig, TableColumn};
use chrono::{DateTime, SecondsFormat};
use dirsync::model::parse_bool;
use dirsync::{CanonicalUser, UserField};
use std::collections::HashMap;

/// One fetched row: column name to textual value (`None` for SQL NULL).
pub type Row = HashMap<String, Option<String>>;

/// Typed parameter for writeback statements.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl SqlValue {
    /// Converts by the column's declared type; unparseable numbers fall back to text.
    pub fn typed(column: &TableColumn, value: String) -> SqlValue {
        match column.column_type.to_ascii_lowercase().as_str() {
            "integer" | "int" | "bigint" => value
                .trim()
                .parse::<i64>()
                .map(SqlValue::Integer)
                .unwrap_or(SqlValue::Text(value)),
            "boolean" | "bool" => SqlValue::Boolean(parse_bool(&value)),
            _ => SqlValue::Text(value),
        }
    }
}

/// Strips `avatar_base_url` from a stored avatar.
pub fn partial_avatar_url(base: &str, avatar: &str) -> String {
    if !base.is_empty() {
        if let Some(rest) = avatar.strip_prefix(base) {
            return rest.to_string();
        }
    }
    avatar.to_string()
}

/// Prefixes relative avatars with `avatar_base_url`.
pub fn full_avatar_url(base: &str, avatar: &str) -> String {
    if base.is_empty() || avatar.is_empty() || avatar.starts_with("http") {
        avatar.to_string()
    } else {
        format!("{}{}", base, avatar)
    }
}

/// Reads one mapped column. `a + b` joins the parts with a space.
fn column_value(row: &Row, name: &str) -> String {
    let lookup = |n: &str| row.get(n.trim()).cloned().flatten().unwrap_or_default();
    if name.contains('+') {
        name.split('+').map(lookup).collect::<Vec<_>>().join(" ")
    } else {
        lookup(name)
    }
}

/// Builds a canonical user from a row through the source's column mapping.
///
/// `lowercase_columns` is set for Keycloak on Postgres, whose column names
/// come back folded to lower case.
pub fn row_to_user(row: &Row, source: &SourceConfig, lowercase_columns: bool) -> CanonicalUser {
    let mut user = CanonicalUser::default();
    for column in &source.table_columns {
        let Some(field) = column.field() else { continue };
        let name = if lowercase_columns {
            column.name.to_lowercase()
        } else {
            column.name.clone()
        };
        let value = column_value(row, &name);
        match field {
            UserField::Avatar => user.avatar = partial_avatar_url(&source.avatar_base_url, &value),
            f => user.set_field(f, &value),
        }
    }
    user
}

/// Keycloak-specific fix-ups: epoch-millisecond creation time and the
/// `enabled` flag.
pub fn apply_keycloak_row(user: &mut CanonicalUser, row: &Row) {
    if let Ok(millis) = user.created_time.trim().parse::<i64>() {
        user.created_time = DateTime::from_timestamp_millis(millis)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
    }
    let enabled = row
        .get("ENABLED")
        .or_else(|| row.get("enabled"))
        .cloned()
        .flatten()
        .unwrap_or_default();
    user.is_forbidden = !parse_bool(&enabled);
}

/// Column/value pairs written back for `user`. Concatenated columns are
/// read-only and skipped.
pub fn user_to_columns(user: &CanonicalUser, source: &SourceConfig) -> Vec<(String, SqlValue)> {
    source
        .table_columns
        .iter()
        .filter(|c| !c.name.contains('+'))
        .filter_map(|column| {
            let field = column.field()?;
            let value = match field {
                UserField::Avatar => full_avatar_url(&source.avatar_base_url, &user.avatar),
                f => user.field_value(f),
            };
            Some((column.name.clone(), SqlValue::typed(column, value)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, casdoor_name: &str) -> TableColumn {
        TableColumn {
            name: name.to_string(),
            casdoor_name: casdoor_name.to_string(),
            ..Default::default()
        }
    }

    fn row(pairs: &[(&str, Option<&str>)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
            .collect()
    }

    fn source() -> SourceConfig {
        SourceConfig {
            table_columns: vec![
                column("id", "Id"),
                column("login", "Name"),
                column("first_name + last_name", "DisplayName"),
                column("avatar", "Avatar"),
                column("disabled", "IsForbidden"),
                column("modified_at", "UpdatedTime"),
            ],
            avatar_base_url: "https://cdn.example.com/".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_row_to_user() {
        let user = row_to_user(
            &row(&[
                ("id", Some("42")),
                ("login", Some("jdoe")),
                ("first_name", Some("John")),
                ("last_name", Some("Doe")),
                ("avatar", Some("https://cdn.example.com/a/42.png")),
                ("disabled", Some("1")),
                ("modified_at", None),
            ]),
            &source(),
            false,
        );

        assert_eq!(user.id, "42");
        assert_eq!(user.name, "jdoe");
        assert_eq!(user.display_name, "John Doe");
        assert_eq!(user.avatar, "a/42.png");
        assert!(user.is_forbidden);
        assert_eq!(user.updated_time, "");
    }

    #[test]
    fn test_unknown_canonical_name_is_ignored() {
        let mut source = source();
        source.table_columns.push(column("shoe", "ShoeSize"));
        let user = row_to_user(&row(&[("id", Some("1")), ("shoe", Some("44"))]), &source, false);
        assert_eq!(user.id, "1");
        assert!(user.properties.is_empty());
    }

    #[test]
    fn test_keycloak_fixups() {
        let source = SourceConfig {
            table_columns: vec![column("ID", "Id"), column("CREATED_TIMESTAMP", "CreatedTime")],
            ..Default::default()
        };
        let pg_row = row(&[
            ("id", Some("f0c1")),
            ("created_timestamp", Some("1700000000000")),
            ("enabled", Some("f")),
        ]);
        let mut user = row_to_user(&pg_row, &source, true);
        apply_keycloak_row(&mut user, &pg_row);

        assert_eq!(user.id, "f0c1");
        assert_eq!(user.created_time, "2023-11-14T22:13:20Z");
        assert!(user.is_forbidden);
    }

    #[test]
    fn test_user_to_columns_types_and_avatar() {
        let mut source = source();
        source.table_columns[0].column_type = "integer".to_string();
        source.table_columns[4].column_type = "boolean".to_string();
        let user = CanonicalUser {
            id: "42".to_string(),
            name: "jdoe".to_string(),
            avatar: "a/42.png".to_string(),
            is_forbidden: true,
            ..Default::default()
        };

        let columns: HashMap<String, SqlValue> =
            user_to_columns(&user, &source).into_iter().collect();
        assert_eq!(columns["id"], SqlValue::Integer(42));
        assert_eq!(columns["login"], SqlValue::Text("jdoe".to_string()));
        assert_eq!(
            columns["avatar"],
            SqlValue::Text("https://cdn.example.com/a/42.png".to_string())
        );
        assert_eq!(columns["disabled"], SqlValue::Boolean(true));
        assert!(!columns.contains_key("first_name + last_name"));
    }

    #[test]
    fn test_avatar_urls() {
        assert_eq!(full_avatar_url("", "a.png"), "a.png");
        assert_eq!(full_avatar_url("https://cdn/", "a.png"), "https://cdn/a.png");
        assert_eq!(full_avatar_url("https://cdn/", "http://other/a.png"), "http://other/a.png");
        assert_eq!(partial_avatar_url("https://cdn/", "https://cdn/a.png"), "a.png");
        assert_eq!(partial_avatar_url("", "https://cdn/a.png"), "https://cdn/a.png");
    }
}
