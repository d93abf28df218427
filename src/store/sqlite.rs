//! SQLite-backed identity store.
//!
//! Records are kept as JSON next to a few indexed columns so the canonical
//! shape can grow without schema migrations.

use super::{GroupPatch, IdentityStore, StoredUser, UserPatch};
use crate::model::{CanonicalGroup, CanonicalUser, CompanyInfo};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Identity store on a single SQLite connection.
///
/// # Schema
/// ```sql
/// users(org, id, name, record, signature, updated_at)   -- PK (org, id), UNIQUE (org, name)
/// groups(org, name, record, updated_at)                 -- PK (org, name)
/// organizations(name, display_name, logo, website_url)  -- PK name
/// ```
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    /// Opens (or creates) the database. `":memory:"` gives a private in-memory store.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open identity database")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                org        TEXT NOT NULL,
                id         TEXT NOT NULL,
                name       TEXT NOT NULL,
                record     TEXT NOT NULL,
                signature  TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (org, id),
                UNIQUE (org, name)
            );
            CREATE TABLE IF NOT EXISTS groups (
                org        TEXT NOT NULL,
                name       TEXT NOT NULL,
                record     TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (org, name)
            );
            CREATE TABLE IF NOT EXISTS organizations (
                name         TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                logo         TEXT NOT NULL,
                website_url  TEXT NOT NULL,
                created_at   TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create identity tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Identity store connection lock poisoned"))
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn find_users(&self, org: &str) -> Result<Vec<StoredUser>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT record, signature FROM users WHERE org = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![org], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut users = Vec::new();
        for row in rows {
            let (record, signature) = row?;
            let user: CanonicalUser =
                serde_json::from_str(&record).context("Corrupt user record in identity store")?;
            users.push(StoredUser { user, signature });
        }
        Ok(users)
    }

    fn insert_users(&self, org: &str, batch: &[StoredUser]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for stored in batch {
            let record = serde_json::to_string(&stored.user)?;
            tx.execute(
                "INSERT INTO users (org, id, name, record, signature, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![org, stored.user.id, stored.user.name, record, stored.signature, now],
            )
            .with_context(|| format!("Failed to insert user '{}'", stored.user.name))?;
        }
        tx.commit().context("Failed to commit user batch")?;
        Ok(())
    }

    fn patch_user(&self, org: &str, id: &str, patch: &UserPatch) -> Result<()> {
        let conn = self.conn()?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM users WHERE org = ?1 AND id = ?2",
                params![org, id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(record) = record else {
            bail!("User '{}' not found in organization '{}'", id, org);
        };

        let mut user: CanonicalUser = serde_json::from_str(&record)?;
        user.apply_fields(&patch.values, &patch.fields);
        conn.execute(
            "UPDATE users SET name = ?1, record = ?2, signature = ?3, updated_at = ?4
             WHERE org = ?5 AND id = ?6",
            params![
                user.name,
                serde_json::to_string(&user)?,
                patch.signature,
                Utc::now().to_rfc3339(),
                org,
                id
            ],
        )
        .with_context(|| format!("Failed to patch user '{}'", id))?;
        Ok(())
    }

    fn find_groups(&self, org: &str) -> Result<Vec<CanonicalGroup>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT record FROM groups WHERE org = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![org], |row| row.get::<_, String>(0))?;
        let mut groups = Vec::new();
        for row in rows {
            let group =
                serde_json::from_str(&row?).context("Corrupt group record in identity store")?;
            groups.push(group);
        }
        Ok(groups)
    }

    fn insert_groups(&self, org: &str, batch: &[CanonicalGroup]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();
        for group in batch {
            tx.execute(
                "INSERT INTO groups (org, name, record, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![org, group.name, serde_json::to_string(group)?, now],
            )
            .with_context(|| format!("Failed to insert group '{}'", group.name))?;
        }
        tx.commit().context("Failed to commit group batch")?;
        Ok(())
    }

    fn patch_group(&self, org: &str, name: &str, patch: &GroupPatch) -> Result<()> {
        let conn = self.conn()?;
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM groups WHERE org = ?1 AND name = ?2",
                params![org, name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(record) = record else {
            bail!("Group '{}' not found in organization '{}'", name, org);
        };

        let mut group: CanonicalGroup = serde_json::from_str(&record)?;
        patch.apply(&mut group);
        conn.execute(
            "UPDATE groups SET record = ?1, updated_at = ?2 WHERE org = ?3 AND name = ?4",
            params![serde_json::to_string(&group)?, Utc::now().to_rfc3339(), org, name],
        )?;
        Ok(())
    }

    fn find_or_create_organization(&self, name: &str, fields: &CompanyInfo) -> Result<CompanyInfo> {
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                "SELECT display_name, logo, website_url FROM organizations WHERE name = ?1",
                params![name],
                |row| {
                    Ok(CompanyInfo {
                        name: name.to_string(),
                        display_name: row.get(0)?,
                        logo: row.get(1)?,
                        website_url: row.get(2)?,
                    })
                },
            )
            .optional()?;

        // Only non-empty incoming values overwrite what is stored.
        fn merge(current: &str, incoming: &str) -> String {
            if incoming.is_empty() {
                current.to_string()
            } else {
                incoming.to_string()
            }
        }

        let merged = match &existing {
            Some(org) => CompanyInfo {
                name: name.to_string(),
                display_name: merge(&org.display_name, &fields.display_name),
                logo: merge(&org.logo, &fields.logo),
                website_url: merge(&org.website_url, &fields.website_url),
            },
            None => CompanyInfo {
                name: name.to_string(),
                ..fields.clone()
            },
        };

        if existing.as_ref() != Some(&merged) {
            conn.execute(
                "INSERT INTO organizations (name, display_name, logo, website_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    display_name = excluded.display_name,
                    logo = excluded.logo,
                    website_url = excluded.website_url",
                params![
                    merged.name,
                    merged.display_name,
                    merged.logo,
                    merged.website_url,
                    Utc::now().to_rfc3339()
                ],
            )
            .with_context(|| format!("Failed to upsert organization '{}'", name))?;
        }
        Ok(merged)
    }
}
