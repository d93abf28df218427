//! Source configuration storage.
//!
//! Sources are kept in SQLite. The engine and scheduler only ever touch the
//! run bookkeeping (`last_sync_time`, `last_attempt_time`, `error_text`);
//! everything else is written by whoever provisions the source.
//!
//! # Secrets
//! `password` and the SSH settings are sealed with [`SecretCipher`] before
//! they reach disk. Without a cipher they are stored as given.

use crate::types::{SourceConfig, SshSettings};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use dirsync::secrets::SecretCipher;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Configuration-store collaborator used by the engine and the scheduler.
pub trait SourceStore: Send + Sync {
    fn list_sources(&self) -> Result<Vec<SourceConfig>>;

    /// Looks a source up by its `owner/name` id.
    fn get_source(&self, id: &str) -> Result<Option<SourceConfig>>;

    fn set_last_sync_time(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    fn set_last_attempt_time(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Appends `line` to the error text. Existing text is never overwritten.
    fn append_error_text(&self, id: &str, line: &str) -> Result<()>;
}

/// Formats one error-text line: `[RFC3339] message\n`.
pub fn error_line(at: DateTime<Utc>, message: &str) -> String {
    format!("[{}] {}\n", at.to_rfc3339(), message)
}

/// SQLite-backed [`SourceStore`].
pub struct SqliteSourceStore {
    conn: Mutex<Connection>,
    cipher: Option<SecretCipher>,
}

impl SqliteSourceStore {
    /// Opens (or creates) the database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P, cipher: Option<SecretCipher>) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open source config DB")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sources (
                id                TEXT PRIMARY KEY,
                record            TEXT NOT NULL,
                password          TEXT NOT NULL,
                ssh               TEXT NOT NULL,
                last_sync_time    TEXT,
                last_attempt_time TEXT,
                error_text        TEXT NOT NULL DEFAULT ''
            );",
        )
        .context("Failed to create sources table")?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Source store connection lock poisoned"))
    }

    fn seal(&self, value: &str) -> Result<String> {
        match &self.cipher {
            Some(cipher) => cipher.seal(value),
            None => Ok(value.to_string()),
        }
    }

    fn open(&self, value: &str) -> Result<String> {
        match &self.cipher {
            Some(cipher) => cipher.open(value),
            None => Ok(value.to_string()),
        }
    }

    /// Inserts or replaces a source. Run bookkeeping is taken from `source`.
    pub fn save_source(&self, source: &SourceConfig) -> Result<()> {
        let mut public = source.clone();
        public.password.clear();
        public.ssh = None;
        public.last_sync_time = None;
        public.last_attempt_time = None;
        public.error_text.clear();

        let record = serde_json::to_string(&public).context("Failed to serialize source")?;
        let password = self.seal(&source.password)?;
        let ssh = match &source.ssh {
            Some(ssh) => {
                let json = serde_json::to_string(ssh).context("Failed to serialize SSH settings")?;
                self.seal(&json)?
            }
            None => String::new(),
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sources
                (id, record, password, ssh, last_sync_time, last_attempt_time, error_text)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                source.id(),
                record,
                password,
                ssh,
                source.last_sync_time.map(|t| t.to_rfc3339()),
                source.last_attempt_time.map(|t| t.to_rfc3339()),
                source.error_text,
            ],
        )
        .with_context(|| format!("Failed to save source {}", source.id()))?;
        Ok(())
    }

    /// Deletes a source. No-op if it does not exist.
    pub fn delete_source(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sources WHERE id = ?1", params![id])
            .with_context(|| format!("Failed to delete source {}", id))?;
        Ok(())
    }

    fn assemble(&self, raw: RawSource) -> Result<SourceConfig> {
        let mut source: SourceConfig = serde_json::from_str(&raw.record)
            .with_context(|| format!("Corrupt source record {}", raw.id))?;
        source.password = self
            .open(&raw.password)
            .with_context(|| format!("Failed to open password of {}", raw.id))?;
        if !raw.ssh.is_empty() {
            let ssh_json = self
                .open(&raw.ssh)
                .with_context(|| format!("Failed to open SSH settings of {}", raw.id))?;
            let ssh: SshSettings =
                serde_json::from_str(&ssh_json).context("Corrupt SSH settings")?;
            source.ssh = Some(ssh);
        }
        source.last_sync_time = parse_time(raw.last_sync_time.as_deref())?;
        source.last_attempt_time = parse_time(raw.last_attempt_time.as_deref())?;
        source.error_text = raw.error_text;
        Ok(source)
    }

    fn update_column(&self, id: &str, sql: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(sql, params![value, id])
            .with_context(|| format!("Failed to update source {}", id))?;
        if changed == 0 {
            return Err(anyhow!("Source {} not found", id));
        }
        Ok(())
    }
}

struct RawSource {
    id: String,
    record: String,
    password: String,
    ssh: String,
    last_sync_time: Option<String>,
    last_attempt_time: Option<String>,
    error_text: String,
}

const SELECT_SOURCE: &str =
    "SELECT id, record, password, ssh, last_sync_time, last_attempt_time, error_text FROM sources";

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSource> {
    Ok(RawSource {
        id: row.get(0)?,
        record: row.get(1)?,
        password: row.get(2)?,
        ssh: row.get(3)?,
        last_sync_time: row.get(4)?,
        last_attempt_time: row.get(5)?,
        error_text: row.get(6)?,
    })
}

fn parse_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|t| t.with_timezone(&Utc))
                .with_context(|| format!("Invalid timestamp '{}'", v))
        })
        .transpose()
}

impl SourceStore for SqliteSourceStore {
    fn list_sources(&self) -> Result<Vec<SourceConfig>> {
        let raws = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!("{} ORDER BY id", SELECT_SOURCE))?;
            let rows = stmt.query_map([], row_to_raw)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to list sources")?
        };
        raws.into_iter().map(|raw| self.assemble(raw)).collect()
    }

    fn get_source(&self, id: &str) -> Result<Option<SourceConfig>> {
        let raw = {
            let conn = self.conn()?;
            conn.query_row(&format!("{} WHERE id = ?1", SELECT_SOURCE), params![id], row_to_raw)
                .optional()
                .with_context(|| format!("Failed to load source {}", id))?
        };
        raw.map(|raw| self.assemble(raw)).transpose()
    }

    fn set_last_sync_time(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_column(
            id,
            "UPDATE sources SET last_sync_time = ?1 WHERE id = ?2",
            &at.to_rfc3339(),
        )
    }

    fn set_last_attempt_time(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update_column(
            id,
            "UPDATE sources SET last_attempt_time = ?1 WHERE id = ?2",
            &at.to_rfc3339(),
        )
    }

    fn append_error_text(&self, id: &str, line: &str) -> Result<()> {
        self.update_column(id, "UPDATE sources SET error_text = error_text || ?1 WHERE id = ?2", line)
    }
}
