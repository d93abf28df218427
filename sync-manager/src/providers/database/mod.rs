//! Relational sources (generic table mapping and Keycloak).
//!
//! The whole table is read with `SELECT *` and each row goes through the
//! source's column mapping. The key column, the hashed columns and the
//! update-time column all come from that mapping too.

pub mod dsn;
pub mod mapping;

use crate::providers::require;
use crate::tunnel::{TunnelHandle, TunnelProvider, TunnelRequest};
use crate::{Capabilities, Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::dedup_by_key;
use dirsync::{CanonicalUser, SyncError, SyncResult, UserField};
use serde::Deserialize;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row as _};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use self::dsn::{connection_url, redacted, DatabaseType, Endpoint};
use self::mapping::{apply_keycloak_row, row_to_user, user_to_columns, Row, SqlValue};

const MAX_CONNECTIONS: u32 = 4;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Server codes for bad credentials or a missing table (postgres, mysql).
fn is_rejection(code: Option<&str>) -> bool {
    matches!(code, Some("28P01" | "28000" | "42P01" | "42S02" | "1045"))
}

fn classify(operation: &str, err: sqlx::Error) -> SyncError {
    let detail = format!("database {} failed: {}", operation, err);
    match &err {
        sqlx::Error::Configuration(_) | sqlx::Error::ColumnNotFound(_) => {
            SyncError::configuration(detail)
        }
        sqlx::Error::Database(db) if is_rejection(db.code().as_deref()) => {
            SyncError::configuration(detail)
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => {
            SyncError::schema(detail)
        }
        _ => SyncError::network(detail),
    }
}

#[derive(Clone)]
enum Pool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl Pool {
    async fn connect(db_type: DatabaseType, url: &str) -> Result<Self, sqlx::Error> {
        Ok(match db_type {
            DatabaseType::Postgres => Pool::Postgres(
                PgPoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .acquire_timeout(ACQUIRE_TIMEOUT)
                    .connect(url)
                    .await?,
            ),
            DatabaseType::MySql => Pool::MySql(
                MySqlPoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .acquire_timeout(ACQUIRE_TIMEOUT)
                    .connect(url)
                    .await?,
            ),
        })
    }

    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Row>, sqlx::Error> {
        match self {
            Pool::Postgres(pool) => {
                Ok(sqlx::query(sql).fetch_all(pool).await?.iter().map(pg_row).collect())
            }
            Pool::MySql(pool) => {
                Ok(sqlx::query(sql).fetch_all(pool).await?.iter().map(mysql_row).collect())
            }
        }
    }

    /// First column of the first row, for single-value lookups bound to `arg`.
    async fn fetch_scalar(&self, sql: &str, arg: &str) -> Result<Option<String>, sqlx::Error> {
        match self {
            Pool::Postgres(pool) => {
                let row = sqlx::query(sql).bind(arg).fetch_optional(pool).await?;
                Ok(row.and_then(|r| pg_value(&r, 0)))
            }
            Pool::MySql(pool) => {
                let row = sqlx::query(sql).bind(arg).fetch_optional(pool).await?;
                Ok(row.and_then(|r| mysql_value(&r, 0)))
            }
        }
    }

    async fn execute(&self, sql: &str, values: Vec<SqlValue>) -> Result<u64, sqlx::Error> {
        match self {
            Pool::Postgres(pool) => {
                let mut query = sqlx::query(sql);
                for value in values {
                    query = match value {
                        SqlValue::Text(v) => query.bind(v),
                        SqlValue::Integer(v) => query.bind(v),
                        SqlValue::Boolean(v) => query.bind(v),
                    };
                }
                Ok(query.execute(pool).await?.rows_affected())
            }
            Pool::MySql(pool) => {
                let mut query = sqlx::query(sql);
                for value in values {
                    query = match value {
                        SqlValue::Text(v) => query.bind(v),
                        SqlValue::Integer(v) => query.bind(v),
                        SqlValue::Boolean(v) => query.bind(v),
                    };
                }
                Ok(query.execute(pool).await?.rows_affected())
            }
        }
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            Pool::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            Pool::MySql(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
        }
    }

    async fn close(&self) {
        match self {
            Pool::Postgres(pool) => pool.close().await,
            Pool::MySql(pool) => pool.close().await,
        }
    }
}

// Column types differ per table; try the common ones in turn.
fn pg_value(row: &PgRow, idx: usize) -> Option<String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v;
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|v| v.to_rfc3339());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(|v| String::from_utf8_lossy(&v).into_owned());
    }
    None
}

fn mysql_value(row: &MySqlRow, idx: usize) -> Option<String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v;
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<i8>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v.map(|v| v.to_rfc3339());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v.map(|v| v.to_string());
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(|v| String::from_utf8_lossy(&v).into_owned());
    }
    None
}

fn pg_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .map(|c| (c.name().to_string(), pg_value(row, c.ordinal())))
        .collect()
}

fn mysql_row(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .map(|c| (c.name().to_string(), mysql_value(row, c.ordinal())))
        .collect()
}

/// Keycloak `credential.secret_data` payload.
#[derive(Debug, Default, Deserialize)]
struct KeycloakSecret {
    #[serde(default)]
    value: String,
    #[serde(default)]
    salt: String,
}

struct Connection {
    db_type: DatabaseType,
    pool: Pool,
    tunnel: Option<TunnelHandle>,
}

pub struct DatabaseProvider {
    kind: ProviderKind,
    source: SourceConfig,
    tunnel_provider: Option<Arc<dyn TunnelProvider>>,
    connection: Option<Connection>,
}

impl DatabaseProvider {
    pub fn new(
        kind: ProviderKind,
        source: SourceConfig,
        tunnel_provider: Option<Arc<dyn TunnelProvider>>,
    ) -> Self {
        Self {
            kind,
            source,
            tunnel_provider,
            connection: None,
        }
    }

    fn connection(&self) -> SyncResult<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| {
                SyncError::configuration(format!(
                    "{} adapter used before init_adapter",
                    self.kind
                ))
            })
    }

    fn table(&self, db_type: DatabaseType) -> SyncResult<String> {
        let table = match (self.source.table.trim(), self.kind) {
            ("", ProviderKind::Keycloak) => "user_entity",
            (table, _) => table,
        };
        Ok(db_type.quote_ident(require(table, "table")?))
    }

    fn lowercase_columns(&self, db_type: DatabaseType) -> bool {
        self.kind == ProviderKind::Keycloak && db_type == DatabaseType::Postgres
    }

    /// Where to connect, opening an SSH tunnel first when the source has one.
    async fn resolve_endpoint(
        &self,
        db_type: DatabaseType,
    ) -> SyncResult<(Endpoint, Option<TunnelHandle>)> {
        let host = require(&self.source.host, "database host")?;
        let direct = Endpoint {
            host: host.to_string(),
            port: self.source.port,
        };
        match (&self.source.ssh, &self.tunnel_provider) {
            (None, _) => Ok((direct, None)),
            (Some(_), None) => Err(SyncError::configuration(
                "SSH tunnel requested but no tunnel provider is configured",
            )),
            (Some(ssh), Some(provider)) => {
                let request = TunnelRequest {
                    ssh: ssh.clone(),
                    remote_host: direct.host,
                    remote_port: if direct.port == 0 {
                        db_type.default_port()
                    } else {
                        direct.port
                    },
                };
                let handle = provider
                    .open_tunnel(&request)
                    .await
                    .map_err(|e| {
                        SyncError::network(format!(
                            "failed to open SSH tunnel via {}: {:#}",
                            ssh.host, e
                        ))
                    })?;
                let local = Endpoint {
                    host: handle.local_host.clone(),
                    port: handle.local_port,
                };
                Ok((local, Some(handle)))
            }
        }
    }

    async fn open(&self) -> SyncResult<Connection> {
        let db_type = DatabaseType::parse(&self.source.database_type)?;
        let (endpoint, tunnel) = self.resolve_endpoint(db_type).await?;

        let url = connection_url(
            db_type,
            &endpoint,
            &self.source.user,
            &self.source.password,
            &self.source.database,
            &self.source.ssl_mode,
        );
        debug!(url = %redacted(&url), tunneled = tunnel.is_some(), "Connecting to source database");
        let pool = Pool::connect(db_type, &url).await.map_err(|e| classify("connect", e))?;
        Ok(Connection { db_type, pool, tunnel })
    }

    async fn keycloak_credentials(
        &self,
        conn: &Connection,
        user: &mut CanonicalUser,
    ) -> SyncResult<()> {
        let sql = format!(
            "SELECT secret_data FROM credential WHERE type = 'password' AND user_id = {}",
            conn.db_type.placeholder(1)
        );
        let secret = conn
            .pool
            .fetch_scalar(&sql, &user.id)
            .await
            .map_err(|e| classify("credential lookup", e))?;
        if let Some(raw) = secret {
            match serde_json::from_str::<KeycloakSecret>(&raw) {
                Ok(secret) => {
                    user.password = secret.value;
                    user.password_salt = secret.salt;
                }
                Err(e) => warn!(user_id = %user.id, error = %e, "Unreadable Keycloak credential"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for DatabaseProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            writeback: true,
            ..Default::default()
        }
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        if self.connection.is_none() {
            self.connection = Some(self.open().await?);
        }
        Ok(())
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let conn = self.connection()?;
        let table = self.table(conn.db_type)?;
        let rows = conn
            .pool
            .fetch_rows(&format!("SELECT * FROM {}", table))
            .await
            .map_err(|e| classify("fetch", e))?;

        let lowercase = self.lowercase_columns(conn.db_type);
        let mut users = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut user = row_to_user(row, &self.source, lowercase);
            if self.kind == ProviderKind::Keycloak {
                apply_keycloak_row(&mut user, row);
                self.keycloak_credentials(conn, &mut user).await?;
            }
            users.push(user);
        }
        let users = dedup_by_key(users, self.key_field());
        info!(
            source = %self.source.id(),
            table = %table,
            fetched = users.len(),
            "Database users fetched"
        );
        Ok(users)
    }

    async fn add_user(&self, user: &CanonicalUser) -> SyncResult<()> {
        let conn = self.connection()?;
        let columns = user_to_columns(user, &self.source);
        if columns.is_empty() {
            return Err(SyncError::configuration("no writable table columns configured"));
        }
        let names: Vec<String> = columns.iter().map(|(n, _)| conn.db_type.quote_ident(n)).collect();
        let markers: Vec<String> =
            (1..=columns.len()).map(|i| conn.db_type.placeholder(i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(conn.db_type)?,
            names.join(", "),
            markers.join(", ")
        );
        let values = columns.into_iter().map(|(_, v)| v).collect();
        conn.pool.execute(&sql, values).await.map_err(|e| classify("insert", e))?;
        Ok(())
    }

    async fn test_connection(&self) -> SyncResult<()> {
        match &self.connection {
            Some(conn) => conn.pool.ping().await.map_err(|e| classify("ping", e)),
            None => {
                let mut conn = self.open().await?;
                let result = conn.pool.ping().await.map_err(|e| classify("ping", e));
                conn.pool.close().await;
                if let Some(tunnel) = conn.tunnel.as_mut() {
                    tunnel.close();
                }
                result
            }
        }
    }

    async fn close(&mut self) -> SyncResult<()> {
        if let Some(mut conn) = self.connection.take() {
            conn.pool.close().await;
            if let Some(tunnel) = conn.tunnel.as_mut() {
                tunnel.close();
            }
        }
        Ok(())
    }

    fn key_field(&self) -> UserField {
        self.source
            .key_column()
            .and_then(|c| c.field())
            .unwrap_or(UserField::Id)
    }

    fn hashed_fields(&self) -> Vec<UserField> {
        let fields = self.source.hashed_fields();
        if fields.is_empty() {
            UserField::default_hashed()
        } else {
            fields
        }
    }

    fn update_time_field(&self) -> Option<UserField> {
        self.source.update_time_field()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SshSettings, TableColumn};
    use tokio::sync::{oneshot, Mutex};

    fn column(name: &str, casdoor_name: &str) -> TableColumn {
        TableColumn {
            name: name.to_string(),
            casdoor_name: casdoor_name.to_string(),
            ..Default::default()
        }
    }

    fn source(database_type: &str) -> SourceConfig {
        SourceConfig {
            owner: "admin".to_string(),
            name: "hr-db".to_string(),
            provider_type: "Database".to_string(),
            database_type: database_type.to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            user: "reader".to_string(),
            password: "secret".to_string(),
            database: "hr".to_string(),
            table: "people".to_string(),
            table_columns: vec![
                column("emp_no", "Id"),
                column("login", "Name"),
                column("changed", "UpdatedTime"),
            ],
            ..Default::default()
        }
    }

    struct RecordingTunnel {
        requests: Mutex<Vec<TunnelRequest>>,
    }

    #[async_trait]
    impl TunnelProvider for RecordingTunnel {
        async fn open_tunnel(&self, request: &TunnelRequest) -> anyhow::Result<TunnelHandle> {
            self.requests.lock().await.push(request.clone());
            let (tx, _rx) = oneshot::channel();
            Ok(TunnelHandle::new("127.0.0.1", 15432, tx))
        }
    }

    #[tokio::test]
    async fn test_mssql_is_configuration_error() {
        let mut provider = DatabaseProvider::new(ProviderKind::Database, source("mssql"), None);
        let err = provider.init_adapter().await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("mssql"));
    }

    #[tokio::test]
    async fn test_ssh_without_tunnel_provider() {
        let mut cfg = source("postgres");
        cfg.ssh = Some(SshSettings {
            host: "bastion".to_string(),
            port: 22,
            user: "jump".to_string(),
            ..Default::default()
        });
        let mut provider = DatabaseProvider::new(ProviderKind::Database, cfg, None);
        assert!(provider.init_adapter().await.unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_tunnel_is_requested_for_remote_endpoint() {
        let tunnel = Arc::new(RecordingTunnel {
            requests: Mutex::new(Vec::new()),
        });
        let mut cfg = source("postgres");
        cfg.port = 0;
        cfg.ssh = Some(SshSettings {
            host: "bastion".to_string(),
            port: 22,
            user: "jump".to_string(),
            ..Default::default()
        });
        let provider = DatabaseProvider::new(ProviderKind::Database, cfg, Some(tunnel.clone()));

        let (endpoint, handle) = provider.resolve_endpoint(DatabaseType::Postgres).await.unwrap();
        assert_eq!(endpoint.port, 15432);
        assert!(handle.is_some());

        let requests = tunnel.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].remote_host, "127.0.0.1");
        assert_eq!(requests[0].remote_port, 5432);
        assert_eq!(requests[0].ssh.host, "bastion");
    }

    #[tokio::test]
    async fn test_writeback_is_insert_only() {
        let provider = DatabaseProvider::new(ProviderKind::Database, source("mysql"), None);
        let err = provider.update_user(&CanonicalUser::default()).await.unwrap_err();
        assert_eq!(err.kind(), "unsupported");
        assert!(err.to_string().contains("UpdateUser"));
    }

    #[tokio::test]
    async fn test_fetch_before_init_is_configuration_error() {
        let provider = DatabaseProvider::new(ProviderKind::Database, source("mysql"), None);
        assert!(provider.get_original_users().await.unwrap_err().is_configuration());
    }

    #[test]
    fn test_mapping_driven_fields() {
        let mut cfg = source("mysql");
        cfg.table_columns[1].is_key = true;
        cfg.table_columns[1].is_hashed = true;
        let provider = DatabaseProvider::new(ProviderKind::Database, cfg, None);

        assert_eq!(provider.key_field(), UserField::Name);
        assert_eq!(provider.hashed_fields(), vec![UserField::Name]);
        assert_eq!(provider.update_time_field(), Some(UserField::UpdatedTime));
        assert!(provider.capabilities().writeback);
    }

    #[test]
    fn test_keycloak_table_default() {
        let mut cfg = source("postgres");
        cfg.table.clear();
        let provider = DatabaseProvider::new(ProviderKind::Keycloak, cfg.clone(), None);
        assert_eq!(provider.table(DatabaseType::Postgres).unwrap(), "\"user_entity\"");
        assert!(provider.lowercase_columns(DatabaseType::Postgres));
        assert!(!provider.lowercase_columns(DatabaseType::MySql));

        let provider = DatabaseProvider::new(ProviderKind::Database, cfg, None);
        assert!(provider.table(DatabaseType::MySql).unwrap_err().is_configuration());
    }

    #[test]
    fn test_error_classification() {
        assert!(
            classify("connect", sqlx::Error::Configuration("bad url".into())).is_configuration()
        );
        assert_eq!(classify("fetch", sqlx::Error::PoolTimedOut).kind(), "transient_network");
        assert_eq!(
            classify("fetch", sqlx::Error::ColumnNotFound("x".to_string())).kind(),
            "configuration"
        );
    }
}
