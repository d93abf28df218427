//! LDAP and Active Directory provider.
//!
//! `host`/`port` locate the server (`enable_ssl` switches to `ldaps://`),
//! `user`/`password` are the bind DN and password, `base_dn` and `filter`
//! scope the user search. Groups are the CNs found in `memberOf`.

pub mod entry;

use crate::providers::require;
use crate::{Capabilities, Provider, ProviderKind, SourceConfig};
use async_trait::async_trait;
use dirsync::model::dedup_users;
use dirsync::{CanonicalGroup, CanonicalUser, SyncError, SyncResult};
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use self::entry::{entry_to_canonical, groups_from_users, is_active_directory, user_attributes};

const PAGE_SIZE: i32 = 100;
const DEFAULT_FILTER: &str = "(objectClass=person)";
const ROOT_DSE_ATTRIBUTES: [&str; 4] =
    ["vendorName", "vendorVersion", "isGlobalCatalogReady", "forestFunctionality"];

/// LDAP result code for rejected credentials.
const INVALID_CREDENTIALS: u32 = 49;

fn classify(operation: &str, err: LdapError) -> SyncError {
    match &err {
        LdapError::LdapResult { result } if result.rc == INVALID_CREDENTIALS => {
            SyncError::configuration(format!("LDAP {} rejected credentials: {}", operation, err))
        }
        LdapError::LdapResult { .. }
        | LdapError::UrlParsing { .. }
        | LdapError::UnknownScheme(_) => {
            SyncError::configuration(format!("LDAP {} failed: {}", operation, err))
        }
        _ => SyncError::network(format!("LDAP {} failed: {}", operation, err)),
    }
}

/// Bound connection handle plus the server flavour detected at bind time.
struct Session {
    ldap: Ldap,
    is_ad: bool,
}

/// Per-pass state. Users and groups share one subtree search.
#[derive(Default)]
struct PassState {
    session: Option<Session>,
    users: Option<Vec<CanonicalUser>>,
}

pub struct LdapProvider {
    kind: ProviderKind,
    source: SourceConfig,
    timeout: Duration,
    state: Mutex<PassState>,
}

impl LdapProvider {
    pub fn new(kind: ProviderKind, source: SourceConfig, timeout: Duration) -> Self {
        Self {
            kind,
            source,
            timeout,
            state: Mutex::new(PassState::default()),
        }
    }

    fn url(&self) -> SyncResult<String> {
        let host = require(&self.source.host, "LDAP host")?;
        let (scheme, default_port) =
            if self.source.enable_ssl { ("ldaps", 636) } else { ("ldap", 389) };
        let host = host
            .strip_prefix("ldaps://")
            .or_else(|| host.strip_prefix("ldap://"))
            .unwrap_or(host);
        let port = if self.source.port == 0 { default_port } else { self.source.port };
        Ok(format!("{}://{}:{}", scheme, host, port))
    }

    async fn connect(&self) -> SyncResult<Session> {
        let url = self.url()?;
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| classify("connect", e))?;
        ldap3::drive!(conn);

        ldap.with_timeout(self.timeout)
            .simple_bind(&self.source.user, &self.source.password)
            .await
            .and_then(|r| r.success())
            .map_err(|e| classify("bind", e))?;

        let is_ad = self.kind == ProviderKind::ActiveDirectory
            || self.detect_active_directory(&mut ldap).await;
        debug!(url = %url, is_ad, "LDAP bind succeeded");
        Ok(Session { ldap, is_ad })
    }

    /// Unreadable RootDSE means "not AD" rather than a failure.
    async fn detect_active_directory(&self, ldap: &mut Ldap) -> bool {
        let result = ldap
            .with_timeout(self.timeout)
            .search("", Scope::Base, "(objectClass=*)", ROOT_DSE_ATTRIBUTES.to_vec())
            .await
            .and_then(|r| r.success());
        match result {
            Ok((entries, _)) => entries
                .into_iter()
                .next()
                .map(|e| is_active_directory(&SearchEntry::construct(e)))
                .unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "RootDSE query failed, assuming generic LDAP");
                false
            }
        }
    }

    /// Runs the subtree search once per pass; later calls reuse the entries.
    async fn search_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let mut state = self.state.lock().await;
        if let Some(users) = &state.users {
            return Ok(users.clone());
        }
        if state.session.is_none() {
            state.session = Some(self.connect().await?);
        }
        let Some(session) = state.session.as_ref() else {
            return Err(SyncError::network("LDAP session unavailable"));
        };
        let mut ldap = session.ldap.clone();
        let filter = match self.source.filter.trim() {
            "" => DEFAULT_FILTER,
            filter => filter,
        };

        let adapters: Vec<Box<dyn Adapter<_, _>>> =
            vec![Box::new(EntriesOnly::new()), Box::new(PagedResults::new(PAGE_SIZE))];
        let mut search = ldap
            .with_timeout(self.timeout)
            .streaming_search_with(
                adapters,
                &self.source.base_dn,
                Scope::Subtree,
                filter,
                user_attributes(session.is_ad),
            )
            .await
            .map_err(|e| classify("search", e))?;

        let mut fetched = Vec::new();
        while let Some(result_entry) = search.next().await.map_err(|e| classify("search", e))? {
            fetched.push(entry_to_canonical(&SearchEntry::construct(result_entry)));
        }
        search
            .finish()
            .await
            .success()
            .map_err(|e| classify("search", e))?;
        state.users = Some(fetched.clone());
        Ok(fetched)
    }
}

#[async_trait]
impl Provider for LdapProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            groups: true,
            ..Default::default()
        }
    }

    async fn init_adapter(&mut self) -> SyncResult<()> {
        if self.state.get_mut().session.is_none() {
            let session = self.connect().await?;
            self.state.get_mut().session = Some(session);
        }
        Ok(())
    }

    async fn get_original_users(&self) -> SyncResult<Vec<CanonicalUser>> {
        let users = dedup_users(self.search_users().await?);
        info!(
            source = %self.source.id(),
            base_dn = %self.source.base_dn,
            fetched = users.len(),
            "LDAP users fetched"
        );
        Ok(users)
    }

    async fn get_original_groups(&self) -> SyncResult<Vec<CanonicalGroup>> {
        let users = self.search_users().await?;
        Ok(groups_from_users(&users))
    }

    async fn test_connection(&self) -> SyncResult<()> {
        let mut session = self.connect().await?;
        session
            .ldap
            .with_timeout(self.timeout)
            .unbind()
            .await
            .map_err(|e| classify("unbind", e))
    }

    async fn close(&mut self) -> SyncResult<()> {
        let state = self.state.get_mut();
        state.users = None;
        if let Some(mut session) = state.session.take() {
            if let Err(e) = session.ldap.with_timeout(self.timeout).unbind().await {
                warn!(source = %self.source.id(), error = %e, "LDAP unbind failed");
            }
        }
        Ok(())
    }
}
