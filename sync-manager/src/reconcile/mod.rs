//! Reconciliation engine.
//!
//! One pass turns a provider's fetched records into identity-store writes:
//!
//! ```text
//! provider ──► company ──► groups (by name) ──► users (by key field)
//!                                                  │
//!                       insert / patch / skip ◄────┤
//!                                                  └──► writeback (local-only users)
//! ```
//!
//! Planning is pure ([`plan_users`], [`plan_groups`]); [`Reconciler`] fetches,
//! plans and applies the plan in batches.


use crate::providers::database::mapping::full_avatar_url;
use crate::{Provider, SourceConfig};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use dirsync::model::{dedup_by_key, dedup_groups, digest, signature};
use dirsync::store::{GroupPatch, IdentityStore, StoredUser, UserPatch};
use dirsync::{CanonicalGroup, CanonicalUser, CompanyInfo, SyncError, SyncResult, UserField};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Property recording which source created a local user.
pub const REGISTER_SOURCE: &str = "registerSource";

const NAME_SUFFIX_LEN: usize = 6;

/// Outcome counters of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub written_back: usize,
    pub groups_inserted: usize,
    pub groups_updated: usize,
    /// Non-fatal failures (writeback rejected upstream)
    pub errors: Vec<String>,
}

impl SyncReport {
    /// True when the pass wrote anything, locally or upstream.
    pub fn changed(&self) -> bool {
        self.inserted
            + self.updated
            + self.written_back
            + self.groups_inserted
            + self.groups_updated
            > 0
    }
}

/// Keys and hashing rules for one source.
#[derive(Clone, Debug)]
pub struct PlanOptions {
    pub key_field: UserField,
    pub hashed_fields: Vec<UserField>,
    pub update_time_field: Option<UserField>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub organization: String,
    pub source_name: String,
    pub avatar_base_url: String,
}

impl PlanOptions {
    pub fn new(source: &SourceConfig, provider: &dyn Provider) -> Self {
        Self {
            key_field: provider.key_field(),
            hashed_fields: provider.hashed_fields(),
            update_time_field: provider.update_time_field(),
            last_sync_time: source.last_sync_time,
            organization: source.organization.clone(),
            source_name: source.name.clone(),
            avatar_base_url: source.avatar_base_url.clone(),
        }
    }

    /// Fields a patch may touch. The local id and creation time are immutable.
    fn patchable_fields(&self) -> Vec<UserField> {
        self.hashed_fields
            .iter()
            .copied()
            .filter(|f| !matches!(f, UserField::Id | UserField::CreatedTime))
            .collect()
    }
}

/// User changes computed for one pass.
#[derive(Debug, Default)]
pub struct UserPlan {
    pub inserts: Vec<StoredUser>,
    /// `(local id, patch)`
    pub updates: Vec<(String, UserPatch)>,
    pub skipped: usize,
    /// Local users with no upstream counterpart, sorted by name
    pub local_only: Vec<CanonicalUser>,
}

/// Group changes computed for one pass.
#[derive(Debug, Default)]
pub struct GroupPlan {
    pub inserts: Vec<CanonicalGroup>,
    /// `(group name, patch)`
    pub patches: Vec<(String, GroupPatch)>,
}

/// Parses an upstream modification time: RFC 3339, or a naive
/// `YYYY-MM-DD HH:MM:SS` read as UTC.
pub fn parse_update_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Incremental filter. Engages only when the provider tracks modification
/// time AND the source has synced before; unparseable times fall through to hashing.
fn unchanged_since_last_sync(user: &CanonicalUser, opts: &PlanOptions) -> bool {
    let (Some(field), Some(last_sync)) = (opts.update_time_field, opts.last_sync_time) else {
        return false;
    };
    parse_update_time(&user.field_value(field)).is_some_and(|updated| updated <= last_sync)
}

/// Shapes a fetched user into the record persisted locally.
fn local_record(mut user: CanonicalUser, opts: &PlanOptions, now: DateTime<Utc>) -> CanonicalUser {
    if user.name.is_empty() {
        user.name = user.id.clone();
    }
    if user.created_time.is_empty() {
        user.created_time = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    }
    user.avatar = full_avatar_url(&opts.avatar_base_url, &user.avatar);
    user.properties.insert(
        REGISTER_SOURCE.to_string(),
        format!("{}/{}", opts.organization, opts.source_name),
    );
    user
}

fn suffixed_name(name: &str, id: &str) -> String {
    format!("{}_{}", name, &digest(id)[..NAME_SUFFIX_LEN])
}

/// Diffs fetched users against the local users of the organization.
pub fn plan_users(
    fetched: Vec<CanonicalUser>,
    local: Vec<StoredUser>,
    opts: &PlanOptions,
    now: DateTime<Utc>,
) -> UserPlan {
    let key_field = opts.key_field;
    let patchable = opts.patchable_fields();

    // name -> local id, for collision checks
    let mut names: HashMap<String, String> = local
        .iter()
        .map(|s| (s.user.name.clone(), s.user.id.clone()))
        .collect();
    let mut by_key: HashMap<String, StoredUser> = local
        .into_iter()
        .map(|s| (s.user.field_value(key_field), s))
        .filter(|(key, _)| !key.is_empty())
        .collect();

    let mut plan = UserPlan::default();
    for user in dedup_by_key(fetched, key_field) {
        let key = user.field_value(key_field);
        match by_key.remove(&key) {
            None => {
                let sig = signature(&user, &opts.hashed_fields);
                let mut record = local_record(user, opts, now);
                // A name-keyed source cannot collide: same name is the same user
                if key_field != UserField::Name
                    && names.get(&record.name).is_some_and(|owner| *owner != record.id)
                {
                    let renamed = suffixed_name(&record.name, &record.id);
                    debug!(name = %record.name, renamed = %renamed, "Name collision on insert");
                    record.name = renamed;
                }
                names.insert(record.name.clone(), record.id.clone());
                plan.inserts.push(StoredUser {
                    user: record,
                    signature: sig,
                });
            }
            Some(stored) => {
                if unchanged_since_last_sync(&user, opts) {
                    plan.skipped += 1;
                    continue;
                }
                let sig = signature(&user, &opts.hashed_fields);
                if sig == stored.signature {
                    plan.skipped += 1;
                    continue;
                }

                let mut record = local_record(user, opts, now);
                if record.name != stored.user.name
                    && names.get(&record.name).is_some_and(|owner| *owner != stored.user.id)
                {
                    record.name = stored.user.name.clone();
                }
                let fields = stored.user.changed_fields(&record, &patchable);
                if fields.contains(&UserField::Name) {
                    names.remove(&stored.user.name);
                    names.insert(record.name.clone(), stored.user.id.clone());
                }
                plan.updates.push((
                    stored.user.id.clone(),
                    UserPatch {
                        fields,
                        values: record,
                        signature: sig,
                    },
                ));
            }
        }
    }

    plan.local_only = by_key.into_values().map(|s| s.user).collect();
    plan.local_only.sort_by(|a, b| a.name.cmp(&b.name));
    plan
}

/// Create-or-patch by group name.
pub fn plan_groups(fetched: Vec<CanonicalGroup>, local: Vec<CanonicalGroup>) -> GroupPlan {
    let local: HashMap<String, CanonicalGroup> =
        local.into_iter().map(|g| (g.name.clone(), g)).collect();
    let mut plan = GroupPlan::default();
    for group in dedup_groups(fetched) {
        match local.get(&group.name) {
            None => plan.inserts.push(group),
            Some(existing) => {
                if let Some(patch) = GroupPatch::between(existing, &group) {
                    plan.patches.push((group.name.clone(), patch));
                }
            }
        }
    }
    plan
}

/// Store-level failures collected while applying a plan.
#[derive(Default)]
struct Failures {
    attempted: usize,
    failed: usize,
    details: Vec<String>,
}

impl Failures {
    fn record(&mut self, count: usize, err: anyhow::Error) {
        self.failed += count;
        self.details.push(format!("{:#}", err));
    }

    fn into_result(self, report: SyncReport) -> SyncResult<SyncReport> {
        if self.failed == 0 {
            Ok(report)
        } else {
            Err(SyncError::PartialBatch {
                attempted: self.attempted,
                failed: self.failed,
                detail: self.details.join("; "),
            })
        }
    }
}

/// Runs one pass for a single source against an initialized provider.
pub struct Reconciler<'a> {
    provider: &'a dyn Provider,
    store: &'a dyn IdentityStore,
    source: &'a SourceConfig,
    batch_size: usize,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        store: &'a dyn IdentityStore,
        source: &'a SourceConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            provider,
            store,
            source,
            batch_size: batch_size.max(1),
        }
    }

    /// Company, then groups, then users.
    ///
    /// Fetch failures abort the pass before anything is written. Store
    /// failures do not: committed batches stay and the pass ends in
    /// [`SyncError::PartialBatch`].
    pub async fn run(&self) -> SyncResult<SyncReport> {
        let org = self.source.organization.trim();
        if org.is_empty() {
            return Err(SyncError::configuration(format!(
                "source '{}' has no organization",
                self.source.id()
            )));
        }

        let capabilities = self.provider.capabilities();
        let mut report = SyncReport::default();
        let mut failures = Failures::default();

        let company = if capabilities.company {
            self.provider.get_company_info().await?
        } else {
            CompanyInfo::default()
        };
        self.store.find_or_create_organization(org, &company)?;

        if capabilities.groups {
            let fetched = self.provider.get_original_groups().await?;
            self.apply_groups(org, fetched, &mut report, &mut failures)?;
        }

        let mut users = self.provider.get_original_users().await?;
        if capabilities.user_groups {
            for user in users.iter_mut() {
                if user.id.is_empty() {
                    continue;
                }
                user.groups = self
                    .provider
                    .get_original_user_groups(&user.id)
                    .await?
                    .into_iter()
                    .collect();
            }
        }

        let opts = PlanOptions::new(self.source, self.provider);
        let local = self.store.find_users(org)?;
        let plan = plan_users(users, local, &opts, Utc::now());
        report.skipped = plan.skipped;
        self.apply_users(org, plan.inserts, plan.updates, &mut report, &mut failures);

        if capabilities.writeback && !self.source.is_read_only {
            self.write_back(&plan.local_only, &mut report).await;
        }

        info!(
            source_id = %self.source.id(),
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            written_back = report.written_back,
            groups_inserted = report.groups_inserted,
            groups_updated = report.groups_updated,
            failed = failures.failed,
            "Reconciliation pass finished"
        );
        failures.into_result(report)
    }

    fn apply_groups(
        &self,
        org: &str,
        fetched: Vec<CanonicalGroup>,
        report: &mut SyncReport,
        failures: &mut Failures,
    ) -> SyncResult<()> {
        let plan = plan_groups(fetched, self.store.find_groups(org)?);
        for chunk in plan.inserts.chunks(self.batch_size) {
            failures.attempted += chunk.len();
            match self.store.insert_groups(org, chunk) {
                Ok(()) => report.groups_inserted += chunk.len(),
                Err(e) => {
                    warn!(source_id = %self.source.id(), error = %e, "Group batch failed");
                    failures.record(chunk.len(), e);
                }
            }
        }
        for (name, patch) in &plan.patches {
            failures.attempted += 1;
            match self.store.patch_group(org, name, patch) {
                Ok(()) => report.groups_updated += 1,
                Err(e) => failures.record(1, e),
            }
        }
        Ok(())
    }

    fn apply_users(
        &self,
        org: &str,
        inserts: Vec<StoredUser>,
        updates: Vec<(String, UserPatch)>,
        report: &mut SyncReport,
        failures: &mut Failures,
    ) {
        // Renames first: an insert may reuse a name a patch frees
        for (id, patch) in &updates {
            failures.attempted += 1;
            match self.store.patch_user(org, id, patch) {
                Ok(()) => report.updated += 1,
                Err(e) => {
                    warn!(
                        source_id = %self.source.id(),
                        user_id = %id,
                        error = %e,
                        "User patch failed"
                    );
                    failures.record(1, e);
                }
            }
        }
        for chunk in inserts.chunks(self.batch_size) {
            failures.attempted += chunk.len();
            match self.store.insert_users(org, chunk) {
                Ok(()) => report.inserted += chunk.len(),
                Err(e) => {
                    warn!(
                        source_id = %self.source.id(),
                        batch = chunk.len(),
                        error = %e,
                        "User batch failed"
                    );
                    failures.record(chunk.len(), e);
                }
            }
        }
    }

    async fn write_back(&self, local_only: &[CanonicalUser], report: &mut SyncReport) {
        for user in local_only {
            match self.provider.add_user(user).await {
                Ok(()) => report.written_back += 1,
                Err(e) => {
                    warn!(
                        source_id = %self.source.id(),
                        user = %user.name,
                        error = %e,
                        "Writeback failed"
                    );
                    report.errors.push(format!("writeback of '{}' failed: {}", user.name, e));
                }
            }
        }
    }
}
