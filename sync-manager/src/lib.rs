//! Sync Manager - provider adapters, reconciliation and auto-sync.
//!
//! Pulls users, groups and organization metadata from external identity
//! directories and reconciles them into the local identity store.
//!
//! # Architecture
//!
//! ```text
//! External directory (LDAP, SCIM, Okta, Keycloak DB, ...)
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Provider (implements trait)        │
//! │  - Authenticate, paginate, map fields    │
//! │  - Produce canonical records             │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Reconciler                         │
//! │  - Diff by key and change signature      │
//! │  - Batch inserts, field-level patches    │
//! └─────────────────────────────────────────┘
//!          ↓
//!    Identity store  ──►  invalidation channel (other instances)
//! ```
//!
//! [`SyncService`] runs one pass for a source on demand; [`AutoSynchronizer`]
//! keeps one [`SourceRunner`] loop per enabled source.
//!
//! # Core Types
//!
//! - [`Provider`] - Trait every directory adapter implements
//! - [`SourceConfig`] - One configured source (credentials, mapping, schedule)
//! - [`SyncReport`] - Outcome counters of one pass
//! - [`SourceStore`] - Configuration-store collaborator

mod provider;
mod types;
pub mod api;
pub mod manager;
pub mod providers;
pub mod reconcile;
pub mod registry;
pub mod runner;
pub mod service;
pub mod source_store;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

// Re-export public types
pub use manager::AutoSynchronizer;
pub use provider::{Capabilities, Provider};
pub use reconcile::SyncReport;
pub use registry::{build_provider, ProviderContext, ProviderKind};
pub use runner::{LoopStatus, SourceRunner};
pub use service::SyncService;
pub use source_store::{SourceStore, SqliteSourceStore};
pub use types::{SourceConfig, SshSettings, TableColumn};
