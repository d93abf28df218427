// Canonical user/group/company records
pub mod model;

// Error taxonomy
pub mod error;

// Identity-store collaborator and its SQLite implementation
pub mod store;

// Cross-instance policy invalidation over NATS
pub mod invalidation;

// Sealing of source secrets at rest
pub mod secrets;

// TOML + env configuration
pub mod config;

pub use error::{SyncError, SyncResult};
pub use model::{CanonicalGroup, CanonicalUser, CompanyInfo, UserField};
