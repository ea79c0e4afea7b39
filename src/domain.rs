//! Domain module - sync run state, worker leases and catalog entities
//!
//! Modern Rust module organization:
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod catalog;
pub mod lease;
pub mod sync_run;

pub use catalog::{
    BlueprintRecord, CacheSummary, CatalogEntity, CatalogRecord, EntityKind, KindSummary,
    ProviderRecord, VariantRecord,
};
pub use lease::ProcessHandle;
pub use sync_run::{SyncRun, SyncRunPatch, SyncStatus, derive_percentage, phase};
