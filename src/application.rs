//! Application layer module
//!
//! Orchestrates a sync run: single-flight start and resume, chunk
//! scheduling, progress writes, liveness and termination.

pub mod catalog_sync_service;
pub mod liveness_monitor;
pub mod progress_tracker;
pub mod run_signals;
pub mod scheduler;
pub mod sync_engine;
pub mod sync_error;
pub mod worker_slot;

pub use catalog_sync_service::{CatalogSyncService, StatusReport};
pub use liveness_monitor::{Liveness, LivenessMonitor};
pub use progress_tracker::ProgressTracker;
pub use run_signals::RunSignals;
pub use scheduler::{ChunkOutcome, ChunkRunner, ChunkScheduler};
pub use sync_engine::{SyncEngine, transient_backoff};
pub use sync_error::{SyncError, SyncResult};
pub use worker_slot::{TerminationOutcome, WorkerSlot};
