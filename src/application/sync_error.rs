//! Errors returned by sync operations

use thiserror::Error;

use crate::infrastructure::api_client::ApiError;
use crate::infrastructure::store_error::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("A sync is already running (run {run_id}, {current_index}/{total_count})")]
    AlreadyRunning {
        run_id: String,
        current_index: u64,
        total_count: u64,
    },

    #[error("API credentials are not configured")]
    MissingCredentials,

    #[error("Nothing to resume: {0}")]
    NothingToResume(String),

    #[error("Emergency stop is active; start a new sync or reset to lift it")]
    EmergencyStopActive,

    #[error("Invalid sync state: {0}")]
    InvalidState(String),

    #[error("Upstream API error: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    pub const fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
