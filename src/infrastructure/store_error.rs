//! Storage error types shared by the entity store and the sync state repository

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema verification failed, missing tables: {}", missing.join(", "))]
    SchemaVerification { missing: Vec<String> },
}

pub type StoreResult<T> = Result<T, StoreError>;
