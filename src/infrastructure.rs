//! Infrastructure layer for the database, the upstream API and process plumbing
//!
//! This module provides database connections, the catalog entity store, the
//! sync control state, the rate-limited HTTP client, configuration and logging.

pub mod api_client;
pub mod config;
pub mod database_connection;
pub mod entity_store;
pub mod logging;
pub mod rate_limit;
pub mod store_error; // Typed storage errors
pub mod sync_state_repository;

// Re-export commonly used items
pub use api_client::{ApiError, CatalogApi, HttpCatalogClient, RequestObserver};
pub use config::{
    AppConfig, ConfigCredentials, ConfigManager, CredentialProvider, StaticCredentials,
    resolve_database_url,
};
pub use database_connection::DatabaseConnection;
pub use entity_store::EntityStore;
pub use logging::{get_log_directory, init_logging_with_config};
pub use rate_limit::RequestPacer;
pub use store_error::{StoreError, StoreResult};
pub use sync_state_repository::SyncStateRepository;
