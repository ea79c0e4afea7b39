//! Configuration infrastructure
//!
//! Configuration is organized into four sections:
//! 1. Upstream API access and request pacing
//! 2. Sync engine chunking, liveness and retry tuning
//! 3. Database location
//! 4. Logging

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

/// Environment variable that overrides `api.api_key`
pub const API_KEY_ENV: &str = "PRINTIFY_API_KEY";

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Reject settings under which a healthy run could look dead.
    ///
    /// The slowest single upstream call (its timeout plus a budget pause)
    /// must fit inside the stale threshold.
    pub fn validate(&self) -> Result<()> {
        if self.sync.chunk_size == 0 {
            bail!("sync.chunk_size must be at least 1");
        }
        if self.sync.stale_threshold_seconds == 0 {
            bail!("sync.stale_threshold_seconds must be at least 1");
        }

        let slowest_call = self
            .api
            .catalog_timeout_seconds
            .max(self.api.default_timeout_seconds)
            .saturating_add(self.api.budget_pause_seconds);
        if slowest_call >= self.sync.stale_threshold_seconds {
            bail!(
                "request timeout plus budget pause ({}s) must stay below sync.stale_threshold_seconds ({}s)",
                slowest_call,
                self.sync.stale_threshold_seconds
            );
        }

        if self.sync.lease_ttl_seconds <= self.sync.stale_threshold_seconds {
            bail!(
                "sync.lease_ttl_seconds ({}s) must exceed sync.stale_threshold_seconds ({}s)",
                self.sync.lease_ttl_seconds,
                self.sync.stale_threshold_seconds
            );
        }
        Ok(())
    }
}

/// Upstream API access and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL, must end with a slash so endpoint paths join under it
    pub base_url: String,

    /// Bearer token; `PRINTIFY_API_KEY` takes precedence when set
    pub api_key: Option<String>,

    pub user_agent: String,

    /// Timeout for light endpoints (top-level list) in seconds
    pub default_timeout_seconds: u64,

    /// Timeout for provider and variant endpoints, which return large payloads
    pub catalog_timeout_seconds: u64,

    /// Minimum spacing between two requests in milliseconds
    pub min_request_interval_ms: u64,

    /// Calls allowed per budget window
    pub window_budget: u32,

    pub window_seconds: u64,

    /// Pause applied when the window budget is exhausted, before resetting it
    pub budget_pause_seconds: u64,
}

/// Sync engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Top-level entities processed per chunk
    pub chunk_size: usize,

    /// Wall-clock budget per chunk in seconds
    pub chunk_time_budget_seconds: u64,

    /// Delay before the follow-up chunk in milliseconds
    pub chunk_interval_ms: u64,

    /// Maximum silence before a running status is considered dead
    pub stale_threshold_seconds: u64,

    /// Hard ceiling on a single executing chunk; `None` disables the check
    pub max_chunk_runtime_seconds: Option<u64>,

    pub lease_ttl_seconds: u64,

    /// Base delay for the first transient retry
    pub transient_backoff_seconds: u64,

    pub max_backoff_seconds: u64,

    /// Consecutive transient failures tolerated before the run errors out
    pub max_transient_retries: u32,

    /// How long a forced termination waits for a graceful exit before escalating
    pub termination_grace_seconds: u64,

    pub emergency_stop_ttl_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite:/path/to/catalog.db`; empty uses the data directory
    pub url: String,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,

    pub file_output: bool,

    /// Log directory; empty uses `<data dir>/logs`
    pub directory: String,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,

    /// Module-specific log level filters (e.g., "sqlx": "warn")
    pub module_filters: HashMap<String, String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::API_BASE_URL.to_string(),
            api_key: None,
            user_agent: defaults::USER_AGENT.to_string(),
            default_timeout_seconds: defaults::DEFAULT_TIMEOUT_SECONDS,
            catalog_timeout_seconds: defaults::CATALOG_TIMEOUT_SECONDS,
            min_request_interval_ms: defaults::MIN_REQUEST_INTERVAL_MS,
            window_budget: defaults::WINDOW_BUDGET,
            window_seconds: defaults::WINDOW_SECONDS,
            budget_pause_seconds: defaults::BUDGET_PAUSE_SECONDS,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::CHUNK_SIZE,
            chunk_time_budget_seconds: defaults::CHUNK_TIME_BUDGET_SECONDS,
            chunk_interval_ms: defaults::CHUNK_INTERVAL_MS,
            stale_threshold_seconds: defaults::STALE_THRESHOLD_SECONDS,
            max_chunk_runtime_seconds: None,
            lease_ttl_seconds: defaults::LEASE_TTL_SECONDS,
            transient_backoff_seconds: defaults::TRANSIENT_BACKOFF_SECONDS,
            max_backoff_seconds: defaults::MAX_BACKOFF_SECONDS,
            max_transient_retries: defaults::MAX_TRANSIENT_RETRIES,
            termination_grace_seconds: defaults::TERMINATION_GRACE_SECONDS,
            emergency_stop_ttl_seconds: defaults::EMERGENCY_STOP_TTL_SECONDS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: false,
            directory: String::new(),
            max_files: defaults::LOG_MAX_FILES,
            module_filters: {
                let mut filters = HashMap::new();
                filters.insert("sqlx".to_string(), "warn".to_string());
                filters.insert("reqwest".to_string(), "info".to_string());
                filters.insert("hyper".to_string(), "warn".to_string());
                filters.insert("tokio".to_string(), "info".to_string());
                filters
            },
        }
    }
}

impl ApiConfig {
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub const fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog_timeout_seconds)
    }

    pub const fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub const fn budget_pause(&self) -> Duration {
        Duration::from_secs(self.budget_pause_seconds)
    }
}

impl SyncConfig {
    pub const fn chunk_time_budget(&self) -> Duration {
        Duration::from_secs(self.chunk_time_budget_seconds)
    }

    pub const fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        seconds(self.stale_threshold_seconds)
    }

    pub fn max_chunk_runtime(&self) -> Option<chrono::Duration> {
        self.max_chunk_runtime_seconds.map(seconds)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        seconds(self.lease_ttl_seconds)
    }

    pub const fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }

    pub fn emergency_stop_ttl(&self) -> chrono::Duration {
        seconds(self.emergency_stop_ttl_seconds)
    }

    /// Interval at which a worker refreshes its heartbeat, both between
    /// chunks and while a chunk is in flight.
    /// A quarter of the stale threshold, at least 100ms.
    pub fn idle_heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.stale_threshold_seconds.saturating_mul(1_000) / 4).max(100))
    }
}

fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

/// Source of upstream credentials
pub trait CredentialProvider: Send + Sync {
    fn api_key(&self) -> Option<String>;
}

/// Credentials from the config file, overridden by the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigCredentials {
    configured: Option<String>,
}

impl ConfigCredentials {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            configured: config.api_key.clone(),
        }
    }
}

impl CredentialProvider for ConfigCredentials {
    fn api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .or_else(|| self.configured.clone())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

/// Fixed credentials, independent of the environment
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<String>);

impl StaticCredentials {
    pub fn key(key: impl Into<String>) -> Self {
        Self(Some(key.into()))
    }
}

impl CredentialProvider for StaticCredentials {
    fn api_key(&self) -> Option<String> {
        self.0.clone().filter(|key| !key.trim().is_empty())
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    pub config_path: PathBuf,
}

impl ConfigManager {
    /// Get the application configuration directory
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);
        Ok(config_dir)
    }

    /// Get application data directory
    pub fn get_app_data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to get user data directory")?
            .join(defaults::APP_DIR_NAME);
        Ok(data_dir)
    }

    /// Configuration manager at the default location
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME);
        Ok(Self { config_path })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
        }
    }

    /// Load configuration from file, creating default if it doesn't exist
    pub async fn load_config(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            info!("Configuration file not found, creating default: {:?}", self.config_path);
            let default_config = AppConfig::default();
            self.save_config(&default_config).await?;
            return Ok(default_config);
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .context("Failed to read configuration file")?;

        match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => {
                config
                    .validate()
                    .with_context(|| format!("Invalid configuration in {:?}", self.config_path))?;
                info!("Loaded configuration from: {:?}", self.config_path);
                Ok(config)
            }
            Err(parse_error) => {
                warn!("⚠️  Configuration file could not be parsed: {}", parse_error);
                warn!("⚠️  Resetting to default configuration");

                let backup_path = self.config_path.with_extension("json.corrupted");
                if let Err(e) = fs::copy(&self.config_path, &backup_path).await {
                    warn!("Failed to create backup of corrupted config: {}", e);
                } else {
                    info!("Backed up corrupted config to: {:?}", backup_path);
                }

                self.reset_to_defaults().await
            }
        }
    }

    /// Save configuration to file
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;

        fs::write(&self.config_path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", self.config_path);
        Ok(())
    }

    /// Update one section of the configuration in place
    pub async fn update_config<F>(&self, updater: F) -> Result<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = self.load_config().await?;
        updater(&mut config);
        self.save_config(&config).await?;
        Ok(config)
    }

    /// Reset configuration to defaults (useful for troubleshooting)
    pub async fn reset_to_defaults(&self) -> Result<AppConfig> {
        info!("🔄 Resetting configuration to defaults");
        let default_config = AppConfig::default();
        self.save_config(&default_config)
            .await
            .context("Failed to save default configuration")?;
        Ok(default_config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// Resolve the SQLite URL, falling back to `<data dir>/catalog.db`
pub fn resolve_database_url(config: &DatabaseConfig) -> Result<String> {
    if !config.url.trim().is_empty() {
        return Ok(config.url.clone());
    }
    let path = ConfigManager::get_app_data_dir()?.join(defaults::DATABASE_FILE_NAME);
    Ok(format!("sqlite:{}", path.display()))
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "catalog-mirror";
    pub const CONFIG_FILE_NAME: &str = "config.json";
    pub const DATABASE_FILE_NAME: &str = "catalog.db";

    pub const API_BASE_URL: &str = "https://api.printify.com/v1/";
    pub const USER_AGENT: &str = "catalog-mirror/0.1";

    /// Light endpoints
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

    /// Provider and variant endpoints, kept below the stale threshold
    pub const CATALOG_TIMEOUT_SECONDS: u64 = 90;

    /// At most one request per second
    pub const MIN_REQUEST_INTERVAL_MS: u64 = 1000;

    pub const WINDOW_BUDGET: u32 = 500;
    pub const WINDOW_SECONDS: u64 = 60;
    pub const BUDGET_PAUSE_SECONDS: u64 = 5;

    pub const CHUNK_SIZE: usize = 5;
    pub const CHUNK_TIME_BUDGET_SECONDS: u64 = 20;
    pub const CHUNK_INTERVAL_MS: u64 = 1000;

    pub const STALE_THRESHOLD_SECONDS: u64 = 120;

    /// One hour
    pub const LEASE_TTL_SECONDS: u64 = 3600;

    pub const TRANSIENT_BACKOFF_SECONDS: u64 = 60;
    pub const MAX_BACKOFF_SECONDS: u64 = 900;
    pub const MAX_TRANSIENT_RETRIES: u32 = 5;

    pub const TERMINATION_GRACE_SECONDS: u64 = 5;
    pub const EMERGENCY_STOP_TTL_SECONDS: u64 = 3600;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_MAX_FILES: u32 = 5;
}
