//! Test utilities for catalog-mirror
//!
//! Each test gets its own on-disk SQLite database in a temp directory so
//! pooled connections share state and tests never interfere with each other.

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::application::liveness_monitor::LivenessMonitor;
use crate::application::progress_tracker::ProgressTracker;
use crate::application::sync_engine::SyncEngine;
use crate::domain::catalog::CatalogEntity;
use crate::domain::sync_run::SyncRun;
use crate::infrastructure::api_client::{ApiError, CatalogApi};
use crate::infrastructure::config::SyncConfig;
use crate::infrastructure::database_connection::DatabaseConnection;
use crate::infrastructure::entity_store::EntityStore;
use crate::infrastructure::sync_state_repository::SyncStateRepository;

/// Fast settings: no backoff, tiny chunk interval, one second of grace
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        chunk_interval_ms: 1,
        transient_backoff_seconds: 0,
        max_backoff_seconds: 0,
        termination_grace_seconds: 1,
        ..SyncConfig::default()
    }
}

/// Test database backed by a temp file
pub struct TestDatabase {
    _dir: TempDir,
    pub connection: DatabaseConnection,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite:{}", dir.path().join("test.db").display());
        let connection = DatabaseConnection::new(&url).await.expect("open test database");
        connection.migrate().await.expect("migrate test database");
        Self { _dir: dir, connection }
    }

    pub fn pool(&self) -> SqlitePool {
        self.connection.pool().clone()
    }
}

/// Complete test context with the engine and the pieces it is built from
pub struct TestContext {
    _database: TestDatabase,
    pub store: EntityStore,
    pub state: SyncStateRepository,
    pub engine: Arc<SyncEngine>,
    pub tracker: Arc<ProgressTracker>,
    pub liveness: Arc<LivenessMonitor>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_api(Arc::new(FakeCatalogApi::default()), test_sync_config()).await
    }

    pub async fn with_config(config: SyncConfig) -> Self {
        Self::with_api(Arc::new(FakeCatalogApi::default()), config).await
    }

    pub async fn with_api(api: Arc<FakeCatalogApi>, config: SyncConfig) -> Self {
        let database = TestDatabase::new().await;
        let pool = database.pool();
        let store = EntityStore::new(pool.clone());
        store.ensure_schema().await.expect("catalog schema");
        let state = SyncStateRepository::new(pool);

        let engine = SyncEngine::new(api, store.clone(), state.clone(), config);
        let tracker = engine.tracker().clone();
        let liveness = engine.liveness().clone();

        Self {
            _database: database,
            store,
            state,
            engine,
            tracker,
            liveness,
        }
    }
}

/// Poll the run record until `done` holds, failing the test after ten seconds
pub async fn wait_for<F>(tracker: &ProgressTracker, done: F) -> SyncRun
where
    F: Fn(&SyncRun) -> bool,
{
    for _ in 0..1_000 {
        let run = tracker.read().await.expect("read run");
        if done(&run) {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {:?}", tracker.read().await);
}

/// In-memory catalog with scripted failures and a call log.
///
/// Calls are logged as `list`, `providers:{bp}` and `variants:{bp}:{p}`.
/// Failures queued with [`FakeCatalogApi::fail_next`] under the same key are
/// returned in order before the real data.
#[derive(Default)]
pub struct FakeCatalogApi {
    blueprints: Vec<CatalogEntity>,
    providers: HashMap<String, Vec<CatalogEntity>>,
    variants: HashMap<(String, String), Vec<CatalogEntity>>,
    failures: Mutex<HashMap<String, VecDeque<ApiError>>>,
    calls: Mutex<Vec<String>>,
    latency: Mutex<Duration>,
}

impl FakeCatalogApi {
    /// Blueprints `1..=n`, providers `1..=p` under each, variants `1..=v` under each provider
    pub fn with_catalog(blueprints: usize, providers: usize, variants: usize) -> Self {
        let mut api = Self::default();
        for b in 1..=blueprints {
            let bp_id = b.to_string();
            api.blueprints.push(entity(json!({ "id": b, "title": format!("Blueprint {b}") })));

            let mut bp_providers = Vec::new();
            for p in 1..=providers {
                bp_providers.push(entity(json!({ "id": p, "title": format!("Provider {p}") })));
                let bp_variants = (1..=variants)
                    .map(|v| entity(json!({ "id": p * 1_000 + v, "title": format!("Variant {v}") })))
                    .collect();
                api.variants.insert((bp_id.clone(), p.to_string()), bp_variants);
            }
            api.providers.insert(bp_id, bp_providers);
        }
        api
    }

    pub fn fail_next(&self, key: &str, error: ApiError) {
        self.failures
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn answer<T>(&self, key: String, data: T) -> Result<T, ApiError> {
        self.calls.lock().unwrap().push(key.clone());
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        failure.map_or(Ok(data), Err)
    }
}

fn entity(value: serde_json::Value) -> CatalogEntity {
    CatalogEntity::from_value(value).expect("fixture has an id")
}

#[async_trait]
impl CatalogApi for FakeCatalogApi {
    async fn fetch_top_level_list(&self) -> Result<Vec<CatalogEntity>, ApiError> {
        self.answer("list".to_string(), self.blueprints.clone()).await
    }

    async fn fetch_providers_for(&self, blueprint_id: &str) -> Result<Vec<CatalogEntity>, ApiError> {
        let data = self.providers.get(blueprint_id).cloned().unwrap_or_default();
        self.answer(format!("providers:{blueprint_id}"), data).await
    }

    async fn fetch_variants_for(
        &self,
        blueprint_id: &str,
        provider_id: &str,
    ) -> Result<Vec<CatalogEntity>, ApiError> {
        let data = self
            .variants
            .get(&(blueprint_id.to_string(), provider_id.to_string()))
            .cloned()
            .unwrap_or_default();
        self.answer(format!("variants:{blueprint_id}:{provider_id}"), data).await
    }
}
