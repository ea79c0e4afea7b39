//! Catalog sync service - the operations exposed to callers
//!
//! Wraps the engine with the credential check and the status report. Every
//! status read runs the liveness check first, so an orphaned `running`
//! record is healed before it is reported.

use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::sync_engine::SyncEngine;
use crate::application::sync_error::{SyncError, SyncResult};
use crate::domain::catalog::CacheSummary;
use crate::domain::lease::ProcessHandle;
use crate::domain::sync_run::SyncRun;
use crate::infrastructure::api_client::CatalogApi;
use crate::infrastructure::config::{CredentialProvider, SyncConfig};
use crate::infrastructure::entity_store::EntityStore;
use crate::infrastructure::sync_state_repository::SyncStateRepository;

/// Run record plus the liveness facts behind it
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub run: SyncRun,
    pub alive: bool,
    pub lease: Option<ProcessHandle>,
    pub emergency_stop: bool,
}

pub struct CatalogSyncService {
    engine: Arc<SyncEngine>,
    credentials: Arc<dyn CredentialProvider>,
}

impl CatalogSyncService {
    pub fn new(
        pool: SqlitePool,
        api: Arc<dyn CatalogApi>,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Self {
        let store = EntityStore::new(pool.clone());
        let state = SyncStateRepository::new(pool);
        Self {
            engine: SyncEngine::new(api, store, state, config),
            credentials,
        }
    }

    /// State repository shared with the request observer
    pub fn state(&self) -> SyncStateRepository {
        self.engine.state().clone()
    }

    pub async fn start_sync(&self) -> SyncResult<SyncRun> {
        self.require_credentials()?;
        let run = self.engine.start().await?;
        info!("Sync accepted: {}/{} ({})", run.current_index, run.total_count, run.status);
        Ok(run)
    }

    pub async fn resume_sync(&self) -> SyncResult<SyncRun> {
        self.require_credentials()?;
        let run = self.engine.resume().await?;
        info!("Resume accepted at {}/{}", run.current_index, run.total_count);
        Ok(run)
    }

    pub async fn cancel_sync(&self, reason: Option<&str>) -> SyncResult<SyncRun> {
        self.engine.cancel(reason.unwrap_or("cancelled by operator")).await
    }

    pub async fn get_status(&self) -> SyncResult<StatusReport> {
        let alive = self.engine.liveness().is_alive().await?;
        let state = self.engine.state();
        Ok(StatusReport {
            run: self.engine.tracker().read().await?,
            alive,
            lease: state.load_lease().await?,
            emergency_stop: state.emergency_stop_active(chrono::Utc::now()).await?,
        })
    }

    /// Per-kind counts and latest rows of the mirrored catalog
    pub async fn get_summary(&self) -> SyncResult<CacheSummary> {
        let store = self.engine.store();
        store.ensure_schema().await?;
        Ok(store.summary().await?)
    }

    pub async fn reset_sync(&self) -> SyncResult<SyncRun> {
        self.engine.reset().await
    }

    pub async fn emergency_stop(&self) -> SyncResult<SyncRun> {
        self.engine.emergency_stop().await
    }

    /// Whether this process is currently driving a run
    pub async fn is_worker_active(&self) -> bool {
        self.engine.is_worker_active().await
    }

    fn require_credentials(&self) -> SyncResult<()> {
        if self.credentials.api_key().is_none() {
            warn!("Sync refused: no API key configured");
            return Err(SyncError::MissingCredentials);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::EntityKind;
    use crate::domain::sync_run::SyncStatus;
    use crate::infrastructure::config::StaticCredentials;
    use crate::test_utils::{FakeCatalogApi, TestDatabase, test_sync_config};
    use std::time::Duration;

    async fn service(api: FakeCatalogApi, credentials: StaticCredentials) -> (TestDatabase, CatalogSyncService) {
        let db = TestDatabase::new().await;
        let service = CatalogSyncService::new(
            db.pool(),
            Arc::new(api),
            Arc::new(credentials),
            test_sync_config(),
        );
        (db, service)
    }

    async fn until_finished(service: &CatalogSyncService) -> StatusReport {
        for _ in 0..500 {
            let report = service.get_status().await.unwrap();
            if report.run.status.is_terminal() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sync did not finish");
    }

    #[tokio::test]
    async fn test_start_requires_credentials() {
        let (_db, service) = service(FakeCatalogApi::with_catalog(1, 1, 1), StaticCredentials(None)).await;
        assert!(matches!(
            service.start_sync().await.unwrap_err(),
            SyncError::MissingCredentials
        ));
        assert!(matches!(
            service.resume_sync().await.unwrap_err(),
            SyncError::MissingCredentials
        ));

        let report = service.get_status().await.unwrap();
        assert_eq!(report.run.status, SyncStatus::Idle);
        assert!(!report.alive);
    }

    #[tokio::test]
    async fn test_sync_then_summary() {
        let (_db, service) = service(FakeCatalogApi::with_catalog(2, 2, 3), StaticCredentials::key("k")).await;

        service.start_sync().await.unwrap();
        let report = until_finished(&service).await;
        assert_eq!(report.run.status, SyncStatus::Completed);
        assert!(!report.alive);
        assert!(report.lease.is_none());

        let summary = service.get_summary().await.unwrap();
        assert_eq!(summary.get(EntityKind::Blueprint).count, 2);
        assert_eq!(summary.get(EntityKind::Provider).count, 4);
        assert_eq!(summary.get(EntityKind::Variant).count, 12);
    }

    #[tokio::test]
    async fn test_status_serialises_flat() {
        let (_db, service) = service(FakeCatalogApi::default(), StaticCredentials::key("k")).await;
        let value = serde_json::to_value(service.get_status().await.unwrap()).unwrap();

        assert_eq!(value["status"], "idle");
        assert_eq!(value["alive"], false);
        assert_eq!(value["emergency_stop"], false);
        assert!(value.get("percentage").is_some());
    }

    #[tokio::test]
    async fn test_cancel_without_run_reports_current_state() {
        let (_db, service) = service(FakeCatalogApi::default(), StaticCredentials::key("k")).await;
        let run = service.cancel_sync(None).await.unwrap();
        assert_eq!(run.status, SyncStatus::Idle);
        assert!(!service.is_worker_active().await);
    }
}
