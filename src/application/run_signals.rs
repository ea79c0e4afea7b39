//! Request observer that checks stop flags around every upstream call

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::infrastructure::api_client::{ApiError, RequestObserver};
use crate::infrastructure::store_error::StoreResult;
use crate::infrastructure::sync_state_repository::SyncStateRepository;

/// Vetoes requests while an emergency stop or a force stop for the running
/// run is set, and records activity after each call.
///
/// Storage failures are logged and never block a request.
pub struct RunSignals {
    state: SyncStateRepository,
}

impl RunSignals {
    pub const fn new(state: SyncStateRepository) -> Self {
        Self { state }
    }

    async fn veto(&self) -> StoreResult<Option<&'static str>> {
        let run = self.state.load_run().await?;
        if !run.is_running() {
            return Ok(None);
        }
        let now = Utc::now();
        if self.state.emergency_stop_active(now).await? {
            return Ok(Some("emergency stop active"));
        }
        if let Some(run_id) = run.run_id.as_deref() {
            if self.state.force_stop_requested(run_id, now).await? {
                return Ok(Some("force stop requested"));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RequestObserver for RunSignals {
    async fn before_request(&self) -> Result<(), ApiError> {
        match self.veto().await {
            Ok(Some(reason)) => Err(ApiError::cancelled(reason)),
            Ok(None) => Ok(()),
            Err(e) => {
                warn!("Could not read stop signals before request: {}", e);
                Ok(())
            }
        }
    }

    async fn after_request(&self) {
        let run = match self.state.load_run().await {
            Ok(run) => run,
            Err(e) => {
                warn!("Could not read sync state after request: {}", e);
                return;
            }
        };
        if let (true, Some(run_id)) = (run.is_running(), run.run_id.as_deref()) {
            if let Err(e) = self.state.touch_run(run_id, Utc::now()).await {
                warn!("Could not record request activity: {}", e);
            }
        }
    }
}
