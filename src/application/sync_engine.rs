//! Sync engine - walks blueprints → providers → variants in bounded chunks
//!
//! Lifecycle of a run:
//! 1. `start` checks single-flight through the liveness monitor, clears
//!    leftovers of earlier runs, fetches and stores the top-level work plan,
//!    claims the worker lease, marks the record running and hands the run to
//!    the chunk scheduler.
//! 2. Each chunk re-validates the run, renews the lease and processes up to
//!    `chunk_size` blueprints within the chunk time budget. Progress is
//!    written after every stored entity and `current_index` is checkpointed
//!    after every finished blueprint. A heartbeat ticker runs beside the
//!    chunk so slow upstream calls never look like a dead worker.
//! 3. The run ends as `completed`, `cancelled` or `error`. Transient upstream
//!    failures back off and retry the chunk instead of failing the run.

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::liveness_monitor::LivenessMonitor;
use crate::application::progress_tracker::ProgressTracker;
use crate::application::scheduler::{ChunkOutcome, ChunkRunner, ChunkScheduler};
use crate::application::sync_error::{SyncError, SyncResult};
use crate::application::worker_slot::WorkerSlot;
use crate::domain::catalog::{CatalogEntity, CatalogRecord};
use crate::domain::sync_run::{SyncRun, SyncRunPatch, SyncStatus, phase};
use crate::infrastructure::api_client::{ApiError, CatalogApi};
use crate::infrastructure::config::SyncConfig;
use crate::infrastructure::entity_store::EntityStore;
use crate::infrastructure::sync_state_repository::{FORCE_STOP_SIGNAL, SyncStateRepository};

pub struct SyncEngine {
    api: Arc<dyn CatalogApi>,
    store: EntityStore,
    state: SyncStateRepository,
    tracker: Arc<ProgressTracker>,
    liveness: Arc<LivenessMonitor>,
    scheduler: ChunkScheduler,
    config: SyncConfig,
    /// Serialises start, resume and reset
    control_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn CatalogApi>,
        store: EntityStore,
        state: SyncStateRepository,
        config: SyncConfig,
    ) -> Arc<Self> {
        let tracker = Arc::new(ProgressTracker::new(state.clone()));
        let slot = Arc::new(WorkerSlot::new());
        let liveness = Arc::new(LivenessMonitor::new(
            tracker.clone(),
            state.clone(),
            slot.clone(),
            config.clone(),
        ));
        let scheduler = ChunkScheduler::new(slot, config.chunk_interval(), config.idle_heartbeat_interval());

        Arc::new(Self {
            api,
            store,
            state,
            tracker,
            liveness,
            scheduler,
            config,
            control_lock: Mutex::new(()),
        })
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn liveness(&self) -> &Arc<LivenessMonitor> {
        &self.liveness
    }

    pub fn state(&self) -> &SyncStateRepository {
        &self.state
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Whether this process is currently driving a run
    pub async fn is_worker_active(&self) -> bool {
        self.scheduler.slot().is_occupied().await
    }

    // ===============================
    // CONTROL OPERATIONS
    // ===============================

    /// Start a new run from the first blueprint
    pub async fn start(self: &Arc<Self>) -> SyncResult<SyncRun> {
        let _guard = self.control_lock.lock().await;
        self.reject_if_alive().await?;

        self.store.ensure_schema().await?;
        self.clear_leftovers().await?;
        self.state.clear_all_signals().await?;
        self.state.clear_plan().await?;

        info!("🚀 Starting catalog sync, fetching blueprint list");
        let blueprints = self.api.fetch_top_level_list().await.map_err(|e| {
            error!("❌ Could not fetch blueprint list, sync not started: {}", e);
            e
        })?;

        self.state.save_plan(&blueprints).await?;
        let run_id = Uuid::new_v4().to_string();
        self.launch(&run_id, 0, blueprints.len() as u64, false).await
    }

    /// Continue a cancelled, failed or orphaned run from its checkpoint
    pub async fn resume(self: &Arc<Self>) -> SyncResult<SyncRun> {
        let _guard = self.control_lock.lock().await;
        self.reject_if_alive().await?;

        let previous = self.tracker.read().await?;
        if !matches!(previous.status, SyncStatus::Cancelled | SyncStatus::Error) {
            return Err(SyncError::NothingToResume(format!("sync is {}", previous.status)));
        }
        if !previous.has_resumable_position() {
            return Err(SyncError::NothingToResume(format!(
                "no open position ({}/{})",
                previous.current_index, previous.total_count
            )));
        }
        if self.state.emergency_stop_active(Utc::now()).await? {
            warn!("Resume rejected, emergency stop is still active");
            return Err(SyncError::EmergencyStopActive);
        }

        self.store.ensure_schema().await?;
        self.clear_leftovers().await?;

        let mut total = self.state.plan_len().await?;
        if total == 0 {
            info!("No stored work plan, fetching blueprint list again");
            let blueprints = self.api.fetch_top_level_list().await?;
            self.state.save_plan(&blueprints).await?;
            total = blueprints.len() as u64;
            if total != previous.total_count {
                info!(
                    "Blueprint count changed since the run started: {} → {}",
                    previous.total_count, total
                );
            }
        }

        let index = previous.current_index.min(total);
        let run_id = Uuid::new_v4().to_string();
        self.launch(&run_id, index, total, true).await
    }

    /// Stop any run and record `cancelled`. Succeeds when nothing runs.
    pub async fn cancel(&self, reason: &str) -> SyncResult<SyncRun> {
        if !self.liveness.force_terminate(reason).await? {
            debug!("Cancel requested with nothing running");
        }
        Ok(self.tracker.read().await?)
    }

    /// Return a finished record to idle and drop plan, lease and flags
    pub async fn reset(&self) -> SyncResult<SyncRun> {
        let _guard = self.control_lock.lock().await;
        self.reject_if_alive().await?;

        self.clear_leftovers().await?;
        self.state.clear_all_signals().await?;
        self.state.clear_plan().await?;
        Ok(self.tracker.reset().await?)
    }

    /// Set the global stop flag and terminate whatever runs
    pub async fn emergency_stop(&self) -> SyncResult<SyncRun> {
        let until = Utc::now() + self.config.emergency_stop_ttl();
        self.state.set_emergency_stop(until).await?;
        warn!("🚨 Emergency stop active until {}", until);

        self.liveness.force_terminate("emergency stop").await?;
        Ok(self.tracker.read().await?)
    }

    async fn reject_if_alive(&self) -> SyncResult<()> {
        if !self.liveness.is_alive().await? {
            return Ok(());
        }
        let run = self.tracker.read().await?;
        warn!(
            "Sync request rejected, run {} is live at {}/{}",
            run.run_id.as_deref().unwrap_or("-"),
            run.current_index,
            run.total_count
        );
        Err(SyncError::AlreadyRunning {
            run_id: run.run_id.unwrap_or_default(),
            current_index: run.current_index,
            total_count: run.total_count,
        })
    }

    /// Drop state a crashed or finished run may have left behind.
    /// The emergency stop flag is left alone.
    async fn clear_leftovers(&self) -> SyncResult<()> {
        self.scheduler
            .slot()
            .terminate(self.config.termination_grace())
            .await;
        self.state.clear_signal(FORCE_STOP_SIGNAL).await?;
        self.state.clear_lease().await?;
        Ok(())
    }

    async fn launch(self: &Arc<Self>, run_id: &str, index: u64, total: u64, resumed: bool) -> SyncResult<SyncRun> {
        if !self.liveness.acquire_lease(run_id).await? {
            return Err(SyncError::InvalidState(
                "worker lease is held by another process".to_string(),
            ));
        }

        let run = if resumed {
            self.tracker.mark_resumed(run_id, index, total).await?
        } else {
            self.tracker.mark_running(run_id, total).await?
        };

        if index >= total {
            self.finish_complete(run_id).await?;
            return Ok(self.tracker.read().await?);
        }

        let runner: Arc<dyn ChunkRunner> = self.clone();
        if !self.scheduler.schedule(runner, run_id, Duration::ZERO).await {
            let message = "a chunk driver is already active in this process";
            self.fail(run_id, message).await?;
            return Err(SyncError::InvalidState(message.to_string()));
        }
        Ok(run)
    }

    // ===============================
    // CHUNK EXECUTION
    // ===============================

    async fn execute_chunk(&self, run_id: &str, token: &CancellationToken) -> SyncResult<ChunkOutcome> {
        if token.is_cancelled() {
            return Ok(ChunkOutcome::Stop);
        }

        let run = self.tracker.read().await?;
        if !run.is_running_for(run_id) {
            debug!("Run {} is no longer running, nothing to do", run_id);
            return Ok(ChunkOutcome::Stop);
        }

        self.check_stop_signals(run_id).await?;

        if !self.liveness.heartbeat(run_id).await? {
            warn!("Run {} lost its worker lease, stopping", run_id);
            return Ok(ChunkOutcome::Stop);
        }

        let total = run.total_count;
        let first = run.current_index;
        let batch = self
            .state
            .plan_slice(first, self.config.chunk_size.max(1))
            .await?;
        if batch.is_empty() && first < total {
            return Err(SyncError::InvalidState(format!(
                "work plan has no entry at position {first}"
            )));
        }

        info!(
            "📦 Run {}: chunk starting at {}/{} ({} blueprints queued)",
            run_id,
            first,
            total,
            batch.len()
        );
        let now = Utc::now();
        let entered = self
            .tracker
            .update_running(
                run_id,
                SyncRunPatch::new()
                    .phase(phase::PROCESSING_BLUEPRINTS)
                    .chunk_started_at(Some(now))
                    .next_chunk_at(None)
                    .last_activity(now),
            )
            .await?;
        if !entered {
            return Ok(ChunkOutcome::Stop);
        }

        let budget = self.config.chunk_time_budget();
        let started = Instant::now();
        let mut index = first;

        for blueprint in &batch {
            if index > first && started.elapsed() >= budget {
                info!(
                    "Chunk time budget of {:?} used after {} blueprints",
                    budget,
                    index - first
                );
                break;
            }
            if token.is_cancelled() {
                return Ok(ChunkOutcome::Stop);
            }

            if !self.process_blueprint(run_id, index, total, blueprint, token).await? {
                return Ok(ChunkOutcome::Stop);
            }

            index += 1;
            let checkpointed = self
                .tracker
                .update_running(
                    run_id,
                    SyncRunPatch::new().current_index(index).last_activity(Utc::now()),
                )
                .await?;
            if !checkpointed {
                return Ok(ChunkOutcome::Stop);
            }
        }

        if index >= total {
            self.finish_complete(run_id).await?;
            return Ok(ChunkOutcome::Stop);
        }

        let now = Utc::now();
        let next_chunk_at = now + chrono::Duration::from_std(self.config.chunk_interval()).unwrap_or_default();
        let waiting = self
            .tracker
            .update_running(
                run_id,
                SyncRunPatch::new()
                    .phase(phase::WAITING_NEXT_CHUNK)
                    .current_item(format!("Waiting for next chunk ({index}/{total})"))
                    .retry_count(0)
                    .retry_reason(None)
                    .chunk_started_at(None)
                    .next_chunk_at(Some(next_chunk_at))
                    .last_activity(now),
            )
            .await?;

        debug!("Run {}: chunk finished at {}/{}", run_id, index, total);
        Ok(if waiting {
            ChunkOutcome::Continue
        } else {
            ChunkOutcome::Stop
        })
    }

    /// Store one blueprint and fully expand it.
    ///
    /// Returns `false` when the run was taken away mid-way.
    async fn process_blueprint(
        &self,
        run_id: &str,
        index: u64,
        total: u64,
        blueprint: &CatalogEntity,
        token: &CancellationToken,
    ) -> SyncResult<bool> {
        let position = index + 1;
        let label = blueprint.label();

        self.store.upsert(&CatalogRecord::blueprint(blueprint)).await?;
        if !self
            .progress(run_id, phase::PROCESSING_BLUEPRINTS, format!("Blueprint {position}/{total}: {label}"))
            .await?
        {
            return Ok(false);
        }

        let providers = guarded(token, self.api.fetch_providers_for(&blueprint.id)).await?;
        debug!("Blueprint {} has {} providers", blueprint.id, providers.len());

        for provider in &providers {
            self.store
                .upsert(&CatalogRecord::provider(&blueprint.id, provider))
                .await?;
            if !self
                .progress(
                    run_id,
                    phase::PROCESSING_PROVIDERS,
                    format!("Blueprint {position}/{total}: {label}, provider {}", provider.label()),
                )
                .await?
            {
                return Ok(false);
            }

            let variants = guarded(
                token,
                self.api.fetch_variants_for(&blueprint.id, &provider.id),
            )
            .await?;

            let variant_count = variants.len();
            for (n, variant) in variants.iter().enumerate() {
                self.store
                    .upsert(&CatalogRecord::variant(&blueprint.id, &provider.id, variant))
                    .await?;
                if !self
                    .progress(
                        run_id,
                        phase::PROCESSING_VARIANTS,
                        format!(
                            "Blueprint {position}/{total}: {label}, provider {}, variant {}/{variant_count}",
                            provider.id,
                            n + 1
                        ),
                    )
                    .await?
                {
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    async fn progress(&self, run_id: &str, phase: &str, item: String) -> SyncResult<bool> {
        Ok(self
            .tracker
            .update_running(
                run_id,
                SyncRunPatch::new()
                    .phase(phase)
                    .current_item(item)
                    .last_activity(Utc::now()),
            )
            .await?)
    }

    async fn check_stop_signals(&self, run_id: &str) -> SyncResult<()> {
        let now = Utc::now();
        if self.state.emergency_stop_active(now).await? {
            return Err(ApiError::cancelled("emergency stop active").into());
        }
        if self.state.force_stop_requested(run_id, now).await? {
            return Err(ApiError::cancelled("force stop requested").into());
        }
        Ok(())
    }

    // ===============================
    // OUTCOMES
    // ===============================

    async fn handle_failure(&self, run_id: &str, token: &CancellationToken, failure: SyncError) -> ChunkOutcome {
        if token.is_cancelled() {
            debug!("Run {} stopped by its controller: {}", run_id, failure);
            return ChunkOutcome::Stop;
        }

        let recorded = match &failure {
            SyncError::Api(ApiError::Cancelled { reason }) => self
                .finish_cancelled(run_id, reason)
                .await
                .map(|()| ChunkOutcome::Stop),
            SyncError::Api(api_error) if api_error.is_transient() => {
                self.schedule_retry(run_id, api_error).await
            }
            _ => self
                .fail(run_id, &failure.to_string())
                .await
                .map(|()| ChunkOutcome::Stop),
        };

        recorded.unwrap_or_else(|e| {
            error!("Could not record the outcome of run {}: {}", run_id, e);
            ChunkOutcome::Stop
        })
    }

    async fn schedule_retry(&self, run_id: &str, failure: &ApiError) -> SyncResult<ChunkOutcome> {
        let run = self.tracker.read().await?;
        let attempt = run.retry_count + 1;
        if attempt > self.config.max_transient_retries {
            self.fail(
                run_id,
                &format!("Giving up after {} transient failures: {failure}", run.retry_count),
            )
            .await?;
            return Ok(ChunkOutcome::Stop);
        }

        let delay = transient_backoff(&self.config, attempt);
        let now = Utc::now();
        warn!(
            "⚠️  Run {}: transient failure (attempt {}/{}): {}. Retrying in {:?}",
            run_id, attempt, self.config.max_transient_retries, failure, delay
        );

        let updated = self
            .tracker
            .update_running(
                run_id,
                SyncRunPatch::new()
                    .phase(phase::RETRY_BACKOFF)
                    .current_item(format!("Retrying in {}s after: {failure}", delay.as_secs()))
                    .retry_count(attempt)
                    .retry_reason(Some(failure.to_string()))
                    .chunk_started_at(None)
                    .next_chunk_at(Some(now + chrono::Duration::from_std(delay).unwrap_or_default()))
                    .last_activity(now),
            )
            .await?;

        Ok(if updated {
            ChunkOutcome::RetryAfter(delay)
        } else {
            ChunkOutcome::Stop
        })
    }

    async fn fail(&self, run_id: &str, message: &str) -> SyncResult<()> {
        error!("❌ Sync run {} failed: {}", run_id, message);
        self.tracker.mark_error(run_id, message).await?;
        self.liveness.release_lease().await?;
        Ok(())
    }

    async fn finish_cancelled(&self, run_id: &str, reason: &str) -> SyncResult<()> {
        if self.tracker.read().await?.is_running_for(run_id) {
            self.tracker.mark_cancelled(reason).await?;
        }
        self.liveness.release_lease().await?;
        self.state.clear_plan().await?;
        self.state.clear_signal(FORCE_STOP_SIGNAL).await?;
        Ok(())
    }

    async fn finish_complete(&self, run_id: &str) -> SyncResult<()> {
        if self.tracker.mark_complete(run_id).await? {
            info!("✅ Sync run {} completed", run_id);
        }
        self.liveness.release_lease().await?;
        self.state.clear_plan().await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkRunner for SyncEngine {
    async fn run_chunk(&self, run_id: &str, token: &CancellationToken) -> ChunkOutcome {
        let chunk = self.execute_chunk(run_id, token);
        tokio::pin!(chunk);

        // A single upstream call may outlast the stale threshold, so the
        // record and lease are refreshed while the chunk is in flight.
        let mut ticker = tokio::time::interval(self.config.idle_heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        // Once the run is no longer ours the ticker stops; the chunk still
        // finishes on its own since its writes are conditional on the run id.
        let mut beating = true;
        let result = loop {
            tokio::select! {
                result = &mut chunk => break result,
                _ = ticker.tick(), if beating => {
                    beating = self.idle_heartbeat(run_id).await;
                }
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(failure) => self.handle_failure(run_id, token, failure).await,
        }
    }

    async fn idle_heartbeat(&self, run_id: &str) -> bool {
        match self.liveness.heartbeat(run_id).await {
            Ok(true) => true,
            Ok(false) => {
                info!("Run {} is no longer ours, stopping driver", run_id);
                false
            }
            Err(e) => {
                warn!("Heartbeat for run {} failed: {}", run_id, e);
                true
            }
        }
    }
}

/// Race an upstream call against the driver's cancellation token
async fn guarded<T, F>(token: &CancellationToken, call: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    tokio::select! {
        result = call => result,
        () = token.cancelled() => Err(ApiError::cancelled("worker cancelled")),
    }
}

/// `base * 2^(attempt-1)` plus up to 10% jitter, capped at the configured maximum
pub fn transient_backoff(config: &SyncConfig, attempt: u32) -> Duration {
    let base = Duration::from_secs(config.transient_backoff_seconds);
    let cap = Duration::from_secs(config.max_backoff_seconds.max(config.transient_backoff_seconds));
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exponent).min(cap);

    let jitter_ms = u64::try_from(delay.as_millis() / 10).unwrap_or(0);
    let jitter = Duration::from_millis(fastrand::u64(0..=jitter_ms));
    (delay + jitter).min(cap)
}
