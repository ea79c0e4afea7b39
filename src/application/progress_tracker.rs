//! Progress tracker - the single writer path for the sync run record
//!
//! Every state change goes through here. Unconditional writes are serialised
//! by an in-process lock; writes issued on behalf of a worker are
//! compare-and-set against the stored run id, so a worker that lost its run
//! (cancelled, orphaned, replaced) can never write it back to `running`.

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::sync_run::{SyncRun, SyncRunPatch, SyncStatus, phase};
use crate::infrastructure::store_error::StoreResult;
use crate::infrastructure::sync_state_repository::SyncStateRepository;

pub struct ProgressTracker {
    repository: SyncStateRepository,
    write_lock: Mutex<()>,
}

impl ProgressTracker {
    pub fn new(repository: SyncStateRepository) -> Self {
        Self {
            repository,
            write_lock: Mutex::new(()),
        }
    }

    /// Current record with defaults filled in
    pub async fn read(&self) -> StoreResult<SyncRun> {
        self.repository.load_run().await
    }

    /// Merge `patch` into the stored record
    pub async fn write(&self, patch: SyncRunPatch) -> StoreResult<SyncRun> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.repository.load_run().await?;
        run.apply(patch);
        self.repository.save_run(&run).await?;
        Ok(run)
    }

    /// Start a fresh record for `run_id` at index 0
    pub async fn mark_running(&self, run_id: &str, total_count: u64) -> StoreResult<SyncRun> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut run = SyncRun::default();
        run.apply(SyncRunPatch {
            run_id: Some(Some(run_id.to_string())),
            started_at: Some(Some(now)),
            ..SyncRunPatch::new()
                .status(SyncStatus::Running)
                .phase(phase::PROCESSING_BLUEPRINTS)
                .current_item(format!("Starting sync of {total_count} blueprints"))
                .current_index(0)
                .total_count(total_count)
                .last_activity(now)
        });
        self.repository.save_run(&run).await?;
        info!("📊 Sync run {} marked running ({} blueprints)", run_id, total_count);
        Ok(run)
    }

    /// Put an existing record back to running under a new run id, keeping its position
    pub async fn mark_resumed(
        &self,
        run_id: &str,
        current_index: u64,
        total_count: u64,
    ) -> StoreResult<SyncRun> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut run = self.repository.load_run().await?;
        let started_at = run.started_at.unwrap_or(now);
        run.apply(SyncRunPatch {
            run_id: Some(Some(run_id.to_string())),
            started_at: Some(Some(started_at)),
            ..SyncRunPatch::new()
                .status(SyncStatus::Running)
                .phase(phase::PROCESSING_BLUEPRINTS)
                .current_item(format!("Resuming at {current_index}/{total_count}"))
                .current_index(current_index)
                .total_count(total_count)
                .retry_count(0)
                .error(None)
                .retry_reason(None)
                .cancel_reason(None)
                .chunk_started_at(None)
                .next_chunk_at(None)
                .finished_at(None)
                .last_activity(now)
        });
        self.repository.save_run(&run).await?;
        info!("📊 Sync run {} resumed at {}/{}", run_id, current_index, total_count);
        Ok(run)
    }

    /// Apply `patch` only while the record is still running `run_id`.
    ///
    /// Returns `false` (and writes nothing) once the run has moved on.
    pub async fn update_running(&self, run_id: &str, patch: SyncRunPatch) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.repository.load_run().await?;
        if !run.is_running_for(run_id) {
            debug!("Skipping progress update for inactive run {}", run_id);
            return Ok(false);
        }
        run.apply(patch);
        self.repository.save_run_if_running(&run, run_id).await
    }

    /// Refresh `last_activity` for a running run
    pub async fn touch(&self, run_id: &str) -> StoreResult<bool> {
        self.repository.touch_run(run_id, Utc::now()).await
    }

    /// Transition a running record to `cancelled`.
    ///
    /// Counters are kept. Returns `false` when there was nothing running, which
    /// leaves an existing cancellation (and its timestamp) untouched.
    pub async fn mark_cancelled(&self, reason: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.repository.load_run().await?;
        if !run.is_running() {
            return Ok(false);
        }
        let now = Utc::now();
        run.apply(
            SyncRunPatch::new()
                .status(SyncStatus::Cancelled)
                .phase(phase::CANCELLED)
                .current_item(format!("Cancelled: {reason}"))
                .cancel_reason(Some(reason.to_string()))
                .chunk_started_at(None)
                .next_chunk_at(None)
                .finished_at(Some(now))
                .last_activity(now),
        );
        self.repository.save_run(&run).await?;
        info!(
            "🛑 Sync run {} cancelled at {}/{}: {}",
            run.run_id.as_deref().unwrap_or("-"),
            run.current_index,
            run.total_count,
            reason
        );
        Ok(true)
    }

    /// Record a terminal error for `run_id`
    pub async fn mark_error(&self, run_id: &str, message: &str) -> StoreResult<bool> {
        let now = Utc::now();
        self.update_running(
            run_id,
            SyncRunPatch::new()
                .status(SyncStatus::Error)
                .phase(phase::ERROR)
                .current_item("Sync failed")
                .error(Some(message.to_string()))
                .chunk_started_at(None)
                .next_chunk_at(None)
                .finished_at(Some(now))
                .last_activity(now),
        )
        .await
    }

    /// Record completion of `run_id`; the index is moved to the bound
    pub async fn mark_complete(&self, run_id: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut run = self.repository.load_run().await?;
        if !run.is_running_for(run_id) {
            return Ok(false);
        }
        let now = Utc::now();
        let total = run.total_count;
        run.apply(
            SyncRunPatch::new()
                .status(SyncStatus::Completed)
                .phase(phase::COMPLETED)
                .current_item(format!("Synced {total} blueprints"))
                .current_index(total)
                .retry_count(0)
                .retry_reason(None)
                .chunk_started_at(None)
                .next_chunk_at(None)
                .finished_at(Some(now))
                .last_activity(now),
        );
        self.repository.save_run_if_running(&run, run_id).await
    }

    /// Back to idle defaults
    pub async fn reset(&self) -> StoreResult<SyncRun> {
        let _guard = self.write_lock.lock().await;
        let run = SyncRun::default();
        self.repository.save_run(&run).await?;
        info!("🔄 Sync state reset to idle");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[tokio::test]
    async fn test_read_without_record_gives_idle_defaults() {
        let ctx = TestContext::new().await;
        let run = ctx.tracker.read().await.unwrap();
        assert_eq!(run.status, SyncStatus::Idle);
        assert_eq!(run.phase, phase::IDLE);
        assert!((run.percentage - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_write_merges_patch_into_stored_record() {
        let ctx = TestContext::new().await;
        let started = ctx.tracker.mark_running("run-1", 8).await.unwrap();

        let written = ctx
            .tracker
            .write(SyncRunPatch::new().current_index(2).current_item("Blueprint 3"))
            .await
            .unwrap();
        assert_eq!(written.current_index, 2);
        assert_eq!(written.current_item, "Blueprint 3");
        assert!((written.percentage - 25.0).abs() < f64::EPSILON);
        // Fields outside the patch survive
        assert_eq!(written.run_id, started.run_id);
        assert_eq!(written.status, SyncStatus::Running);
        assert_eq!(written.started_at, started.started_at);
        assert_eq!(written.total_count, 8);

        ctx.tracker
            .write(SyncRunPatch::new().phase(phase::WAITING_NEXT_CHUNK))
            .await
            .unwrap();
        let stored = ctx.tracker.read().await.unwrap();
        assert_eq!(stored.phase, phase::WAITING_NEXT_CHUNK);
        assert_eq!(stored.current_index, 2);
        assert_eq!(stored.current_item, "Blueprint 3");
    }

    #[tokio::test]
    async fn test_update_running_ignores_other_runs() {
        let ctx = TestContext::new().await;
        ctx.tracker.mark_running("run-1", 10).await.unwrap();

        assert!(!ctx
            .tracker
            .update_running("run-0", SyncRunPatch::new().current_index(9))
            .await
            .unwrap());
        assert!(ctx
            .tracker
            .update_running("run-1", SyncRunPatch::new().current_index(4))
            .await
            .unwrap());

        let run = ctx.tracker.read().await.unwrap();
        assert_eq!(run.current_index, 4);
        assert!((run.percentage - 40.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_keeps_first_timestamp() {
        let ctx = TestContext::new().await;
        ctx.tracker.mark_running("run-1", 10).await.unwrap();
        ctx.tracker
            .update_running("run-1", SyncRunPatch::new().current_index(3))
            .await
            .unwrap();

        assert!(ctx.tracker.mark_cancelled("operator").await.unwrap());
        let first = ctx.tracker.read().await.unwrap();
        assert!(!ctx.tracker.mark_cancelled("operator again").await.unwrap());
        let second = ctx.tracker.read().await.unwrap();

        assert_eq!(second.status, SyncStatus::Cancelled);
        assert_eq!(second.finished_at, first.finished_at);
        assert_eq!(second.cancel_reason.as_deref(), Some("operator"));
        assert_eq!(second.current_index, 3);
    }

    #[tokio::test]
    async fn test_terminal_state_blocks_worker_writes() {
        let ctx = TestContext::new().await;
        ctx.tracker.mark_running("run-1", 2).await.unwrap();
        ctx.tracker.mark_cancelled("stop").await.unwrap();

        assert!(!ctx.tracker.mark_complete("run-1").await.unwrap());
        assert!(!ctx.tracker.mark_error("run-1", "boom").await.unwrap());
        assert!(!ctx.tracker.touch("run-1").await.unwrap());
        assert_eq!(ctx.tracker.read().await.unwrap().status, SyncStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_complete_reports_full_percentage() {
        let ctx = TestContext::new().await;
        ctx.tracker.mark_running("run-1", 3).await.unwrap();
        assert!(ctx.tracker.mark_complete("run-1").await.unwrap());

        let run = ctx.tracker.read().await.unwrap();
        assert_eq!(run.status, SyncStatus::Completed);
        assert_eq!(run.current_index, 3);
        assert!((run.percentage - 100.0).abs() < f64::EPSILON);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_resume_keeps_position_and_start_time() {
        let ctx = TestContext::new().await;
        let started = ctx.tracker.mark_running("run-1", 10).await.unwrap().started_at;
        ctx.tracker
            .update_running("run-1", SyncRunPatch::new().current_index(4))
            .await
            .unwrap();
        ctx.tracker.mark_error("run-1", "HTTP 500").await.unwrap();

        let resumed = ctx.tracker.mark_resumed("run-2", 4, 10).await.unwrap();
        assert!(resumed.is_running_for("run-2"));
        assert_eq!(resumed.current_index, 4);
        assert_eq!(resumed.started_at, started);
        assert!(resumed.error.is_none());
        assert!(resumed.finished_at.is_none());
    }
}
