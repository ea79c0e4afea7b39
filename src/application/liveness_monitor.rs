//! Liveness monitor - decides whether a `running` record is backed by live work
//!
//! A run is alive only while all of these hold:
//! - the record says `running`
//! - a worker lease for that run exists and has not expired
//! - the last recorded activity is younger than the stale threshold
//! - when a chunk runtime ceiling is configured, the executing chunk is within it
//!
//! Anything else found `running` is orphaned and is force-terminated before
//! its status is reported, so observers never see a stale "running".

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::progress_tracker::ProgressTracker;
use crate::application::worker_slot::{TerminationOutcome, WorkerSlot};
use crate::domain::lease::ProcessHandle;
use crate::domain::sync_run::SyncRun;
use crate::infrastructure::config::SyncConfig;
use crate::infrastructure::store_error::StoreResult;
use crate::infrastructure::sync_state_repository::{FORCE_STOP_SIGNAL, SyncStateRepository};

const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// Nothing claims to be running
    Idle,
    Alive,
    /// The record says running but nothing backs it
    Orphaned(String),
}

/// Pure liveness assessment of a record and its lease at `now`
pub fn assess(
    run: &SyncRun,
    lease: Option<&ProcessHandle>,
    now: DateTime<Utc>,
    config: &SyncConfig,
) -> Liveness {
    if !run.is_running() {
        return Liveness::Idle;
    }

    let Some(lease) = lease else {
        return Liveness::Orphaned("no worker lease".to_string());
    };
    if run.run_id.as_deref() != Some(lease.run_id.as_str()) {
        return Liveness::Orphaned(format!("lease belongs to run {}", lease.run_id));
    }
    if lease.is_expired(now) {
        return Liveness::Orphaned(format!("worker lease expired at {}", lease.expires_at));
    }

    match run.idle_for(now) {
        None => return Liveness::Orphaned("no recorded activity".to_string()),
        Some(idle) if idle >= config.stale_threshold() => {
            return Liveness::Orphaned(format!("no activity for {}s", idle.num_seconds()));
        }
        Some(_) => {}
    }

    if let (Some(ceiling), Some(chunk_started)) = (config.max_chunk_runtime(), run.chunk_started_at) {
        let elapsed = now - chunk_started;
        if elapsed >= ceiling {
            return Liveness::Orphaned(format!(
                "chunk running for {}s, over the {}s ceiling",
                elapsed.num_seconds(),
                ceiling.num_seconds()
            ));
        }
    }

    Liveness::Alive
}

pub struct LivenessMonitor {
    tracker: Arc<ProgressTracker>,
    state: SyncStateRepository,
    slot: Arc<WorkerSlot>,
    config: SyncConfig,
    worker_id: String,
}

impl LivenessMonitor {
    pub fn new(
        tracker: Arc<ProgressTracker>,
        state: SyncStateRepository,
        slot: Arc<WorkerSlot>,
        config: SyncConfig,
    ) -> Self {
        Self {
            tracker,
            state,
            slot,
            config,
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    /// Identifier of this process's worker, written into leases it acquires
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Assess the stored record without side effects
    pub async fn check(&self) -> StoreResult<(SyncRun, Liveness)> {
        let run = self.tracker.read().await?;
        let lease = self.state.load_lease().await?;
        let liveness = assess(&run, lease.as_ref(), Utc::now(), &self.config);
        Ok((run, liveness))
    }

    /// Whether a live run exists. An orphaned run is healed to `cancelled` first.
    pub async fn is_alive(&self) -> StoreResult<bool> {
        let (_, liveness) = self.check().await?;
        match liveness {
            Liveness::Alive => Ok(true),
            Liveness::Idle => Ok(false),
            Liveness::Orphaned(reason) => {
                warn!("⚠️  Orphaned sync run detected: {}", reason);
                self.force_terminate(&format!("orphaned run: {reason}")).await?;
                Ok(false)
            }
        }
    }

    /// Claim the lease for `run_id`. Fails if another worker holds a live lease.
    pub async fn acquire_lease(&self, run_id: &str) -> StoreResult<bool> {
        let now = Utc::now();
        let lease = ProcessHandle::new(run_id, &self.worker_id, self.config.lease_ttl(), now);
        let acquired = self.state.try_acquire_lease(&lease, now).await?;
        if acquired {
            debug!("Lease for run {} acquired by worker {}", run_id, self.worker_id);
        }
        Ok(acquired)
    }

    /// Renew this worker's lease and refresh `last_activity`.
    ///
    /// Returns `false` when the lease is no longer ours or the run has ended.
    pub async fn heartbeat(&self, run_id: &str) -> StoreResult<bool> {
        let expires_at = Utc::now() + self.config.lease_ttl();
        if !self.state.renew_lease(run_id, &self.worker_id, expires_at).await? {
            return Ok(false);
        }
        self.tracker.touch(run_id).await
    }

    pub async fn release_lease(&self) -> StoreResult<()> {
        if self.state.release_lease(&self.worker_id).await? {
            debug!("Lease released by worker {}", self.worker_id);
        }
        Ok(())
    }

    /// Stop whatever is running and record `cancelled`.
    ///
    /// The local driver is cancelled, then aborted after the grace period. A
    /// worker in another process is asked to stop through the force-stop
    /// signal and given the grace period to release its lease. The lease and
    /// work plan are then cleared regardless. Safe to call when nothing runs.
    ///
    /// Returns `true` when something was actually stopped.
    pub async fn force_terminate(&self, reason: &str) -> StoreResult<bool> {
        let run = self.tracker.read().await?;
        let lease = self.state.load_lease().await?;
        let local_driver = self.slot.is_occupied().await;

        if !run.is_running() && lease.is_none() && !local_driver {
            debug!("Force terminate requested with nothing running");
            return Ok(false);
        }

        info!("🛑 Force terminating sync: {}", reason);

        if let (true, Some(run_id)) = (run.is_running(), run.run_id.as_deref()) {
            self.state.request_force_stop(run_id).await?;
        }

        let grace = self.config.termination_grace();
        let outcome = self.slot.terminate(grace).await;
        debug!("Local driver termination: {:?}", outcome);

        if outcome == TerminationOutcome::NotRunning {
            if let Some(lease) = lease.filter(|l| !l.is_held_by(&self.worker_id) && !l.is_expired(Utc::now())) {
                self.wait_for_lease_release(&lease, grace).await?;
            }
        }

        self.state.clear_lease().await?;
        self.state.clear_plan().await?;
        let cancelled = self.tracker.mark_cancelled(reason).await?;
        self.state.clear_signal(FORCE_STOP_SIGNAL).await?;

        Ok(cancelled || outcome != TerminationOutcome::NotRunning)
    }

    async fn wait_for_lease_release(&self, lease: &ProcessHandle, grace: Duration) -> StoreResult<()> {
        info!(
            "Waiting up to {:?} for worker {} (pid {}) to release run {}",
            grace, lease.worker_id, lease.pid, lease.run_id
        );
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match self.state.load_lease().await? {
                Some(current) if current.worker_id == lease.worker_id => {
                    tokio::time::sleep(LEASE_POLL_INTERVAL).await;
                }
                _ => {
                    debug!("Worker {} released its lease", lease.worker_id);
                    return Ok(());
                }
            }
        }
        warn!(
            "Worker {} did not release its lease within {:?}, clearing it",
            lease.worker_id, grace
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sync_run::{SyncRunPatch, SyncStatus};
    use crate::test_utils::TestContext;
    use chrono::Duration as ChronoDuration;
    use rstest::rstest;

    fn running(run_id: &str, last_activity: DateTime<Utc>) -> SyncRun {
        let mut run = SyncRun::default();
        run.apply(SyncRunPatch {
            run_id: Some(Some(run_id.to_string())),
            ..SyncRunPatch::new()
                .status(SyncStatus::Running)
                .total_count(10)
                .last_activity(last_activity)
        });
        run
    }

    #[rstest]
    #[case::fresh(5, 60, true)]
    #[case::just_under_threshold(119, 60, true)]
    #[case::stale(121, 60, false)]
    #[case::lease_expired(5, -1, false)]
    fn test_assess_matrix(#[case] idle_secs: i64, #[case] lease_left_secs: i64, #[case] alive: bool) {
        let now = Utc::now();
        let config = SyncConfig::default();
        let run = running("run-1", now - ChronoDuration::seconds(idle_secs));
        let mut lease = ProcessHandle::new("run-1", "w", ChronoDuration::seconds(3600), now);
        lease.expires_at = now + ChronoDuration::seconds(lease_left_secs);

        let liveness = assess(&run, Some(&lease), now, &config);
        assert_eq!(liveness == Liveness::Alive, alive, "{liveness:?}");
    }

    #[test]
    fn test_assess_without_lease_or_with_foreign_lease() {
        let now = Utc::now();
        let config = SyncConfig::default();
        let run = running("run-1", now);
        assert!(matches!(assess(&run, None, now, &config), Liveness::Orphaned(_)));

        let other = ProcessHandle::new("run-0", "w", ChronoDuration::seconds(60), now);
        assert!(matches!(assess(&run, Some(&other), now, &config), Liveness::Orphaned(_)));

        assert_eq!(assess(&SyncRun::default(), None, now, &config), Liveness::Idle);
    }

    #[test]
    fn test_chunk_runtime_ceiling() {
        let now = Utc::now();
        let config = SyncConfig {
            max_chunk_runtime_seconds: Some(120),
            ..Default::default()
        };
        let mut run = running("run-1", now);
        run.chunk_started_at = Some(now - ChronoDuration::seconds(130));
        let lease = ProcessHandle::new("run-1", "w", ChronoDuration::seconds(60), now);

        assert!(matches!(assess(&run, Some(&lease), now, &config), Liveness::Orphaned(_)));
        run.chunk_started_at = None;
        assert_eq!(assess(&run, Some(&lease), now, &config), Liveness::Alive);
    }

    #[tokio::test]
    async fn test_stale_run_without_lease_heals_to_cancelled() {
        let ctx = TestContext::new().await;
        ctx.tracker.mark_running("run-1", 10).await.unwrap();
        ctx.tracker
            .update_running(
                "run-1",
                SyncRunPatch::new()
                    .current_index(4)
                    .last_activity(Utc::now() - ChronoDuration::seconds(121)),
            )
            .await
            .unwrap();

        assert!(!ctx.liveness.is_alive().await.unwrap());

        let run = ctx.tracker.read().await.unwrap();
        assert_eq!(run.status, SyncStatus::Cancelled);
        assert_eq!(run.current_index, 4);
        assert!(run.cancel_reason.unwrap().contains("orphaned"));
        assert!(ctx.state.load_lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_run_is_reported_alive() {
        let ctx = TestContext::new().await;
        ctx.tracker.mark_running("run-1", 10).await.unwrap();
        assert!(ctx.liveness.acquire_lease("run-1").await.unwrap());

        let lease = ctx.state.load_lease().await.unwrap().unwrap();
        assert!(lease.is_held_by(ctx.liveness.worker_id()));
        assert_eq!(lease.run_id, "run-1");

        assert!(ctx.liveness.is_alive().await.unwrap());
        assert!(ctx.liveness.heartbeat("run-1").await.unwrap());
        assert!(!ctx.liveness.heartbeat("run-2").await.unwrap());

        let renewed = ctx.state.load_lease().await.unwrap().unwrap();
        assert!(renewed.expires_at >= lease.expires_at);
        assert!(renewed.is_held_by(ctx.liveness.worker_id()));
    }

    #[tokio::test]
    async fn test_force_terminate_when_idle_is_a_no_op() {
        let ctx = TestContext::new().await;
        assert!(!ctx.liveness.force_terminate("nothing").await.unwrap());
        assert_eq!(ctx.tracker.read().await.unwrap().status, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_force_terminate_clears_foreign_lease_after_grace() {
        let ctx = TestContext::with_config(SyncConfig {
            termination_grace_seconds: 0,
            ..Default::default()
        })
        .await;
        ctx.tracker.mark_running("run-1", 10).await.unwrap();
        let now = Utc::now();
        let foreign = ProcessHandle::new("run-1", "other-worker", ChronoDuration::seconds(3600), now);
        ctx.state.try_acquire_lease(&foreign, now).await.unwrap();

        assert!(ctx.liveness.force_terminate("operator").await.unwrap());

        assert!(ctx.state.load_lease().await.unwrap().is_none());
        assert_eq!(ctx.tracker.read().await.unwrap().status, SyncStatus::Cancelled);
        assert!(!ctx.state.force_stop_requested("run-1", Utc::now()).await.unwrap());
    }
}
