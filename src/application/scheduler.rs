//! Chunk scheduler - one long-lived driver per run
//!
//! The driver sleeps until the next chunk is due, runs it, and reschedules
//! itself based on the outcome. Only one driver can be installed in the
//! worker slot, so there is never more than one pending chunk per process.
//! While waiting the driver keeps the run's heartbeat fresh.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::worker_slot::WorkerSlot;

/// What the driver does after a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More work left; run the next chunk after the regular interval
    Continue,
    /// Transient failure; try again after the given delay
    RetryAfter(Duration),
    /// Terminal state reached or the run is no longer ours
    Stop,
}

#[async_trait]
pub trait ChunkRunner: Send + Sync {
    async fn run_chunk(&self, run_id: &str, token: &CancellationToken) -> ChunkOutcome;

    /// Keep a waiting run alive. Returning `false` ends the driver.
    async fn idle_heartbeat(&self, run_id: &str) -> bool;
}

pub struct ChunkScheduler {
    slot: Arc<WorkerSlot>,
    chunk_interval: Duration,
    heartbeat_interval: Duration,
}

impl ChunkScheduler {
    pub fn new(slot: Arc<WorkerSlot>, chunk_interval: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            slot,
            chunk_interval,
            heartbeat_interval,
        }
    }

    pub fn slot(&self) -> &Arc<WorkerSlot> {
        &self.slot
    }

    /// Start driving `run_id`, first chunk after `delay`.
    ///
    /// Returns `false` if a driver is already live in this process.
    pub async fn schedule(&self, runner: Arc<dyn ChunkRunner>, run_id: &str, delay: Duration) -> bool {
        let slot = self.slot.clone();
        let owned_run_id = run_id.to_string();
        let chunk_interval = self.chunk_interval;
        let heartbeat_interval = self.heartbeat_interval;

        let installed = self
            .slot
            .try_install(run_id, move |token| {
                tokio::spawn(async move {
                    drive(runner, &owned_run_id, &token, delay, chunk_interval, heartbeat_interval).await;
                    slot.release(&owned_run_id).await;
                })
            })
            .await;

        if installed {
            info!("⏱️  Scheduled run {} (first chunk in {:?})", run_id, delay);
        } else {
            debug!("Run {} not scheduled, a driver is already live", run_id);
        }
        installed
    }
}

async fn drive(
    runner: Arc<dyn ChunkRunner>,
    run_id: &str,
    token: &CancellationToken,
    first_delay: Duration,
    chunk_interval: Duration,
    heartbeat_interval: Duration,
) {
    let mut delay = first_delay;
    loop {
        if !wait(&*runner, run_id, token, delay, heartbeat_interval).await {
            break;
        }
        match runner.run_chunk(run_id, token).await {
            ChunkOutcome::Continue => delay = chunk_interval,
            ChunkOutcome::RetryAfter(backoff) => delay = backoff,
            ChunkOutcome::Stop => break,
        }
    }
    debug!("Chunk driver for run {} exited", run_id);
}

/// Sleep for `delay`, heartbeating every `heartbeat_interval`.
/// Returns `false` if cancelled or the heartbeat reports the run gone.
async fn wait(
    runner: &dyn ChunkRunner,
    run_id: &str,
    token: &CancellationToken,
    delay: Duration,
    heartbeat_interval: Duration,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if token.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }

        let step = (deadline - now).min(heartbeat_interval);
        tokio::select! {
            () = token.cancelled() => return false,
            () = tokio::time::sleep(step) => {}
        }

        if Instant::now() < deadline && !runner.idle_heartbeat(run_id).await {
            return false;
        }
    }
}
