//! The in-process slot holding the one live chunk driver

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a termination request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// No driver was running in this process
    NotRunning,
    /// The driver observed its token and exited within the grace period
    Graceful,
    /// The driver did not exit in time and was aborted
    Aborted,
}

struct ActiveWorker {
    run_id: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct WorkerSlot {
    active: Mutex<Option<ActiveWorker>>,
}

impl WorkerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a driver for `run_id` unless one is still live.
    ///
    /// `spawn` receives the driver's cancellation token. Returns `false`
    /// without calling `spawn` when the slot is taken.
    pub async fn try_install<F>(&self, run_id: &str, spawn: F) -> bool
    where
        F: FnOnce(CancellationToken) -> JoinHandle<()>,
    {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|worker| !worker.handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let handle = spawn(token.clone());
        *active = Some(ActiveWorker {
            run_id: run_id.to_string(),
            token,
            handle,
        });
        true
    }

    /// Whether a driver is live in this process
    pub async fn is_occupied(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    pub async fn active_run(&self) -> Option<String> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|worker| !worker.handle.is_finished())
            .map(|worker| worker.run_id.clone())
    }

    /// Called by a driver on exit. Only clears the slot if it still holds `run_id`.
    pub async fn release(&self, run_id: &str) {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|worker| worker.run_id == run_id) {
            *active = None;
        }
    }

    /// Cancel the driver, wait up to `grace`, then abort it.
    pub async fn terminate(&self, grace: Duration) -> TerminationOutcome {
        let Some(mut worker) = self.active.lock().await.take() else {
            return TerminationOutcome::NotRunning;
        };
        if worker.handle.is_finished() {
            return TerminationOutcome::NotRunning;
        }

        info!("Signalling chunk driver for run {} to stop", worker.run_id);
        worker.token.cancel();

        if tokio::time::timeout(grace, &mut worker.handle).await.is_ok() {
            TerminationOutcome::Graceful
        } else {
            warn!(
                "Chunk driver for run {} ignored cancellation for {:?}, aborting",
                worker.run_id, grace
            );
            worker.handle.abort();
            TerminationOutcome::Aborted
        }
    }
}
