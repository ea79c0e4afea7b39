//! Worker lease ("process handle")
//!
//! A worker claims a run by writing a lease with a bounded TTL. Liveness is
//! "lease present and not expired"; no OS signals are involved, so the check
//! works across hosts and containers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub run_id: String,
    /// Unique per worker instance, distinguishes two processes working the same run id
    pub worker_id: String,
    /// OS process id of the holder, informational only
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn new(run_id: &str, worker_id: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            worker_id: worker_id.to_string(),
            pid: std::process::id(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.worker_id == worker_id
    }
}
