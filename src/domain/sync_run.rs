//! The single global synchronisation record
//!
//! `SyncRun` is the aggregate every observer polls. It replaces the loose
//! collection of "updating"/"progress"/"last activity" flags with one
//! record holding an explicit status plus structured position fields.
//! All writes go through [`SyncRunPatch`] so percentage is always derived
//! from `current_index` and `total_count` at write time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of the sync run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Error,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// Terminal states stop all further chunk scheduling for a run.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase labels written into `SyncRun::phase`
pub mod phase {
    pub const IDLE: &str = "idle";
    pub const PROCESSING_BLUEPRINTS: &str = "processing_blueprints";
    pub const PROCESSING_PROVIDERS: &str = "processing_providers";
    pub const PROCESSING_VARIANTS: &str = "processing_variants";
    pub const WAITING_NEXT_CHUNK: &str = "waiting_next_chunk";
    pub const RETRY_BACKOFF: &str = "retry_backoff";
    pub const COMPLETED: &str = "completed";
    pub const CANCELLED: &str = "cancelled";
    pub const ERROR: &str = "error";
}

/// Snapshot of the sync run.
///
/// Every field has a default so a record persisted by an older build, or
/// no record at all, still reads as a complete value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncRun {
    pub run_id: Option<String>,
    pub status: SyncStatus,
    pub phase: String,
    pub current_item: String,
    pub current_index: u64,
    pub total_count: u64,
    pub percentage: f64,
    /// Consecutive transient failures since the last successful chunk
    pub retry_count: u32,
    /// Terminal error detail, set only when `status == Error`
    pub error: Option<String>,
    /// Last transient failure that caused a backoff
    pub retry_reason: Option<String>,
    pub cancel_reason: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// Set while a chunk is executing, cleared at chunk end
    pub chunk_started_at: Option<DateTime<Utc>>,
    pub next_chunk_at: Option<DateTime<Utc>>,
    /// Time the run reached a terminal state (completion, cancellation or error)
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for SyncRun {
    fn default() -> Self {
        Self {
            run_id: None,
            status: SyncStatus::Idle,
            phase: phase::IDLE.to_string(),
            current_item: String::new(),
            current_index: 0,
            total_count: 0,
            percentage: 0.0,
            retry_count: 0,
            error: None,
            retry_reason: None,
            cancel_reason: None,
            last_activity: None,
            started_at: None,
            chunk_started_at: None,
            next_chunk_at: None,
            finished_at: None,
        }
    }
}

impl SyncRun {
    pub fn is_running(&self) -> bool {
        self.status == SyncStatus::Running
    }

    /// Whether this record belongs to the given run and is still running
    pub fn is_running_for(&self, run_id: &str) -> bool {
        self.is_running() && self.run_id.as_deref() == Some(run_id)
    }

    /// Seconds since the last recorded activity, if any
    pub fn idle_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_activity.map(|at| now - at)
    }

    /// A run has a resumable position when it knows its bound and has not reached it.
    pub fn has_resumable_position(&self) -> bool {
        self.total_count > 0 && self.current_index < self.total_count
    }

    /// Merge a patch into this record and re-derive the percentage.
    pub fn apply(&mut self, patch: SyncRunPatch) {
        let SyncRunPatch {
            run_id,
            status,
            phase,
            current_item,
            current_index,
            total_count,
            retry_count,
            error,
            retry_reason,
            cancel_reason,
            last_activity,
            started_at,
            chunk_started_at,
            next_chunk_at,
            finished_at,
        } = patch;

        if let Some(v) = run_id {
            self.run_id = v;
        }
        if let Some(v) = status {
            self.status = v;
        }
        if let Some(v) = phase {
            self.phase = v;
        }
        if let Some(v) = current_item {
            self.current_item = v;
        }
        if let Some(v) = current_index {
            self.current_index = v;
        }
        if let Some(v) = total_count {
            self.total_count = v;
        }
        if let Some(v) = retry_count {
            self.retry_count = v;
        }
        if let Some(v) = error {
            self.error = v;
        }
        if let Some(v) = retry_reason {
            self.retry_reason = v;
        }
        if let Some(v) = cancel_reason {
            self.cancel_reason = v;
        }
        if let Some(v) = last_activity {
            self.last_activity = v;
        }
        if let Some(v) = started_at {
            self.started_at = v;
        }
        if let Some(v) = chunk_started_at {
            self.chunk_started_at = v;
        }
        if let Some(v) = next_chunk_at {
            self.next_chunk_at = v;
        }
        if let Some(v) = finished_at {
            self.finished_at = v;
        }

        self.percentage = if self.status == SyncStatus::Completed {
            100.0
        } else {
            derive_percentage(self.current_index, self.total_count)
        };
    }
}

/// `current / total * 100`, clamped to `[0, 100]`. An empty bound reads as 0.
pub fn derive_percentage(current: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = current as f64 / total as f64 * 100.0;
    (raw * 100.0).round().clamp(0.0, 10_000.0) / 100.0
}

/// Partial update of a [`SyncRun`].
///
/// `None` leaves a field untouched; for nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncRunPatch {
    pub run_id: Option<Option<String>>,
    pub status: Option<SyncStatus>,
    pub phase: Option<String>,
    pub current_item: Option<String>,
    pub current_index: Option<u64>,
    pub total_count: Option<u64>,
    pub retry_count: Option<u32>,
    pub error: Option<Option<String>>,
    pub retry_reason: Option<Option<String>>,
    pub cancel_reason: Option<Option<String>>,
    pub last_activity: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub chunk_started_at: Option<Option<DateTime<Utc>>>,
    pub next_chunk_at: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
}

impl SyncRunPatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    #[must_use]
    pub fn current_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    #[must_use]
    pub const fn current_index(mut self, index: u64) -> Self {
        self.current_index = Some(index);
        self
    }

    #[must_use]
    pub const fn total_count(mut self, total: u64) -> Self {
        self.total_count = Some(total);
        self
    }

    #[must_use]
    pub const fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    #[must_use]
    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn retry_reason(mut self, reason: Option<String>) -> Self {
        self.retry_reason = Some(reason);
        self
    }

    #[must_use]
    pub fn cancel_reason(mut self, reason: Option<String>) -> Self {
        self.cancel_reason = Some(reason);
        self
    }

    #[must_use]
    pub const fn last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity = Some(Some(at));
        self
    }

    #[must_use]
    pub const fn chunk_started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.chunk_started_at = Some(at);
        self
    }

    #[must_use]
    pub const fn next_chunk_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_chunk_at = Some(at);
        self
    }

    #[must_use]
    pub const fn finished_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.finished_at = Some(at);
        self
    }
}
