//! Durable sync control state
//!
//! Four small tables back the coordination between workers and observers:
//! - `sync_state`: the single [`SyncRun`] record, stored as JSON
//! - `sync_lease`: the single worker lease ([`ProcessHandle`])
//! - `sync_signals`: named stop flags with an optional expiry
//! - `sync_plan`: the ordered top-level work list of the current run

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::catalog::CatalogEntity;
use crate::domain::lease::ProcessHandle;
use crate::domain::sync_run::SyncRun;
use crate::infrastructure::store_error::StoreResult;

/// Global operator stop, honoured by every run until it expires
pub const EMERGENCY_STOP_SIGNAL: &str = "emergency_stop";

/// Stop request addressed to one run; the value holds the run id
pub const FORCE_STOP_SIGNAL: &str = "force_stop";

#[derive(Clone)]
pub struct SyncStateRepository {
    pool: Arc<SqlitePool>,
}

impl SyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    // ===============================
    // SYNC RUN RECORD
    // ===============================

    /// Load the run record. A missing or unreadable record reads as defaults.
    pub async fn load_run(&self) -> StoreResult<SyncRun> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM sync_state WHERE id = 1")
            .fetch_optional(&*self.pool)
            .await?;

        let Some(state) = state else {
            return Ok(SyncRun::default());
        };

        match serde_json::from_str::<SyncRun>(&state) {
            Ok(run) => Ok(run),
            Err(e) => {
                warn!("Stored sync state could not be decoded, using defaults: {}", e);
                Ok(SyncRun::default())
            }
        }
    }

    pub async fn save_run(&self, run: &SyncRun) -> StoreResult<()> {
        let state = serde_json::to_string(run)?;
        sqlx::query(
            r"
            INSERT INTO sync_state (id, state, updated_at) VALUES (1, ?, ?)
            ON CONFLICT (id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            ",
        )
        .bind(state)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Save only while the stored record is still running `run_id`.
    ///
    /// Returns `false` when another writer moved the record on (cancelled it,
    /// started a different run), in which case nothing is written.
    pub async fn save_run_if_running(&self, run: &SyncRun, run_id: &str) -> StoreResult<bool> {
        let state = serde_json::to_string(run)?;
        let result = sqlx::query(
            r"
            UPDATE sync_state SET state = ?, updated_at = ?
            WHERE id = 1
              AND json_extract(state, '$.status') = 'running'
              AND json_extract(state, '$.run_id') = ?
            ",
        )
        .bind(state)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Refresh `last_activity` of a running record in place
    pub async fn touch_run(&self, run_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let stamp = now.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let result = sqlx::query(
            r"
            UPDATE sync_state SET state = json_set(state, '$.last_activity', ?), updated_at = ?
            WHERE id = 1
              AND json_extract(state, '$.status') = 'running'
              AND json_extract(state, '$.run_id') = ?
            ",
        )
        .bind(stamp)
        .bind(now)
        .bind(run_id)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ===============================
    // LEASE
    // ===============================

    pub async fn load_lease(&self) -> StoreResult<Option<ProcessHandle>> {
        let row = sqlx::query(
            "SELECT run_id, worker_id, pid, acquired_at, expires_at FROM sync_lease WHERE id = 1",
        )
        .fetch_optional(&*self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let pid: i64 = row.try_get("pid")?;
        Ok(Some(ProcessHandle {
            run_id: row.try_get("run_id")?,
            worker_id: row.try_get("worker_id")?,
            pid: u32::try_from(pid).unwrap_or_default(),
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    /// Write the lease unless another worker holds an unexpired one.
    ///
    /// Returns `false` when the lease is held elsewhere.
    pub async fn try_acquire_lease(&self, lease: &ProcessHandle, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO sync_lease (id, run_id, worker_id, pid, acquired_at, expires_at)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                run_id = excluded.run_id,
                worker_id = excluded.worker_id,
                pid = excluded.pid,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE sync_lease.worker_id = excluded.worker_id OR sync_lease.expires_at <= ?
            ",
        )
        .bind(&lease.run_id)
        .bind(&lease.worker_id)
        .bind(i64::from(lease.pid))
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Extend the lease held by `worker_id` for `run_id`. Returns `false` if it is not held.
    pub async fn renew_lease(
        &self,
        run_id: &str,
        worker_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE sync_lease SET expires_at = ? WHERE id = 1 AND run_id = ? AND worker_id = ?",
        )
        .bind(expires_at)
        .bind(run_id)
        .bind(worker_id)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop the lease only if this worker holds it
    pub async fn release_lease(&self, worker_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM sync_lease WHERE id = 1 AND worker_id = ?")
            .bind(worker_id)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop the lease whoever holds it
    pub async fn clear_lease(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_lease").execute(&*self.pool).await?;
        Ok(())
    }

    // ===============================
    // SIGNALS
    // ===============================

    pub async fn set_signal(
        &self,
        name: &str,
        value: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            r"
            INSERT INTO sync_signals (name, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            ",
        )
        .bind(name)
        .bind(value)
        .bind(expires_at)
        .execute(&*self.pool)
        .await?;
        debug!("Signal {} set", name);
        Ok(())
    }

    /// Value of a live signal. An expired signal is removed and reads as absent.
    pub async fn active_signal(&self, name: &str, now: DateTime<Utc>) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT value, expires_at FROM sync_signals WHERE name = ?")
            .bind(name)
            .fetch_optional(&*self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: Option<DateTime<Utc>> = row.try_get("expires_at")?;
        if expires_at.is_some_and(|at| now >= at) {
            debug!("Signal {} expired", name);
            self.clear_signal(name).await?;
            return Ok(None);
        }

        let value: Option<String> = row.try_get("value")?;
        Ok(Some(value.unwrap_or_default()))
    }

    pub async fn clear_signal(&self, name: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_signals WHERE name = ?")
            .bind(name)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_all_signals(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_signals").execute(&*self.pool).await?;
        Ok(())
    }

    pub async fn set_emergency_stop(&self, until: DateTime<Utc>) -> StoreResult<()> {
        self.set_signal(EMERGENCY_STOP_SIGNAL, Some("operator"), Some(until))
            .await
    }

    pub async fn emergency_stop_active(&self, now: DateTime<Utc>) -> StoreResult<bool> {
        Ok(self.active_signal(EMERGENCY_STOP_SIGNAL, now).await?.is_some())
    }

    pub async fn request_force_stop(&self, run_id: &str) -> StoreResult<()> {
        self.set_signal(FORCE_STOP_SIGNAL, Some(run_id), None).await
    }

    /// Whether a force stop addressed to `run_id` is pending
    pub async fn force_stop_requested(&self, run_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        Ok(self
            .active_signal(FORCE_STOP_SIGNAL, now)
            .await?
            .is_some_and(|target| target == run_id))
    }

    // ===============================
    // WORK PLAN
    // ===============================

    /// Replace the stored plan with `entities`, in order
    pub async fn save_plan(&self, entities: &[CatalogEntity]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sync_plan").execute(&mut *tx).await?;
        for (position, entity) in entities.iter().enumerate() {
            sqlx::query("INSERT INTO sync_plan (position, entity_id, title, payload) VALUES (?, ?, ?, ?)")
                .bind(i64::try_from(position).unwrap_or(i64::MAX))
                .bind(&entity.id)
                .bind(&entity.title)
                .bind(serde_json::to_string(&entity.payload)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!("Stored work plan with {} entries", entities.len());
        Ok(())
    }

    pub async fn plan_len(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_plan")
            .fetch_one(&*self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Up to `limit` plan entries starting at `offset`, in plan order
    pub async fn plan_slice(&self, offset: u64, limit: usize) -> StoreResult<Vec<CatalogEntity>> {
        let rows = sqlx::query(
            "SELECT entity_id, title, payload FROM sync_plan WHERE position >= ? ORDER BY position LIMIT ?",
        )
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.try_get("payload")?;
            entities.push(CatalogEntity {
                id: row.try_get("entity_id")?,
                title: row.try_get("title")?,
                payload: serde_json::from_str::<Value>(&payload)?,
            });
        }
        Ok(entities)
    }

    pub async fn clear_plan(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_plan").execute(&*self.pool).await?;
        Ok(())
    }
}
