//! Persistence for mirrored catalog entities
//!
//! Blueprints, providers and variants each live in their own table keyed by
//! the upstream identifier path, so writing the same entity twice updates the
//! existing row instead of adding a duplicate. Payloads are stored as JSON
//! text and decoded again for the operator summary.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::catalog::{CacheSummary, CatalogRecord, EntityKind, KindSummary};
use crate::infrastructure::store_error::{StoreError, StoreResult};

#[derive(Clone)]
pub struct EntityStore {
    pool: Arc<SqlitePool>,
}

impl EntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    // ===============================
    // SCHEMA
    // ===============================

    fn create_statements(kind: EntityKind) -> &'static [&'static str] {
        match kind {
            EntityKind::Blueprint => &[
                r"CREATE TABLE IF NOT EXISTS catalog_blueprints (
                    blueprint_id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS idx_blueprints_updated ON catalog_blueprints (updated_at)",
            ],
            EntityKind::Provider => &[
                r"CREATE TABLE IF NOT EXISTS catalog_providers (
                    provider_id TEXT NOT NULL,
                    blueprint_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (blueprint_id, provider_id)
                )",
                "CREATE INDEX IF NOT EXISTS idx_providers_updated ON catalog_providers (updated_at)",
            ],
            EntityKind::Variant => &[
                r"CREATE TABLE IF NOT EXISTS catalog_variants (
                    variant_id TEXT NOT NULL,
                    blueprint_id TEXT NOT NULL,
                    provider_id TEXT NOT NULL,
                    data TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (blueprint_id, provider_id, variant_id)
                )",
                "CREATE INDEX IF NOT EXISTS idx_variants_blueprint_provider ON catalog_variants (blueprint_id, provider_id)",
                "CREATE INDEX IF NOT EXISTS idx_variants_updated ON catalog_variants (updated_at)",
            ],
        }
    }

    /// Tables that are expected but not present
    pub async fn missing_tables(&self) -> StoreResult<Vec<String>> {
        let existing: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&*self.pool)
                .await?;

        Ok(EntityKind::ALL
            .iter()
            .map(|kind| kind.table())
            .filter(|table| !existing.iter().any(|name| name == table))
            .map(str::to_string)
            .collect())
    }

    pub async fn tables_exist(&self) -> StoreResult<bool> {
        Ok(self.missing_tables().await?.is_empty())
    }

    /// Create missing tables, then verify by querying existence again.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        let missing = self.missing_tables().await?;
        if missing.is_empty() {
            debug!("Catalog tables already present");
            return Ok(());
        }

        info!("Creating catalog tables: {}", missing.join(", "));
        for kind in EntityKind::ALL {
            for statement in Self::create_statements(kind) {
                sqlx::query(statement).execute(&*self.pool).await?;
            }
        }

        let still_missing = self.missing_tables().await?;
        if !still_missing.is_empty() {
            warn!("Catalog table creation could not be verified: {:?}", still_missing);
            return Err(StoreError::SchemaVerification {
                missing: still_missing,
            });
        }

        info!("✅ Catalog tables created and verified");
        Ok(())
    }

    // ===============================
    // WRITES
    // ===============================

    /// Insert or update one record, stamping `updated_at` when absent
    pub async fn upsert(&self, record: &CatalogRecord) -> StoreResult<()> {
        match record {
            CatalogRecord::Blueprint(bp) => {
                let data = serde_json::to_string(&bp.payload)?;
                sqlx::query(
                    r"
                    INSERT INTO catalog_blueprints (blueprint_id, title, data, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT (blueprint_id) DO UPDATE SET
                        title = excluded.title,
                        data = excluded.data,
                        updated_at = excluded.updated_at
                    ",
                )
                .bind(&bp.id)
                .bind(&bp.title)
                .bind(data)
                .bind(bp.updated_at.unwrap_or_else(Utc::now))
                .execute(&*self.pool)
                .await?;
            }
            CatalogRecord::Provider(provider) => {
                let data = serde_json::to_string(&provider.payload)?;
                sqlx::query(
                    r"
                    INSERT INTO catalog_providers (provider_id, blueprint_id, title, data, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT (blueprint_id, provider_id) DO UPDATE SET
                        title = excluded.title,
                        data = excluded.data,
                        updated_at = excluded.updated_at
                    ",
                )
                .bind(&provider.id)
                .bind(&provider.blueprint_id)
                .bind(&provider.title)
                .bind(data)
                .bind(provider.updated_at.unwrap_or_else(Utc::now))
                .execute(&*self.pool)
                .await?;
            }
            CatalogRecord::Variant(variant) => {
                let data = serde_json::to_string(&variant.payload)?;
                sqlx::query(
                    r"
                    INSERT INTO catalog_variants (variant_id, blueprint_id, provider_id, data, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT (blueprint_id, provider_id, variant_id) DO UPDATE SET
                        data = excluded.data,
                        updated_at = excluded.updated_at
                    ",
                )
                .bind(&variant.id)
                .bind(&variant.blueprint_id)
                .bind(&variant.provider_id)
                .bind(data)
                .bind(variant.updated_at.unwrap_or_else(Utc::now))
                .execute(&*self.pool)
                .await?;
            }
        }
        Ok(())
    }

    // ===============================
    // READS
    // ===============================

    pub async fn count(&self, kind: EntityKind) -> StoreResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&*self.pool).await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Per-kind row count, most recent `updated_at` and one decoded sample
    pub async fn summary(&self) -> StoreResult<CacheSummary> {
        let mut summary = CacheSummary::default();
        for kind in EntityKind::ALL {
            *summary.get_mut(kind) = self.kind_summary(kind).await?;
        }
        Ok(summary)
    }

    async fn kind_summary(&self, kind: EntityKind) -> StoreResult<KindSummary> {
        let stats_sql = format!(
            "SELECT COUNT(*) AS count, MAX(updated_at) AS last_updated FROM {}",
            kind.table()
        );
        let row = sqlx::query(&stats_sql).fetch_one(&*self.pool).await?;
        let count: i64 = row.try_get("count")?;
        let last_updated: Option<DateTime<Utc>> = row.try_get("last_updated")?;

        let sample = if count > 0 {
            self.sample(kind).await?
        } else {
            None
        };

        Ok(KindSummary {
            count: u64::try_from(count).unwrap_or_default(),
            last_updated,
            sample,
        })
    }

    async fn sample(&self, kind: EntityKind) -> StoreResult<Option<Value>> {
        let sql = match kind {
            EntityKind::Blueprint => {
                "SELECT blueprint_id AS id, title, data FROM catalog_blueprints
                 ORDER BY updated_at DESC, rowid DESC LIMIT 1"
            }
            EntityKind::Provider => {
                "SELECT provider_id AS id, blueprint_id, title, data FROM catalog_providers
                 ORDER BY updated_at DESC, rowid DESC LIMIT 1"
            }
            EntityKind::Variant => {
                "SELECT variant_id AS id, blueprint_id, provider_id, data FROM catalog_variants
                 ORDER BY updated_at DESC, rowid DESC LIMIT 1"
            }
        };

        let Some(row) = sqlx::query(sql).fetch_optional(&*self.pool).await? else {
            return Ok(None);
        };

        let data: String = row.try_get("data")?;
        let decoded: Value = serde_json::from_str(&data)?;
        let id: String = row.try_get("id")?;

        let sample = match kind {
            EntityKind::Blueprint => json!({
                "id": id,
                "title": row.try_get::<String, _>("title")?,
                "data": decoded,
            }),
            EntityKind::Provider => json!({
                "id": id,
                "blueprint_id": row.try_get::<String, _>("blueprint_id")?,
                "title": row.try_get::<String, _>("title")?,
                "data": decoded,
            }),
            EntityKind::Variant => json!({
                "id": id,
                "blueprint_id": row.try_get::<String, _>("blueprint_id")?,
                "provider_id": row.try_get::<String, _>("provider_id")?,
                "data": decoded,
            }),
        };
        Ok(Some(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::{BlueprintRecord, CatalogEntity};
    use crate::infrastructure::DatabaseConnection;
    use tempfile::TempDir;

    async fn store() -> (TempDir, EntityStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("entities.db").display());
        let db = DatabaseConnection::new(&url).await.unwrap();
        let store = EntityStore::new(db.pool().clone());
        store.ensure_schema().await.unwrap();
        (dir, store)
    }

    fn entity(value: Value) -> CatalogEntity {
        CatalogEntity::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_missing_tables_reported_before_creation() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("fresh.db").display());
        let db = DatabaseConnection::new(&url).await.unwrap();
        let store = EntityStore::new(db.pool().clone());

        let missing = store.missing_tables().await.unwrap();
        assert_eq!(missing.len(), 3);
        assert!(!store.tables_exist().await.unwrap());

        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
        assert!(store.tables_exist().await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_same_id_keeps_single_row_with_latest_payload() {
        let (_dir, store) = store().await;

        let first = entity(json!({"id": 5, "title": "Mug", "colour": "white"}));
        let second = entity(json!({"id": 5, "title": "Mug 11oz", "colour": "black"}));
        store.upsert(&CatalogRecord::blueprint(&first)).await.unwrap();
        store.upsert(&CatalogRecord::blueprint(&second)).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.blueprints.count, 1);
        let sample = summary.blueprints.sample.unwrap();
        assert_eq!(sample["id"], "5");
        assert_eq!(sample["title"], "Mug 11oz");
        assert_eq!(sample["data"]["colour"], "black");
    }

    #[tokio::test]
    async fn test_nested_keys_distinguish_rows() {
        let (_dir, store) = store().await;
        let provider = entity(json!({"id": 3, "title": "Monster Digital"}));
        let variant = entity(json!({"id": 17390, "title": "S / Black"}));

        store.upsert(&CatalogRecord::provider("1", &provider)).await.unwrap();
        store.upsert(&CatalogRecord::provider("2", &provider)).await.unwrap();
        store.upsert(&CatalogRecord::variant("1", "3", &variant)).await.unwrap();
        store.upsert(&CatalogRecord::variant("1", "3", &variant)).await.unwrap();

        assert_eq!(store.count(EntityKind::Provider).await.unwrap(), 2);
        assert_eq!(store.count(EntityKind::Variant).await.unwrap(), 1);

        let summary = store.summary().await.unwrap();
        let sample = summary.variants.sample.unwrap();
        assert_eq!(sample["blueprint_id"], "1");
        assert_eq!(sample["provider_id"], "3");
        assert!(summary.variants.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_explicit_updated_at_is_kept() {
        let (_dir, store) = store().await;
        let stamp = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = CatalogRecord::Blueprint(BlueprintRecord {
            id: "9".to_string(),
            title: "Poster".to_string(),
            payload: json!({"id": 9}),
            updated_at: Some(stamp),
        });
        store.upsert(&record).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.blueprints.last_updated, Some(stamp));
    }

    #[tokio::test]
    async fn test_empty_summary() {
        let (_dir, store) = store().await;
        let summary = store.summary().await.unwrap();
        assert_eq!(summary, CacheSummary::default());
    }
}
