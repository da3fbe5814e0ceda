use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use harvest_core::{
    FailureReason, FailureRecord, HarvestCheckpoint, ItemId, PriceSnapshot, StorageDocument,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{info, warn};

use crate::{
    CheckpointStore, DocumentStore, FailureQuery, FailureStore, SnapshotStore, StoreError,
    DEFAULT_LOOKUP_LIMIT,
};

/// Postgres backend. Every call is bounded by `op_timeout`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    op_timeout: Duration,
    lookup_limit: usize,
}

impl PgStore {
    pub async fn connect(database_url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(op_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, op_timeout))
    }

    pub fn from_pool(pool: PgPool, op_timeout: Duration) -> Self {
        Self {
            pool,
            op_timeout,
            lookup_limit: DEFAULT_LOOKUP_LIMIT,
        }
    }

    pub fn with_lookup_limit(mut self, limit: usize) -> Self {
        self.lookup_limit = limit.max(1);
        self
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(err.into()))?;
        info!("database migrations applied");
        Ok(())
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
    }
}

fn parse_item_id(raw: String) -> Result<ItemId, StoreError> {
    ItemId::parse(&raw).map_err(|err| StoreError::Corrupt {
        key: raw,
        detail: err.to_string(),
    })
}

fn failure_from_row(row: &PgRow) -> Result<FailureRecord, StoreError> {
    let reason: String = row.try_get("reason")?;
    let failure_count: i32 = row.try_get("failure_count")?;
    Ok(FailureRecord {
        item_id: parse_item_id(row.try_get("item_id")?)?,
        reason: reason.parse().unwrap_or(FailureReason::Unknown),
        detail: row.try_get("detail")?,
        failure_count: failure_count.max(0) as u32,
        first_failed_at: row.try_get("first_failed_at")?,
        last_failed_at: row.try_get("last_failed_at")?,
        recovered_at: row.try_get::<Option<DateTime<Utc>>, _>("recovered_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<PriceSnapshot, StoreError> {
    Ok(PriceSnapshot {
        item_id: parse_item_id(row.try_get("item_id")?)?,
        day: row.try_get("day")?,
        regular_price: row.try_get("regular_price")?,
        discount_price: row.try_get("discount_price")?,
        discount_rate: row.try_get("discount_rate")?,
        campaign_id: row.try_get("campaign_id")?,
        price_changed: row.try_get("price_changed")?,
        new_campaign: row.try_get("new_campaign")?,
        captured_at: row.try_get("captured_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn commit_documents(&self, documents: &[StorageDocument]) -> Result<(), StoreError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            for doc in documents {
                let body = serde_json::to_value(doc)?;
                sqlx::query(
                    r#"
                    INSERT INTO storage_documents (product_id, body, created_at, updated_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (product_id) DO UPDATE
                       SET body = jsonb_set(
                               EXCLUDED.body,
                               '{created_at}',
                               storage_documents.body -> 'created_at'
                           ),
                           updated_at = EXCLUDED.updated_at
                    "#,
                )
                .bind(&doc.product_id)
                .bind(body)
                .bind(doc.created_at)
                .bind(doc.updated_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn existing_keys(&self, keys: &[String]) -> Result<HashSet<String>, StoreError> {
        self.bounded(async {
            let rows = sqlx::query(
                "SELECT product_id FROM storage_documents WHERE product_id = ANY($1)",
            )
            .bind(keys)
                .fetch_all(&self.pool)
                .await?;
            let mut found = HashSet::with_capacity(rows.len());
            for row in rows {
                found.insert(row.try_get::<String, _>("product_id")?);
            }
            Ok::<_, StoreError>(found)
        })
        .await
    }

    async fn get_document(&self, key: &str) -> Result<Option<StorageDocument>, StoreError> {
        self.bounded(async {
            let row = sqlx::query("SELECT body FROM storage_documents WHERE product_id = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
            match row {
                Some(row) => {
                    let body: serde_json::Value = row.try_get("body")?;
                    Ok(Some(serde_json::from_value(body)?))
                }
                None => Ok::<_, StoreError>(None),
            }
        })
        .await
    }

    async fn count_documents(&self) -> Result<usize, StoreError> {
        self.bounded(async {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM storage_documents")
                .fetch_one(&self.pool)
                .await?;
            let n: i64 = row.try_get("n")?;
            Ok::<_, StoreError>(n.max(0) as usize)
        })
        .await
    }

    fn lookup_limit(&self) -> usize {
        self.lookup_limit
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn load_checkpoint(
        &self,
        run_type: &str,
    ) -> Result<Option<HarvestCheckpoint>, StoreError> {
        self.bounded(async {
            let row = sqlx::query("SELECT body FROM harvest_checkpoints WHERE run_type = $1")
                .bind(run_type)
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else {
                return Ok::<_, StoreError>(None);
            };
            let body: serde_json::Value = row.try_get("body")?;
            match serde_json::from_value::<HarvestCheckpoint>(body.clone()) {
                Ok(checkpoint) => Ok(Some(checkpoint)),
                Err(err) if body.is_object() => {
                    warn!(
                        run_type,
                        error = %err,
                        "unreadable checkpoint; keeping completion history only"
                    );
                    let detail = format!("unreadable checkpoint: {err}");
                    Ok(Some(HarvestCheckpoint::salvage(run_type, &body, detail, Utc::now())))
                }
                Err(err) => Err(StoreError::Corrupt {
                    key: run_type.to_string(),
                    detail: err.to_string(),
                }),
            }
        })
        .await
    }

    async fn save_checkpoint(&self, checkpoint: &HarvestCheckpoint) -> Result<(), StoreError> {
        self.bounded(async {
            let body = serde_json::to_value(checkpoint)?;
            let state = serde_json::to_value(checkpoint.state)?;
            sqlx::query(
                r#"
                INSERT INTO harvest_checkpoints (run_type, state, is_in_progress, body, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (run_type) DO UPDATE
                   SET state = EXCLUDED.state,
                       is_in_progress = EXCLUDED.is_in_progress,
                       body = EXCLUDED.body,
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&checkpoint.run_type)
            .bind(state.as_str().unwrap_or_default())
            .bind(checkpoint.is_in_progress)
            .bind(body)
            .bind(checkpoint.updated_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }
}

#[async_trait]
impl FailureStore for PgStore {
    async fn get_failures(
        &self,
        item_ids: &[ItemId],
    ) -> Result<HashMap<ItemId, FailureRecord>, StoreError> {
        let keys: Vec<&str> = item_ids.iter().map(ItemId::as_str).collect();
        self.bounded(async {
            let rows = sqlx::query("SELECT * FROM failure_records WHERE item_id = ANY($1)")
                .bind(&keys)
                .fetch_all(&self.pool)
                .await?;
            let mut out = HashMap::with_capacity(rows.len());
            for row in rows {
                let record = failure_from_row(&row)?;
                out.insert(record.item_id.clone(), record);
            }
            Ok::<_, StoreError>(out)
        })
        .await
    }

    async fn put_failures(&self, records: &[FailureRecord]) -> Result<(), StoreError> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            for record in records {
                sqlx::query(
                    r#"
                    INSERT INTO failure_records
                        (item_id, reason, detail, failure_count,
                         first_failed_at, last_failed_at, recovered_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    ON CONFLICT (item_id) DO UPDATE
                       SET reason = EXCLUDED.reason,
                           detail = EXCLUDED.detail,
                           failure_count = EXCLUDED.failure_count,
                           last_failed_at = EXCLUDED.last_failed_at,
                           recovered_at = EXCLUDED.recovered_at
                    "#,
                )
                .bind(record.item_id.as_str())
                .bind(record.reason.as_str())
                .bind(&record.detail)
                .bind(i32::try_from(record.failure_count).unwrap_or(i32::MAX))
                .bind(record.first_failed_at)
                .bind(record.last_failed_at)
                .bind(record.recovered_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn query_failures(&self, query: &FailureQuery) -> Result<Vec<FailureRecord>, StoreError> {
        let limit = query.limit.map(|l| l as i64);
        self.bounded(async {
            let rows = sqlx::query(
                r#"
                SELECT *
                  FROM failure_records
                 WHERE ($1 = FALSE OR recovered_at IS NULL)
                   AND failure_count >= $2
                 ORDER BY last_failed_at ASC
                 LIMIT $3
                "#,
            )
            .bind(query.only_unrecovered)
            .bind(i32::try_from(query.min_failure_count).unwrap_or(i32::MAX))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(failure_from_row).collect::<Result<Vec<_>, StoreError>>()
        })
        .await
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn get_snapshot(
        &self,
        item_id: &ItemId,
        day: NaiveDate,
    ) -> Result<Option<PriceSnapshot>, StoreError> {
        self.bounded(async {
            let row = sqlx::query("SELECT * FROM price_snapshots WHERE item_id = $1 AND day = $2")
                .bind(item_id.as_str())
                .bind(day)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(snapshot_from_row).transpose()
        })
        .await
    }

    async fn put_snapshot(&self, snapshot: &PriceSnapshot) -> Result<(), StoreError> {
        self.bounded(async {
            sqlx::query(
                r#"
                INSERT INTO price_snapshots
                    (item_id, day, regular_price, discount_price, discount_rate, campaign_id,
                     price_changed, new_campaign, captured_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (item_id, day) DO UPDATE
                   SET regular_price = EXCLUDED.regular_price,
                       discount_price = EXCLUDED.discount_price,
                       discount_rate = EXCLUDED.discount_rate,
                       campaign_id = EXCLUDED.campaign_id,
                       price_changed = EXCLUDED.price_changed,
                       new_campaign = EXCLUDED.new_campaign,
                       updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(snapshot.item_id.as_str())
            .bind(snapshot.day)
            .bind(snapshot.regular_price)
            .bind(snapshot.discount_price)
            .bind(snapshot.discount_rate)
            .bind(&snapshot.campaign_id)
            .bind(snapshot.price_changed)
            .bind(snapshot.new_campaign)
            .bind(snapshot.captured_at)
            .bind(snapshot.updated_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn snapshot_history(&self, item_id: &ItemId) -> Result<Vec<PriceSnapshot>, StoreError> {
        self.bounded(async {
            let rows = sqlx::query(
                "SELECT * FROM price_snapshots WHERE item_id = $1 ORDER BY day ASC",
            )
            .bind(item_id.as_str())
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(snapshot_from_row).collect::<Result<Vec<_>, StoreError>>()
        })
        .await
    }
}
