//! PostgreSQL quarantine store.
//!
//! Each record is stored whole as JSONB alongside the scalar columns used for
//! filtering. `persist` runs read-merge-write inside one transaction holding a
//! row lock, so concurrent writers for the same message id serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::{
    QuarantineError, QuarantineQuery, QuarantineRecord, QuarantineResult, QuarantineSink,
    QuarantineStats, Resolution,
};
use crate::messaging::MessageId;

const SCHEMA: &str = include_str!("../../migrations/20261001000000_create_quarantined_messages.sql");

#[derive(Debug, Clone)]
pub struct PgQuarantineStore {
    pool: PgPool,
}

impl PgQuarantineStore {
    /// Connect and make sure the table exists
    pub async fn connect(database_url: &str, max_connections: u32) -> QuarantineResult<Self> {
        info!(max_connections, "Connecting quarantine store to PostgreSQL");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self::from_pool(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Use an existing pool; the caller is responsible for the schema
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> QuarantineResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("Quarantine schema ensured");
        Ok(())
    }

    fn decode(row: &sqlx::postgres::PgRow) -> QuarantineResult<QuarantineRecord> {
        let Json(record): Json<QuarantineRecord> = row.try_get("record")?;
        Ok(record)
    }

    async fn upsert<'e, E>(executor: E, record: &QuarantineRecord) -> QuarantineResult<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO quarantined_messages
                (message_id, failure_kind, reason, quarantined_at, resolved_at, record, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (message_id) DO UPDATE SET
                failure_kind = EXCLUDED.failure_kind,
                reason = EXCLUDED.reason,
                quarantined_at = EXCLUDED.quarantined_at,
                resolved_at = EXCLUDED.resolved_at,
                record = EXCLUDED.record,
                updated_at = NOW()
            "#,
        )
        .bind(record.message_id.as_str())
        .bind(record.failure_kind.to_string())
        .bind(&record.reason)
        .bind(record.quarantined_at)
        .bind(record.resolution.as_ref().map(|r| r.resolved_at))
        .bind(Json(record))
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QuarantineSink for PgQuarantineStore {
    #[instrument(skip(self, record), fields(message_id = %record.message_id))]
    async fn persist(&self, record: QuarantineRecord) -> QuarantineResult<()> {
        let mut tx = self.pool.begin().await?;

        // Row locks cannot serialize two first-time inserts of the same id
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(record.message_id.as_str())
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(
            "SELECT record FROM quarantined_messages WHERE message_id = $1 FOR UPDATE",
        )
        .bind(record.message_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let merged = match existing {
            Some(row) => QuarantineRecord::merge(Self::decode(&row)?, record),
            None => record,
        };
        Self::upsert(&mut *tx, &merged).await?;
        tx.commit().await?;

        debug!(
            history_len = merged.attempt_history.len(),
            "Quarantine record written"
        );
        Ok(())
    }

    async fn get(&self, message_id: &MessageId) -> QuarantineResult<Option<QuarantineRecord>> {
        let row = sqlx::query("SELECT record FROM quarantined_messages WHERE message_id = $1")
            .bind(message_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn list(&self, query: &QuarantineQuery) -> QuarantineResult<Vec<QuarantineRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM quarantined_messages
            WHERE ($1::timestamptz IS NULL OR quarantined_at >= $1)
              AND ($2::timestamptz IS NULL OR quarantined_at < $2)
              AND ($3::text IS NULL OR failure_kind = $3)
              AND ($4::boolean OR resolved_at IS NULL)
            ORDER BY quarantined_at ASC, message_id ASC
            LIMIT $5 OFFSET $6
            "#,
        )
        .bind(query.from)
        .bind(query.to)
        .bind(query.failure_kind.map(|k| k.to_string()))
        .bind(query.include_resolved)
        .bind(query.limit.map(|l| l as i64))
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::decode).collect()
    }

    async fn mark_resolved(
        &self,
        message_id: &MessageId,
        resolution: Resolution,
    ) -> QuarantineResult<QuarantineRecord> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT record FROM quarantined_messages WHERE message_id = $1 FOR UPDATE",
        )
        .bind(message_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| QuarantineError::not_found(message_id))?;

        let mut record = Self::decode(&row)?;
        if record.resolution.is_none() {
            record.resolution = Some(resolution);
            Self::upsert(&mut *tx, &record).await?;
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn stats(&self) -> QuarantineResult<QuarantineStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE failure_kind = 'transient') AS transient,
                COUNT(*) FILTER (WHERE failure_kind = 'poison') AS poison,
                COUNT(*) FILTER (WHERE failure_kind = 'unknown') AS unknown,
                COUNT(*) FILTER (WHERE resolved_at IS NOT NULL) AS resolved
            FROM quarantined_messages
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> QuarantineResult<u64> {
            Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
        };
        Ok(QuarantineStats {
            total: count("total")?,
            transient: count("transient")?,
            poison: count("poison")?,
            unknown: count("unknown")?,
            resolved: count("resolved")?,
        })
    }

    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> QuarantineResult<u64> {
        let result = sqlx::query(
            "DELETE FROM quarantined_messages WHERE resolved_at IS NOT NULL AND resolved_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
