//! PostgreSQL job queue.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED`, so several workers (or replicas)
//! can poll the same table without handing one job to two of them. A claim
//! pushes `next_attempt_at` out by the lease; if the worker dies the job
//! becomes due again when the lease runs out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use super::{JOB, JobQueue};
use crate::db::errors::{DbError, Result};
use crate::fulfillment::{AppliedCredit, FulfillmentJob, FulfillmentRequest, JobStatus, JobStep};
use crate::types::{JobId, OrderId, abbrev_uuid};

const JOB_COLUMNS: &str = "id, order_id, user_id, credits, source, status, step, attempts, max_attempts, \
     next_attempt_at, last_error, applied, created_at, updated_at";

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    order_id: Uuid,
    user_id: Uuid,
    credits: i64,
    source: String,
    status: String,
    step: String,
    attempts: i32,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    applied: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for FulfillmentJob {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self> {
        let corrupt = |reason: String| DbError::Corrupt { entity: JOB, reason };
        let applied = row
            .applied
            .map(serde_json::from_value::<AppliedCredit>)
            .transpose()
            .map_err(|e| corrupt(format!("applied: {e}")))?;
        Ok(FulfillmentJob {
            id: row.id,
            order_id: row.order_id,
            user_id: row.user_id,
            credits: row.credits,
            source: row.source.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            step: row.step.parse().map_err(corrupt)?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            applied,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_by(&self, column: &str, value: Uuid) -> Result<Option<FulfillmentJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM fulfillment_jobs WHERE {column} = $1");
        sqlx::query_as::<_, JobRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .map(FulfillmentJob::try_from)
            .transpose()
    }

    /// Run an update that must hit exactly one job
    async fn update_one(&self, id: JobId, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>) -> Result<()> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            tracing::warn!(job_id = %abbrev_uuid(&id), "Fulfillment job vanished during update");
            return Err(DbError::not_found(JOB));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[instrument(skip(self, request), fields(order_id = %abbrev_uuid(&request.order_id), source = %request.source), err)]
    async fn enqueue(&self, request: &FulfillmentRequest, max_attempts: i32) -> Result<FulfillmentJob> {
        // Re-arm only jobs that failed before crediting anything
        let sql = format!(
            r#"
            INSERT INTO fulfillment_jobs (id, order_id, user_id, credits, source, status, step, attempts, max_attempts)
            VALUES ($1, $2, $3, $4, $5, 'queued', 'validate_order', 0, $6)
            ON CONFLICT (order_id) DO UPDATE
            SET status = 'queued', step = 'validate_order', attempts = 0, max_attempts = EXCLUDED.max_attempts,
                next_attempt_at = NOW(), updated_at = NOW()
            WHERE fulfillment_jobs.status = 'failed' AND fulfillment_jobs.applied IS NULL
            RETURNING {JOB_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(request.order_id)
            .bind(request.user_id)
            .bind(request.credits)
            .bind(request.source.as_str())
            .bind(max_attempts)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(row) => row.try_into(),
            None => self.fetch_one_by("order_id", request.order_id).await?.ok_or(DbError::not_found(JOB)),
        }
    }

    async fn claim_due(&self, limit: i64, lease: Duration) -> Result<Vec<FulfillmentJob>> {
        let mut tx = self.pool.begin().await?;

        // A run that died on its final attempt has nothing left to retry with
        let abandoned = sqlx::query(
            r#"
            UPDATE fulfillment_jobs
            SET status = 'failed', last_error = 'lease expired on final attempt', updated_at = NOW()
            WHERE status = 'running' AND next_attempt_at <= NOW() AND attempts >= max_attempts
            "#,
        )
        .execute(&mut *tx)
        .await?;
        if abandoned.rows_affected() > 0 {
            tracing::warn!(count = abandoned.rows_affected(), "Failed fulfillment jobs abandoned on their final attempt");
        }

        let sql = format!(
            r#"
            UPDATE fulfillment_jobs
            SET status = 'running',
                attempts = attempts + 1,
                next_attempt_at = NOW() + ($2 * INTERVAL '1 second'),
                updated_at = NOW()
            WHERE id IN (
                SELECT id
                FROM fulfillment_jobs
                WHERE status IN ('queued', 'running')
                    AND next_attempt_at <= NOW()
                ORDER BY next_attempt_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(limit)
            .bind(lease.as_secs_f64())
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        rows.into_iter().map(FulfillmentJob::try_from).collect()
    }

    async fn save_progress(&self, id: JobId, step: JobStep, applied: Option<&AppliedCredit>) -> Result<()> {
        let applied = applied
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| DbError::Other(anyhow::anyhow!("serialize applied credit: {e}")))?;

        self.update_one(
            id,
            sqlx::query(
                "UPDATE fulfillment_jobs SET step = $2, applied = COALESCE($3, applied), updated_at = NOW() WHERE id = $1",
            )
            .bind(id)
            .bind(step.as_str())
            .bind(applied),
        )
        .await
    }

    async fn finish(&self, id: JobId, status: JobStatus) -> Result<()> {
        self.update_one(
            id,
            sqlx::query("UPDATE fulfillment_jobs SET status = $2, last_error = NULL, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(status.as_str()),
        )
        .await
    }

    async fn retry_later(&self, id: JobId, error: &str, delay: Duration) -> Result<()> {
        self.update_one(
            id,
            sqlx::query(
                r#"
                UPDATE fulfillment_jobs
                SET status = 'queued', last_error = $2, next_attempt_at = NOW() + ($3 * INTERVAL '1 second'), updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(delay.as_secs_f64()),
        )
        .await
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<()> {
        self.update_one(
            id,
            sqlx::query("UPDATE fulfillment_jobs SET status = 'failed', last_error = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(error),
        )
        .await
    }

    async fn get(&self, id: JobId) -> Result<Option<FulfillmentJob>> {
        self.fetch_one_by("id", id).await
    }

    async fn get_by_order(&self, order_id: OrderId) -> Result<Option<FulfillmentJob>> {
        self.fetch_one_by("order_id", order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(applied: Option<serde_json::Value>) -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            credits: 120,
            source: "checkout".to_string(),
            status: "queued".to_string(),
            step: "apply_credit".to_string(),
            attempts: 1,
            max_attempts: 3,
            next_attempt_at: Utc::now(),
            last_error: None,
            applied,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_job_row_maps_text_columns() {
        let job = FulfillmentJob::try_from(row(None)).unwrap();
        assert_eq!(job.step, JobStep::ApplyCredit);
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_unreadable_applied_is_corrupt() {
        let err = FulfillmentJob::try_from(row(Some(serde_json::json!({"nope": 1})))).unwrap_err();
        assert!(matches!(err, DbError::Corrupt { entity: JOB, .. }));
    }
}
