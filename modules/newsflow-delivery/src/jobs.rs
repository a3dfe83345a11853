//! Postgres persistence for delivery jobs and their item lists.
//!
//! Job state transitions all happen through conditional UPDATEs so that
//! competing dispatcher workers never act on the same job twice.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use newsflow_common::{DeliveryCursor, JobStatus};

use crate::error::{DeliveryError, Result};
use crate::registry::Webhook;

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

/// A row from the delivery_jobs table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeliveryJob {
    pub job_id: Uuid,
    pub webhook_id: Uuid,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: DateTime<Utc>,
    pub status: String,
    pub attempts: i32,
    pub payload_digest: String,
    pub article_count: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn status(&self) -> Result<JobStatus> {
        JobStatus::parse(&self.status)
            .ok_or_else(|| DeliveryError::Validation(format!("unknown job status: {}", self.status)))
    }
}

/// An article joined through a job's item list, in payload order.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobArticle {
    pub article_id: Uuid,
    pub title: String,
    pub url: String,
    pub source_name: String,
    pub published_at: DateTime<Utc>,
    pub topics: Vec<String>,
}

/// What became of the webhook after a terminal job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecord {
    pub failure_count: i32,
    pub deactivated: bool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a job and its item rows. Returns `None` when the
    /// (webhook, window_end, digest) constraint says the job already
    /// exists; planner reruns over an unchanged corpus land here.
    pub async fn enqueue(
        &self,
        webhook_id: Uuid,
        window_start: Option<DateTime<Utc>>,
        window_end: DateTime<Utc>,
        payload_digest: &str,
        article_ids: &[Uuid],
    ) -> Result<Option<DeliveryJob>> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, DeliveryJob>(
            r#"
            INSERT INTO delivery_jobs
                (webhook_id, window_start, window_end, payload_digest, article_count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (webhook_id, window_end, payload_digest) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(webhook_id)
        .bind(window_start)
        .bind(window_end)
        .bind(payload_digest)
        .bind(article_ids.len() as i32)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            tx.rollback().await?;
            return Ok(None);
        };

        let positions: Vec<i32> = (0..article_ids.len() as i32).collect();
        sqlx::query(
            r#"
            INSERT INTO delivery_items (job_id, article_id, position)
            SELECT $1, ids.article_id, ids.position
            FROM UNNEST($2::uuid[], $3::int[]) AS ids(article_id, position)
            "#,
        )
        .bind(job.job_id)
        .bind(article_ids)
        .bind(&positions)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(job_id = %job.job_id, %webhook_id, items = article_ids.len(), "Queued delivery job");
        Ok(Some(job))
    }

    /// Atomically claim the next runnable job and flip it to processing.
    ///
    /// A job is runnable when it is pending or due for retry, its webhook
    /// is active, no sibling job is already in flight, and no earlier
    /// sibling is still unresolved. "Earlier" is total-ordered over
    /// (window_end, job_id), so two jobs sharing a window_end cannot both
    /// pass the guard. SKIP LOCKED keeps concurrent workers from queueing
    /// behind each other.
    pub async fn claim_next(&self) -> Result<Option<DeliveryJob>> {
        let job = sqlx::query_as::<_, DeliveryJob>(
            r#"
            UPDATE delivery_jobs
            SET status = 'processing', updated_at = now()
            WHERE job_id = (
                SELECT j.job_id
                FROM delivery_jobs j
                JOIN webhooks w ON w.webhook_id = j.webhook_id
                WHERE j.status IN ('pending', 'retry_pending')
                  AND (j.next_retry_at IS NULL OR j.next_retry_at <= now())
                  AND w.is_active
                  AND NOT EXISTS (
                      SELECT 1 FROM delivery_jobs f
                      WHERE f.webhook_id = j.webhook_id AND f.status = 'processing'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM delivery_jobs e
                      WHERE e.webhook_id = j.webhook_id
                        AND (e.window_end, e.job_id) < (j.window_end, j.job_id)
                        AND e.status NOT IN ('delivered', 'failed', 'dead_letter', 'cancelled')
                  )
                ORDER BY j.window_end ASC, j.job_id ASC
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// The job's articles in payload order. Soft-deleted articles drop
    /// out; the payload simply shrinks.
    pub async fn articles_for(&self, job_id: Uuid) -> Result<Vec<JobArticle>> {
        let rows = sqlx::query_as::<_, JobArticle>(
            r#"
            SELECT a.article_id, a.title, a.url, a.source_name, a.published_at, a.topics
            FROM delivery_items i
            JOIN articles a ON a.article_id = i.article_id
            WHERE i.job_id = $1 AND a.deleted_at IS NULL
            ORDER BY i.position ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn webhook(&self, webhook_id: Uuid) -> Result<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT * FROM webhooks WHERE webhook_id = $1
            "#,
        )
        .bind(webhook_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(webhook)
    }

    pub async fn touch_last_attempted(&self, webhook_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhooks SET last_attempted_at = now(), updated_at = now()
            WHERE webhook_id = $1
            "#,
        )
        .bind(webhook_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Success path: terminal `delivered`, cursor advance, failure counter
    /// reset. The cursor only ever moves here. Returns `false` when the
    /// webhook was deactivated while the job was in flight; the result is
    /// then discarded and the job marked `cancelled` instead.
    pub async fn mark_delivered(
        &self,
        job_id: Uuid,
        webhook_id: Uuid,
        cursor: DeliveryCursor,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let advanced = sqlx::query(
            r#"
            UPDATE webhooks
            SET failure_count = 0,
                last_triggered_at = now(),
                cursor_published_at = $2,
                cursor_article_id = $3,
                updated_at = now()
            WHERE webhook_id = $1 AND is_active
            "#,
        )
        .bind(webhook_id)
        .bind(cursor.published_at)
        .bind(cursor.article_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = $2, last_error = NULL, updated_at = now()
            WHERE job_id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(if advanced { "delivered" } else { "cancelled" })
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(advanced)
    }

    /// Transient failure: bump attempts and park the job until the
    /// backoff elapses. Webhook counters stay untouched.
    pub async fn mark_retry(
        &self,
        job_id: Uuid,
        error_label: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'retry_pending',
                attempts = attempts + 1,
                last_error = $2,
                next_retry_at = $3,
                updated_at = now()
            WHERE job_id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(error_label)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Terminal failure: the job fails, the webhook counts one more
    /// consecutive failure, and at the cap the webhook is deactivated with
    /// the job parked in dead_letter.
    pub async fn mark_failed(
        &self,
        job_id: Uuid,
        webhook_id: Uuid,
        error_label: &str,
    ) -> Result<FailureRecord> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'failed',
                attempts = attempts + 1,
                last_error = $2,
                updated_at = now()
            WHERE job_id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(error_label)
        .execute(&mut *tx)
        .await?;

        let (failure_count, max_failures) = sqlx::query_as::<_, (i32, i32)>(
            r#"
            UPDATE webhooks
            SET failure_count = failure_count + 1, updated_at = now()
            WHERE webhook_id = $1
            RETURNING failure_count, max_failures
            "#,
        )
        .bind(webhook_id)
        .fetch_one(&mut *tx)
        .await?;

        let deactivated = failure_count >= max_failures;
        if deactivated {
            sqlx::query(
                r#"
                UPDATE webhooks SET is_active = false, updated_at = now()
                WHERE webhook_id = $1
                "#,
            )
            .bind(webhook_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                UPDATE delivery_jobs SET status = 'dead_letter', updated_at = now()
                WHERE job_id = $1
                "#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(FailureRecord {
            failure_count,
            deactivated,
        })
    }

    /// Webhook went inactive while the job was in flight; the result is
    /// discarded.
    pub async fn mark_cancelled(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE delivery_jobs SET status = 'cancelled', updated_at = now()
            WHERE job_id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Requeue jobs stuck in `processing` past the claim timeout. A claim
    /// has no lease of its own, so a crashed worker would otherwise leave
    /// its job in flight forever and block the webhook's whole queue.
    pub async fn requeue_stalled(&self, stale_after: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - stale_after;
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'retry_pending', next_retry_at = now(), updated_at = now()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            warn!(requeued, "Requeued stalled delivery jobs");
        }
        Ok(requeued)
    }

    /// Purge terminal jobs older than the retention cutoff. Items go with
    /// them via FK cascade.
    pub async fn cleanup_history(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days.max(1));
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_jobs
            WHERE status IN ('delivered', 'failed', 'dead_letter', 'cancelled')
              AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, retention_days, "Cleaned delivery history");
        }
        Ok(deleted)
    }
}
