//! Batch planning: turn due webhooks into delivery jobs.
//!
//! One planner runs at a time, guarded by the lease lock. Planning never
//! moves the cursor; that happens only when the dispatcher confirms a
//! delivery.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use newsflow_ingest::ArticleStore;

use crate::error::Result;
use crate::jobs::JobStore;
use crate::lock::{DistributedLock, PLANNER_LOCK_KEY};
use crate::registry::Webhook;
use crate::sources::SourceStore;

pub struct DeliveryPlanner {
    pool: PgPool,
    jobs: JobStore,
    articles: ArticleStore,
    sources: SourceStore,
    lock: Arc<dyn DistributedLock>,
    min_batch_interval_minutes: i64,
    max_items_per_batch: i64,
    lease_secs: i64,
}

/// Counters for one planning tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    pub due_webhooks: u32,
    pub queued_jobs: u32,
}

impl DeliveryPlanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        jobs: JobStore,
        articles: ArticleStore,
        sources: SourceStore,
        lock: Arc<dyn DistributedLock>,
        min_batch_interval_minutes: i64,
        max_items_per_batch: i64,
        lease_secs: i64,
    ) -> Self {
        Self {
            pool,
            jobs,
            articles,
            sources,
            lock,
            min_batch_interval_minutes,
            max_items_per_batch,
            lease_secs,
        }
    }

    /// One planning tick. Skips silently when another planner holds the
    /// lease.
    pub async fn plan(&self, now: DateTime<Utc>) -> Result<PlanOutcome> {
        let lease = Duration::seconds(self.lease_secs);
        let Some(token) = self.lock.acquire(PLANNER_LOCK_KEY, lease).await? else {
            info!("Skipping planner tick, another planner holds the lease");
            return Ok(PlanOutcome::default());
        };

        let outcome = self.plan_locked(now).await;
        if let Err(err) = self.lock.release(PLANNER_LOCK_KEY, &token).await {
            warn!(error = %err, "Failed to release planner lease");
        }
        outcome
    }

    async fn plan_locked(&self, now: DateTime<Utc>) -> Result<PlanOutcome> {
        let candidates = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT * FROM webhooks
            WHERE is_active AND failure_count < max_failures
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut outcome = PlanOutcome::default();
        for webhook in candidates {
            if !is_due(&webhook, now, self.min_batch_interval_minutes) {
                continue;
            }
            outcome.due_webhooks += 1;
            if self.plan_webhook(&webhook).await? {
                outcome.queued_jobs += 1;
            }
        }

        info!(
            due_webhooks = outcome.due_webhooks,
            queued_jobs = outcome.queued_jobs,
            "Planner tick complete"
        );
        Ok(outcome)
    }

    /// Plan one webhook. Returns whether a new job was queued.
    async fn plan_webhook(&self, webhook: &Webhook) -> Result<bool> {
        let scope = webhook.scope()?;
        let Some(source) = self.sources.resolve(scope, webhook.user_id).await? else {
            warn!(webhook_id = %webhook.webhook_id, "Webhook scope no longer resolves, skipping");
            self.jobs.touch_last_attempted(webhook.webhook_id).await?;
            return Ok(false);
        };

        let cursor = webhook.cursor();
        let batch = self
            .articles
            .matching_after(&source.topics, cursor, self.max_items_per_batch)
            .await?;
        if batch.is_empty() {
            self.jobs.touch_last_attempted(webhook.webhook_id).await?;
            return Ok(false);
        }

        let ids: Vec<Uuid> = batch.iter().map(|a| a.article_id).collect();
        let digest = payload_digest(&ids);
        let window_start = cursor.map(|c| c.published_at);
        // Anchoring the window at the last included article keeps the job
        // reproducible no matter when the planner observed it.
        let window_end = batch
            .last()
            .map(|a| a.published_at)
            .unwrap_or_else(Utc::now);

        let queued = self
            .jobs
            .enqueue(webhook.webhook_id, window_start, window_end, &digest, &ids)
            .await?
            .is_some();
        self.jobs.touch_last_attempted(webhook.webhook_id).await?;
        Ok(queued)
    }
}

/// A webhook is due when its batch interval (floored at the configured
/// minimum) has elapsed since the last planning attempt, or since
/// creation if it was never planned.
pub fn is_due(webhook: &Webhook, now: DateTime<Utc>, min_interval_minutes: i64) -> bool {
    let interval = (webhook.batch_interval_minutes as i64).max(min_interval_minutes);
    let anchor = webhook.last_attempted_at.unwrap_or(webhook.created_at);
    now - anchor >= Duration::minutes(interval)
}

/// SHA-256 over the ordered article ids joined with `|`. The same window
/// contents always produce the same digest, which is what makes job
/// creation idempotent.
pub fn payload_digest(article_ids: &[Uuid]) -> String {
    let joined = article_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join("|");
    hex::encode(Sha256::digest(joined.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(interval: i32, last_attempted: Option<DateTime<Utc>>, created: DateTime<Utc>) -> Webhook {
        Webhook {
            webhook_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            feed_id: Some(Uuid::new_v4()),
            bundle_id: None,
            platform: "https".into(),
            target_encrypted: String::new(),
            secret_encrypted: None,
            batch_interval_minutes: interval,
            max_failures: 5,
            failure_count: 0,
            is_active: true,
            cursor_published_at: None,
            cursor_article_id: None,
            last_attempted_at: last_attempted,
            last_triggered_at: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn due_when_interval_elapsed_since_last_attempt() {
        let now = Utc::now();
        let w = webhook(30, Some(now - Duration::minutes(31)), now - Duration::days(1));
        assert!(is_due(&w, now, 5));

        let w = webhook(30, Some(now - Duration::minutes(29)), now - Duration::days(1));
        assert!(!is_due(&w, now, 5));
    }

    #[test]
    fn never_attempted_webhook_anchors_on_creation() {
        let now = Utc::now();
        let w = webhook(30, None, now - Duration::minutes(31));
        assert!(is_due(&w, now, 5));

        let w = webhook(30, None, now - Duration::minutes(5));
        assert!(!is_due(&w, now, 5));
    }

    #[test]
    fn interval_floored_at_configured_minimum() {
        let now = Utc::now();
        // Asked for every minute, floor is five.
        let w = webhook(1, Some(now - Duration::minutes(3)), now - Duration::days(1));
        assert!(!is_due(&w, now, 5));
        let w = webhook(1, Some(now - Duration::minutes(6)), now - Duration::days(1));
        assert!(is_due(&w, now, 5));
    }

    #[test]
    fn digest_depends_on_order_and_content() {
        let a = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let b = Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap();

        assert_eq!(payload_digest(&[a, b]), payload_digest(&[a, b]));
        assert_ne!(payload_digest(&[a, b]), payload_digest(&[b, a]));
        assert_ne!(payload_digest(&[a]), payload_digest(&[a, b]));
    }

    #[test]
    fn digest_is_sha256_of_joined_ids() {
        let a = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        assert_eq!(
            payload_digest(&[a]),
            hex::encode(Sha256::digest(a.to_string().as_bytes()))
        );
        assert_eq!(payload_digest(&[a]).len(), 64);
    }
}
