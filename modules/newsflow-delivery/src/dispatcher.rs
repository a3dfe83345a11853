//! Job execution: claim, render, send, record the outcome.
//!
//! The webhook cursor advances only on a confirmed delivery, so a crashed
//! worker or a failed send can never skip articles. Retry timing is
//! exponential with jitter so a flapping endpoint does not see synchronized
//! waves of retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use newsflow_common::{DeliveryCursor, Platform};

use newsflow_ingest::ArticleStore;

use crate::error::{DeliveryError, Result, SendError};
use crate::jobs::{DeliveryJob, JobArticle, JobStore};
use crate::registry::{Webhook, WebhookRegistry};
use crate::render::{render, RenderContext, RenderItem};
use crate::sender::SenderTable;
use crate::sources::SourceStore;

const BACKOFF_BASE_SECS: i64 = 60;
const BACKOFF_CAP_SECS: i64 = 4 * 60 * 60;
const BACKOFF_JITTER: f64 = 0.25;

/// Test sends are throttled harder than batch deliveries.
const TEST_SEND_MIN_GAP_SECS: i64 = 60;
const TEST_SEND_ITEMS: i64 = 3;

pub struct Dispatcher {
    jobs: JobStore,
    articles: ArticleStore,
    registry: WebhookRegistry,
    sources: SourceStore,
    senders: SenderTable,
    max_attempts: i32,
    test_send_log: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

/// What a single poll accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Delivered,
    Retried,
    Failed,
    DeadLettered,
    Cancelled,
}

/// Decision for a failed send attempt. `attempts_after` already includes
/// the attempt that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry,
    Fail,
    DeadLetter,
}

pub fn failure_action(
    attempts_after: i32,
    max_attempts: i32,
    permanent: bool,
    failure_count_before: i32,
    max_failures: i32,
) -> FailureAction {
    if !permanent && attempts_after < max_attempts {
        return FailureAction::Retry;
    }
    if failure_count_before + 1 >= max_failures {
        FailureAction::DeadLetter
    } else {
        FailureAction::Fail
    }
}

/// Backoff before retry `attempt` (1-based), without jitter.
pub fn backoff_base_secs(attempt: u32) -> i64 {
    let doublings = attempt.saturating_sub(1).min(30);
    (BACKOFF_BASE_SECS << doublings).min(BACKOFF_CAP_SECS)
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = backoff_base_secs(attempt) as f64;
    let factor = rand::rng().random_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    Duration::seconds((base * factor).round() as i64)
}

impl Dispatcher {
    pub fn new(
        jobs: JobStore,
        articles: ArticleStore,
        registry: WebhookRegistry,
        sources: SourceStore,
        senders: SenderTable,
        max_attempts: i32,
    ) -> Self {
        Self {
            jobs,
            articles,
            registry,
            sources,
            senders,
            max_attempts,
            test_send_log: Mutex::new(HashMap::new()),
        }
    }

    /// Claim and run at most one job. Returns `Idle` when nothing is
    /// runnable.
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let Some(job) = self.jobs.claim_next().await? else {
            return Ok(PollOutcome::Idle);
        };
        self.run_claimed(job).await
    }

    async fn run_claimed(&self, job: DeliveryJob) -> Result<PollOutcome> {
        let webhook = self.jobs.webhook(job.webhook_id).await?.ok_or_else(|| {
            DeliveryError::Validation(format!("job {} references missing webhook", job.job_id))
        })?;
        // The claim predicate checked activity, but deactivation can race
        // the claim; re-check before spending a send.
        if !webhook.is_active {
            self.jobs.mark_cancelled(job.job_id).await?;
            return Ok(PollOutcome::Cancelled);
        }

        let articles = self.jobs.articles_for(job.job_id).await?;
        if articles.is_empty() {
            // Every article in the window was deleted since planning.
            self.jobs.mark_cancelled(job.job_id).await?;
            info!(job_id = %job.job_id, "Cancelled job with no remaining articles");
            return Ok(PollOutcome::Cancelled);
        }

        let outcome = self.send_job(&job, &webhook, &articles).await?;
        match outcome {
            Ok(()) => {
                let last = &articles[articles.len() - 1];
                let cursor = DeliveryCursor {
                    published_at: job.window_end,
                    article_id: last.article_id,
                };
                let advanced = self
                    .jobs
                    .mark_delivered(job.job_id, webhook.webhook_id, cursor)
                    .await?;
                if !advanced {
                    // Deactivated while the send was on the wire; the
                    // result is discarded and the cursor stays put.
                    info!(job_id = %job.job_id, "Discarded delivery for deactivated webhook");
                    return Ok(PollOutcome::Cancelled);
                }
                info!(job_id = %job.job_id, webhook_id = %webhook.webhook_id, "Delivered job");
                Ok(PollOutcome::Delivered)
            }
            Err(send_err) => self.record_failure(&job, &webhook, &send_err).await,
        }
    }

    async fn send_job(
        &self,
        job: &DeliveryJob,
        webhook: &Webhook,
        articles: &[JobArticle],
    ) -> Result<std::result::Result<(), SendError>> {
        let platform = webhook.platform()?;
        let source = self
            .sources
            .resolve(webhook.scope()?, webhook.user_id)
            .await?;
        let (source_id, source_name) = match source {
            Some(s) => (s.source_id, s.name),
            None => (webhook.webhook_id, "Feed".to_string()),
        };

        let ctx = RenderContext {
            job_id: job.job_id,
            source_id,
            source_name,
            window_end: job.window_end,
            items: articles.iter().map(render_item).collect(),
        };
        let message = render(platform, &ctx)?;

        let target = self.registry.decrypt_target(webhook)?;
        let secret = self.registry.decrypt_secret(webhook)?;

        Ok(self
            .senders
            .for_platform(platform)
            .send(&target, secret.as_ref(), &message)
            .await)
    }

    async fn record_failure(
        &self,
        job: &DeliveryJob,
        webhook: &Webhook,
        send_err: &SendError,
    ) -> Result<PollOutcome> {
        let attempts_after = job.attempts + 1;
        let label = send_err.label();
        let action = failure_action(
            attempts_after,
            self.max_attempts,
            send_err.is_permanent(),
            webhook.failure_count,
            webhook.max_failures,
        );

        match action {
            FailureAction::Retry => {
                let next_retry_at = Utc::now() + backoff_delay(attempts_after as u32);
                self.jobs.mark_retry(job.job_id, &label, next_retry_at).await?;
                info!(
                    job_id = %job.job_id,
                    error = %label,
                    attempts = attempts_after,
                    %next_retry_at,
                    "Send failed, retry scheduled"
                );
                Ok(PollOutcome::Retried)
            }
            FailureAction::Fail | FailureAction::DeadLetter => {
                let record = self
                    .jobs
                    .mark_failed(job.job_id, webhook.webhook_id, &label)
                    .await?;
                if record.deactivated {
                    warn!(
                        webhook_id = %webhook.webhook_id,
                        failure_count = record.failure_count,
                        "Webhook deactivated after repeated failures"
                    );
                    Ok(PollOutcome::DeadLettered)
                } else {
                    warn!(job_id = %job.job_id, error = %label, "Job failed");
                    Ok(PollOutcome::Failed)
                }
            }
        }
    }

    /// Ad-hoc send of the most recent matching articles. Touches nothing:
    /// no cursor advance, no attempt or failure accounting.
    pub async fn test_delivery(
        &self,
        webhook_id: Uuid,
        user_id: Uuid,
    ) -> Result<std::result::Result<(), SendError>> {
        let now = Utc::now();
        self.check_test_throttle(webhook_id, now)?;

        let webhook = self
            .registry
            .get(webhook_id, user_id)
            .await?
            .ok_or_else(|| DeliveryError::Validation("webhook not found".into()))?;
        let platform = webhook.platform()?;

        let source = self
            .sources
            .resolve(webhook.scope()?, webhook.user_id)
            .await?
            .ok_or_else(|| DeliveryError::Validation("webhook scope not found".into()))?;

        let recent = self
            .articles
            .recent_matching(&source.topics, TEST_SEND_ITEMS)
            .await?;
        let window_end = recent.first().map(|a| a.published_at).unwrap_or(now);
        let items: Vec<RenderItem> = recent
            .iter()
            .map(|a| RenderItem {
                article_id: a.article_id,
                title: a.title.clone(),
                url: a.url.clone(),
                source_name: a.source_name.clone(),
                published_at: a.published_at,
                topics: a.topics.clone(),
            })
            .collect();

        let ctx = RenderContext {
            job_id: Uuid::new_v4(),
            source_id: source.source_id,
            source_name: source.name,
            window_end,
            items,
        };
        let message = render(platform, &ctx)?;
        let target = self.registry.decrypt_target(&webhook)?;
        let secret = self.registry.decrypt_secret(&webhook)?;

        Ok(self
            .senders
            .for_platform(platform)
            .send(&target, secret.as_ref(), &message)
            .await)
    }

    fn check_test_throttle(&self, webhook_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut log = self
            .test_send_log
            .lock()
            .map_err(|_| DeliveryError::Validation("test send throttle poisoned".into()))?;
        if let Some(last) = log.get(&webhook_id) {
            if now - *last < Duration::seconds(TEST_SEND_MIN_GAP_SECS) {
                return Err(DeliveryError::Validation(
                    "test delivery throttled, try again shortly".into(),
                ));
            }
        }
        log.insert(webhook_id, now);
        Ok(())
    }
}

fn render_item(article: &JobArticle) -> RenderItem {
    RenderItem {
        article_id: article.article_id,
        title: article.title.clone(),
        url: article.url.clone(),
        source_name: article.source_name.clone(),
        published_at: article.published_at,
        topics: article.topics.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_retry_until_attempts_exhausted() {
        // Two transient failures, then success never reaches this code;
        // the third transient failure lands terminal.
        assert_eq!(failure_action(1, 3, false, 0, 5), FailureAction::Retry);
        assert_eq!(failure_action(2, 3, false, 0, 5), FailureAction::Retry);
        assert_eq!(failure_action(3, 3, false, 0, 5), FailureAction::Fail);
    }

    #[test]
    fn permanent_failures_skip_the_ladder() {
        assert_eq!(failure_action(1, 3, true, 0, 5), FailureAction::Fail);
    }

    #[test]
    fn fifth_consecutive_terminal_failure_dead_letters() {
        assert_eq!(failure_action(3, 3, false, 3, 5), FailureAction::Fail);
        assert_eq!(failure_action(3, 3, false, 4, 5), FailureAction::DeadLetter);
        assert_eq!(failure_action(1, 3, true, 4, 5), FailureAction::DeadLetter);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_base_secs(1), 60);
        assert_eq!(backoff_base_secs(2), 120);
        assert_eq!(backoff_base_secs(3), 240);
        assert_eq!(backoff_base_secs(9), 4 * 60 * 60);
        assert_eq!(backoff_base_secs(40), 4 * 60 * 60);
    }

    #[tokio::test]
    async fn test_sends_are_throttled_per_webhook() {
        use newsflow_common::{CommonError, SecretCipher, SecretString};

        struct Passthrough;
        impl SecretCipher for Passthrough {
            fn encrypt(&self, plaintext: &str) -> std::result::Result<String, CommonError> {
                Ok(plaintext.to_string())
            }
            fn decrypt(&self, ciphertext: &str) -> std::result::Result<SecretString, CommonError> {
                Ok(SecretString::new(ciphertext.to_string()))
            }
        }

        struct NoMail;
        #[async_trait::async_trait]
        impl crate::sender::Mailer for NoMail {
            async fn send_email(&self, _: &str, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let pool = sqlx::PgPool::connect_lazy("postgres://unused/unused").unwrap();
        let timeout = std::time::Duration::from_secs(1);
        let dispatcher = Dispatcher::new(
            crate::jobs::JobStore::new(pool.clone()),
            ArticleStore::new(pool.clone()),
            WebhookRegistry::new(pool.clone(), Arc::new(Passthrough), 10, 5, 5),
            SourceStore::new(pool),
            SenderTable::new(
                crate::sender::HttpsSender::new(timeout).unwrap(),
                crate::sender::TelegramSender::new(timeout).unwrap(),
                crate::sender::EmailSender::new(Arc::new(NoMail)),
            ),
            3,
        );

        let webhook_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let now = Utc::now();
        assert!(dispatcher.check_test_throttle(webhook_id, now).is_ok());
        assert!(dispatcher.check_test_throttle(webhook_id, now + Duration::seconds(10)).is_err());
        assert!(dispatcher.check_test_throttle(other, now + Duration::seconds(10)).is_ok());
        assert!(dispatcher
            .check_test_throttle(webhook_id, now + Duration::seconds(TEST_SEND_MIN_GAP_SECS + 1))
            .is_ok());
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        for attempt in 1..6 {
            let base = backoff_base_secs(attempt);
            for _ in 0..50 {
                let delay = backoff_delay(attempt).num_seconds();
                let lo = (base as f64 * (1.0 - BACKOFF_JITTER)).floor() as i64;
                let hi = (base as f64 * (1.0 + BACKOFF_JITTER)).ceil() as i64;
                assert!(delay >= lo && delay <= hi, "attempt {attempt}: {delay}");
            }
        }
    }
}
