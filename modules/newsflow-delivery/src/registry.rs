//! Webhook registry: CRUD for delivery endpoints.
//!
//! Targets and secrets are encrypted before they reach the database and
//! only decrypted at the point of use. Every mutation path funnels
//! through [`TargetValidator`] first.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use newsflow_common::{DeliveryCursor, FeedTarget, Platform, SecretCipher, SecretString};

use crate::error::{DeliveryError, Result};
use crate::validate::{validate_bot_token, TargetValidator};

#[derive(Clone)]
pub struct WebhookRegistry {
    pool: PgPool,
    cipher: Arc<dyn SecretCipher>,
    validator: TargetValidator,
    max_webhooks_per_user: i64,
    min_batch_interval_minutes: i32,
    max_failures_cap: i32,
}

/// A row from the webhooks table. Target and secret stay encrypted here;
/// decryption happens in the registry, at the point of use.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Webhook {
    pub webhook_id: Uuid,
    pub user_id: Uuid,
    pub feed_id: Option<Uuid>,
    pub bundle_id: Option<Uuid>,
    pub platform: String,
    pub target_encrypted: String,
    pub secret_encrypted: Option<String>,
    pub batch_interval_minutes: i32,
    pub max_failures: i32,
    pub failure_count: i32,
    pub is_active: bool,
    pub cursor_published_at: Option<DateTime<Utc>>,
    pub cursor_article_id: Option<Uuid>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn platform(&self) -> Result<Platform> {
        Platform::parse(&self.platform).ok_or_else(|| {
            DeliveryError::Validation(format!("unknown platform: {}", self.platform))
        })
    }

    /// The feed-or-bundle scope. The CHECK constraint guarantees exactly
    /// one side is set.
    pub fn scope(&self) -> Result<FeedTarget> {
        match (self.feed_id, self.bundle_id) {
            (Some(feed_id), None) => Ok(FeedTarget::Feed(feed_id)),
            (None, Some(bundle_id)) => Ok(FeedTarget::Bundle(bundle_id)),
            _ => Err(DeliveryError::Validation(
                "webhook must reference exactly one feed or bundle".into(),
            )),
        }
    }

    pub fn cursor(&self) -> Option<DeliveryCursor> {
        match (self.cursor_published_at, self.cursor_article_id) {
            (Some(published_at), Some(article_id)) => Some(DeliveryCursor {
                published_at,
                article_id,
            }),
            _ => None,
        }
    }
}

/// Parameters for registering a webhook.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub user_id: Uuid,
    pub scope: FeedTarget,
    pub platform: Platform,
    pub target: String,
    pub secret: Option<String>,
    pub batch_interval_minutes: i32,
    pub max_failures: i32,
}

/// Partial update. `None` fields are left untouched; `secret` uses a
/// double Option so callers can distinguish "keep" from "clear".
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdate {
    pub target: Option<String>,
    pub secret: Option<Option<String>>,
    pub batch_interval_minutes: Option<i32>,
    pub max_failures: Option<i32>,
}

impl WebhookRegistry {
    pub fn new(
        pool: PgPool,
        cipher: Arc<dyn SecretCipher>,
        max_webhooks_per_user: i64,
        min_batch_interval_minutes: i32,
        max_failures_cap: i32,
    ) -> Self {
        Self {
            pool,
            cipher,
            validator: TargetValidator::new(),
            max_webhooks_per_user,
            min_batch_interval_minutes,
            max_failures_cap,
        }
    }

    pub async fn create(&self, new: NewWebhook) -> Result<Webhook> {
        self.validator.validate_target(new.platform, &new.target)?;
        if new.platform == Platform::Telegram {
            let secret = new.secret.as_deref().ok_or_else(|| {
                DeliveryError::Validation("Telegram webhook requires a bot token secret".into())
            })?;
            validate_bot_token(secret)?;
        }

        let active: i64 = sqlx::query_scalar(
            r#"
            SELECT count(*) FROM webhooks
            WHERE user_id = $1 AND is_active
            "#,
        )
        .bind(new.user_id)
        .fetch_one(&self.pool)
        .await?;
        if active >= self.max_webhooks_per_user {
            return Err(DeliveryError::Validation(format!(
                "maximum active webhooks reached ({})",
                self.max_webhooks_per_user
            )));
        }

        let (feed_id, bundle_id) = match new.scope {
            FeedTarget::Feed(id) => (Some(id), None),
            FeedTarget::Bundle(id) => (None, Some(id)),
        };
        let interval = new.batch_interval_minutes.max(self.min_batch_interval_minutes);
        let max_failures = new.max_failures.clamp(1, self.max_failures_cap);
        let target_encrypted = self.cipher.encrypt(&new.target)?;
        let secret_encrypted = match new.secret.as_deref() {
            Some(secret) => Some(self.cipher.encrypt(secret)?),
            None => None,
        };

        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            INSERT INTO webhooks
                (user_id, feed_id, bundle_id, platform, target_encrypted,
                 secret_encrypted, batch_interval_minutes, max_failures)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(feed_id)
        .bind(bundle_id)
        .bind(new.platform.as_str())
        .bind(&target_encrypted)
        .bind(&secret_encrypted)
        .bind(interval)
        .bind(max_failures)
        .fetch_one(&self.pool)
        .await?;

        info!(webhook_id = %webhook.webhook_id, platform = %webhook.platform, "Registered webhook");
        Ok(webhook)
    }

    pub async fn update(
        &self,
        webhook_id: Uuid,
        user_id: Uuid,
        update: WebhookUpdate,
    ) -> Result<Option<Webhook>> {
        let Some(existing) = self.get(webhook_id, user_id).await? else {
            return Ok(None);
        };
        let platform = existing.platform()?;

        let target_encrypted = match update.target.as_deref() {
            Some(target) => {
                self.validator.validate_target(platform, target)?;
                Some(self.cipher.encrypt(target)?)
            }
            None => None,
        };
        let secret_encrypted = match &update.secret {
            Some(Some(secret)) => {
                if platform == Platform::Telegram {
                    validate_bot_token(secret)?;
                }
                Some(Some(self.cipher.encrypt(secret)?))
            }
            Some(None) => {
                if platform == Platform::Telegram {
                    return Err(DeliveryError::Validation(
                        "Telegram webhook requires a bot token secret".into(),
                    ));
                }
                Some(None)
            }
            None => None,
        };
        let interval = update
            .batch_interval_minutes
            .map(|m| m.max(self.min_batch_interval_minutes));
        let max_failures = update.max_failures.map(|m| m.clamp(1, self.max_failures_cap));

        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            UPDATE webhooks SET
                target_encrypted = COALESCE($3, target_encrypted),
                secret_encrypted = CASE WHEN $4 THEN $5 ELSE secret_encrypted END,
                batch_interval_minutes = COALESCE($6, batch_interval_minutes),
                max_failures = COALESCE($7, max_failures),
                updated_at = now()
            WHERE webhook_id = $1 AND user_id = $2
            RETURNING *
            "#,
        )
        .bind(webhook_id)
        .bind(user_id)
        .bind(&target_encrypted)
        .bind(secret_encrypted.is_some())
        .bind(secret_encrypted.flatten())
        .bind(interval)
        .bind(max_failures)
        .fetch_optional(&self.pool)
        .await?;

        Ok(webhook)
    }

    pub async fn get(&self, webhook_id: Uuid, user_id: Uuid) -> Result<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT * FROM webhooks
            WHERE webhook_id = $1 AND user_id = $2
            "#,
        )
        .bind(webhook_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(webhook)
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<Webhook>> {
        let webhooks = sqlx::query_as::<_, Webhook>(
            r#"
            SELECT * FROM webhooks
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(webhooks)
    }

    /// Deactivate a webhook and cancel anything still queued for it.
    pub async fn deactivate(&self, webhook_id: Uuid, user_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let deactivated = sqlx::query(
            r#"
            UPDATE webhooks
            SET is_active = false, updated_at = now()
            WHERE webhook_id = $1 AND user_id = $2 AND is_active
            "#,
        )
        .bind(webhook_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        if deactivated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        // In-flight jobs are cancelled too; a send already on the wire may
        // still complete, but mark_delivered discards its result.
        let cancelled = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 'cancelled', updated_at = now()
            WHERE webhook_id = $1 AND status IN ('pending', 'retry_pending', 'processing')
            "#,
        )
        .bind(webhook_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            %webhook_id,
            cancelled_jobs = cancelled.rows_affected(),
            "Deactivated webhook"
        );
        Ok(true)
    }

    /// Decrypt the delivery target for actual use.
    pub fn decrypt_target(&self, webhook: &Webhook) -> Result<SecretString> {
        Ok(self.cipher.decrypt(&webhook.target_encrypted)?)
    }

    /// Decrypt the signing secret or bot token, if one is configured.
    pub fn decrypt_secret(&self, webhook: &Webhook) -> Result<Option<SecretString>> {
        match webhook.secret_encrypted.as_deref() {
            Some(ciphertext) => Ok(Some(self.cipher.decrypt(ciphertext)?)),
            None => Ok(None),
        }
    }

    /// Masked target for display. Never returns the full plaintext.
    pub fn target_preview(&self, webhook: &Webhook) -> String {
        let Ok(target) = self.cipher.decrypt(&webhook.target_encrypted) else {
            return "******".to_string();
        };
        mask_target(&webhook.platform, target.expose())
    }
}

fn mask_target(platform: &str, target: &str) -> String {
    match platform {
        "email" => match target.split_once('@') {
            Some((local, domain)) if !domain.is_empty() => {
                let prefix: String = local.chars().take(2).collect();
                format!("{prefix}***@{domain}")
            }
            _ => "******".to_string(),
        },
        "telegram" => {
            if let Some(handle) = target.strip_prefix('@') {
                let prefix: String = handle.chars().take(3).collect();
                format!("@{prefix}***")
            } else {
                "******".to_string()
            }
        }
        _ => match url::Url::parse(target) {
            Ok(parsed) if parsed.host_str().is_some() => {
                format!(
                    "{}://{}/***",
                    parsed.scheme(),
                    parsed.host_str().unwrap_or_default()
                )
            }
            _ => "******".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_preview_keeps_domain() {
        assert_eq!(mask_target("email", "reader@example.com"), "re***@example.com");
        assert_eq!(mask_target("email", "no-at-sign"), "******");
    }

    #[test]
    fn https_preview_drops_path_and_query() {
        assert_eq!(
            mask_target("https", "https://hooks.example.com/secret-path?key=abc"),
            "https://hooks.example.com/***"
        );
    }

    #[test]
    fn telegram_preview_masks_handle() {
        assert_eq!(mask_target("telegram", "@newsroom_feed"), "@new***");
        assert_eq!(mask_target("telegram", "123456789"), "******");
    }

    #[test]
    fn scope_requires_exactly_one_side() {
        let mut webhook = Webhook {
            webhook_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            feed_id: Some(Uuid::new_v4()),
            bundle_id: None,
            platform: "https".into(),
            target_encrypted: String::new(),
            secret_encrypted: None,
            batch_interval_minutes: 30,
            max_failures: 5,
            failure_count: 0,
            is_active: true,
            cursor_published_at: None,
            cursor_article_id: None,
            last_attempted_at: None,
            last_triggered_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(matches!(webhook.scope(), Ok(FeedTarget::Feed(_))));

        webhook.bundle_id = Some(Uuid::new_v4());
        assert!(webhook.scope().is_err());

        webhook.feed_id = None;
        assert!(matches!(webhook.scope(), Ok(FeedTarget::Bundle(_))));
    }
}
