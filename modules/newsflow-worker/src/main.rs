mod mailer;
mod runner;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use newsflow_common::{AeadCipher, Config, SecretCipher};
use newsflow_delivery::{
    DeliveryPlanner, Dispatcher, DistributedLock, EmailSender, HttpsSender, JobStore, Mailer,
    PgLeaseLock, SenderTable, SourceStore, TelegramSender, UsageAccounting, WebhookRegistry,
};
use newsflow_ingest::ArticleStore;

use crate::mailer::{DisabledMailer, RelayMailer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting newsflow-worker");

    let config = Config::from_env();
    config.log_redacted();

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    tracing::info!("Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Migrations complete");

    let lock = Arc::new(PgLeaseLock::new(pool.clone()));
    startup_health_check(&pool, lock.as_ref()).await?;

    let cipher: Arc<dyn SecretCipher> = Arc::new(AeadCipher::new(
        &config.encryption_key,
        config.encryption_key_previous.as_deref(),
    )?);

    let articles = ArticleStore::new(pool.clone());
    let jobs = JobStore::new(pool.clone());
    let sources = SourceStore::new(pool.clone());
    let registry = WebhookRegistry::new(
        pool.clone(),
        cipher,
        config.max_webhooks_per_user,
        config.min_batch_interval_minutes as i32,
        config.webhook_max_failures,
    );

    let send_timeout = Duration::from_secs(config.send_timeout_secs);
    let mailer: Arc<dyn Mailer> = match &config.mail_relay_url {
        Some(relay_url) => Arc::new(RelayMailer::new(
            relay_url.clone(),
            config.mail_relay_token.clone(),
            send_timeout,
        )?),
        None => {
            tracing::warn!("MAIL_RELAY_URL not set, email deliveries will fail");
            Arc::new(DisabledMailer)
        }
    };
    let senders = SenderTable::new(
        HttpsSender::new(send_timeout)?,
        TelegramSender::new(send_timeout)?,
        EmailSender::new(mailer),
    );

    let planner = DeliveryPlanner::new(
        pool.clone(),
        jobs.clone(),
        articles.clone(),
        sources.clone(),
        lock,
        config.min_batch_interval_minutes,
        config.max_items_per_batch,
        config.planner_lease_secs,
    );
    let dispatcher = Dispatcher::new(
        jobs.clone(),
        articles,
        registry,
        sources,
        senders,
        config.send_max_attempts,
    );
    let usage = UsageAccounting::new(pool.clone());

    runner::run(
        Arc::new(planner),
        Arc::new(dispatcher),
        jobs,
        Arc::new(usage),
        &config,
    )
    .await
}

/// Verify the database is actually usable before starting any loop: a
/// trivial query plus one lease acquire/release round trip.
async fn startup_health_check(pool: &sqlx::PgPool, lock: &PgLeaseLock) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("database health check")?;

    let token = lock
        .acquire("startup_probe", chrono::Duration::seconds(5))
        .await
        .context("lease table probe")?
        .context("lease table probe could not acquire")?;
    lock.release("startup_probe", &token).await?;

    tracing::info!("Startup health check passed");
    Ok(())
}
