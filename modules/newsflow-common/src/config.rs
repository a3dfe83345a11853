use std::env;

use tracing::info;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Secrets at rest (base64-encoded 32-byte keys)
    pub encryption_key: String,
    pub encryption_key_previous: Option<String>,

    // Deduplication
    pub similarity_threshold: f64,
    pub dedup_window_max_records: i64,
    pub dedup_window_max_age_hours: i64,

    // Delivery planning
    pub min_batch_interval_minutes: i64,
    pub max_items_per_batch: i64,
    pub max_webhooks_per_user: i64,
    pub planner_lease_secs: i64,

    // Dispatch
    pub webhook_max_failures: i32,
    pub send_max_attempts: i32,
    pub send_timeout_secs: u64,
    pub dispatch_workers: usize,
    pub dispatch_poll_secs: u64,

    // Email relay (optional; email webhooks fail until configured)
    pub mail_relay_url: Option<String>,
    pub mail_relay_token: Option<String>,

    // Bookkeeping
    pub delivery_retention_days: i64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            encryption_key: required_env("WEBHOOK_ENCRYPTION_KEY"),
            encryption_key_previous: env::var("WEBHOOK_ENCRYPTION_KEY_PREVIOUS").ok(),
            similarity_threshold: parse_env("SIMILARITY_THRESHOLD", 0.80),
            dedup_window_max_records: parse_env("DEDUP_WINDOW_MAX_RECORDS", 500),
            dedup_window_max_age_hours: parse_env("DEDUP_WINDOW_MAX_AGE_HOURS", 24),
            min_batch_interval_minutes: parse_env("MIN_BATCH_INTERVAL_MINUTES", 5),
            max_items_per_batch: parse_env("MAX_ITEMS_PER_BATCH", 50),
            max_webhooks_per_user: parse_env("MAX_WEBHOOKS_PER_USER", 10),
            planner_lease_secs: parse_env("PLANNER_LEASE_SECS", 240),
            webhook_max_failures: parse_env("WEBHOOK_MAX_FAILURES", 5),
            send_max_attempts: parse_env("SEND_MAX_ATTEMPTS", 3),
            send_timeout_secs: parse_env("SEND_TIMEOUT_SECS", 10),
            dispatch_workers: parse_env("DISPATCH_WORKERS", 2),
            dispatch_poll_secs: parse_env("DISPATCH_POLL_SECS", 15),
            mail_relay_url: env::var("MAIL_RELAY_URL").ok(),
            mail_relay_token: env::var("MAIL_RELAY_TOKEN").ok(),
            delivery_retention_days: parse_env("DELIVERY_RETENTION_DAYS", 30),
        }
    }

    /// Log the non-secret parts of the configuration at startup.
    pub fn log_redacted(&self) {
        info!(
            similarity_threshold = self.similarity_threshold,
            dedup_window_max_records = self.dedup_window_max_records,
            min_batch_interval_minutes = self.min_batch_interval_minutes,
            max_items_per_batch = self.max_items_per_batch,
            planner_lease_secs = self.planner_lease_secs,
            webhook_max_failures = self.webhook_max_failures,
            send_max_attempts = self.send_max_attempts,
            dispatch_workers = self.dispatch_workers,
            delivery_retention_days = self.delivery_retention_days,
            key_rotation = self.encryption_key_previous.is_some(),
            mail_relay = self.mail_relay_url.is_some(),
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid value")),
        Err(_) => default,
    }
}
