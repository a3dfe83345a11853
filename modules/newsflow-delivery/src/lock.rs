//! Single-runner coordination via a Postgres lease table.
//!
//! `acquire` is non-blocking: one row per lock key, taken over only when
//! the previous holder's lease has expired. Release compares the token so
//! an expired holder cannot drop a lease it no longer owns.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

pub const PLANNER_LOCK_KEY: &str = "delivery_planner";

/// A fencing token proving lease ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock. `None` means another holder has a live lease.
    async fn acquire(&self, key: &str, lease: Duration) -> Result<Option<LeaseToken>>;

    /// Release the lock if the token still matches.
    async fn release(&self, key: &str, token: &LeaseToken) -> Result<()>;
}

/// Lease lock backed by the planner_leases table.
#[derive(Clone)]
pub struct PgLeaseLock {
    pool: PgPool,
}

impl PgLeaseLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DistributedLock for PgLeaseLock {
    async fn acquire(&self, key: &str, lease: Duration) -> Result<Option<LeaseToken>> {
        let token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + lease;

        // The upsert only fires when the existing lease has lapsed, so a
        // returned row means we hold the lock.
        let row = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO planner_leases (key, token, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO UPDATE
                SET token = EXCLUDED.token, expires_at = EXCLUDED.expires_at
                WHERE planner_leases.expires_at <= now()
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(&token)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LeaseToken))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM planner_leases
            WHERE key = $1 AND token = $2
            "#,
        )
        .bind(key)
        .bind(&token.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(key, "Lease already expired or taken over at release");
        }
        Ok(())
    }
}
