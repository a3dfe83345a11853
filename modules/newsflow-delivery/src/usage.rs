//! API key usage accounting.
//!
//! Counters accumulate in process and are flushed to Postgres on a timer,
//! so the hot path never writes a row per request.

use std::collections::HashMap;
use std::sync::Mutex;

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::error::Result;

pub struct UsageAccounting {
    pool: PgPool,
    counters: Mutex<HashMap<Uuid, i64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageFlush {
    pub keys_processed: u32,
    pub total_increment: i64,
}

impl UsageAccounting {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn increment(&self, api_key_id: Uuid) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(api_key_id).or_insert(0) += 1;
        }
    }

    /// Drain the in-process counters into api_keys. Counts for keys that
    /// have been deleted are dropped silently. On a database error the
    /// unflushed deltas go back into the counters so the next flush retries
    /// them instead of losing the counts.
    pub async fn flush(&self) -> Result<UsageFlush> {
        let drained: Vec<(Uuid, i64)> = {
            let Ok(mut counters) = self.counters.lock() else {
                return Ok(UsageFlush::default());
            };
            std::mem::take(&mut *counters).into_iter().collect()
        };
        if drained.is_empty() {
            return Ok(UsageFlush::default());
        }

        let mut flush = UsageFlush::default();
        for (idx, (api_key_id, delta)) in drained.iter().enumerate() {
            let updated = sqlx::query(
                r#"
                UPDATE api_keys
                SET request_count = request_count + $2, last_used_at = now()
                WHERE api_key_id = $1
                "#,
            )
            .bind(api_key_id)
            .bind(delta)
            .execute(&self.pool)
            .await;
            if let Err(err) = updated {
                self.restore(&drained[idx..]);
                return Err(err.into());
            }
            flush.keys_processed += 1;
            flush.total_increment += delta;
        }

        info!(
            keys_processed = flush.keys_processed,
            total_increment = flush.total_increment,
            "Flushed API key usage"
        );
        Ok(flush)
    }

    fn restore(&self, unflushed: &[(Uuid, i64)]) {
        if let Ok(mut counters) = self.counters.lock() {
            for (api_key_id, delta) in unflushed {
                *counters.entry(*api_key_id).or_insert(0) += delta;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increments_accumulate_per_key() {
        let accounting = UsageAccounting {
            pool: PgPool::connect_lazy("postgres://unused/unused").unwrap(),
            counters: Mutex::new(HashMap::new()),
        };
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        accounting.increment(a);
        accounting.increment(a);
        accounting.increment(b);

        let counters = accounting.counters.lock().unwrap();
        assert_eq!(counters[&a], 2);
        assert_eq!(counters[&b], 1);
    }

    #[tokio::test]
    async fn failed_flush_restores_counters() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_millis(200))
            .connect_lazy("postgres://postgres@127.0.0.1:1/unused")
            .unwrap();
        let accounting = UsageAccounting::new(pool);
        let key = Uuid::new_v4();
        accounting.increment(key);
        accounting.increment(key);

        assert!(accounting.flush().await.is_err());

        let counters = accounting.counters.lock().unwrap();
        assert_eq!(counters[&key], 2);
    }
}
