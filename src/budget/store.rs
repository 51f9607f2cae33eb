//! Counter store — the shared substrate under the credit ledger.
//!
//! Every mutation is a single atomic increment/decrement on a per-user,
//! per-day counter pair. No application-level lock is taken anywhere;
//! correctness under concurrent reservations rests entirely on the
//! atomicity of these primitives. The in-memory store backs tests and
//! single-process deployments; the Postgres store is the cross-process one,
//! where each operation is one atomic statement.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;

/// Post-mutation totals for one `(user, day)` counter pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterTotals {
    pub used: i64,
    pub pending: i64,
}

impl CounterTotals {
    pub fn committed_plus_pending(&self) -> i64 {
        self.used + self.pending
    }
}

/// A provisional hold on a user's daily quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetReservation {
    pub user_id: String,
    pub trace_id: String,
    pub reserved_credits: i64,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl BudgetReservation {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_secs as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// One committed charge, appended to the usage log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub trace_id: String,
    pub day_key: String,
    pub credits: i64,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` (may be negative) to `pending`, returning the
    /// totals as they stood immediately after the mutation.
    async fn add_pending(&self, user_id: &str, day_key: &str, delta: i64) -> Result<CounterTotals>;

    /// Atomically add `delta` to `used`.
    async fn add_used(&self, user_id: &str, day_key: &str, delta: i64) -> Result<CounterTotals>;

    /// Read current totals without mutating.
    async fn totals(&self, user_id: &str, day_key: &str) -> Result<CounterTotals>;

    async fn put_reservation(&self, reservation: &BudgetReservation) -> Result<()>;

    async fn get_reservation(
        &self,
        user_id: &str,
        trace_id: &str,
    ) -> Result<Option<BudgetReservation>>;

    /// Remove a reservation; `true` when this call removed it. Exactly one
    /// concurrent caller observes `true`, which is what makes release and
    /// the sweeper safe to race.
    async fn delete_reservation(&self, user_id: &str, trace_id: &str) -> Result<bool>;

    /// Reservations whose TTL has lapsed as of `now`, oldest first.
    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BudgetReservation>>;

    async fn append_usage(&self, record: &UsageRecord) -> Result<()>;
}

#[derive(Default)]
struct Counters {
    used: AtomicI64,
    pending: AtomicI64,
}

/// In-memory store: atomics behind a concurrent map.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<(String, String), Arc<Counters>>,
    reservations: DashMap<(String, String), BudgetReservation>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, user_id: &str, day_key: &str) -> Arc<Counters> {
        self.counters
            .entry((user_id.to_string(), day_key.to_string()))
            .or_default()
            .clone()
    }

    /// Usage records appended so far (test helper).
    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn add_pending(&self, user_id: &str, day_key: &str, delta: i64) -> Result<CounterTotals> {
        let counters = self.counters(user_id, day_key);
        let pending = counters.pending.fetch_add(delta, Ordering::SeqCst) + delta;
        Ok(CounterTotals {
            used: counters.used.load(Ordering::SeqCst),
            pending,
        })
    }

    async fn add_used(&self, user_id: &str, day_key: &str, delta: i64) -> Result<CounterTotals> {
        let counters = self.counters(user_id, day_key);
        let used = counters.used.fetch_add(delta, Ordering::SeqCst) + delta;
        Ok(CounterTotals {
            used,
            pending: counters.pending.load(Ordering::SeqCst),
        })
    }

    async fn totals(&self, user_id: &str, day_key: &str) -> Result<CounterTotals> {
        let counters = self.counters(user_id, day_key);
        Ok(CounterTotals {
            used: counters.used.load(Ordering::SeqCst),
            pending: counters.pending.load(Ordering::SeqCst),
        })
    }

    async fn put_reservation(&self, reservation: &BudgetReservation) -> Result<()> {
        self.reservations.insert(
            (reservation.user_id.clone(), reservation.trace_id.clone()),
            reservation.clone(),
        );
        Ok(())
    }

    async fn get_reservation(
        &self,
        user_id: &str,
        trace_id: &str,
    ) -> Result<Option<BudgetReservation>> {
        Ok(self
            .reservations
            .get(&(user_id.to_string(), trace_id.to_string()))
            .map(|r| r.clone()))
    }

    async fn delete_reservation(&self, user_id: &str, trace_id: &str) -> Result<bool> {
        Ok(self
            .reservations
            .remove(&(user_id.to_string(), trace_id.to_string()))
            .is_some())
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BudgetReservation>> {
        let mut expired: Vec<BudgetReservation> = self
            .reservations
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.clone())
            .collect();
        expired.sort_by_key(|r| r.created_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        self.usage.write().await.push(record.clone());
        Ok(())
    }
}

/// Postgres store: one atomic statement per mutation.
pub struct PostgresCounterStore {
    pool: PgPool,
}

impl PostgresCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the ledger tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_counters (
                user_id TEXT NOT NULL,
                day_key TEXT NOT NULL,
                used BIGINT NOT NULL DEFAULT 0,
                pending BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, day_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS budget_reservations (
                user_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                reserved_credits BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                ttl_secs BIGINT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (user_id, trace_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_budget_reservations_expiry \
             ON budget_reservations(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credit_usage (
                id BIGSERIAL PRIMARY KEY,
                user_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                day_key TEXT NOT NULL,
                credits BIGINT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_credit_usage_user_day \
             ON credit_usage(user_id, day_key)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CounterStore for PostgresCounterStore {
    async fn add_pending(&self, user_id: &str, day_key: &str, delta: i64) -> Result<CounterTotals> {
        let row = sqlx::query(
            r#"
            INSERT INTO credit_counters (user_id, day_key, used, pending)
            VALUES ($1, $2, 0, $3)
            ON CONFLICT (user_id, day_key)
            DO UPDATE SET pending = credit_counters.pending + $3
            RETURNING used, pending
            "#,
        )
        .bind(user_id)
        .bind(day_key)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;

        Ok(CounterTotals {
            used: row.get("used"),
            pending: row.get("pending"),
        })
    }

    async fn add_used(&self, user_id: &str, day_key: &str, delta: i64) -> Result<CounterTotals> {
        let row = sqlx::query(
            r#"
            INSERT INTO credit_counters (user_id, day_key, used, pending)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (user_id, day_key)
            DO UPDATE SET used = credit_counters.used + $3
            RETURNING used, pending
            "#,
        )
        .bind(user_id)
        .bind(day_key)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;

        Ok(CounterTotals {
            used: row.get("used"),
            pending: row.get("pending"),
        })
    }

    async fn totals(&self, user_id: &str, day_key: &str) -> Result<CounterTotals> {
        let row = sqlx::query(
            r#"
            SELECT used, pending
            FROM credit_counters
            WHERE user_id = $1 AND day_key = $2
            "#,
        )
        .bind(user_id)
        .bind(day_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|row| CounterTotals {
                used: row.get("used"),
                pending: row.get("pending"),
            })
            .unwrap_or(CounterTotals { used: 0, pending: 0 }))
    }

    async fn put_reservation(&self, reservation: &BudgetReservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO budget_reservations
                (user_id, trace_id, reserved_credits, created_at, ttl_secs, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, trace_id) DO NOTHING
            "#,
        )
        .bind(&reservation.user_id)
        .bind(&reservation.trace_id)
        .bind(reservation.reserved_credits)
        .bind(reservation.created_at)
        .bind(reservation.ttl_secs as i64)
        .bind(reservation.expires_at())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_reservation(
        &self,
        user_id: &str,
        trace_id: &str,
    ) -> Result<Option<BudgetReservation>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, trace_id, reserved_credits, created_at, ttl_secs
            FROM budget_reservations
            WHERE user_id = $1 AND trace_id = $2
            "#,
        )
        .bind(user_id)
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| BudgetReservation {
            user_id: row.get("user_id"),
            trace_id: row.get("trace_id"),
            reserved_credits: row.get("reserved_credits"),
            created_at: row.get("created_at"),
            ttl_secs: row.get::<i64, _>("ttl_secs") as u64,
        }))
    }

    async fn delete_reservation(&self, user_id: &str, trace_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM budget_reservations
            WHERE user_id = $1 AND trace_id = $2
            "#,
        )
        .bind(user_id)
        .bind(trace_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BudgetReservation>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, trace_id, reserved_credits, created_at, ttl_secs
            FROM budget_reservations
            WHERE expires_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| BudgetReservation {
                user_id: row.get("user_id"),
                trace_id: row.get("trace_id"),
                reserved_credits: row.get("reserved_credits"),
                created_at: row.get("created_at"),
                ttl_secs: row.get::<i64, _>("ttl_secs") as u64,
            })
            .collect())
    }

    async fn append_usage(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_usage (user_id, trace_id, day_key, credits, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.trace_id)
        .bind(&record.day_key)
        .bind(record.credits)
        .bind(&record.metadata)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_pending_returns_post_mutation_totals() {
        let store = MemoryCounterStore::new();

        let totals = store.add_pending("u1", "20260805", 10).await.unwrap();
        assert_eq!(totals, CounterTotals { used: 0, pending: 10 });

        let totals = store.add_pending("u1", "20260805", -4).await.unwrap();
        assert_eq!(totals.pending, 6);
    }

    #[tokio::test]
    async fn test_counters_are_scoped_per_user_and_day() {
        let store = MemoryCounterStore::new();
        store.add_pending("u1", "20260805", 10).await.unwrap();

        let other_user = store.totals("u2", "20260805").await.unwrap();
        assert_eq!(other_user.pending, 0);

        let other_day = store.totals("u1", "20260806").await.unwrap();
        assert_eq!(other_day.pending, 0);
    }

    #[tokio::test]
    async fn test_delete_reservation_claims_exactly_once() {
        let store = MemoryCounterStore::new();
        let reservation = BudgetReservation {
            user_id: "u1".to_string(),
            trace_id: "t1".to_string(),
            reserved_credits: 5,
            created_at: Utc::now(),
            ttl_secs: 600,
        };
        store.put_reservation(&reservation).await.unwrap();

        assert!(store.delete_reservation("u1", "t1").await.unwrap());
        assert!(!store.delete_reservation("u1", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_reservations_respects_ttl_and_limit() {
        let store = MemoryCounterStore::new();
        let now = Utc::now();

        for i in 0..3 {
            store
                .put_reservation(&BudgetReservation {
                    user_id: "u1".to_string(),
                    trace_id: format!("old-{i}"),
                    reserved_credits: 1,
                    created_at: now - Duration::seconds(1_000 + i),
                    ttl_secs: 600,
                })
                .await
                .unwrap();
        }
        store
            .put_reservation(&BudgetReservation {
                user_id: "u1".to_string(),
                trace_id: "fresh".to_string(),
                reserved_credits: 1,
                created_at: now,
                ttl_secs: 600,
            })
            .await
            .unwrap();

        let expired = store.expired_reservations(now, 2).await.unwrap();
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|r| r.trace_id.starts_with("old-")));
        // Oldest first
        assert!(expired[0].created_at <= expired[1].created_at);
    }
}
