//! BudgetLedger — two-phase credit accounting over the counter store.
//!
//! `reserve` is the only admission point: it optimistically bumps `pending`
//! and rolls the bump back when the day's limit would be exceeded, so
//! `used + pending <= daily_limit` can never be observed violated. `commit`
//! settles the actual charge; `release` is the rollback path callers owe on
//! every failure exit. TTL-expired reservations are reaped by the sweeper.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BudgetConfig;
use crate::error::{AxonError, Result};

use super::store::{BudgetReservation, CounterStore, UsageRecord};

/// Subscription tier, mapped to a fixed daily credit limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Pro => write!(f, "pro"),
            Tier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// Result of a successful commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSummary {
    pub remaining_today_credits: i64,
    pub final_credits: i64,
}

pub struct BudgetLedger {
    store: Arc<dyn CounterStore>,
    config: BudgetConfig,
    /// Per-user tier assignments; unlisted users are Free. Changes apply to
    /// the next reserve call.
    tiers: DashMap<String, Tier>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn CounterStore>, config: BudgetConfig) -> Self {
        Self {
            store,
            config,
            tiers: DashMap::new(),
        }
    }

    /// UTC day bucket, e.g. `20260805`.
    pub fn day_key(at: DateTime<Utc>) -> String {
        at.format("%Y%m%d").to_string()
    }

    pub fn set_tier(&self, user_id: &str, tier: Tier) {
        info!(user = user_id, %tier, "tier updated");
        self.tiers.insert(user_id.to_string(), tier);
    }

    pub fn tier_of(&self, user_id: &str) -> Tier {
        self.tiers
            .get(user_id)
            .map(|t| *t)
            .unwrap_or(Tier::Free)
    }

    pub fn daily_limit(&self, user_id: &str) -> i64 {
        match self.tier_of(user_id) {
            Tier::Free => self.config.free_daily_credits,
            Tier::Pro => self.config.pro_daily_credits,
            Tier::Enterprise => self.config.enterprise_daily_credits,
        }
    }

    /// Admission check: place a provisional hold of `credits` on today's
    /// quota. Returns `Ok(false)` with no net side effect when the quota
    /// cannot cover the hold. Must run before any provider call is made.
    pub async fn reserve(
        &self,
        user_id: &str,
        trace_id: &str,
        credits: i64,
        ttl_secs: Option<u64>,
    ) -> Result<bool> {
        if credits <= 0 {
            return Err(AxonError::Validation(format!(
                "reservation credits must be positive, got {credits}"
            )));
        }
        if self
            .store
            .get_reservation(user_id, trace_id)
            .await?
            .is_some()
        {
            return Err(AxonError::Validation(format!(
                "trace {trace_id} already holds a reservation for {user_id}"
            )));
        }

        let now = Utc::now();
        let day = Self::day_key(now);
        let limit = self.daily_limit(user_id);

        // Optimistic hold: bump pending, then undo if the day cannot cover
        // it. Both legs are single atomic mutations on the shared counter.
        let totals = self.store.add_pending(user_id, &day, credits).await?;
        if totals.committed_plus_pending() > limit {
            self.store.add_pending(user_id, &day, -credits).await?;
            debug!(
                user = user_id,
                trace = trace_id,
                requested = credits,
                used = totals.used,
                "reservation rejected, insufficient quota"
            );
            return Ok(false);
        }

        let reservation = BudgetReservation {
            user_id: user_id.to_string(),
            trace_id: trace_id.to_string(),
            reserved_credits: credits,
            created_at: now,
            ttl_secs: ttl_secs.unwrap_or(self.config.reservation_ttl_secs),
        };
        if let Err(e) = self.store.put_reservation(&reservation).await {
            // Undo the hold rather than strand pending credits.
            self.store.add_pending(user_id, &day, -credits).await?;
            return Err(e);
        }

        debug!(
            user = user_id,
            trace = trace_id,
            credits,
            pending = totals.pending,
            "credits reserved"
        );
        Ok(true)
    }

    /// Like `reserve`, but a denied admission is a terminal
    /// `BudgetExceeded` error carrying the remaining balance. For call
    /// paths that gate provider fan-out directly on the result.
    pub async fn reserve_or_fail(
        &self,
        user_id: &str,
        trace_id: &str,
        credits: i64,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        if self.reserve(user_id, trace_id, credits, ttl_secs).await? {
            return Ok(());
        }
        Err(AxonError::BudgetExceeded {
            user_id: user_id.to_string(),
            requested: credits,
            remaining: self.remaining_today(user_id).await?,
        })
    }

    /// Settle a reservation with the final measured cost. Pending drops by
    /// the *originally reserved* amount, used grows by `final_credits`; the
    /// two differ whenever actual usage diverged from the estimate.
    pub async fn commit(
        &self,
        user_id: &str,
        trace_id: &str,
        final_credits: i64,
        metadata: serde_json::Value,
    ) -> Result<CommitSummary> {
        if final_credits < 0 {
            return Err(AxonError::Validation(format!(
                "final credits must be non-negative, got {final_credits}"
            )));
        }

        let reservation = self
            .store
            .get_reservation(user_id, trace_id)
            .await?
            .ok_or_else(|| AxonError::ReservationNotFound {
                user_id: user_id.to_string(),
                trace_id: trace_id.to_string(),
            })?;

        // Claim the reservation first so a racing release/sweep settles
        // exactly once.
        if !self.store.delete_reservation(user_id, trace_id).await? {
            return Err(AxonError::ReservationNotFound {
                user_id: user_id.to_string(),
                trace_id: trace_id.to_string(),
            });
        }

        // Charge against the day the hold was placed on.
        let day = Self::day_key(reservation.created_at);
        self.store
            .add_pending(user_id, &day, -reservation.reserved_credits)
            .await?;
        let totals = self.store.add_used(user_id, &day, final_credits).await?;

        self.store
            .append_usage(&UsageRecord {
                user_id: user_id.to_string(),
                trace_id: trace_id.to_string(),
                day_key: day,
                credits: final_credits,
                metadata,
                created_at: Utc::now(),
            })
            .await?;

        let remaining = (self.daily_limit(user_id) - totals.committed_plus_pending()).max(0);
        debug!(
            user = user_id,
            trace = trace_id,
            reserved = reservation.reserved_credits,
            final_credits,
            remaining,
            "reservation committed"
        );

        Ok(CommitSummary {
            remaining_today_credits: remaining,
            final_credits,
        })
    }

    /// Roll back a reservation after a downstream failure. Restores exactly
    /// the reserved amount to the quota and never touches `used`. Idempotent:
    /// releasing a reservation that is already settled is a no-op.
    pub async fn release(&self, user_id: &str, trace_id: &str) -> Result<()> {
        let reservation = match self.store.get_reservation(user_id, trace_id).await? {
            Some(r) => r,
            None => {
                debug!(user = user_id, trace = trace_id, "release: nothing to do");
                return Ok(());
            }
        };

        if !self.store.delete_reservation(user_id, trace_id).await? {
            // Someone else (commit or sweeper) claimed it first.
            return Ok(());
        }

        let day = Self::day_key(reservation.created_at);
        self.store
            .add_pending(user_id, &day, -reservation.reserved_credits)
            .await?;

        debug!(
            user = user_id,
            trace = trace_id,
            credits = reservation.reserved_credits,
            "reservation released"
        );
        Ok(())
    }

    /// Credits still reservable today.
    pub async fn remaining_today(&self, user_id: &str) -> Result<i64> {
        let totals = self
            .store
            .totals(user_id, &Self::day_key(Utc::now()))
            .await?;
        Ok((self.daily_limit(user_id) - totals.committed_plus_pending()).max(0))
    }

    /// Release every reservation whose TTL lapsed before `now`. Returns how
    /// many were reaped. Called by the sweeper; safe to race with callers.
    pub async fn release_expired(&self, now: DateTime<Utc>, batch: usize) -> Result<usize> {
        let expired = self.store.expired_reservations(now, batch).await?;
        let mut reaped = 0;
        for reservation in expired {
            warn!(
                user = %reservation.user_id,
                trace = %reservation.trace_id,
                credits = reservation.reserved_credits,
                "reaping expired reservation"
            );
            self.release(&reservation.user_id, &reservation.trace_id)
                .await?;
            reaped += 1;
        }
        Ok(reaped)
    }
}
