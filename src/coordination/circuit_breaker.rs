//! Per-resource failure isolator.
//!
//! One breaker guards one named downstream resource. After enough
//! consecutive failures the breaker opens and short-circuits every call
//! until a cooldown lapses, which is the backpressure that keeps retry
//! storms off a struggling provider. State lives in this process only and
//! does not survive a restart.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are short-circuited until the cooldown lapses
    Open,
    /// Cooldown lapsed, probe calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before allowing a probe
    pub recovery_timeout_secs: u64,
    /// Successful probes required to close again
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_success_threshold: 1,
        }
    }
}

/// Returned by `check` while the circuit is open and still cooling down.
#[derive(Debug, Clone)]
pub struct BreakerRejection {
    pub node_name: String,
    pub retry_after_secs: u64,
}

impl std::fmt::Display for BreakerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "service {} unavailable, retry in {}s",
            self.node_name, self.retry_after_secs
        )
    }
}

// Compound state guarded together: which state we are in and the clock
// readings that justify it.
#[derive(Debug, Clone, Copy)]
struct Phase {
    state: CircuitState,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    node_name: String,
    config: CircuitBreakerConfig,
    phase: RwLock<Phase>,
    failure_count: AtomicU32,
    half_open_successes: AtomicU32,
    total_trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(node_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            node_name: node_name.into(),
            config,
            phase: RwLock::new(Phase {
                state: CircuitState::Closed,
                last_failure: None,
                opened_at: None,
            }),
            failure_count: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            total_trips: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(node_name: impl Into<String>) -> Self {
        Self::new(node_name, CircuitBreakerConfig::default())
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub async fn state(&self) -> CircuitState {
        self.phase.read().await.state
    }

    /// Gate one call. Open + still cooling rejects without invoking
    /// anything; open + cooldown lapsed flips to half-open and lets the
    /// probe through.
    pub async fn check(&self) -> Result<(), BreakerRejection> {
        let snapshot = *self.phase.read().await;
        if snapshot.state != CircuitState::Open {
            return Ok(());
        }

        let waited = snapshot
            .opened_at
            .map(|t| Utc::now().signed_duration_since(t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        if waited < self.config.recovery_timeout_secs {
            return Err(BreakerRejection {
                node_name: self.node_name.clone(),
                retry_after_secs: self.config.recovery_timeout_secs - waited,
            });
        }

        let mut phase = self.phase.write().await;
        if phase.state == CircuitState::Open {
            phase.state = CircuitState::HalfOpen;
            self.half_open_successes.store(0, Ordering::SeqCst);
            info!(node = %self.node_name, "circuit half-open, probing");
        }
        Ok(())
    }

    pub async fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);

        if self.state().await == CircuitState::HalfOpen {
            let probes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if probes >= self.config.half_open_success_threshold {
                let mut phase = self.phase.write().await;
                phase.state = CircuitState::Closed;
                phase.opened_at = None;
                self.failure_count.store(0, Ordering::SeqCst);
                info!(node = %self.node_name, "circuit closed, normal operation");
            }
        }

        debug!(node = %self.node_name, "success recorded");
    }

    pub async fn record_failure(&self, reason: &str) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(node = %self.node_name, failures, "call failed: {}", reason);

        let mut phase = self.phase.write().await;
        phase.last_failure = Some(Utc::now());

        // A failed probe re-opens immediately; otherwise only the
        // threshold trips the circuit.
        let tripping = phase.state == CircuitState::HalfOpen
            || (phase.state == CircuitState::Closed && failures >= self.config.failure_threshold);
        if tripping && phase.state != CircuitState::Open {
            phase.state = CircuitState::Open;
            phase.opened_at = Some(Utc::now());
            self.half_open_successes.store(0, Ordering::SeqCst);
            self.total_trips.fetch_add(1, Ordering::SeqCst);
            warn!(node = %self.node_name, failures, "circuit tripped open");
        }
    }

    /// Manual reset back to closed.
    pub async fn force_close(&self) {
        let mut phase = self.phase.write().await;
        phase.state = CircuitState::Closed;
        phase.opened_at = None;
        self.failure_count.store(0, Ordering::SeqCst);
        self.half_open_successes.store(0, Ordering::SeqCst);
        warn!(node = %self.node_name, "circuit force-closed");
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let phase = *self.phase.read().await;
        CircuitBreakerStats {
            node_name: self.node_name.clone(),
            state: phase.state,
            consecutive_failures: self.failure_count.load(Ordering::SeqCst),
            last_failure: phase.last_failure,
            opened_at: phase.opened_at,
            total_trips: self.total_trips.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time snapshot for diagnostics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub node_name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_breaker_initial_state() {
        let cb = CircuitBreaker::with_defaults("provider-a");
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.check().await.is_ok());
    }

    #[tokio::test]
    async fn test_circuit_breaker_trips_at_threshold() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("provider-a", config);

        cb.record_failure("error 1").await;
        cb.record_failure("error 2").await;
        assert_eq!(cb.state().await, CircuitState::Closed);

        cb.record_failure("error 3").await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(cb.check().await.is_err());
    }

    #[tokio::test]
    async fn test_circuit_breaker_success_resets_failures() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("provider-a", config);

        cb.record_failure("error 1").await;
        cb.record_failure("error 2").await;
        cb.record_success().await;

        // Failures should be reset
        cb.record_failure("error 1").await;
        cb.record_failure("error 2").await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_rejection_carries_retry_hint() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 60,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("provider-a", config);

        cb.record_failure("boom").await;
        let rejection = cb.check().await.unwrap_err();
        assert_eq!(rejection.node_name, "provider-a");
        assert!(rejection.retry_after_secs <= 60);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 0,
            half_open_success_threshold: 1,
        };
        let cb = CircuitBreaker::new("provider-a", config);

        cb.record_failure("boom").await;
        assert_eq!(cb.state().await, CircuitState::Open);

        // Cooldown of zero: the next check transitions to HalfOpen.
        assert!(cb.check().await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_failure_reopens() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: 0,
            half_open_success_threshold: 1,
        };
        let cb = CircuitBreaker::new("provider-a", config);

        cb.record_failure("boom").await;
        assert!(cb.check().await.is_ok());
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_failure("probe failed").await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_force_close_resets() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("provider-a", config);

        cb.record_failure("boom").await;
        assert_eq!(cb.state().await, CircuitState::Open);

        cb.force_close().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.check().await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let cb = CircuitBreaker::with_defaults("provider-a");
        cb.record_failure("one").await;

        let stats = cb.stats().await;
        assert_eq!(stats.node_name, "provider-a");
        assert_eq!(stats.consecutive_failures, 1);
        assert!(stats.last_failure.is_some());
        assert_eq!(stats.total_trips, 0);
    }
}
