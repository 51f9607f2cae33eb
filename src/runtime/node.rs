//! NodeRuntime — the execution envelope every agent node runs inside.
//!
//! Composes retry-with-backoff and the node's circuit breaker around an
//! arbitrary async operation, reports every attempt transition on the event
//! bus, and records every failure in the execution context's error trail.
//! Failures are never swallowed: a retried-then-recovered error is still
//! visible to downstream audit.

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::coordination::BreakerRegistry;
use crate::events::{EventBus, EventType};

use super::context::ExecutionContext;
use super::node_error::NodeError;
use super::retry::RetryPolicy;

pub struct NodeRuntime {
    node_name: String,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    breakers: Arc<BreakerRegistry>,
    events: Arc<EventBus>,
}

impl NodeRuntime {
    pub fn new(
        node_name: impl Into<String>,
        policy: RetryPolicy,
        breakers: Arc<BreakerRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            policy,
            attempt_timeout: Duration::from_secs(30),
            breakers,
            events,
        }
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Run `op` under the retry policy and this node's circuit breaker.
    ///
    /// `op` is called with the 0-based attempt number and must produce a
    /// fresh future per call. Returns the value of the first successful
    /// attempt, or the terminal `NodeError` once attempts are exhausted, the
    /// error is non-retryable, or the breaker rejects the call. Every failure
    /// along the way lands in `ctx.error_trail()`.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &mut ExecutionContext,
        mut op: F,
    ) -> std::result::Result<T, NodeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, NodeError>>,
    {
        let breaker = self.breakers.get(&self.node_name);
        self.emit_status(ctx, "started", 0);

        let mut attempt: u32 = 0;
        loop {
            ctx.record_attempt();

            // Fail fast while the breaker is open: retrying here would feed
            // the very storm the breaker exists to stop.
            if let Err(rejection) = breaker.check().await {
                let mut err = NodeError::external_service(&self.node_name, rejection.to_string())
                    .with_code("SERVICE_UNAVAILABLE")
                    .with_context("retry_after_secs", rejection.retry_after_secs)
                    .at_retry(attempt);
                err.recoverable = false;
                ctx.record_error(err.clone());
                self.emit_error(ctx, &err);
                return Err(err);
            }

            let result = match timeout(self.attempt_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::network(
                    &self.node_name,
                    format!("attempt timed out after {}ms", self.attempt_timeout.as_millis()),
                )
                .with_code("ATTEMPT_TIMEOUT")),
            };

            match result {
                Ok(value) => {
                    breaker.record_success().await;
                    if attempt > 0 {
                        info!(
                            node = %self.node_name,
                            trace = %ctx.trace_id,
                            "recovered after {} failed attempt(s)",
                            attempt
                        );
                    }
                    self.emit_status(ctx, "succeeded", attempt);
                    return Ok(value);
                }
                Err(err) => {
                    let err = err.at_retry(attempt);
                    breaker.record_failure(&err.message).await;
                    ctx.record_error(err.clone());

                    if self.policy.should_retry(attempt, &err) {
                        let backoff = self.policy.backoff_duration(attempt);
                        warn!(
                            node = %self.node_name,
                            trace = %ctx.trace_id,
                            attempt,
                            "attempt failed ({}), retrying in {:?}",
                            err.message,
                            backoff
                        );
                        self.emit_status(ctx, "retrying", attempt);
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }

                    debug!(
                        node = %self.node_name,
                        trace = %ctx.trace_id,
                        "terminal failure after {} attempt(s)",
                        attempt + 1
                    );
                    self.emit_error(ctx, &err);
                    return Err(err);
                }
            }
        }
    }

    fn emit_status(&self, ctx: &ExecutionContext, status: &str, attempt: u32) {
        let mut payload = Map::new();
        payload.insert("node".to_string(), Value::from(self.node_name.clone()));
        payload.insert("status".to_string(), Value::from(status));
        payload.insert("attempt".to_string(), Value::from(attempt));
        payload.insert("trace_id".to_string(), Value::from(ctx.trace_id.clone()));
        self.events
            .publish(&ctx.conversation_id, EventType::Routing, payload);
    }

    fn emit_error(&self, ctx: &ExecutionContext, err: &NodeError) {
        let mut payload = Map::new();
        payload.insert("code".to_string(), Value::from(err.code.clone()));
        payload.insert("message".to_string(), Value::from(err.message.clone()));
        payload.insert("node".to_string(), Value::from(self.node_name.clone()));
        payload.insert("severity".to_string(), Value::from(err.severity.to_string()));
        payload.insert("attempt".to_string(), Value::from(err.retry_count));
        self.events
            .publish(&ctx.conversation_id, EventType::Error, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn runtime(policy: RetryPolicy) -> NodeRuntime {
        NodeRuntime::new(
            "test-node",
            policy,
            Arc::new(BreakerRegistry::with_defaults()),
            Arc::new(EventBus::with_defaults()),
        )
    }

    #[tokio::test]
    async fn test_succeeds_first_try_with_empty_trail() {
        let rt = runtime(RetryPolicy::default());
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let out: Result<i32, NodeError> = rt.execute(&mut ctx, |_| async { Ok(42) }).await;
        assert_eq!(out.unwrap(), 42);
        assert!(ctx.error_trail().is_empty());
        assert_eq!(ctx.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success_leaves_two_entry_trail() {
        let policy = RetryPolicy::default()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_secs(1));
        let rt = runtime(policy);
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let out = rt
            .execute(&mut ctx, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(NodeError::network("test-node", "connection reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(out.unwrap(), "done");
        // 1s after attempt 0, 2s after attempt 1 (paused clock auto-advances)
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(ctx.error_trail().len(), 2);
        assert_eq!(ctx.attempts(), 3);
    }

    #[tokio::test]
    async fn test_validation_error_is_terminal_immediately() {
        let rt = runtime(RetryPolicy::default());
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let calls = AtomicU32::new(0);
        let out: Result<(), NodeError> = rt
            .execute(&mut ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NodeError::validation("test-node", "schema mismatch")) }
            })
            .await;

        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.error_trail().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_final_error() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        let rt = runtime(policy);
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let out: Result<(), NodeError> = rt
            .execute(&mut ctx, |_| async {
                Err(NodeError::network("test-node", "still down"))
            })
            .await;

        let err = out.unwrap_err();
        assert_eq!(err.retry_count, 1);
        assert_eq!(ctx.error_trail().len(), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits_without_invoking() {
        let breakers = Arc::new(BreakerRegistry::with_defaults());
        breakers.register(
            "test-node",
            CircuitBreakerConfig {
                failure_threshold: 1,
                recovery_timeout_secs: 60,
                ..Default::default()
            },
        );
        breakers.get("test-node").record_failure("priming").await;

        let rt = NodeRuntime::new(
            "test-node",
            RetryPolicy::default(),
            breakers,
            Arc::new(EventBus::with_defaults()),
        );
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let calls = AtomicU32::new(0);
        let out: Result<(), NodeError> = rt
            .execute(&mut ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        let err = out.unwrap_err();
        assert_eq!(err.code, "SERVICE_UNAVAILABLE");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_a_retryable_network_error() {
        let policy = RetryPolicy::default().with_max_attempts(2);
        let rt = runtime(policy).with_attempt_timeout(Duration::from_millis(50));
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let calls = AtomicU32::new(0);
        let out: Result<(), NodeError> = rt
            .execute(&mut ctx, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                    Ok(())
                }
            })
            .await;

        assert!(out.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.error_trail()[0].code, "ATTEMPT_TIMEOUT");
    }

    #[tokio::test]
    async fn test_progress_events_per_transition() {
        let events = Arc::new(EventBus::with_defaults());
        let rt = NodeRuntime::new(
            "test-node",
            RetryPolicy::default(),
            Arc::new(BreakerRegistry::with_defaults()),
            events.clone(),
        );
        let mut rx = events.subscribe("conv-1");
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let _: Result<i32, NodeError> = rt.execute(&mut ctx, |_| async { Ok(1) }).await;

        let started = rx.recv().await.unwrap();
        assert_eq!(started.payload["status"], "started");
        let succeeded = rx.recv().await.unwrap();
        assert_eq!(succeeded.payload["status"], "succeeded");
    }
}
