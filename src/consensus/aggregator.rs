//! ConsensusAggregator — bounded multi-provider fan-out and merge.
//!
//! Each provider call runs in its own execution envelope so one provider's
//! retries or breaker backoff never block the others. Fan-out is bounded by
//! a concurrency cap; completion order is irrelevant because votes are
//! re-assembled in the caller's priority order before merging.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ConsensusConfig;
use crate::coordination::BreakerRegistry;
use crate::events::EventBus;
use crate::providers::{ChatRequest, ModelProvider};
use crate::runtime::{ExecutionContext, NodeError, NodeRuntime, RetryPolicy};

use super::merge::{merge_field_overwrite, merge_weighted_average, MergeStrategy};

/// Distinct outcome kinds a consensus round can settle on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusOutcome {
    /// At least one valid response was merged
    Merged,
    /// No provider produced a parseable response; callers should treat this
    /// as "ask for clarification", not as a generic failure
    Insufficient,
}

/// One provider's contribution to a consensus round.
#[derive(Debug, Clone)]
pub struct ProviderVote {
    pub provider: String,
    pub raw: Option<String>,
    pub parsed: Option<Value>,
    pub error: Option<NodeError>,
}

/// Merged result of one consensus round.
#[derive(Debug, Clone)]
pub struct ConsensusResult {
    /// Every provider's raw contribution, in caller priority order
    pub per_provider_raw: Vec<ProviderVote>,
    /// Parseable responses only, still in priority order
    pub valid_responses: Vec<(String, Value)>,
    pub merged_fields: Map<String, Value>,
    pub field_scores: HashMap<String, f64>,
    /// Fraction of providers that produced a valid response
    pub confidence: f64,
    pub outcome: ConsensusOutcome,
}

pub struct ConsensusAggregator {
    breakers: Arc<BreakerRegistry>,
    events: Arc<EventBus>,
    policy: RetryPolicy,
    max_concurrency: usize,
    call_timeout: Duration,
}

impl ConsensusAggregator {
    pub fn new(
        config: &ConsensusConfig,
        policy: RetryPolicy,
        breakers: Arc<BreakerRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            breakers,
            events,
            policy,
            max_concurrency: config.max_concurrency.max(1),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }

    /// Fan `prompt` out to every provider and merge the valid responses.
    ///
    /// `providers` is the priority order for the overwrite tie-break: later
    /// entries overwrite earlier ones on key collision. Provider failures
    /// are folded into the result (and the context's error trail), never
    /// raised.
    pub async fn aggregate(
        &self,
        ctx: &mut ExecutionContext,
        prompt: &str,
        providers: &[Arc<dyn ModelProvider>],
        strategy: MergeStrategy,
    ) -> ConsensusResult {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set = JoinSet::new();

        for (index, provider) in providers.iter().enumerate() {
            let provider = provider.clone();
            let semaphore = semaphore.clone();
            let runtime = NodeRuntime::new(
                provider.name(),
                self.policy.clone(),
                self.breakers.clone(),
                self.events.clone(),
            )
            .with_attempt_timeout(self.call_timeout);
            // Each call gets its own context so trails can be written
            // concurrently; they are folded back into the parent below.
            let mut call_ctx =
                ExecutionContext::new(ctx.conversation_id.clone(), ctx.user_id.clone())
                    .with_trace_id(ctx.trace_id.clone());
            let request = ChatRequest::prompt(provider.model(), prompt);

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = {
                    let provider = provider.clone();
                    runtime
                        .execute(&mut call_ctx, move |_| {
                            let provider = provider.clone();
                            let request = request.clone();
                            async move { provider.complete(&request).await }
                        })
                        .await
                };
                (index, provider.name().to_string(), result, call_ctx)
            });
        }

        let mut votes: Vec<Option<ProviderVote>> = vec![None; providers.len()];
        while let Some(joined) = join_set.join_next().await {
            let (index, name, result, call_ctx) = match joined {
                Ok(out) => out,
                Err(e) => {
                    warn!("consensus task panicked: {e}");
                    continue;
                }
            };

            for err in call_ctx.error_trail() {
                ctx.record_error(err.clone());
            }

            votes[index] = Some(match result {
                Ok(response) => match serde_json::from_str::<Value>(&response.content) {
                    Ok(parsed) => ProviderVote {
                        provider: name,
                        raw: Some(response.content),
                        parsed: Some(parsed),
                        error: None,
                    },
                    Err(e) => {
                        let err = NodeError::processing(
                            &name,
                            format!("response is not valid JSON: {e}"),
                        );
                        warn!(provider = %name, "dropping unparseable consensus response");
                        ctx.record_error(err.clone());
                        ProviderVote {
                            provider: name,
                            raw: Some(response.content),
                            parsed: None,
                            error: Some(err),
                        }
                    }
                },
                Err(err) => {
                    warn!(provider = %name, "dropping failed consensus provider: {}", err.message);
                    ProviderVote {
                        provider: name,
                        raw: None,
                        parsed: None,
                        error: Some(err),
                    }
                }
            });
        }

        let per_provider_raw: Vec<ProviderVote> = votes.into_iter().flatten().collect();
        let valid_responses: Vec<(String, Value)> = per_provider_raw
            .iter()
            .filter_map(|vote| {
                vote.parsed
                    .as_ref()
                    .map(|parsed| (vote.provider.clone(), parsed.clone()))
            })
            .collect();

        let confidence = if providers.is_empty() {
            0.0
        } else {
            valid_responses.len() as f64 / providers.len() as f64
        };

        if valid_responses.is_empty() {
            debug!(trace = %ctx.trace_id, "consensus round produced no valid responses");
            return ConsensusResult {
                per_provider_raw,
                valid_responses,
                merged_fields: Map::new(),
                field_scores: HashMap::new(),
                confidence,
                outcome: ConsensusOutcome::Insufficient,
            };
        }

        let (merged_fields, field_scores) = match &strategy {
            MergeStrategy::FieldOverwrite => (merge_field_overwrite(&valid_responses), HashMap::new()),
            MergeStrategy::WeightedAverage { weights } => {
                merge_weighted_average(&valid_responses, weights)
            }
        };

        debug!(
            trace = %ctx.trace_id,
            valid = valid_responses.len(),
            total = providers.len(),
            "consensus round merged"
        );

        ConsensusResult {
            per_provider_raw,
            valid_responses,
            merged_fields,
            field_scores,
            confidence,
            outcome: ConsensusOutcome::Merged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatResponse, TokenUsage};
    use async_trait::async_trait;

    struct StubProvider {
        name: String,
        reply: Result<String, NodeError>,
    }

    impl StubProvider {
        fn json(name: &str, body: &str) -> Arc<dyn ModelProvider> {
            Arc::new(Self {
                name: name.to_string(),
                reply: Ok(body.to_string()),
            })
        }

        fn failing(name: &str) -> Arc<dyn ModelProvider> {
            Arc::new(Self {
                name: name.to_string(),
                reply: Err(NodeError::network(name, "connection refused")),
            })
        }
    }

    #[async_trait]
    impl ModelProvider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn model(&self) -> &str {
            "stub-model"
        }

        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, NodeError> {
            self.reply.clone().map(|content| ChatResponse {
                content,
                usage: TokenUsage::default(),
                model: "stub-model".to_string(),
            })
        }
    }

    fn aggregator() -> ConsensusAggregator {
        ConsensusAggregator::new(
            &ConsensusConfig::default(),
            RetryPolicy::no_retry(),
            Arc::new(BreakerRegistry::with_defaults()),
            Arc::new(EventBus::with_defaults()),
        )
    }

    #[tokio::test]
    async fn test_one_bad_provider_does_not_abort_the_round() {
        let agg = aggregator();
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let providers = vec![
            StubProvider::json("a", r#"{"quality": 80, "rigor": 90}"#),
            StubProvider::failing("b"),
            StubProvider::json("c", r#"{"quality": 60, "rigor": 70}"#),
        ];
        let weights = HashMap::from([("quality".to_string(), 0.5), ("rigor".to_string(), 0.5)]);

        let result = agg
            .aggregate(
                &mut ctx,
                "score this",
                &providers,
                MergeStrategy::WeightedAverage { weights },
            )
            .await;

        assert_eq!(result.outcome, ConsensusOutcome::Merged);
        assert_eq!(result.valid_responses.len(), 2);
        assert!((result.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(result.merged_fields["weighted_score"], 75.0);
        // The failure is in the trail, not swallowed.
        assert!(!ctx.error_trail().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_respects_priority_order_not_arrival() {
        let agg = aggregator();
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let providers = vec![
            StubProvider::json("first", r#"{"genre": "essay"}"#),
            StubProvider::json("second", r#"{"genre": "report"}"#),
        ];

        let result = agg
            .aggregate(&mut ctx, "classify", &providers, MergeStrategy::FieldOverwrite)
            .await;

        assert_eq!(result.merged_fields["genre"], "report");
        assert_eq!(result.per_provider_raw[0].provider, "first");
    }

    #[tokio::test]
    async fn test_all_invalid_is_insufficient_not_an_error() {
        let agg = aggregator();
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let providers = vec![
            StubProvider::json("a", "plain prose, not json"),
            StubProvider::failing("b"),
        ];

        let result = agg
            .aggregate(&mut ctx, "classify", &providers, MergeStrategy::FieldOverwrite)
            .await;

        assert_eq!(result.outcome, ConsensusOutcome::Insufficient);
        assert_eq!(result.confidence, 0.0);
        assert!(result.merged_fields.is_empty());
        // Unparseable response is retained raw for audit.
        assert!(result.per_provider_raw[0].raw.is_some());
    }

    #[tokio::test]
    async fn test_fan_out_respects_concurrency_cap() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct GaugedProvider {
            name: String,
            in_flight: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl ModelProvider for GaugedProvider {
            fn name(&self) -> &str {
                &self.name
            }

            fn model(&self) -> &str {
                "stub-model"
            }

            async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, NodeError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(ChatResponse {
                    content: "{}".to_string(),
                    usage: TokenUsage::default(),
                    model: "stub-model".to_string(),
                })
            }
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let providers: Vec<Arc<dyn ModelProvider>> = (0..8)
            .map(|i| {
                Arc::new(GaugedProvider {
                    name: format!("p{i}"),
                    in_flight: in_flight.clone(),
                    peak: peak.clone(),
                }) as Arc<dyn ModelProvider>
            })
            .collect();

        let agg = ConsensusAggregator::new(
            &ConsensusConfig {
                max_concurrency: 2,
                call_timeout_ms: 60_000,
            },
            RetryPolicy::no_retry(),
            Arc::new(BreakerRegistry::with_defaults()),
            Arc::new(EventBus::with_defaults()),
        );
        let mut ctx = ExecutionContext::new("conv-1", "user-1");

        let result = agg
            .aggregate(&mut ctx, "go", &providers, MergeStrategy::FieldOverwrite)
            .await;

        assert_eq!(result.valid_responses.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
