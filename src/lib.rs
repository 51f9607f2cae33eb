pub mod budget;
pub mod config;
pub mod consensus;
pub mod coordination;
pub mod error;
pub mod events;
pub mod jobs;
pub mod providers;
pub mod registry;
pub mod runtime;

pub use budget::{
    BudgetLedger, BudgetReservation, CommitSummary, CounterStore, CounterTotals,
    MemoryCounterStore, PostgresCounterStore, ReservationSweeper, SweeperConfig, Tier, UsageRecord,
};
pub use config::{init_tracing, AppConfig};
pub use consensus::{
    ConsensusAggregator, ConsensusOutcome, ConsensusResult, MergeStrategy, ProviderVote,
};
pub use coordination::{
    BreakerRegistry, BreakerRejection, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats,
    CircuitState,
};
pub use error::{AxonError, Result};
pub use events::{EventBus, EventEnvelope, EventHistory, EventType, MemoryEventHistory};
pub use jobs::{JobQueue, JobRecord, JobState};
pub use providers::{
    ChatMessage, ChatRequest, ChatResponse, HttpProvider, HttpProviderConfig, ModelProvider,
    TokenUsage,
};
pub use registry::{ModelInfo, ModelPricing, ModelRegistry};
pub use runtime::{
    ErrorCategory, ErrorSeverity, ExecutionContext, NodeError, NodeRuntime, RetryPolicy,
};
