//! Fault-tolerant execution envelope
//!
//! - Node error taxonomy with severity escalation
//! - Retry policy with capped exponential backoff
//! - Typed execution context with an append-only error trail
//! - The envelope itself: breaker-gated, timed, event-reporting execution

pub mod context;
pub mod node;
pub mod node_error;
pub mod retry;

pub use context::ExecutionContext;
pub use node::NodeRuntime;
pub use node_error::{ErrorCategory, ErrorSeverity, NodeError};
pub use retry::RetryPolicy;
