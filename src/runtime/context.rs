//! ExecutionContext — the typed state threaded through one agent execution
//!
//! Replaces the loosely-keyed shared dict with explicit fields validated at
//! construction. The error trail is append-only for the life of the run so
//! that retried-then-recovered failures remain auditable.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::node_error::NodeError;

/// Per-execution identity and audit state, passed `&mut` through the envelope.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Correlates one logical request across reservation, execution and events
    pub trace_id: String,
    /// Channel the execution reports progress on
    pub conversation_id: String,
    /// Owner of the budget this execution charges against
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    attempts: u32,
    error_trail: Vec<NodeError>,
}

impl ExecutionContext {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            started_at: Utc::now(),
            attempts: 0,
            error_trail: Vec::new(),
        }
    }

    /// Reuse an externally-issued trace id (e.g. from the admission layer).
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Append a classified failure. Entries are never removed during a run.
    pub fn record_error(&mut self, error: NodeError) {
        self.error_trail.push(error);
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Full failure history of this execution, in occurrence order.
    pub fn error_trail(&self) -> &[NodeError] {
        &self.error_trail
    }

    /// Errors recorded by a specific node.
    pub fn errors_for(&self, node_name: &str) -> Vec<&NodeError> {
        self.error_trail
            .iter()
            .filter(|e| e.node_name == node_name)
            .collect()
    }
}
