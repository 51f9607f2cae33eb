use thiserror::Error;

use crate::runtime::NodeError;

/// Main error type for the execution core
#[derive(Error, Debug)]
pub enum AxonError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Model registry errors
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Unpriced model: {logical_id} resolves to {provider_model_id} with no pricing entry")]
    UnpricedModel {
        logical_id: String,
        provider_model_id: String,
    },

    // Budget errors
    #[error("Budget exceeded for {user_id}: requested {requested}, remaining {remaining}")]
    BudgetExceeded {
        user_id: String,
        requested: i64,
        remaining: i64,
    },

    #[error("Reservation not found: user {user_id}, trace {trace_id}")]
    ReservationNotFound { user_id: String, trace_id: String },

    // Circuit breaker errors
    #[error("Circuit open for {node_name}, retry in {retry_after_secs}s")]
    CircuitOpen {
        node_name: String,
        retry_after_secs: u64,
    },

    // Node execution errors
    #[error("Node execution failed: {0}")]
    Node(NodeError),

    // Consensus errors
    #[error("Insufficient consensus: {valid} valid of {attempted} providers")]
    InsufficientConsensus { attempted: usize, valid: usize },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AxonError {
    /// Stable machine-readable code exposed to callers alongside the message.
    pub fn error_code(&self) -> &'static str {
        match self {
            AxonError::Config(_) => "CONFIG_ERROR",
            AxonError::Database(_) => "DATABASE_ERROR",
            AxonError::Http(_) => "HTTP_ERROR",
            AxonError::RateLimited(_) => "RATE_LIMITED",
            AxonError::Json(_) => "SERIALIZATION_ERROR",
            AxonError::ModelNotFound(_) => "MODEL_NOT_FOUND",
            AxonError::UnpricedModel { .. } => "UNPRICED_MODEL",
            AxonError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            AxonError::ReservationNotFound { .. } => "RESERVATION_NOT_FOUND",
            AxonError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            AxonError::Node(_) => "NODE_FAILED",
            AxonError::InsufficientConsensus { .. } => "INSUFFICIENT_CONSENSUS",
            AxonError::Validation(_) => "VALIDATION_ERROR",
            AxonError::Io(_) => "IO_ERROR",
            AxonError::Internal(_) => "INTERNAL_ERROR",
            AxonError::Cancelled => "CANCELLED",
            AxonError::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// Whether the caller may retry the whole operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            AxonError::Http(_) | AxonError::RateLimited(_) | AxonError::Database(_) => true,
            AxonError::CircuitOpen { .. } => true,
            AxonError::Node(e) => e.recoverable,
            _ => false,
        }
    }
}

impl From<NodeError> for AxonError {
    fn from(err: NodeError) -> Self {
        AxonError::Node(err)
    }
}

/// Result type alias for AxonError
pub type Result<T> = std::result::Result<T, AxonError>;
