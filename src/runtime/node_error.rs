//! Node-level error taxonomy
//!
//! Every failure caught inside the execution envelope is classified into a
//! `NodeError` and appended to the execution's error trail. The trail is a
//! historical record: entries are never removed during a run, even when a
//! later attempt succeeds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure category, drives retry eligibility and default severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    ApiLimit,
    Validation,
    Processing,
    ExternalService,
    Configuration,
    Authentication,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "NETWORK"),
            ErrorCategory::ApiLimit => write!(f, "API_LIMIT"),
            ErrorCategory::Validation => write!(f, "VALIDATION"),
            ErrorCategory::Processing => write!(f, "PROCESSING"),
            ErrorCategory::ExternalService => write!(f, "EXTERNAL_SERVICE"),
            ErrorCategory::Configuration => write!(f, "CONFIGURATION"),
            ErrorCategory::Authentication => write!(f, "AUTHENTICATION"),
        }
    }
}

impl ErrorCategory {
    /// Default severity assigned at classification time.
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::Network | ErrorCategory::ApiLimit => ErrorSeverity::Medium,
            ErrorCategory::Validation => ErrorSeverity::Low,
            ErrorCategory::Processing | ErrorCategory::ExternalService => ErrorSeverity::Medium,
            ErrorCategory::Configuration => ErrorSeverity::High,
            ErrorCategory::Authentication => ErrorSeverity::Critical,
        }
    }

    /// Whether errors of this category may be retried at all.
    /// Validation and authentication failures propagate immediately.
    pub fn default_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorCategory::Validation | ErrorCategory::Authentication | ErrorCategory::Configuration
        )
    }

    /// Stable code string carried on every error of this category.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK_ERROR",
            ErrorCategory::ApiLimit => "API_LIMIT_EXCEEDED",
            ErrorCategory::Validation => "VALIDATION_FAILED",
            ErrorCategory::Processing => "PROCESSING_FAILED",
            ErrorCategory::ExternalService => "EXTERNAL_SERVICE_ERROR",
            ErrorCategory::Configuration => "CONFIGURATION_ERROR",
            ErrorCategory::Authentication => "AUTHENTICATION_FAILED",
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "LOW"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// A classified failure from one node attempt.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{category}/{severity}] {node_name}: {message} (code {code}, retry {retry_count})")]
pub struct NodeError {
    pub code: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub node_name: String,
    pub retry_count: u32,
    pub recoverable: bool,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl NodeError {
    /// Classify a failure under the given category with category defaults.
    pub fn new(category: ErrorCategory, node_name: &str, message: impl Into<String>) -> Self {
        Self {
            code: category.code().to_string(),
            message: message.into(),
            severity: category.default_severity(),
            category,
            node_name: node_name.to_string(),
            retry_count: 0,
            recoverable: category.default_recoverable(),
            context: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn network(node_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, node_name, message)
    }

    pub fn api_limit(node_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ApiLimit, node_name, message)
    }

    pub fn validation(node_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, node_name, message)
    }

    pub fn processing(node_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Processing, node_name, message)
    }

    pub fn external_service(node_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ExternalService, node_name, message)
    }

    pub fn configuration(node_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, node_name, message)
    }

    pub fn authentication(node_name: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Authentication, node_name, message)
    }

    /// Attach a context entry for downstream audit.
    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Override the stable code (defaults to the category code).
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Record the attempt number this failure occurred on and escalate
    /// severity where warranted: network-ish failures that survive two or
    /// more retries are promoted to HIGH.
    pub fn at_retry(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        if retry_count >= 2
            && matches!(self.category, ErrorCategory::Network | ErrorCategory::ApiLimit)
            && self.severity < ErrorSeverity::High
        {
            self.severity = ErrorSeverity::High;
        }
        self
    }
}
