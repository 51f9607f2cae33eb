//! Model provider clients.
//!
//! A provider is anything that can answer a chat request: a hosted API, a
//! local model, or a test stub. Providers surface failures as classified
//! `NodeError`s so the execution envelope can make retry decisions without
//! inspecting transport details.

pub mod http;

pub use http::{HttpProvider, HttpProviderConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runtime::NodeError;

/// One message in a chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Token usage reported by a provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Chat completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// A model endpoint the core can fan work out to.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable name, also the circuit-breaker key for this provider
    fn name(&self) -> &str;

    /// Provider model id calls are made with
    fn model(&self) -> &str;

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, NodeError>;
}
