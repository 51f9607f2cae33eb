//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint speaking the `/chat/completions` dialect.
//! Transport and HTTP failures are mapped onto the node error taxonomy at
//! this boundary so callers never see raw reqwest errors.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::runtime::NodeError;

use super::{ChatRequest, ChatResponse, ModelProvider, TokenUsage};

/// HTTP provider configuration
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Breaker key and log name for this endpoint
    pub name: String,
    /// API key sent as a bearer token
    pub api_key: String,
    /// API base URL
    pub base_url: String,
    /// Provider model id
    pub model: String,
    /// Request timeout
    pub timeout_secs: u64,
}

impl HttpProviderConfig {
    pub fn from_env(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            api_key: std::env::var(format!("{prefix}_API_KEY")).unwrap_or_default(),
            base_url: std::env::var(format!("{prefix}_API_URL"))
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: std::env::var(format!("{prefix}_MODEL"))
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout_secs: 60,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Chat client for one OpenAI-compatible endpoint
pub struct HttpProvider {
    config: HttpProviderConfig,
    http: Client,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, NodeError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                NodeError::configuration(&config.name, format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { config, http })
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn classify_status(&self, status: StatusCode, body: &str) -> NodeError {
        let name = &self.config.name;
        let summary: String = body.chars().take(200).collect();

        match status.as_u16() {
            429 => NodeError::api_limit(name, format!("rate limited: {summary}")),
            401 | 403 => {
                NodeError::authentication(name, format!("request rejected ({status}): {summary}"))
            }
            400 | 422 => {
                NodeError::validation(name, format!("request invalid ({status}): {summary}"))
            }
            500..=599 => NodeError::external_service(
                name,
                format!("upstream error ({status}): {summary}"),
            ),
            _ => NodeError::processing(name, format!("unexpected status {status}: {summary}")),
        }
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, NodeError> {
        let name = &self.config.name;
        if !self.is_configured() {
            return Err(NodeError::configuration(name, "API key not configured"));
        }

        debug!(provider = %name, model = %request.model, "sending chat completion request");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NodeError::network(name, format!("request timed out: {e}"))
                } else {
                    NodeError::network(name, format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| NodeError::network(name, format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(self.classify_status(status, &body));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| NodeError::processing(name, format!("malformed response body: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| NodeError::processing(name, "response contained no choices"))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(ChatResponse {
            content: choice.message.content,
            usage,
            model: parsed.model.unwrap_or_else(|| request.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ErrorCategory;

    fn provider() -> HttpProvider {
        HttpProvider::new(HttpProviderConfig {
            name: "openai".to_string(),
            api_key: "test-key".to_string(),
            base_url: "https://example.invalid/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_status_classification() {
        let p = provider();

        let err = p.classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(err.category, ErrorCategory::ApiLimit);

        let err = p.classify_status(StatusCode::UNAUTHORIZED, "bad key");
        assert_eq!(err.category, ErrorCategory::Authentication);
        assert!(!err.recoverable);

        let err = p.classify_status(StatusCode::BAD_GATEWAY, "upstream sad");
        assert_eq!(err.category, ErrorCategory::ExternalService);

        let err = p.classify_status(StatusCode::BAD_REQUEST, "bad schema");
        assert_eq!(err.category, ErrorCategory::Validation);
    }

    #[tokio::test]
    async fn test_unconfigured_provider_errors_without_io() {
        let p = HttpProvider::new(HttpProviderConfig {
            name: "openai".to_string(),
            api_key: String::new(),
            base_url: "https://example.invalid/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 5,
        })
        .unwrap();

        let err = p
            .complete(&ChatRequest::prompt("gpt-4o-mini", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Configuration);
    }
}
