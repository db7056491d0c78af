//! Chat Completions client used for summarization

use super::{LlmConfig, SummaryModel, SummaryRequest};
use crate::{MemoryError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_BASE_DELAY_MS: u64 = 200;
const MAX_ERROR_DETAIL_CHARS: usize = 500;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// [`SummaryModel`] backed by an OpenAI-compatible `/chat/completions` endpoint
pub struct ChatCompletionsModel {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    max_retries: u32,
    max_tokens: u32,
    temperature: f32,
}

impl ChatCompletionsModel {
    /// Build a client, reading the API key from `config.api_key_env`
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            MemoryError::Config(format!(
                "environment variable {} with the API key is not set",
                config.api_key_env
            ))
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("merlin-memory/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MemoryError::Llm(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: api_key.into(),
            max_retries: config.max_retries.max(1),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Exponential backoff with a small deterministic jitter
    fn retry_backoff(attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base_ms = RETRY_BASE_DELAY_MS.saturating_mul(exp);
        let jitter = 1.0 + ((attempt as f64 * 0.37).sin() * 0.1);
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    }

    fn is_retryable_error(msg: &str) -> bool {
        msg.contains("timeout")
            || msg.contains("network")
            || msg.contains("retryable")
            || msg.contains("error sending request")
            || msg.contains("connection")
    }

    async fn send_request(&self, request: &SummaryRequest) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.system_prompt.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt.clone(),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_reqwest_error)?;
        let response = Self::check_response_status(response).await?;

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| MemoryError::Llm(format!("malformed completion: {e}")))?;
        Ok(chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }

    async fn check_response_status(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = truncate_error_detail(&extract_error_detail(&body), MAX_ERROR_DETAIL_CHARS);
        let kind = if Self::is_retryable_status(status) {
            "retryable API error"
        } else {
            "API error"
        };
        if detail.is_empty() {
            Err(MemoryError::Llm(format!("{kind} {status}")))
        } else {
            Err(MemoryError::Llm(format!("{kind} {status}: {detail}")))
        }
    }

    fn map_reqwest_error(e: reqwest::Error) -> MemoryError {
        if e.is_timeout() {
            MemoryError::Llm(format!("timeout: {e}"))
        } else if e.is_connect() {
            MemoryError::Llm(format!("network: {e}"))
        } else {
            MemoryError::Llm(e.to_string())
        }
    }
}

#[async_trait]
impl SummaryModel for ChatCompletionsModel {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        debug!("Requesting summary, prompt length: {}", request.prompt.len());

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                let delay = Self::retry_backoff(attempt);
                warn!(
                    "Summary request failed (attempt {}/{}), retrying in {:?}...",
                    attempt, self.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            match self.send_request(request).await {
                Ok(content) => return Ok(content.trim().to_string()),
                Err(e) if attempt + 1 < self.max_retries && Self::is_retryable_error(&e.to_string()) => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Pull the human-readable message out of a JSON error body
fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let message = value
            .get("error")
            .and_then(|e| e.get("message"))
            .or_else(|| value.get("message"))
            .and_then(|m| m.as_str());
        if let Some(msg) = message {
            return msg.to_string();
        }
    }
    trimmed.to_string()
}

fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }
    let mut truncated: String = detail.chars().take(max_chars).collect();
    truncated.push_str("... [truncated]");
    truncated
}
