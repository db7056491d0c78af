//! Language-model access for memory summarization
//!
//! The summarizer only needs "turn this text into a shorter text", so the
//! seam is one async trait. [`ChatCompletionsModel`] implements it against any
//! OpenAI-compatible endpoint; tests substitute scripted doubles.

mod client;

pub use client::ChatCompletionsModel;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One summarization call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRequest {
    pub system_prompt: String,
    pub prompt: String,
    /// Replies longer than this many characters are cut by the caller
    pub max_chars: usize,
}

#[async_trait]
pub trait SummaryModel: Send + Sync {
    /// Produce a plain-text summary. An empty string counts as a failure.
    async fn summarize(&self, request: &SummaryRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API, without `/chat/completions`
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Per-attempt HTTP timeout
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
            max_retries: 4,
            max_tokens: 512,
            temperature: 0.3,
        }
    }
}
