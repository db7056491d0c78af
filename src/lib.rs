//! Merlin memory - conversational memory for a child-tutoring assistant
//!
//! Decides what is worth remembering about a child, recalls the memories that
//! matter for the live conversation, keeps the memory store bounded through
//! periodic summarization, and fits everything into the model's token budget:
//! - Significance classification of completed exchanges
//! - Relevance-ranked memory retrieval
//! - LLM-backed compaction of old memories
//! - Rolling conversation window and token-bounded request assembly

pub mod context;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod rules;

pub use context::{
    ContextConfig, ContextWindowManager, ContextWindowResult, ConversationContextManager,
    ConversationTurn, TokenUsageStats, ToolSchema, TurnRole,
};
pub use llm::{ChatCompletionsModel, LlmConfig, SummaryModel, SummaryRequest};
pub use memory::{
    InMemoryStore, JsonFileStore, Memory, MemoryRetriever, MemoryStore, MemorySummarizer,
    MemoryType, RetrievalConfig, ScoredMemory, SignificanceClassifier, SignificanceConfig,
    SummarizationConfig, SummarizationResult,
};
pub use pipeline::{MaintenanceConfig, MaintenanceReport, MemoryPipeline};
pub use rules::{LexiconConfig, LexiconSet};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the whole memory subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub significance: SignificanceConfig,
    pub retrieval: RetrievalConfig,
    pub summarization: SummarizationConfig,
    pub context: ContextConfig,
    pub maintenance: MaintenanceConfig,
    pub lexicons: LexiconConfig,
    pub llm: LlmConfig,
}

impl MemoryConfig {
    /// Default config location: `~/.merlin-memory/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".merlin-memory").join("config.toml"))
    }

    /// Load config from a TOML file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    pub fn with_summarization(mut self, summarization: SummarizationConfig) -> Self {
        self.summarization = summarization;
        self
    }

    /// Reject settings the algorithms cannot work with
    pub fn validate(&self) -> Result<()> {
        let ctx = &self.context;
        if ctx.max_tokens == 0 {
            return Err(MemoryError::Config("context.max_tokens must be positive".into()));
        }
        if ctx.reserved_tokens_for_response >= ctx.max_tokens {
            return Err(MemoryError::Config(format!(
                "context.reserved_tokens_for_response ({}) must be below max_tokens ({})",
                ctx.reserved_tokens_for_response, ctx.max_tokens
            )));
        }
        if ctx.window_size == 0 {
            return Err(MemoryError::Config("context.window_size must be positive".into()));
        }

        let sig = &self.significance;
        check_unit("significance.significance_threshold", sig.significance_threshold)?;
        check_weights(
            "significance",
            &[
                sig.length_weight,
                sig.emotional_weight,
                sig.personal_weight,
                sig.educational_weight,
                sig.question_weight,
            ],
        )?;

        let ret = &self.retrieval;
        check_unit("retrieval.min_relevance_score", ret.min_relevance_score)?;
        check_weights(
            "retrieval",
            &[
                ret.keyword_weight,
                ret.recency_weight,
                ret.importance_weight,
                ret.type_weight,
            ],
        )?;

        let sum = &self.summarization;
        if sum.batch_size == 0 {
            return Err(MemoryError::Config("summarization.batch_size must be positive".into()));
        }
        if sum.max_summary_length == 0 {
            return Err(MemoryError::Config(
                "summarization.max_summary_length must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MemoryError::Config(format!("{name} must be within [0, 1], got {value}")))
    }
}

fn check_weights(section: &str, weights: &[f64]) -> Result<()> {
    if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(MemoryError::Config(format!("{section} weights must be non-negative")));
    }
    if weights.iter().sum::<f64>() <= 0.0 {
        return Err(MemoryError::Config(format!("{section} weights must not all be zero")));
    }
    Ok(())
}

/// Result type for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors that can occur in the memory subsystem
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory store error: {0}")]
    Store(String),

    #[error("LLM summarization error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
