//! Entry points for the conversational pipeline
//!
//! [`MemoryPipeline`] wires the store, classifier, retriever, summarizer and
//! context window manager together behind the three calls the hosting app
//! makes: after a turn, before a model request, and on a maintenance schedule.

use crate::context::{ContextWindowManager, ContextWindowResult, ConversationTurn, ToolSchema, TurnRole};
use crate::llm::SummaryModel;
use crate::memory::{
    MemoryRetriever, MemoryStore, MemorySummarizer, SignificanceClassifier, SummarizationResult,
};
use crate::rules::LexiconSet;
use crate::{MemoryConfig, Result};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Recent chat turns used as the retrieval key
const RETRIEVAL_CONTEXT_TURNS: usize = 6;

/// Store size limits applied after summarization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Above this many memories, old ones are pruned
    pub cleanup_threshold: usize,
    /// Above this many after pruning, low-importance ones go too
    pub max_memories_per_child: usize,
    pub old_memory_days: u32,
    /// Highest importance removed by low-importance pruning
    pub low_importance_cutoff: u8,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_threshold: 400,
            max_memories_per_child: 500,
            old_memory_days: 90,
            low_importance_cutoff: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceReport {
    pub child_id: String,
    /// `None` when summarization is disabled, had nothing to do, or failed
    pub summarization: Option<SummarizationResult>,
    pub deleted_old: usize,
    pub deleted_low_importance: usize,
    /// Memories left after maintenance
    pub memory_count: usize,
}

pub struct MemoryPipeline {
    store: Arc<dyn MemoryStore>,
    classifier: SignificanceClassifier,
    retriever: MemoryRetriever,
    summarizer: MemorySummarizer,
    window: ContextWindowManager,
    config: MemoryConfig,
    tools: Vec<ToolSchema>,
}

impl MemoryPipeline {
    /// Build every component from one config. Fails only when a configured
    /// lexicon does not compile or the config is invalid.
    pub fn new(
        config: MemoryConfig,
        store: Arc<dyn MemoryStore>,
        model: Arc<dyn SummaryModel>,
    ) -> Result<Self> {
        config.validate()?;
        let lexicons = Arc::new(LexiconSet::compile(&config.lexicons)?);

        Ok(Self {
            classifier: SignificanceClassifier::new(config.significance.clone(), lexicons.clone()),
            retriever: MemoryRetriever::new(store.clone(), config.retrieval.clone(), lexicons),
            summarizer: MemorySummarizer::new(store.clone(), model, config.summarization.clone()),
            window: ContextWindowManager::new(config.context.clone()),
            store,
            config,
            tools: Vec::new(),
        })
    }

    /// Tool schemas reserved in every request
    pub fn with_tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn classifier(&self) -> &SignificanceClassifier {
        &self.classifier
    }

    pub fn retriever(&self) -> &MemoryRetriever {
        &self.retriever
    }

    pub fn summarizer(&self) -> &MemorySummarizer {
        &self.summarizer
    }

    pub fn window_manager(&self) -> &ContextWindowManager {
        &self.window
    }

    pub fn tools(&self) -> &[ToolSchema] {
        &self.tools
    }

    /// Classify a finished exchange and store it if significant.
    /// Returns the new memory's id.
    pub async fn on_turn_completed(
        &self,
        child_id: &str,
        user_message: &str,
        assistant_response: &str,
    ) -> Result<Option<i64>> {
        let Some(memory) = self
            .classifier
            .evaluate(child_id, user_message, assistant_response)
        else {
            return Ok(None);
        };

        let memory_type = memory.memory_type;
        let importance = memory.importance;
        let id = self.store.insert(memory).await?;
        info!(
            "Stored {} memory {} (importance {}) for child: {}",
            memory_type, id, importance, child_id
        );
        Ok(Some(id))
    }

    /// Recall memories for the live conversation and fit everything into
    /// the token budget
    pub async fn prepare_request_context(
        &self,
        child_id: &str,
        live_conversation: &[ConversationTurn],
    ) -> Result<ContextWindowResult> {
        let key = retrieval_key(live_conversation);
        let memories = if key.trim().is_empty() || !self.config.context.include_memories {
            Vec::new()
        } else {
            self.retriever.retrieve(child_id, &key).await?
        };
        debug!(
            "Preparing context for child {}: {} turns, {} memories, {} tools",
            child_id,
            live_conversation.len(),
            memories.len(),
            self.tools.len()
        );

        let result = self
            .window
            .optimize_context_window(live_conversation, &memories, &self.tools, None);
        if result.dropped_turns > 0 || result.dropped_memories > 0 {
            warn!(
                "Context for child {} over budget: dropped {} turns and {} memories",
                child_id, result.dropped_turns, result.dropped_memories
            );
        }
        Ok(result)
    }

    pub async fn run_maintenance(&self, child_id: &str) -> Result<MaintenanceReport> {
        self.run_maintenance_at(child_id, Utc::now()).await
    }

    /// Summarize old memories, then enforce the store size limits
    pub async fn run_maintenance_at(&self, child_id: &str, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let summarization = if self.config.summarization.enable_auto_summarization {
            self.summarizer.summarize_at(child_id, now).await?
        } else {
            debug!("Auto summarization disabled; skipping for child: {}", child_id);
            None
        };

        let limits = &self.config.maintenance;
        let mut count = self.store.get_memory_count(child_id).await?;
        let mut deleted_old = 0;
        let mut deleted_low_importance = 0;
        if count > limits.cleanup_threshold {
            let cutoff = now - Duration::days(i64::from(limits.old_memory_days));
            deleted_old = self.store.delete_old_memories(child_id, cutoff).await?;
            count -= deleted_old.min(count);

            if count > limits.max_memories_per_child {
                deleted_low_importance = self
                    .store
                    .delete_low_importance_memories(child_id, limits.low_importance_cutoff)
                    .await?;
                count -= deleted_low_importance.min(count);
            }
            info!(
                "Cleaned up memories for child {}: {} old, {} low importance",
                child_id, deleted_old, deleted_low_importance
            );
        }

        Ok(MaintenanceReport {
            child_id: child_id.to_string(),
            summarization,
            deleted_old,
            deleted_low_importance,
            memory_count: count,
        })
    }

    /// Maintenance for many children, at most `concurrency` at a time.
    /// Results come back in completion order.
    pub async fn run_maintenance_for(
        &self,
        children: &[String],
        concurrency: usize,
    ) -> Vec<(String, Result<MaintenanceReport>)> {
        stream::iter(children.iter().cloned())
            .map(|child| async move {
                let report = self.run_maintenance(&child).await;
                if let Err(e) = &report {
                    warn!("Maintenance failed for child {}: {}", child, e);
                }
                (child, report)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }
}

/// Text of the most recent user and assistant turns, oldest first
fn retrieval_key(turns: &[ConversationTurn]) -> String {
    let mut recent: Vec<&str> = turns
        .iter()
        .rev()
        .filter(|t| matches!(t.role, TurnRole::User | TurnRole::Assistant))
        .take(RETRIEVAL_CONTEXT_TURNS)
        .map(|t| t.content.as_str())
        .collect();
    recent.reverse();
    recent.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_key_uses_recent_chat_only() {
        let mut turns = vec![ConversationTurn::system("You are Merlin.")];
        for i in 0..10 {
            turns.push(ConversationTurn::user(format!("u{i}")));
        }
        turns.push(ConversationTurn::tool("call_1", "tool output"));
        assert_eq!(retrieval_key(&turns), "u4 u5 u6 u7 u8 u9");
        assert_eq!(retrieval_key(&[]), "");
    }

    #[test]
    fn test_default_maintenance_limits() {
        let config = MaintenanceConfig::default();
        assert!(config.cleanup_threshold < config.max_memories_per_child);
        assert_eq!(config.old_memory_days, 90);
    }
}
