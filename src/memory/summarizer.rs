//! Memory compaction
//!
//! Periodically folds a child's old, low-priority memories into LLM-written
//! summary memories so the store stays bounded:
//!   1. Collect memories older than the age threshold (never earlier summaries,
//!      and never high-importance memories when preservation is on)
//!   2. Group them by calendar week, then split each week into batches
//!   3. Ask the model to summarize each batch
//!   4. Insert the summary, then delete the batch
//!
//! A failed batch leaves its memories untouched; later batches still run.

use super::model::{Memory, MemoryType, MAX_IMPORTANCE, MIN_IMPORTANCE};
use super::store::MemoryStore;
use crate::context::estimate_tokens;
use crate::llm::{SummaryModel, SummaryRequest};
use crate::Result;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Every summary memory's text starts with this
pub const SUMMARY_PREFIX: &str = "SUMMARY (";

/// Rough saving per summarized memory, used for statistics only
const TOKENS_SAVED_PER_MEMORY: usize = 50;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are an expert at creating concise, useful summaries of educational interactions.";

const SUMMARY_PROMPT: &str = r#"You are helping to summarize a child's learning interactions for an AI tutor named Merlin.

Please create a concise summary of the following memories that captures:
1. Key preferences and interests
2. Learning strengths and difficulties
3. Emotional patterns and responses
4. Important personal information
5. Educational progress and achievements

Keep the summary focused, factual, and useful for personalizing future tutoring sessions."#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    pub batch_size: usize,
    /// Only memories older than this are candidates
    pub age_threshold_days: u32,
    /// Fewer candidates than this and nothing is summarized
    pub min_memories_for_summary: usize,
    /// Smaller batches (e.g. a week's leftovers) are left alone
    pub min_batch_size: usize,
    /// Gates summarization during maintenance runs
    pub enable_auto_summarization: bool,
    pub preserve_high_importance_memories: bool,
    /// Importance at or above which memories are preserved
    pub preserve_importance_at: u8,
    /// Summary text is cut to this many characters
    pub max_summary_length: usize,
    pub llm_timeout_secs: u64,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            age_threshold_days: 30,
            min_memories_for_summary: 5,
            min_batch_size: 2,
            enable_auto_summarization: true,
            preserve_high_importance_memories: true,
            preserve_importance_at: 4,
            max_summary_length: 500,
            llm_timeout_secs: 60,
        }
    }
}

/// One batch folded into one summary memory
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub summary_id: i64,
    /// Model output, without the summary prefix
    pub summary_text: String,
    pub original_memory_ids: Vec<i64>,
    pub memory_type: MemoryType,
    pub importance: u8,
    pub time_range: (DateTime<Utc>, DateTime<Utc>),
    pub dominant_types: Vec<MemoryType>,
    pub average_importance: f64,
    pub tokens_saved: usize,
}

/// Outcome of one summarization run for a child
#[derive(Debug, Clone, PartialEq)]
pub struct SummarizationResult {
    /// Batch summaries joined by blank lines
    pub summary_text: String,
    pub original_memory_ids: Vec<i64>,
    pub memory_count: usize,
    pub time_range: (DateTime<Utc>, DateTime<Utc>),
    /// Up to three, most frequent first, ties in order of first appearance
    pub dominant_types: Vec<MemoryType>,
    pub average_importance: f64,
    pub created_at: DateTime<Utc>,
    pub batches: Vec<BatchSummary>,
    /// Estimated tokens removed from the store
    pub tokens_saved: usize,
    pub batches_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SummarizationStats {
    pub total_memories_summarized: usize,
    pub summaries_created: usize,
    pub tokens_saved: usize,
    pub oldest_summary_age: Option<Duration>,
    pub newest_summary_age: Option<Duration>,
}

pub struct MemorySummarizer {
    store: Arc<dyn MemoryStore>,
    model: Arc<dyn SummaryModel>,
    config: SummarizationConfig,
}

impl MemorySummarizer {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        model: Arc<dyn SummaryModel>,
        config: SummarizationConfig,
    ) -> Self {
        Self {
            store,
            model,
            config,
        }
    }

    pub fn config(&self) -> &SummarizationConfig {
        &self.config
    }

    pub async fn summarize(&self, child_id: &str) -> Result<Option<SummarizationResult>> {
        self.summarize_at(child_id, Utc::now()).await
    }

    /// Run one compaction pass. `Ok(None)` when there was nothing to do or
    /// every batch failed; `Err` only for store failures.
    pub async fn summarize_at(
        &self,
        child_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SummarizationResult>> {
        debug!("Starting summarization for child: {}", child_id);
        let candidates = self.candidates(child_id, now).await?;
        if candidates.len() < self.config.min_memories_for_summary {
            debug!(
                "Not enough old memories for summarization: {} < {}",
                candidates.len(),
                self.config.min_memories_for_summary
            );
            return Ok(None);
        }

        let mut batches = Vec::new();
        let mut summarized = Vec::new();
        let mut batches_failed = 0;
        for batch in self.partition(candidates) {
            if batch.len() < self.config.min_batch_size.max(1) {
                continue;
            }
            match self.summarize_batch(child_id, &batch, now).await? {
                Some(summary) => {
                    batches.push(summary);
                    summarized.extend(batch);
                }
                None => batches_failed += 1,
            }
        }

        if batches.is_empty() {
            if batches_failed > 0 {
                warn!(
                    "Summarization for child {} produced no summaries ({} batches failed)",
                    child_id, batches_failed
                );
            }
            return Ok(None);
        }

        let result = aggregate(&summarized, batches, batches_failed, now);
        info!(
            "Summarized {} memories into {} summaries for child: {} (~{} tokens saved)",
            result.memory_count,
            result.batches.len(),
            child_id,
            result.tokens_saved
        );
        Ok(Some(result))
    }

    pub async fn needs_summarization(&self, child_id: &str) -> Result<bool> {
        self.needs_summarization_at(child_id, Utc::now()).await
    }

    /// Whether a run at `now` would find enough candidates
    pub async fn needs_summarization_at(&self, child_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let candidates = self.candidates(child_id, now).await?;
        Ok(candidates.len() >= self.config.min_memories_for_summary)
    }

    pub async fn summarization_stats(&self, child_id: &str) -> Result<SummarizationStats> {
        self.summarization_stats_at(child_id, Utc::now()).await
    }

    /// Roll-up over the summary memories currently stored for a child
    pub async fn summarization_stats_at(
        &self,
        child_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SummarizationStats> {
        let summaries: Vec<Memory> = self
            .store
            .get_for_child(child_id)
            .await?
            .into_iter()
            .filter(|m| is_summary(&m.text))
            .collect();

        let total: usize = summaries
            .iter()
            .filter_map(|m| summarized_count(&m.text))
            .sum();
        let oldest = summaries.iter().map(|m| m.timestamp).min();
        let newest = summaries.iter().map(|m| m.timestamp).max();

        Ok(SummarizationStats {
            total_memories_summarized: total,
            summaries_created: summaries.len(),
            tokens_saved: total * TOKENS_SAVED_PER_MEMORY,
            oldest_summary_age: oldest.map(|ts| now - ts),
            newest_summary_age: newest.map(|ts| now - ts),
        })
    }

    /// Old, non-summary, non-preserved memories, oldest first
    async fn candidates(&self, child_id: &str, now: DateTime<Utc>) -> Result<Vec<Memory>> {
        let cutoff = now - Duration::days(i64::from(self.config.age_threshold_days));
        let preserve = self.config.preserve_high_importance_memories;
        let mut candidates: Vec<Memory> = self
            .store
            .get_for_child(child_id)
            .await?
            .into_iter()
            .filter(|m| m.timestamp < cutoff && m.id.is_some())
            .filter(|m| !m.text.trim().is_empty() && !is_summary(&m.text))
            .filter(|m| !(preserve && m.importance >= self.config.preserve_importance_at))
            .collect();
        candidates.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(candidates)
    }

    /// Split chronologically sorted memories by ISO week, then by batch size
    fn partition(&self, sorted: Vec<Memory>) -> Vec<Vec<Memory>> {
        let batch_size = self.config.batch_size.max(1);
        let mut weeks: Vec<Vec<Memory>> = Vec::new();
        for memory in sorted {
            let week = memory.timestamp.iso_week();
            match weeks.last_mut() {
                Some(current) if current[0].timestamp.iso_week() == week => current.push(memory),
                _ => weeks.push(vec![memory]),
            }
        }

        let mut batches: Vec<Vec<Memory>> = Vec::new();
        for week in weeks {
            let mut week = week.into_iter().peekable();
            while week.peek().is_some() {
                batches.push(week.by_ref().take(batch_size).collect());
            }
        }
        batches
    }

    /// `Ok(None)` when the model fails; the batch stays in the store
    async fn summarize_batch(
        &self,
        child_id: &str,
        batch: &[Memory],
        now: DateTime<Utc>,
    ) -> Result<Option<BatchSummary>> {
        let request = SummaryRequest {
            system_prompt: SUMMARY_SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(batch, self.config.max_summary_length),
            max_chars: self.config.max_summary_length,
        };
        debug!("Requesting summarization for {} memories", batch.len());

        let timeout = std::time::Duration::from_secs(self.config.llm_timeout_secs.max(1));
        let reply = match tokio::time::timeout(timeout, self.model.summarize(&request)).await {
            Ok(Ok(reply)) if !reply.trim().is_empty() => reply,
            Ok(Ok(_)) => {
                warn!("Summarization returned empty content; keeping {} memories", batch.len());
                return Ok(None);
            }
            Ok(Err(e)) => {
                warn!("Summarization failed: {}; keeping {} memories", e, batch.len());
                return Ok(None);
            }
            Err(_) => {
                warn!(
                    "Summarization timed out after {:?}; keeping {} memories",
                    timeout,
                    batch.len()
                );
                return Ok(None);
            }
        };
        let summary_text: String = reply
            .trim()
            .chars()
            .take(self.config.max_summary_length)
            .collect();

        let original_memory_ids: Vec<i64> = batch.iter().filter_map(|m| m.id).collect();
        let dominant_types = dominant_types(batch);
        let average_importance = average_importance(batch);
        let memory_type = match dominant_types.first() {
            Some(&top) if batch.iter().filter(|m| m.memory_type == top).count() * 2 > batch.len() => top,
            _ => MemoryType::General,
        };
        let importance = (average_importance.round() as u8).clamp(MIN_IMPORTANCE, MAX_IMPORTANCE);

        let text = format!("{}{} memories): {}", SUMMARY_PREFIX, batch.len(), summary_text);
        let original_tokens: usize = batch.iter().map(|m| estimate_tokens(&m.text)).sum();
        let tokens_saved = original_tokens.saturating_sub(estimate_tokens(&text));
        let summary = Memory::new(child_id, now, text, memory_type, importance, 0.0);

        let summary_id = self
            .store
            .insert_and_delete(summary, &original_memory_ids)
            .await?;
        debug!(
            "Stored summary {} replacing {} memories",
            summary_id,
            original_memory_ids.len()
        );

        Ok(Some(BatchSummary {
            summary_id,
            summary_text,
            original_memory_ids,
            memory_type,
            importance,
            time_range: time_range(batch),
            dominant_types,
            average_importance,
            tokens_saved,
        }))
    }
}

pub fn is_summary(text: &str) -> bool {
    text.starts_with(SUMMARY_PREFIX)
}

/// Number of memories a summary absorbed, parsed from its prefix
fn summarized_count(text: &str) -> Option<usize> {
    let rest = text.strip_prefix(SUMMARY_PREFIX)?;
    let (count, _) = rest.split_once(" memories)")?;
    count.parse().ok()
}

fn build_prompt(batch: &[Memory], max_chars: usize) -> String {
    let memories = batch
        .iter()
        .map(|m| format!("{}: {} {}", m.memory_type, m.stars(), m.text.trim()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{SUMMARY_PROMPT}\n\nMemories to summarize:\n{memories}\n\n\
         Please provide a clear, organized summary in at most {max_chars} characters."
    )
}

/// Up to three types, most frequent first, ties broken by first appearance
fn dominant_types(memories: &[Memory]) -> Vec<MemoryType> {
    let mut counts: Vec<(MemoryType, usize)> = Vec::new();
    for m in memories {
        match counts.iter_mut().find(|(t, _)| *t == m.memory_type) {
            Some((_, n)) => *n += 1,
            None => counts.push((m.memory_type, 1)),
        }
    }
    // stable sort keeps first-seen order among equal counts
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(3).map(|(t, _)| t).collect()
}

fn average_importance(memories: &[Memory]) -> f64 {
    if memories.is_empty() {
        return 0.0;
    }
    memories.iter().map(|m| f64::from(m.importance)).sum::<f64>() / memories.len() as f64
}

fn time_range(memories: &[Memory]) -> (DateTime<Utc>, DateTime<Utc>) {
    let min = memories.iter().map(|m| m.timestamp).min();
    let max = memories.iter().map(|m| m.timestamp).max();
    match (min, max) {
        (Some(min), Some(max)) => (min, max),
        _ => (DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MIN_UTC),
    }
}

fn aggregate(
    summarized: &[Memory],
    batches: Vec<BatchSummary>,
    batches_failed: usize,
    now: DateTime<Utc>,
) -> SummarizationResult {
    SummarizationResult {
        summary_text: batches
            .iter()
            .map(|b| b.summary_text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
        original_memory_ids: summarized.iter().filter_map(|m| m.id).collect(),
        memory_count: summarized.len(),
        time_range: time_range(summarized),
        dominant_types: dominant_types(summarized),
        average_importance: average_importance(summarized),
        created_at: now,
        tokens_saved: batches.iter().map(|b| b.tokens_saved).sum(),
        batches,
        batches_failed,
    }
}
