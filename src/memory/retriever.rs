//! Relevance-ranked memory retrieval
//!
//! Every stored memory for a child is scored against the live conversation on
//! four signals (keyword overlap, recency, importance, type match) and the
//! best few above a floor are returned.

use super::model::{Memory, MemoryType, ScoredMemory, MAX_IMPORTANCE};
use super::store::MemoryStore;
use crate::rules::LexiconSet;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will", "would",
    "could", "should", "may", "might", "can", "i", "you", "he", "she", "it", "we", "they", "me",
    "him", "her", "us", "them", "my", "your", "his", "its", "our", "their", "this", "that",
    "these", "those",
];

const PROMPT_HEADER: &str = "Previous relevant memories about this child:";
const PROMPT_FOOTER: &str =
    "Use these memories to personalize your response and show that you remember previous interactions.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub keyword_weight: f64,
    pub recency_weight: f64,
    pub importance_weight: f64,
    pub type_weight: f64,
    pub max_memories: usize,
    pub min_relevance_score: f64,
    /// Only consider memories from the last N days
    pub lookback_days: Option<u32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 1.0,
            recency_weight: 0.8,
            importance_weight: 1.2,
            type_weight: 0.6,
            max_memories: 5,
            min_relevance_score: 0.1,
            lookback_days: None,
        }
    }
}

impl RetrievalConfig {
    fn total_weight(&self) -> f64 {
        self.keyword_weight + self.recency_weight + self.importance_weight + self.type_weight
    }
}

pub struct MemoryRetriever {
    store: Arc<dyn MemoryStore>,
    config: RetrievalConfig,
    lexicons: Arc<LexiconSet>,
}

impl MemoryRetriever {
    pub fn new(store: Arc<dyn MemoryStore>, config: RetrievalConfig, lexicons: Arc<LexiconSet>) -> Self {
        Self {
            store,
            config,
            lexicons,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn retrieve(&self, child_id: &str, conversation_context: &str) -> Result<Vec<ScoredMemory>> {
        self.retrieve_at(child_id, conversation_context, Utc::now()).await
    }

    /// Top memories for `conversation_context`, best first. Ties go to the
    /// newer memory. An empty result is normal.
    pub async fn retrieve_at(
        &self,
        child_id: &str,
        conversation_context: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredMemory>> {
        let candidates = match self.config.lookback_days {
            Some(days) => {
                let start = now - Duration::days(i64::from(days));
                self.store.get_memories_in_time_range(child_id, start, now).await?
            }
            None => self.store.get_for_child(child_id).await?,
        };
        if candidates.is_empty() {
            debug!("No memories found for child: {}", child_id);
            return Ok(Vec::new());
        }

        let context_keywords = extract_keywords(conversation_context);
        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .filter(|m| !m.text.trim().is_empty())
            .map(|m| self.score_memory(m, &context_keywords, conversation_context, now))
            .filter(|s| s.relevance_score >= self.config.min_relevance_score)
            .collect();

        scored.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then_with(|| b.memory.timestamp.cmp(&a.memory.timestamp))
                .then_with(|| b.memory.id.cmp(&a.memory.id))
        });
        scored.truncate(self.config.max_memories);

        debug!("Retrieved {} relevant memories for child: {}", scored.len(), child_id);
        Ok(scored)
    }

    /// Weighted mean of the four sub-scores
    pub fn score_memory(
        &self,
        memory: Memory,
        context_keywords: &BTreeSet<String>,
        conversation_context: &str,
        now: DateTime<Utc>,
    ) -> ScoredMemory {
        let memory_keywords = extract_keywords(&memory.text);
        let keyword_matches: BTreeSet<String> = memory_keywords
            .intersection(context_keywords)
            .cloned()
            .collect();
        let keyword = (keyword_matches.len() as f64 / context_keywords.len().max(1) as f64).min(1.0);
        let recency = recency_score(memory.age_days(now));
        let importance = f64::from(memory.importance) / f64::from(MAX_IMPORTANCE);
        let type_match = self.type_score(memory.memory_type, conversation_context);

        let cfg = &self.config;
        let total = cfg.total_weight();
        let relevance_score = if total > 0.0 {
            (keyword * cfg.keyword_weight
                + recency * cfg.recency_weight
                + importance * cfg.importance_weight
                + type_match * cfg.type_weight)
                / total
        } else {
            0.0
        };

        ScoredMemory {
            memory,
            relevance_score,
            keyword_matches,
        }
    }

    /// How strongly the conversation is about this kind of memory
    fn type_score(&self, memory_type: MemoryType, conversation_context: &str) -> f64 {
        let (present, absent) = match memory_type {
            MemoryType::General => return 0.4,
            MemoryType::Preference => (0.8, 0.3),
            MemoryType::Emotional => (0.9, 0.3),
            MemoryType::Educational => (0.8, 0.4),
            MemoryType::Personal => (0.7, 0.3),
            MemoryType::Achievement => (0.7, 0.3),
            MemoryType::Difficulty => (0.8, 0.3),
        };
        let matched = self
            .lexicons
            .for_type(memory_type)
            .is_some_and(|lexicon| lexicon.is_match(conversation_context));
        if matched {
            present
        } else {
            absent
        }
    }
}

/// Lowercase tokens longer than two characters, stop words removed
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Step function on age: one day, one week, one month, older
pub fn recency_score(age_days: f64) -> f64 {
    if age_days <= 1.0 {
        1.0
    } else if age_days <= 7.0 {
        0.8
    } else if age_days <= 30.0 {
        0.6
    } else {
        0.2
    }
}

/// Numbered memory list ready to append to a system prompt. Empty input
/// gives an empty string.
pub fn format_memories_for_prompt(memories: &[ScoredMemory], now: DateTime<Utc>) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let entries = memories
        .iter()
        .enumerate()
        .map(|(i, scored)| {
            let memory = &scored.memory;
            format!(
                "{}. [{}] {} ({})\n   {}",
                i + 1,
                memory.memory_type,
                memory.stars(),
                format_time_ago(memory.timestamp, now),
                memory.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("{PROMPT_HEADER}\n{entries}\n\n{PROMPT_FOOTER}")
}

fn format_time_ago(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - timestamp).num_minutes().max(0);
    match minutes {
        m if m < 60 => format!("{m}m ago"),
        m if m < 24 * 60 => format!("{}h ago", m / 60),
        m if m < 7 * 24 * 60 => format!("{}d ago", m / (24 * 60)),
        m if m < 30 * 24 * 60 => format!("{}w ago", m / (7 * 24 * 60)),
        m => format!("{}mo ago", m / (30 * 24 * 60)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn memory(days_ago: i64, text: &str, memory_type: MemoryType, importance: u8) -> Memory {
        Memory::new("c1", now() - Duration::days(days_ago), text, memory_type, importance, 0.0)
    }

    fn retriever(store: Arc<dyn MemoryStore>, config: RetrievalConfig) -> MemoryRetriever {
        MemoryRetriever::new(store, config, Arc::new(LexiconSet::default()))
    }

    #[test]
    fn test_default_config_is_reasonable() {
        let config = RetrievalConfig::default();
        assert!((3..=10).contains(&config.max_memories));
        assert!((0.05..=0.3).contains(&config.min_relevance_score));
        assert!(config.keyword_weight > 0.0);
        assert!(config.importance_weight > 0.0);
    }

    #[test]
    fn test_keyword_extraction() {
        let keywords = extract_keywords("I really love Dinosaurs and the T-Rex is my favorite!");
        let expected: BTreeSet<String> = ["really", "love", "dinosaurs", "rex", "favorite"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(keywords, expected);
        assert!(extract_keywords("a an the of it").is_empty());
    }

    #[test]
    fn test_recency_staircase() {
        assert_eq!(recency_score(-2.0), 1.0);
        assert_eq!(recency_score(0.5), 1.0);
        assert_eq!(recency_score(1.0), 1.0);
        assert_eq!(recency_score(6.0), 0.8);
        assert_eq!(recency_score(7.0), 0.8);
        assert_eq!(recency_score(7.0001), 0.6);
        assert_eq!(recency_score(30.0), 0.6);
        assert_eq!(recency_score(45.0), 0.2);
    }

    #[test]
    fn test_time_ago() {
        let n = now();
        assert_eq!(format_time_ago(n - Duration::minutes(5), n), "5m ago");
        assert_eq!(format_time_ago(n - Duration::hours(3), n), "3h ago");
        assert_eq!(format_time_ago(n - Duration::days(2), n), "2d ago");
        assert_eq!(format_time_ago(n - Duration::days(14), n), "2w ago");
        assert_eq!(format_time_ago(n - Duration::days(65), n), "2mo ago");
        assert_eq!(format_time_ago(n + Duration::minutes(5), n), "0m ago");
    }

    #[tokio::test]
    async fn test_keyword_match_ranks_first() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert(memory(3, "Loves dinosaurs, especially triceratops", MemoryType::Preference, 3))
            .await
            .unwrap();
        store
            .insert(memory(3, "Practiced counting coins", MemoryType::General, 3))
            .await
            .unwrap();

        let results = retriever(store, RetrievalConfig::default())
            .retrieve_at("c1", "Can we talk about dinosaurs today?", now())
            .await
            .unwrap();
        assert_eq!(results[0].memory.text, "Loves dinosaurs, especially triceratops");
        assert!(results[0].keyword_matches.contains("dinosaurs"));
        assert!(results[0].relevance_score > results[1].relevance_score);
    }

    #[tokio::test]
    async fn test_filter_and_truncate() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..8 {
            store
                .insert(memory(i, &format!("memory number {i}"), MemoryType::General, 3))
                .await
                .unwrap();
        }
        let config = RetrievalConfig {
            max_memories: 3,
            ..RetrievalConfig::default()
        };
        let results = retriever(store.clone(), config)
            .retrieve_at("c1", "hello", now())
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        for pair in results.windows(2) {
            assert!(pair[0].relevance_score >= pair[1].relevance_score);
        }

        let strict = RetrievalConfig {
            min_relevance_score: 0.99,
            ..RetrievalConfig::default()
        };
        let results = retriever(store, strict).retrieve_at("c1", "hello", now()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_equal_scores_prefer_newer() {
        let store = Arc::new(InMemoryStore::new());
        let older = Memory::new("c1", now() - Duration::hours(10), "same text", MemoryType::General, 3, 0.0);
        let newer = Memory::new("c1", now() - Duration::hours(2), "same text", MemoryType::General, 3, 0.0);
        store.insert(older).await.unwrap();
        let newer_id = store.insert(newer).await.unwrap();

        let results = retriever(store, RetrievalConfig::default())
            .retrieve_at("c1", "unrelated words", now())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].relevance_score, results[1].relevance_score);
        assert_eq!(results[0].memory.id, Some(newer_id));
    }

    #[tokio::test]
    async fn test_type_match_boosts_score() {
        let store: Arc<dyn MemoryStore> = Arc::new(InMemoryStore::new());
        let r = retriever(store, RetrievalConfig::default());
        let m = memory(2, "Gets nervous before tests", MemoryType::Emotional, 3);
        let keywords = BTreeSet::new();
        let with = r.score_memory(m.clone(), &keywords, "I feel scared", now());
        let without = r.score_memory(m, &keywords, "let's play", now());
        assert!(with.relevance_score > without.relevance_score);
    }

    #[tokio::test]
    async fn test_lookback_and_empty_text() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(memory(60, "old fact about soccer", MemoryType::General, 5)).await.unwrap();
        store.insert(memory(1, "   ", MemoryType::General, 5)).await.unwrap();
        store.insert(memory(1, "recent fact about soccer", MemoryType::General, 5)).await.unwrap();

        let config = RetrievalConfig {
            lookback_days: Some(30),
            ..RetrievalConfig::default()
        };
        let results = retriever(store, config).retrieve_at("c1", "soccer", now()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.text, "recent fact about soccer");
    }

    #[tokio::test]
    async fn test_other_children_not_returned() {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert(Memory::new("c2", now(), "Loves trains", MemoryType::Preference, 5, 0.0))
            .await
            .unwrap();
        let results = retriever(store, RetrievalConfig::default())
            .retrieve_at("c1", "trains", now())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_prompt_format() {
        let scored = ScoredMemory {
            memory: memory(2, "Loves dinosaurs", MemoryType::Preference, 3),
            relevance_score: 0.7,
            keyword_matches: BTreeSet::new(),
        };
        let text = format_memories_for_prompt(&[scored], now());
        assert_eq!(
            text,
            "Previous relevant memories about this child:\n\
             1. [PREFERENCE] ★★★ (2d ago)\n   Loves dinosaurs\n\n\
             Use these memories to personalize your response and show that you remember previous interactions."
        );
        assert_eq!(format_memories_for_prompt(&[], now()), "");
    }
}
