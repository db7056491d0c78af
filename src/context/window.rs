//! Token-bounded request assembly
//!
//! Combines the system prompt, tool schemas, recalled memories and the chat
//! window into one payload that fits the model's budget. Priority when
//! trimming, highest first: system turn, tool schemas, memory context, chat
//! turns (newest first by default).

use super::conversation::{ConversationTurn, DEFAULT_WINDOW_SIZE};
use super::tokens::{estimate_tokens, truncate_to_tokens};
use super::tools::ToolSchema;
use crate::memory::{format_memories_for_prompt, ScoredMemory};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Conservative limit for GPT-4 class models
const DEFAULT_MAX_TOKENS: usize = 8000;
/// Reserved for the model's reply
const DEFAULT_RESERVED_TOKENS: usize = 1000;
const DEFAULT_MAX_MEMORIES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub reserved_tokens_for_response: usize,
    /// Fill the budget newest-first (default) instead of oldest-first
    pub prioritize_recent_messages: bool,
    pub include_memories: bool,
    /// Memories formatted into the context when no prepared text is given
    pub max_memories: usize,
    /// Capacity of the rolling conversation window, system prompt included
    pub window_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            reserved_tokens_for_response: DEFAULT_RESERVED_TOKENS,
            prioritize_recent_messages: true,
            include_memories: true,
            max_memories: DEFAULT_MAX_MEMORIES,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl ContextConfig {
    /// Tokens available for the request itself
    pub fn budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserved_tokens_for_response)
    }
}

/// Outcome of fitting a request into the budget
#[derive(Debug, Clone, PartialEq)]
pub struct ContextWindowResult {
    /// System turn first (if any), then the surviving chat turns in
    /// chronological order
    pub turns: Vec<ConversationTurn>,
    pub memory_context_text: Option<String>,
    /// Everything sent: turns, memory text and tool schemas
    pub total_tokens: usize,
    pub function_tokens: usize,
    pub dropped_turns: usize,
    pub dropped_memories: usize,
    /// The system turn alone exceeded the budget and was cut short
    pub system_truncated: bool,
}

impl ContextWindowResult {
    /// Whether anything had to be left out
    pub fn was_trimmed(&self) -> bool {
        self.dropped_turns > 0 || self.dropped_memories > 0 || self.system_truncated
    }

    /// Turns ready for dispatch, with the memory context folded into the
    /// system turn (or prepended as one when there is none)
    pub fn merged_turns(&self) -> Vec<ConversationTurn> {
        let mut turns = self.turns.clone();
        let Some(memory) = self.memory_context_text.as_deref() else {
            return turns;
        };
        match turns.first_mut() {
            Some(first) if first.is_system() => {
                first.content = format!("{}\n\n{}", first.content, memory);
            }
            _ => turns.insert(0, ConversationTurn::system(memory)),
        }
        turns
    }
}

/// Token usage breakdown for a prospective request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenUsageStats {
    pub message_tokens: usize,
    pub memory_tokens: usize,
    pub function_tokens: usize,
    pub total_tokens: usize,
    /// `max_tokens - total_tokens`, negative when over
    pub available_tokens: i64,
    pub utilization_percentage: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ContextWindowManager {
    config: ContextConfig,
}

impl ContextWindowManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Fit the request into `max_tokens - reserved_tokens_for_response`.
    ///
    /// Never fails: whatever does not fit is dropped and counted. When no
    /// `memory_context_text` is given, up to `max_memories` of
    /// `relevant_memories` are formatted into one.
    pub fn optimize_context_window(
        &self,
        chat_turns: &[ConversationTurn],
        relevant_memories: &[ScoredMemory],
        tool_schemas: &[ToolSchema],
        memory_context_text: Option<&str>,
    ) -> ContextWindowResult {
        let budget = self.config.budget();
        let function_tokens: usize = tool_schemas.iter().map(|t| t.estimate_tokens()).sum();
        if function_tokens > budget {
            warn!(
                "Tool schemas need {} tokens but only {} are available; reduce the tool count",
                function_tokens, budget
            );
        }
        let mut remaining = budget.saturating_sub(function_tokens);
        let mut total_tokens = function_tokens;

        let (system_turn, chat) = match chat_turns.split_first() {
            Some((first, rest)) if first.is_system() => (Some(first), rest),
            _ => (None, chat_turns),
        };

        // 1. System turn, truncated rather than dropped
        let mut turns = Vec::with_capacity(chat_turns.len());
        let mut system_truncated = false;
        if let Some(system) = system_turn {
            let tokens = system.estimate_tokens();
            let mut kept = system.clone();
            if tokens > remaining {
                warn!(
                    "System prompt ({} tokens) exceeds the remaining budget ({}); truncating",
                    tokens, remaining
                );
                kept.content = truncate_to_tokens(&system.content, remaining).to_string();
                system_truncated = true;
            }
            let used = kept.estimate_tokens();
            remaining -= used;
            total_tokens += used;
            turns.push(kept);
        }

        // 2. Memory context, all or nothing
        let mut dropped_memories = 0;
        let mut included_memory = None;
        if self.config.include_memories {
            let formatted;
            let memory_text = match memory_context_text {
                Some(text) => Some(text),
                None if !relevant_memories.is_empty() => {
                    let take = relevant_memories.len().min(self.config.max_memories);
                    dropped_memories += relevant_memories.len() - take;
                    formatted = format_memories_for_prompt(&relevant_memories[..take], Utc::now());
                    Some(formatted.as_str())
                }
                None => None,
            };

            if let Some(text) = memory_text.filter(|t| !t.is_empty()) {
                let tokens = estimate_tokens(text);
                if tokens <= remaining {
                    remaining -= tokens;
                    total_tokens += tokens;
                    included_memory = Some(text.to_string());
                } else {
                    debug!(
                        "Memory context ({} tokens) does not fit in {} remaining tokens; dropping",
                        tokens, remaining
                    );
                    dropped_memories = relevant_memories.len().max(1);
                }
            }
        }

        // 3. Chat turns, newest (or oldest) first until one does not fit
        let mut keep = vec![false; chat.len()];
        let order: Box<dyn Iterator<Item = usize>> = if self.config.prioritize_recent_messages {
            Box::new((0..chat.len()).rev())
        } else {
            Box::new(0..chat.len())
        };
        for idx in order {
            let tokens = chat[idx].estimate_tokens();
            if tokens > remaining {
                break;
            }
            remaining -= tokens;
            total_tokens += tokens;
            keep[idx] = true;
        }

        // 4. Chronological output regardless of fill direction
        turns.extend(
            chat.iter()
                .zip(&keep)
                .filter(|(_, kept)| **kept)
                .map(|(turn, _)| turn.clone()),
        );
        let dropped_turns = keep.iter().filter(|k| !**k).count();

        if dropped_turns > 0 || dropped_memories > 0 {
            debug!(
                "Context trimmed: kept {} turns, dropped {} turns and {} memories ({} / {} tokens)",
                turns.len(),
                dropped_turns,
                dropped_memories,
                total_tokens,
                budget
            );
        }

        ContextWindowResult {
            turns,
            memory_context_text: included_memory,
            total_tokens,
            function_tokens,
            dropped_turns,
            dropped_memories,
            system_truncated,
        }
    }

    pub fn get_token_usage_stats(
        &self,
        chat_turns: &[ConversationTurn],
        memory_context_text: Option<&str>,
        tool_schemas: &[ToolSchema],
    ) -> TokenUsageStats {
        let message_tokens: usize = chat_turns.iter().map(|t| t.estimate_tokens()).sum();
        let memory_tokens = memory_context_text.map(estimate_tokens).unwrap_or(0);
        let function_tokens: usize = tool_schemas.iter().map(|t| t.estimate_tokens()).sum();
        let total_tokens = message_tokens + memory_tokens + function_tokens;
        let max = self.config.max_tokens;

        TokenUsageStats {
            message_tokens,
            memory_tokens,
            function_tokens,
            total_tokens,
            available_tokens: max as i64 - total_tokens as i64,
            utilization_percentage: if max == 0 {
                0.0
            } else {
                total_tokens as f64 / max as f64 * 100.0
            },
        }
    }

    /// Cheap pre-check: does the untrimmed request exceed the budget?
    pub fn needs_optimization(
        &self,
        chat_turns: &[ConversationTurn],
        memory_context_text: Option<&str>,
        tool_schemas: &[ToolSchema],
    ) -> bool {
        let stats = self.get_token_usage_stats(chat_turns, memory_context_text, tool_schemas);
        stats.total_tokens > self.config.budget()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tools::ToolParameter;
    use crate::context::ParameterKind;
    use crate::memory::{Memory, MemoryType};
    use std::collections::BTreeSet;

    const SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

    fn manager(max_tokens: usize, reserved: usize) -> ContextWindowManager {
        ContextWindowManager::new(ContextConfig {
            max_tokens,
            reserved_tokens_for_response: reserved,
            ..ContextConfig::default()
        })
    }

    fn long_conversation(turns: usize, chars: usize) -> Vec<ConversationTurn> {
        let mut out = vec![ConversationTurn::system(SYSTEM_PROMPT)];
        for i in 0..turns {
            let body = format!("{i:03}{}", "x".repeat(chars - 3));
            if i % 2 == 0 {
                out.push(ConversationTurn::user(body));
            } else {
                out.push(ConversationTurn::assistant(body));
            }
        }
        out
    }

    fn scored(text: &str) -> ScoredMemory {
        ScoredMemory {
            memory: Memory::new("c1", Utc::now(), text, MemoryType::Preference, 3, 0.0).with_id(1),
            relevance_score: 0.5,
            keyword_matches: BTreeSet::new(),
        }
    }

    #[test]
    fn test_default_config_is_reasonable() {
        let config = ContextConfig::default();
        assert!(config.reserved_tokens_for_response < config.max_tokens);
        let share = config.reserved_tokens_for_response as f64 / config.max_tokens as f64;
        assert!((0.1..=0.3).contains(&share));
        assert!(config.prioritize_recent_messages);
        assert!(config.include_memories);
        assert!((3..=10).contains(&config.max_memories));
    }

    #[test]
    fn test_empty_input() {
        let result = manager(1000, 200).optimize_context_window(&[], &[], &[], None);
        assert!(result.turns.is_empty());
        assert_eq!(result.memory_context_text, None);
        assert_eq!(result.total_tokens, 0);
        assert_eq!(result.dropped_turns, 0);
        assert_eq!(result.dropped_memories, 0);
    }

    #[test]
    fn test_small_conversation_kept_whole() {
        let turns = vec![
            ConversationTurn::system(SYSTEM_PROMPT),
            ConversationTurn::user("Hello there"),
            ConversationTurn::assistant("Hi! How can I help?"),
        ];
        let result = manager(1000, 200).optimize_context_window(&turns, &[], &[], None);
        assert_eq!(result.turns, turns);
        assert_eq!(result.dropped_turns, 0);
        assert!(!result.was_trimmed());
    }

    #[test]
    fn test_long_conversation_keeps_system_and_newest() {
        let mgr = manager(1000, 200);
        let turns = long_conversation(20, 500);
        assert!(mgr.needs_optimization(&turns, None, &[]));

        let result = mgr.optimize_context_window(&turns, &[], &[], None);
        assert!(result.total_tokens <= 800);
        assert!(result.dropped_turns > 0);
        assert_eq!(result.turns[0].content, SYSTEM_PROMPT);
        // newest turn survives, and the kept turns are a chronological suffix
        assert_eq!(result.turns.last(), turns.last());
        let kept = &result.turns[1..];
        assert_eq!(kept, &turns[turns.len() - kept.len()..]);
        assert_eq!(kept.len() + result.dropped_turns, 20);
    }

    #[test]
    fn test_oldest_first_mode() {
        let mgr = ContextWindowManager::new(ContextConfig {
            max_tokens: 1000,
            reserved_tokens_for_response: 200,
            prioritize_recent_messages: false,
            ..ContextConfig::default()
        });
        let turns = long_conversation(20, 500);
        let result = mgr.optimize_context_window(&turns, &[], &[], None);
        assert!(result.total_tokens <= 800);
        // the oldest chat turn survives, the newest does not
        assert_eq!(result.turns[1], turns[1]);
        assert!(!result.turns.contains(turns.last().unwrap()));
    }

    #[test]
    fn test_oversized_system_prompt_is_truncated_not_dropped() {
        let turns = vec![
            ConversationTurn::system("s".repeat(4000)),
            ConversationTurn::user("hello"),
        ];
        let result = manager(500, 100).optimize_context_window(&turns, &[], &[], None);
        assert!(result.system_truncated);
        assert_eq!(result.turns.len(), 1);
        assert!(result.turns[0].is_system());
        assert_eq!(result.total_tokens, 400);
        assert_eq!(result.dropped_turns, 1);
    }

    #[test]
    fn test_memory_context_included_when_it_fits() {
        let turns = vec![ConversationTurn::system(SYSTEM_PROMPT), ConversationTurn::user("hi")];
        let result = manager(1000, 200).optimize_context_window(
            &turns,
            &[scored("Likes dinosaurs")],
            &[],
            Some("The child likes dinosaurs."),
        );
        assert_eq!(result.memory_context_text.as_deref(), Some("The child likes dinosaurs."));
        assert_eq!(result.dropped_memories, 0);

        let merged = result.merged_turns();
        assert_eq!(merged.len(), 2);
        assert!(merged[0].content.ends_with("\n\nThe child likes dinosaurs."));
    }

    #[test]
    fn test_memory_context_dropped_whole() {
        let memories = vec![scored("a"), scored("b"), scored("c")];
        let text = "m".repeat(2000);
        let result = manager(400, 100).optimize_context_window(
            &[ConversationTurn::user("hi")],
            &memories,
            &[],
            Some(&text),
        );
        assert_eq!(result.memory_context_text, None);
        assert_eq!(result.dropped_memories, 3);
        // turns still get the budget the memory would have used
        assert_eq!(result.turns.len(), 1);
    }

    #[test]
    fn test_memories_formatted_when_no_text_given() {
        let memories: Vec<ScoredMemory> = (0..7).map(|i| scored(&format!("fact {i}"))).collect();
        let result = manager(4000, 500).optimize_context_window(&[], &memories, &[], None);
        let text = result.memory_context_text.unwrap();
        assert!(text.contains("fact 0"));
        assert!(text.contains("fact 4"));
        assert!(!text.contains("fact 5"));
        assert_eq!(result.dropped_memories, 2);
    }

    #[test]
    fn test_memories_ignored_when_disabled() {
        let mgr = ContextWindowManager::new(ContextConfig {
            include_memories: false,
            ..ContextConfig::default()
        });
        let result = mgr.optimize_context_window(&[], &[scored("x")], &[], Some("memory"));
        assert_eq!(result.memory_context_text, None);
        assert_eq!(result.dropped_memories, 0);
        assert_eq!(result.total_tokens, 0);
    }

    #[test]
    fn test_tools_reserved_in_full() {
        let tool = ToolSchema::new("launch_game", "Start a game").with_parameter(
            ToolParameter::new("game_id", "Game", ParameterKind::String, true),
        );
        let tool_tokens = tool.estimate_tokens();
        let turns = long_conversation(10, 200);
        let result = manager(600, 100).optimize_context_window(&turns, &[], &[tool.clone()], None);
        assert_eq!(result.function_tokens, tool_tokens);
        assert!(result.total_tokens <= 500);
        assert!(result.total_tokens >= tool_tokens);
    }

    #[test]
    fn test_merged_turns_without_system_prompt() {
        let result = manager(1000, 100).optimize_context_window(
            &[ConversationTurn::user("hi")],
            &[],
            &[],
            Some("remembered"),
        );
        let merged = result.merged_turns();
        assert_eq!(merged[0], ConversationTurn::system("remembered"));
        assert_eq!(merged[1], ConversationTurn::user("hi"));
    }

    #[test]
    fn test_usage_stats() {
        let mgr = manager(1000, 200);
        let turns = vec![ConversationTurn::user("x".repeat(1200))];
        let memory = "m".repeat(400);
        let stats = mgr.get_token_usage_stats(&turns, Some(&memory), &[]);
        assert_eq!(stats.message_tokens, 300);
        assert_eq!(stats.memory_tokens, 100);
        assert_eq!(stats.function_tokens, 0);
        assert_eq!(stats.total_tokens, 400);
        assert_eq!(stats.available_tokens, 600);
        assert!((stats.utilization_percentage - 40.0).abs() < 1e-9);

        let empty = mgr.get_token_usage_stats(&[], None, &[]);
        assert_eq!(empty.total_tokens, 0);
        assert_eq!(empty.available_tokens, 1000);
        assert_eq!(empty.utilization_percentage, 0.0);
    }

    #[test]
    fn test_available_can_go_negative() {
        let mgr = manager(100, 10);
        let turns = vec![ConversationTurn::user("x".repeat(800))];
        let stats = mgr.get_token_usage_stats(&turns, None, &[]);
        assert_eq!(stats.available_tokens, -100);
        assert!(mgr.needs_optimization(&turns, None, &[]));
        assert!(!mgr.needs_optimization(&[ConversationTurn::user("short")], None, &[]));
    }
}
