//! Significance classification
//!
//! Decides after each completed exchange whether anything worth remembering
//! was said, and if so shapes it into a [`Memory`].

use super::model::{Memory, MemoryType, MAX_IMPORTANCE, MIN_IMPORTANCE};
use crate::rules::LexiconSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Longest slice of the child's message quoted in a memory
const MAX_QUOTE_CHARS: usize = 160;
/// Matched keywords listed in a memory
const MAX_LISTED_KEYWORDS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificanceConfig {
    /// Shorter user messages are never remembered
    pub min_message_length: usize,
    /// Shorter assistant replies are never remembered
    pub min_response_length: usize,
    pub significance_threshold: f64,
    /// Contributed by every exchange that clears the length gate
    pub length_weight: f64,
    pub emotional_weight: f64,
    pub personal_weight: f64,
    pub educational_weight: f64,
    pub question_weight: f64,
}

impl Default for SignificanceConfig {
    fn default() -> Self {
        Self {
            min_message_length: 10,
            min_response_length: 20,
            significance_threshold: 0.3,
            length_weight: 1.0,
            emotional_weight: 1.5,
            personal_weight: 1.3,
            educational_weight: 1.1,
            question_weight: 1.2,
        }
    }
}

impl SignificanceConfig {
    fn total_weight(&self) -> f64 {
        self.length_weight
            + self.emotional_weight
            + self.personal_weight
            + self.educational_weight
            + self.question_weight
    }
}

/// Which signals fired for an exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signals {
    pub emotional: bool,
    pub personal: bool,
    pub educational: bool,
    pub question: bool,
}

/// Score breakdown for an exchange that cleared the length gate
#[derive(Debug, Clone, PartialEq)]
pub struct SignificanceAssessment {
    /// Normalized to [0, 1]
    pub score: f64,
    pub signals: Signals,
    /// Distinct lexicon hits across the exchange, first seen first
    pub keywords: Vec<String>,
}

impl SignificanceAssessment {
    /// `round(score * 5)` clamped to the importance range
    pub fn importance(&self) -> u8 {
        ((self.score * MAX_IMPORTANCE as f64).round() as u8).clamp(MIN_IMPORTANCE, MAX_IMPORTANCE)
    }
}

/// Stateless apart from its configuration; safe to share across children
#[derive(Debug, Clone)]
pub struct SignificanceClassifier {
    config: SignificanceConfig,
    lexicons: Arc<LexiconSet>,
}

impl SignificanceClassifier {
    pub fn new(config: SignificanceConfig, lexicons: Arc<LexiconSet>) -> Self {
        Self { config, lexicons }
    }

    pub fn config(&self) -> &SignificanceConfig {
        &self.config
    }

    /// Score an exchange. `None` when either side is below its minimum length.
    pub fn assess(&self, user_message: &str, assistant_response: &str) -> Option<SignificanceAssessment> {
        let user_len = user_message.trim().chars().count();
        let response_len = assistant_response.trim().chars().count();
        if user_len < self.config.min_message_length || response_len < self.config.min_response_length {
            debug!(
                "Exchange below length gate (user {} < {} or response {} < {})",
                user_len, self.config.min_message_length, response_len, self.config.min_response_length
            );
            return None;
        }

        let combined = format!("{user_message}\n{assistant_response}");
        let lex = &self.lexicons;
        let mut keywords = Vec::new();
        let mut detect = |found: Vec<String>| {
            let hit = !found.is_empty();
            for word in found {
                if !keywords.contains(&word) {
                    keywords.push(word);
                }
            }
            hit
        };
        let signals = Signals {
            emotional: detect(lex.emotional.matches(&combined)),
            personal: detect(lex.personal.matches(&combined)),
            educational: detect(lex.educational.matches(&combined)),
            question: user_message.contains('?') || assistant_response.contains('?'),
        };

        let cfg = &self.config;
        let mut raw = cfg.length_weight;
        for (present, weight) in [
            (signals.emotional, cfg.emotional_weight),
            (signals.personal, cfg.personal_weight),
            (signals.educational, cfg.educational_weight),
            (signals.question, cfg.question_weight),
        ] {
            if present {
                raw += weight;
            }
        }
        let total = cfg.total_weight();
        let score = if total > 0.0 { (raw / total).clamp(0.0, 1.0) } else { 0.0 };

        Some(SignificanceAssessment {
            score,
            signals,
            keywords,
        })
    }

    /// Evaluate an exchange, timestamping any memory with the current time
    pub fn evaluate(&self, child_id: &str, user_message: &str, assistant_response: &str) -> Option<Memory> {
        self.evaluate_at(child_id, user_message, assistant_response, Utc::now())
    }

    /// Returns a memory only when the score reaches the threshold. Never
    /// fails: anything unclear is simply not remembered.
    pub fn evaluate_at(
        &self,
        child_id: &str,
        user_message: &str,
        assistant_response: &str,
        now: DateTime<Utc>,
    ) -> Option<Memory> {
        let assessment = self.assess(user_message, assistant_response)?;
        let significant = assessment.score >= self.config.significance_threshold;
        debug!(
            "Significance analysis - score: {:.3}, threshold: {:.3}, significant: {}",
            assessment.score, self.config.significance_threshold, significant
        );
        if !significant {
            return None;
        }

        let combined = format!("{user_message}\n{assistant_response}");
        let memory_type = self.classify_type(&combined);
        let text = synthesize_text(memory_type, user_message, &assessment.keywords);
        Some(Memory::new(
            child_id,
            now,
            text,
            memory_type,
            assessment.importance(),
            self.sentiment(user_message),
        ))
    }

    /// Dominant category of `text`, first match in priority order
    pub fn classify_type(&self, text: &str) -> MemoryType {
        let lex = &self.lexicons;
        [
            (MemoryType::Emotional, &lex.emotional),
            (MemoryType::Personal, &lex.personal),
            (MemoryType::Educational, &lex.educational),
            (MemoryType::Achievement, &lex.achievement),
            (MemoryType::Difficulty, &lex.difficulty),
            (MemoryType::Preference, &lex.preference),
        ]
        .into_iter()
        .find(|(_, lexicon)| lexicon.is_match(text))
        .map(|(memory_type, _)| memory_type)
        .unwrap_or(MemoryType::General)
    }

    /// Polarity in [-1, 1] from distinct positive and negative words
    pub fn sentiment(&self, text: &str) -> f64 {
        let positive = self.lexicons.positive.count_distinct(text) as f64;
        let negative = self.lexicons.negative.count_distinct(text) as f64;
        if positive + negative == 0.0 {
            0.0
        } else {
            (positive - negative) / (positive + negative)
        }
    }
}

fn synthesize_text(memory_type: MemoryType, user_message: &str, keywords: &[String]) -> String {
    let trimmed = user_message.trim();
    let quote = match trimmed.char_indices().nth(MAX_QUOTE_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    };
    let mut text = format!("{} moment: the child said \"{}\"", memory_type.label(), quote);
    if !keywords.is_empty() {
        let listed: Vec<&str> = keywords
            .iter()
            .take(MAX_LISTED_KEYWORDS)
            .map(String::as_str)
            .collect();
        text.push_str(&format!(" (about: {})", listed.join(", ")));
    }
    text
}
