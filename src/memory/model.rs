//! Memory records and their retrieval-time wrapper

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lowest and highest allowed importance
pub const MIN_IMPORTANCE: u8 = 1;
pub const MAX_IMPORTANCE: u8 = 5;

/// Category of a memory, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryType {
    /// General conversation or interaction
    General,
    /// Likes, dislikes, preferences
    Preference,
    /// Accomplishments, successes, milestones
    Achievement,
    /// Areas where the child struggles or needs help
    Difficulty,
    /// Emotional states, feelings, reactions
    Emotional,
    /// Family, friends, personal details
    Personal,
    /// Learning progress, subject mastery
    Educational,
}

impl MemoryType {
    pub const ALL: [MemoryType; 7] = [
        MemoryType::General,
        MemoryType::Preference,
        MemoryType::Achievement,
        MemoryType::Difficulty,
        MemoryType::Emotional,
        MemoryType::Personal,
        MemoryType::Educational,
    ];

    /// Human-friendly label ("Emotional")
    pub fn label(&self) -> &'static str {
        match self {
            MemoryType::General => "General",
            MemoryType::Preference => "Preference",
            MemoryType::Achievement => "Achievement",
            MemoryType::Difficulty => "Difficulty",
            MemoryType::Emotional => "Emotional",
            MemoryType::Personal => "Personal",
            MemoryType::Educational => "Educational",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MemoryType::General => "GENERAL",
            MemoryType::Preference => "PREFERENCE",
            MemoryType::Achievement => "ACHIEVEMENT",
            MemoryType::Difficulty => "DIFFICULTY",
            MemoryType::Emotional => "EMOTIONAL",
            MemoryType::Personal => "PERSONAL",
            MemoryType::Educational => "EDUCATIONAL",
        };
        write!(f, "{name}")
    }
}

/// A persisted fact or observation about a child.
///
/// `id` is `None` until the store assigns one on insert; records read back
/// from a store always carry an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Option<i64>,
    pub child_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub memory_type: MemoryType,
    /// 1..=5, higher survives compaction preferentially
    pub importance: u8,
    /// -1.0..=1.0
    pub sentiment: f64,
}

impl Memory {
    /// Create an unsaved memory, clamping importance and sentiment into range
    pub fn new(
        child_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        text: impl Into<String>,
        memory_type: MemoryType,
        importance: u8,
        sentiment: f64,
    ) -> Self {
        Self {
            id: None,
            child_id: child_id.into(),
            timestamp,
            text: text.into(),
            memory_type,
            importance,
            sentiment,
        }
        .clamped()
    }

    /// Importance into 1..=5, sentiment into [-1, 1] (0 when not finite)
    pub(crate) fn clamped(mut self) -> Self {
        self.importance = self.importance.clamp(MIN_IMPORTANCE, MAX_IMPORTANCE);
        self.sentiment = if self.sentiment.is_finite() {
            self.sentiment.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Importance rendered as stars ("★★★")
    pub fn stars(&self) -> String {
        "★".repeat(self.importance as usize)
    }

    /// Age in fractional days relative to `now`; negative for future timestamps
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        (now - self.timestamp).num_milliseconds() as f64 / MILLIS_PER_DAY
    }
}

pub(crate) const MILLIS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// A memory paired with its relevance to the live conversation.
/// Recomputed on every retrieval, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub relevance_score: f64,
    pub keyword_matches: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_memory_types_cover_main_categories() {
        let names: BTreeSet<String> = MemoryType::ALL.iter().map(|t| t.to_string()).collect();
        let expected: BTreeSet<String> = [
            "GENERAL",
            "PREFERENCE",
            "ACHIEVEMENT",
            "DIFFICULTY",
            "EMOTIONAL",
            "PERSONAL",
            "EDUCATIONAL",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_new_clamps_ranges() {
        let now = Utc::now();
        let m = Memory::new("c1", now, "x", MemoryType::General, 9, 3.5);
        assert_eq!(m.importance, 5);
        assert_eq!(m.sentiment, 1.0);
        let m = Memory::new("c1", now, "x", MemoryType::General, 0, f64::NAN);
        assert_eq!(m.importance, 1);
        assert_eq!(m.sentiment, 0.0);
        assert!(m.id.is_none());
    }

    #[test]
    fn test_age_days() {
        let now = Utc::now();
        let m = Memory::new("c1", now - Duration::hours(36), "x", MemoryType::General, 3, 0.0);
        assert!((m.age_days(now) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_serde_type_names() {
        let json = serde_json::to_string(&MemoryType::Educational).unwrap();
        assert_eq!(json, "\"EDUCATIONAL\"");
    }
}
