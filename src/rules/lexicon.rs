//! Lexicon definitions and compiled matchers

use crate::memory::MemoryType;
use crate::{MemoryError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Word lists for every category the classifier and retriever recognize.
///
/// Entries may be single words or short phrases ("good job"); matching is
/// case-insensitive and bounded by word boundaries on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LexiconConfig {
    pub emotional: Vec<String>,
    pub personal: Vec<String>,
    pub educational: Vec<String>,
    pub preference: Vec<String>,
    pub achievement: Vec<String>,
    pub difficulty: Vec<String>,
    pub positive: Vec<String>,
    pub negative: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for LexiconConfig {
    fn default() -> Self {
        Self {
            emotional: words(&[
                "scared", "terrified", "worried", "anxious", "nervous", "sad", "crying", "upset",
                "angry", "mad", "excited", "happy", "proud", "amazed", "frustrated", "lonely",
                "bored", "surprised", "love", "hate", "feel", "feeling",
            ]),
            personal: words(&[
                "family", "mom", "dad", "mother", "father", "sister", "brother", "grandma",
                "grandpa", "friend", "best friend", "pet", "dog", "cat", "birthday", "school",
                "teacher", "home",
            ]),
            educational: words(&[
                "math", "reading", "science", "history", "english", "spelling", "homework",
                "lesson", "study", "learn", "learned", "learning", "understand", "grade", "test",
                "quiz", "practice",
            ]),
            preference: words(&[
                "like", "likes", "favorite", "favourite", "prefer", "enjoy", "dislike",
            ]),
            achievement: words(&[
                "proud", "accomplished", "achievement", "good job", "well done", "excellent",
                "correct", "won", "finished", "success", "great",
            ]),
            difficulty: words(&[
                "difficult", "hard", "struggle", "struggling", "don't understand", "confused",
                "stuck", "help", "can't",
            ]),
            positive: words(&[
                "great", "awesome", "amazing", "wonderful", "fantastic", "excellent", "love",
                "like", "enjoy", "fun", "happy", "excited", "proud",
            ]),
            negative: words(&[
                "hate", "dislike", "terrible", "awful", "horrible", "bad", "sad", "angry",
                "frustrated", "scared", "worried", "upset",
            ]),
        }
    }
}

/// A compiled word list. An empty list never matches.
#[derive(Debug, Clone)]
pub struct Lexicon {
    name: &'static str,
    pattern: Option<Regex>,
}

impl Lexicon {
    pub fn compile(name: &'static str, entries: &[String]) -> Result<Self> {
        let mut alternatives: Vec<String> = entries
            .iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        if alternatives.is_empty() {
            return Ok(Self { name, pattern: None });
        }
        // Longest first so "best friend" wins over "friend"
        alternatives.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        alternatives.dedup();

        let body = alternatives
            .iter()
            .map(|a| regex::escape(a))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"(?i)\b(?:{body})\b"))
            .map_err(|e| MemoryError::Config(format!("lexicon '{name}': {e}")))?;
        Ok(Self {
            name,
            pattern: Some(pattern),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|p| p.is_match(text))
    }

    /// Distinct matched entries, lowercased, in order of first appearance
    pub fn matches(&self, text: &str) -> Vec<String> {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };
        let mut found: Vec<String> = Vec::new();
        for m in pattern.find_iter(text) {
            let word = m.as_str().to_lowercase();
            if !found.contains(&word) {
                found.push(word);
            }
        }
        found
    }

    pub fn count_distinct(&self, text: &str) -> usize {
        self.matches(text).len()
    }
}

/// All lexicons compiled once and shared by the classifier and retriever
#[derive(Debug, Clone)]
pub struct LexiconSet {
    pub emotional: Lexicon,
    pub personal: Lexicon,
    pub educational: Lexicon,
    pub preference: Lexicon,
    pub achievement: Lexicon,
    pub difficulty: Lexicon,
    pub positive: Lexicon,
    pub negative: Lexicon,
}

impl LexiconSet {
    pub fn compile(config: &LexiconConfig) -> Result<Self> {
        Ok(Self {
            emotional: Lexicon::compile("emotional", &config.emotional)?,
            personal: Lexicon::compile("personal", &config.personal)?,
            educational: Lexicon::compile("educational", &config.educational)?,
            preference: Lexicon::compile("preference", &config.preference)?,
            achievement: Lexicon::compile("achievement", &config.achievement)?,
            difficulty: Lexicon::compile("difficulty", &config.difficulty)?,
            positive: Lexicon::compile("positive", &config.positive)?,
            negative: Lexicon::compile("negative", &config.negative)?,
        })
    }

    /// The lexicon whose presence in a conversation signals interest in a
    /// memory of the given type. `General` has none.
    pub fn for_type(&self, memory_type: MemoryType) -> Option<&Lexicon> {
        match memory_type {
            MemoryType::General => None,
            MemoryType::Preference => Some(&self.preference),
            MemoryType::Achievement => Some(&self.achievement),
            MemoryType::Difficulty => Some(&self.difficulty),
            MemoryType::Emotional => Some(&self.emotional),
            MemoryType::Personal => Some(&self.personal),
            MemoryType::Educational => Some(&self.educational),
        }
    }
}

impl Default for LexiconSet {
    fn default() -> Self {
        Self::compile(&LexiconConfig::default()).expect("built-in lexicons compile")
    }
}
