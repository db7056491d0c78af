//! Rolling conversation window
//!
//! Keeps the most recent turns of the live chat up to a fixed capacity.
//! A system prompt, once set, stays pinned at the head and is never evicted.

use super::tokens::estimate_tokens;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default window capacity, system prompt included
pub const DEFAULT_WINDOW_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
}

impl TurnRole {
    pub fn name(&self) -> &'static str {
        match self {
            TurnRole::System => "system",
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::Tool => "tool",
        }
    }
}

/// One message of the live conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ConversationTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == TurnRole::System
    }

    pub fn estimate_tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// Fixed-capacity FIFO of turns with a pinned system head
#[derive(Debug, Clone)]
pub struct ConversationContextManager {
    max_size: usize,
    system_prompt: Option<ConversationTurn>,
    /// Non-system turns, oldest first
    history: VecDeque<ConversationTurn>,
}

impl ConversationContextManager {
    /// `max_size` counts the system prompt; a zero capacity is raised to one
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            system_prompt: None,
            history: VecDeque::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Clear everything and pin `content` as the system prompt.
    /// A blank prompt leaves the window empty.
    pub fn initialize_with_system_prompt(&mut self, content: &str) {
        self.clear_history();
        if !content.trim().is_empty() {
            self.system_prompt = Some(ConversationTurn::system(content));
        }
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) {
        self.push(ConversationTurn::user(content));
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) {
        self.push(ConversationTurn::assistant(content));
    }

    pub fn add_tool_message(&mut self, tool_call_id: impl Into<String>, content: impl Into<String>) {
        self.push(ConversationTurn::tool(tool_call_id, content));
    }

    /// Append a turn, evicting the oldest non-system turns beyond capacity
    pub fn push(&mut self, turn: ConversationTurn) {
        self.history.push_back(turn);
        let capacity = self.non_system_capacity();
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    fn non_system_capacity(&self) -> usize {
        if self.system_prompt.is_some() {
            self.max_size - 1
        } else {
            self.max_size
        }
    }

    /// Drop every turn, the system prompt included
    pub fn clear_history(&mut self) {
        self.system_prompt = None;
        self.history.clear();
    }

    /// Ordered turns, system prompt first when set
    pub fn get_formatted_history(&self) -> Vec<ConversationTurn> {
        self.system_prompt
            .iter()
            .chain(self.history.iter())
            .cloned()
            .collect()
    }

    pub fn system_prompt(&self) -> Option<&ConversationTurn> {
        self.system_prompt.as_ref()
    }

    /// Most recent user message, if any
    pub fn last_user_message(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)
            .map(|t| t.content.as_str())
    }

    pub fn len(&self) -> usize {
        self.history.len() + usize::from(self.system_prompt.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConversationContextManager {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
