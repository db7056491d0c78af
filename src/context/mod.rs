//! Conversation window and token budgeting
//!
//! Tracks the live chat and assembles each model request so it fits the
//! context window alongside tool schemas and recalled memories.

mod conversation;
mod tokens;
mod tools;
mod window;

pub use conversation::{ConversationContextManager, ConversationTurn, TurnRole, DEFAULT_WINDOW_SIZE};
pub use tokens::{estimate_tokens, truncate_to_tokens, APPROX_CHARS_PER_TOKEN};
pub use tools::{ParameterKind, ToolParameter, ToolSchema};
pub use window::{ContextConfig, ContextWindowManager, ContextWindowResult, TokenUsageStats};
