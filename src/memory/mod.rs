//! Long-term memory about each child
//!
//! Records, the store abstraction and its implementations, and the three
//! algorithms that work on them: significance classification, relevance
//! retrieval and summarization.

mod file_store;
mod model;
mod retriever;
mod significance;
mod store;
mod summarizer;

pub use file_store::JsonFileStore;
pub use model::{Memory, MemoryType, ScoredMemory, MAX_IMPORTANCE, MIN_IMPORTANCE};
pub use retriever::{
    extract_keywords, format_memories_for_prompt, recency_score, MemoryRetriever, RetrievalConfig,
};
pub use significance::{SignificanceAssessment, SignificanceClassifier, SignificanceConfig, Signals};
pub use store::{memory_statistics, InMemoryStore, MemoryStatistics, MemoryStore, StoreSnapshot};
pub use summarizer::{
    is_summary, BatchSummary, MemorySummarizer, SummarizationConfig, SummarizationResult,
    SummarizationStats, SUMMARY_PREFIX,
};
