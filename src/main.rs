//! Merlin memory CLI
//!
//! Inspect and maintain a child's memory store from the command line.

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use merlin_memory::memory::{format_memories_for_prompt, memory_statistics};
use merlin_memory::{
    ChatCompletionsModel, ContextWindowManager, ConversationTurn, JsonFileStore, MemoryConfig,
    MemoryError, MemoryPipeline, SummaryModel, SummaryRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Merlin memory - what the tutor remembers about each child
#[derive(Parser, Debug)]
#[command(name = "merlin-memory")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the memory store (JSON)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Path to the config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify one exchange and store it if significant
    Remember {
        #[arg(long)]
        child: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        assistant: String,
    },
    /// Show the memories most relevant to some conversation text
    Recall {
        #[arg(long)]
        child: String,
        #[arg(trailing_var_arg = true, required = true)]
        context: Vec<String>,
    },
    /// Summarize old memories and enforce store limits
    Maintain {
        /// Child to maintain (repeatable)
        #[arg(long, required = true)]
        child: Vec<String>,
        /// Children processed at once
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Print store and summarization statistics for a child
    Stats {
        #[arg(long)]
        child: String,
    },
    /// Report token usage and trimming for a conversation
    Budget {
        /// JSON array of turns: [{"role": "user", "content": "..."}]
        #[arg(long)]
        turns: PathBuf,
        /// Memory context text to include
        #[arg(long)]
        memory: Option<String>,
    },
}

/// Stand-in when no API key is configured; summarization batches fail and
/// the store is left as is
struct OfflineModel;

#[async_trait]
impl SummaryModel for OfflineModel {
    async fn summarize(&self, _request: &SummaryRequest) -> merlin_memory::Result<String> {
        Err(MemoryError::Llm("no language model configured".to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = cli.config.clone().or_else(MemoryConfig::default_path);
    let config = match &config_path {
        Some(path) => MemoryConfig::load(path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => MemoryConfig::default(),
    };

    match cli.command {
        Command::Budget { turns, memory } => run_budget(&config, &turns, memory.as_deref()).await,
        command => run_with_store(cli.store, config, command).await,
    }
}

async fn run_with_store(
    store_path: Option<PathBuf>,
    config: MemoryConfig,
    command: Command,
) -> anyhow::Result<()> {
    let store_path = match store_path {
        Some(path) => path,
        None => dirs::home_dir()
            .context("cannot determine home directory; pass --store")?
            .join(".merlin-memory")
            .join("memories.json"),
    };
    let store = Arc::new(JsonFileStore::open(&store_path).await?);
    info!("Using memory store at {}", store_path.display());

    let model: Arc<dyn SummaryModel> = match ChatCompletionsModel::from_config(&config.llm) {
        Ok(model) => Arc::new(model),
        Err(e) => {
            if matches!(command, Command::Maintain { .. }) {
                warn!("{}; summarization will be skipped", e);
            }
            Arc::new(OfflineModel)
        }
    };
    let pipeline = MemoryPipeline::new(config, store.clone(), model)?;

    match command {
        Command::Remember {
            child,
            user,
            assistant,
        } => match pipeline.on_turn_completed(&child, &user, &assistant).await? {
            Some(id) => println!("Stored memory {id}"),
            None => println!("Nothing worth remembering"),
        },
        Command::Recall { child, context } => {
            let memories = pipeline.retriever().retrieve(&child, &context.join(" ")).await?;
            if memories.is_empty() {
                println!("No relevant memories");
            } else {
                println!("{}", format_memories_for_prompt(&memories, chrono::Utc::now()));
                for m in &memories {
                    println!(
                        "  score {:.3}  matches [{}]",
                        m.relevance_score,
                        m.keyword_matches.iter().cloned().collect::<Vec<_>>().join(", ")
                    );
                }
            }
        }
        Command::Maintain { child, concurrency } => {
            for (child, report) in pipeline.run_maintenance_for(&child, concurrency).await {
                match report {
                    Ok(report) => {
                        let summarized = report.summarization.as_ref().map_or(0, |s| s.memory_count);
                        println!(
                            "{child}: summarized {summarized}, pruned {} old and {} low-importance, {} left",
                            report.deleted_old, report.deleted_low_importance, report.memory_count
                        );
                    }
                    Err(e) => println!("{child}: failed: {e}"),
                }
            }
        }
        Command::Stats { child } => {
            let stats = memory_statistics(&*store, &child).await?;
            let summaries = pipeline.summarizer().summarization_stats(&child).await?;
            println!("Memories: {}", stats.total_count);
            if let Some(ts) = stats.last_memory_timestamp {
                println!("Last memory: {}", ts.to_rfc3339());
            }
            let mut types: Vec<_> = stats.type_distribution.iter().filter(|(_, n)| **n > 0).collect();
            types.sort();
            for (memory_type, count) in types {
                println!("  {memory_type}: {count}");
            }
            for (level, count) in &stats.importance_distribution {
                println!("  importance >= {level}: {count}");
            }
            println!(
                "Summaries: {} covering {} memories (~{} tokens saved)",
                summaries.summaries_created, summaries.total_memories_summarized, summaries.tokens_saved
            );
        }
        Command::Budget { turns, memory } => {
            let config = pipeline.config().clone();
            return run_budget(&config, &turns, memory.as_deref()).await;
        }
    }

    Ok(())
}

async fn run_budget(config: &MemoryConfig, turns_path: &Path, memory: Option<&str>) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(turns_path)
        .await
        .with_context(|| format!("failed to read {}", turns_path.display()))?;
    let turns: Vec<ConversationTurn> = serde_json::from_str(&content)?;

    let manager = ContextWindowManager::new(config.context.clone());
    let stats = manager.get_token_usage_stats(&turns, memory, &[]);
    println!(
        "Tokens: {} messages + {} memory + {} tools = {} of {} ({:.1}%), {} available",
        stats.message_tokens,
        stats.memory_tokens,
        stats.function_tokens,
        stats.total_tokens,
        config.context.max_tokens,
        stats.utilization_percentage,
        stats.available_tokens
    );

    if manager.needs_optimization(&turns, memory, &[]) {
        let result = manager.optimize_context_window(&turns, &[], &[], memory);
        println!(
            "Over budget: kept {} turns ({} tokens), dropped {} turns and {} memories",
            result.turns.len(),
            result.total_tokens,
            result.dropped_turns,
            result.dropped_memories
        );
    } else {
        println!("Fits within budget");
    }
    Ok(())
}
