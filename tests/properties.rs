//! Property tests for classification, retrieval scoring and context fitting

use chrono::{Duration, TimeZone, Utc};
use merlin_memory::context::{ParameterKind, ToolParameter};
use merlin_memory::memory::{extract_keywords, memory_statistics, recency_score};
use merlin_memory::{
    ContextConfig, ContextWindowManager, ConversationContextManager, ConversationTurn,
    InMemoryStore, LexiconSet, Memory, MemoryRetriever, MemoryStore, MemoryType,
    RetrievalConfig, ScoredMemory, SignificanceClassifier, SignificanceConfig, ToolSchema,
    TurnRole,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn classifier() -> SignificanceClassifier {
    SignificanceClassifier::new(SignificanceConfig::default(), Arc::new(LexiconSet::default()))
}

fn memory_type() -> impl Strategy<Value = MemoryType> {
    prop::sample::select(MemoryType::ALL.to_vec())
}

fn scored_memory() -> impl Strategy<Value = ScoredMemory> {
    (memory_type(), 1u8..=5, 0i64..90, "[a-z ]{1,300}").prop_map(|(kind, importance, days_ago, text)| {
        ScoredMemory {
            memory: Memory::new("c1", Utc::now() - Duration::days(days_ago), text, kind, importance, 0.0),
            relevance_score: 0.5,
            keyword_matches: BTreeSet::new(),
        }
    })
}

fn tool() -> impl Strategy<Value = ToolSchema> {
    ("[a-z_]{1,16}", "[a-z ]{0,80}", prop::collection::vec(("[a-z_]{1,10}", "[a-z ]{0,40}", any::<bool>()), 0..3))
        .prop_map(|(name, description, params)| {
            params.into_iter().fold(ToolSchema::new(name, description), |schema, (p, d, required)| {
                schema.with_parameter(ToolParameter::new(p, d, ParameterKind::String, required))
            })
        })
}

fn turn() -> impl Strategy<Value = ConversationTurn> {
    (any::<bool>(), "[a-z ]{0,400}").prop_map(|(user, content)| {
        if user {
            ConversationTurn::user(content)
        } else {
            ConversationTurn::assistant(content)
        }
    })
}

proptest! {
    #[test]
    fn short_user_messages_are_never_remembered(
        user in "[a-z ?]{0,9}",
        assistant in "[a-z ?]{0,80}",
    ) {
        prop_assert!(classifier().evaluate("c1", &user, &assistant).is_none());
    }

    #[test]
    fn added_signals_never_lower_the_score(
        user in "[a-z]{3,8}( [a-z]{3,8}){3,6}",
        assistant in "[a-z]{3,8}( [a-z]{3,8}){5,8}",
        extra in prop::sample::select(vec![" and I feel scared", " with my mom", " for my math homework", " really?"]),
    ) {
        let c = classifier();
        let base = c.assess(&user, &assistant).unwrap();
        let richer = c.assess(&format!("{user}{extra}"), &assistant).unwrap();
        prop_assert!(richer.score >= base.score);
        prop_assert!((0.0..=1.0).contains(&richer.score));
        prop_assert!((1..=5).contains(&richer.importance()));
    }

    #[test]
    fn higher_importance_scores_at_least_as_high(
        low in 1u8..=5,
        bump in 0u8..=4,
        days_ago in 0i64..400,
        kind in memory_type(),
        text in "[a-z]{3,8}( [a-z]{3,8}){0,6}",
        context in "[a-z]{3,8}( [a-z]{3,8}){0,6}",
    ) {
        let high = (low + bump).min(5);
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let retriever = MemoryRetriever::new(
            Arc::new(InMemoryStore::new()),
            RetrievalConfig::default(),
            Arc::new(LexiconSet::default()),
        );
        let keywords = extract_keywords(&context);
        let at = now - Duration::days(days_ago);
        let a = retriever.score_memory(Memory::new("c1", at, text.clone(), kind, low, 0.0), &keywords, &context, now);
        let b = retriever.score_memory(Memory::new("c1", at, text, kind, high, 0.0), &keywords, &context, now);
        prop_assert!(b.relevance_score >= a.relevance_score);
        prop_assert!((0.0..=1.0).contains(&b.relevance_score));
    }

    #[test]
    fn recency_never_increases_with_age(a in 0.0f64..1000.0, b in 0.0f64..1000.0) {
        let (younger, older) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(recency_score(younger) >= recency_score(older));
    }

    #[test]
    fn system_prompt_stays_pinned(
        max_size in 1usize..20,
        messages in prop::collection::vec(any::<bool>(), 0..60),
    ) {
        let mut window = ConversationContextManager::new(max_size);
        window.initialize_with_system_prompt("You are Merlin.");
        for (i, user) in messages.iter().enumerate() {
            if *user {
                window.add_user_message(format!("u{i}"));
            } else {
                window.add_assistant_message(format!("a{i}"));
            }
        }
        let history = window.get_formatted_history();
        prop_assert_eq!(history.len(), max_size.min(messages.len() + 1));
        prop_assert_eq!(history[0].role, TurnRole::System);
        prop_assert!(history[1..].iter().all(|t| !t.is_system()));
    }

    #[test]
    fn optimized_context_fits_the_budget(
        max_tokens in 50usize..3000,
        reserved_share in 0usize..50,
        system in prop::option::of("[a-z ]{1,2000}"),
        chat in prop::collection::vec(turn(), 0..30),
        memory in prop::option::of("[a-z ]{1,800}"),
        scored in prop::collection::vec(scored_memory(), 0..8),
        tools in prop::collection::vec(tool(), 0..3),
        recent_first in any::<bool>(),
    ) {
        let reserved = max_tokens * reserved_share / 100;
        let budget = max_tokens - reserved;
        let manager = ContextWindowManager::new(ContextConfig {
            max_tokens,
            reserved_tokens_for_response: reserved,
            prioritize_recent_messages: recent_first,
            ..ContextConfig::default()
        });
        let max_memories = manager.config().max_memories;
        let mut turns = Vec::new();
        if let Some(system) = &system {
            turns.push(ConversationTurn::system(system.clone()));
        }
        turns.extend(chat.iter().cloned());

        let result = manager.optimize_context_window(&turns, &scored, &tools, memory.as_deref());
        let tool_tokens: usize = tools.iter().map(|t| t.estimate_tokens()).sum();
        prop_assert_eq!(result.function_tokens, tool_tokens);
        if tool_tokens <= budget {
            prop_assert!(result.total_tokens <= budget);
        } else {
            // Tools are never cut; nothing else gets any space
            prop_assert_eq!(result.total_tokens, tool_tokens);
            prop_assert!(result.memory_context_text.is_none());
        }
        prop_assert_eq!(result.turns.len() + result.dropped_turns, turns.len());
        if system.is_some() {
            prop_assert!(result.turns[0].is_system());
        }

        match (&memory, &result.memory_context_text) {
            (Some(given), Some(included)) => prop_assert_eq!(given, included),
            (None, Some(_)) => {
                prop_assert_eq!(result.dropped_memories, scored.len().saturating_sub(max_memories));
            }
            (_, None) => prop_assert!(result.dropped_memories <= scored.len().max(1)),
        }

        // Kept chat turns are a subsequence of the input, in order
        let mut source = chat.iter();
        for kept in result.turns.iter().filter(|t| !t.is_system()) {
            prop_assert!(source.any(|t| t == kept));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn statistics_account_for_every_memory(
        entries in prop::collection::vec((memory_type(), 1u8..=5, 0i64..200), 0..40),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let store = InMemoryStore::new();
            for (kind, importance, days_ago) in &entries {
                let at = Utc::now() - Duration::days(*days_ago);
                store.insert(Memory::new("c1", at, "note", *kind, *importance, 0.0)).await.unwrap();
            }
            store.insert(Memory::new("c2", Utc::now(), "other", MemoryType::General, 3, 0.0)).await.unwrap();

            let stats = memory_statistics(&store, "c1").await.unwrap();
            assert_eq!(stats.total_count, entries.len());
            assert_eq!(stats.type_distribution.values().sum::<usize>(), entries.len());
            assert_eq!(stats.importance_distribution[&1], entries.len());
            for level in 1u8..5 {
                assert!(stats.importance_distribution[&level] >= stats.importance_distribution[&(level + 1)]);
            }
        });
    }
}
