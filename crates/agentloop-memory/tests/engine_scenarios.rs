mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use agentloop_memory::{MemoryError, Metadata, Role, SearchSource, TimeRange};
use chrono::Utc;
use common::*;
use serde_json::json;
use tempfile::TempDir;

fn metadata(value: serde_json::Value) -> Metadata {
    value.as_object().cloned().unwrap()
}

// ===== Sessions =====

#[test]
fn test_new_session_requires_user_id() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));

    let err = engine.load_session("s1", None).unwrap_err();
    assert!(matches!(err, MemoryError::InvalidArgument(_)));
    assert!(engine.active_session().is_none());

    assert_eq!(engine.load_session("s1", Some("u1")).unwrap(), "s1");
    // Existing sessions resume without an owner.
    assert_eq!(engine.load_session("s1", None).unwrap(), "s1");
    assert_eq!(engine.get_session("s1").unwrap().unwrap().user_id, "u1");
}

#[test]
fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.db");
    {
        let engine = open_engine(&path, Arc::new(BrokenEmbedder));
        engine.load_session("s1", Some("u1")).unwrap();
        engine.add_memory("remember the blue door", Role::User, None).unwrap();
        engine.close();
    }

    let engine = open_engine(&path, Arc::new(BrokenEmbedder));
    engine.load_session("s1", None).unwrap();
    let history = engine.get_session_messages(100).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "remember the blue door");
}

// ===== Messages =====

#[test]
fn test_chunk_index_advances_after_silence() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir.path().join("memory.db"));
    config.chunk_gap = Duration::from_millis(50);
    let engine = open_with(config, Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();

    let hi = engine.add_memory("hi", Role::User, None).unwrap();
    let hello = engine.add_memory("hello", Role::Assistant, None).unwrap();
    assert_eq!(hi.chunk_index, 0);
    assert_eq!(hello.chunk_index, 0);

    thread::sleep(Duration::from_millis(150));
    let next = engine.add_memory("next", Role::User, None).unwrap();
    assert_eq!(next.chunk_index, 1);

    let chunks: Vec<i64> = engine
        .get_session_messages(1000)
        .unwrap()
        .iter()
        .map(|m| m.chunk_index)
        .collect();
    assert!(chunks.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_round_trip_preserves_content_role_and_tokens() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();

    let meta = metadata(json!({"agent_id": "planner", "turn": 3}));
    engine
        .add_memory("book a table for two at eight", Role::User, Some(meta.clone()))
        .unwrap();
    engine.add_memory("Done, table booked.", Role::Assistant, None).unwrap();
    engine.add_memory("calendar tool returned ok", Role::Tool, None).unwrap();

    let history = engine.get_session_messages(1000).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].content, "book a table for two at eight");
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].tokens, 7);
    assert_eq!(history[0].metadata, meta);
    assert_eq!(history[1].role, Role::Assistant);
    assert_eq!(history[2].role, Role::Tool);
    assert!(history.windows(2).all(|w| w[0].message_id < w[1].message_id));
}

#[test]
fn test_short_term_budget_keeps_newest_that_fit() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();

    engine.add_memory(&words(100), Role::User, None).unwrap();
    engine.add_memory(&words(200), Role::Assistant, None).unwrap();
    let second_last = engine.add_memory(&words(200), Role::User, None).unwrap();
    let last = engine.add_memory(&words(200), Role::Assistant, None).unwrap();

    // usable = 800, short-term ceiling = 560: the third-newest would reach 600.
    let context = engine.build_context("nothing matches this", Some(1000)).unwrap();
    let ids: Vec<i64> = context.short_term.iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![second_last.message_id, last.message_id]);
    assert!(context.total_tokens() <= 800);
}

// ===== Retrieval =====

#[test]
fn test_keyword_results_when_provider_always_fails() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    engine.add_memory("the quarterly report is due friday", Role::User, None).unwrap();
    engine.add_memory("garden tomatoes need water", Role::User, None).unwrap();

    let results = engine.search_memory("report", None, None, None);
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("quarterly report"));

    let ranked = engine.search_memory_ranked("report", None, None, None).unwrap();
    assert_eq!(ranked[0].source, SearchSource::Keyword);
}

#[test]
fn test_hybrid_ranking_once_embeddings_land() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(HashingEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    for text in [
        "movie night with friends",
        "pizza recipe",
        "garden tomatoes need water",
        "train leaves at noon",
        "weather sunny today",
        "quarterly report is due friday",
        "movie review",
    ] {
        engine.add_memory(text, Role::User, None).unwrap();
    }
    assert!(engine.flush_embeddings(Duration::from_secs(5)));
    assert_eq!(engine.stats().unwrap().embedded_messages, 7);

    let ranked = engine.search_memory_ranked("movie", None, None, None).unwrap();
    assert!(ranked.len() >= 2);
    for top in &ranked[..2] {
        assert!(top.message.content.contains("movie"));
        assert_eq!(top.source, SearchSource::Hybrid);
    }
    assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn test_search_token_limit_is_greedy() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    engine.add_memory("alpha beta gamma delta epsilon", Role::User, None).unwrap();
    engine.add_memory("alpha", Role::User, None).unwrap();

    let all = engine.search_memory("alpha", None, None, None);
    assert_eq!(all.len(), 2);
    let total: usize = all.iter().map(|m| m.tokens).sum();
    assert_eq!(total, 6);

    let limited = engine.search_memory("alpha", None, None, Some(5));
    let limited_total: usize = limited.iter().map(|m| m.tokens).sum();
    assert!(limited_total <= 5);
    assert!(!limited.is_empty());
}

#[test]
fn test_metadata_filter_matches_typed_values() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    engine
        .add_memory("deploy the service", Role::User, Some(metadata(json!({"agent_id": "ops", "priority": 1}))))
        .unwrap();
    engine
        .add_memory("deploy the docs", Role::User, Some(metadata(json!({"agent_id": "ops-bot", "priority": "1"}))))
        .unwrap();

    let ops = engine.search_memory("deploy", Some(metadata(json!({"agent_id": "ops"}))), None, None);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].content, "deploy the service");

    let numeric = engine.search_memory("deploy", Some(metadata(json!({"priority": 1}))), None, None);
    assert_eq!(numeric.len(), 1);
    assert_eq!(numeric[0].content, "deploy the service");
}

#[test]
fn test_time_range_filter() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    engine.add_memory("invoice number 42", Role::User, None).unwrap();

    let now = Utc::now();
    let around = TimeRange::new(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1));
    let last_week = TimeRange::new(now - chrono::Duration::days(7), now - chrono::Duration::days(6));
    assert_eq!(engine.search_memory("invoice", None, Some(around), None).len(), 1);
    assert!(engine.search_memory("invoice", None, Some(last_week), None).is_empty());
}

#[test]
fn test_search_scoped_to_active_session() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    engine.add_memory("shared keyword from s1", Role::User, None).unwrap();
    engine.load_session("s2", Some("u1")).unwrap();
    engine.add_memory("shared keyword from s2", Role::User, None).unwrap();

    let results = engine.search_memory("keyword", None, None, None);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].session_id, "s2");
}

#[test]
fn test_build_context_stays_within_budget() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(HashingEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    for i in 0..30 {
        let text = format!("turn {} about travel plans {}", i, words(i % 7 * 10));
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        engine.add_memory(&text, role, None).unwrap();
    }
    assert!(engine.flush_embeddings(Duration::from_secs(5)));

    for max_tokens in [0usize, 10, 64, 250, 1000, 4096] {
        let context = engine.build_context("travel plans", Some(max_tokens)).unwrap();
        assert!(context.total_tokens() as f64 <= max_tokens as f64 * 0.8);
        let short: HashSet<i64> = context.short_term.iter().map(|m| m.message_id).collect();
        assert!(context.long_term.iter().all(|m| !short.contains(&m.message_id)));
    }
}

// ===== Maintenance =====

#[test]
fn test_clear_without_filters_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    engine.add_memory("keep me", Role::User, None).unwrap();

    let before = engine.stats().unwrap();
    assert!(!engine.clear_memory(None, None, None));
    let after = engine.stats().unwrap();
    assert_eq!(before.total_sessions, after.total_sessions);
    assert_eq!(before.total_messages, after.total_messages);
    assert_eq!(engine.active_session().as_deref(), Some("s1"));
}

#[test]
fn test_clear_all_empties_everything() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    engine.add_memory("searchable text", Role::User, None).unwrap();

    assert!(engine.clear_all());
    let stats = engine.stats().unwrap();
    assert_eq!(stats.total_sessions, 0);
    assert_eq!(stats.total_messages, 0);
    assert!(engine.search_memory("searchable", None, None, None).is_empty());
    assert!(matches!(
        engine.add_memory("after clear", Role::User, None),
        Err(MemoryError::InvalidState(_))
    ));
}

#[test]
fn test_clear_by_agent_keeps_sessions() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    engine
        .add_memory("from the planner", Role::User, Some(metadata(json!({"agent_id": "planner"}))))
        .unwrap();
    engine.add_memory("from nobody in particular", Role::User, None).unwrap();

    assert!(engine.clear_memory(None, Some("planner"), None));
    let history = engine.get_session_messages(1000).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "from nobody in particular");
    assert!(engine.search_memory("planner", None, None, None).is_empty());
    assert_eq!(engine.active_session().as_deref(), Some("s1"));
}

#[test]
fn test_clear_by_user_removes_their_sessions() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("a", Some("alice")).unwrap();
    engine.add_memory("alice one", Role::User, None).unwrap();
    engine.load_session("b", Some("bob")).unwrap();
    engine.add_memory("bob one", Role::User, None).unwrap();

    assert!(engine.clear_memory(None, None, Some("alice")));
    assert!(engine.get_session("a").unwrap().is_none());
    assert!(engine.get_session("b").unwrap().is_some());
    assert_eq!(engine.active_session().as_deref(), Some("b"));
    assert_eq!(engine.stats().unwrap().total_messages, 1);
}

#[test]
fn test_backfill_embeds_what_the_worker_missed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.db");
    {
        let engine = open_engine(&path, Arc::new(BrokenEmbedder));
        engine.load_session("s1", Some("u1")).unwrap();
        engine.add_memory("you are a helpful agent", Role::System, None).unwrap();
        for i in 0..5 {
            engine.add_memory(&format!("question {}", i), Role::User, None).unwrap();
            engine.add_memory(&format!("answer {}", i), Role::Assistant, None).unwrap();
        }
        assert!(engine.flush_embeddings(Duration::from_secs(5)));
        assert_eq!(engine.stats().unwrap().embedded_messages, 0);
        engine.close();
    }

    let engine = open_engine(&path, Arc::new(HashingEmbedder));
    let report = engine.backfill_embeddings(3, 0).unwrap();
    assert_eq!(report.scanned, 10);
    assert_eq!(report.embedded, 10);
    assert_eq!(report.failed_batches, 0);
    assert_eq!(engine.stats().unwrap().embedded_messages, 10);

    let again = engine.backfill_embeddings(3, 0).unwrap();
    assert_eq!(again.scanned, 0);
    assert_eq!(again.last_message_id, 0);
}

#[test]
fn test_backfill_counts_failed_batches() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(BrokenEmbedder));
    engine.load_session("s1", Some("u1")).unwrap();
    for i in 0..4 {
        engine.add_memory(&format!("note {}", i), Role::User, None).unwrap();
    }

    let report = engine.backfill_embeddings(2, 0).unwrap();
    assert_eq!(report.scanned, 4);
    assert_eq!(report.embedded, 0);
    assert_eq!(report.failed_batches, 2);
    assert!(report.last_message_id > 0);
}

// ===== Concurrency =====

#[test]
fn test_handles_drive_sessions_from_separate_threads() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir.path().join("memory.db"), Arc::new(HashingEmbedder));

    thread::scope(|scope| {
        for t in 0..4 {
            let handle = engine.handle();
            scope.spawn(move || {
                let session = format!("session-{}", t);
                handle.load_session(&session, Some("u1")).unwrap();
                for i in 0..10 {
                    handle.add_memory(&format!("thread {} turn {}", t, i), Role::User, None).unwrap();
                }
                let history = handle.get_session_messages(10_000).unwrap();
                assert_eq!(history.len(), 10);
                assert!(history.iter().all(|m| m.session_id == session));
            });
        }
    });

    assert!(engine.flush_embeddings(Duration::from_secs(5)));
    let stats = engine.stats().unwrap();
    assert_eq!(stats.total_sessions, 4);
    assert_eq!(stats.total_messages, 40);
    assert_eq!(stats.embedded_messages, 40);
    assert!(engine.active_session().is_none());
}

#[test]
fn test_concurrent_appends_on_distinct_sessions_never_fail() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir.path().join("memory.db"));
    config.pool_size = 10;
    let engine = open_with(config, Arc::new(BrokenEmbedder));
    const THREADS: usize = 8;
    const APPENDS: usize = 300;

    let failures: usize = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let handle = engine.handle();
                scope.spawn(move || {
                    handle.load_session(&format!("busy-{}", t), Some("u1")).unwrap();
                    (0..APPENDS)
                        .filter(|i| {
                            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                            handle.add_memory(&format!("thread {} message {}", t, i), role, None).is_err()
                        })
                        .count()
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });

    assert_eq!(failures, 0);
    assert_eq!(engine.stats().unwrap().total_messages, (THREADS * APPENDS) as i64);
}

#[test]
fn test_clear_succeeds_while_other_sessions_write() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir.path().join("memory.db"));
    config.pool_size = 8;
    let engine = open_with(config, Arc::new(BrokenEmbedder));
    let cleaner = engine.handle();
    cleaner.load_session("cleaner", Some("u2")).unwrap();
    let tagged = metadata(json!({"agent_id": "a"}));
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        for t in 0..4 {
            let handle = engine.handle();
            let done = &done;
            scope.spawn(move || {
                handle.load_session(&format!("writer-{}", t), Some("u1")).unwrap();
                let mut i = 0;
                while !done.load(Ordering::Relaxed) {
                    handle.add_memory(&format!("writer {} line {}", t, i), Role::User, None).unwrap();
                    i += 1;
                }
            });
        }

        let failed_rounds = (0..100)
            .filter(|_| {
                cleaner.add_memory("scratch note", Role::User, Some(tagged.clone())).is_err()
                    || !cleaner.clear_memory(None, Some("a"), None)
            })
            .count();
        done.store(true, Ordering::Relaxed);
        assert_eq!(failed_rounds, 0);
        assert!(cleaner.get_session_messages(10_000).unwrap().is_empty());
    });
}
