//! Store history feeding the context engine

use std::sync::Arc;

use quill_config::{ContextConfig, ContextConfigPatch, StrategyKind};
use quill_context::{ContextEngine, ContextOptions, SUMMARY_PREFIX};
use quill_types::{MessageQuery, NewMessage, Role, ToolDefinition};

use crate::common::{CountingSummarizer, open_store, session};

async fn seeded_history(turns: usize) -> (Vec<quill_types::Message>, quill_types::Message) {
    let store = open_store().await;
    let s1 = session("s1");
    store
        .write(NewMessage::system(s1.clone(), "You are a helpful assistant."))
        .unwrap();
    for i in 0..turns {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        store
            .write(NewMessage::new(
                s1.clone(),
                role,
                format!("turn {i}: some conversation text that takes up a little room"),
            ))
            .unwrap();
        if i == turns / 2 {
            store.flush(Some(&s1)).await.unwrap();
        }
    }
    let new_message = store
        .write(NewMessage::user(s1.clone(), "so what did we decide?"))
        .unwrap();
    let history = store.read(MessageQuery::session(s1)).await.unwrap().items;
    (history, new_message)
}

#[tokio::test]
async fn sliding_window_keeps_system_and_newest_turns() {
    let (history, new_message) = seeded_history(30).await;
    let engine = ContextEngine::default();
    let options = ContextOptions::new(300).reserved_for_response(50);

    let result = engine
        .build_context(&session("s1"), &new_message, &history, &options)
        .await;

    assert!(result.usage.total <= result.budget.input_cap());
    assert_eq!(result.messages.first().map(|m| m.role), Some(Role::System));
    assert_eq!(result.messages.last().map(|m| &m.id), Some(&new_message.id));
    assert!(result.metadata.truncated > 0);
    // Whatever was kept is the newest contiguous run.
    let kept_turns = &result.messages[1..result.messages.len() - 1];
    let tail = &history[history.len() - 1 - kept_turns.len()..history.len() - 1];
    assert_eq!(kept_turns, tail);
}

#[tokio::test]
async fn summary_strategy_replaces_old_turns() {
    let (history, new_message) = seeded_history(40).await;
    let engine = ContextEngine::new(ContextConfig {
        strategy: StrategyKind::Summary,
        summary_threshold: 10,
        summary_reserve_tokens: 100,
        ..ContextConfig::default()
    })
    .with_summarizer(Arc::new(CountingSummarizer));
    let options = ContextOptions::new(600)
        .reserved_for_response(100)
        .system_prompt("Be brief.")
        .tools(vec![ToolDefinition::new(
            "lookup",
            "Look something up",
            serde_json::json!({"type": "object"}),
        )]);

    let result = engine
        .build_context(&session("s1"), &new_message, &history, &options)
        .await;

    assert!(result.usage.total <= result.budget.input_cap());
    assert!(result.metadata.summarized > 0);
    let summary = result
        .messages
        .iter()
        .find(|m| m.content.starts_with(SUMMARY_PREFIX))
        .expect("summary message present");
    assert_eq!(summary.role, Role::System);
    assert!(
        summary
            .content
            .contains(&format!("{} earlier messages", result.metadata.summarized))
    );
}

#[tokio::test]
async fn per_call_patch_overrides_engine_strategy() {
    let (history, new_message) = seeded_history(20).await;
    let engine = ContextEngine::default();
    let options = ContextOptions::new(100_000).config(ContextConfigPatch {
        strategy: Some(StrategyKind::Rag),
        window_size: Some(3),
        ..ContextConfigPatch::default()
    });

    let result = engine
        .build_context(&session("s1"), &new_message, &history, &options)
        .await;

    // No embedder configured: RAG degrades to the sliding window.
    assert_eq!(result.metadata.strategy, StrategyKind::Rag);
    assert_eq!(result.metadata.retrieved, 0);
    assert_eq!(result.messages.len(), 1 + 3 + 1);
}
