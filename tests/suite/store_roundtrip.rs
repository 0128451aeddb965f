//! Message store round trips across both tiers

use std::collections::HashSet;
use std::time::Duration;

use quill_config::{BufferConfig, PersistenceConfig};
use quill_store::{MessageStore, StoreEvent};
use quill_types::{MessagePatch, MessageQuery, NewMessage, Role, Timestamp};

use crate::common::{fast_persistence, ids, open_store, open_store_with, quiet_buffer, session};

#[tokio::test]
async fn write_is_immediately_readable() {
    let store = open_store().await;
    let s1 = session("s1");
    let before = Timestamp::now();

    let message = store.write(NewMessage::user(s1.clone(), "hi")).unwrap();

    assert!(!message.id.as_str().is_empty());
    assert!(message.timestamp >= before);
    let page = store.read(MessageQuery::session(s1)).await.unwrap();
    assert_eq!(page.items, [message]);
    assert_eq!(page.total, 1);
    assert!(!page.has_more);
}

#[tokio::test]
async fn delete_session_leaves_nothing_in_either_tier() {
    let store = open_store().await;
    let s1 = session("s1");
    for i in 0..12 {
        store
            .write(NewMessage::user(s1.clone(), format!("message {i}")))
            .unwrap();
    }
    assert_eq!(store.flush(Some(&s1)).await.unwrap(), 12);
    store.write(NewMessage::user(s1.clone(), "still buffered")).unwrap();

    let removed = store.delete_session(&s1).await.unwrap();

    assert_eq!(removed, 13);
    assert_eq!(store.persisted_count(Some(&s1)).await.unwrap(), 0);
    assert_eq!(store.status().buffer.total_messages, 0);
    assert!(store.read(MessageQuery::session(s1)).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn order_survives_threshold_and_eviction_flushes() {
    let buffer = BufferConfig {
        flush_threshold: 3,
        max_total_messages: 5,
        flush_interval_ms: 3_600_000,
    };
    let store = open_store_with(buffer, &fast_persistence()).await;
    let sessions = [session("a"), session("b"), session("c")];

    let mut written = vec![Vec::new(), Vec::new(), Vec::new()];
    for i in 0..30 {
        let slot = i % 3;
        let message = store
            .write(NewMessage::user(sessions[slot].clone(), format!("turn {i}")))
            .unwrap();
        written[slot].push(message.id);
        if i % 4 == 0 {
            // Let the flush worker drain what the writes scheduled.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    store.flush(None).await.unwrap();

    for (session_id, expected) in sessions.iter().zip(&written) {
        let page = store.read(MessageQuery::session(session_id.clone())).await.unwrap();
        let got: Vec<_> = page.items.iter().map(|m| m.id.clone()).collect();
        assert_eq!(&got, expected, "session {session_id}");
        let unique: HashSet<_> = got.iter().collect();
        assert_eq!(unique.len(), got.len());
    }
    assert_eq!(store.persisted_count(None).await.unwrap(), 30);
}

#[tokio::test]
async fn update_and_delete_reach_persisted_messages() {
    let store = open_store().await;
    let s1 = session("s1");
    let first = store.write(NewMessage::user(s1.clone(), "draft")).unwrap();
    let second = store.write(NewMessage::assistant(s1.clone(), "reply")).unwrap();
    store.flush(Some(&s1)).await.unwrap();
    let mut events = store.subscribe();

    let updated = store
        .update_message(&first.id, MessagePatch::content("final"))
        .await
        .unwrap()
        .expect("persisted message is found");
    assert_eq!(updated.content, "final");
    assert_eq!(events.recv().await.unwrap(), StoreEvent::Updated(updated.clone()));

    assert!(store.delete_message(&second.id).await.unwrap());
    assert!(!store.delete_message(&second.id).await.unwrap());

    let page = store.read(MessageQuery::session(s1)).await.unwrap();
    assert_eq!(page.items, [updated]);
}

#[tokio::test]
async fn filters_and_pages_span_both_tiers() {
    let store = open_store().await;
    let s1 = session("s1");
    for i in 0..10 {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        store
            .write(NewMessage::new(s1.clone(), role, format!("m{i}")))
            .unwrap();
        if i == 4 {
            store.flush(Some(&s1)).await.unwrap();
        }
    }

    let page = store
        .read(MessageQuery::session(s1.clone()).role(Role::User).page(1, 3))
        .await
        .unwrap();
    let contents: Vec<_> = page.items.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["m2", "m4", "m6"]);
    assert_eq!(page.total, 5);
    assert!(page.has_more);

    let recent = store.read_recent(&s1, 3).await.unwrap();
    let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["m7", "m8", "m9"]);
}

#[tokio::test]
async fn rollback_removes_everything_after_anchor() {
    let store = open_store().await;
    let s1 = session("s1");
    let written = store
        .write_many(
            (0..6)
                .map(|i| NewMessage::user(s1.clone(), format!("m{i}")))
                .collect(),
        )
        .unwrap();
    store.flush(Some(&s1)).await.unwrap();
    store.write(NewMessage::user(s1.clone(), "m6")).unwrap();

    let removed = store.rollback(&s1, &written[2].id).await.unwrap();

    assert_eq!(removed, 4);
    let page = store.read(MessageQuery::session(s1)).await.unwrap();
    assert_eq!(
        ids(&page.items),
        ids(&written[..3])
    );
}

#[tokio::test]
async fn messages_survive_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = PersistenceConfig {
        database_path: Some(dir.path().join("messages.db")),
        ..fast_persistence()
    };
    let s1 = session("s1");

    let store = MessageStore::new(quiet_buffer(), &persistence);
    store.init().await.unwrap();
    let message = store.write(NewMessage::user(s1.clone(), "remember me")).unwrap();
    store.shutdown().await.unwrap();
    drop(store);

    let reopened = MessageStore::new(quiet_buffer(), &persistence);
    reopened.init().await.unwrap();
    let page = reopened.read(MessageQuery::session(s1)).await.unwrap();
    assert_eq!(page.items, [message]);
}
