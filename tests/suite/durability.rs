//! Flush failure handling: nothing buffered is ever lost

use std::sync::Arc;

use quill_config::PersistenceConfig;
use quill_store::{EventBus, FlushScheduler, MessageStore, StoreError, WriteBuffer};
use quill_types::{MessageQuery, NewMessage};

use crate::common::{BrokenSink, fast_persistence, ids, quiet_buffer, session};

fn broken_buffer() -> (WriteBuffer, Arc<BrokenSink>) {
    let sink = Arc::new(BrokenSink::default());
    let (scheduler, _requests) = FlushScheduler::channel();
    let buffer = WriteBuffer::new(quiet_buffer(), sink.clone(), scheduler, EventBus::new());
    (buffer, sink)
}

#[tokio::test]
async fn failed_flush_keeps_batch_readable() {
    let (buffer, sink) = broken_buffer();
    let s1 = session("s1");
    let written = buffer.write_many(vec![
        NewMessage::user(s1.clone(), "one"),
        NewMessage::assistant(s1.clone(), "two"),
        NewMessage::user(s1.clone(), "three"),
    ]);

    let err = buffer.flush(&s1).await.unwrap_err();

    assert!(matches!(err, StoreError::FlushFailed { ref session_id, .. } if *session_id == s1));
    assert_eq!(sink.attempts(), 1);
    assert_eq!(ids(&buffer.read(&s1, None)), ids(&written));
    let status = buffer.status();
    assert_eq!(status.total_messages, 3);
    assert_eq!(status.in_flight, 0);
}

#[tokio::test]
async fn writes_during_failed_flush_stay_after_restored_batch() {
    let (buffer, _sink) = broken_buffer();
    let s1 = session("s1");
    let first = buffer.write(NewMessage::user(s1.clone(), "before"));
    assert!(buffer.flush(&s1).await.is_err());
    let second = buffer.write(NewMessage::user(s1.clone(), "after"));
    assert!(buffer.flush(&s1).await.is_err());

    let read = buffer.read(&s1, None);
    assert_eq!(ids(&read), [first.id.as_str(), second.id.as_str()]);
}

#[tokio::test]
async fn empty_session_flush_never_reaches_the_sink() {
    let (buffer, sink) = broken_buffer();
    let s1 = session("s1");

    assert_eq!(buffer.flush(&s1).await.unwrap(), 0);
    assert_eq!(buffer.flush_all().await.unwrap(), 0);
    assert_eq!(sink.attempts(), 0);
}

#[tokio::test]
async fn flush_all_reports_every_failed_session() {
    let (buffer, _sink) = broken_buffer();
    buffer.write(NewMessage::user(session("a"), "x"));
    buffer.write(NewMessage::user(session("b"), "y"));

    let Err(StoreError::FlushAll { failures }) = buffer.flush_all().await else {
        panic!("expected a combined flush failure");
    };
    let failed: Vec<&str> = failures.iter().map(|(s, _)| s.as_str()).collect();
    assert_eq!(failed, ["a", "b"]);
    assert_eq!(buffer.status().total_messages, 2);
}

#[tokio::test]
async fn exhausted_database_retries_keep_the_message_buffered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("messages.db");
    let persistence = PersistenceConfig {
        database_path: Some(path.clone()),
        ..fast_persistence()
    };
    let store = MessageStore::new(quiet_buffer(), &persistence);
    store.init().await.unwrap();

    let admin = rusqlite::Connection::open(&path).unwrap();
    admin
        .execute_batch(
            "CREATE TRIGGER reject_inserts BEFORE INSERT ON messages
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    let s1 = session("s1");
    let message = store.write(NewMessage::user(s1.clone(), "keep me")).unwrap();
    let err = store.flush(Some(&s1)).await.unwrap_err();

    let text = err.to_string();
    let attempts = format!("failed after {} attempt(s)", persistence.max_retries + 1);
    assert!(text.contains(&attempts), "{text}");
    assert!(text.contains("disk full"), "{text}");

    let page = store.read(MessageQuery::session(s1)).await.unwrap();
    assert_eq!(page.items, [message]);
    let status = store.status();
    assert_eq!(status.buffer.total_messages, 1);
    assert_eq!(status.persistence.pending, 1);
    assert!(status.persistence.last_flush.is_none());
    let last_error = status.persistence.last_error.expect("failure recorded");
    assert!(last_error.contains("disk full"), "{last_error}");
    assert_eq!(store.persisted_count(None).await.unwrap(), 0);
}
