//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use quill_config::{BufferConfig, PersistenceConfig};
use quill_context::{Summarizer, SummaryFut};
use quill_store::{FlushFut, FlushSink, MessageStore};
use quill_types::{Message, MessageId, SessionId};

pub fn session(name: &str) -> SessionId {
    SessionId::new(name).expect("non-empty session id")
}

/// Thresholds high enough that nothing flushes unless a test asks for it.
pub fn quiet_buffer() -> BufferConfig {
    BufferConfig {
        flush_threshold: 10_000,
        max_total_messages: 100_000,
        flush_interval_ms: 3_600_000,
    }
}

/// In-memory persistence with no retry delays.
pub fn fast_persistence() -> PersistenceConfig {
    PersistenceConfig {
        initial_retry_delay_ms: 0,
        max_retry_delay_ms: 0,
        ..PersistenceConfig::in_memory()
    }
}

/// An initialized store over an in-memory database.
pub async fn open_store() -> Arc<MessageStore> {
    open_store_with(quiet_buffer(), &fast_persistence()).await
}

pub async fn open_store_with(buffer: BufferConfig, persistence: &PersistenceConfig) -> Arc<MessageStore> {
    let store = Arc::new(MessageStore::new(buffer, persistence));
    store.init().await.expect("store init");
    store
}

pub fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

/// Sink that fails every call and counts attempts.
#[derive(Default)]
pub struct BrokenSink {
    pub attempts: AtomicUsize,
}

impl BrokenSink {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl FlushSink for BrokenSink {
    fn persist<'a>(&'a self, _batch: &'a [Message]) -> FlushFut<'a> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err::<(), _>(anyhow::anyhow!("disk full")) })
    }

    fn purge<'a>(&'a self, _ids: &'a [MessageId]) -> FlushFut<'a> {
        Box::pin(async { Ok(()) })
    }
}

/// Summarizer that states how many messages it replaced.
pub struct CountingSummarizer;

impl Summarizer for CountingSummarizer {
    fn summarize<'a>(&'a self, messages: &'a [Message], _target_tokens: u32) -> SummaryFut<'a> {
        Box::pin(async move { Ok(format!("{} earlier messages discussed", messages.len())) })
    }
}
