//! Message store façade over the write buffer and the persistence tier.
//!
//! Callers see one conversation-level API regardless of which tier holds a
//! message. Reads merge both tiers by id with the buffered copy winning.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use quill_config::{BufferConfig, PersistenceConfig, QuillConfig};
use quill_context::{MediaHistoryFut, MediaHistorySource};
use quill_types::{
    Message, MessageId, MessagePage, MessagePatch, MessageQuery, NewMessage, PersistStatus,
    SessionId, StoreStatus, sort_chronologically,
};

use crate::buffer::{FlushSink, WriteBuffer};
use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::flush_worker::{FlushRequest, FlushScheduler, run_flush_worker};
use crate::persistence::AsyncPersistence;

#[derive(Default)]
struct Worker {
    /// Held until `init` hands it to the worker task.
    requests: Option<mpsc::UnboundedReceiver<FlushRequest>>,
    handle: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

pub struct MessageStore {
    buffer: Arc<WriteBuffer>,
    persistence: Arc<AsyncPersistence>,
    flush_interval: Duration,
    initialized: AtomicBool,
    worker: Mutex<Worker>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("buffer", &self.buffer)
            .field("persistence", &self.persistence)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl MessageStore {
    #[must_use]
    pub fn new(buffer: BufferConfig, persistence: &PersistenceConfig) -> Self {
        Self::with_persistence(buffer, Arc::new(AsyncPersistence::new(persistence)))
    }

    #[must_use]
    pub fn from_config(config: &QuillConfig) -> Self {
        Self::new(config.buffer.clone(), &config.persistence)
    }

    #[must_use]
    pub fn with_persistence(buffer: BufferConfig, persistence: Arc<AsyncPersistence>) -> Self {
        let (scheduler, requests) = FlushScheduler::channel();
        let flush_interval = buffer.flush_interval();
        let sink: Arc<dyn FlushSink> = persistence.clone();
        let buffer = Arc::new(WriteBuffer::new(buffer, sink, scheduler, EventBus::new()));
        Self {
            buffer,
            persistence,
            flush_interval,
            initialized: AtomicBool::new(false),
            worker: Mutex::new(Worker {
                requests: Some(requests),
                ..Worker::default()
            }),
        }
    }

    /// Open persistence and start the background flush loop. Safe to call
    /// more than once; only the first call starts the loop.
    pub async fn init(&self) -> StoreResult<()> {
        self.persistence.init().await?;
        {
            let mut worker = self.worker.lock();
            if let Some(requests) = worker.requests.take() {
                let (tx, rx) = oneshot::channel();
                worker.handle = Some(tokio::spawn(run_flush_worker(
                    Arc::clone(&self.buffer),
                    requests,
                    self.flush_interval,
                    rx,
                )));
                worker.shutdown = Some(tx);
                tracing::info!(
                    interval_ms = self.flush_interval.as_millis() as u64,
                    "Message store flush loop started"
                );
            }
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_init(&self) -> StoreResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    pub fn write(&self, input: NewMessage) -> StoreResult<Message> {
        self.ensure_init()?;
        Ok(self.buffer.write(input))
    }

    pub fn write_many(&self, inputs: Vec<NewMessage>) -> StoreResult<Vec<Message>> {
        self.ensure_init()?;
        Ok(self.buffer.write_many(inputs))
    }

    /// Buffer messages that already have ids and timestamps (remote history).
    pub fn import(&self, messages: Vec<Message>) -> StoreResult<()> {
        self.ensure_init()?;
        self.buffer.import(messages);
        Ok(())
    }

    pub async fn read(&self, query: MessageQuery) -> StoreResult<MessagePage> {
        self.ensure_init()?;
        // Buffer first: a flush landing between the two reads then shows the
        // message in at least one tier.
        let buffered = self.buffer.read(&query.session_id, None);
        let persisted = self
            .persistence
            .read_range(&query.session_id, query.after, query.before)
            .await?;
        Ok(MessagePage::paginate(merge_tiers(persisted, buffered), &query))
    }

    /// The newest `limit` messages of a session, oldest first.
    pub async fn read_recent(&self, session_id: &SessionId, limit: usize) -> StoreResult<Vec<Message>> {
        self.ensure_init()?;
        let buffered = self.buffer.read(session_id, Some(limit));
        let persisted = self.persistence.read(session_id, Some(limit)).await?;
        let mut merged = merge_tiers(persisted, buffered);
        let skip = merged.len().saturating_sub(limit);
        merged.drain(..skip);
        Ok(merged)
    }

    pub async fn get_message(&self, message_id: &MessageId) -> StoreResult<Option<Message>> {
        self.ensure_init()?;
        if let Some(message) = self.buffer.get(message_id) {
            return Ok(Some(message));
        }
        Ok(self.persistence.get(message_id).await?)
    }

    /// Patch a message in whichever tier holds it. Persisted messages are
    /// read, patched and written back. `None` when the id is unknown.
    pub async fn update_message(
        &self,
        message_id: &MessageId,
        patch: MessagePatch,
    ) -> StoreResult<Option<Message>> {
        self.ensure_init()?;
        if let Some(updated) = self.buffer.update(message_id, patch.clone()) {
            return Ok(Some(updated));
        }
        let Some(stored) = self.persistence.get(message_id).await? else {
            return Ok(None);
        };
        let updated = stored.apply_patch(patch);
        self.persistence
            .write_with_retry(std::slice::from_ref(&updated))
            .await?;
        self.buffer
            .events()
            .emit(StoreEvent::Updated(updated.clone()));
        Ok(Some(updated))
    }

    /// Delete from both tiers. True when either tier had the id.
    pub async fn delete_message(&self, message_id: &MessageId) -> StoreResult<bool> {
        self.ensure_init()?;
        if self.buffer.delete(message_id) {
            self.persistence.delete(message_id).await?;
            return Ok(true);
        }
        let Some(stored) = self.persistence.get(message_id).await? else {
            return Ok(false);
        };
        let removed = self.persistence.delete(message_id).await?;
        if removed {
            self.buffer.events().emit(StoreEvent::Deleted {
                session_id: stored.session_id,
                message_id: message_id.clone(),
            });
        }
        Ok(removed)
    }

    /// Returns how many messages were removed across both tiers.
    pub async fn delete_session(&self, session_id: &SessionId) -> StoreResult<usize> {
        self.ensure_init()?;
        let buffered = self.buffer.clear_session(session_id).await;
        let persisted = self.persistence.delete_session(session_id).await?;
        tracing::info!(session_id = %session_id, buffered, persisted, "Session deleted");
        Ok(buffered + persisted)
    }

    /// Delete every message of the session ordered after `message_id`.
    /// Returns how many were removed; an unknown anchor, or one from another
    /// session, removes nothing.
    pub async fn rollback(&self, session_id: &SessionId, message_id: &MessageId) -> StoreResult<usize> {
        self.ensure_init()?;
        let Some(anchor) = self.get_message(message_id).await? else {
            tracing::warn!(session_id = %session_id, message_id = %message_id, "Rollback anchor not found");
            return Ok(0);
        };
        if anchor.session_id != *session_id {
            tracing::warn!(
                session_id = %session_id,
                message_id = %message_id,
                anchor_session = %anchor.session_id,
                "Rollback anchor belongs to another session"
            );
            return Ok(0);
        }
        let page = self
            .read(MessageQuery::session(session_id.clone()).after(anchor.timestamp.prev()))
            .await?;
        let doomed: Vec<MessageId> = page
            .items
            .into_iter()
            .filter(|m| m.order_key() > anchor.order_key())
            .map(|m| m.id)
            .collect();
        for id in &doomed {
            self.buffer.delete(id);
        }
        self.persistence.delete_many(&doomed).await?;
        tracing::info!(session_id = %session_id, anchor = %message_id, removed = doomed.len(), "Rolled back session");
        Ok(doomed.len())
    }

    /// Flush one session, or every session when `None`.
    pub async fn flush(&self, session_id: Option<&SessionId>) -> StoreResult<usize> {
        self.ensure_init()?;
        match session_id {
            Some(session_id) => self.buffer.flush(session_id).await,
            None => self.buffer.flush_all().await,
        }
    }

    pub async fn persisted_count(&self, session_id: Option<&SessionId>) -> StoreResult<usize> {
        self.ensure_init()?;
        Ok(self.persistence.count(session_id).await?)
    }

    #[must_use]
    pub fn status(&self) -> StoreStatus {
        let buffer = self.buffer.status();
        let persistence = PersistStatus {
            pending: buffer.total_messages + buffer.in_flight,
            last_flush: self.persistence.last_flush(),
            last_error: self.persistence.last_error(),
        };
        StoreStatus {
            initialized: self.is_initialized(),
            buffer,
            persistence,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.buffer.events().subscribe()
    }

    /// Stop the flush loop and flush everything still buffered.
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.ensure_init()?;
        let (shutdown, handle) = {
            let mut worker = self.worker.lock();
            (worker.shutdown.take(), worker.handle.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "Flush worker ended abnormally");
        }
        let flushed = self.buffer.flush_all().await?;
        tracing::info!(flushed, "Message store shut down");
        Ok(())
    }
}

impl Drop for MessageStore {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().handle.take() {
            handle.abort();
        }
    }
}

impl MediaHistorySource for MessageStore {
    fn recent_media_messages<'a>(
        &'a self,
        session_id: &'a SessionId,
        limit: usize,
    ) -> MediaHistoryFut<'a> {
        Box::pin(async move {
            let page = self.read(MessageQuery::session(session_id.clone())).await?;
            let mut media: Vec<Message> =
                page.items.into_iter().filter(Message::has_media).collect();
            let skip = media.len().saturating_sub(limit);
            media.drain(..skip);
            Ok(media)
        })
    }
}

/// Union by id, buffered copy winning, in chronological order.
fn merge_tiers(persisted: Vec<Message>, buffered: Vec<Message>) -> Vec<Message> {
    let mut by_id: HashMap<MessageId, Message> = persisted
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();
    for message in buffered {
        by_id.insert(message.id.clone(), message);
    }
    let mut merged: Vec<Message> = by_id.into_values().collect();
    sort_chronologically(&mut merged);
    merged
}
