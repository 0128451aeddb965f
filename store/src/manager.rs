//! Bridge between the local message store and a remote message backend.
//!
//! Remote history is imported into the store with its ids and timestamps
//! intact, so every read still goes through the store's merge contract.
//! Local appends are optimistic: they land in the buffer and are visible
//! immediately.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use quill_types::{Message, MessageId, MessagePage, MessageQuery, NewMessage, SessionId};

use crate::error::{StoreError, StoreResult};
use crate::store::MessageStore;

/// Page size used when there is no known latest id to sync from.
const SYNC_PAGE_SIZE: usize = 50;

pub type BackendFut<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage {
    /// Oldest first.
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Remote message service. Transport, auth and caching are its concern.
pub trait RemoteBackend: Send + Sync {
    /// Up to `limit` messages older than `before` (or the newest when `None`).
    fn fetch_page<'a>(
        &'a self,
        session_id: &'a SessionId,
        before: Option<&'a MessageId>,
        limit: usize,
    ) -> BackendFut<'a, RemotePage>;

    fn latest_message_id<'a>(&'a self, session_id: &'a SessionId)
    -> BackendFut<'a, Option<MessageId>>;

    /// Every message newer than `after`, oldest first.
    fn fetch_since<'a>(
        &'a self,
        session_id: &'a SessionId,
        after: &'a MessageId,
    ) -> BackendFut<'a, Vec<Message>>;

    /// Delete every message after `message_id` on the remote side.
    fn rollback<'a>(&'a self, session_id: &'a SessionId, message_id: &'a MessageId)
    -> BackendFut<'a, ()>;

    fn refresh_cache<'a>(&'a self, session_id: &'a SessionId) -> BackendFut<'a, ()>;
}

pub struct MessageManager {
    store: Arc<MessageStore>,
    backend: Arc<dyn RemoteBackend>,
    /// Newest remote id already imported, per session.
    latest: Mutex<HashMap<SessionId, MessageId>>,
}

impl MessageManager {
    #[must_use]
    pub fn new(store: Arc<MessageStore>, backend: Arc<dyn RemoteBackend>) -> Self {
        Self {
            store,
            backend,
            latest: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Fetch a remote page into the store and return the newest `limit`
    /// local messages older than `before`.
    pub async fn load_page(
        &self,
        session_id: &SessionId,
        before: Option<&MessageId>,
        limit: usize,
    ) -> StoreResult<MessagePage> {
        let remote = self
            .backend
            .fetch_page(session_id, before, limit)
            .await
            .map_err(StoreError::Backend)?;
        if before.is_none()
            && let Some(newest) = remote.messages.last()
        {
            self.remember_latest(session_id, newest.id.clone());
        }
        let fetched = remote.messages.len();
        self.store.import(remote.messages)?;

        let mut query = MessageQuery::session(session_id.clone());
        if let Some(before) = before {
            match self.store.get_message(before).await? {
                Some(anchor) => query = query.before(anchor.timestamp),
                None => tracing::warn!(session_id = %session_id, before = %before, "Page anchor not found locally"),
            }
        }
        let page = self.store.read(query).await?;
        let skip = page.items.len().saturating_sub(limit);
        let items: Vec<Message> = page.items.into_iter().skip(skip).collect();
        tracing::debug!(session_id = %session_id, fetched, returned = items.len(), "Loaded message page");
        Ok(MessagePage {
            has_more: remote.has_more || page.total > items.len(),
            total: page.total,
            items,
        })
    }

    /// Write locally ahead of the remote round trip.
    pub fn append_local(&self, input: NewMessage) -> StoreResult<Message> {
        self.store.write(input)
    }

    /// Import anything the remote has beyond what was last seen. Returns the
    /// number of imported messages.
    pub async fn sync_new(&self, session_id: &SessionId) -> StoreResult<usize> {
        let remote_latest = self
            .backend
            .latest_message_id(session_id)
            .await
            .map_err(StoreError::Backend)?;
        let Some(remote_latest) = remote_latest else {
            return Ok(0);
        };
        let known = self.latest.lock().get(session_id).cloned();
        if known.as_ref() == Some(&remote_latest) {
            return Ok(0);
        }

        let messages = match &known {
            Some(known) => self
                .backend
                .fetch_since(session_id, known)
                .await
                .map_err(StoreError::Backend)?,
            None => {
                self.backend
                    .fetch_page(session_id, None, SYNC_PAGE_SIZE)
                    .await
                    .map_err(StoreError::Backend)?
                    .messages
            }
        };
        let count = messages.len();
        self.store.import(messages)?;
        self.remember_latest(session_id, remote_latest);
        tracing::debug!(session_id = %session_id, count, "Synced remote messages");
        Ok(count)
    }

    /// Roll back remote first, then local. Returns how many local messages
    /// were removed.
    pub async fn rollback_to(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> StoreResult<usize> {
        self.backend
            .rollback(session_id, message_id)
            .await
            .map_err(StoreError::Backend)?;
        let removed = self.store.rollback(session_id, message_id).await?;
        self.remember_latest(session_id, message_id.clone());
        Ok(removed)
    }

    /// Ask the remote to rebuild its cache, then resync from scratch.
    pub async fn refresh(&self, session_id: &SessionId) -> StoreResult<usize> {
        self.backend
            .refresh_cache(session_id)
            .await
            .map_err(StoreError::Backend)?;
        self.latest.lock().remove(session_id);
        self.sync_new(session_id).await
    }

    fn remember_latest(&self, session_id: &SessionId, message_id: MessageId) {
        self.latest.lock().insert(session_id.clone(), message_id);
    }
}
