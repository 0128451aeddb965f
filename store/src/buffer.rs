//! Write buffer: the hot, in-memory tier.
//!
//! Writes are synchronous and never touch I/O. Each session keeps a list of
//! pending messages; a flush moves them "in flight" while the sink persists
//! them, so they stay readable until the sink acknowledges. A failed flush
//! puts the batch back in front of whatever was written meanwhile.
//!
//! Flushes triggered by a write are never run inline; they are queued on the
//! [`FlushScheduler`] and drained by the flush worker.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use quill_config::BufferConfig;
use quill_types::{
    BufferStatus, Message, MessageId, MessagePatch, NewMessage, SessionId, Timestamp,
    sort_chronologically,
};

use crate::error::{StoreError, StoreResult};
use crate::events::{EventBus, StoreEvent};
use crate::flush_worker::{FlushReason, FlushRequest, FlushScheduler};

pub type FlushFut<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// Destination of flushed batches.
pub trait FlushSink: Send + Sync {
    /// Durably store a batch. Must be all-or-nothing per call and idempotent
    /// (messages may be handed over again after a failure).
    fn persist<'a>(&'a self, batch: &'a [Message]) -> FlushFut<'a>;

    /// Remove messages that were deleted while their batch was in flight.
    fn purge<'a>(&'a self, ids: &'a [MessageId]) -> FlushFut<'a>;
}

#[derive(Debug, Default)]
struct SessionBuffer {
    pending: Vec<Message>,
    in_flight: Vec<Message>,
    /// Deleted while in flight; removed from the sink after the flight lands.
    purge_after_flight: Vec<MessageId>,
    last_touched: Timestamp,
    flush_scheduled: bool,
}

impl SessionBuffer {
    fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.purge_after_flight.is_empty()
    }

    /// Pending copies win over in-flight copies of the same id.
    fn snapshot(&self) -> Vec<Message> {
        let pending_ids: HashSet<&MessageId> = self.pending.iter().map(|m| &m.id).collect();
        self.in_flight
            .iter()
            .filter(|m| !pending_ids.contains(&m.id))
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    fn find(&self, id: &MessageId) -> Option<&Message> {
        self.pending
            .iter()
            .find(|m| &m.id == id)
            .or_else(|| self.in_flight.iter().find(|m| &m.id == id))
    }

    fn upsert_pending(&mut self, message: Message) -> bool {
        if let Some(slot) = self.pending.iter_mut().find(|m| m.id == message.id) {
            *slot = message;
            false
        } else {
            self.pending.push(message);
            true
        }
    }
}

#[derive(Debug, Default)]
struct BufferState {
    sessions: HashMap<SessionId, SessionBuffer>,
    /// Pending messages across all sessions.
    total: usize,
    last_timestamp: Timestamp,
}

impl BufferState {
    /// Strictly increasing within the process, so insertion order is
    /// recoverable from timestamps alone.
    fn next_timestamp(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let ts = if now > self.last_timestamp {
            now
        } else {
            self.last_timestamp.next()
        };
        self.last_timestamp = ts;
        ts
    }

    fn insert(&mut self, message: Message) {
        let touched = message.timestamp;
        let session = self.sessions.entry(message.session_id.clone()).or_default();
        session.last_touched = session.last_touched.max(touched);
        if session.upsert_pending(message) {
            self.total += 1;
        }
    }

    fn flush_requests(&mut self, session_id: &SessionId, config: &BufferConfig) -> Vec<FlushRequest> {
        let mut requests = Vec::new();
        if let Some(session) = self.sessions.get_mut(session_id)
            && !session.flush_scheduled
            && session.pending.len() >= config.flush_threshold
        {
            session.flush_scheduled = true;
            requests.push(FlushRequest {
                session_id: session_id.clone(),
                reason: FlushReason::Threshold,
            });
        }

        if self.total > config.max_total_messages
            && let Some((victim, session)) = self
                .sessions
                .iter_mut()
                .filter(|(_, s)| !s.pending.is_empty() && !s.flush_scheduled)
                .min_by_key(|(id, s)| (s.last_touched, (*id).clone()))
        {
            session.flush_scheduled = true;
            tracing::debug!(
                session_id = %victim,
                total = self.total,
                max = config.max_total_messages,
                "Evicting least recently touched session"
            );
            requests.push(FlushRequest {
                session_id: victim.clone(),
                reason: FlushReason::Eviction,
            });
        }
        requests
    }

    fn begin_flight(&mut self, session_id: &SessionId) -> Vec<Message> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Vec::new();
        };
        session.flush_scheduled = false;
        // A flight that was never settled is carried into this one.
        let leftover = std::mem::take(&mut session.in_flight);
        if session.pending.is_empty() && leftover.is_empty() {
            return Vec::new();
        }
        let pending = std::mem::take(&mut session.pending);
        self.total -= pending.len();
        let pending_ids: HashSet<&MessageId> = pending.iter().map(|m| &m.id).collect();
        let mut batch: Vec<Message> = leftover
            .into_iter()
            .filter(|m| !pending_ids.contains(&m.id))
            .collect();
        batch.extend(pending);
        session.in_flight.clone_from(&batch);
        batch
    }

    /// Returns ids to purge from the sink.
    fn complete_flight(&mut self, session_id: &SessionId) -> Vec<MessageId> {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return Vec::new();
        };
        session.in_flight.clear();
        let purge = std::mem::take(&mut session.purge_after_flight);
        if session.is_empty() {
            self.sessions.remove(session_id);
        }
        purge
    }

    /// Put a failed batch back in front of anything written meanwhile.
    fn abort_flight(&mut self, session_id: &SessionId) -> usize {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return 0;
        };
        let requeued: HashSet<MessageId> = session.pending.iter().map(|m| m.id.clone()).collect();
        let mut restored: Vec<Message> = std::mem::take(&mut session.in_flight)
            .into_iter()
            .filter(|m| !requeued.contains(&m.id))
            .collect();
        let count = restored.len();
        restored.append(&mut session.pending);
        session.pending = restored;
        self.total += count;
        count
    }
}

/// Settles a flight exactly once. Dropping it unsettled (the flush future
/// was cancelled) returns the batch to the buffer.
struct FlightGuard<'a> {
    state: &'a Mutex<BufferState>,
    session_id: &'a SessionId,
    settled: bool,
}

impl<'a> FlightGuard<'a> {
    fn new(state: &'a Mutex<BufferState>, session_id: &'a SessionId) -> Self {
        Self {
            state,
            session_id,
            settled: false,
        }
    }

    fn abort(mut self) -> usize {
        self.settled = true;
        self.state.lock().abort_flight(self.session_id)
    }

    fn land(mut self) -> Vec<MessageId> {
        self.settled = true;
        self.state.lock().complete_flight(self.session_id)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let restored = self.state.lock().abort_flight(self.session_id);
        tracing::warn!(
            session_id = %self.session_id,
            restored,
            "Flush cancelled; batch returned to buffer"
        );
    }
}

/// Ids awaiting removal from the sink. Requeued on the session unless the
/// purge is confirmed.
struct PurgeGuard<'a> {
    state: &'a Mutex<BufferState>,
    session_id: &'a SessionId,
    ids: Vec<MessageId>,
    confirmed: bool,
}

impl Drop for PurgeGuard<'_> {
    fn drop(&mut self) {
        if self.confirmed || self.ids.is_empty() {
            return;
        }
        self.state
            .lock()
            .sessions
            .entry(self.session_id.clone())
            .or_default()
            .purge_after_flight
            .append(&mut self.ids);
    }
}

pub struct WriteBuffer {
    config: BufferConfig,
    state: Mutex<BufferState>,
    flush_locks: Mutex<HashMap<SessionId, Arc<AsyncMutex<()>>>>,
    sink: Arc<dyn FlushSink>,
    scheduler: FlushScheduler,
    events: EventBus,
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl WriteBuffer {
    #[must_use]
    pub fn new(
        config: BufferConfig,
        sink: Arc<dyn FlushSink>,
        scheduler: FlushScheduler,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(BufferState::default()),
            flush_locks: Mutex::new(HashMap::new()),
            sink,
            scheduler,
            events,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Assign an id and timestamp, buffer the message and return it.
    pub fn write(&self, input: NewMessage) -> Message {
        let (message, requests) = {
            let mut state = self.state.lock();
            let timestamp = state.next_timestamp();
            let message = Message::from_input(input, MessageId::generate(), timestamp);
            state.insert(message.clone());
            let requests = state.flush_requests(&message.session_id, &self.config);
            (message, requests)
        };
        self.events.emit(StoreEvent::Created(message.clone()));
        self.dispatch(requests);
        message
    }

    pub fn write_many(&self, inputs: Vec<NewMessage>) -> Vec<Message> {
        inputs.into_iter().map(|input| self.write(input)).collect()
    }

    /// Buffer messages that already carry an id and timestamp. An id already
    /// pending is replaced.
    pub fn import(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut requests = Vec::new();
        {
            let mut state = self.state.lock();
            for message in &messages {
                state.last_timestamp = state.last_timestamp.max(message.timestamp);
                state.insert(message.clone());
            }
            let sessions: HashSet<&SessionId> = messages.iter().map(|m| &m.session_id).collect();
            for session_id in sessions {
                requests.extend(state.flush_requests(session_id, &self.config));
            }
        }
        for message in messages {
            self.events.emit(StoreEvent::Created(message));
        }
        self.dispatch(requests);
    }

    fn dispatch(&self, requests: Vec<FlushRequest>) {
        for request in requests {
            self.scheduler.schedule(request);
        }
    }

    /// The last `limit` buffered messages of a session, oldest first.
    #[must_use]
    pub fn read(&self, session_id: &SessionId, limit: Option<usize>) -> Vec<Message> {
        let mut messages = match self.state.lock().sessions.get(session_id) {
            Some(session) => session.snapshot(),
            None => return Vec::new(),
        };
        sort_chronologically(&mut messages);
        if let Some(limit) = limit {
            let skip = messages.len().saturating_sub(limit);
            messages.drain(..skip);
        }
        messages
    }

    #[must_use]
    pub fn get(&self, message_id: &MessageId) -> Option<Message> {
        let state = self.state.lock();
        state
            .sessions
            .values()
            .find_map(|session| session.find(message_id).cloned())
    }

    /// Patch a buffered message. `None` when the id is not buffered.
    pub fn update(&self, message_id: &MessageId, patch: MessagePatch) -> Option<Message> {
        let updated = {
            let mut state = self.state.lock();
            let mut added = false;
            let updated = state.sessions.values_mut().find_map(|session| {
                if let Some(slot) = session.pending.iter_mut().find(|m| &m.id == message_id) {
                    *slot = slot.clone().apply_patch(patch.clone());
                    return Some(slot.clone());
                }
                let slot = session.in_flight.iter_mut().find(|m| &m.id == message_id)?;
                // The sink may already hold the old copy; queue the new one.
                *slot = slot.clone().apply_patch(patch.clone());
                let updated = slot.clone();
                session.pending.push(updated.clone());
                added = true;
                Some(updated)
            });
            if added {
                state.total += 1;
            }
            updated
        }?;
        self.events.emit(StoreEvent::Updated(updated.clone()));
        Some(updated)
    }

    /// Returns whether the id was buffered.
    pub fn delete(&self, message_id: &MessageId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let mut removed_pending = false;
            let found = state.sessions.iter_mut().find_map(|(session_id, session)| {
                let mut found = false;
                if let Some(pos) = session.pending.iter().position(|m| &m.id == message_id) {
                    session.pending.remove(pos);
                    removed_pending = true;
                    found = true;
                }
                if let Some(pos) = session.in_flight.iter().position(|m| &m.id == message_id) {
                    session.in_flight.remove(pos);
                    session.purge_after_flight.push(message_id.clone());
                    found = true;
                }
                found.then(|| session_id.clone())
            });
            if removed_pending {
                state.total -= 1;
            }
            found
        };
        match removed {
            Some(session_id) => {
                self.events.emit(StoreEvent::Deleted {
                    session_id,
                    message_id: message_id.clone(),
                });
                true
            }
            None => false,
        }
    }

    fn flush_lock(&self, session_id: &SessionId) -> Arc<AsyncMutex<()>> {
        self.flush_locks
            .lock()
            .entry(session_id.clone())
            .or_default()
            .clone()
    }

    /// Drop the session's flush lock once nothing else holds it and the
    /// session has no buffered state left.
    fn release_flush_lock(&self, session_id: &SessionId, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.flush_locks.lock();
        drop(lock);
        let idle = locks
            .get(session_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1);
        if idle && !self.state.lock().sessions.contains_key(session_id) {
            locks.remove(session_id);
        }
    }

    /// Hand the session's pending messages to the sink. Returns how many were
    /// persisted. An empty session is a no-op that never reaches the sink.
    ///
    /// Cancel safe: dropping the future mid-flush returns the batch to the
    /// buffer.
    pub async fn flush(&self, session_id: &SessionId) -> StoreResult<usize> {
        let lock = self.flush_lock(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.flush_locked(session_id).await
        };
        self.release_flush_lock(session_id, lock);
        result
    }

    async fn flush_locked(&self, session_id: &SessionId) -> StoreResult<usize> {
        let batch = self.state.lock().begin_flight(session_id);
        if batch.is_empty() {
            return Ok(0);
        }
        let flight = FlightGuard::new(&self.state, session_id);

        tracing::debug!(session_id = %session_id, count = batch.len(), "Flushing session");
        if let Err(error) = self.sink.persist(&batch).await {
            let restored = flight.abort();
            tracing::warn!(
                session_id = %session_id,
                restored,
                error = %format!("{error:#}"),
                "Flush failed; batch returned to buffer"
            );
            return Err(StoreError::FlushFailed {
                session_id: session_id.clone(),
                error,
            });
        }

        let mut purge = PurgeGuard {
            state: &self.state,
            session_id,
            ids: flight.land(),
            confirmed: false,
        };
        if !purge.ids.is_empty() {
            let purged = self.sink.purge(&purge.ids).await;
            match purged {
                Ok(()) => purge.confirmed = true,
                Err(error) => tracing::warn!(
                    session_id = %session_id,
                    count = purge.ids.len(),
                    error = %format!("{error:#}"),
                    "Failed to purge messages deleted during flush; will retry"
                ),
            }
        }
        drop(purge);

        let count = batch.len();
        tracing::debug!(session_id = %session_id, count, "Flush complete");
        self.events.emit(StoreEvent::Flushed {
            session_id: session_id.clone(),
            count,
        });
        Ok(count)
    }

    /// Flush every session with pending messages. A failing session does not
    /// stop the others; all failures are reported together.
    pub async fn flush_all(&self) -> StoreResult<usize> {
        let mut flushed = 0;
        let mut failures = Vec::new();
        for session_id in self.pending_sessions() {
            match self.flush(&session_id).await {
                Ok(count) => flushed += count,
                Err(err) => failures.push((session_id, err.to_string())),
            }
        }
        if failures.is_empty() {
            Ok(flushed)
        } else {
            Err(StoreError::FlushAll { failures })
        }
    }

    /// Drop every buffered message of a session without persisting it.
    /// Waits for an in-progress flush of that session first.
    pub async fn clear_session(&self, session_id: &SessionId) -> usize {
        let lock = self.flush_lock(session_id);
        let cleared = {
            let _guard = lock.lock().await;
            let mut state = self.state.lock();
            match state.sessions.remove(session_id) {
                Some(session) => {
                    state.total -= session.pending.len();
                    session.pending.len()
                }
                None => 0,
            }
        };
        self.release_flush_lock(session_id, lock);
        cleared
    }

    /// Sessions with pending messages, in id order.
    #[must_use]
    pub fn pending_sessions(&self) -> Vec<SessionId> {
        let state = self.state.lock();
        let mut sessions: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        sessions.sort();
        sessions
    }

    #[must_use]
    pub fn status(&self) -> BufferStatus {
        let state = self.state.lock();
        let mut status = BufferStatus {
            total_messages: state.total,
            ..BufferStatus::default()
        };
        for session in state.sessions.values() {
            if session.pending.is_empty() && session.in_flight.is_empty() {
                continue;
            }
            status.session_count += 1;
            status.in_flight += session.in_flight.len();
            for message in session.pending.iter().chain(&session.in_flight) {
                let ts = Some(message.timestamp);
                status.oldest_timestamp = status.oldest_timestamp.min(ts).or(ts);
                status.newest_timestamp = status.newest_timestamp.max(ts);
            }
        }
        status
    }
}
