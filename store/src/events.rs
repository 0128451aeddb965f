//! Store change notifications.
//!
//! Emitted on buffer write, on update/delete, and on successful flush.
//! Subscribers get an independent `broadcast` receiver; a subscriber that
//! falls behind loses the oldest events rather than slowing writers.

use tokio::sync::broadcast;

use quill_types::{Message, MessageId, SessionId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Created(Message),
    Updated(Message),
    Deleted {
        session_id: SessionId,
        message_id: MessageId,
    },
    Flushed {
        session_id: SessionId,
        count: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    /// Never blocks. Having no subscribers is not an error.
    pub fn emit(&self, event: StoreEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
