//! Observability snapshots. Recomputed on demand, never cached.

use serde::Serialize;

use crate::time::Timestamp;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStatus {
    pub session_count: usize,
    pub total_messages: usize,
    pub oldest_timestamp: Option<Timestamp>,
    pub newest_timestamp: Option<Timestamp>,
    /// Messages handed to a flush that has not completed yet.
    pub in_flight: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistStatus {
    /// Messages waiting to be persisted (buffered plus in flight).
    pub pending: usize,
    pub last_flush: Option<Timestamp>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub initialized: bool,
    pub buffer: BufferStatus,
    pub persistence: PersistStatus,
}
