//! Two-tier message storage.
//!
//! # Architecture
//!
//! ```text
//! MessageStore (façade, merge-on-read)
//! ├── buffer: WriteBuffer (sync, in-memory, per-session pending lists)
//! │   ├── scheduler: FlushScheduler ──▶ flush worker task (threshold, eviction, interval)
//! │   └── events: EventBus (created / updated / deleted / flushed)
//! └── persistence: AsyncPersistence (SQLite on the blocking pool, retry with backoff)
//!
//! MessageManager (remote adapter)
//! └── imports remote pages into MessageStore, keeping remote ids
//! ```
//!
//! Writes never wait on I/O. A message lives in the buffer until a flush
//! persists it; reads merge both tiers with the buffered copy winning.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod buffer;
mod error;
mod events;
mod flush_worker;
mod manager;
mod persistence;
mod retry;
mod sqlite_util;
mod store;

pub use buffer::{FlushFut, FlushSink, WriteBuffer};
pub use error::{StoreError, StoreResult};
pub use events::{EventBus, StoreEvent};
pub use flush_worker::{FlushReason, FlushRequest, FlushScheduler};
pub use manager::{BackendFut, MessageManager, RemoteBackend, RemotePage};
pub use persistence::AsyncPersistence;
pub use retry::{RetryPolicy, calculate_retry_delay, retry_with_backoff};
pub use store::MessageStore;
