//! Core domain types for Quill.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod ids;
mod message;
mod query;
mod status;
mod time;
mod tool;

use thiserror::Error;

pub use ids::{MessageId, SessionId};
pub use message::{
    MediaItem, MediaKind, Message, MessageMetadata, MessagePatch, NewMessage, Role,
    sort_chronologically,
};
pub use query::{MessagePage, MessageQuery};
pub use status::{BufferStatus, PersistStatus, StoreStatus};
pub use time::Timestamp;
pub use tool::{ToolCall, ToolDefinition};

#[derive(Debug, Error)]
#[error("identifier must not be empty")]
pub struct EmptyStringError;
