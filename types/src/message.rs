//! Core message domain model.
//!
//! A `Message` is immutable once persisted; edits go through `MessagePatch`,
//! which produces a new value that replaces the stored one wholesale.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{MessageId, SessionId};
use crate::time::Timestamp;
use crate::tool::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

/// A media attachment carried by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Generation prompt, for media produced by a model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl MediaItem {
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Image,
            url: url.into(),
            mime_type: None,
            prompt: None,
        }
    }

    pub fn video(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Video,
            url: url.into(),
            mime_type: None,
            prompt: None,
        }
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn is_image(&self) -> bool {
        self.kind == MediaKind::Image
    }
}

/// Free-form metadata. The well-known fields are typed; anything else lands
/// in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMetadata {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.token_count.is_none()
            && self.finish_reason.is_none()
            && self.latency_ms.is_none()
            && self.extra.is_empty()
    }

    /// Overlay `other` on top of `self`. Set fields in `other` win.
    pub fn merge(&mut self, other: MessageMetadata) {
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.token_count.is_some() {
            self.token_count = other.token_count;
        }
        if other.finish_reason.is_some() {
            self.finish_reason = other.finish_reason;
        }
        if other.latency_ms.is_some() {
            self.latency_ms = other.latency_ms;
        }
        self.extra.extend(other.extra);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub timestamp: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "MessageMetadata::is_empty")]
    pub metadata: MessageMetadata,
}

impl Message {
    /// Materialize a message from caller input with an assigned id and time.
    #[must_use]
    pub fn from_input(input: NewMessage, id: MessageId, timestamp: Timestamp) -> Self {
        Self {
            id,
            session_id: input.session_id,
            role: input.role,
            content: input.content,
            timestamp,
            tool_call_id: input.tool_call_id,
            tool_calls: input.tool_calls,
            media: input.media,
            thinking: input.thinking,
            metadata: input.metadata,
        }
    }

    /// Total order within a session: timestamp first, id as tie-break.
    #[must_use]
    pub fn order_key(&self) -> (Timestamp, &MessageId) {
        (self.timestamp, &self.id)
    }

    #[must_use]
    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    #[must_use]
    pub fn image_count(&self) -> usize {
        self.media.iter().filter(|m| m.is_image()).count()
    }

    #[must_use]
    pub fn apply_patch(mut self, patch: MessagePatch) -> Self {
        if let Some(content) = patch.content {
            self.content = content;
        }
        if let Some(thinking) = patch.thinking {
            self.thinking = Some(thinking);
        }
        if let Some(media) = patch.media {
            self.media = media;
        }
        if let Some(tool_calls) = patch.tool_calls {
            self.tool_calls = tool_calls;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata.merge(metadata);
        }
        self
    }
}

/// Sort messages chronologically with the id tie-break.
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
}

/// Input for a buffer write. Id and timestamp are assigned by the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub media: Vec<MediaItem>,
    pub thinking: Option<String>,
    pub metadata: MessageMetadata,
}

impl NewMessage {
    pub fn new(session_id: SessionId, role: Role, content: impl Into<String>) -> Self {
        Self {
            session_id,
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            media: Vec::new(),
            thinking: None,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn user(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::User, content)
    }

    pub fn assistant(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::Assistant, content)
    }

    pub fn system(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, Role::System, content)
    }

    #[must_use]
    pub fn with_media(mut self, media: Vec<MediaItem>) -> Self {
        self.media = media;
        self
    }

    #[must_use]
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    #[must_use]
    pub fn with_tool_call_id(mut self, tool_call_id: impl Into<String>) -> Self {
        self.tool_call_id = Some(tool_call_id.into());
        self
    }

    #[must_use]
    pub fn with_thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Partial update. `None` fields are left untouched; metadata is merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub thinking: Option<String>,
    pub media: Option<Vec<MediaItem>>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub metadata: Option<MessageMetadata>,
}

impl MessagePatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}
