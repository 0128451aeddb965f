//! Conversation summarization seam.
//!
//! The engine never talks to a model itself: the application supplies a
//! [`Summarizer`]. [`build_summarization_prompt`] is offered to
//! implementations that want the standard instruction and transcript layout.

use std::fmt::Write;
use std::future::Future;
use std::pin::Pin;

use quill_types::{Message, MessageId, Role, SessionId};

/// Marks the synthetic message that replaces summarized history.
pub const SUMMARY_PREFIX: &str = "[Summary of earlier conversation]";

pub type SummaryFut<'a> = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;

/// Compresses a run of messages into prose. May fail; the engine then omits
/// the summary for that build.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(&'a self, messages: &'a [Message], target_tokens: u32) -> SummaryFut<'a>;
}

/// Build a summarization prompt for a slice of messages.
///
/// Returns `(system_instruction, conversation_text)`. The instruction asks the
/// model to preserve key facts, decisions and open questions in chronological
/// order and to stay under `target_tokens`.
#[must_use]
pub fn build_summarization_prompt(messages: &[Message], target_tokens: u32) -> (String, String) {
    let system_instruction = format!(
        r#"You are a conversation summarizer. Your task is to create a concise summary of the following conversation.

REQUIREMENTS:
1. Preserve all key facts, decisions, and important context
2. Maintain the chronological flow of topics discussed
3. Keep the summary under approximately {target_tokens} tokens
4. Use clear, direct language
5. Mention any images or videos that were generated or shared, with their prompts
6. Note any unresolved questions or pending actions
7. Format as a coherent narrative, not bullet points

OUTPUT FORMAT:
Write the summary as a continuous narrative that captures the essence of the conversation. Start directly with the content - do not include preamble like "This conversation..." or "Summary:"."#
    );

    let mut conversation_text = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        let _ = write!(conversation_text, "[{}] {role}: {}", message.id, message.content);
        for call in &message.tool_calls {
            let _ = write!(
                conversation_text,
                "\n  (Tool Call: {} {})",
                call.name,
                serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".to_string())
            );
        }
        for item in &message.media {
            let _ = write!(conversation_text, "\n  ({:?}", item.kind);
            if let Some(prompt) = &item.prompt {
                let _ = write!(conversation_text, ": {prompt}");
            }
            conversation_text.push(')');
        }
        conversation_text.push_str("\n\n");
    }

    (system_instruction, conversation_text)
}

/// Wrap summary text as a system message standing in for `replaced`.
///
/// It takes the timestamp of the oldest replaced message so chronological
/// sorting puts it where the summarized run began.
#[must_use]
pub fn summary_message(session_id: &SessionId, replaced: &[Message], text: &str) -> Option<Message> {
    let first = replaced.first()?;
    let mut message = first.clone();
    message.id = MessageId::from_raw(format!("summary:{}", first.id));
    message.session_id = session_id.clone();
    message.role = Role::System;
    message.content = format!("{SUMMARY_PREFIX}\n{}", text.trim());
    message.tool_call_id = None;
    message.tool_calls.clear();
    message.media.clear();
    message.thinking = None;
    message.metadata = quill_types::MessageMetadata::default();
    Some(message)
}
