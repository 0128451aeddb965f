//! Token estimation.
//!
//! Strategies only ever see the [`TokenEstimator`] trait, so the counting
//! method can be swapped without touching selection logic.
//!
//! - [`HeuristicEstimator`]: roughly one token per three characters, plus fixed
//!   overheads per message, tool call and media item. Cheap and deliberately
//!   pessimistic for English prose.
//! - [`TiktokenEstimator`]: exact text counts from the `o200k_base` encoding,
//!   with the same structural overheads. Other providers' tokenizers differ
//!   from it by a few percent.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, o200k_base};

use quill_config::ContextConfig;
use quill_types::{Message, ToolDefinition};

/// Fixed costs added on top of text counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overheads {
    /// Role marker and message delimiters.
    pub message: u32,
    pub tool_call: u32,
    pub media_item: u32,
}

impl Overheads {
    #[must_use]
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            message: config.message_overhead_tokens,
            tool_call: config.tool_call_overhead_tokens,
            media_item: config.media_token_estimate,
        }
    }
}

impl Default for Overheads {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

pub trait TokenEstimator: Send + Sync {
    fn count_str(&self, text: &str) -> u32;

    fn overheads(&self) -> Overheads;

    /// Content, tool calls and media. Thinking text is not sent back to the
    /// model and is not counted.
    fn count_message(&self, message: &Message) -> u32 {
        let overheads = self.overheads();
        let mut tokens = overheads.message.saturating_add(self.count_str(&message.content));
        if let Some(id) = &message.tool_call_id {
            tokens = tokens.saturating_add(self.count_str(id));
        }
        for call in &message.tool_calls {
            let args = serde_json::to_string(&call.arguments).unwrap_or_default();
            tokens = tokens
                .saturating_add(overheads.tool_call)
                .saturating_add(self.count_str(&call.name))
                .saturating_add(self.count_str(&args));
        }
        let media = u32::try_from(message.media.len()).unwrap_or(u32::MAX);
        tokens.saturating_add(overheads.media_item.saturating_mul(media))
    }

    fn count_messages(&self, messages: &[Message]) -> u32 {
        messages
            .iter()
            .fold(0u32, |acc, m| acc.saturating_add(self.count_message(m)))
    }

    fn count_tools(&self, tools: &[ToolDefinition]) -> u32 {
        let overhead = self.overheads().tool_call;
        tools.iter().fold(0u32, |acc, tool| {
            let schema = serde_json::to_string(&tool.parameters).unwrap_or_default();
            acc.saturating_add(overhead)
                .saturating_add(self.count_str(&tool.name))
                .saturating_add(self.count_str(&tool.description))
                .saturating_add(self.count_str(&schema))
        })
    }
}

/// Character-ratio estimate. Counts Unicode scalar values, not bytes, so CJK
/// text is not overcounted threefold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeuristicEstimator {
    chars_per_token: u32,
    overheads: Overheads,
}

impl HeuristicEstimator {
    #[must_use]
    pub fn new(chars_per_token: u32, overheads: Overheads) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
            overheads,
        }
    }

    #[must_use]
    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.chars_per_token, Overheads::from_config(config))
    }
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn count_str(&self, text: &str) -> u32 {
        let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
        chars.div_ceil(self.chars_per_token)
    }

    fn overheads(&self) -> Overheads {
        self.overheads
    }
}

/// The encoder loads its vocabulary on first use; share one per process.
static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| o200k_base().ok()).as_ref()
}

#[derive(Clone, Copy)]
pub struct TiktokenEstimator {
    encoder: Option<&'static CoreBPE>,
    overheads: Overheads,
}

impl std::fmt::Debug for TiktokenEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenEstimator")
            .field("encoder", &self.encoder.as_ref().map(|_| "<CoreBPE>"))
            .field("overheads", &self.overheads)
            .finish()
    }
}

impl TiktokenEstimator {
    #[must_use]
    pub fn new(overheads: Overheads) -> Self {
        let encoder = get_encoder();
        if encoder.is_none() {
            tracing::error!(
                "Failed to initialize tiktoken o200k_base encoder. Falling back to byte-length estimates."
            );
        }
        Self { encoder, overheads }
    }
}

impl Default for TiktokenEstimator {
    fn default() -> Self {
        Self::new(Overheads::default())
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn count_str(&self, text: &str) -> u32 {
        let len = match self.encoder {
            Some(encoder) => encoder.encode_ordinary(text).len(),
            None => text.len(),
        };
        u32::try_from(len).unwrap_or(u32::MAX)
    }

    fn overheads(&self) -> Overheads {
        self.overheads
    }
}

#[cfg(test)]
mod tests {
    use quill_types::{MediaItem, MessageId, NewMessage, SessionId, Timestamp, ToolCall};
    use serde_json::json;

    use super::*;

    fn message(input: NewMessage) -> Message {
        Message::from_input(input, MessageId::from_raw("m"), Timestamp::EPOCH)
    }

    fn session() -> SessionId {
        SessionId::new("s").unwrap()
    }

    #[test]
    fn heuristic_rounds_up_per_three_chars() {
        let estimator = HeuristicEstimator::default();
        assert_eq!(estimator.count_str(""), 0);
        assert_eq!(estimator.count_str("ab"), 1);
        assert_eq!(estimator.count_str("abcdef"), 2);
        assert_eq!(estimator.count_str("abcdefg"), 3);
    }

    #[test]
    fn heuristic_counts_chars_not_bytes() {
        let estimator = HeuristicEstimator::default();
        assert_eq!(estimator.count_str("猫猫猫"), 1);
    }

    #[test]
    fn message_adds_fixed_overheads() {
        let estimator = HeuristicEstimator::new(
            3,
            Overheads {
                message: 4,
                tool_call: 10,
                media_item: 100,
            },
        );
        let plain = message(NewMessage::user(session(), "abcdef"));
        assert_eq!(estimator.count_message(&plain), 4 + 2);

        let with_media = message(
            NewMessage::user(session(), "abcdef").with_media(vec![
                MediaItem::image("https://a"),
                MediaItem::image("https://b"),
            ]),
        );
        assert_eq!(estimator.count_message(&with_media), 4 + 2 + 200);

        let with_call = message(NewMessage::assistant(session(), "").with_tool_calls(vec![
            ToolCall::new("c1", "abc", json!({})),
        ]));
        // "{}" is one token at three chars per token.
        assert_eq!(estimator.count_message(&with_call), 4 + 10 + 1 + 1);
    }

    #[test]
    fn thinking_is_not_counted() {
        let estimator = HeuristicEstimator::default();
        let plain = message(NewMessage::assistant(session(), "answer"));
        let thoughtful =
            message(NewMessage::assistant(session(), "answer").with_thinking("long reasoning"));
        assert_eq!(estimator.count_message(&plain), estimator.count_message(&thoughtful));
    }

    #[test]
    fn tools_cost_includes_schema() {
        let estimator = HeuristicEstimator::default();
        let bare = ToolDefinition::new("search", "Search", json!({}));
        let rich = ToolDefinition::new(
            "search",
            "Search",
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        );
        assert!(estimator.count_tools(&[rich]) > estimator.count_tools(&[bare]));
        assert_eq!(estimator.count_tools(&[]), 0);
    }

    #[test]
    fn tiktoken_counts_are_consistent() {
        let estimator = TiktokenEstimator::default();
        let text = "The quick brown fox jumps over the lazy dog.";
        let tokens = estimator.count_str(text);
        assert!((5..=20).contains(&tokens));
        assert_eq!(tokens, estimator.count_str(text));
        assert_eq!(estimator.count_str(""), 0);
    }

    #[test]
    fn estimators_are_interchangeable() {
        let estimators: [&dyn TokenEstimator; 2] =
            [&HeuristicEstimator::default(), &TiktokenEstimator::default()];
        let msg = message(NewMessage::user(session(), "Hello there"));
        for estimator in estimators {
            assert!(estimator.count_message(&msg) > estimator.overheads().message);
        }
    }
}
