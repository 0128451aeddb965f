use serde::{Deserialize, Serialize};

use quill_types::Role;

/// Which selection algorithm builds the context window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    SlidingWindow,
    Summary,
    Rag,
    Hybrid,
}

impl StrategyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SlidingWindow => "sliding_window",
            Self::Summary => "summary",
            Self::Rag => "rag",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    pub strategy: StrategyKind,
    /// Roles kept regardless of budget pressure (best effort).
    pub important_roles: Vec<Role>,
    /// Upper bound on non-important messages considered by the sliding window.
    pub window_size: usize,
    /// Non-system message count above which the summary strategy compresses.
    pub summary_threshold: usize,
    /// Tokens set aside for the synthetic summary message.
    pub summary_reserve_tokens: u32,
    /// Size of the verbatim tail kept by retrieval strategies.
    pub recent_count: usize,
    pub top_k: usize,
    pub min_similarity: f32,
    pub embedding_cache_size: usize,
    /// Characters of message text used as the embedding cache key.
    pub embedding_key_chars: usize,
    /// Image attachments retained across the whole context; older ones are
    /// stripped first.
    pub max_images: usize,
    pub media_token_estimate: u32,
    pub chars_per_token: u32,
    pub message_overhead_tokens: u32,
    pub tool_call_overhead_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::SlidingWindow,
            important_roles: vec![Role::System],
            window_size: 50,
            summary_threshold: 30,
            summary_reserve_tokens: 1_024,
            recent_count: 10,
            top_k: 5,
            min_similarity: 0.7,
            embedding_cache_size: 1_000,
            embedding_key_chars: 500,
            max_images: 4,
            media_token_estimate: 1_000,
            chars_per_token: 3,
            message_overhead_tokens: 4,
            tool_call_overhead_tokens: 10,
        }
    }
}

impl ContextConfig {
    #[must_use]
    pub fn is_important(&self, role: Role) -> bool {
        self.important_roles.contains(&role)
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn merged(&self, patch: &ContextConfigPatch) -> Self {
        Self {
            strategy: patch.strategy.unwrap_or(self.strategy),
            important_roles: patch
                .important_roles
                .clone()
                .unwrap_or_else(|| self.important_roles.clone()),
            window_size: patch.window_size.unwrap_or(self.window_size),
            summary_threshold: patch.summary_threshold.unwrap_or(self.summary_threshold),
            summary_reserve_tokens: patch
                .summary_reserve_tokens
                .unwrap_or(self.summary_reserve_tokens),
            recent_count: patch.recent_count.unwrap_or(self.recent_count),
            top_k: patch.top_k.unwrap_or(self.top_k),
            min_similarity: patch.min_similarity.unwrap_or(self.min_similarity),
            embedding_cache_size: patch
                .embedding_cache_size
                .unwrap_or(self.embedding_cache_size)
                .max(1),
            embedding_key_chars: patch
                .embedding_key_chars
                .unwrap_or(self.embedding_key_chars)
                .max(1),
            max_images: patch.max_images.unwrap_or(self.max_images),
            media_token_estimate: patch
                .media_token_estimate
                .unwrap_or(self.media_token_estimate),
            chars_per_token: patch.chars_per_token.unwrap_or(self.chars_per_token).max(1),
            message_overhead_tokens: patch
                .message_overhead_tokens
                .unwrap_or(self.message_overhead_tokens),
            tool_call_overhead_tokens: patch
                .tool_call_overhead_tokens
                .unwrap_or(self.tool_call_overhead_tokens),
        }
    }
}

/// Partial context configuration. Anything left unset keeps its default.
///
/// ```toml
/// [context]
/// strategy = "rag"
/// top_k = 8
/// min_similarity = 0.6
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfigPatch {
    pub strategy: Option<StrategyKind>,
    pub important_roles: Option<Vec<Role>>,
    pub window_size: Option<usize>,
    pub summary_threshold: Option<usize>,
    pub summary_reserve_tokens: Option<u32>,
    pub recent_count: Option<usize>,
    pub top_k: Option<usize>,
    pub min_similarity: Option<f32>,
    pub embedding_cache_size: Option<usize>,
    pub embedding_key_chars: Option<usize>,
    pub max_images: Option<usize>,
    pub media_token_estimate: Option<u32>,
    pub chars_per_token: Option<u32>,
    pub message_overhead_tokens: Option<u32>,
    pub tool_call_overhead_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    /// Look at prior media messages to detect iterations.
    pub history_lookback: bool,
    /// How many recent media-bearing messages to fetch.
    pub lookback_limit: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            history_lookback: true,
            lookback_limit: 5,
        }
    }
}

impl MediaConfig {
    #[must_use]
    pub fn merged(&self, patch: &MediaConfigPatch) -> Self {
        Self {
            history_lookback: patch.history_lookback.unwrap_or(self.history_lookback),
            lookback_limit: patch.lookback_limit.unwrap_or(self.lookback_limit),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaConfigPatch {
    pub history_lookback: Option<bool>,
    pub lookback_limit: Option<usize>,
}
