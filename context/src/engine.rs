//! Context construction.
//!
//! [`ContextEngine::build_context`] turns a session's full history and the
//! message about to be sent into the list actually sent to the model:
//!
//! 1. Budget: `max_tokens` minus the response reservation, the system prompt
//!    and tool descriptions. The new message is paid for first.
//! 2. Selection: the configured [`SelectionStrategy`] picks history within
//!    what is left.
//! 3. Media: image attachments beyond `max_images` are stripped, oldest first.
//!    Text is never removed at this stage.
//! 4. Accounting: final usage and how much was truncated, summarized or
//!    retrieved.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use quill_config::{ContextConfig, ContextConfigPatch, StrategyKind};
use quill_types::{Message, SessionId, ToolDefinition, sort_chronologically};

use crate::budget::TokenBudget;
use crate::embedding::{Embedder, EmbeddingCache};
use crate::strategy::{
    HybridStrategy, RagStrategy, SelectionRequest, SelectionStrategy, SlidingWindowStrategy,
    SummaryStrategy,
};
use crate::summarization::Summarizer;
use crate::token_counter::{HeuristicEstimator, TokenEstimator};

/// Per-call inputs to [`ContextEngine::build_context`].
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub max_tokens: u32,
    pub reserved_for_response: u32,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    /// Overrides layered on the engine's configuration for this call only.
    pub config: Option<ContextConfigPatch>,
}

impl ContextOptions {
    #[must_use]
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }

    pub fn reserved_for_response(mut self, tokens: u32) -> Self {
        self.reserved_for_response = tokens;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn config(mut self, patch: ContextConfigPatch) -> Self {
        self.config = Some(patch);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub system_prompt: u32,
    pub tools: u32,
    pub messages: u32,
    pub total: u32,
}

impl TokenUsage {
    /// Share of `cap` in use, 0.0 to 100.0 (can exceed 100 if the new
    /// message alone does not fit).
    #[must_use]
    pub fn percentage_of(&self, cap: u32) -> f32 {
        if cap == 0 {
            0.0
        } else {
            (self.total as f32 / cap as f32) * 100.0
        }
    }

    /// Compact form for status lines: "2.1k / 200.0k (1%)".
    #[must_use]
    pub fn format_compact(&self, cap: u32) -> String {
        fn format_k(n: u32) -> String {
            if n >= 1_000_000 {
                format!("{:.1}M", n as f32 / 1_000_000.0)
            } else if n >= 1000 {
                format!("{:.1}k", n as f32 / 1000.0)
            } else {
                n.to_string()
            }
        }

        format!(
            "{} / {} ({:.0}%)",
            format_k(self.total),
            format_k(cap),
            self.percentage_of(cap)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContextMetadata {
    pub strategy: StrategyKind,
    /// History messages neither kept nor summarized.
    pub truncated: usize,
    pub summarized: usize,
    pub retrieved: usize,
    pub images_removed: usize,
}

#[derive(Debug, Clone)]
pub struct ContextResult {
    /// Chronological; the new message is last.
    pub messages: Vec<Message>,
    pub usage: TokenUsage,
    pub budget: TokenBudget,
    pub metadata: ContextMetadata,
}

/// Builds token-budgeted model context.
///
/// Construct once and share. The embedding cache lives as long as the engine
/// and is shared by every build.
pub struct ContextEngine {
    config: ContextConfig,
    estimator: Option<Arc<dyn TokenEstimator>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Arc<EmbeddingCache>,
    /// Registered strategies; kinds without an entry use the built-in one.
    strategies: HashMap<StrategyKind, Arc<dyn SelectionStrategy>>,
}

impl std::fmt::Debug for ContextEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut registered: Vec<&str> = self.strategies.keys().map(|k| k.as_str()).collect();
        registered.sort_unstable();
        f.debug_struct("ContextEngine")
            .field("config", &self.config)
            .field("summarizer", &self.summarizer.is_some())
            .field("embedder", &self.embedder.is_some())
            .field("cached_embeddings", &self.cache.len())
            .field("registered", &registered)
            .finish_non_exhaustive()
    }
}

impl Default for ContextEngine {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl ContextEngine {
    #[must_use]
    pub fn new(config: ContextConfig) -> Self {
        let cache = Arc::new(EmbeddingCache::new(
            config.embedding_cache_size,
            config.embedding_key_chars,
        ));
        Self {
            config,
            estimator: None,
            summarizer: None,
            embedder: None,
            cache,
            strategies: HashMap::new(),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Replace the heuristic estimator derived from configuration.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Install `strategy` for its [`SelectionStrategy::kind`], replacing any
    /// earlier registration or the built-in one.
    pub fn register(mut self, strategy: Arc<dyn SelectionStrategy>) -> Self {
        self.strategies.insert(strategy.kind(), strategy);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[must_use]
    pub fn embedding_cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    fn strategy(&self, kind: StrategyKind) -> Arc<dyn SelectionStrategy> {
        if let Some(strategy) = self.strategies.get(&kind) {
            return Arc::clone(strategy);
        }
        match kind {
            StrategyKind::SlidingWindow => Arc::new(SlidingWindowStrategy),
            StrategyKind::Summary => Arc::new(SummaryStrategy::new(self.summarizer.clone())),
            StrategyKind::Rag => Arc::new(RagStrategy::new(
                self.embedder.clone(),
                Arc::clone(&self.cache),
            )),
            StrategyKind::Hybrid => Arc::new(HybridStrategy::new(
                self.summarizer.clone(),
                self.embedder.clone(),
                Arc::clone(&self.cache),
            )),
        }
    }

    /// Select the messages to send for `new_message`.
    ///
    /// `history` may be in any order and may already contain `new_message`;
    /// it is sorted and deduplicated by id here, the later copy winning.
    /// Never fails: collaborator failures degrade the selection instead.
    pub async fn build_context(
        &self,
        session_id: &SessionId,
        new_message: &Message,
        history: &[Message],
        options: &ContextOptions,
    ) -> ContextResult {
        let config = match &options.config {
            Some(patch) => self.config.merged(patch),
            None => self.config.clone(),
        };
        let heuristic;
        let estimator: &dyn TokenEstimator = match &self.estimator {
            Some(estimator) => estimator.as_ref(),
            None => {
                heuristic = HeuristicEstimator::from_config(&config);
                &heuristic
            }
        };

        let system_tokens = options
            .system_prompt
            .as_deref()
            .filter(|prompt| !prompt.is_empty())
            .map_or(0, |prompt| {
                estimator
                    .overheads()
                    .message
                    .saturating_add(estimator.count_str(prompt))
            });
        let tool_tokens = estimator.count_tools(&options.tools);
        let budget = TokenBudget::compute(
            options.max_tokens,
            options.reserved_for_response,
            system_tokens,
            tool_tokens,
        );

        let new_message_tokens = estimator.count_message(new_message);
        if new_message_tokens > budget.available {
            tracing::warn!(
                session_id = %session_id,
                new_message_tokens,
                available = budget.available,
                "New message alone exceeds the context budget"
            );
        }
        let limit = budget.available.saturating_sub(new_message_tokens);

        let mut seen = HashSet::from([&new_message.id]);
        let mut ordered: Vec<Message> = history
            .iter()
            .rev()
            .filter(|m| seen.insert(&m.id))
            .cloned()
            .collect();
        sort_chronologically(&mut ordered);

        let strategy = self.strategy(config.strategy);
        let selection = strategy
            .select(SelectionRequest {
                history: &ordered,
                query: new_message,
                limit,
                config: &config,
                estimator,
            })
            .await;

        let kept_from_history = selection
            .messages
            .len()
            .saturating_sub(usize::from(selection.summarized > 0));
        let truncated = ordered
            .len()
            .saturating_sub(kept_from_history + selection.summarized);

        let mut messages = selection.messages;
        messages.push(new_message.clone());
        let images_removed = optimize_media(&mut messages, config.max_images);

        let message_tokens = estimator.count_messages(&messages);
        let usage = TokenUsage {
            system_prompt: system_tokens,
            tools: tool_tokens,
            messages: message_tokens,
            total: system_tokens
                .saturating_add(tool_tokens)
                .saturating_add(message_tokens),
        };
        let metadata = ContextMetadata {
            strategy: config.strategy,
            truncated,
            summarized: selection.summarized,
            retrieved: selection.retrieved,
            images_removed,
        };
        tracing::debug!(
            session_id = %session_id,
            strategy = config.strategy.as_str(),
            messages = messages.len(),
            total_tokens = usage.total,
            cap = budget.input_cap(),
            truncated,
            summarized = metadata.summarized,
            retrieved = metadata.retrieved,
            images_removed,
            "Built context"
        );

        ContextResult {
            messages,
            usage,
            budget,
            metadata,
        }
    }
}

/// Keep at most `max_images` image attachments, newest first; return how
/// many were stripped. Other media kinds and all text are left alone.
pub fn optimize_media(messages: &mut [Message], max_images: usize) -> usize {
    let mut kept = 0usize;
    let mut removed = 0usize;
    for message in messages.iter_mut().rev() {
        if !message.media.iter().any(quill_types::MediaItem::is_image) {
            continue;
        }
        let mut media = std::mem::take(&mut message.media);
        // Newest attachment within a message is last.
        media.reverse();
        media.retain(|item| {
            if !item.is_image() {
                return true;
            }
            if kept < max_images {
                kept += 1;
                true
            } else {
                removed += 1;
                false
            }
        });
        media.reverse();
        message.media = media;
    }
    removed
}
