//! Pluggable history selection.
//!
//! Every strategy receives the full, chronologically sorted history and a
//! token limit for it, and returns the messages to keep. Strategies never
//! fail: a missing or failing collaborator (summarizer, embedder) degrades to
//! sliding-window behavior.
//!
//! Shared rules:
//! - Important roles are kept first. When they alone exceed the limit the
//!   oldest are dropped until they fit.
//! - Other messages are admitted newest first and admission stops at the
//!   first message that would overflow. No message is split.
//! - Output is chronological.

mod hybrid;
mod rag;
mod sliding_window;
mod summary;

use std::future::Future;
use std::pin::Pin;

use quill_config::{ContextConfig, StrategyKind};
use quill_types::{Message, sort_chronologically};

use crate::token_counter::TokenEstimator;

pub use hybrid::HybridStrategy;
pub use rag::RagStrategy;
pub use sliding_window::SlidingWindowStrategy;
pub use summary::SummaryStrategy;

pub type StrategyFut<'a> = Pin<Box<dyn Future<Output = Selection> + Send + 'a>>;

pub trait SelectionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn select<'a>(&'a self, request: SelectionRequest<'a>) -> StrategyFut<'a>;
}

#[derive(Clone, Copy)]
pub struct SelectionRequest<'a> {
    /// Chronological, without the new message.
    pub history: &'a [Message],
    /// The message being sent; retrieval strategies rank history against it.
    pub query: &'a Message,
    /// Tokens available to selected history.
    pub limit: u32,
    pub config: &'a ContextConfig,
    pub estimator: &'a dyn TokenEstimator,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    /// Chronological. May contain one synthetic summary message.
    pub messages: Vec<Message>,
    /// History messages replaced by a summary.
    pub summarized: usize,
    /// Messages admitted because of semantic similarity.
    pub retrieved: usize,
}

/// Important messages that fit, plus the rest of history, both chronological.
pub(crate) struct Partition<'a> {
    pub important: Vec<&'a Message>,
    pub important_tokens: u32,
    pub others: Vec<&'a Message>,
}

impl<'a> Partition<'a> {
    pub fn new(request: &SelectionRequest<'a>) -> Self {
        let (important, others): (Vec<&Message>, Vec<&Message>) = request
            .history
            .iter()
            .partition(|m| request.config.is_important(m.role));
        let (important, important_tokens) = fit_important(important, request.limit, request.estimator);
        Self {
            important,
            important_tokens,
            others,
        }
    }

    /// Budget left once important messages are paid for.
    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.important_tokens)
    }
}

/// Keep important messages, dropping the oldest while they exceed `limit`.
fn fit_important<'a>(
    mut important: Vec<&'a Message>,
    limit: u32,
    estimator: &dyn TokenEstimator,
) -> (Vec<&'a Message>, u32) {
    let mut costs: Vec<u32> = important.iter().map(|m| estimator.count_message(m)).collect();
    let mut total = costs.iter().fold(0u32, |acc, c| acc.saturating_add(*c));
    let mut dropped = 0usize;
    while total > limit && !important.is_empty() {
        total -= costs.remove(0);
        important.remove(0);
        dropped += 1;
    }
    if dropped > 0 {
        tracing::warn!(dropped, limit, "Important messages exceed the budget; oldest dropped");
    }
    (important, total)
}

/// Admit candidates newest first until the first one that does not fit.
/// Returns the admitted messages chronologically and their cost.
pub(crate) fn fit_newest_first<'a>(
    candidates: &[&'a Message],
    limit: u32,
    estimator: &dyn TokenEstimator,
) -> (Vec<&'a Message>, u32) {
    let mut used = 0u32;
    let mut admitted = Vec::new();
    for message in candidates.iter().rev() {
        let cost = estimator.count_message(message);
        match used.checked_add(cost) {
            Some(total) if total <= limit => {
                used = total;
                admitted.push(*message);
            }
            _ => break,
        }
    }
    admitted.reverse();
    (admitted, used)
}

/// Merge and sort selected references into owned, chronological output.
pub(crate) fn assemble<'a>(parts: impl IntoIterator<Item = &'a Message>) -> Vec<Message> {
    let mut messages: Vec<Message> = parts.into_iter().cloned().collect();
    sort_chronologically(&mut messages);
    messages
}

/// The sliding-window selection. Also the fallback of every other strategy.
pub(crate) fn sliding_window(request: &SelectionRequest<'_>) -> Selection {
    let partition = Partition::new(request);
    let window_start = partition.others.len().saturating_sub(request.config.window_size);
    let window = &partition.others[window_start..];
    let (recent, _) = fit_newest_first(window, partition.remaining(request.limit), request.estimator);
    Selection {
        messages: assemble(partition.important.iter().copied().chain(recent)),
        summarized: 0,
        retrieved: 0,
    }
}
