use std::sync::Arc;

use quill_config::StrategyKind;
use quill_types::{Message, SessionId};

use super::{
    Partition, Selection, SelectionRequest, SelectionStrategy, StrategyFut, assemble,
    fit_newest_first, sliding_window,
};
use crate::summarization::{Summarizer, summary_message};
use crate::token_counter::TokenEstimator;

/// Sliding window below `summary_threshold`; above it, the messages that do
/// not fit the recent tail are compressed into one system message.
///
/// `summary_reserve_tokens` is held back from the tail for the summary. The
/// reserve is kept even when no summary materializes.
#[derive(Clone, Default)]
pub struct SummaryStrategy {
    summarizer: Option<Arc<dyn Summarizer>>,
}

impl SummaryStrategy {
    #[must_use]
    pub fn new(summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        Self { summarizer }
    }
}

impl SelectionStrategy for SummaryStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Summary
    }

    fn select<'a>(&'a self, request: SelectionRequest<'a>) -> StrategyFut<'a> {
        Box::pin(async move {
            let partition = Partition::new(&request);
            if partition.others.len() <= request.config.summary_threshold {
                return sliding_window(&request);
            }

            let remaining = partition.remaining(request.limit);
            let reserve = request.config.summary_reserve_tokens.min(remaining);
            let window_start = partition
                .others
                .len()
                .saturating_sub(request.config.window_size);
            let (tail, tail_tokens) = fit_newest_first(
                &partition.others[window_start..],
                remaining - reserve,
                request.estimator,
            );
            let head: Vec<Message> = partition.others[..partition.others.len() - tail.len()]
                .iter()
                .map(|m| (*m).clone())
                .collect();

            let summary = summarize_run(
                self.summarizer.as_deref(),
                &head,
                &request.query.session_id,
                reserve,
                remaining - tail_tokens,
                request.estimator,
            )
            .await;

            let summarized = if summary.is_some() { head.len() } else { 0 };
            let mut messages = assemble(partition.important.iter().copied().chain(tail));
            messages.extend(summary);
            quill_types::sort_chronologically(&mut messages);
            Selection {
                messages,
                summarized,
                retrieved: 0,
            }
        })
    }
}

/// Summarize `replaced` into a message costing at most `room` tokens.
/// `None` on any failure; the caller proceeds without a summary.
pub(crate) async fn summarize_run(
    summarizer: Option<&dyn Summarizer>,
    replaced: &[Message],
    session_id: &SessionId,
    target_tokens: u32,
    room: u32,
    estimator: &dyn TokenEstimator,
) -> Option<Message> {
    if replaced.is_empty() {
        return None;
    }
    let Some(summarizer) = summarizer else {
        tracing::debug!(count = replaced.len(), "No summarizer configured; older messages omitted");
        return None;
    };
    if room == 0 || target_tokens == 0 {
        tracing::debug!(count = replaced.len(), "No room for a summary; older messages omitted");
        return None;
    }

    match summarizer.summarize(replaced, target_tokens).await {
        Ok(text) if text.trim().is_empty() => {
            tracing::warn!(count = replaced.len(), "Summarizer returned empty text; summary omitted");
            None
        }
        Ok(text) => {
            let message = summary_message(session_id, replaced, &text)?;
            let cost = estimator.count_message(&message);
            if cost > room {
                tracing::warn!(cost, room, "Summary exceeds its budget; omitted");
                return None;
            }
            tracing::debug!(session_id = %session_id, summarized = replaced.len(), cost, "Summarized older messages");
            Some(message)
        }
        Err(err) => {
            tracing::warn!(
                session_id = %session_id,
                count = replaced.len(),
                error = %format!("{err:#}"),
                "Summarization failed; continuing without summary"
            );
            None
        }
    }
}
