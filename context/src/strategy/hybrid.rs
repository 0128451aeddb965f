use std::collections::HashSet;
use std::sync::Arc;

use quill_config::StrategyKind;
use quill_types::{Message, MessageId};

use super::rag::{count_retrieved, merge_chronological, retrieve};
use super::summary::summarize_run;
use super::{
    Partition, RagStrategy, Selection, SelectionRequest, SelectionStrategy, StrategyFut,
    SummaryStrategy, assemble, fit_newest_first, sliding_window,
};
use crate::embedding::{Embedder, EmbeddingCache};
use crate::summarization::Summarizer;

/// Retrieval plus summarization.
///
/// Candidates are the recent tail and the retrieved messages, as in
/// [`RagStrategy`]. Whatever history is left out is summarized into the
/// `summary_reserve_tokens` reserve. Without an embedder this is the summary
/// strategy; without a summarizer it is the RAG strategy.
#[derive(Clone)]
pub struct HybridStrategy {
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Option<Arc<dyn Embedder>>,
    cache: Arc<EmbeddingCache>,
}

impl HybridStrategy {
    #[must_use]
    pub fn new(
        summarizer: Option<Arc<dyn Summarizer>>,
        embedder: Option<Arc<dyn Embedder>>,
        cache: Arc<EmbeddingCache>,
    ) -> Self {
        Self {
            summarizer,
            embedder,
            cache,
        }
    }
}

impl SelectionStrategy for HybridStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    fn select<'a>(&'a self, request: SelectionRequest<'a>) -> StrategyFut<'a> {
        Box::pin(async move {
            let Some(embedder) = self.embedder.as_deref() else {
                return SummaryStrategy::new(self.summarizer.clone())
                    .select(request)
                    .await;
            };
            let Some(summarizer) = self.summarizer.as_deref() else {
                return RagStrategy::new(self.embedder.clone(), Arc::clone(&self.cache))
                    .select(request)
                    .await;
            };

            let partition = Partition::new(&request);
            let tail_start = partition
                .others
                .len()
                .saturating_sub(request.config.recent_count);
            let (pool, tail) = partition.others.split_at(tail_start);
            if pool.is_empty() {
                return sliding_window(&request);
            }
            let Some(retrieved) =
                retrieve(embedder, &self.cache, request.query, pool, request.config).await
            else {
                return SummaryStrategy::new(self.summarizer.clone())
                    .select(request)
                    .await;
            };

            let remaining = partition.remaining(request.limit);
            let reserve = request.config.summary_reserve_tokens.min(remaining);
            let (admitted, used) = fit_newest_first(
                &merge_chronological(&retrieved, tail),
                remaining - reserve,
                request.estimator,
            );

            let kept: HashSet<&MessageId> = admitted.iter().map(|m| &m.id).collect();
            let left_out: Vec<Message> = partition
                .others
                .iter()
                .filter(|m| !kept.contains(&m.id))
                .map(|m| (*m).clone())
                .collect();
            let summary = summarize_run(
                Some(summarizer),
                &left_out,
                &request.query.session_id,
                reserve,
                remaining - used,
                request.estimator,
            )
            .await;

            let summarized = if summary.is_some() { left_out.len() } else { 0 };
            let retrieved = count_retrieved(&retrieved, &admitted);
            let mut messages = assemble(partition.important.iter().copied().chain(admitted));
            messages.extend(summary);
            quill_types::sort_chronologically(&mut messages);
            Selection {
                messages,
                summarized,
                retrieved,
            }
        })
    }
}
