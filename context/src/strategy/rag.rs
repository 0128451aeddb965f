use std::collections::HashSet;
use std::sync::Arc;

use quill_config::{ContextConfig, StrategyKind};
use quill_types::{Message, MessageId};

use super::{
    Partition, Selection, SelectionRequest, SelectionStrategy, StrategyFut, assemble,
    fit_newest_first, sliding_window,
};
use crate::embedding::{Embedder, EmbeddingCache, cosine_similarity};

/// Retrieval-augmented selection.
///
/// The newest `recent_count` non-important messages are always candidates.
/// From the older pool, the `top_k` messages most similar to the new message
/// (at or above `min_similarity`) join them. Without an embedder, with an
/// empty pool, or when the query cannot be embedded, this is the sliding
/// window.
#[derive(Clone)]
pub struct RagStrategy {
    embedder: Option<Arc<dyn Embedder>>,
    cache: Arc<EmbeddingCache>,
}

impl RagStrategy {
    #[must_use]
    pub fn new(embedder: Option<Arc<dyn Embedder>>, cache: Arc<EmbeddingCache>) -> Self {
        Self { embedder, cache }
    }
}

impl SelectionStrategy for RagStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rag
    }

    fn select<'a>(&'a self, request: SelectionRequest<'a>) -> StrategyFut<'a> {
        Box::pin(async move {
            let Some(embedder) = self.embedder.as_deref() else {
                return sliding_window(&request);
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
                return sliding_window(&request);
            };

            let (admitted, _) = fit_newest_first(
                &merge_chronological(&retrieved, tail),
                partition.remaining(request.limit),
                request.estimator,
            );
            let retrieved = count_retrieved(&retrieved, &admitted);
            Selection {
                messages: assemble(partition.important.iter().copied().chain(admitted)),
                summarized: 0,
                retrieved,
            }
        })
    }
}

/// Rank `pool` against the query and keep the best `top_k` above the floor.
/// `None` when the query itself cannot be embedded.
///
/// Ties on score go to the newer message, so the result does not depend on
/// iteration order.
pub(crate) async fn retrieve<'a>(
    embedder: &dyn Embedder,
    cache: &EmbeddingCache,
    query: &Message,
    pool: &[&'a Message],
    config: &ContextConfig,
) -> Option<Vec<&'a Message>> {
    if query.content.trim().is_empty() {
        tracing::debug!("Query has no text to embed; retrieval skipped");
        return None;
    }
    let query_embedding = match cache.get_or_embed(embedder, &query.content).await {
        Ok(embedding) => embedding,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "Query embedding failed; falling back to sliding window");
            return None;
        }
    };

    let mut scored: Vec<(f32, &'a Message)> = Vec::new();
    let mut failures = 0usize;
    for &message in pool {
        if message.content.trim().is_empty() {
            continue;
        }
        match cache.get_or_embed(embedder, &message.content).await {
            Ok(embedding) => {
                let score = cosine_similarity(&query_embedding, &embedding);
                if score >= config.min_similarity {
                    scored.push((score, message));
                }
            }
            Err(_) => failures += 1,
        }
    }
    if failures > 0 {
        tracing::warn!(failures, pool = pool.len(), "Some history embeddings failed; those messages were not ranked");
    }

    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .total_cmp(score_a)
            .then_with(|| b.order_key().cmp(&a.order_key()))
    });
    scored.truncate(config.top_k);
    tracing::debug!(retrieved = scored.len(), pool = pool.len(), "Retrieved similar messages");
    Some(scored.into_iter().map(|(_, message)| message).collect())
}

pub(crate) fn merge_chronological<'a>(retrieved: &[&'a Message], tail: &[&'a Message]) -> Vec<&'a Message> {
    let mut merged: Vec<&Message> = retrieved.iter().chain(tail).copied().collect();
    merged.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    merged
}

pub(crate) fn count_retrieved(retrieved: &[&Message], admitted: &[&Message]) -> usize {
    let retrieved: HashSet<&MessageId> = retrieved.iter().map(|m| &m.id).collect();
    admitted.iter().filter(|m| retrieved.contains(&m.id)).count()
}
