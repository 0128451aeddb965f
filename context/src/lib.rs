//! Token-budgeted context construction and media-iteration detection.
//!
//! This crate provides:
//! - Heuristic and tiktoken-backed token estimation behind one trait
//! - Budget arithmetic for system prompt, tools and response reservation
//! - Pluggable history selection: sliding window, summary, RAG and hybrid
//! - A process-wide embedding cache
//! - Media generation context (fresh request vs iteration on earlier output)
//!
//! # Architecture
//!
//! ```text
//! ContextEngine
//! ├── config: ContextConfig (per-call patches merged on top)
//! ├── estimator: TokenEstimator (HeuristicEstimator unless replaced)
//! ├── strategies: StrategyKind -> SelectionStrategy
//! │   ├── SlidingWindowStrategy
//! │   ├── SummaryStrategy ──── Summarizer (caller supplied)
//! │   ├── RagStrategy ──────── Embedder (caller supplied) + EmbeddingCache
//! │   └── HybridStrategy ───── both
//! └── optimize_media (image cap)
//!
//! MediaContext
//! └── history: MediaHistorySource (e.g. the message store)
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

mod budget;
mod embedding;
mod engine;
mod media;
mod strategy;
mod summarization;
mod token_counter;

pub use budget::TokenBudget;
pub use embedding::{Embedder, EmbeddingCache, EmbeddingFut, cosine_similarity};
pub use engine::{
    ContextEngine, ContextMetadata, ContextOptions, ContextResult, TokenUsage, optimize_media,
};
pub use media::{
    HistoryContext, MediaContext, MediaGenerationContext, MediaGenerationKind, MediaHistoryFut,
    MediaHistorySource, MediaOutput, MediaRequest, extract_keywords, get_last_media_from_chain,
    is_iteration_prompt,
};
pub use strategy::{
    HybridStrategy, RagStrategy, Selection, SelectionRequest, SelectionStrategy,
    SlidingWindowStrategy, StrategyFut, SummaryStrategy,
};
pub use summarization::{
    SUMMARY_PREFIX, Summarizer, SummaryFut, build_summarization_prompt, summary_message,
};
pub use token_counter::{HeuristicEstimator, Overheads, TiktokenEstimator, TokenEstimator};
