use quill_config::StrategyKind;

use super::{SelectionRequest, SelectionStrategy, StrategyFut, sliding_window};

/// Important messages plus as many of the newest `window_size` other
/// messages as fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingWindowStrategy;

impl SelectionStrategy for SlidingWindowStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SlidingWindow
    }

    fn select<'a>(&'a self, request: SelectionRequest<'a>) -> StrategyFut<'a> {
        let selection = sliding_window(&request);
        Box::pin(async move { selection })
    }
}
