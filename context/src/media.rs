//! Media generation context.
//!
//! Before an image or video generation request, [`MediaContext`] looks at the
//! session's recent media-bearing messages and classifies the request:
//!
//! - **Iteration**: no explicit reference media, a recent assistant message
//!   carries generated media, and the prompt uses an iteration keyword
//!   ("make it", "change", "再", "改", ...). The related chain is attached and
//!   the newest generated item is surfaced for reuse.
//! - **Related**: otherwise, recent media messages sharing at least one
//!   keyword with the prompt are attached as loose context.
//! - **Fresh**: nothing attached.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use unicode_segmentation::UnicodeSegmentation;

use quill_config::MediaConfig;
use quill_types::{MediaItem, Message, MessageId, Role, SessionId};

pub type MediaHistoryFut<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<Vec<Message>>> + Send + 'a>>;

/// Supplies a session's recent media-bearing messages.
pub trait MediaHistorySource: Send + Sync {
    /// The newest `limit` messages carrying media, oldest first.
    fn recent_media_messages<'a>(
        &'a self,
        session_id: &'a SessionId,
        limit: usize,
    ) -> MediaHistoryFut<'a>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaOutput {
    #[default]
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaGenerationKind {
    TextToImage,
    ImageToImage,
    TextToVideo,
    ImageToVideo,
}

impl MediaGenerationKind {
    #[must_use]
    pub fn infer(has_reference: bool, output: MediaOutput) -> Self {
        match (has_reference, output) {
            (false, MediaOutput::Image) => Self::TextToImage,
            (true, MediaOutput::Image) => Self::ImageToImage,
            (false, MediaOutput::Video) => Self::TextToVideo,
            (true, MediaOutput::Video) => Self::ImageToVideo,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaRequest {
    pub session_id: SessionId,
    pub prompt: String,
    /// Media the caller attached explicitly. Always wins over history.
    pub reference_media: Vec<MediaItem>,
    pub output: MediaOutput,
}

impl MediaRequest {
    pub fn new(session_id: SessionId, prompt: impl Into<String>, output: MediaOutput) -> Self {
        Self {
            session_id,
            prompt: prompt.into(),
            reference_media: Vec::new(),
            output,
        }
    }

    #[must_use]
    pub fn with_reference(mut self, media: Vec<MediaItem>) -> Self {
        self.reference_media = media;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryContext {
    /// The request modifies earlier generated media.
    Iteration {
        /// Ids of the recent media messages, oldest first.
        chain: Vec<MessageId>,
        messages: Vec<Message>,
        /// Newest assistant-generated item in the chain.
        last_media: Option<MediaItem>,
    },
    /// Unrelated request that shares keywords with earlier media messages.
    Related { messages: Vec<Message> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaGenerationContext {
    pub kind: MediaGenerationKind,
    pub prompt: String,
    pub reference_media: Vec<MediaItem>,
    /// `None` for a fresh request.
    pub history: Option<HistoryContext>,
}

impl MediaGenerationContext {
    #[must_use]
    pub fn is_iteration(&self) -> bool {
        matches!(self.history, Some(HistoryContext::Iteration { .. }))
    }
}

pub struct MediaContext {
    config: MediaConfig,
    history: Option<Arc<dyn MediaHistorySource>>,
}

impl std::fmt::Debug for MediaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaContext")
            .field("config", &self.config)
            .field("history", &self.history.as_ref().map(|_| "<source>"))
            .finish()
    }
}

impl MediaContext {
    #[must_use]
    pub fn new(config: MediaConfig) -> Self {
        Self {
            config,
            history: None,
        }
    }

    #[must_use]
    pub fn with_history(mut self, source: Arc<dyn MediaHistorySource>) -> Self {
        self.history = Some(source);
        self
    }

    /// Classify `request`. History lookup failures degrade to a fresh request.
    pub async fn build(&self, request: &MediaRequest) -> MediaGenerationContext {
        let kind = MediaGenerationKind::infer(!request.reference_media.is_empty(), request.output);
        let history = self.history_context(request).await;
        tracing::debug!(
            session_id = %request.session_id,
            ?kind,
            iteration = matches!(history, Some(HistoryContext::Iteration { .. })),
            "Built media generation context"
        );
        MediaGenerationContext {
            kind,
            prompt: request.prompt.clone(),
            reference_media: request.reference_media.clone(),
            history,
        }
    }

    async fn history_context(&self, request: &MediaRequest) -> Option<HistoryContext> {
        if !self.config.history_lookback || self.config.lookback_limit == 0 {
            return None;
        }
        let source = self.history.as_ref()?;
        let recent = match source
            .recent_media_messages(&request.session_id, self.config.lookback_limit)
            .await
        {
            Ok(recent) => recent,
            Err(err) => {
                tracing::warn!(
                    session_id = %request.session_id,
                    error = %format!("{err:#}"),
                    "Media history unavailable; treating request as fresh"
                );
                return None;
            }
        };
        if recent.is_empty() {
            return None;
        }

        let has_reference_image = request.reference_media.iter().any(MediaItem::is_image);
        let has_generated = recent
            .iter()
            .any(|m| m.role == Role::Assistant && m.has_media());
        if !has_reference_image && has_generated && is_iteration_prompt(&request.prompt) {
            let last_media = get_last_media_from_chain(&recent).cloned();
            return Some(HistoryContext::Iteration {
                chain: recent.iter().map(|m| m.id.clone()).collect(),
                messages: recent,
                last_media,
            });
        }

        let keywords = extract_keywords(&request.prompt);
        if keywords.is_empty() {
            return None;
        }
        let related: Vec<Message> = recent
            .into_iter()
            .filter(|m| shares_keyword(m, &keywords))
            .collect();
        (!related.is_empty()).then_some(HistoryContext::Related { messages: related })
    }
}

/// The first media item of the newest assistant message that has any.
#[must_use]
pub fn get_last_media_from_chain(chain: &[Message]) -> Option<&MediaItem> {
    chain
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant && m.has_media())
        .and_then(|m| m.media.first())
}

const ITERATION_KEYWORDS: &[&str] = &[
    "make it", "change", "adjust", "keep", "modify", "tweak", "edit", "again", "instead", "more",
    "less", "same", "another", "variation", "version", "redo", "remake", "再", "改", "换", "调整",
    "修改", "保持", "继续", "重新", "变成", "更",
];

static KEYWORD_MATCHER: OnceLock<Option<AhoCorasick>> = OnceLock::new();

fn keyword_matcher() -> Option<&'static AhoCorasick> {
    KEYWORD_MATCHER
        .get_or_init(|| {
            match AhoCorasickBuilder::new()
                .match_kind(MatchKind::Standard)
                .ascii_case_insensitive(true)
                .build(ITERATION_KEYWORDS)
            {
                Ok(ac) => Some(ac),
                Err(e) => {
                    tracing::warn!("Iteration keyword automaton build failed; using substring scan ({e})");
                    None
                }
            }
        })
        .as_ref()
}

/// Whether `prompt` contains an iteration keyword. ASCII keywords must sit on
/// word boundaries ("more" does not match "moreover"); CJK keywords match
/// anywhere.
#[must_use]
pub fn is_iteration_prompt(prompt: &str) -> bool {
    match keyword_matcher() {
        Some(ac) => ac
            .find_overlapping_iter(prompt)
            .any(|m| keyword_on_boundary(prompt, ITERATION_KEYWORDS[m.pattern().as_usize()], m.start(), m.end())),
        None => {
            let lowered = prompt.to_lowercase();
            ITERATION_KEYWORDS.iter().any(|keyword| {
                lowered
                    .match_indices(keyword)
                    .any(|(start, _)| keyword_on_boundary(&lowered, keyword, start, start + keyword.len()))
            })
        }
    }
}

fn keyword_on_boundary(text: &str, keyword: &str, start: usize, end: usize) -> bool {
    if !keyword.is_ascii() {
        return true;
    }
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

const ENGLISH_STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "to", "in", "on", "at", "for", "with", "and", "or", "is", "are", "be",
    "it", "this", "that", "me", "my", "i", "you", "please", "can", "could", "would", "draw",
    "generate", "make", "create", "image", "picture", "photo", "video", "some", "from", "into",
];

const CHINESE_STOPWORDS: &[&str] = &[
    "的", "了", "是", "一", "个", "张", "只", "画", "请", "我", "把", "给", "在", "和",
];

/// Lowercased content words of `text`. Stopwords and single ASCII letters
/// are dropped.
#[must_use]
pub fn extract_keywords(text: &str) -> HashSet<String> {
    text.unicode_words()
        .flat_map(split_cjk)
        .map(str::to_lowercase)
        .filter(|word| {
            !ENGLISH_STOPWORDS.contains(&word.as_str())
                && !CHINESE_STOPWORDS.contains(&word.as_str())
                && !(word.len() == 1 && word.is_ascii())
        })
        .collect()
}

/// Word segmentation yields CJK runs one ideograph at a time already; other
/// scripts pass through whole.
fn split_cjk(word: &str) -> Vec<&str> {
    if word.chars().all(|c| c.is_ascii() || !is_cjk(c)) {
        return vec![word];
    }
    word.char_indices()
        .map(|(i, c)| &word[i..i + c.len_utf8()])
        .collect()
}

fn is_cjk(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}' | '\u{F900}'..='\u{FAFF}')
}

fn shares_keyword(message: &Message, keywords: &HashSet<String>) -> bool {
    let mut words = extract_keywords(&message.content);
    for item in &message.media {
        if let Some(prompt) = &item.prompt {
            words.extend(extract_keywords(prompt));
        }
    }
    !words.is_disjoint(keywords)
}
