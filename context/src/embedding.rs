//! Embedding callback seam and the process-wide embedding cache.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

pub type EmbeddingFut<'a> = Pin<Box<dyn Future<Output = anyhow::Result<Vec<f32>>> + Send + 'a>>;

/// Turns text into a vector. Supplied by the application; may fail.
pub trait Embedder: Send + Sync {
    fn embed<'a>(&'a self, text: &'a str) -> EmbeddingFut<'a>;
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, Arc<[f32]>>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

/// Bounded embedding cache keyed by a hash of the text's leading characters.
/// Full: the oldest entry is evicted first.
#[derive(Debug)]
pub struct EmbeddingCache {
    capacity: usize,
    key_chars: usize,
    inner: Mutex<CacheInner>,
}

impl EmbeddingCache {
    #[must_use]
    pub fn new(capacity: usize, key_chars: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            key_chars: key_chars.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    fn key(&self, text: &str) -> String {
        let prefix: String = text.chars().take(self.key_chars).collect();
        let digest = Sha256::digest(prefix.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, text: &str) -> Option<Arc<[f32]>> {
        let key = self.key(text);
        self.inner.lock().entries.get(&key).cloned()
    }

    pub fn insert(&self, text: &str, embedding: Arc<[f32]>) {
        let key = self.key(text);
        let mut inner = self.inner.lock();
        if inner.entries.insert(key.clone(), embedding).is_some() {
            return;
        }
        inner.order.push_back(key);
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Cached embedding, or compute and cache it. The lock is not held while
    /// the embedder runs, so two callers may embed the same text once each.
    pub async fn get_or_embed(&self, embedder: &dyn Embedder, text: &str) -> anyhow::Result<Arc<[f32]>> {
        if let Some(hit) = self.get(text) {
            return Ok(hit);
        }
        let embedding: Arc<[f32]> = embedder.embed(text).await?.into();
        self.insert(text, Arc::clone(&embedding));
        Ok(embedding)
    }
}

/// Cosine similarity in `[-1, 1]`. Mismatched lengths or a zero vector give 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
