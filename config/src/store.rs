use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Per-session buffered count that schedules a flush of that session.
    pub flush_threshold: usize,
    /// Global buffered count above which the least recently active session
    /// is evicted (force-flushed).
    pub max_total_messages: usize,
    /// Period of the background flush loop.
    pub flush_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 20,
            max_total_messages: 500,
            flush_interval_ms: 2_000,
        }
    }
}

impl BufferConfig {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    #[must_use]
    pub fn merged(&self, patch: &BufferConfigPatch) -> Self {
        Self {
            flush_threshold: patch.flush_threshold.unwrap_or(self.flush_threshold).max(1),
            max_total_messages: patch
                .max_total_messages
                .unwrap_or(self.max_total_messages)
                .max(1),
            flush_interval_ms: patch.flush_interval_ms.unwrap_or(self.flush_interval_ms),
        }
    }
}

/// ```toml
/// [buffer]
/// flush_threshold = 20
/// max_total_messages = 500
/// flush_interval_ms = 2000
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfigPatch {
    pub flush_threshold: Option<usize>,
    pub max_total_messages: Option<usize>,
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Messages per transaction when draining the buffer, and rows per
    /// chunk when deleting a whole session.
    pub batch_size: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Down-jitter applied to each backoff delay (0.25 = up to 25% shorter).
    pub jitter_factor: f64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            batch_size: 50,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 5_000,
            jitter_factor: 0.25,
        }
    }
}

impl PersistenceConfig {
    /// Defaults with no database file, for tests and ephemeral sessions.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            database_path: None,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    #[must_use]
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    #[must_use]
    pub fn merged(&self, patch: &PersistenceConfigPatch) -> Self {
        Self {
            database_path: patch
                .database_path
                .clone()
                .or_else(|| self.database_path.clone()),
            batch_size: patch.batch_size.unwrap_or(self.batch_size).max(1),
            max_retries: patch.max_retries.unwrap_or(self.max_retries),
            initial_retry_delay_ms: patch
                .initial_retry_delay_ms
                .unwrap_or(self.initial_retry_delay_ms),
            max_retry_delay_ms: patch.max_retry_delay_ms.unwrap_or(self.max_retry_delay_ms),
            jitter_factor: patch
                .jitter_factor
                .unwrap_or(self.jitter_factor)
                .clamp(0.0, 1.0),
        }
    }
}

/// ```toml
/// [persistence]
/// database_path = "/home/me/.local/share/quill/messages.db"
/// batch_size = 50
/// max_retries = 3
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfigPatch {
    pub database_path: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub initial_retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
    pub jitter_factor: Option<f64>,
}

fn default_database_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("quill").join("messages.db"))
}
