//! Configuration for Quill.
//!
//! Every field has a documented default, so a partial (or absent) config file
//! is always valid. Partial input is parsed into `*Patch` structs and merged
//! over the defaults explicitly with `merged`.

mod context;
mod store;

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub use context::{ContextConfig, ContextConfigPatch, MediaConfig, MediaConfigPatch, StrategyKind};
pub use store::{BufferConfig, BufferConfigPatch, PersistenceConfig, PersistenceConfigPatch};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuillConfig {
    pub buffer: BufferConfig,
    pub persistence: PersistenceConfig,
    pub context: ContextConfig,
    pub media: MediaConfig,
}

/// Partial configuration as it appears on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuillConfigPatch {
    pub buffer: Option<BufferConfigPatch>,
    pub persistence: Option<PersistenceConfigPatch>,
    pub context: Option<ContextConfigPatch>,
    pub media: Option<MediaConfigPatch>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

impl QuillConfig {
    #[must_use]
    pub fn merged(&self, patch: &QuillConfigPatch) -> Self {
        Self {
            buffer: patch
                .buffer
                .as_ref()
                .map_or_else(|| self.buffer.clone(), |p| self.buffer.merged(p)),
            persistence: patch
                .persistence
                .as_ref()
                .map_or_else(|| self.persistence.clone(), |p| self.persistence.merged(p)),
            context: patch
                .context
                .as_ref()
                .map_or_else(|| self.context.clone(), |p| self.context.merged(p)),
            media: patch
                .media
                .as_ref()
                .map_or_else(|| self.media.clone(), |p| self.media.merged(p)),
        }
    }

    /// Parse TOML text and merge it over the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let patch: QuillConfigPatch = toml::from_str(content)?;
        Ok(Self::default().merged(&patch))
    }

    /// Load the config at `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file; using defaults");
            return Ok(Self::default());
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::from_toml_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Load `~/.quill/config.toml`, or the defaults when there is no home
    /// directory or no file.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".quill").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_types::Role;

    #[test]
    fn parse_empty_config() {
        let config = QuillConfig::from_toml_str("").unwrap();
        assert_eq!(config, QuillConfig::default());
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
            [buffer]
            flush_threshold = 5

            [context]
            strategy = "summary"
            important_roles = ["system", "tool"]
            summary_threshold = 12

            [media]
            lookback_limit = 3
        "#;
        let config = QuillConfig::from_toml_str(toml_str).unwrap();

        assert_eq!(config.buffer.flush_threshold, 5);
        assert_eq!(config.buffer.max_total_messages, 500);
        assert_eq!(config.context.strategy, StrategyKind::Summary);
        assert_eq!(config.context.important_roles, vec![Role::System, Role::Tool]);
        assert_eq!(config.context.summary_threshold, 12);
        assert_eq!(config.context.top_k, 5);
        assert_eq!(config.media.lookback_limit, 3);
        assert!(config.media.history_lookback);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(QuillConfig::from_toml_str("[buffer]\nflush_treshold = 5\n").is_err());
    }

    #[test]
    fn load_from_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = QuillConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, QuillConfig::default());
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[context]\nstrategy = \"telepathy\"\n").unwrap();

        let err = QuillConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), &path);
    }

    #[test]
    fn config_errors_name_the_file_and_keep_the_cause() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[buffer\n").unwrap();

        let err = QuillConfig::load_from(&path).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("failed to parse config "), "{text}");
        assert!(text.contains(&path.display().to_string()), "{text}");
        let source = std::error::Error::source(&err).expect("parse error kept as source");
        assert!(source.downcast_ref::<toml::de::Error>().is_some());
    }

    #[test]
    fn load_from_reads_database_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[persistence]\ndatabase_path = \"/tmp/q.db\"\n").unwrap();

        let config = QuillConfig::load_from(&path).unwrap();
        assert_eq!(
            config.persistence.database_path.as_deref(),
            Some(Path::new("/tmp/q.db"))
        );
    }
}
