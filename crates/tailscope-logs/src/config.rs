//! Pipeline configuration loaded from TOML

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Default idle wait for a stage, in milliseconds
const DEFAULT_MAXIMUM_WAIT_MS: u64 = 100;

/// Default number of upstream lines a stage consumes per tick
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Default batch threshold for consumer listeners
const DEFAULT_LISTENER_BATCH: usize = 1_000;

/// Tuning for one derived stage (filter or merge)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    /// How long an idle stage sleeps before polling again
    pub maximum_wait_ms: u64,

    /// Upper bound on lines fetched from upstream in one tick
    pub batch_size: usize,
}

impl StageOptions {
    pub fn maximum_wait(&self) -> Duration {
        Duration::from_millis(self.maximum_wait_ms)
    }

    pub fn with_maximum_wait(mut self, wait: Duration) -> Self {
        self.maximum_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            maximum_wait_ms: DEFAULT_MAXIMUM_WAIT_MS,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Batching policy for a consumer registering on a stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerPolicy {
    pub maximum_wait_ms: u64,
    pub maximum_batch: usize,
}

impl ListenerPolicy {
    pub fn maximum_wait(&self) -> Duration {
        Duration::from_millis(self.maximum_wait_ms)
    }
}

impl Default for ListenerPolicy {
    fn default() -> Self {
        Self {
            maximum_wait_ms: DEFAULT_MAXIMUM_WAIT_MS,
            maximum_batch: DEFAULT_LISTENER_BATCH,
        }
    }
}

/// Top-level configuration file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub filter: StageOptions,
    pub merge: StageOptions,
    pub listener: ListenerPolicy,
}

impl PipelineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filter.batch_size == 0 {
            return Err(ConfigError::Invalid("filter.batch_size must be at least 1".into()));
        }
        if self.merge.batch_size == 0 {
            return Err(ConfigError::Invalid("merge.batch_size must be at least 1".into()));
        }
        if self.listener.maximum_batch == 0 {
            return Err(ConfigError::Invalid(
                "listener.maximum_batch must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.filter.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.filter.maximum_wait(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_document() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [filter]
            batch_size = 64

            [listener]
            maximum_wait_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.filter.batch_size, 64);
        assert_eq!(config.filter.maximum_wait_ms, DEFAULT_MAXIMUM_WAIT_MS);
        assert_eq!(config.listener.maximum_wait(), Duration::ZERO);
        assert_eq!(config.listener.maximum_batch, DEFAULT_LISTENER_BATCH);
    }

    #[test]
    fn test_zero_batch_rejected() {
        let err = PipelineConfig::from_toml_str("[merge]\nbatch_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_document() {
        let err = PipelineConfig::from_toml_str("[filter\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[filter]\nmaximum_wait_ms = 5").unwrap();
        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.filter.maximum_wait(), Duration::from_millis(5));
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
