//! Error types for the log pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Contract violations on the `LogSource` accessors.
///
/// These indicate a caller bug and are never retried. Lines that are simply
/// no longer present are reported as `None`, not as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("line index {index} is out of range (count {count})")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("section [{index}, {index}+{len}) exceeds line count {count}")]
    SectionOutOfRange {
        index: usize,
        len: usize,
        count: usize,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while loading a `PipelineConfig`
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors raised while building a filter
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
