//! Incremental log pipeline for tailscope
//!
//! A pipeline is a chain of log sources: a leaf source holding raw lines,
//! followed by derived stages (filtering, merging) that each expose the same
//! `LogSource` contract. Derived stages process their upstream incrementally
//! on periodic tasks and publish appends, tail invalidations and resets to
//! their own listeners.

mod config;
mod error;
mod filter;
mod filtered;
mod listener;
mod memory;
mod merged;
mod parser;
mod scheduler;
mod source;

pub use config::{DEFAULT_BATCH_SIZE, ListenerPolicy, PipelineConfig, StageOptions};
pub use error::{ConfigError, FilterError, PipelineError, Result};
pub use filter::{
    AndFilter, EntryFilter, LevelFilter, LineFilter, NoFilter, NoThrowFilter, RegexFilter,
    WildcardFilter,
};
pub use filtered::FilteredLogSource;
pub use listener::{ChannelListener, ListenerCollection, LogSourceListener};
pub use memory::InMemoryLogSource;
pub use merged::MergedLogSource;
pub use parser::{LogParser, ParsedLine};
pub use scheduler::{
    ManualTaskScheduler, PeriodicTask, TaskFn, TaskScheduler, TokioTaskScheduler,
};
pub use source::LogSource;

// Re-export types used in our public API
pub use tailscope_types::{LogLevel, LogLine, LogLineMatch, Modification, Section};
pub use tokio_util::sync::CancellationToken;
