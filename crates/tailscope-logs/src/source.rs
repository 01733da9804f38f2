//! The capability set shared by every stage of the pipeline.
//!
//! Leaf sources and derived stages implement the same trait, so a consumer
//! never needs to know whether it reads raw lines or the output of several
//! chained transforms.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use tailscope_types::{LogLine, Section};

use crate::error::{PipelineError, Result};
use crate::listener::LogSourceListener;

/// A sequence of log lines that can grow, shrink at the tail, or be reset.
///
/// Index arguments out of range are a caller bug and fail with
/// `PipelineError`. Index *mappings* never fail: `None` means the line is
/// not (or no longer) present in the other view.
pub trait LogSource: Send + Sync {
    /// Number of lines in this view
    fn count(&self) -> usize;

    /// Number of lines in the upstream view this one was derived from
    fn original_count(&self) -> usize;

    /// Length of the longest line seen so far, in characters
    fn max_characters_per_line(&self) -> usize;

    /// Latched once this view has consumed everything its upstream offers
    fn end_of_source_reached(&self) -> bool;

    /// Fraction of the upstream consumed, in `0.0..=1.0`
    fn progress(&self) -> f64;

    fn start_timestamp(&self) -> Option<DateTime<Utc>>;

    fn last_modified(&self) -> Option<DateTime<Utc>>;

    /// Size of the underlying data in bytes
    fn size(&self) -> u64;

    fn get_line(&self, index: usize) -> Result<LogLine>;

    /// Append the lines of `section` to `dest`
    fn get_section(&self, section: Section, dest: &mut Vec<LogLine>) -> Result<()>;

    /// Map an index of this view to the upstream index space
    fn get_original_index_from(&self, index: usize) -> Option<usize>;

    /// Append the upstream index of every line in `section` to `dest`
    fn get_original_indices_from(&self, section: Section, dest: &mut Vec<Option<usize>>);

    /// Append the upstream index of every line in `indices` to `dest`
    fn get_original_indices_of(&self, indices: &[usize], dest: &mut Vec<Option<usize>>);

    /// Reverse lookup: where does upstream line `original_index` appear here?
    fn get_log_line_index_of_original_line_index(&self, original_index: usize) -> Option<usize>;

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        maximum_wait: Duration,
        maximum_batch: usize,
    );

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) -> bool;
}

/// Reject a section that reaches past `count` lines
pub(crate) fn check_section(section: Section, count: usize) -> Result<()> {
    if section.checked_end().is_none_or(|end| end > count) {
        return Err(PipelineError::SectionOutOfRange {
            index: section.index,
            len: section.count,
            count,
        });
    }
    Ok(())
}

/// Reject an index at or past `count`
pub(crate) fn check_index(index: usize, count: usize) -> Result<()> {
    if index >= count {
        return Err(PipelineError::IndexOutOfRange { index, count });
    }
    Ok(())
}

/// `numerator / denominator`, clamped to `0.0..=1.0`; an empty denominator
/// counts as complete
pub(crate) fn saturate_ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 1.0;
    }
    (numerator as f64 / denominator as f64).clamp(0.0, 1.0)
}
