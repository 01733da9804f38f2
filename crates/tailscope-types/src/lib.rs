//! Shared types for tailscope
//!
//! This crate contains the values that flow through the log pipeline: lines,
//! severity levels, and the section descriptors used both for bulk reads and
//! for change notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    /// Parse log level from common formats
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" | "trc" | "trce" => Self::Trace,
            "debug" | "dbg" | "debg" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Short display string (3 chars)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRC",
            Self::Debug => "DBG",
            Self::Info => "INF",
            Self::Warn => "WRN",
            Self::Error => "ERR",
            Self::Fatal => "FTL",
            Self::Unknown => "???",
        }
    }

    /// Ordinal for severity comparison; unknown ranks with info
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info | Self::Unknown => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Fatal => 5,
        }
    }
}

/// A single line as seen by one stage of the pipeline.
///
/// Lines are never mutated once produced; a derived stage builds a new line
/// that carries its own `line_index` and remembers where it came from in
/// `original_line_index`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogLine {
    /// Position in the view that produced this line
    pub line_index: usize,

    /// Position in the immediately upstream view
    pub original_line_index: usize,

    /// Entry this line belongs to (monotonic within a view)
    pub log_entry_index: usize,

    /// Line text
    pub message: String,

    /// Detected severity
    pub level: LogLevel,

    /// Parsed timestamp (if available)
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogLine {
    /// Create a line for a leaf source, where view and original index coincide
    pub fn new(
        line_index: usize,
        log_entry_index: usize,
        message: impl Into<String>,
        level: LogLevel,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            line_index,
            original_line_index: line_index,
            log_entry_index,
            message: message.into(),
            level,
            timestamp,
        }
    }

    /// Re-map an upstream line into a derived view.
    ///
    /// The upstream position (`self.line_index`) becomes the original index.
    pub fn remapped(&self, line_index: usize, log_entry_index: usize) -> Self {
        Self {
            line_index,
            original_line_index: self.line_index,
            log_entry_index,
            message: self.message.clone(),
            level: self.level,
            timestamp: self.timestamp,
        }
    }
}

/// A highlighted span inside a line's message (byte offsets)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LogLineMatch {
    pub index: usize,
    pub count: usize,
}

impl LogLineMatch {
    pub fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    pub fn end(&self) -> usize {
        self.index.saturating_add(self.count)
    }
}

// ============================================================================
// Sections
// ============================================================================

/// A contiguous range of lines `[index, index + count)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Section {
    pub index: usize,
    pub count: usize,
}

impl Section {
    pub const fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    /// Exclusive upper bound, saturating at `usize::MAX`
    pub const fn end(&self) -> usize {
        self.index.saturating_add(self.count)
    }

    /// Exclusive upper bound, `None` if it does not fit in a `usize`
    pub const fn checked_end(&self) -> Option<usize> {
        self.index.checked_add(self.count)
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Last index covered by this section, if any
    pub fn last_index(&self) -> Option<usize> {
        let last = self.count.checked_sub(1)?;
        self.index.checked_add(last)
    }

    /// Whether a cursor has caught up with the end of this section
    pub fn is_end_of_section(&self, cursor: usize) -> bool {
        cursor >= self.end()
    }

    /// Smallest section covering both `a` and `b`
    pub fn minimum_bounding_range(a: Section, b: Section) -> Section {
        let index = a.index.min(b.index);
        let end = a.end().max(b.end());
        Section::new(index, end - index)
    }

    pub fn indices(&self) -> Range<usize> {
        self.index..self.end()
    }

    /// Every position this section asks for, one per counted slot;
    /// `None` for slots past `usize::MAX`
    pub fn slots(&self) -> impl Iterator<Item = Option<usize>> + use<> {
        let index = self.index;
        (0..self.count).map(move |offset| index.checked_add(offset))
    }
}

/// A change published by a log source to its listeners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modification {
    /// Lines were added; indices stay dense and non-decreasing
    Appended(Section),

    /// Everything at and after `section.index` is gone; `section.count`
    /// lines were removed
    Invalidated(Section),

    /// The whole source is invalid; restart from empty
    Reset,
}

impl Modification {
    pub fn appended(index: usize, count: usize) -> Self {
        Self::Appended(Section::new(index, count))
    }

    pub fn invalidated(index: usize, count: usize) -> Self {
        Self::Invalidated(Section::new(index, count))
    }

    pub fn is_append(&self) -> bool {
        matches!(self, Self::Appended(_))
    }

    pub fn is_invalidate(&self) -> bool {
        matches!(self, Self::Invalidated(_))
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset)
    }

    /// The section carried by this modification (none for a reset)
    pub fn section(&self) -> Option<Section> {
        match self {
            Self::Appended(section) | Self::Invalidated(section) => Some(*section),
            Self::Reset => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_bounding_range() {
        let a = Section::new(0, 10);
        let b = Section::new(10, 5);
        assert_eq!(Section::minimum_bounding_range(a, b), Section::new(0, 15));

        let empty = Section::default();
        assert_eq!(
            Section::minimum_bounding_range(empty, Section::new(0, 3)),
            Section::new(0, 3)
        );

        // Overlapping bursts collapse into one extent
        let c = Section::new(2, 3);
        assert_eq!(Section::minimum_bounding_range(a, c), a);
    }

    #[test]
    fn test_end_of_section() {
        let section = Section::new(5, 3);
        assert!(!section.is_end_of_section(5));
        assert!(!section.is_end_of_section(7));
        assert!(section.is_end_of_section(8));
        assert!(Section::default().is_end_of_section(0));
    }

    #[test]
    fn test_last_index() {
        assert_eq!(Section::new(5, 3).last_index(), Some(7));
        assert_eq!(Section::new(5, 0).last_index(), None);
        assert_eq!(Section::new(0, 0).last_index(), None);
        assert_eq!(Section::new(usize::MAX, 1).last_index(), Some(usize::MAX));
    }

    #[test]
    fn test_section_near_usize_max() {
        let section = Section::new(usize::MAX, 2);
        assert_eq!(section.end(), usize::MAX);
        assert_eq!(section.checked_end(), None);
        assert_eq!(section.slots().collect::<Vec<_>>(), vec![Some(usize::MAX), None]);
        assert!(section.is_end_of_section(usize::MAX));

        assert_eq!(
            Section::new(3, 2).slots().collect::<Vec<_>>(),
            vec![Some(3), Some(4)]
        );
        assert_eq!(LogLineMatch::new(usize::MAX, 1).end(), usize::MAX);
    }

    #[test]
    fn test_modification_predicates() {
        let append = Modification::appended(0, 4);
        assert!(append.is_append() && !append.is_invalidate() && !append.is_reset());

        let invalidate = Modification::invalidated(2, 2);
        assert!(invalidate.is_invalidate());
        assert_eq!(invalidate.section(), Some(Section::new(2, 2)));

        assert!(Modification::Reset.is_reset());
        assert_eq!(Modification::Reset.section(), None);
    }

    #[test]
    fn test_remapped_line_keeps_upstream_position() {
        let line = LogLine::new(7, 3, "hello", LogLevel::Warn, None);
        let derived = line.remapped(1, 0);
        assert_eq!(derived.line_index, 1);
        assert_eq!(derived.original_line_index, 7);
        assert_eq!(derived.log_entry_index, 0);
        assert_eq!(derived.message, "hello");
        assert_eq!(derived.level, LogLevel::Warn);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(LogLevel::from_str("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("crit"), LogLevel::Fatal);
        assert_eq!(LogLevel::from_str("nonsense"), LogLevel::Unknown);
        assert!(LogLevel::Error.ordinal() > LogLevel::Warn.ordinal());
    }
}
