use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;

use tailscope_types::{LogLevel, LogLine, LogLineMatch};

use crate::error::FilterError;

/// Predicate applied to individual lines
pub trait LineFilter: Send + Sync {
    fn passes_filter(&self, line: &LogLine) -> bool;

    /// Spans of the message this filter matches, for highlighting.
    ///
    /// Independent of whether the line passes.
    fn matches(&self, _line: &LogLine) -> Vec<LogLineMatch> {
        Vec::new()
    }
}

/// Predicate applied to a whole entry (consecutive lines sharing an entry index)
pub trait EntryFilter: LineFilter {
    /// By default an entry passes if any of its lines does
    fn passes_entry_filter(&self, entry: &[LogLine]) -> bool {
        entry.iter().any(|line| self.passes_filter(line))
    }
}

/// Lets everything through
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFilter;

impl LineFilter for NoFilter {
    fn passes_filter(&self, _line: &LogLine) -> bool {
        true
    }
}

impl EntryFilter for NoFilter {
    fn passes_entry_filter(&self, _entry: &[LogLine]) -> bool {
        true
    }
}

fn regex_matches(regex: &Regex, text: &str) -> Vec<LogLineMatch> {
    regex
        .find_iter(text)
        .filter(|m| !m.is_empty())
        .map(|m| LogLineMatch::new(m.start(), m.len()))
        .collect()
}

/// Glob-style substring filter: `*` matches any run of characters, `?` any
/// single character. The pattern is not anchored.
#[derive(Clone, Debug)]
pub struct WildcardFilter {
    regex: Regex,
    pattern: String,
    ignore_case: bool,
}

impl WildcardFilter {
    pub fn new(pattern: &str, ignore_case: bool) -> Result<Self, FilterError> {
        let translated = regex::escape(pattern)
            .replace(r"\*", ".*")
            .replace(r"\?", ".");
        let regex = RegexBuilder::new(&translated)
            .case_insensitive(ignore_case)
            .build()
            .map_err(|source| FilterError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;

        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            ignore_case,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.ignore_case
    }
}

impl LineFilter for WildcardFilter {
    fn passes_filter(&self, line: &LogLine) -> bool {
        self.regex.is_match(&line.message)
    }

    fn matches(&self, line: &LogLine) -> Vec<LogLineMatch> {
        regex_matches(&self.regex, &line.message)
    }
}

impl EntryFilter for WildcardFilter {}

/// Regular-expression filter, optionally restricted to a set of levels.
///
/// An empty pattern matches every message. Inverting flips the outcome for
/// the whole predicate, level restriction included; an inverted filter
/// passes an entry only if none of its lines match.
#[derive(Clone)]
pub struct RegexFilter {
    regex: Option<Regex>,
    pattern: String,
    /// Empty means every level
    levels: HashSet<LogLevel>,
    invert: bool,
}

impl RegexFilter {
    pub fn new(pattern: &str, ignore_case: bool) -> Result<Self, FilterError> {
        let regex = match pattern {
            "" => None,
            _ => Some(
                RegexBuilder::new(pattern)
                    .case_insensitive(ignore_case)
                    .build()
                    .map_err(|source| FilterError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    })?,
            ),
        };

        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            levels: HashSet::new(),
            invert: false,
        })
    }

    pub fn with_levels(mut self, levels: impl IntoIterator<Item = LogLevel>) -> Self {
        self.levels = levels.into_iter().collect();
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl LineFilter for RegexFilter {
    fn passes_filter(&self, line: &LogLine) -> bool {
        let level_match = self.levels.is_empty() || self.levels.contains(&line.level);
        let text_match = self
            .regex
            .as_ref()
            .is_none_or(|re| re.is_match(&line.message));
        (level_match && text_match) != self.invert
    }

    fn matches(&self, line: &LogLine) -> Vec<LogLineMatch> {
        self.regex
            .as_ref()
            .map_or_else(Vec::new, |re| regex_matches(re, &line.message))
    }
}

impl EntryFilter for RegexFilter {
    fn passes_entry_filter(&self, entry: &[LogLine]) -> bool {
        if self.invert {
            entry.iter().all(|line| self.passes_filter(line))
        } else {
            entry.iter().any(|line| self.passes_filter(line))
        }
    }
}

impl std::fmt::Debug for RegexFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegexFilter")
            .field("pattern", &self.pattern)
            .field("levels", &self.levels)
            .field("invert", &self.invert)
            .finish()
    }
}

/// Passes lines whose level is in a set
#[derive(Clone, Debug, Default)]
pub struct LevelFilter {
    levels: HashSet<LogLevel>,
}

impl LevelFilter {
    pub fn new(levels: impl IntoIterator<Item = LogLevel>) -> Self {
        Self {
            levels: levels.into_iter().collect(),
        }
    }

    /// Every level at least as severe as `level`
    pub fn at_least(level: LogLevel) -> Self {
        Self::new(
            [
                LogLevel::Trace,
                LogLevel::Debug,
                LogLevel::Info,
                LogLevel::Warn,
                LogLevel::Error,
                LogLevel::Fatal,
                LogLevel::Unknown,
            ]
            .into_iter()
            .filter(|l| l.ordinal() >= level.ordinal()),
        )
    }

    /// Filter for errors only
    pub fn errors_only() -> Self {
        Self::new([LogLevel::Error, LogLevel::Fatal])
    }

    /// Filter for warnings and above
    pub fn warnings_and_above() -> Self {
        Self::at_least(LogLevel::Warn)
    }

    /// Filter for info and above (no debug/trace)
    pub fn info_and_above() -> Self {
        Self::at_least(LogLevel::Info)
    }

    pub fn levels(&self) -> &HashSet<LogLevel> {
        &self.levels
    }
}

impl LineFilter for LevelFilter {
    fn passes_filter(&self, line: &LogLine) -> bool {
        self.levels.is_empty() || self.levels.contains(&line.level)
    }
}

impl EntryFilter for LevelFilter {}

/// Passes only what every child filter passes
#[derive(Clone, Default)]
pub struct AndFilter {
    filters: Vec<Arc<dyn EntryFilter>>,
}

impl AndFilter {
    pub fn new(filters: Vec<Arc<dyn EntryFilter>>) -> Self {
        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl LineFilter for AndFilter {
    fn passes_filter(&self, line: &LogLine) -> bool {
        self.filters.iter().all(|f| f.passes_filter(line))
    }

    fn matches(&self, line: &LogLine) -> Vec<LogLineMatch> {
        let mut spans: Vec<_> = self.filters.iter().flat_map(|f| f.matches(line)).collect();
        spans.sort_by_key(|m| (m.index, m.count));
        spans.dedup();
        spans
    }
}

impl EntryFilter for AndFilter {
    fn passes_entry_filter(&self, entry: &[LogLine]) -> bool {
        self.filters.iter().all(|f| f.passes_entry_filter(entry))
    }
}

/// Wraps a filter from an untrusted boundary (e.g. a plugin).
///
/// A panic inside the wrapped filter is logged and the line or entry is
/// treated as not passing; match extraction yields no spans.
pub struct NoThrowFilter {
    inner: Arc<dyn EntryFilter>,
}

impl NoThrowFilter {
    pub fn new(inner: Arc<dyn EntryFilter>) -> Self {
        Self { inner }
    }

    fn guard<T>(&self, what: &str, fallback: T, f: impl FnOnce() -> T) -> T {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => value,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(operation = what, %reason, "caught panic from filter");
                fallback
            }
        }
    }
}

impl LineFilter for NoThrowFilter {
    fn passes_filter(&self, line: &LogLine) -> bool {
        self.guard("passes_filter", false, || self.inner.passes_filter(line))
    }

    fn matches(&self, line: &LogLine) -> Vec<LogLineMatch> {
        self.guard("matches", Vec::new(), || self.inner.matches(line))
    }
}

impl EntryFilter for NoThrowFilter {
    fn passes_entry_filter(&self, entry: &[LogLine]) -> bool {
        self.guard("passes_entry_filter", false, || {
            self.inner.passes_entry_filter(entry)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(message: &str) -> LogLine {
        LogLine::new(0, 0, message, LogLevel::Info, None)
    }

    #[test]
    fn test_wildcard_substring() {
        let filter = WildcardFilter::new("alpha", false).unwrap();
        assert!(filter.passes_filter(&line("alpha")));
        assert!(filter.passes_filter(&line("x alpha-2 y")));
        assert!(!filter.passes_filter(&line("beta")));
        assert!(!filter.passes_filter(&line("ALPHA")));
    }

    #[test]
    fn test_wildcard_glob_characters() {
        let filter = WildcardFilter::new("err*timeout", false).unwrap();
        assert!(filter.passes_filter(&line("error: connection timeout")));
        assert!(!filter.passes_filter(&line("timeout then error")));

        let filter = WildcardFilter::new("a?c", false).unwrap();
        assert!(filter.passes_filter(&line("xxabcxx")));
        assert!(!filter.passes_filter(&line("ac")));
    }

    #[test]
    fn test_wildcard_escapes_regex_syntax() {
        let filter = WildcardFilter::new("[id=1]", false).unwrap();
        assert!(filter.passes_filter(&line("request [id=1] done")));
        assert!(!filter.passes_filter(&line("request i done")));
    }

    #[test]
    fn test_wildcard_case_insensitive() {
        let filter = WildcardFilter::new("Alpha", true).unwrap();
        assert!(filter.is_case_insensitive());
        assert!(filter.passes_filter(&line("ALPHA")));
    }

    #[test]
    fn test_wildcard_match_spans() {
        let filter = WildcardFilter::new("error", false).unwrap();
        let spans = filter.matches(&line("an error occurred, another error here"));
        assert_eq!(spans, vec![LogLineMatch::new(3, 5), LogLineMatch::new(27, 5)]);

        // Spans are reported even when nothing passes
        let filter = WildcardFilter::new("xyz", false).unwrap();
        assert!(filter.matches(&line("abc")).is_empty());
    }

    #[test]
    fn test_entry_passes_if_any_line_passes() {
        let filter = WildcardFilter::new("boom", false).unwrap();
        let entry = vec![line("header"), line("boom"), line("trailer")];
        assert!(filter.passes_entry_filter(&entry));
        assert!(!filter.passes_entry_filter(&entry[..1]));
    }

    #[test]
    fn test_regex_filter() {
        let filter = RegexFilter::new(r"error \d+", false).unwrap();
        let mut entry = line("an error 42 occurred");
        assert!(filter.passes_filter(&entry));
        assert_eq!(filter.matches(&entry), vec![LogLineMatch::new(3, 8)]);

        entry.message = "everything is fine".to_string();
        assert!(!filter.passes_filter(&entry));

        let inverted = RegexFilter::new(r"error \d+", false).unwrap().inverted();
        assert!(inverted.passes_filter(&entry));
        assert_eq!(inverted.pattern(), r"error \d+");

        let ignore_case = RegexFilter::new("ERROR", true).unwrap();
        assert!(ignore_case.passes_filter(&line("error")));
        assert!(!RegexFilter::new("ERROR", false).unwrap().passes_filter(&line("error")));
    }

    #[test]
    fn test_regex_filter_levels() {
        let filter = RegexFilter::new("", false)
            .unwrap()
            .with_levels([LogLevel::Error]);

        let mut entry = line("test");
        entry.level = LogLevel::Error;
        assert!(filter.passes_filter(&entry));
        assert!(filter.matches(&entry).is_empty());
        entry.level = LogLevel::Info;
        assert!(!filter.passes_filter(&entry));
        assert!(filter.inverted().passes_filter(&entry));
    }

    #[test]
    fn test_inverted_regex_rejects_entry_with_any_match() {
        let filter = RegexFilter::new("timeout", false).unwrap().inverted();
        let trace = [line("request failed"), line("  caused by timeout")];
        assert!(!filter.passes_entry_filter(&trace));
        assert!(filter.passes_entry_filter(&[line("request ok")]));
        assert!(RegexFilter::new("timeout", false).unwrap().passes_entry_filter(&trace));
    }

    #[test]
    fn test_invalid_regex() {
        assert!(matches!(
            RegexFilter::new("(unclosed", false),
            Err(FilterError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_level_presets() {
        let mut entry = line("x");
        entry.level = LogLevel::Warn;
        assert!(LevelFilter::warnings_and_above().passes_filter(&entry));
        assert!(!LevelFilter::errors_only().passes_filter(&entry));
        assert!(LevelFilter::info_and_above().passes_filter(&entry));

        entry.level = LogLevel::Debug;
        assert!(!LevelFilter::info_and_above().passes_filter(&entry));
        assert!(LevelFilter::default().passes_filter(&entry));
    }

    #[test]
    fn test_and_filter() {
        let levels: Arc<dyn EntryFilter> = Arc::new(LevelFilter::errors_only());
        let text: Arc<dyn EntryFilter> = Arc::new(WildcardFilter::new("disk", false).unwrap());
        let both = AndFilter::new(vec![levels, text]);
        assert_eq!(both.len(), 2);

        let mut error = line("disk failure");
        error.level = LogLevel::Error;
        assert!(both.passes_filter(&error));
        assert!(!both.passes_filter(&line("disk failure")));
        assert_eq!(both.matches(&error), vec![LogLineMatch::new(0, 4)]);

        // Each child judges the whole entry
        let mut trace = line("  at disk.rs");
        trace.level = LogLevel::Error;
        assert!(both.passes_entry_filter(&[line("boom"), trace]));

        assert!(AndFilter::default().passes_filter(&line("anything")));
    }

    struct Exploding;

    impl LineFilter for Exploding {
        fn passes_filter(&self, _line: &LogLine) -> bool {
            panic!("filter bug")
        }
    }

    impl EntryFilter for Exploding {}

    #[test]
    fn test_no_throw_filter_suppresses_panics() {
        let filter = NoThrowFilter::new(Arc::new(Exploding));
        assert!(!filter.passes_filter(&line("x")));
        assert!(!filter.passes_entry_filter(&[line("x")]));
        assert!(filter.matches(&line("x")).is_empty());
    }

    #[test]
    fn test_no_throw_filter_passes_through() {
        let inner = Arc::new(WildcardFilter::new("ok", false).unwrap());
        let filter = NoThrowFilter::new(inner);
        assert!(filter.passes_filter(&line("ok")));
        assert_eq!(filter.matches(&line("ok")), vec![LogLineMatch::new(0, 2)]);
    }
}
