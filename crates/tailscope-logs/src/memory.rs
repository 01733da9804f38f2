use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use tailscope_types::{LogLevel, LogLine, Section};

use crate::error::Result;
use crate::listener::{ListenerCollection, LogSourceListener};
use crate::source::{LogSource, check_index, check_section};

#[derive(Default)]
struct Lines {
    lines: Vec<LogLine>,
    max_characters_per_line: usize,
    start_timestamp: Option<DateTime<Utc>>,
    last_modified: Option<DateTime<Utc>>,
    size: u64,
}

impl Lines {
    fn next_entry_index(&self) -> usize {
        self.lines.last().map_or(0, |l| l.log_entry_index + 1)
    }

    fn push(
        &mut self,
        message: &str,
        level: LogLevel,
        timestamp: Option<DateTime<Utc>>,
        log_entry_index: usize,
    ) {
        if self.lines.is_empty() {
            self.start_timestamp = timestamp;
        }
        let line_index = self.lines.len();
        self.max_characters_per_line = self.max_characters_per_line.max(message.chars().count());
        self.size += message.len() as u64;
        self.lines
            .push(LogLine::new(line_index, log_entry_index, message, level, timestamp));
    }

    fn touch(&mut self) {
        self.last_modified = Some(Utc::now());
    }
}

/// Thread-safe, mutable log source held entirely in memory.
///
/// Every `append` starts a new entry; use `add_multi_line_entry` for entries
/// spanning several lines. The source is always complete, so
/// `end_of_source_reached` is true and `progress` is 1.
#[derive(Default)]
pub struct InMemoryLogSource {
    /// Line storage; readers take the read lock
    lines: RwLock<Lines>,

    /// Serializes mutation together with its notification
    write_lock: Mutex<()>,

    listeners: ListenerCollection,
}

impl InMemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one single-line entry; returns the new line's index
    pub fn append(
        &self,
        message: &str,
        level: LogLevel,
        timestamp: Option<DateTime<Utc>>,
    ) -> usize {
        let _write = self.write_lock.lock();
        let count = {
            let mut lines = self.lines.write();
            let entry = lines.next_entry_index();
            lines.push(message, level, timestamp, entry);
            lines.touch();
            lines.lines.len()
        };
        self.listeners.on_read(count);
        count - 1
    }

    /// Append several lines that form one entry
    pub fn add_multi_line_entry(
        &self,
        level: LogLevel,
        timestamp: Option<DateTime<Utc>>,
        messages: &[&str],
    ) {
        if messages.is_empty() {
            return;
        }

        let _write = self.write_lock.lock();
        let count = {
            let mut lines = self.lines.write();
            let entry = lines.next_entry_index();
            for message in messages {
                lines.push(message, level, timestamp, entry);
            }
            lines.touch();
            lines.lines.len()
        };
        self.listeners.on_read(count);
    }

    /// Append a continuation line to the last entry, or start the first
    /// entry when empty. Level and timestamp follow the previous line.
    pub fn append_continuation(&self, message: &str) -> usize {
        let _write = self.write_lock.lock();
        let count = {
            let mut lines = self.lines.write();
            let (entry, level, timestamp) = match lines.lines.last() {
                Some(last) => (last.log_entry_index, last.level, last.timestamp),
                None => (0, LogLevel::Unknown, None),
            };
            lines.push(message, level, timestamp, entry);
            lines.touch();
            lines.lines.len()
        };
        self.listeners.on_read(count);
        count - 1
    }

    /// Append `count` empty entries
    pub fn add_empty_entries(&self, count: usize) {
        for _ in 0..count {
            self.append("", LogLevel::Unknown, None);
        }
    }

    /// Remove everything from `index` to the end
    pub fn remove_from(&self, index: usize) {
        let _write = self.write_lock.lock();
        let removed = {
            let mut lines = self.lines.write();
            let count = lines.lines.len();
            if index > count {
                warn!(index, count, "ignoring truncation past the end");
                return;
            }

            let removed = count - index;
            let freed: u64 = lines.lines[index..].iter().map(|l| l.message.len() as u64).sum();
            lines.lines.truncate(index);
            lines.size -= freed;
            if index == 0 {
                lines.start_timestamp = None;
            }
            lines.touch();
            removed
        };
        self.listeners.invalidate(index, removed);
    }

    /// Remove every line
    pub fn clear(&self) {
        let _write = self.write_lock.lock();
        {
            let mut lines = self.lines.write();
            lines.lines.clear();
            lines.max_characters_per_line = 0;
            lines.start_timestamp = None;
            lines.size = 0;
            lines.touch();
        }
        self.listeners.reset();
    }

    /// Deliver appends that listeners' batching policies are still holding back
    pub fn flush(&self) {
        let _write = self.write_lock.lock();
        self.listeners.flush();
    }
}

impl LogSource for InMemoryLogSource {
    fn count(&self) -> usize {
        self.lines.read().lines.len()
    }

    fn original_count(&self) -> usize {
        self.count()
    }

    fn max_characters_per_line(&self) -> usize {
        self.lines.read().max_characters_per_line
    }

    fn end_of_source_reached(&self) -> bool {
        true
    }

    fn progress(&self) -> f64 {
        1.0
    }

    fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.lines.read().start_timestamp
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.lines.read().last_modified
    }

    fn size(&self) -> u64 {
        self.lines.read().size
    }

    fn get_line(&self, index: usize) -> Result<LogLine> {
        let lines = self.lines.read();
        check_index(index, lines.lines.len())?;
        Ok(lines.lines[index].clone())
    }

    fn get_section(&self, section: Section, dest: &mut Vec<LogLine>) -> Result<()> {
        let lines = self.lines.read();
        check_section(section, lines.lines.len())?;
        dest.extend_from_slice(&lines.lines[section.indices()]);
        Ok(())
    }

    fn get_original_index_from(&self, index: usize) -> Option<usize> {
        (index < self.count()).then_some(index)
    }

    fn get_original_indices_from(&self, section: Section, dest: &mut Vec<Option<usize>>) {
        let count = self.count();
        dest.extend(section.slots().map(|slot| slot.filter(|&i| i < count)));
    }

    fn get_original_indices_of(&self, indices: &[usize], dest: &mut Vec<Option<usize>>) {
        let count = self.count();
        dest.extend(indices.iter().map(|&i| (i < count).then_some(i)));
    }

    fn get_log_line_index_of_original_line_index(&self, original_index: usize) -> Option<usize> {
        (original_index < self.count()).then_some(original_index)
    }

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        maximum_wait: Duration,
        maximum_batch: usize,
    ) {
        self.listeners
            .add_listener(listener, maximum_wait, maximum_batch);
    }

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) -> bool {
        self.listeners.remove_listener(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::listener::ChannelListener;
    use tailscope_types::Modification;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Modification>) -> Vec<Modification> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_append_assigns_fresh_entries() {
        let source = InMemoryLogSource::new();
        assert_eq!(source.append("first", LogLevel::Info, None), 0);
        assert_eq!(source.append("second line", LogLevel::Warn, None), 1);

        assert_eq!(source.count(), 2);
        assert_eq!(source.max_characters_per_line(), 11);
        assert!(source.last_modified().is_some());

        let line = source.get_line(1).unwrap();
        assert_eq!(line.line_index, 1);
        assert_eq!(line.log_entry_index, 1);
        assert_eq!(line.level, LogLevel::Warn);
    }

    #[test]
    fn test_multi_line_entry_shares_entry_index() {
        let source = InMemoryLogSource::new();
        source.append("header", LogLevel::Info, None);
        source.add_multi_line_entry(LogLevel::Error, None, &["boom", "  at main", "  at run"]);
        source.append("after", LogLevel::Info, None);

        let mut lines = Vec::new();
        source.get_section(Section::new(0, 5), &mut lines).unwrap();
        let entries: Vec<_> = lines.iter().map(|l| l.log_entry_index).collect();
        assert_eq!(entries, vec![0, 1, 1, 1, 2]);
    }

    #[test]
    fn test_continuation_extends_last_entry() {
        let source = InMemoryLogSource::new();
        assert_eq!(source.append_continuation("orphan"), 0);
        source.append("boom", LogLevel::Error, None);
        assert_eq!(source.append_continuation("  at main"), 2);

        let line = source.get_line(2).unwrap();
        assert_eq!(line.log_entry_index, 1);
        assert_eq!(line.level, LogLevel::Error);
        assert_eq!(source.get_line(0).unwrap().log_entry_index, 0);
    }

    #[test]
    fn test_start_timestamp_from_first_line() {
        let source = InMemoryLogSource::new();
        let ts = Utc::now();
        source.append("first", LogLevel::Info, Some(ts));
        source.append("second", LogLevel::Info, None);
        assert_eq!(source.start_timestamp(), Some(ts));

        source.clear();
        assert_eq!(source.start_timestamp(), None);
    }

    #[test]
    fn test_out_of_range_access() {
        let source = InMemoryLogSource::new();
        source.add_empty_entries(2);

        assert_eq!(
            source.get_line(2),
            Err(PipelineError::IndexOutOfRange { index: 2, count: 2 })
        );
        let mut dest = Vec::new();
        assert!(source.get_section(Section::new(1, 2), &mut dest).is_err());
        assert!(dest.is_empty());

        assert_eq!(source.get_original_index_from(1), Some(1));
        assert_eq!(source.get_original_index_from(2), None);
        assert_eq!(source.get_log_line_index_of_original_line_index(5), None);

        let mut indices = Vec::new();
        source.get_original_indices_of(&[0, 3], &mut indices);
        assert_eq!(indices, vec![Some(0), None]);

        // Sections reaching past usize::MAX map to absent slots, not a panic
        indices.clear();
        source.get_original_indices_from(Section::new(usize::MAX, 2), &mut indices);
        assert_eq!(indices, vec![None, None]);
        assert_eq!(
            source.get_section(Section::new(usize::MAX, 2), &mut dest),
            Err(PipelineError::SectionOutOfRange {
                index: usize::MAX,
                len: 2,
                count: 2
            })
        );
    }

    #[test]
    fn test_notifications() {
        let source = InMemoryLogSource::new();
        let (listener, mut rx) = ChannelListener::new();
        source.add_listener(listener, Duration::ZERO, 100);
        assert_eq!(drain(&mut rx), vec![Modification::Reset]);

        source.append("a", LogLevel::Info, None);
        source.append("b", LogLevel::Info, None);
        source.append("c", LogLevel::Info, None);
        assert_eq!(
            drain(&mut rx),
            vec![
                Modification::appended(0, 1),
                Modification::appended(1, 1),
                Modification::appended(2, 1),
            ]
        );

        source.remove_from(1);
        assert_eq!(drain(&mut rx), vec![Modification::invalidated(1, 2)]);
        assert_eq!(source.count(), 1);
        assert_eq!(source.size(), 1);

        source.clear();
        assert_eq!(drain(&mut rx), vec![Modification::Reset]);
        assert_eq!(source.count(), 0);
    }

    #[test]
    fn test_remove_from_past_end_is_ignored() {
        let source = InMemoryLogSource::new();
        source.add_empty_entries(3);
        let (listener, mut rx) = ChannelListener::new();
        source.add_listener(listener, Duration::ZERO, 100);
        drain(&mut rx);

        source.remove_from(4);
        assert_eq!(source.count(), 3);
        assert!(drain(&mut rx).is_empty());

        // Truncating at the end removes nothing
        source.remove_from(3);
        assert_eq!(source.count(), 3);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_entry_index_continues_after_truncation() {
        let source = InMemoryLogSource::new();
        source.add_empty_entries(3);
        source.remove_from(1);
        source.append("again", LogLevel::Info, None);
        assert_eq!(source.get_line(1).unwrap().log_entry_index, 1);
    }
}
