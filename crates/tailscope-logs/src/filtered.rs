//! Incrementally filtered view of an upstream source.
//!
//! The stage never rescans its upstream. A background task consumes the
//! upstream in bounded batches, groups passing lines into entries, and
//! appends the surviving entries to an index that maps filtered positions
//! back to upstream positions. Truncations and resets of the upstream are
//! applied to that index directly.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tailscope_types::{LogLine, Modification, Section};

use crate::config::StageOptions;
use crate::error::Result;
use crate::filter::{EntryFilter, LineFilter, NoFilter};
use crate::listener::{ChannelListener, ListenerCollection, LogSourceListener};
use crate::scheduler::{PeriodicTask, TaskScheduler};
use crate::source::{LogSource, check_index, check_section, saturate_ratio};

/// Filtered position -> upstream position, plus entry assignment
#[derive(Default)]
struct DerivedIndex {
    /// Strictly increasing upstream positions
    indices: Vec<usize>,

    /// Upstream position -> filtered entry index
    entry_of: HashMap<usize, usize>,
}

/// State read by any thread; mutated only by the background task
struct Shared {
    source: Arc<dyn LogSource>,
    index: RwLock<DerivedIndex>,
    listeners: ListenerCollection,

    /// How far into the upstream the task has consumed
    cursor: AtomicUsize,
    max_characters_per_line: AtomicUsize,
    end_of_source_reached: AtomicBool,
}

impl Shared {
    fn new(source: Arc<dyn LogSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            index: RwLock::new(DerivedIndex::default()),
            listeners: ListenerCollection::new(),
            cursor: AtomicUsize::new(0),
            max_characters_per_line: AtomicUsize::new(0),
            end_of_source_reached: AtomicBool::new(false),
        })
    }

    fn line_at(&self, index: &DerivedIndex, line_index: usize) -> Result<LogLine> {
        check_index(line_index, index.indices.len())?;
        let source_index = index.indices[line_index];
        let entry = index.entry_of.get(&source_index).copied().unwrap_or_default();
        let line = self.source.get_line(source_index)?;
        Ok(line.remapped(line_index, entry))
    }
}

/// The entry currently being assembled from upstream lines
#[derive(Default)]
struct OpenEntry {
    lines: Vec<LogLine>,

    /// Leading lines already published to the derived index
    published: usize,

    /// Filtered entry index, assigned on first publication
    entry_index: Option<usize>,
}

impl OpenEntry {
    fn clear(&mut self) {
        self.lines.clear();
        self.published = 0;
        self.entry_index = None;
    }

    fn belongs(&self, line: &LogLine) -> bool {
        self.lines
            .first()
            .is_none_or(|first| first.log_entry_index == line.log_entry_index)
    }

    /// Forget buffered lines at or after upstream position `from`
    fn truncate(&mut self, from: usize) {
        self.lines.retain(|line| line.line_index < from);
        self.published = self.published.min(self.lines.len());
        if self.lines.is_empty() {
            self.clear();
        }
    }
}

/// Background half of the stage
struct FilterTask {
    shared: Arc<Shared>,
    pending: mpsc::UnboundedReceiver<Modification>,
    line_filter: Arc<dyn LineFilter>,
    entry_filter: Arc<dyn EntryFilter>,
    maximum_wait: Duration,
    batch_size: usize,

    /// Upstream extent announced so far
    full_source_section: Section,
    cursor: usize,
    buffer: Vec<LogLine>,
    open_entry: OpenEntry,
    current_entry_index: usize,

    /// `(upstream position, upstream entry id)` of the first line of every
    /// upstream entry consumed so far, line filter notwithstanding
    entry_starts: Vec<(usize, usize)>,
}

impl FilterTask {
    fn new(
        shared: Arc<Shared>,
        pending: mpsc::UnboundedReceiver<Modification>,
        line_filter: Option<Arc<dyn LineFilter>>,
        entry_filter: Option<Arc<dyn EntryFilter>>,
        options: StageOptions,
    ) -> Self {
        let batch_size = options.batch_size.max(1);
        Self {
            shared,
            pending,
            line_filter: line_filter.unwrap_or_else(|| Arc::new(NoFilter)),
            entry_filter: entry_filter.unwrap_or_else(|| Arc::new(NoFilter)),
            maximum_wait: options.maximum_wait(),
            batch_size,
            full_source_section: Section::default(),
            cursor: 0,
            buffer: Vec::with_capacity(batch_size.min(1024)),
            open_entry: OpenEntry::default(),
            current_entry_index: 0,
            entry_starts: Vec::new(),
        }
    }

    fn run_once(&mut self, token: &CancellationToken) -> Result<Duration> {
        let mut performed_work = false;

        while !token.is_cancelled() {
            let Ok(modification) = self.pending.try_recv() else {
                break;
            };
            match modification {
                Modification::Reset => self.reset(),
                Modification::Invalidated(section) => self.invalidate(section.index),
                Modification::Appended(section) => {
                    self.full_source_section =
                        Section::minimum_bounding_range(self.full_source_section, section);
                }
            }
            performed_work = true;
        }

        let mut published = false;
        if !self.full_source_section.is_end_of_section(self.cursor) {
            let remaining = self.full_source_section.end() - self.cursor;
            // The upstream may already have shrunk; its notification is queued
            let available = self.shared.source.count().saturating_sub(self.cursor);
            let next_count = remaining.min(self.batch_size).min(available);

            if next_count > 0 {
                self.buffer.clear();
                self.shared
                    .source
                    .get_section(Section::new(self.cursor, next_count), &mut self.buffer)?;

                let lines = std::mem::take(&mut self.buffer);
                let mut processed = 0;
                for line in &lines {
                    if token.is_cancelled() {
                        break;
                    }
                    published |= self.classify(line);
                    processed += 1;
                }
                self.buffer = lines;

                self.cursor += processed;
                self.shared.cursor.store(self.cursor, Ordering::Release);
                trace!(cursor = self.cursor, end = self.full_source_section.end(), "consumed batch");
                performed_work = true;
            }
        }

        let caught_up = self.full_source_section.is_end_of_section(self.cursor);
        if caught_up {
            published |= self.publish_open_entry();
        }
        if caught_up || published {
            let count = self.shared.index.read().indices.len();
            self.shared.listeners.on_read(count);
        }
        if caught_up && self.shared.source.end_of_source_reached() {
            self.shared.end_of_source_reached.store(true, Ordering::Release);
        }

        if performed_work {
            Ok(Duration::ZERO)
        } else {
            Ok(self.maximum_wait)
        }
    }

    /// Route one upstream line; returns whether anything was published
    fn classify(&mut self, line: &LogLine) -> bool {
        if self
            .entry_starts
            .last()
            .is_none_or(|&(_, entry)| entry != line.log_entry_index)
        {
            self.entry_starts.push((line.line_index, line.log_entry_index));
        }
        if !self.line_filter.passes_filter(line) {
            return false;
        }

        let mut published = false;
        if !self.open_entry.belongs(line) {
            published = self.publish_open_entry();
            self.open_entry.clear();
        }
        self.open_entry.lines.push(line.clone());
        published
    }

    /// Publish the unpublished tail of the open entry if the entry passes.
    ///
    /// An entry that was partly published and no longer passes is retracted.
    fn publish_open_entry(&mut self) -> bool {
        let open = &self.open_entry;
        if open.lines.is_empty() || open.published == open.lines.len() {
            return false;
        }

        if !self.entry_filter.passes_entry_filter(&open.lines) {
            if open.published > 0 {
                let first = open.lines[0].line_index;
                self.truncate_derived(first);
                self.open_entry.published = 0;
                self.open_entry.entry_index = None;
            }
            return false;
        }

        let entry_index = match self.open_entry.entry_index {
            Some(entry_index) => entry_index,
            None => {
                let entry_index = self.current_entry_index;
                self.current_entry_index += 1;
                self.open_entry.entry_index = Some(entry_index);
                entry_index
            }
        };

        let open = &mut self.open_entry;
        let mut max_characters = 0;
        {
            let mut index = self.shared.index.write();
            for line in &open.lines[open.published..] {
                index.indices.push(line.line_index);
                index.entry_of.insert(line.line_index, entry_index);
                max_characters = max_characters.max(line.message.chars().count());
            }
        }
        open.published = open.lines.len();
        self.shared
            .max_characters_per_line
            .fetch_max(max_characters, Ordering::Relaxed);
        true
    }

    fn reset(&mut self) {
        debug!("upstream reset, clearing filtered view");
        self.full_source_section = Section::default();
        self.cursor = 0;
        self.shared.cursor.store(0, Ordering::Release);
        self.open_entry.clear();
        self.current_entry_index = 0;
        self.entry_starts.clear();
        {
            let mut index = self.shared.index.write();
            index.indices.clear();
            index.entry_of.clear();
        }
        self.shared.max_characters_per_line.store(0, Ordering::Relaxed);
        self.shared.listeners.reset();
    }

    fn invalidate(&mut self, from: usize) {
        debug!(from, cursor = self.cursor, "upstream invalidated");
        self.full_source_section = Section::new(0, from);

        // An entry cut by `from` was judged as a whole, so whatever survives
        // of it is dropped and read again from its first line
        let rewind_to = self.cut_entry_start(from).unwrap_or(from);
        if self.cursor > rewind_to {
            self.cursor = rewind_to;
            self.shared.cursor.store(rewind_to, Ordering::Release);
        }
        let keep = self.entry_starts.partition_point(|&(start, _)| start < rewind_to);
        self.entry_starts.truncate(keep);
        self.truncate_derived(rewind_to);
        self.open_entry.truncate(rewind_to);
    }

    /// First upstream position of the consumed entry that spans `from`,
    /// if `from` falls inside an entry rather than on a boundary
    fn cut_entry_start(&self, from: usize) -> Option<usize> {
        if self.cursor <= from {
            return None;
        }
        let after = self.entry_starts.partition_point(|&(start, _)| start <= from);
        let (start, _) = *self.entry_starts.get(after.checked_sub(1)?)?;
        (start < from).then_some(start)
    }

    /// Drop every derived line whose upstream position is `>= from` and
    /// notify listeners; returns the number removed
    fn truncate_derived(&mut self, from: usize) -> usize {
        let (count, removed) = {
            let mut guard = self.shared.index.write();
            let DerivedIndex { indices, entry_of } = &mut *guard;

            let keep = indices.partition_point(|&i| i < from);
            let removed = indices.len() - keep;
            for source_index in indices.drain(keep..) {
                entry_of.remove(&source_index);
            }
            if removed > 0 {
                // Entries are numbered densely from the last survivor
                self.current_entry_index = indices
                    .last()
                    .and_then(|i| entry_of.get(i))
                    .map_or(0, |entry| entry + 1);
            }
            (indices.len(), removed)
        };

        if removed > 0 {
            debug!(count, removed, "filtered view truncated");
            self.shared.listeners.invalidate(count, removed);
        }
        removed
    }
}

/// A log source showing the lines of an upstream source that pass a line
/// filter and an entry filter.
///
/// Processing happens on a periodic task of the given scheduler; accessors
/// read whatever has been derived so far. Dropping the stage deregisters it
/// from the upstream and disposes its task.
pub struct FilteredLogSource {
    shared: Arc<Shared>,
    listener: Arc<dyn LogSourceListener>,
    task: PeriodicTask,
}

impl FilteredLogSource {
    /// Create a stage over `source`. A missing filter lets everything pass.
    pub fn new(
        scheduler: &dyn TaskScheduler,
        source: Arc<dyn LogSource>,
        line_filter: Option<Arc<dyn LineFilter>>,
        entry_filter: Option<Arc<dyn EntryFilter>>,
        options: StageOptions,
    ) -> Self {
        let batch_size = options.batch_size.max(1);
        let shared = Shared::new(Arc::clone(&source));

        let (listener, pending) = ChannelListener::new();
        let listener: Arc<dyn LogSourceListener> = listener;
        source.add_listener(Arc::clone(&listener), options.maximum_wait(), batch_size);

        let mut task = FilterTask::new(
            Arc::clone(&shared),
            pending,
            line_filter,
            entry_filter,
            options,
        );
        let task = scheduler.schedule(
            "filtered log source",
            Box::new(move |token: &CancellationToken| task.run_once(token)),
        );
        debug!(batch_size, "created filtered log source");

        Self {
            shared,
            listener,
            task,
        }
    }

    /// The upstream this stage filters
    pub fn source(&self) -> &Arc<dyn LogSource> {
        &self.shared.source
    }
}

impl Drop for FilteredLogSource {
    fn drop(&mut self) {
        self.shared.source.remove_listener(&self.listener);
        self.task.dispose();
        debug!("disposed filtered log source");
    }
}

impl LogSource for FilteredLogSource {
    fn count(&self) -> usize {
        self.shared.index.read().indices.len()
    }

    fn original_count(&self) -> usize {
        self.shared.source.count()
    }

    fn max_characters_per_line(&self) -> usize {
        self.shared.max_characters_per_line.load(Ordering::Relaxed)
    }

    fn end_of_source_reached(&self) -> bool {
        self.shared.end_of_source_reached.load(Ordering::Acquire)
    }

    fn progress(&self) -> f64 {
        let source_count = self.shared.source.count();
        let cursor = self.shared.cursor.load(Ordering::Acquire);
        saturate_ratio(cursor, source_count) * self.shared.source.progress()
    }

    fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.shared.source.start_timestamp()
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.shared.source.last_modified()
    }

    fn size(&self) -> u64 {
        self.shared.source.size()
    }

    fn get_line(&self, index: usize) -> Result<LogLine> {
        let derived = self.shared.index.read();
        self.shared.line_at(&derived, index)
    }

    fn get_section(&self, section: Section, dest: &mut Vec<LogLine>) -> Result<()> {
        let derived = self.shared.index.read();
        check_section(section, derived.indices.len())?;
        let lines = section
            .indices()
            .map(|i| self.shared.line_at(&derived, i))
            .collect::<Result<Vec<_>>>()?;
        dest.extend(lines);
        Ok(())
    }

    fn get_original_index_from(&self, index: usize) -> Option<usize> {
        self.shared.index.read().indices.get(index).copied()
    }

    fn get_original_indices_from(&self, section: Section, dest: &mut Vec<Option<usize>>) {
        let derived = self.shared.index.read();
        dest.extend(
            section
                .slots()
                .map(|slot| slot.and_then(|i| derived.indices.get(i).copied())),
        );
    }

    fn get_original_indices_of(&self, indices: &[usize], dest: &mut Vec<Option<usize>>) {
        let derived = self.shared.index.read();
        dest.extend(indices.iter().map(|&i| derived.indices.get(i).copied()));
    }

    fn get_log_line_index_of_original_line_index(&self, original_index: usize) -> Option<usize> {
        self.shared
            .index
            .read()
            .indices
            .binary_search(&original_index)
            .ok()
    }

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        maximum_wait: Duration,
        maximum_batch: usize,
    ) {
        self.shared
            .listeners
            .add_listener(listener, maximum_wait, maximum_batch);
    }

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) -> bool {
        self.shared.listeners.remove_listener(listener)
    }
}

impl std::fmt::Debug for FilteredLogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilteredLogSource")
            .field("count", &self.count())
            .field("cursor", &self.shared.cursor.load(Ordering::Relaxed))
            .field("task", &self.task)
            .finish()
    }
}
