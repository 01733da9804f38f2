//! Time-ordered merge of several sources into one view.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tailscope_types::{LogLine, Modification, Section};

use crate::config::StageOptions;
use crate::error::Result;
use crate::listener::{ListenerCollection, LogSourceListener};
use crate::scheduler::{PeriodicTask, TaskScheduler};
use crate::source::{LogSource, check_index, check_section, saturate_ratio};

/// Forwards a source's modifications tagged with the source's position
struct TaggedListener {
    source: usize,
    tx: mpsc::UnboundedSender<(usize, Modification)>,
}

impl LogSourceListener for TaggedListener {
    fn on_modified(&self, modification: Modification) {
        let _ = self.tx.send((self.source, modification));
    }
}

/// Sort key: timestamp, then source order, then upstream position
type MergeKey = (DateTime<Utc>, usize, usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MergedLine {
    timestamp: DateTime<Utc>,
    source: usize,
    original_index: usize,
    /// Entry index within the source
    source_entry: usize,
    /// Entry index within the merged view
    entry_index: usize,
}

impl MergedLine {
    fn key(&self) -> MergeKey {
        (self.timestamp, self.source, self.original_index)
    }

    fn group(&self) -> (usize, usize) {
        (self.source, self.source_entry)
    }
}

struct Shared {
    sources: Vec<Arc<dyn LogSource>>,
    lines: RwLock<Vec<MergedLine>>,
    listeners: ListenerCollection,
    cursors: Vec<AtomicUsize>,
    max_characters_per_line: AtomicUsize,
    end_of_source_reached: AtomicBool,
}

impl Shared {
    fn line_at(&self, lines: &[MergedLine], index: usize) -> Result<LogLine> {
        check_index(index, lines.len())?;
        let merged = lines[index];
        let line = self.sources[merged.source].get_line(merged.original_index)?;
        Ok(line.remapped(index, merged.entry_index))
    }
}

/// Merge two key-ordered runs into `dest`
fn merge_sorted(dest: &mut Vec<MergedLine>, a: Vec<MergedLine>, b: Vec<MergedLine>) {
    dest.reserve(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        let next = match (a.peek(), b.peek()) {
            (Some(x), Some(y)) if x.key() <= y.key() => a.next(),
            (Some(_), Some(_)) => b.next(),
            (Some(_), None) => a.next(),
            (None, Some(_)) => b.next(),
            (None, None) => break,
        };
        dest.extend(next);
    }
}

/// Recompute merged entry indices from position `from` onwards
fn renumber(lines: &mut [MergedLine], from: usize) {
    let mut previous = from
        .checked_sub(1)
        .and_then(|i| lines.get(i))
        .map(|l| (l.group(), l.entry_index));
    for line in lines.iter_mut().skip(from) {
        line.entry_index = match previous {
            Some((group, entry)) if group == line.group() => entry,
            Some((_, entry)) => entry + 1,
            None => 0,
        };
        previous = Some((line.group(), line.entry_index));
    }
}

struct MergeTask {
    shared: Arc<Shared>,
    pending: mpsc::UnboundedReceiver<(usize, Modification)>,
    maximum_wait: Duration,
    batch_size: usize,

    extents: Vec<Section>,
    cursors: Vec<usize>,
    buffer: Vec<LogLine>,
}

impl MergeTask {
    fn run_once(&mut self, token: &CancellationToken) -> Result<Duration> {
        let mut performed_work = false;
        // `(source, from)`: lines of `source` at or after `from` are gone
        let mut removals = Vec::new();

        while !token.is_cancelled() {
            let Ok((source, modification)) = self.pending.try_recv() else {
                break;
            };
            match modification {
                Modification::Appended(section) => {
                    self.extents[source] =
                        Section::minimum_bounding_range(self.extents[source], section);
                }
                Modification::Invalidated(section) => {
                    debug!(source, from = section.index, "merged source invalidated");
                    self.rewind(source, section.index);
                    removals.push((source, section.index));
                }
                Modification::Reset => {
                    debug!(source, "merged source reset");
                    self.rewind(source, 0);
                    removals.push((source, 0));
                }
            }
            performed_work = true;
        }

        // Upstream reads happen before the merged view is locked
        let mut candidates = Vec::new();
        let mut max_characters = 0;
        // Held back until removals above have been announced
        let mut fault = None;
        for source in 0..self.shared.sources.len() {
            if token.is_cancelled() {
                break;
            }
            let cursor = self.cursors[source];
            if self.extents[source].is_end_of_section(cursor) {
                continue;
            }

            let upstream = &self.shared.sources[source];
            let remaining = self.extents[source].end() - cursor;
            let available = upstream.count().saturating_sub(cursor);
            let next_count = remaining.min(self.batch_size).min(available);
            if next_count == 0 {
                continue;
            }

            self.buffer.clear();
            if let Err(e) = upstream.get_section(Section::new(cursor, next_count), &mut self.buffer) {
                fault = Some(e);
                break;
            }
            for line in &self.buffer {
                let Some(timestamp) = line.timestamp else {
                    continue;
                };
                max_characters = max_characters.max(line.message.chars().count());
                candidates.push(MergedLine {
                    timestamp,
                    source,
                    original_index: line.line_index,
                    source_entry: line.log_entry_index,
                    entry_index: 0,
                });
            }
            self.cursors[source] = cursor + next_count;
            performed_work = true;
        }
        candidates.sort_unstable_by_key(MergedLine::key);

        let (announced, dirty_from, count) = {
            let mut lines = self.shared.lines.write();
            let announced = lines.len();
            // Lowest merged position whose content changed this tick
            let mut dirty_from = announced;
            for &(source, from) in &removals {
                dirty_from = dirty_from.min(remove_lines(&mut lines, source, from));
            }
            if let Some(first) = candidates.first().map(MergedLine::key) {
                let at = lines.partition_point(|l| l.key() < first);
                let tail = lines.split_off(at);
                merge_sorted(&mut lines, tail, candidates);
                dirty_from = dirty_from.min(at);
                trace!(at, count = lines.len(), "merged batch");
            }
            renumber(&mut lines, dirty_from);
            (announced, dirty_from, lines.len())
        };
        // Published once the lines they cover are in the view
        for (shared, &cursor) in self.shared.cursors.iter().zip(&self.cursors) {
            shared.store(cursor, Ordering::Release);
        }

        self.shared
            .max_characters_per_line
            .fetch_max(max_characters, Ordering::Relaxed);
        if dirty_from < announced {
            self.shared
                .listeners
                .invalidate(dirty_from, announced - dirty_from);
        }
        self.shared.listeners.on_read(count);

        let caught_up = (0..self.extents.len())
            .all(|s| self.extents[s].is_end_of_section(self.cursors[s]));
        if caught_up && self.shared.sources.iter().all(|s| s.end_of_source_reached()) {
            self.shared.end_of_source_reached.store(true, Ordering::Release);
        }

        if let Some(e) = fault {
            return Err(e);
        }
        if performed_work {
            Ok(Duration::ZERO)
        } else {
            Ok(self.maximum_wait)
        }
    }

    /// Forget what was read of `source` at or after upstream position `from`
    fn rewind(&mut self, source: usize, from: usize) {
        self.extents[source] = Section::new(0, from);
        self.cursors[source] = self.cursors[source].min(from);
    }
}

/// Drop the lines of `source` at or after upstream position `from`; returns
/// the first merged position affected
fn remove_lines(lines: &mut Vec<MergedLine>, source: usize, from: usize) -> usize {
    let removed = |l: &MergedLine| l.source == source && l.original_index >= from;
    let Some(at) = lines.iter().position(removed) else {
        return lines.len();
    };
    let tail = lines.split_off(at);
    lines.extend(tail.into_iter().filter(|l| !removed(l)));
    at
}

/// A log source interleaving the timestamped lines of several sources in
/// time order.
///
/// Equal timestamps keep source order. Lines without a timestamp are left
/// out. Like the filtered stage, the merge runs incrementally on a periodic
/// task and never rescans its sources.
pub struct MergedLogSource {
    shared: Arc<Shared>,
    listeners: Vec<Arc<dyn LogSourceListener>>,
    task: PeriodicTask,
}

impl MergedLogSource {
    pub fn new(
        scheduler: &dyn TaskScheduler,
        sources: Vec<Arc<dyn LogSource>>,
        options: StageOptions,
    ) -> Self {
        let batch_size = options.batch_size.max(1);
        let (tx, pending) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            cursors: sources.iter().map(|_| AtomicUsize::new(0)).collect(),
            sources,
            lines: RwLock::new(Vec::new()),
            listeners: ListenerCollection::new(),
            max_characters_per_line: AtomicUsize::new(0),
            end_of_source_reached: AtomicBool::new(false),
        });

        let listeners: Vec<Arc<dyn LogSourceListener>> = (0..shared.sources.len())
            .map(|source| {
                Arc::new(TaggedListener {
                    source,
                    tx: tx.clone(),
                }) as Arc<dyn LogSourceListener>
            })
            .collect();
        for (source, listener) in shared.sources.iter().zip(&listeners) {
            source.add_listener(Arc::clone(listener), options.maximum_wait(), batch_size);
        }

        let source_count = shared.sources.len();
        let mut task = MergeTask {
            shared: Arc::clone(&shared),
            pending,
            maximum_wait: options.maximum_wait(),
            batch_size,
            extents: vec![Section::default(); source_count],
            cursors: vec![0; source_count],
            buffer: Vec::new(),
        };
        let task = scheduler.schedule(
            "merged log source",
            Box::new(move |token: &CancellationToken| task.run_once(token)),
        );
        debug!(sources = source_count, batch_size, "created merged log source");

        Self {
            shared,
            listeners,
            task,
        }
    }

    pub fn sources(&self) -> &[Arc<dyn LogSource>] {
        &self.shared.sources
    }

    /// Which source the line at `index` came from
    pub fn source_of(&self, index: usize) -> Option<usize> {
        self.shared.lines.read().get(index).map(|l| l.source)
    }

    /// Position of line `original_index` of `source` in the merged view
    pub fn index_of(&self, source: usize, original_index: usize) -> Option<usize> {
        let timestamp = self
            .shared
            .sources
            .get(source)?
            .get_line(original_index)
            .ok()?
            .timestamp?;
        self.shared
            .lines
            .read()
            .binary_search_by_key(&(timestamp, source, original_index), MergedLine::key)
            .ok()
    }
}

impl Drop for MergedLogSource {
    fn drop(&mut self) {
        for (source, listener) in self.shared.sources.iter().zip(&self.listeners) {
            source.remove_listener(listener);
        }
        self.task.dispose();
        debug!("disposed merged log source");
    }
}

impl LogSource for MergedLogSource {
    fn count(&self) -> usize {
        self.shared.lines.read().len()
    }

    fn original_count(&self) -> usize {
        self.shared.sources.iter().map(|s| s.count()).sum()
    }

    fn max_characters_per_line(&self) -> usize {
        self.shared.max_characters_per_line.load(Ordering::Relaxed)
    }

    fn end_of_source_reached(&self) -> bool {
        self.shared.end_of_source_reached.load(Ordering::Acquire)
    }

    fn progress(&self) -> f64 {
        let sources = &self.shared.sources;
        if sources.is_empty() {
            return 1.0;
        }
        let total: f64 = sources
            .iter()
            .zip(&self.shared.cursors)
            .map(|(source, cursor)| {
                saturate_ratio(cursor.load(Ordering::Acquire), source.count()) * source.progress()
            })
            .sum();
        total / sources.len() as f64
    }

    fn start_timestamp(&self) -> Option<DateTime<Utc>> {
        self.shared.lines.read().first().map(|l| l.timestamp)
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.shared
            .sources
            .iter()
            .filter_map(|s| s.last_modified())
            .max()
    }

    fn size(&self) -> u64 {
        self.shared.sources.iter().map(|s| s.size()).sum()
    }

    fn get_line(&self, index: usize) -> Result<LogLine> {
        let lines = self.shared.lines.read();
        self.shared.line_at(&lines, index)
    }

    fn get_section(&self, section: Section, dest: &mut Vec<LogLine>) -> Result<()> {
        let lines = self.shared.lines.read();
        check_section(section, lines.len())?;
        let merged = section
            .indices()
            .map(|i| self.shared.line_at(&lines, i))
            .collect::<Result<Vec<_>>>()?;
        dest.extend(merged);
        Ok(())
    }

    fn get_original_index_from(&self, index: usize) -> Option<usize> {
        self.shared.lines.read().get(index).map(|l| l.original_index)
    }

    fn get_original_indices_from(&self, section: Section, dest: &mut Vec<Option<usize>>) {
        let lines = self.shared.lines.read();
        dest.extend(
            section
                .slots()
                .map(|slot| slot.and_then(|i| lines.get(i)).map(|l| l.original_index)),
        );
    }

    fn get_original_indices_of(&self, indices: &[usize], dest: &mut Vec<Option<usize>>) {
        let lines = self.shared.lines.read();
        dest.extend(
            indices
                .iter()
                .map(|&i| lines.get(i).map(|l| l.original_index)),
        );
    }

    fn get_log_line_index_of_original_line_index(&self, original_index: usize) -> Option<usize> {
        self.index_of(0, original_index)
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

impl std::fmt::Debug for MergedLogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedLogSource")
            .field("sources", &self.shared.sources.len())
            .field("count", &self.count())
            .field("task", &self.task)
            .finish()
    }
}
