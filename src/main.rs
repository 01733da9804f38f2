use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use tailscope_logs::{
    AndFilter, ChannelListener, EntryFilter, FilteredLogSource, InMemoryLogSource, LevelFilter,
    LineFilter, LogParser, LogSource, MergedLogSource, NoThrowFilter, PipelineConfig, RegexFilter,
    TokioTaskScheduler, WildcardFilter,
};
use tailscope_types::{LogLevel, LogLine, Modification, Section};

/// How often inputs are flushed and the exit condition is checked
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tailscope - follow logs through an incremental filter
#[derive(Parser, Debug)]
#[command(name = "tailscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log files to merge by timestamp (reads stdin when omitted)
    #[arg(value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Only show entries matching this wildcard pattern (`*` and `?`)
    #[arg(short, long)]
    pattern: Option<String>,

    /// Only show entries matching this regular expression
    #[arg(short = 'e', long, value_name = "REGEX")]
    regex: Option<String>,

    /// Show entries that do not match --regex instead
    #[arg(short = 'v', long, requires = "regex")]
    invert_match: bool,

    /// Match --pattern and --regex case-insensitively
    #[arg(short, long)]
    ignore_case: bool,

    /// Only show lines at or above this level
    #[arg(short, long, value_parser = parse_level)]
    level: Option<LogLevel>,

    /// Pipeline configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Keep running after the input is exhausted
    #[arg(short, long)]
    follow: bool,
}

fn parse_level(s: &str) -> Result<LogLevel, String> {
    match LogLevel::from_str(s) {
        LogLevel::Unknown => Err(format!("unknown level '{s}'")),
        level => Ok(level),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

/// One raw input feeding the pipeline
struct Input {
    name: String,
    source: Arc<InMemoryLogSource>,
    reader: JoinHandle<io::Result<usize>>,
}

impl Input {
    /// Start reading `reader` into a fresh source on its own thread
    fn spawn(name: String, reader: impl BufRead + Send + 'static) -> Result<Self> {
        let source = Arc::new(InMemoryLogSource::new());
        let target = Arc::clone(&source);
        // A plain thread, so a blocked stdin read never holds up exit
        let reader = std::thread::Builder::new()
            .name(format!("read {name}"))
            .spawn(move || read_into(reader, &target))
            .context("failed to spawn reader thread")?;
        Ok(Self {
            name,
            source,
            reader,
        })
    }
}

/// Parse lines from `reader` into `source` until EOF
fn read_into(reader: impl BufRead, source: &InMemoryLogSource) -> io::Result<usize> {
    let mut count = 0;
    for raw in reader.lines() {
        let raw = raw?;
        if count > 0 && LogParser::is_continuation(&raw) {
            source.append_continuation(&raw);
        } else {
            let parsed = LogParser::parse(&raw);
            source.append(&parsed.message, parsed.level, parsed.timestamp);
        }
        count += 1;
    }
    source.flush();
    Ok(count)
}

fn open_inputs(files: &[PathBuf]) -> Result<Vec<Input>> {
    if files.is_empty() {
        return Ok(vec![Input::spawn(
            "stdin".to_string(),
            BufReader::new(io::stdin()),
        )?]);
    }

    files
        .iter()
        .map(|path| {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let name = path
                .file_name()
                .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
            Input::spawn(name, BufReader::new(file))
        })
        .collect()
}

/// Writes the derived view to stdout as it changes
struct Printer {
    merged: Option<Arc<MergedLogSource>>,
    names: Vec<String>,
    /// Lines of the view written so far
    printed: usize,
    last_entry: Option<usize>,
    buffer: Vec<LogLine>,
}

impl Printer {
    fn apply(&mut self, view: &dyn LogSource, modification: Modification) -> Result<()> {
        match modification {
            Modification::Appended(section) => {
                // The view may have shrunk since this was sent; its
                // invalidation is already queued behind it
                let available = view
                    .count()
                    .saturating_sub(section.index)
                    .min(section.count);
                if available == 0 {
                    return Ok(());
                }

                self.buffer.clear();
                view.get_section(Section::new(section.index, available), &mut self.buffer)?;
                let mut out = io::stdout().lock();
                for line in &self.buffer {
                    writeln!(out, "{}", self.format(line))?;
                    self.last_entry = Some(line.log_entry_index);
                }
                out.flush()?;
                self.printed = section.index + available;
            }
            Modification::Invalidated(section) => {
                eprintln!("-- {} line(s) withdrawn --", section.count);
                self.printed = self.printed.min(section.index);
                self.last_entry = None;
            }
            Modification::Reset => {
                eprintln!("-- input reset --");
                self.printed = 0;
                self.last_entry = None;
            }
        }
        Ok(())
    }

    fn format(&self, line: &LogLine) -> String {
        // Continuation lines of an entry are printed bare
        if self.last_entry == Some(line.log_entry_index) {
            return line.message.clone();
        }

        let mut text = String::new();
        if let Some(source) = self
            .merged
            .as_ref()
            .and_then(|merged| merged.source_of(line.original_line_index))
        {
            if let Some(name) = self.names.get(source) {
                text.push_str(&format!("[{name}] "));
            }
        }
        if let Some(timestamp) = line.timestamp {
            text.push_str(&timestamp.format("%H:%M:%S%.3f ").to_string());
        }
        if line.level != LogLevel::Unknown {
            text.push_str(line.level.as_str());
            text.push(' ');
        }
        text.push_str(&line.message);
        text
    }
}

/// Combine --pattern and --regex into one guarded entry filter
fn build_entry_filter(args: &Args) -> Result<Option<Arc<dyn EntryFilter>>> {
    let mut filters: Vec<Arc<dyn EntryFilter>> = Vec::new();
    if let Some(pattern) = &args.pattern {
        let filter = WildcardFilter::new(pattern, args.ignore_case).context("invalid --pattern")?;
        filters.push(Arc::new(filter));
    }
    if let Some(regex) = &args.regex {
        let mut filter = RegexFilter::new(regex, args.ignore_case).context("invalid --regex")?;
        if args.invert_match {
            filter = filter.inverted();
        }
        filters.push(Arc::new(filter));
    }

    let combined: Arc<dyn EntryFilter> = match filters.len() {
        0 => return Ok(None),
        1 => filters.remove(0),
        _ => Arc::new(AndFilter::new(filters)),
    };
    Ok(Some(Arc::new(NoThrowFilter::new(combined))))
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let scheduler = TokioTaskScheduler::current();
    let inputs = open_inputs(&args.files)?;

    let merged = (inputs.len() > 1).then(|| {
        let sources = inputs
            .iter()
            .map(|input| Arc::clone(&input.source) as Arc<dyn LogSource>)
            .collect();
        Arc::new(MergedLogSource::new(&scheduler, sources, config.merge))
    });
    let upstream: Arc<dyn LogSource> = match &merged {
        Some(merged) => merged.clone(),
        None => inputs.first().context("no input to read")?.source.clone(),
    };

    let line_filter = args
        .level
        .map(|level| Arc::new(LevelFilter::at_least(level)) as Arc<dyn LineFilter>);
    let entry_filter = build_entry_filter(&args)?;

    let view = FilteredLogSource::new(&scheduler, upstream, line_filter, entry_filter, config.filter);
    let (listener, mut changes) = ChannelListener::new();
    view.add_listener(
        listener,
        config.listener.maximum_wait(),
        config.listener.maximum_batch,
    );
    info!(inputs = inputs.len(), follow = args.follow, "pipeline started");

    let mut printer = Printer {
        merged: merged.clone(),
        names: inputs.iter().map(|input| input.name.clone()).collect(),
        printed: 0,
        last_entry: None,
        buffer: Vec::new(),
    };

    let mut poll = tokio::time::interval(POLL_INTERVAL);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    // Consecutive polls that found everything printed
    let mut settled = 0;

    loop {
        tokio::select! {
            Some(modification) = changes.recv() => {
                printer.apply(&view, modification)?;
                settled = 0;
            }
            _ = poll.tick() => {
                for input in &inputs {
                    input.source.flush();
                }
                let exhausted = inputs.iter().all(|input| input.reader.is_finished());
                let caught_up = view.progress() >= 1.0 && printer.printed == view.count();
                if exhausted && caught_up && !args.follow {
                    settled += 1;
                    if settled >= 2 {
                        break;
                    }
                } else {
                    settled = 0;
                }
            }
            _ = &mut ctrl_c => {
                debug!("interrupted");
                break;
            }
        }
    }

    for input in inputs {
        if !input.reader.is_finished() {
            continue;
        }
        let count = input
            .reader
            .join()
            .map_err(|_| anyhow::anyhow!("reader for {} panicked", input.name))?
            .with_context(|| format!("failed to read {}", input.name))?;
        debug!(input = %input.name, count, "input finished");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(messages: &[&str]) -> Vec<LogLine> {
        messages
            .iter()
            .enumerate()
            .map(|(i, m)| LogLine::new(i, 0, *m, LogLevel::Info, None))
            .collect()
    }

    #[test]
    fn test_no_entry_filter_without_patterns() {
        let args = Args::parse_from(["tailscope"]);
        assert!(build_entry_filter(&args).unwrap().is_none());
    }

    #[test]
    fn test_pattern_and_regex_combine() {
        let args = Args::parse_from(["tailscope", "-p", "disk*", "-e", r"\d+%", "-i"]);
        let filter = build_entry_filter(&args).unwrap().unwrap();

        assert!(filter.passes_entry_filter(&entry(&["DISK usage at 91%"])));
        assert!(!filter.passes_entry_filter(&entry(&["disk usage high"])));
        assert!(!filter.passes_entry_filter(&entry(&["cpu at 91%"])));
    }

    #[test]
    fn test_inverted_regex() {
        let args = Args::parse_from(["tailscope", "-e", "health", "-v"]);
        let filter = build_entry_filter(&args).unwrap().unwrap();

        assert!(!filter.passes_entry_filter(&entry(&["GET /health 200"])));
        assert!(filter.passes_entry_filter(&entry(&["GET /orders 500", "  at handler"])));
    }

    #[test]
    fn test_invalid_regex_is_reported() {
        let args = Args::parse_from(["tailscope", "--regex", "(unclosed"]);
        let Err(err) = build_entry_filter(&args) else {
            panic!("expected build_entry_filter to fail");
        };
        assert!(format!("{err:#}").contains("invalid --regex"));
    }

    #[test]
    fn test_invert_requires_regex() {
        assert!(Args::try_parse_from(["tailscope", "-v"]).is_err());
    }
}
