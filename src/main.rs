use anyhow::{Context, Result};
use clap::Parser;
use indicatif::ProgressBar;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, trace, warn, Level};
use tracing_subscriber::FmtSubscriber;
use wikistream::config::{DEFAULT_BATCH_SIZE, DEFAULT_SPLIT_LIMIT, PROGRESS_INTERVAL};
use wikistream::models::{Page, PageRecord};
use wikistream::multistream::MultistreamSource;
use wikistream::pipeline::{Batch, Filter, FnMapper, PipelineBuilder, Predicate, Sink};
use wikistream::singlestream::SinglestreamSource;
use wikistream::split::SplitWriterPool;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "wikistream")]
#[command(about = "Convert MediaWiki dumps into line-delimited JSON page records")]
struct Cli {
    /// Path to the pages dump (.xml or .xml.bz2)
    #[arg(short, long)]
    pages: PathBuf,

    /// Multistream index file (.txt or .txt.bz2); enables parallel decompression
    #[arg(short, long)]
    index: Option<PathBuf>,

    /// Output directory for split files
    #[arg(short, long)]
    output: PathBuf,

    /// Number of decompression workers (multistream only)
    #[arg(short, long, default_value_t = default_threads())]
    threads: usize,

    /// Pages per batch between pipeline stages
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Size limit of one output split in bytes
    #[arg(long, default_value_t = DEFAULT_SPLIT_LIMIT)]
    split_limit: u64,

    /// Maximum number of concurrently open split files
    #[arg(long, default_value_t = 4)]
    max_writers: usize,

    /// Compress output splits with gzip
    #[arg(long)]
    gzip: bool,

    /// Keep only pages in these namespaces (repeatable)
    #[arg(long = "namespace")]
    namespaces: Vec<i32>,

    /// Keep roughly the first N parsed pages (for testing)
    #[arg(long)]
    limit: Option<u64>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Counts parsed pages and drives a terminal spinner; taps the raw page
/// stream before any filtering.
struct ProgressSink {
    bar: ProgressBar,
    pages: AtomicU64,
    batches: AtomicU64,
}

impl ProgressSink {
    fn new() -> Self {
        Self {
            bar: ProgressBar::new_spinner(),
            pages: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    fn pages(&self) -> u64 {
        self.pages.load(Ordering::Relaxed)
    }
}

impl Sink<Page> for ProgressSink {
    fn process(&self, batch: Batch<Page>) -> Result<()> {
        if batch.is_end() {
            self.bar.finish_and_clear();
            return Ok(());
        }

        let total = self.pages.fetch_add(batch.len() as u64, Ordering::Relaxed) + batch.len() as u64;
        if self.batches.fetch_add(1, Ordering::Relaxed) % PROGRESS_INTERVAL == 0 {
            self.bar.set_message(format!("{total} pages"));
            self.bar.tick();
        }
        Ok(())
    }
}

/// Error-channel sink: pages that failed serialization are reported and
/// dropped rather than aborting the run.
struct DroppedPageSink;

impl Sink<Page> for DroppedPageSink {
    fn process(&self, batch: Batch<Page>) -> Result<()> {
        for page in batch.iter() {
            warn!(id = page.id, title = %page.title, "Dropping page that failed serialization");
        }
        Ok(())
    }
}

struct LogSink;

impl Sink<String> for LogSink {
    fn process(&self, batch: Batch<String>) -> Result<()> {
        for message in batch.iter() {
            trace!("{message}");
        }
        Ok(())
    }
}

fn run_convert(args: Cli) -> Result<()> {
    fs::create_dir_all(&args.output).with_context(|| {
        format!("Failed to create output directory: {}", args.output.display())
    })?;

    let pool = Arc::new(if args.gzip {
        SplitWriterPool::gzip_lines(&args.output, args.max_writers, args.split_limit)?
    } else {
        SplitWriterPool::lines(&args.output, args.max_writers, args.split_limit)?
    });

    let mut predicates: Vec<Predicate<Page>> = Vec::new();
    if !args.namespaces.is_empty() {
        let allowed: HashSet<i32> = args.namespaces.iter().copied().collect();
        predicates.push(Box::new(move |page: &Page| {
            allowed.contains(&page.namespace)
        }));
    }
    if let Some(limit) = args.limit {
        let passed = AtomicU64::new(0);
        predicates.push(Box::new(move |_: &Page| {
            passed.fetch_add(1, Ordering::Relaxed) < limit
        }));
    }

    let progress = Arc::new(ProgressSink::new());
    let start = Instant::now();

    let builder = match &args.index {
        Some(index) => {
            info!(
                index = %index.display(),
                pages = %args.pages.display(),
                "Multistream mode"
            );
            PipelineBuilder::input(
                MultistreamSource::new(index, &args.pages)
                    .with_batch_size(args.batch_size)
                    .with_workers(args.threads)
                    .with_dump_dir(&args.output),
            )
        }
        None => {
            info!(pages = %args.pages.display(), "Singlestream mode");
            PipelineBuilder::input(
                SinglestreamSource::new(&args.pages).with_batch_size(args.batch_size),
            )
        }
    };

    builder
        .send_output(progress.clone())
        .pipe(Filter::merged(predicates))
        .pipe(FnMapper::per_item(|page: &Page| {
            serde_json::to_string(&PageRecord::from(page)).map_err(Into::into)
        }))
        .send_error(Arc::new(DroppedPageSink))
        .send_log(Arc::new(LogSink))
        .pipe_sink(pool.clone())
        .run()?;

    let duration = start.elapsed();
    println!();
    println!("=== Summary ===");
    println!("Pages parsed:    {}", progress.pages());
    println!("Records written: {}", pool.total_written());
    println!("Elapsed:         {:.2}s", duration.as_secs_f64());
    println!("Output:          {}", args.output.display());

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    match run_convert(cli) {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
