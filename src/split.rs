use crate::config::{COUNT_FILE, SPLIT_COUNTER_WIDTH, SPLIT_PREFIX};
use crate::pipeline::{Batch, Sink};
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use tracing::{debug, info};

/// One open split file.
///
/// `write` returns `Ok(false)` without writing when the item would push the
/// split past its size limit, so the caller rotates to a fresh split first.
/// A fresh split always accepts at least one item; items are never split
/// across files.
pub trait ItemWriter<T>: Send {
    fn write(&mut self, item: &T) -> Result<bool>;

    fn is_full(&self) -> bool;

    fn finish(&mut self) -> Result<()>;
}

/// Newline-delimited UTF-8 writer with a byte size limit.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
    limit: u64,
    written: u64,
}

impl<W: Write> LineWriter<W> {
    pub fn new(writer: W, limit: u64) -> Self {
        Self {
            writer: BufWriter::new(writer),
            limit,
            written: 0,
        }
    }
}

impl<W: Write + Send> ItemWriter<String> for LineWriter<W> {
    fn write(&mut self, item: &String) -> Result<bool> {
        let len = item.len() as u64 + 1;
        if self.written > 0 && self.written + len > self.limit {
            return Ok(false);
        }

        self.writer.write_all(item.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.written += len;
        Ok(true)
    }

    fn is_full(&self) -> bool {
        self.written >= self.limit
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("flushing split writer")
    }
}

/// Gzip variant of [`LineWriter`]. `finish` writes the gzip trailer itself,
/// so a failed trailer write (disk full at close) fails the run instead of
/// vanishing in drop.
struct GzipLineWriter<W: Write> {
    inner: LineWriter<GzEncoder<W>>,
}

impl<W: Write> GzipLineWriter<W> {
    fn new(writer: W, limit: u64) -> Self {
        Self {
            inner: LineWriter::new(GzEncoder::new(writer, Compression::fast()), limit),
        }
    }
}

impl<W: Write + Send> ItemWriter<String> for GzipLineWriter<W> {
    fn write(&mut self, item: &String) -> Result<bool> {
        self.inner.write(item)
    }

    fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()?;
        self.inner
            .writer
            .get_mut()
            .try_finish()
            .context("writing gzip trailer")
    }
}

type WriterFactory<T> = Box<dyn Fn(&Path) -> Result<Box<dyn ItemWriter<T>>> + Send + Sync>;

struct PoolState<T> {
    idle: Vec<Box<dyn ItemWriter<T>>>,
    open: usize,
    splits: u64,
    closed: bool,
}

/// Concurrency-safe terminal sink that rotates size-limited split files.
///
/// At most `max_writers` splits are open at once. Writers are reused from an
/// idle free list; when the list is empty and the pool is at capacity,
/// acquisition blocks until a writer is released. A writer that reports
/// itself full on release is closed, making room for a new split.
///
/// `close` (triggered by the end-of-stream batch) flushes the remaining idle
/// writers and records the total item count in a `_count` trailer file so
/// consumers need not scan every split.
pub struct SplitWriterPool<T> {
    base: PathBuf,
    factory: WriterFactory<T>,
    max_writers: usize,
    state: Mutex<PoolState<T>>,
    available: Condvar,
    written: AtomicU64,
}

impl<T> SplitWriterPool<T> {
    pub fn new(
        base: impl Into<PathBuf>,
        max_writers: usize,
        factory: WriterFactory<T>,
    ) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base)
            .with_context(|| format!("creating split directory: {}", base.display()))?;

        Ok(Self {
            base,
            factory,
            max_writers: max_writers.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                splits: 0,
                closed: false,
            }),
            available: Condvar::new(),
            written: AtomicU64::new(0),
        })
    }

    /// Total number of items written so far.
    pub fn total_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn acquire(&self) -> Result<Box<dyn ItemWriter<T>>> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(writer) = state.idle.pop() {
                return Ok(writer);
            }

            if state.open < self.max_writers {
                state.open += 1;
                state.splits += 1;
                let split = state.splits;
                drop(state);

                let path = self.base.join(format!(
                    "{}{:0width$}",
                    SPLIT_PREFIX,
                    split,
                    width = SPLIT_COUNTER_WIDTH
                ));
                debug!(path = %path.display(), "opening split");

                return match (self.factory)(&path) {
                    Ok(writer) => Ok(writer),
                    Err(e) => {
                        let mut state = self.state.lock().unwrap();
                        state.open -= 1;
                        drop(state);
                        self.available.notify_all();
                        Err(e).with_context(|| format!("opening split: {}", path.display()))
                    }
                };
            }

            state = self.available.wait(state).unwrap();
        }
    }

    fn release(&self, writer: Box<dyn ItemWriter<T>>) -> Result<()> {
        if writer.is_full() {
            self.retire(writer)
        } else {
            let mut state = self.state.lock().unwrap();
            state.idle.push(writer);
            drop(state);
            self.available.notify_all();
            Ok(())
        }
    }

    /// Closes a writer and frees its pool slot.
    fn retire(&self, mut writer: Box<dyn ItemWriter<T>>) -> Result<()> {
        let finished = writer.finish();
        let mut state = self.state.lock().unwrap();
        state.open -= 1;
        drop(state);
        self.available.notify_all();
        finished.context("closing split")
    }

    fn discard(&self, writer: Box<dyn ItemWriter<T>>) {
        let _ = self.retire(writer);
    }

    /// Writes a batch, rotating to new splits as writers fill up.
    pub fn write_batch(&self, batch: &[T]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut writer = self.acquire()?;
        for item in batch {
            loop {
                match writer.write(item) {
                    Ok(true) => break,
                    // A rejecting writer cannot take this item and must not go
                    // back on the idle list, or acquisition could hand it
                    // straight back. Close it and open a fresh split.
                    Ok(false) => {
                        self.retire(writer)?;
                        writer = self.acquire()?;
                    }
                    Err(e) => {
                        self.discard(writer);
                        return Err(e).context("writing item to split");
                    }
                }
            }
        }
        self.release(writer)?;

        self.written.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Flushes and closes all idle writers, then records the total item
    /// count in the trailer file.
    pub fn close(&self) -> Result<()> {
        let idle = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.open -= idle.len();
            idle
        };

        for mut writer in idle {
            writer.finish()?;
        }

        let total = self.total_written();
        let trailer = self.base.join(COUNT_FILE);
        fs::write(&trailer, format!("{total}\n"))
            .with_context(|| format!("writing trailer: {}", trailer.display()))?;

        info!(total, path = %self.base.display(), "split writer pool closed");
        Ok(())
    }
}

impl SplitWriterPool<String> {
    /// Pool of plain-text line splits.
    pub fn lines(base: impl Into<PathBuf>, max_writers: usize, limit: u64) -> Result<Self> {
        Self::new(
            base,
            max_writers,
            Box::new(move |path| {
                let file = File::create(path)?;
                Ok(Box::new(LineWriter::new(file, limit)))
            }),
        )
    }

    /// Pool of gzip-compressed line splits (`part-NNNNN.gz`), favoring
    /// compression speed over ratio. The size limit applies to the
    /// uncompressed byte count.
    pub fn gzip_lines(base: impl Into<PathBuf>, max_writers: usize, limit: u64) -> Result<Self> {
        Self::new(
            base,
            max_writers,
            Box::new(move |path| {
                let path = path.with_extension("gz");
                let file = File::create(&path)?;
                Ok(Box::new(GzipLineWriter::new(file, limit)))
            }),
        )
    }
}

impl<T: Send + Sync> Sink<T> for SplitWriterPool<T> {
    fn process(&self, batch: Batch<T>) -> Result<()> {
        if batch.is_end() {
            self.close()
        } else {
            self.write_batch(&batch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn split_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(SPLIT_PREFIX))
            })
            .collect();
        files.sort();
        files
    }

    fn batch_of(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rotates_at_size_limit_and_records_count() {
        let dir = TempDir::new().unwrap();
        let pool = SplitWriterPool::lines(dir.path(), 1, 10).unwrap();

        // Five 4-byte items against a 10-byte limit: 2 + 2 + 1 items.
        pool.write_batch(&batch_of(&["aaaa", "bbbb", "cccc", "dddd", "eeee"]))
            .unwrap();
        pool.close().unwrap();

        let files = split_files(dir.path());
        assert_eq!(files.len(), 3);

        let lines_per_split: Vec<usize> = files
            .iter()
            .map(|path| fs::read_to_string(path).unwrap().lines().count())
            .collect();
        assert_eq!(lines_per_split, vec![2, 2, 1]);

        let count = fs::read_to_string(dir.path().join(COUNT_FILE)).unwrap();
        assert_eq!(count.trim(), "5");
    }

    #[test]
    fn oversized_item_is_never_split() {
        let dir = TempDir::new().unwrap();
        let pool = SplitWriterPool::lines(dir.path(), 1, 4).unwrap();

        pool.write_batch(&batch_of(&["this line is much longer than the limit"]))
            .unwrap();
        pool.close().unwrap();

        let files = split_files(dir.path());
        assert_eq!(files.len(), 1);
        let content = fs::read_to_string(&files[0]).unwrap();
        assert_eq!(content, "this line is much longer than the limit\n");
    }

    #[test]
    fn idle_writer_is_reused_across_batches() {
        let dir = TempDir::new().unwrap();
        let pool = SplitWriterPool::lines(dir.path(), 4, 1024).unwrap();

        pool.write_batch(&batch_of(&["one"])).unwrap();
        pool.write_batch(&batch_of(&["two"])).unwrap();
        pool.close().unwrap();

        let files = split_files(dir.path());
        assert_eq!(files.len(), 1);
        assert_eq!(fs::read_to_string(&files[0]).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn end_batch_closes_the_pool() {
        let dir = TempDir::new().unwrap();
        let pool = SplitWriterPool::lines(dir.path(), 2, 1024).unwrap();

        pool.process(Batch::new(batch_of(&["row"]))).unwrap();
        pool.process(Batch::end()).unwrap();

        assert!(dir.path().join(COUNT_FILE).exists());
        let count = fs::read_to_string(dir.path().join(COUNT_FILE)).unwrap();
        assert_eq!(count.trim(), "1");
    }

    #[test]
    fn never_exceeds_max_writers() {
        struct CountingWriter {
            open: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
            writes: u64,
        }

        impl CountingWriter {
            fn new(open: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
                let now = open.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                Self {
                    open,
                    peak,
                    writes: 0,
                }
            }
        }

        impl ItemWriter<String> for CountingWriter {
            fn write(&mut self, _item: &String) -> Result<bool> {
                if self.writes >= 2 {
                    return Ok(false);
                }
                self.writes += 1;
                thread::yield_now();
                Ok(true)
            }

            fn is_full(&self) -> bool {
                self.writes >= 2
            }

            fn finish(&mut self) -> Result<()> {
                self.open.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let open = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let factory_open = open.clone();
        let factory_peak = peak.clone();
        let pool = Arc::new(
            SplitWriterPool::<String>::new(
                dir.path(),
                2,
                Box::new(move |_path| {
                    Ok(Box::new(CountingWriter::new(
                        factory_open.clone(),
                        factory_peak.clone(),
                    )))
                }),
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for worker in 0..4 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for i in 0..20 {
                    pool.write_batch(&[format!("w{worker}-{i}")]).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        pool.close().unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.total_written(), 80);
    }

    #[test]
    fn gzip_trailer_write_failure_surfaces_on_finish() {
        use std::sync::atomic::AtomicBool;

        struct FlakyWriter {
            fail: Arc<AtomicBool>,
        }

        impl Write for FlakyWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                if self.fail.load(Ordering::SeqCst) {
                    Err(std::io::Error::other("disk full"))
                } else {
                    Ok(buf.len())
                }
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let fail = Arc::new(AtomicBool::new(false));
        let mut writer = GzipLineWriter::new(FlakyWriter { fail: fail.clone() }, 1024);
        assert!(writer.write(&"row".to_string()).unwrap());

        fail.store(true, Ordering::SeqCst);
        assert!(writer.finish().is_err());
    }

    #[test]
    fn gzip_splits_round_trip() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let dir = TempDir::new().unwrap();
        let pool = SplitWriterPool::gzip_lines(dir.path(), 1, 1024).unwrap();

        pool.write_batch(&batch_of(&["alpha", "beta"])).unwrap();
        pool.close().unwrap();

        let files = split_files(dir.path());
        assert_eq!(files.len(), 1);
        assert!(files[0].extension().is_some_and(|e| e == "gz"));

        let mut decoded = String::new();
        GzDecoder::new(File::open(&files[0]).unwrap())
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded, "alpha\nbeta\n");
    }
}
