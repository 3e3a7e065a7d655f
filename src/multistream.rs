use crate::config::{DEFAULT_BATCH_SIZE, QUEUE_DEPTH_FACTOR};
use crate::models::{Header, Page};
use crate::parser::{parse_header, DumpParser};
use crate::pipeline::{Batch, Emitter, Source};
use anyhow::{anyhow, bail, Context, Result};
use bzip2::read::{BzDecoder, MultiBzDecoder};
use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

/// One independent bzip2 stream inside the pages file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start: u64,
    pub size: u64,
}

enum PageBlock {
    Data { block: Block, bytes: Vec<u8> },
    Eof,
}

/// Reads the multistream index and turns it into a sequence of blocks.
///
/// Index lines have the form `offset:pageId:title`, ordered by offset, with
/// every page of a block sharing that block's offset. Distinct offsets become
/// block boundaries; the final block runs to the end of the pages file. The
/// resulting blocks partition `[0, pages_len)` exactly. Only a bounded number
/// of blocks is buffered ahead so arbitrarily large indexes stream in
/// constant memory.
pub struct IndexReader {
    reader: Option<Box<dyn BufRead + Send>>,
    pages_len: u64,
    buffer_ahead: usize,
    pending: VecDeque<Block>,
    start: u64,
}

impl IndexReader {
    /// Opens an index file; a `.bz2` extension selects bzip2 decompression.
    pub fn open(index: &Path, pages_len: u64, buffer_ahead: usize) -> Result<Self> {
        let file = File::open(index)
            .with_context(|| format!("opening index file: {}", index.display()))?;

        let reader: Box<dyn BufRead + Send> = if index.extension().is_some_and(|e| e == "bz2") {
            Box::new(BufReader::new(MultiBzDecoder::new(BufReader::new(file))))
        } else {
            Box::new(BufReader::new(file))
        };

        Ok(Self {
            reader: Some(reader),
            pages_len,
            buffer_ahead: buffer_ahead.max(1),
            pending: VecDeque::new(),
            start: 0,
        })
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };

        let mut line = String::new();
        while self.pending.len() < self.buffer_ahead {
            line.clear();
            let n = reader.read_line(&mut line).context("reading index line")?;
            if n == 0 {
                // Index exhausted: the final block runs to the end of the
                // pages file. A zero-size tail is not a block.
                if self.pages_len > self.start {
                    self.pending.push_back(Block {
                        start: self.start,
                        size: self.pages_len - self.start,
                    });
                }
                self.reader = None;
                break;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let offset: u64 = line
                .split(':')
                .next()
                .unwrap_or_default()
                .parse()
                .with_context(|| format!("malformed index line: {line:?}"))?;

            if offset < self.start {
                bail!(
                    "index offsets are not monotonic: {} after {}",
                    offset,
                    self.start
                );
            }
            if offset > self.start {
                self.pending.push_back(Block {
                    start: self.start,
                    size: offset - self.start,
                });
                self.start = offset;
            }
        }

        Ok(())
    }

    /// Next block without consuming it.
    pub fn peek(&mut self) -> Result<Option<Block>> {
        if self.pending.is_empty() {
            self.fill_buffer()?;
        }
        Ok(self.pending.front().copied())
    }

    pub fn next_block(&mut self) -> Result<Option<Block>> {
        if self.pending.is_empty() {
            self.fill_buffer()?;
        }
        Ok(self.pending.pop_front())
    }
}

/// Sequential reader of raw block bytes from the pages file.
///
/// Blocks arrive from the index in file order and are contiguous, so the
/// file is read strictly forward without seeking.
pub struct BlockReader {
    index: IndexReader,
    pages: File,
}

impl BlockReader {
    pub fn open(index_path: &Path, pages_path: &Path, buffer_ahead: usize) -> Result<Self> {
        let pages = File::open(pages_path)
            .with_context(|| format!("opening pages file: {}", pages_path.display()))?;
        let pages_len = pages.metadata().context("reading pages file metadata")?.len();
        let index = IndexReader::open(index_path, pages_len, buffer_ahead)?;

        Ok(Self { index, pages })
    }

    /// Consumes the first block and parses it as the dump header.
    ///
    /// The header stream stops at the document start, so a synthetic root
    /// close is appended before parsing.
    pub fn read_header(&mut self) -> Result<Header> {
        let (_, bytes) = self
            .next()?
            .context("pages file has no blocks to read a header from")?;

        let mut xml = Vec::new();
        BzDecoder::new(&bytes[..])
            .read_to_end(&mut xml)
            .context("decompressing header block")?;

        let mut xml = String::from_utf8_lossy(&xml).into_owned();
        xml.push_str("</mediawiki>");
        parse_header(&xml)
    }

    pub fn next(&mut self) -> Result<Option<(Block, Vec<u8>)>> {
        let Some(block) = self.index.next_block()? else {
            return Ok(None);
        };

        let mut bytes = vec![0u8; block.size as usize];
        self.pages.read_exact(&mut bytes).with_context(|| {
            format!(
                "pages file ended inside block at offset {} ({} bytes)",
                block.start, block.size
            )
        })?;

        Ok(Some((block, bytes)))
    }
}

/// Cooperative shutdown signal shared by the producer and all workers.
///
/// Cancelling drops the only sender, which disconnects every receiver clone
/// at once; anything blocked in a `select!` on the receiver wakes up.
#[derive(Clone)]
struct CancelToken {
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl CancelToken {
    fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    fn cancel(&self) {
        self.tx.lock().unwrap().take();
    }

    fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

/// A worker's view of its share of the dump: blocks pulled off the shared
/// queue, exposed as one continuous byte stream.
///
/// The current and previous block are retained for postmortem dumps when a
/// downstream failure makes the offending input worth keeping.
struct BlockStream {
    blocks: Receiver<PageBlock>,
    cancel: Receiver<()>,
    current: Option<(Block, Vec<u8>)>,
    prev: Option<(Block, Vec<u8>)>,
    pos: usize,
    done: bool,
    cancelled: bool,
}

impl BlockStream {
    fn mid_block(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|(_, bytes)| self.pos < bytes.len())
    }

    fn new(blocks: Receiver<PageBlock>, cancel: Receiver<()>) -> Self {
        Self {
            blocks,
            cancel,
            current: None,
            prev: None,
            pos: 0,
            done: false,
            cancelled: false,
        }
    }
}

impl Read for BlockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.done {
                return Ok(0);
            }

            // A dropped cancel sender ends the stream immediately, even with
            // block bytes still buffered; the unread remainder stays in
            // `current` for the postmortem dump.
            if matches!(self.cancel.try_recv(), Err(TryRecvError::Disconnected)) {
                self.cancelled = true;
                self.done = true;
                return Ok(0);
            }

            if let Some((_, bytes)) = &self.current {
                if self.pos < bytes.len() {
                    let n = (bytes.len() - self.pos).min(buf.len());
                    buf[..n].copy_from_slice(&bytes[self.pos..self.pos + n]);
                    self.pos += n;
                    return Ok(n);
                }
            }

            select! {
                recv(self.blocks) -> msg => match msg {
                    Ok(PageBlock::Data { block, bytes }) => {
                        self.prev = self.current.take();
                        self.current = Some((block, bytes));
                        self.pos = 0;
                    }
                    Ok(PageBlock::Eof) | Err(_) => self.done = true,
                },
                recv(self.cancel) -> _ => {
                    self.cancelled = true;
                    self.done = true;
                }
            }
        }
    }
}

fn dump_block(dir: &Path, kind: &str, slot: &Option<(Block, Vec<u8>)>) {
    let Some((block, bytes)) = slot else {
        return;
    };

    let path = dir.join(format!("stream-{kind}-{}-{}.xml.bz2", block.start, block.size));
    match fs::write(&path, bytes) {
        Ok(()) => warn!(path = %path.display(), "saved failing block for postmortem"),
        Err(e) => error!(error = %e, path = %path.display(), "could not save failing block"),
    }
}

fn dump_blocks(dir: &Path, stream: &BlockStream) {
    dump_block(dir, "current", &stream.current);
    dump_block(dir, "prev", &stream.prev);
}

fn run_worker(
    header: Arc<Header>,
    stream: BlockStream,
    emitter: &Emitter<Page, ()>,
    batch_size: usize,
    dump_dir: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let mut parser = DumpParser::with_header(header, BufReader::new(MultiBzDecoder::new(stream)));
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        let page = match parser.next_page() {
            Ok(page) => page,
            Err(e) => {
                dump_blocks(dump_dir, parser.get_ref().get_ref().get_ref());
                cancel.cancel();
                return Err(e.context("decoding page block"));
            }
        };

        match page {
            Some(page) => {
                batch.push(page);
                if batch.len() == batch_size {
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                    if let Err(e) = emitter.output(Batch::new(full)) {
                        dump_blocks(dump_dir, parser.get_ref().get_ref().get_ref());
                        cancel.cancel();
                        return Err(e.context("emitting page batch"));
                    }
                }
            }
            None => break,
        }
    }

    // On cancellation another worker already failed; the partial batch is
    // not worth emitting into an aborting pipeline, but a block abandoned
    // mid-parse is kept alongside the failing worker's dumps.
    let stream = parser.get_ref().get_ref().get_ref();
    if stream.cancelled {
        debug!("worker stopped by cancellation");
        if stream.mid_block() {
            dump_block(dump_dir, "current", &stream.current);
        }
        return Ok(());
    }

    if !batch.is_empty() {
        if let Err(e) = emitter.output(Batch::new(batch)) {
            dump_blocks(dump_dir, parser.get_ref().get_ref().get_ref());
            cancel.cancel();
            return Err(e.context("emitting final page batch"));
        }
    }

    Ok(())
}

/// Parallel page source over a multistream bzip2 dump.
///
/// A producer thread walks the index and feeds raw blocks into a bounded
/// queue; each worker pulls blocks, decompresses and parses them, and emits
/// page batches downstream. Blocks are independent bzip2 streams, so workers
/// never coordinate; as a consequence pages reach the sinks in no particular
/// global order.
pub struct MultistreamSource {
    index_path: PathBuf,
    pages_path: PathBuf,
    batch_size: usize,
    workers: usize,
    dump_dir: PathBuf,
    emitter: Emitter<Page, ()>,
}

impl MultistreamSource {
    pub fn new(index_path: impl Into<PathBuf>, pages_path: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            pages_path: pages_path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            dump_dir: PathBuf::from("."),
            emitter: Emitter::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Directory receiving postmortem block dumps on worker failure.
    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = dir.into();
        self
    }
}

impl Source<Page, ()> for MultistreamSource {
    fn emitter(&self) -> &Emitter<Page, ()> {
        &self.emitter
    }

    fn run(&self) -> Result<()> {
        let queue_depth = self.workers * QUEUE_DEPTH_FACTOR;
        let mut reader = BlockReader::open(&self.index_path, &self.pages_path, queue_depth)?;
        let header = Arc::new(reader.read_header()?);
        info!(
            lang = %header.lang,
            site = %header.siteinfo.sitename,
            workers = self.workers,
            batch_size = self.batch_size,
            "starting multistream dump parse"
        );

        let (block_tx, block_rx) = bounded(queue_depth);
        let cancel = CancelToken::new();
        let cancel_rx = cancel.receiver();
        let batch_size = self.batch_size;

        let results: Vec<Result<()>> = thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..self.workers {
                let stream = BlockStream::new(block_rx.clone(), cancel.receiver());
                let header = header.clone();
                let cancel = cancel.clone();
                let emitter = &self.emitter;
                let dump_dir = self.dump_dir.as_path();
                handles.push(scope.spawn(move || {
                    run_worker(header, stream, emitter, batch_size, dump_dir, &cancel)
                }));
            }

            let produced = (|| -> Result<()> {
                while let Some((block, bytes)) = reader.next()? {
                    select! {
                        send(block_tx, PageBlock::Data { block, bytes }) -> res => {
                            if res.is_err() {
                                break;
                            }
                        }
                        recv(cancel_rx) -> _ => break,
                    }
                }
                Ok(())
            })();

            // One end-of-input sentinel per worker; skipped once cancelled,
            // since dropping the sender wakes everyone anyway.
            'sentinels: for _ in 0..self.workers {
                if cancel.is_cancelled() {
                    break;
                }
                select! {
                    send(block_tx, PageBlock::Eof) -> _ => {}
                    recv(cancel_rx) -> _ => break 'sentinels,
                }
            }
            drop(block_tx);

            let mut results: Vec<Result<()>> = handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("dump worker panicked")))
                })
                .collect();
            results.push(produced);
            results
        });

        let mut failures = results.into_iter().filter_map(|result| result.err());
        if let Some(first) = failures.next() {
            for other in failures {
                error!(error = format!("{other:#}"), "additional worker failure");
            }
            return Err(first);
        }

        self.emitter.output(Batch::end())
    }
}
