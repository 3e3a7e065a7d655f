use crate::config::DEFAULT_BATCH_SIZE;
use crate::models::Page;
use crate::parser::DumpParser;
use crate::pipeline::{Batch, Emitter, Source};
use anyhow::{Context, Result};
use bzip2::read::MultiBzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::info;

/// Single-threaded page source over a plain or bzip2-compressed dump.
///
/// The whole dump is one XML document read front to back, so pages are
/// emitted in document order. Useful for small dumps and for checking the
/// parallel source against a known-good sequence.
pub struct SinglestreamSource {
    path: PathBuf,
    batch_size: usize,
    emitter: Emitter<Page, ()>,
}

impl SinglestreamSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            emitter: Emitter::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn open(&self) -> Result<Box<dyn BufRead>> {
        let file = File::open(&self.path)
            .with_context(|| format!("opening dump file: {}", self.path.display()))?;

        Ok(if self.path.extension().is_some_and(|e| e == "bz2") {
            Box::new(BufReader::new(MultiBzDecoder::new(BufReader::new(file))))
        } else {
            Box::new(BufReader::new(file))
        })
    }
}

impl Source<Page, ()> for SinglestreamSource {
    fn emitter(&self) -> &Emitter<Page, ()> {
        &self.emitter
    }

    fn run(&self) -> Result<()> {
        let mut parser = DumpParser::new(self.open()?)?;
        let header = parser.header();
        info!(
            lang = %header.lang,
            site = %header.siteinfo.sitename,
            batch_size = self.batch_size,
            "starting singlestream dump parse"
        );

        let mut batch = Vec::with_capacity(self.batch_size);
        while let Some(page) = parser.next_page()? {
            batch.push(page);
            if batch.len() == self.batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                self.emitter.output(Batch::new(full))?;
            }
        }

        if !batch.is_empty() {
            self.emitter.output(Batch::new(batch))?;
        }
        self.emitter.output(Batch::end())
    }
}
