//! Wikistream: parallel MediaWiki dump parsing and conversion
//!
//! This crate turns MediaWiki XML dumps into streams of structured page
//! records, built around the multistream dump layout:
//!
//! 1. **Index pass** -- Stream the `offset:pageId:title` index and partition
//!    the pages file into independent bzip2 blocks
//! 2. **Parallel decompression** -- A producer feeds raw blocks into a bounded
//!    queue; worker threads decompress and parse them concurrently
//! 3. **Pipeline** -- Parsed pages flow through filter and mapper stages to
//!    terminal sinks, with batch granularity and synchronous backpressure
//! 4. **Split output** -- A concurrency-safe writer pool rotates size-limited
//!    output files and records a total item count trailer
//!
//! # Architecture
//!
//! - **Streaming XML parsing** -- Event-based, never loads a document into
//!   memory, and tolerates the unbalanced fragments multistream blocks are
//! - **Bounded memory** -- Block queue depth and index read-ahead scale with
//!   the worker count, independent of dump size
//! - **Cooperative shutdown** -- A failing worker saves its current block for
//!   postmortem inspection and cancels the rest of the run
//!
//! # Key Modules
//!
//! - [`parser`] -- Streaming XML parser for dumps and dump fragments
//! - [`multistream`] -- Index reader, block reader, and the parallel source
//! - [`singlestream`] -- Sequential source for ordinary single-stream dumps
//! - [`pipeline`] -- Batches, sinks, stages, and pipeline composition
//! - [`split`] -- Size-limited split writer pool
//! - [`models`] -- Core data types (Header, Siteinfo, Page)
//! - [`config`] -- Tuning constants

pub mod config;
pub mod models;
pub mod multistream;
pub mod parser;
pub mod pipeline;
pub mod singlestream;
pub mod split;
