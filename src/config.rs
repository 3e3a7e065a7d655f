/// Number of pages accumulated per worker before a batch is emitted downstream
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Depth of the block queue and the index read-ahead, as a multiple of the worker count
pub const QUEUE_DEPTH_FACTOR: usize = 3;

/// Default size limit of one output split in bytes (128 MiB)
pub const DEFAULT_SPLIT_LIMIT: u64 = 128 * 1024 * 1024;

/// Split file name prefix (part-00001, part-00002, ...)
pub const SPLIT_PREFIX: &str = "part-";

/// Width of the zero-padded split counter in file names
pub const SPLIT_COUNTER_WIDTH: usize = 5;

/// Trailer file recording the total number of items written across all splits
pub const COUNT_FILE: &str = "_count";

/// Progress update interval (tick every N batches)
pub const PROGRESS_INTERVAL: u64 = 100;
