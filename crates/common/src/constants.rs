//! Shared constants used across rusty-transfer crates.

/// One kibibyte.
pub const KIB: u64 = 1024;

/// One mebibyte.
pub const MIB: u64 = 1024 * KIB;

/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Hard cap on the number of parts in a single multipart session.
pub const MAX_PARTS: u32 = 10_000;

/// Largest part the store accepts in a single upload-part request (5GB).
pub const MAX_PART_SIZE: u64 = 5 * GIB;

/// Default size above which transfers switch to multipart (8MB).
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 8 * MIB;

/// Default target part size (8MB).
pub const DEFAULT_MULTIPART_CHUNKSIZE: u64 = 8 * MIB;

/// Default number of part requests in flight at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Default number of parts buffered ahead of dispatch.
pub const DEFAULT_MAX_IO_QUEUE_SIZE: usize = 100;

/// Default number of retries after the first attempt of a request.
pub const DEFAULT_NUM_RETRY_ATTEMPTS: u32 = 5;
