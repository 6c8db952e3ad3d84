//! Constants for the download module (timeouts, retry, progress, layout).

use std::time::Duration;

/// Connect timeout for metadata and resolution requests.
pub const METADATA_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Total timeout for metadata and resolution requests.
pub const METADATA_TOTAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for piece streams.
pub const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle read timeout for piece streams, applied per chunk.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of simultaneous piece transfers across all files.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default attempts per piece, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default fixed delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay before the first progress report of a piece.
pub const PROGRESS_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Interval between progress reports after the first.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Chunk size used when copying working files into the final output.
pub const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Prefix given to outputs whose fingerprint did not match.
pub const QUARANTINE_PREFIX: &str = "badsum-";
