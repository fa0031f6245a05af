//! FluxSeries Core - Embedded Time-Series Document Store
//!
//! Stores timestamped JSON documents, one ordered store file per database,
//! and answers time-bucketed aggregate queries over them.
//!
//! # Architecture
//!
//! - **Document store**: append-only file with commit records and an
//!   in-memory ordered index
//! - **Write actors**: one thread per open database owning the writable
//!   store, batching mutations from a bounded mailbox
//! - **Query pipeline**: a driver that walks a key range and buckets it, an
//!   optional cache tier, and a worker pool that fetches bodies, extracts
//!   fields and runs reducers
//! - **Engine**: the process-scoped context tying the above together

pub mod docstore;
pub mod engine;
pub mod query;
pub mod stats;
pub mod writer;

mod error;
mod types;

pub use engine::{Change, Changes, DatabaseInfo, EngineConfig, SeriesEngine};
pub use error::{Result, SeriesError};
pub use types::*;

/// FluxSeries version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Commit a pending batch after this long without mailbox activity
    pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

    /// Idle-expiry check period for write actors
    pub const LIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Pending operations that force an immediate commit
    pub const MAX_BATCH: usize = 1000;

    /// Write actor mailbox capacity
    pub const QUEUE_DEPTH: usize = 64;

    /// Bodies at least this large are stored LZ4-compressed (4KB)
    pub const COMPRESS_THRESHOLD: usize = 4 * 1024;

    /// Processing pool input backlog
    pub const DOC_BACKLOG: usize = 0;

    /// Cache tier workers
    pub const CACHE_WORKERS: usize = 4;

    /// Cache tier input backlog
    pub const CACHE_BACKLOG: usize = 1000;

    /// Memoized bucket results kept by the in-process cache
    pub const CACHE_SIZE: usize = 10_000;

    /// Deadline applied to every query
    pub const QUERY_TIMEOUT: Duration = Duration::from_secs(60);

    /// Upper bound on waiting for write actors to drain at shutdown
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Processing pool workers: half the available CPUs, at least one
    pub fn doc_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(1)
            .max(1)
    }
}

/// Abort the process after an error that leaves a write path without a
/// usable storage handle.
pub(crate) fn fatal(err: SeriesError) -> ! {
    tracing::error!("Fatal: {}", err);
    std::process::exit(70)
}
