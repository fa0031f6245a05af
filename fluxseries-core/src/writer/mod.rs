//! Per-database write actors
//!
//! Every open database has exactly one [`WriteActor`]: a thread that owns the
//! writable [`DocStore`](crate::docstore::DocStore) and receives all mutations
//! through a bounded mailbox. Stores and deletes accumulate in a batch that is
//! committed when it reaches `max_batch` operations or when `flush_interval`
//! passes without mailbox activity. Compaction is itself a mailbox item, so it
//! is totally ordered with the writes around it.
//!
//! An actor that sees no mailbox traffic for a whole `live_interval` shuts
//! itself down and leaves the [`WriterRegistry`]; the next write reopens it.

mod actor;
mod registry;

pub use actor::WriteActor;
pub use registry::WriterRegistry;

use crate::docstore::StoreConfig;
use crate::Result;
use bytes::Bytes;
use crossbeam_channel::Sender;
use std::time::Duration;

/// Mailbox item
#[derive(Debug)]
pub enum WriteOp {
    /// Insert or replace a document
    Store { key: String, body: Bytes },
    /// Remove a document
    Delete { key: String },
    /// Flush, compact and reopen; the outcome is sent on `done`
    Compact { done: Sender<Result<()>> },
}

/// Write actor configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Commit a non-empty batch after this long without mailbox activity
    pub flush_interval: Duration,
    /// Idle-expiry check period
    pub live_interval: Duration,
    /// Commit as soon as this many operations are pending
    pub max_batch: usize,
    /// Mailbox capacity; writers block when it is full
    pub queue_depth: usize,
    /// Store options for the writable handle
    pub store: StoreConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: crate::config::FLUSH_INTERVAL,
            live_interval: crate::config::LIVE_INTERVAL,
            max_batch: crate::config::MAX_BATCH,
            queue_depth: crate::config::QUEUE_DEPTH,
            store: StoreConfig::default(),
        }
    }
}
