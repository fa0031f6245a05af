//! Ordered document store
//!
//! One append-only file per database. Every batch of puts and deletes is
//! followed by a commit record; on open, records after the last commit are
//! ignored (and truncated when opened for writing). An in-memory ordered
//! index maps document keys to record locations.
//!
//! Readers that only need bodies use [`DocReader`], which never scans the
//! file and may run concurrently with the single writer.

mod record;
mod store;

pub use record::{Record, RecordKind};
pub use store::{DocReader, DocStore, WriteBatch};

use crate::Result;
use std::path::{Path, PathBuf};

/// File magic
pub const MAGIC: &[u8; 4] = b"FXSD";

/// File format version
pub const FORMAT_VERSION: u32 = 2;

/// Header length: magic + version + generation
pub const HEADER_LEN: u64 = 16;

/// Extension of store files
pub const STORE_EXT: &str = "series";

/// Path of the store file for `dbname` under `root`
pub fn store_path(root: &Path, dbname: &str) -> PathBuf {
    root.join(format!("{}.{}", dbname, STORE_EXT))
}

/// Sibling file compaction writes into before it is renamed over `path`
pub fn compact_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".compact");
    PathBuf::from(name)
}

/// Names of all databases stored under `root`, sorted
pub fn list_stores(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !root.exists() {
        return Ok(names);
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXT) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Location and version of a committed document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocInfo {
    /// Document key
    pub id: String,
    /// Sequence number of the write that produced this version
    pub seq: u64,
    /// Offset of the record in the file
    pub offset: u64,
    /// Encoded record length, including its length prefix
    pub size: u32,
}

/// How a store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, no writes
    ReadOnly,
    /// Existing file, writable
    ReadWrite,
    /// Writable, creating the file if missing
    Create,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// fsync after every commit
    pub sync_on_commit: bool,
    /// Compress bodies at least this large (0 disables)
    pub compress_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            compress_threshold: crate::config::COMPRESS_THRESHOLD,
        }
    }
}
