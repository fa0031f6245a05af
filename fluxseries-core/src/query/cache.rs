//! Result cache tier
//!
//! Sits in front of the processing workers when a [`CacheBackend`] is
//! configured. A bundle whose cache key and instructions were seen before is
//! answered from the backend without touching storage; anything else is
//! forwarded. Fresh results come back through a bounded update channel and
//! are stored by the same workers.

use super::{Instructions, ProcessIn, ProcessOut};
use crate::docstore::DocInfo;
use crate::stats::EngineStats;
use crate::{Result, SeriesError};
use crossbeam_channel::{never, select, Receiver, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage for memoized bucket results
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<Value>>>;
    fn set(&self, key: &str, value: &[Value]) -> Result<()>;
}

/// In-process LRU backend holding serialized results
pub struct LruCacheBackend {
    entries: Mutex<LruCache<String, Vec<u8>>>,
}

impl LruCacheBackend {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheBackend for LruCacheBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<Value>>> {
        let raw = match self.entries.lock().get(key) {
            Some(raw) => raw.clone(),
            None => return Ok(None),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| SeriesError::Cache(format!("decoding {}: {}", key, e)))
    }

    fn set(&self, key: &str, value: &[Value]) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.entries.lock().put(key.to_string(), raw);
        Ok(())
    }
}

/// A freshly computed result offered for memoization
#[derive(Debug)]
pub(crate) struct CacheUpdate {
    pub key: String,
    pub value: Vec<Value>,
}

/// Identity of a bucket's contents: the database and its file generation,
/// plus the key and update sequence of every member and of the boundary
/// document. Any write that touches the bucket changes it, and so does
/// recreating the database, which restarts sequences.
pub fn bundle_cache_key(
    dbname: &str,
    generation: u64,
    infos: &[DocInfo],
    next_info: Option<&DocInfo>,
) -> String {
    let mut h = Sha256::new();
    h.update(dbname.as_bytes());
    h.update([0u8]);
    h.update(generation.to_le_bytes());
    for info in infos {
        h.update([0u8]);
        h.update(info.id.as_bytes());
        h.update(info.seq.to_le_bytes());
    }
    if let Some(next) = next_info {
        h.update([1u8]);
        h.update(next.id.as_bytes());
        h.update(next.seq.to_le_bytes());
    }
    hex::encode(h.finalize())
}

/// Fingerprint of the pointers, reducers and filters applied to a bucket
pub fn instruction_fingerprint(ins: &Instructions) -> String {
    let mut h = Sha256::new();
    for (ptr, reducer) in ins.ptrs.iter().zip(&ins.reducers) {
        h.update(b"p");
        h.update(ptr.as_bytes());
        h.update([0u8]);
        h.update(reducer.as_bytes());
        h.update([0u8]);
    }
    for f in &ins.filters {
        h.update(b"f");
        h.update(f.pointer.as_bytes());
        h.update([0u8]);
        h.update(f.value.as_bytes());
        h.update([0u8]);
    }
    hex::encode(&h.finalize()[..8])
}

/// Backend key for a bundle
pub(crate) fn entry_key(cache_key: &str, ins: &Instructions) -> String {
    format!("{}-{}", cache_key, instruction_fingerprint(ins))
}

/// Cache worker loop: answers hits, forwards misses to `downstream` and
/// stores updates. Exits when `input` disconnects.
pub(crate) fn cache_worker(
    backend: Arc<dyn CacheBackend>,
    stats: Arc<EngineStats>,
    input: Receiver<ProcessIn>,
    updates: Receiver<CacheUpdate>,
    downstream: Sender<ProcessIn>,
) {
    let mut updates = updates;
    loop {
        select! {
            recv(input) -> msg => match msg {
                Ok(pi) => {
                    if let Some(pi) = lookup(backend.as_ref(), &stats, pi) {
                        if downstream.send(pi).is_err() {
                            warn!("Processing workers gone, stopping cache worker");
                            return;
                        }
                    }
                }
                Err(_) => return,
            },
            recv(updates) -> msg => match msg {
                Ok(update) => store(backend.as_ref(), update),
                Err(_) => updates = never(),
            }
        }
    }
}

/// Answer `pi` from the cache if possible, otherwise hand it back
fn lookup(backend: &dyn CacheBackend, stats: &EngineStats, pi: ProcessIn) -> Option<ProcessIn> {
    if pi.cache_key.is_empty() {
        return Some(pi);
    }
    let key = entry_key(&pi.cache_key, &pi.instructions);
    match backend.get(&key) {
        Ok(Some(value)) if value.len() == pi.instructions.ptrs.len() => {
            stats.record_cache_hit();
            let mut out = ProcessOut::ok(pi.key, value, pi.cache_key.clone());
            out.cache_opaque = 1;
            let _ = pi.out.send(out);
            None
        }
        Ok(_) => {
            stats.record_cache_miss();
            Some(pi)
        }
        Err(e) => {
            debug!("Cache lookup for {} failed: {}", key, e);
            stats.record_cache_miss();
            Some(pi)
        }
    }
}

fn store(backend: &dyn CacheBackend, update: CacheUpdate) {
    if let Err(e) = backend.set(&update.key, &update.value) {
        warn!("Error caching {}: {}", update.key, e);
    }
}
