//! Diagnostics counters

use crossbeam_skiplist::SkipMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Per-database write path counters
#[derive(Debug, Default)]
pub struct DbStats {
    /// Operations received but not yet committed
    qlen: AtomicU32,
    /// Documents committed since process start
    written: AtomicU64,
    /// Number of times a write actor for this database shut down
    closes: AtomicU32,
}

impl DbStats {
    pub fn set_queue_len(&self, n: usize) {
        self.qlen.store(n.min(u32::MAX as usize) as u32, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_len(&self) -> u32 {
        self.qlen.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DbStatsSnapshot {
        DbStatsSnapshot {
            qlen: self.queue_len(),
            written: self.written(),
            closes: self.closes(),
        }
    }
}

/// Process-wide counters, shared by actors, the processing pool and the query driver
#[derive(Debug, Default)]
pub struct EngineStats {
    dbs: SkipMap<String, Arc<DbStats>>,
    queries: AtomicU64,
    buckets: AtomicU64,
    fetches: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for `dbname`, created on first use
    pub fn db(&self, dbname: &str) -> Arc<DbStats> {
        self.dbs
            .get_or_insert_with(dbname.to_string(), || Arc::new(DbStats::default()))
            .value()
            .clone()
    }

    pub fn forget_db(&self, dbname: &str) {
        self.dbs.remove(dbname);
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bucket(&self) {
        self.buckets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn buckets(&self) -> u64 {
        self.buckets.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            databases: self
                .dbs
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
            queries: self.queries.load(Ordering::Relaxed),
            buckets: self.buckets(),
            fetches: self.fetches(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DbStatsSnapshot {
    pub qlen: u32,
    pub written: u64,
    pub closes: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub databases: BTreeMap<String, DbStatsSnapshot>,
    pub queries: u64,
    pub buckets: u64,
    pub fetches: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_counters_are_shared() {
        let stats = EngineStats::new();
        stats.db("m").add_written(3);
        stats.db("m").record_close();
        stats.db("other").set_queue_len(7);

        let snap = stats.snapshot();
        assert_eq!(
            snap.databases["m"],
            DbStatsSnapshot {
                qlen: 0,
                written: 3,
                closes: 1
            }
        );
        assert_eq!(snap.databases["other"].qlen, 7);

        stats.forget_db("m");
        assert!(!stats.snapshot().databases.contains_key("m"));
    }
}
