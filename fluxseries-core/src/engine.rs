//! Process-scoped engine context
//!
//! [`SeriesEngine`] owns the write-actor registry, the diagnostics counters,
//! the reducer registry and the query pipeline, and exposes the operations
//! front-door adapters translate wire requests into.

use crate::docstore::{list_stores, store_path, DocStore, OpenMode, StoreConfig};
use crate::query::{
    run_query, CacheBackend, LruCacheBackend, Pipeline, PipelineConfig, ProcessOut, QueryRequest,
    QueryStream, ReducerRegistry,
};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::writer::{WriteOp, WriterConfig, WriterRegistry};
use crate::{normalize_key, validate_db_name, Result, SeriesError};
use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Deliveries retried when the target actor shuts down mid-send
const DELIVERY_ATTEMPTS: usize = 3;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding one store file per database
    pub data_dir: PathBuf,
    pub writer: WriterConfig,
    pub pipeline: PipelineConfig,
    /// Memoized bucket results; 0 disables the cache tier
    pub cache_size: usize,
    /// Deadline applied by [`SeriesEngine::query_request`]
    pub query_timeout: Duration,
    /// Bound on waiting for actors to drain at shutdown or database deletion
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            writer: WriterConfig::default(),
            pipeline: PipelineConfig::default(),
            cache_size: 0,
            query_timeout: crate::config::QUERY_TIMEOUT,
            shutdown_timeout: crate::config::SHUTDOWN_TIMEOUT,
        }
    }
}

/// Database summary
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub db_name: String,
    pub doc_count: usize,
    pub update_seq: u64,
    pub disk_size: u64,
    /// Whether a write actor currently holds the database open
    pub open: bool,
}

/// A live document and the sequence of the write that produced it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub seq: u64,
    pub id: String,
}

/// Live documents written after a sequence, in sequence order
#[derive(Debug, Clone, Serialize)]
pub struct Changes {
    pub results: Vec<Change>,
    pub last_seq: u64,
}

/// The storage and query engine
pub struct SeriesEngine {
    config: EngineConfig,
    stats: Arc<EngineStats>,
    registry: WriterRegistry,
    reducers: Arc<ReducerRegistry>,
    pipeline: Arc<Pipeline>,
}

impl SeriesEngine {
    /// Open the engine, with an in-process LRU cache when `cache_size > 0`
    pub fn open(config: EngineConfig) -> Result<Self> {
        let cache: Option<Arc<dyn CacheBackend>> = if config.cache_size > 0 {
            Some(Arc::new(LruCacheBackend::new(config.cache_size)))
        } else {
            None
        };
        Self::open_with_cache(config, cache)
    }

    /// Open the engine with an explicit cache backend, or none
    pub fn open_with_cache(
        config: EngineConfig,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let stats = Arc::new(EngineStats::new());
        let reducers = Arc::new(ReducerRegistry::with_builtins());
        let registry =
            WriterRegistry::new(config.data_dir.clone(), config.writer.clone(), stats.clone());
        let pipeline = Pipeline::start(
            config.data_dir.clone(),
            &config.pipeline,
            reducers.clone(),
            stats.clone(),
            cache,
        )?;

        info!("Opened FluxSeries engine at {:?}", config.data_dir);

        Ok(Self {
            config,
            stats,
            registry,
            reducers,
            pipeline: Arc::new(pipeline),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reducer registry; custom reducers registered here are usable by
    /// subsequent queries
    pub fn reducers(&self) -> &Arc<ReducerRegistry> {
        &self.reducers
    }

    /// Create a database. Returns `false` if it already existed.
    pub fn create_database(&self, dbname: &str) -> Result<bool> {
        validate_db_name(dbname)?;
        let existed = store_path(&self.config.data_dir, dbname).exists();
        self.registry.get_or_create(dbname, true)?;
        Ok(!existed)
    }

    /// Stop the database's actor, wait for it to drain and delete its file
    pub fn delete_database(&self, dbname: &str) -> Result<()> {
        validate_db_name(dbname)?;
        if let Some(actor) = self.registry.remove(dbname) {
            if !actor.wait_finished(self.config.shutdown_timeout) {
                return Err(SeriesError::Timeout);
            }
        }
        match std::fs::remove_file(store_path(&self.config.data_dir, dbname)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SeriesError::NotFound(dbname.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        self.stats.forget_db(dbname);
        info!("Deleted database {}", dbname);
        Ok(())
    }

    pub fn list_databases(&self) -> Result<Vec<String>> {
        list_stores(&self.config.data_dir)
    }

    /// Databases with a live write actor
    pub fn open_databases(&self) -> Vec<String> {
        self.registry.open_names()
    }

    pub fn database_info(&self, dbname: &str) -> Result<DatabaseInfo> {
        let store = self.read_only(dbname)?;
        Ok(DatabaseInfo {
            db_name: dbname.to_string(),
            doc_count: store.doc_count(),
            update_seq: store.update_seq(),
            disk_size: store.file_size(),
            open: self.registry.is_open(dbname),
        })
    }

    /// Queue a document for storage, creating the database if needed.
    /// Returns the normalized key.
    pub fn store_document(&self, dbname: &str, key: &str, body: impl Into<Bytes>) -> Result<String> {
        validate_db_name(dbname)?;
        let key = normalize_key(key)?;
        let body = body.into();
        serde_json::from_slice::<serde::de::IgnoredAny>(&body)?;
        self.deliver(
            dbname,
            true,
            WriteOp::Store {
                key: key.clone(),
                body,
            },
        )?;
        Ok(key)
    }

    /// Queue a document deletion
    pub fn delete_document(&self, dbname: &str, key: &str) -> Result<()> {
        validate_db_name(dbname)?;
        let key = normalize_key(key)?;
        self.deliver(dbname, false, WriteOp::Delete { key })
    }

    /// Queue deletion of every committed document in the key range, both
    /// bounds inclusive. Returns the number of deletions queued.
    pub fn delete_range(&self, dbname: &str, from: Option<&str>, to: Option<&str>) -> Result<usize> {
        let from = from.map(normalize_key).transpose()?;
        let to = to.map(normalize_key).transpose()?;
        let keys: Vec<String> = self
            .read_only(dbname)?
            .range(from.as_deref(), to.as_deref())
            .map(|info| info.id.clone())
            .collect();
        for key in &keys {
            self.deliver(dbname, false, WriteOp::Delete { key: key.clone() })?;
        }
        Ok(keys.len())
    }

    /// Flush and compact the database, blocking until done
    pub fn compact_database(&self, dbname: &str) -> Result<()> {
        validate_db_name(dbname)?;
        let (done, result) = bounded(1);
        self.deliver(dbname, false, WriteOp::Compact { done })?;
        result.recv().map_err(|_| SeriesError::AlreadyClosed)?
    }

    /// Committed body of one document
    pub fn get_document(&self, dbname: &str, key: &str) -> Result<Bytes> {
        let key = normalize_key(key)?;
        let store = self.read_only(dbname)?;
        let info = store
            .get(&key)
            .ok_or_else(|| SeriesError::NotFound(format!("{}/{}", dbname, key)))?;
        store.fetch_body(info)
    }

    /// Committed documents in key order, both bounds inclusive
    pub fn all_documents(
        &self,
        dbname: &str,
        from: Option<&str>,
        to: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Bytes)>> {
        let from = from.map(normalize_key).transpose()?;
        let to = to.map(normalize_key).transpose()?;
        let store = self.read_only(dbname)?;
        let mut docs = Vec::new();
        for info in store
            .range(from.as_deref(), to.as_deref())
            .take(limit.unwrap_or(usize::MAX))
        {
            docs.push((info.id.clone(), store.fetch_body(info)?));
        }
        Ok(docs)
    }

    /// Live documents whose latest write came after `since`. Deleted
    /// documents leave no entry.
    pub fn changes(&self, dbname: &str, since: u64, limit: Option<usize>) -> Result<Changes> {
        let store = self.read_only(dbname)?;
        let mut results: Vec<Change> = store
            .range(None, None)
            .filter(|info| info.seq > since)
            .map(|info| Change {
                seq: info.seq,
                id: info.id.clone(),
            })
            .collect();
        results.sort_by_key(|c| c.seq);
        results.truncate(limit.unwrap_or(usize::MAX));
        Ok(Changes {
            results,
            last_seq: store.update_seq(),
        })
    }

    /// Hand every committed document in the key range to `visit`, in key
    /// order, without collecting them. The first error stops the walk.
    /// Returns the number of documents visited.
    pub fn dump_documents<F>(
        &self,
        dbname: &str,
        from: Option<&str>,
        to: Option<&str>,
        mut visit: F,
    ) -> Result<usize>
    where
        F: FnMut(&str, Bytes) -> Result<()>,
    {
        let from = from.map(normalize_key).transpose()?;
        let to = to.map(normalize_key).transpose()?;
        let store = self.read_only(dbname)?;
        let mut n = 0;
        store.visit_range(from.as_deref(), to.as_deref(), |info| {
            visit(&info.id, store.fetch_body(info)?)?;
            n += 1;
            Ok(())
        })?;
        Ok(n)
    }

    /// A request for `dbname` carrying the configured query timeout
    pub fn query_request(&self, dbname: &str, group: Duration) -> QueryRequest {
        QueryRequest::new(dbname, group).timeout(self.config.query_timeout)
    }

    /// Start a query on its own thread
    pub fn query(&self, req: QueryRequest) -> Result<QueryStream> {
        let (out, results) = unbounded::<ProcessOut>();
        let (done_tx, done) = bounded(1);

        let data_dir = self.config.data_dir.clone();
        let pipeline = self.pipeline.clone();
        let reducers = self.reducers.clone();
        let stats = self.stats.clone();
        std::thread::Builder::new()
            .name(format!("query-{}", req.dbname))
            .spawn(move || {
                let result = run_query(&data_dir, &pipeline, &reducers, &stats, &req, out);
                if let Err(e) = &result {
                    warn!("Query on {} failed: {}", req.dbname, e);
                }
                let _ = done_tx.send(result);
            })?;

        Ok(QueryStream { results, done })
    }

    /// Run a query to completion; results sorted by bucket key
    pub fn run_query(&self, req: QueryRequest) -> Result<Vec<ProcessOut>> {
        self.query(req)?.collect()
    }

    pub fn diagnostics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// Ask every actor to drain and close, then wait up to `bound`
    pub fn shutdown(&self, bound: Duration) -> Result<()> {
        self.registry.close_all();
        self.registry.wait_all(bound)?;
        info!("All databases closed");
        Ok(())
    }

    fn read_only(&self, dbname: &str) -> Result<DocStore> {
        validate_db_name(dbname)?;
        DocStore::open(
            store_path(&self.config.data_dir, dbname),
            OpenMode::ReadOnly,
            StoreConfig::default(),
        )
    }

    /// Hand `op` to the database's actor, reopening it if the one found
    /// was shutting down
    fn deliver(&self, dbname: &str, create: bool, op: WriteOp) -> Result<()> {
        let mut op = op;
        for _ in 0..DELIVERY_ATTEMPTS {
            let (actor, _) = self.registry.get_or_create(dbname, create)?;
            match actor.deliver(op) {
                Ok(()) => return Ok(()),
                Err(returned) => op = returned,
            }
        }
        Err(SeriesError::AlreadyClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp_key;
    use serde_json::{json, Value};
    use std::time::Instant;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, max_batch: usize) -> SeriesEngine {
        let mut config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.writer.max_batch = max_batch;
        config.writer.flush_interval = Duration::from_secs(60);
        config.writer.store.sync_on_commit = false;
        config.pipeline.doc_workers = 2;
        SeriesEngine::open(config).unwrap()
    }

    fn ms_key(ms: i64) -> String {
        timestamp_key(ms * 1_000_000)
    }

    fn wait_for_count(e: &SeriesEngine, db: &str, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while e.database_info(db).map(|i| i.doc_count).unwrap_or(0) != n {
            assert!(Instant::now() < deadline, "timed out waiting for {} docs", n);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_store_and_fetch() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 1);
        let key = e
            .store_document("m", "2024-01-01T00:00:00Z", r#"{"v":1}"#)
            .unwrap();
        assert_eq!(key, "2024-01-01T00:00:00.000000000Z");
        wait_for_count(&e, "m", 1);

        assert_eq!(&e.get_document("m", "2024-01-01").unwrap()[..], br#"{"v":1}"#);
        assert!(e.get_document("m", "2024-01-02").unwrap_err().is_not_found());
        assert_eq!(e.list_databases().unwrap(), vec!["m"]);
        assert!(e.database_info("m").unwrap().open);
    }

    #[test]
    fn test_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 1);
        assert!(matches!(
            e.store_document("_users", "2024-01-01", "{}"),
            Err(SeriesError::Validation(_))
        ));
        assert!(matches!(
            e.store_document("m", "yesterday", "{}"),
            Err(SeriesError::InvalidKey(_))
        ));
        assert!(matches!(
            e.store_document("m", "2024-01-01", "{nope"),
            Err(SeriesError::Json(_))
        ));
        assert!(e.delete_document("absent", "2024-01-01").unwrap_err().is_not_found());
        assert!(e.compact_database("absent").unwrap_err().is_not_found());
    }

    #[test]
    fn test_last_write_wins_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 4);
        for (ms, v) in [(1, 1), (2, 2), (1, 3), (3, 4)] {
            e.store_document("m", &ms_key(ms), json!({ "v": v }).to_string())
                .unwrap();
        }
        e.delete_document("m", &ms_key(2)).unwrap();
        e.store_document("m", &ms_key(4), "{}").unwrap();
        e.shutdown(Duration::from_secs(5)).unwrap();

        let docs = e.all_documents("m", None, None, None).unwrap();
        let keys: Vec<_> = docs.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![ms_key(1), ms_key(3), ms_key(4)]);
        assert_eq!(&docs[0].1[..], br#"{"v":3}"#);
    }

    #[test]
    fn test_compact_commits_pending_writes() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 3);
        for i in 1..=5 {
            e.store_document("m", &ms_key(i), "{}").unwrap();
        }
        wait_for_count(&e, "m", 3);

        e.compact_database("m").unwrap();
        assert_eq!(e.database_info("m").unwrap().doc_count, 5);

        // Compacting again with nothing pending keeps the same contents
        let before = e.all_documents("m", None, None, None).unwrap();
        e.compact_database("m").unwrap();
        assert_eq!(e.all_documents("m", None, None, None).unwrap(), before);
        assert_eq!(e.diagnostics().databases["m"].written, 5);
    }

    #[test]
    fn test_delete_range_and_limit() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 1);
        for i in 0..10 {
            e.store_document("m", &ms_key(i), "{}").unwrap();
        }
        wait_for_count(&e, "m", 10);

        let first3 = e.all_documents("m", None, None, Some(3)).unwrap();
        assert_eq!(first3.len(), 3);

        let n = e
            .delete_range("m", Some(&ms_key(2)), Some(&ms_key(5)))
            .unwrap();
        assert_eq!(n, 4);
        wait_for_count(&e, "m", 6);
    }

    #[test]
    fn test_create_and_delete_database() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 1);
        assert!(e.create_database("m").unwrap());
        assert!(!e.create_database("m").unwrap());
        e.store_document("m", &ms_key(1), "{}").unwrap();

        e.delete_database("m").unwrap();
        assert!(e.list_databases().unwrap().is_empty());
        assert!(e.open_databases().is_empty());
        assert!(e.delete_database("m").unwrap_err().is_not_found());
        assert!(e.database_info("m").unwrap_err().is_not_found());
    }

    #[test]
    fn test_query_end_to_end() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 100);
        for i in 0..8 {
            let host = if i < 4 { "a" } else { "b" };
            e.store_document("m", &ms_key(i * 500), json!({"v": i, "host": host}).to_string())
                .unwrap();
        }
        e.compact_database("m").unwrap();

        let req = e
            .query_request("m", Duration::from_millis(1000))
            .field("/v", "count")
            .field("/v", "boundary")
            .field("_id", "first");
        let outs = e.run_query(req).unwrap();
        let keys: Vec<i64> = outs.iter().map(|o| o.key).collect();
        assert_eq!(keys, vec![0, 1000, 2000, 3000]);
        assert_eq!(
            outs[1].value.as_ref().unwrap(),
            &vec![json!(2), json!("4"), Value::from(ms_key(1000))]
        );

        let filtered = e
            .query_request("m", Duration::from_secs(60))
            .field("/v", "sum")
            .filter("/host", "b");
        let outs = e.run_query(filtered).unwrap();
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].value, Some(vec![json!(22)]));

        let snap = e.diagnostics();
        assert_eq!(snap.queries, 2);
        assert_eq!(snap.buckets, 5);
    }

    #[test]
    fn test_query_errors_terminate_stream() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 1);
        let req = e.query_request("missing", Duration::from_secs(1)).field("/v", "sum");
        assert!(e.run_query(req).unwrap_err().is_not_found());
    }

    #[test]
    fn test_cached_queries_hit() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            cache_size: 64,
            ..Default::default()
        };
        config.writer.max_batch = 1;
        config.writer.store.sync_on_commit = false;
        let e = SeriesEngine::open(config).unwrap();
        for i in 0..4 {
            e.store_document("m", &ms_key(i * 1000), json!({ "v": i }).to_string())
                .unwrap();
        }
        wait_for_count(&e, "m", 4);

        let run = || {
            let req = e
                .query_request("m", Duration::from_secs(1))
                .field("/v", "sum");
            e.run_query(req).unwrap()
        };
        let first = run();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let again = run();
            let values: Vec<_> = again.iter().map(|o| o.value.clone()).collect();
            let expected: Vec<_> = first.iter().map(|o| o.value.clone()).collect();
            assert_eq!(values, expected);
            if again.iter().all(|o| o.cache_opaque != 0) {
                break;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(e.diagnostics().cache_hits >= 4);
    }

    #[test]
    fn test_recreated_database_is_not_served_from_cache() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            cache_size: 64,
            ..Default::default()
        };
        config.writer.max_batch = 1;
        config.writer.store.sync_on_commit = false;
        let e = SeriesEngine::open(config).unwrap();

        let sum = || {
            let req = e.query_request("m", Duration::from_secs(1)).field("/v", "sum");
            let mut outs = e.run_query(req).unwrap();
            assert_eq!(outs.len(), 1);
            outs.remove(0)
        };

        e.store_document("m", &ms_key(0), r#"{"v":1}"#).unwrap();
        wait_for_count(&e, "m", 1);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let out = sum();
            assert_eq!(out.value, Some(vec![json!(1)]));
            if out.cache_opaque != 0 {
                break;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }

        // Same key and sequence number in a fresh file
        e.delete_database("m").unwrap();
        e.store_document("m", &ms_key(0), r#"{"v":100}"#).unwrap();
        wait_for_count(&e, "m", 1);
        let out = sum();
        assert_eq!(out.value, Some(vec![json!(100)]));
        assert_eq!(out.cache_opaque, 0);
    }

    #[test]
    fn test_changes_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 1);
        for ms in [30, 10, 20] {
            e.store_document("m", &ms_key(ms), "{}").unwrap();
        }
        wait_for_count(&e, "m", 3);
        e.store_document("m", &ms_key(30), r#"{"again":true}"#).unwrap();
        e.delete_document("m", &ms_key(20)).unwrap();
        wait_for_count(&e, "m", 2);

        let all = e.changes("m", 0, None).unwrap();
        assert_eq!(all.last_seq, 5);
        assert_eq!(
            all.results,
            vec![
                Change { seq: 2, id: ms_key(10) },
                Change { seq: 4, id: ms_key(30) },
            ]
        );
        assert_eq!(e.changes("m", 2, None).unwrap().results.len(), 1);
        assert_eq!(e.changes("m", 0, Some(1)).unwrap().results[0].seq, 2);
        assert!(e.changes("nope", 0, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_dump_visits_in_key_order() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 1);
        for ms in [2, 0, 1] {
            e.store_document("m", &ms_key(ms), json!({ "v": ms }).to_string())
                .unwrap();
        }
        wait_for_count(&e, "m", 3);

        let mut seen = Vec::new();
        let n = e
            .dump_documents("m", None, None, |id, body| {
                seen.push((id.to_string(), body));
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(seen[0].0, ms_key(0));
        assert_eq!(&seen[2].1[..], br#"{"v":2}"#);

        let mut calls = 0;
        let err = e.dump_documents("m", Some(&ms_key(1)), None, |_, _| {
            calls += 1;
            Err(SeriesError::Internal("client gone".into()))
        });
        assert!(err.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_shutdown_flushes_every_database() {
        let dir = TempDir::new().unwrap();
        let e = engine(&dir, 1000);
        for db in ["a", "b", "c"] {
            e.store_document(db, &ms_key(1), "{}").unwrap();
        }
        e.shutdown(Duration::from_secs(5)).unwrap();
        for db in ["a", "b", "c"] {
            assert_eq!(e.database_info(db).unwrap().doc_count, 1);
            assert_eq!(e.diagnostics().databases[db].closes, 1);
        }
    }
}
