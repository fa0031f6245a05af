//! Wiring of the processing workers and the optional cache tier

use super::cache::{cache_worker, CacheBackend};
use super::processor::{doc_worker, ProcessorContext};
use super::reducers::ReducerRegistry;
use super::ProcessIn;
use crate::stats::EngineStats;
use crate::{Result, SeriesError};
use crossbeam_channel::{bounded, Sender};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Worker pool sizing
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub doc_workers: usize,
    /// Processing input capacity; 0 makes every dispatch a hand-off
    pub doc_backlog: usize,
    pub cache_workers: usize,
    pub cache_backlog: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            doc_workers: crate::config::doc_workers(),
            doc_backlog: crate::config::DOC_BACKLOG,
            cache_workers: crate::config::CACHE_WORKERS,
            cache_backlog: crate::config::CACHE_BACKLOG,
        }
    }
}

/// Entry point for bundles. Without a cache backend the input channel is the
/// one the processing workers consume.
pub struct Pipeline {
    input: Sender<ProcessIn>,
    caching: bool,
}

impl Pipeline {
    /// Start the worker threads. They exit once the pipeline is dropped and
    /// the queued bundles are done.
    pub fn start(
        data_dir: PathBuf,
        config: &PipelineConfig,
        reducers: Arc<ReducerRegistry>,
        stats: Arc<EngineStats>,
        cache: Option<Arc<dyn CacheBackend>>,
    ) -> Result<Self> {
        let (doc_tx, doc_rx) = bounded(config.doc_backlog);

        let (cache_updates, updates_rx) = match cache {
            Some(_) => {
                let (tx, rx) = bounded(config.cache_backlog);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };

        let ctx = Arc::new(ProcessorContext {
            data_dir,
            reducers,
            stats: stats.clone(),
            cache_updates,
        });
        for i in 0..config.doc_workers.max(1) {
            let ctx = ctx.clone();
            let rx = doc_rx.clone();
            std::thread::Builder::new()
                .name(format!("doc-worker-{}", i))
                .spawn(move || doc_worker(ctx, rx))
                .map_err(|e| SeriesError::Internal(format!("spawning doc worker: {}", e)))?;
        }

        let (input, caching) = match (cache, updates_rx) {
            (Some(backend), Some(updates)) => {
                let (cache_tx, cache_rx) = bounded(config.cache_backlog);
                for i in 0..config.cache_workers.max(1) {
                    let backend = backend.clone();
                    let stats = stats.clone();
                    let input = cache_rx.clone();
                    let updates = updates.clone();
                    let downstream = doc_tx.clone();
                    std::thread::Builder::new()
                        .name(format!("cache-worker-{}", i))
                        .spawn(move || cache_worker(backend, stats, input, updates, downstream))
                        .map_err(|e| {
                            SeriesError::Internal(format!("spawning cache worker: {}", e))
                        })?;
                }
                (cache_tx, true)
            }
            _ => (doc_tx, false),
        };

        info!(
            "Started {} document workers{}",
            config.doc_workers.max(1),
            if caching { " behind the cache tier" } else { "" }
        );

        Ok(Self { input, caching })
    }

    pub fn caching(&self) -> bool {
        self.caching
    }

    /// Queue a bundle, blocking while the pipeline is saturated
    pub fn dispatch(&self, pi: ProcessIn) -> Result<()> {
        self.input
            .send(pi)
            .map_err(|_| SeriesError::Internal("query pipeline stopped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::{store_path, DocStore, OpenMode, StoreConfig, WriteBatch};
    use crate::query::{bundle_cache_key, Instructions, LruCacheBackend, ProcessOut};
    use crossbeam_channel::unbounded;
    use serde_json::json;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_cached_pipeline_serves_repeat_bundles() {
        let dir = TempDir::new().unwrap();
        let mut store = DocStore::open(
            store_path(dir.path(), "db"),
            OpenMode::Create,
            StoreConfig::default(),
        )
        .unwrap();
        let mut batch = WriteBatch::new();
        batch.upsert(crate::timestamp_key(0), json!({"v": 2}).to_string());
        store.commit(&mut batch).unwrap();
        let infos: Vec<_> = store.range(None, None).cloned().collect();

        let stats = Arc::new(EngineStats::new());
        let config = PipelineConfig {
            doc_workers: 2,
            doc_backlog: 0,
            cache_workers: 1,
            cache_backlog: 4,
        };
        let pipeline = Pipeline::start(
            dir.path().to_path_buf(),
            &config,
            Arc::new(ReducerRegistry::with_builtins()),
            stats.clone(),
            Some(Arc::new(LruCacheBackend::new(8))),
        )
        .unwrap();
        assert!(pipeline.caching());

        let instructions = Arc::new(Instructions {
            ptrs: vec!["/v".into()],
            reducers: vec!["sum".into()],
            filters: vec![],
        });
        let run = |out: Sender<ProcessOut>| {
            pipeline
                .dispatch(ProcessIn {
                    dbname: "db".into(),
                    key: 0,
                    infos: infos.clone(),
                    next_info: None,
                    cache_key: bundle_cache_key("db", store.generation(), &infos, None),
                    reader: Some(store.shared_reader()),
                    instructions: instructions.clone(),
                    deadline: Instant::now() + Duration::from_secs(30),
                    out,
                })
                .unwrap();
        };

        let (out, results) = unbounded();
        run(out.clone());
        let first = results.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.value, Some(vec![json!(2)]));
        assert_eq!(first.cache_opaque, 0);

        // The update travels asynchronously; retry until it lands
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            run(out.clone());
            let again = results.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(again.value, Some(vec![json!(2)]));
            if again.cache_opaque != 0 {
                break;
            }
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(stats.snapshot().cache_hits >= 1);
    }
}
