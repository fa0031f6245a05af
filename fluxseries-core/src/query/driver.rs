//! Query driver: key-range walk, bucketing and dispatch

use super::cache::bundle_cache_key;
use super::{Instructions, Pipeline, ProcessIn, ProcessOut, QueryRequest, ReducerRegistry};
use crate::docstore::{store_path, DocInfo, DocReader, DocStore, OpenMode, StoreConfig};
use crate::stats::EngineStats;
use crate::{key_timestamp, normalize_key, validate_db_name, Result, SeriesError, Timestamp};
use crossbeam_channel::Sender;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

const DEFAULT_REDUCER: &str = "any";

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Check a request and turn it into shared per-bundle instructions
fn prepare(req: &QueryRequest, reducers: &ReducerRegistry) -> Result<Instructions> {
    validate_db_name(&req.dbname)?;
    if req.ptrs.is_empty() {
        return Err(SeriesError::Validation(
            "at least one pointer is required".into(),
        ));
    }
    if req.group.is_zero() {
        return Err(SeriesError::Validation("group can't be zero".into()));
    }
    if req.reducers.len() > req.ptrs.len() {
        return Err(SeriesError::Validation(format!(
            "{} reducers for {} pointers",
            req.reducers.len(),
            req.ptrs.len()
        )));
    }

    let mut names = req.reducers.clone();
    names.resize(req.ptrs.len(), DEFAULT_REDUCER.to_string());
    if let Some(unknown) = names.iter().find(|n| !reducers.contains(n)) {
        return Err(SeriesError::Validation(format!(
            "unknown reducer {:?}",
            unknown
        )));
    }

    Ok(Instructions {
        ptrs: req.ptrs.clone(),
        reducers: names,
        filters: req.filters.clone(),
    })
}

/// Walk `req`'s key range and dispatch one bundle per non-empty bucket into
/// `pipeline`, with results delivered on `out`. Returns the number of
/// bundles dispatched; each produces exactly one [`ProcessOut`].
///
/// An error means no further bundles were dispatched. Bundles sent before
/// the error still report on `out`.
pub fn run_query(
    data_dir: &Path,
    pipeline: &Pipeline,
    reducers: &ReducerRegistry,
    stats: &EngineStats,
    req: &QueryRequest,
    out: Sender<ProcessOut>,
) -> Result<usize> {
    let instructions = Arc::new(prepare(req, reducers)?);
    let from = req.from.as_deref().map(normalize_key).transpose()?;
    let to = req.to.as_deref().map(normalize_key).transpose()?;

    let store = DocStore::open(
        store_path(data_dir, &req.dbname),
        OpenMode::ReadOnly,
        StoreConfig::default(),
    )?;
    stats.record_query();

    let chunk = i64::try_from(req.group.as_nanos()).unwrap_or(i64::MAX);
    let start = Instant::now();

    let mut bucket = Bucket {
        dbname: &req.dbname,
        pipeline,
        stats,
        instructions,
        deadline: req.deadline,
        out,
        generation: store.generation(),
        reader: store.shared_reader(),
        start: 0,
        infos: Vec::new(),
        dispatched: 0,
    };

    store.visit_range(from.as_deref(), to.as_deref(), |info| {
        let ts = key_timestamp(&info.id)?;
        let g = ts.div_euclid(chunk) * chunk;
        if bucket.infos.is_empty() {
            bucket.start = g;
        } else if g != bucket.start {
            bucket.dispatch(Some(info.clone()))?;
            bucket.start = g;
        }
        bucket.infos.push(info.clone());
        Ok(())
    })?;
    if !bucket.infos.is_empty() {
        bucket.dispatch(None)?;
    }

    debug!(
        "Query on {} dispatched {} buckets in {:?}",
        req.dbname,
        bucket.dispatched,
        start.elapsed()
    );
    Ok(bucket.dispatched)
}

/// Bucket being accumulated by the walk
struct Bucket<'a> {
    dbname: &'a str,
    pipeline: &'a Pipeline,
    stats: &'a EngineStats,
    instructions: Arc<Instructions>,
    deadline: Instant,
    out: Sender<ProcessOut>,
    generation: u64,
    /// Bundles read through the handle the walk indexed
    reader: Arc<DocReader>,
    /// Start of the current bucket, nanoseconds
    start: Timestamp,
    infos: Vec<DocInfo>,
    dispatched: usize,
}

impl Bucket<'_> {
    fn dispatch(&mut self, next_info: Option<DocInfo>) -> Result<()> {
        let infos = std::mem::take(&mut self.infos);
        let cache_key = if self.pipeline.caching() {
            bundle_cache_key(self.dbname, self.generation, &infos, next_info.as_ref())
        } else {
            String::new()
        };
        self.pipeline.dispatch(ProcessIn {
            dbname: self.dbname.to_string(),
            key: self.start.div_euclid(NANOS_PER_MILLI),
            infos,
            next_info,
            cache_key,
            reader: Some(self.reader.clone()),
            instructions: self.instructions.clone(),
            deadline: self.deadline,
            out: self.out.clone(),
        })?;
        self.dispatched += 1;
        self.stats.record_bucket();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::WriteBatch;
    use crate::query::{PipelineConfig, QueryStream};
    use crate::timestamp_key;
    use crossbeam_channel::{bounded, unbounded};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        pipeline: Pipeline,
        reducers: ReducerRegistry,
        stats: Arc<EngineStats>,
    }

    fn fixture(docs: &[(i64, Value)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut store = DocStore::open(
            store_path(dir.path(), "m"),
            OpenMode::Create,
            StoreConfig::default(),
        )
        .unwrap();
        let mut batch = WriteBatch::new();
        for (ms, body) in docs {
            batch.upsert(timestamp_key(ms * NANOS_PER_MILLI), body.to_string());
        }
        store.commit(&mut batch).unwrap();

        let stats = Arc::new(EngineStats::new());
        let pipeline = Pipeline::start(
            dir.path().to_path_buf(),
            &PipelineConfig {
                doc_workers: 3,
                doc_backlog: 0,
                cache_workers: 1,
                cache_backlog: 1,
            },
            Arc::new(ReducerRegistry::with_builtins()),
            stats.clone(),
            None,
        )
        .unwrap();
        Fixture {
            dir,
            pipeline,
            reducers: ReducerRegistry::with_builtins(),
            stats,
        }
    }

    fn query(fx: &Fixture, req: &QueryRequest) -> Result<Vec<ProcessOut>> {
        let (out, results) = unbounded();
        let (done_tx, done) = bounded(1);
        done_tx
            .send(run_query(
                fx.dir.path(),
                &fx.pipeline,
                &fx.reducers,
                &fx.stats,
                req,
                out,
            ))
            .unwrap();
        QueryStream { results, done }.collect()
    }

    fn values(outs: &[ProcessOut]) -> Vec<(i64, Vec<Value>)> {
        outs.iter()
            .map(|o| (o.key, o.value.clone().unwrap()))
            .collect()
    }

    fn series() -> Vec<(i64, Value)> {
        (0..8).map(|i| (i * 500, json!({"v": i}))).collect()
    }

    #[test]
    fn test_buckets_and_boundaries() {
        let fx = fixture(&series());
        let req = QueryRequest::new("m", Duration::from_millis(1000))
            .field("/v", "count")
            .field("/v", "last")
            .field("/v", "boundary");

        let outs = query(&fx, &req).unwrap();
        assert_eq!(
            values(&outs),
            vec![
                (0, vec![json!(2), json!("1"), json!("2")]),
                (1000, vec![json!(2), json!("3"), json!("4")]),
                (2000, vec![json!(2), json!("5"), json!("6")]),
                (3000, vec![json!(2), json!("7"), json!("7")]),
            ]
        );
        assert_eq!(fx.stats.buckets(), 4);
        for out in &outs {
            assert_eq!(out.value.as_ref().unwrap().len(), req.ptrs.len());
        }
    }

    #[test]
    fn test_range_bounds_and_default_reducer() {
        let fx = fixture(&series());
        let mut req = QueryRequest::new("m", Duration::from_millis(1000))
            .range(
                Some(timestamp_key(1000 * NANOS_PER_MILLI)),
                Some(timestamp_key(2500 * NANOS_PER_MILLI)),
            )
            .field("/v", "sum");
        req.ptrs.push("/v".into());

        let outs = query(&fx, &req).unwrap();
        assert_eq!(
            values(&outs),
            vec![
                (1000, vec![json!(5), json!("2")]),
                (2000, vec![json!(9), json!("4")]),
            ]
        );
    }

    #[test]
    fn test_validation_errors() {
        let fx = fixture(&series());
        let no_ptrs = QueryRequest::new("m", Duration::from_secs(1));
        assert!(matches!(query(&fx, &no_ptrs), Err(SeriesError::Validation(_))));

        let zero = QueryRequest::new("m", Duration::ZERO).field("/v", "sum");
        assert!(matches!(query(&fx, &zero), Err(SeriesError::Validation(_))));

        let unknown = QueryRequest::new("m", Duration::from_secs(1)).field("/v", "median");
        assert!(matches!(query(&fx, &unknown), Err(SeriesError::Validation(_))));

        let missing = QueryRequest::new("nope", Duration::from_secs(1)).field("/v", "sum");
        assert!(matches!(query(&fx, &missing), Err(SeriesError::NotFound(_))));
        assert_eq!(fx.stats.buckets(), 0);
    }

    #[test]
    fn test_expired_query_times_out_every_bucket() {
        let fx = fixture(&series());
        let mut req = QueryRequest::new("m", Duration::from_millis(1000)).field("/v", "sum");
        req.deadline = Instant::now() - Duration::from_millis(1);

        let outs = query(&fx, &req).unwrap();
        assert_eq!(outs.len(), 4);
        assert!(outs.iter().all(|o| matches!(o.err, Some(SeriesError::Timeout))));
        assert_eq!(fx.stats.fetches(), 0);
    }

    #[test]
    fn test_filters_restrict_members() {
        let docs: Vec<(i64, Value)> = (0..6)
            .map(|i| {
                let host = if i % 2 == 0 { "a" } else { "b" };
                (i * 100, json!({"host": host, "v": i}))
            })
            .collect();
        let fx = fixture(&docs);
        let req = QueryRequest::new("m", Duration::from_secs(10))
            .field("/v", "sum")
            .field("/v", "count")
            .filter("/host", "b");

        let outs = query(&fx, &req).unwrap();
        assert_eq!(values(&outs), vec![(0, vec![json!(9), json!(3)])]);
    }
}
