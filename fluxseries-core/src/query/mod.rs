//! Time-bucketed map-reduce queries
//!
//! A query walks one database's keys in order, splits them into fixed-width
//! time buckets and sends each bucket as a [`ProcessIn`] bundle through the
//! [`Pipeline`]: an optional cache tier in front of a pool of document
//! processors. Each bundle also carries the first document of the following
//! bucket, flagged as a non-member, so reducers can see the value at the
//! bucket's right edge.
//!
//! Buckets complete in any order; [`QueryStream::collect`] sorts them.

mod cache;
mod driver;
mod extract;
mod pipeline;
mod processor;
mod reducers;

pub use cache::{bundle_cache_key, instruction_fingerprint, CacheBackend, LruCacheBackend};
pub use driver::run_query;
pub use extract::{extract_fields, passes_filters};
pub use pipeline::{Pipeline, PipelineConfig};
pub use reducers::{PtrVal, ReducerFn, ReducerRegistry};

use crate::docstore::{DocInfo, DocReader};
use crate::{Filter, Result, SeriesError};
use crossbeam_channel::{Receiver, Sender};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A fixed-shape aggregate query
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub dbname: String,
    /// First key, inclusive
    pub from: Option<String>,
    /// Last key, inclusive
    pub to: Option<String>,
    /// Bucket width
    pub group: Duration,
    /// JSON pointers to extract, one reduced value each
    pub ptrs: Vec<String>,
    /// Reducer per pointer; missing trailing entries default to `any`
    pub reducers: Vec<String>,
    pub filters: Vec<Filter>,
    /// Applies to every bundle of the query
    pub deadline: Instant,
}

impl QueryRequest {
    pub fn new(dbname: impl Into<String>, group: Duration) -> Self {
        Self {
            dbname: dbname.into(),
            from: None,
            to: None,
            group,
            ptrs: Vec::new(),
            reducers: Vec::new(),
            filters: Vec::new(),
            deadline: Instant::now() + crate::config::QUERY_TIMEOUT,
        }
    }

    pub fn range(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn field(mut self, ptr: impl Into<String>, reducer: impl Into<String>) -> Self {
        self.ptrs.push(ptr.into());
        self.reducers.push(reducer.into());
        self
    }

    pub fn filter(mut self, ptr: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push(Filter::new(ptr, value));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now() + timeout;
        self
    }
}

/// Field, filter and reducer instructions shared by every bundle of a query
#[derive(Debug)]
pub struct Instructions {
    pub ptrs: Vec<String>,
    pub reducers: Vec<String>,
    pub filters: Vec<Filter>,
}

/// One bucket's worth of processing work
#[derive(Debug)]
pub struct ProcessIn {
    pub dbname: String,
    /// Bucket start, milliseconds since epoch
    pub key: i64,
    /// Member documents in key order
    pub infos: Vec<DocInfo>,
    /// First document of the next bucket
    pub next_info: Option<DocInfo>,
    /// Empty when results are not to be memoized
    pub cache_key: String,
    /// Reader over the file the driver scanned; opened by path when unset
    pub reader: Option<Arc<DocReader>>,
    pub instructions: Arc<Instructions>,
    pub deadline: Instant,
    pub out: Sender<ProcessOut>,
}

/// Result for one bucket
#[derive(Debug)]
pub struct ProcessOut {
    /// Bucket start, milliseconds since epoch
    pub key: i64,
    /// One value per requested pointer; `None` on error
    pub value: Option<Vec<Value>>,
    pub err: Option<SeriesError>,
    pub cache_key: String,
    /// Non-zero when the value was served from the cache
    pub cache_opaque: u32,
}

impl ProcessOut {
    pub fn ok(key: i64, value: Vec<Value>, cache_key: String) -> Self {
        Self {
            key,
            value: Some(value),
            err: None,
            cache_key,
            cache_opaque: 0,
        }
    }

    pub fn failed(key: i64, err: SeriesError) -> Self {
        Self {
            key,
            value: None,
            err: Some(err),
            cache_key: String::new(),
            cache_opaque: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

impl Serialize for ProcessOut {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("v", &self.value)?;
        map.end()
    }
}

/// Results of a running query.
///
/// `done` yields the scan outcome (buckets dispatched) once the walk ends;
/// `results` yields one [`ProcessOut`] per dispatched bucket, unordered.
pub struct QueryStream {
    pub results: Receiver<ProcessOut>,
    pub done: Receiver<Result<usize>>,
}

impl QueryStream {
    /// Wait for the scan and every bucket, returning results sorted by key.
    /// A scan error is returned as is; per-bucket errors stay in their
    /// [`ProcessOut`].
    pub fn collect(self) -> Result<Vec<ProcessOut>> {
        let dispatched = self
            .done
            .recv()
            .map_err(|_| SeriesError::Internal("query driver exited without a result".into()))??;

        let mut outs = Vec::with_capacity(dispatched);
        for _ in 0..dispatched {
            match self.results.recv() {
                Ok(out) => outs.push(out),
                Err(_) => {
                    return Err(SeriesError::Internal(format!(
                        "query lost {} of {} buckets",
                        dispatched - outs.len(),
                        dispatched
                    )))
                }
            }
        }
        outs.sort_by_key(|o| o.key);
        Ok(outs)
    }
}
