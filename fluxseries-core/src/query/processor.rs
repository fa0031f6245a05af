//! Document processing workers

use super::cache::{entry_key, CacheUpdate};
use super::extract::{extract_fields, passes_filters};
use super::reducers::{PtrVal, ReducerFn, ReducerRegistry};
use super::{Instructions, ProcessIn, ProcessOut};
use crate::docstore::{store_path, DocInfo, DocReader};
use crate::stats::EngineStats;
use crate::{FieldValue, Result, SeriesError};
use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Everything a processing worker needs besides its bundle
pub(crate) struct ProcessorContext {
    pub data_dir: PathBuf,
    pub reducers: Arc<ReducerRegistry>,
    pub stats: Arc<EngineStats>,
    /// Best-effort feed into the cache tier, when there is one
    pub cache_updates: Option<Sender<CacheUpdate>>,
}

/// Worker loop: runs until the input channel disconnects
pub(crate) fn doc_worker(ctx: Arc<ProcessorContext>, input: Receiver<ProcessIn>) {
    for pi in input.iter() {
        let result = if Instant::now() >= pi.deadline {
            ProcessOut::failed(pi.key, SeriesError::Timeout)
        } else {
            process_docs(&ctx, &pi)
        };
        if pi.out.send(result).is_err() {
            debug!("Dropping result for bucket {} of {}: receiver gone", pi.key, pi.dbname);
        }
    }
}

/// Fetch, extract, filter and reduce one bundle
pub(crate) fn process_docs(ctx: &ProcessorContext, pi: &ProcessIn) -> ProcessOut {
    let ins = &pi.instructions;
    let reducers = match resolve_reducers(&ctx.reducers, ins) {
        Ok(r) => r,
        Err(e) => return ProcessOut::failed(pi.key, e),
    };
    let reader = match &pi.reader {
        Some(reader) => reader.clone(),
        None => match DocReader::open(store_path(&ctx.data_dir, &pi.dbname)) {
            Ok(r) => Arc::new(r),
            Err(e) => return ProcessOut::failed(pi.key, e),
        },
    };

    let mut streams: Vec<Vec<PtrVal>> = vec![Vec::with_capacity(pi.infos.len() + 1); ins.ptrs.len()];
    let docs = pi
        .infos
        .iter()
        .map(|info| (info, true))
        .chain(pi.next_info.iter().map(|info| (info, false)));
    for (info, included) in docs {
        feed(ctx, &reader, ins, info, included, &mut streams);
    }

    let value: Vec<Value> = reducers
        .iter()
        .zip(streams)
        .map(|(reducer, stream)| {
            let mut input = stream.into_iter();
            let reduced = reducer(&mut input);
            input.for_each(drop);
            finite_json(reduced)
        })
        .collect();

    if !pi.cache_key.is_empty() {
        if let Some(updates) = &ctx.cache_updates {
            let _ = updates.try_send(CacheUpdate {
                key: entry_key(&pi.cache_key, ins),
                value: value.clone(),
            });
        }
    }

    ProcessOut::ok(pi.key, value, pi.cache_key.clone())
}

fn resolve_reducers(registry: &ReducerRegistry, ins: &Instructions) -> Result<Vec<ReducerFn>> {
    if ins.reducers.len() != ins.ptrs.len() {
        return Err(SeriesError::Validation(format!(
            "{} reducers for {} pointers",
            ins.reducers.len(),
            ins.ptrs.len()
        )));
    }
    ins.reducers
        .iter()
        .map(|name| {
            registry
                .get(name)
                .ok_or_else(|| SeriesError::Validation(format!("unknown reducer {:?}", name)))
        })
        .collect()
}

/// Append one document's values to every field stream. A failed fetch sends
/// `Absent` to every field; a filtered-out document sends nothing.
fn feed(
    ctx: &ProcessorContext,
    reader: &DocReader,
    ins: &Instructions,
    info: &DocInfo,
    included: bool,
    streams: &mut [Vec<PtrVal>],
) {
    ctx.stats.record_fetch();
    let body = match reader.fetch_body(info) {
        Ok(body) => body,
        Err(e) => {
            warn!("Error fetching {} from {:?}: {}", info.id, reader.path(), e);
            for stream in streams.iter_mut() {
                stream.push(PtrVal {
                    doc: info.clone(),
                    value: FieldValue::Absent,
                    included,
                });
            }
            return;
        }
    };

    let fields = extract_fields(&info.id, &body, &ins.ptrs, &ins.filters);
    if !passes_filters(&fields, &ins.filters) {
        return;
    }
    for (ptr, stream) in ins.ptrs.iter().zip(streams.iter_mut()) {
        let value = fields
            .get(ptr.as_str())
            .cloned()
            .unwrap_or(FieldValue::Absent)
            .canonicalized();
        stream.push(PtrVal {
            doc: info.clone(),
            value,
            included,
        });
    }
}

/// JSON form of a reduced value; NaN and infinities become 0 and integral
/// numbers are written without a fraction
fn finite_json(v: FieldValue) -> Value {
    match v {
        FieldValue::Number(f) if !f.is_finite() => Value::from(0),
        FieldValue::Number(f) if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 => {
            Value::from(f as i64)
        }
        other => other.to_json(),
    }
}
