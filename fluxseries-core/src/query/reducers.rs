//! Reducer registry and built-in reducers
//!
//! A reducer consumes every value extracted for one pointer within one bucket
//! and returns a single aggregate. Values arrive tagged with their document
//! and with `included`, which is `false` only for the boundary document that
//! follows the bucket. The input ends when the bucket has been fully sent.

use crate::docstore::DocInfo;
use crate::{key_timestamp, FieldValue};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// One extracted value handed to a reducer
#[derive(Debug, Clone)]
pub struct PtrVal {
    pub doc: DocInfo,
    pub value: FieldValue,
    /// `false` for the boundary document
    pub included: bool,
}

/// Reduction over one bucket's values for one pointer
pub type ReducerFn = Arc<dyn Fn(&mut dyn Iterator<Item = PtrVal>) -> FieldValue + Send + Sync>;

/// Name → reducer map
pub struct ReducerRegistry {
    reducers: RwLock<HashMap<String, ReducerFn>>,
}

impl ReducerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            reducers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding every built-in reducer
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("any", any);
        registry.register("count", count);
        registry.register("sum", sum);
        registry.register("sumsq", sumsq);
        registry.register("min", min);
        registry.register("max", max);
        registry.register("avg", avg);
        registry.register("first", first);
        registry.register("last", last);
        registry.register("boundary", boundary);
        registry.register("c_min", counter_min);
        registry.register("c_max", counter_max);
        registry.register("c_avg", counter_avg);
        registry.register("identity", identity);
        registry
    }

    /// Add or replace a reducer
    pub fn register<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut dyn Iterator<Item = PtrVal>) -> FieldValue + Send + Sync + 'static,
    {
        self.reducers.write().insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<ReducerFn> {
        self.reducers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.reducers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.reducers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn members(input: &mut dyn Iterator<Item = PtrVal>) -> impl Iterator<Item = PtrVal> + '_ {
    input.filter(|pv| pv.included)
}

fn member_numbers(input: &mut dyn Iterator<Item = PtrVal>) -> impl Iterator<Item = f64> + '_ {
    members(input).filter_map(|pv| pv.value.as_f64())
}

fn any(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    members(input)
        .map(|pv| pv.value)
        .find(|v| !v.is_absent())
        .unwrap_or(FieldValue::Absent)
}

fn count(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    FieldValue::Number(members(input).filter(|pv| !pv.value.is_absent()).count() as f64)
}

fn sum(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    FieldValue::Number(member_numbers(input).sum())
}

fn sumsq(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    FieldValue::Number(member_numbers(input).map(|v| v * v).sum())
}

// Empty buckets yield NaN, which the processor reports as 0
fn min(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    FieldValue::Number(member_numbers(input).fold(f64::NAN, f64::min))
}

fn max(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    FieldValue::Number(member_numbers(input).fold(f64::NAN, f64::max))
}

fn avg(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    let (total, n) = member_numbers(input).fold((0.0, 0u64), |(t, n), v| (t + v, n + 1));
    FieldValue::Number(total / n as f64)
}

fn first(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    any(input)
}

fn last(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    members(input)
        .map(|pv| pv.value)
        .filter(|v| !v.is_absent())
        .last()
        .unwrap_or(FieldValue::Absent)
}

/// Value at the bucket's right edge: the boundary document when it has one,
/// otherwise the last member
fn boundary(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    let mut last_member = FieldValue::Absent;
    let mut edge = FieldValue::Absent;
    for pv in input {
        if pv.value.is_absent() {
            continue;
        }
        if pv.included {
            last_member = pv.value;
        } else {
            edge = pv.value;
        }
    }
    if edge.is_absent() {
        last_member
    } else {
        edge
    }
}

/// Per-second rates between consecutive samples of a monotonically
/// increasing counter, boundary sample included. Resets are skipped.
fn counter_rates(input: &mut dyn Iterator<Item = PtrVal>) -> Vec<f64> {
    let mut rates = Vec::new();
    let mut prev: Option<(i64, f64)> = None;
    for pv in input {
        let (Some(v), Ok(ts)) = (pv.value.as_f64(), key_timestamp(&pv.doc.id)) else {
            continue;
        };
        if let Some((prev_ts, prev_v)) = prev {
            let dt = (ts - prev_ts) as f64 / 1e9;
            if v >= prev_v && dt > 0.0 {
                rates.push((v - prev_v) / dt);
            }
        }
        prev = Some((ts, v));
    }
    rates
}

fn counter_min(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    FieldValue::Number(counter_rates(input).into_iter().fold(f64::NAN, f64::min))
}

fn counter_max(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    FieldValue::Number(counter_rates(input).into_iter().fold(f64::NAN, f64::max))
}

fn counter_avg(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    let rates = counter_rates(input);
    FieldValue::Number(rates.iter().sum::<f64>() / rates.len() as f64)
}

/// Every member as `[key, value]`
fn identity(input: &mut dyn Iterator<Item = PtrVal>) -> FieldValue {
    let rows: Vec<Value> = members(input)
        .map(|pv| json!([pv.doc.id, pv.value.to_json()]))
        .collect();
    FieldValue::Other(Value::Array(rows))
}
