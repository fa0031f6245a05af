//! Field extraction and filtering

use crate::{FieldValue, Filter};
use serde_json::Value;
use std::collections::HashMap;

/// Pointer resolving to the document key instead of a body field
pub const ID_POINTER: &str = "_id";

/// Resolve every distinct pointer in `ptrs` and `filters` against one parsed
/// body. Unresolvable pointers and unparseable bodies produce `Absent`.
pub fn extract_fields<'a>(
    doc_id: &str,
    body: &[u8],
    ptrs: &'a [String],
    filters: &'a [Filter],
) -> HashMap<&'a str, FieldValue> {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let wanted = ptrs
        .iter()
        .map(String::as_str)
        .chain(filters.iter().map(|f| f.pointer.as_str()));

    let mut fields = HashMap::new();
    for ptr in wanted {
        if fields.contains_key(ptr) {
            continue;
        }
        let value = if ptr == ID_POINTER {
            FieldValue::Text(doc_id.to_string())
        } else {
            parsed
                .as_ref()
                .and_then(|doc| doc.pointer(ptr))
                .map(FieldValue::from_json)
                .unwrap_or(FieldValue::Absent)
        };
        fields.insert(ptr, value);
    }
    fields
}

/// Whether every filter matches. Only text and numbers can match; any other
/// extracted value excludes the document.
pub fn passes_filters(fields: &HashMap<&str, FieldValue>, filters: &[Filter]) -> bool {
    filters.iter().all(|f| {
        fields
            .get(f.pointer.as_str())
            .and_then(FieldValue::canonical)
            .is_some_and(|v| v == f.value)
    })
}
