//! Phase result merging
//!
//! Rules, applied per key in phase order:
//! - nested objects merge recursively
//! - lists concatenate, with placeholder entries dropped once real items exist
//! - scalars: the last non-empty value wins
//!
//! Placeholders and blank strings count as empty, so a later phase that had
//! to backfill a field never overwrites real content from an earlier one.

use serde_json::{Map, Value};

use crate::ai::recovery::schema::is_empty_value;

/// Merge phase records in order
pub fn merge_records<I>(records: I) -> Map<String, Value>
where
    I: IntoIterator<Item = Map<String, Value>>,
{
    let mut merged = Map::new();
    for record in records {
        merge_into(&mut merged, record);
    }
    merged
}

/// Merge `source` into `target`
pub fn merge_into(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match target.get_mut(&key) {
            Some(existing) => merge_value(existing, value),
            None => {
                target.insert(key, value);
            }
        }
    }
}

fn merge_value(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => merge_into(target, source),
        (Value::Array(target), Value::Array(source)) => {
            let incoming: Vec<Value> = source.into_iter().filter(|v| !is_empty_value(v)).collect();
            if incoming.is_empty() {
                return;
            }
            target.retain(|v| !is_empty_value(v));
            target.extend(incoming);
        }
        (target, source) => {
            if !is_empty_value(&source) || is_empty_value(target) {
                *target = source;
            }
        }
    }
}
