//! Record codec.
//!
//! An inspected record is stored twice: as a flat hash for field-level reads
//! and as a single JSON blob for whole-record reads. Both forms come out of
//! one pass over the record in [`EncodedRecord::encode`].

use std::collections::BTreeMap;

use serde_json::Value;

use crate::Error;

/// Nesting levels below the top level that are expanded into their own
/// fields. Anything deeper is stored as a JSON string.
pub const MAX_FLATTEN_DEPTH: usize = 1;

/// Separator between the segments of a flattened field name.
pub const FIELD_SEPARATOR: &str = "_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    pub fields: BTreeMap<String, String>,
    pub blob: String,
}

impl EncodedRecord {
    pub fn encode(record: &Value) -> Result<Self, Error> {
        Ok(Self {
            fields: flatten(record),
            blob: serde_json::to_string(record)?,
        })
    }

    pub fn field_pairs(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Flattens a record into lowercase field names mapped to string values.
///
/// `{"State": {"Running": true, "Health": {"Status": "ok"}}}` becomes
/// `state_running = "true"` and `state_health = "{\"Status\":\"ok\"}"`.
/// Arrays are walked like records keyed by index. Nulls are omitted.
pub fn flatten(record: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    flatten_into(&mut out, "", record, 0);
    out
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: &str, value: &Value, depth: usize) {
    match value {
        Value::Object(object) => {
            for (key, value) in object {
                flatten_entry(out, prefix, key, value, depth);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                flatten_entry(out, prefix, &index.to_string(), value, depth);
            }
        }
        _ => {}
    }
}

fn flatten_entry(
    out: &mut BTreeMap<String, String>,
    prefix: &str,
    key: &str,
    value: &Value,
    depth: usize,
) {
    let name = format!("{}{}", prefix, key.to_lowercase());
    match value {
        Value::Object(_) | Value::Array(_) if depth >= MAX_FLATTEN_DEPTH => {
            out.insert(name, value.to_string());
        }
        Value::Object(_) | Value::Array(_) => {
            let prefix = format!("{}{}", name, FIELD_SEPARATOR);
            flatten_into(out, &prefix, value, depth + 1);
        }
        Value::String(s) => {
            out.insert(name, s.clone());
        }
        Value::Bool(b) => {
            out.insert(name, b.to_string());
        }
        Value::Number(n) => {
            out.insert(name, n.to_string());
        }
        Value::Null => {}
    }
}
