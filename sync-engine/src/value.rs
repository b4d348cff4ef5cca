//! Conversions between `rusqlite`'s storage-class value type and
//! `serde_json::Value`. Application columns are JSON-compatible scalars
//! (spec §9's design note: "treat values as JSON-compatible scalars"), so
//! there is no need for a richer mapping than integers, reals, text, and
//! null.

use rusqlite::types::Value as SqlValue;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::db::Row;

pub fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                SqlValue::Real(f)
            } else {
                SqlValue::Null
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        // Arrays/objects aren't part of the syncable-column contract, but
        // round-tripping them as opaque JSON text (rather than erroring)
        // keeps e.g. the archive row's `data` column — itself a serialized
        // prior-row payload — working without a special case.
        other => SqlValue::Text(other.to_string()),
    }
}

pub fn sql_to_json(value: &SqlValue) -> JsonValue {
    match value {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Integer(i) => JsonValue::from(*i),
        SqlValue::Real(f) => JsonValue::from(*f),
        SqlValue::Text(s) => JsonValue::String(s.clone()),
        SqlValue::Blob(_) => JsonValue::Null,
    }
}

/// Projects a `Row` through an ordered column list into a JSON object,
/// silently dropping any column the row doesn't have. Shared by the push
/// engine (building the upload payload) and the orchestrator's `delete`
/// (serializing the tombstoned row's prior state).
pub fn row_to_json(row: &Row, columns: &[String]) -> JsonValue {
    let mut map = JsonMap::new();
    for col in columns {
        if let Some(v) = row.get(col) {
            map.insert(col.clone(), sql_to_json(v));
        }
    }
    JsonValue::Object(map)
}
