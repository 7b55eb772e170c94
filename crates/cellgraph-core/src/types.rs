use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type TableId = String;
pub type FieldId = String;
pub type RecordId = String;

/// Logical cell value.
pub type CellValue = Value;

pub fn new_record_id() -> RecordId {
    format!("rec{}", Uuid::new_v4().simple())
}

/// A record as seen through the logical (field id keyed) lens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub id: RecordId,
    pub version: i64,
    /// Monotonic surrogate used for cursor paging.
    pub auto_number: i64,
    pub values: BTreeMap<FieldId, CellValue>,
}

impl RecordRow {
    pub fn value(&self, field_id: &str) -> &CellValue {
        self.values.get(field_id).unwrap_or(&Value::Null)
    }
}

pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.iter().all(is_empty_value),
        _ => false,
    }
}

pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Plain-text rendering used by string functions and comparisons.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => cell_title(value),
    }
}

/// Orders two scalar values: numerically when both are numeric, lexically otherwise.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    if left.is_null() || right.is_null() {
        return None;
    }
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) if !left.is_string() || !right.is_string() => a.partial_cmp(&b),
        _ => Some(value_to_text(left).cmp(&value_to_text(right))),
    }
}

pub fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    matches!(compare_values(left, right), Some(Ordering::Equal))
}

const TITLE_KEYS: [&str; 5] = ["title", "name", "text", "label", "email"];

/// Display title for an arbitrary cell value.
///
/// Objects are probed for the common shape keys, falling back to `id`.
pub fn cell_title(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            for key in TITLE_KEYS {
                if let Some(v) = map.get(key) {
                    if !v.is_null() {
                        return value_to_text(v);
                    }
                }
            }
            map.get("id").map(value_to_text).unwrap_or_default()
        }
        Value::Array(items) => items
            .iter()
            .map(cell_title)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        other => value_to_text(other),
    }
}
