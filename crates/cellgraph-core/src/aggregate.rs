use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{as_number, cell_title, compare_values, is_empty_value, number_value, value_to_text};

/// Rollup aggregate applied to the values gathered from foreign records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggregate {
    Sum,
    Count,
    CountAll,
    Average,
    Max,
    Min,
    Concatenate,
    ArrayJoin,
    ArrayUnique,
    ArrayCompact,
    And,
    Or,
}

fn flatten(values: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        match value {
            Value::Array(items) => out.extend(items),
            other => out.push(other),
        }
    }
    out
}

impl Aggregate {
    pub fn apply(self, values: Vec<Value>) -> Value {
        let values = flatten(values);
        match self {
            Aggregate::Sum => number_value(values.iter().filter_map(as_number).sum()),
            Aggregate::Count => Value::from(values.iter().filter(|v| !is_empty_value(v)).count() as i64),
            Aggregate::CountAll => Value::from(values.len() as i64),
            Aggregate::Average => {
                let numbers: Vec<f64> = values.iter().filter_map(as_number).collect();
                if numbers.is_empty() {
                    Value::Null
                } else {
                    number_value(numbers.iter().sum::<f64>() / numbers.len() as f64)
                }
            }
            Aggregate::Max => values
                .into_iter()
                .filter(|v| !v.is_null())
                .max_by(|a, b| compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal))
                .unwrap_or(Value::Null),
            Aggregate::Min => values
                .into_iter()
                .filter(|v| !v.is_null())
                .min_by(|a, b| compare_values(a, b).unwrap_or(std::cmp::Ordering::Equal))
                .unwrap_or(Value::Null),
            Aggregate::Concatenate => Value::String(
                values
                    .iter()
                    .filter(|v| !is_empty_value(v))
                    .map(cell_title)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Aggregate::ArrayJoin => Value::String(
                values.iter().map(value_to_text).collect::<Vec<_>>().join(", "),
            ),
            Aggregate::ArrayUnique => {
                let mut unique: Vec<Value> = Vec::new();
                for value in values {
                    if !unique.contains(&value) {
                        unique.push(value);
                    }
                }
                Value::Array(unique)
            }
            Aggregate::ArrayCompact => {
                Value::Array(values.into_iter().filter(|v| !is_empty_value(v)).collect())
            }
            Aggregate::And => Value::Bool(values.iter().all(truthy)),
            Aggregate::Or => Value::Bool(values.iter().any(truthy)),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        other => as_number(other).map(|n| n != 0.0).unwrap_or(!is_empty_value(other)),
    }
}
