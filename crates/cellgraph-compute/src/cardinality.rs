//! One handler per relationship cardinality, shared by the link service and
//! the dependency collector.

use std::collections::BTreeSet;

use cellgraph_core::{
    CellGraphError, FkKey, RecordId, Relationship, Result, ValidationCode,
};
use serde_json::Value;

/// Difference between the stored and the requested links of one cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkDiff {
    pub removed: Vec<RecordId>,
    pub added: Vec<RecordId>,
    /// Retained links must be renumbered: delete everything and reinsert.
    pub reorder: bool,
}

impl LinkDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && !self.reorder
    }
}

pub trait CardinalityHandler: Send + Sync {
    fn relationship(&self) -> Relationship;

    fn is_multi_valued(&self) -> bool {
        self.relationship().is_multi_valued()
    }

    /// Whether each foreign record may be linked from at most one host record
    /// through this field.
    fn claims_exclusive(&self) -> bool;

    /// Validates a cell value and extracts its foreign ids.
    fn keys_from_cell(&self, field_id: &str, value: &Value) -> Result<FkKey>;

    fn diff(&self, old: &[RecordId], new: &[RecordId]) -> LinkDiff;
}

fn item_id(field_id: &str, item: &Value) -> Result<RecordId> {
    match item {
        Value::String(id) if !id.is_empty() => Ok(id.clone()),
        Value::Object(map) => match map.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            _ => Err(CellGraphError::validation(
                ValidationCode::InvalidCellValue,
                format!("link item in {field_id} has no id"),
            )),
        },
        other => Err(CellGraphError::validation(
            ValidationCode::InvalidCellValue,
            format!("unexpected link item {other} in {field_id}"),
        )),
    }
}

/// Foreign ids mentioned by any link-shaped value, without validation.
pub fn link_ids_in(value: &Value) -> Vec<RecordId> {
    match value {
        Value::String(id) => vec![id.clone()],
        Value::Object(map) => map
            .get("id")
            .and_then(Value::as_str)
            .map(|id| vec![id.to_string()])
            .unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(link_ids_in).collect(),
        _ => Vec::new(),
    }
}

struct SingleValued(Relationship);
struct MultiValued(Relationship);

impl CardinalityHandler for SingleValued {
    fn relationship(&self) -> Relationship {
        self.0
    }

    fn claims_exclusive(&self) -> bool {
        true
    }

    fn keys_from_cell(&self, field_id: &str, value: &Value) -> Result<FkKey> {
        match value {
            Value::Null => Ok(FkKey::None),
            Value::Array(_) => Err(CellGraphError::validation(
                ValidationCode::InvalidCellValue,
                format!("{field_id} holds a single link, got a list"),
            )),
            item => item_id(field_id, item).map(FkKey::One),
        }
    }

    fn diff(&self, old: &[RecordId], new: &[RecordId]) -> LinkDiff {
        if old == new {
            return LinkDiff::default();
        }
        LinkDiff {
            removed: old.to_vec(),
            added: new.to_vec(),
            reorder: false,
        }
    }
}

impl CardinalityHandler for MultiValued {
    fn relationship(&self) -> Relationship {
        self.0
    }

    fn claims_exclusive(&self) -> bool {
        self.0 == Relationship::OneMany
    }

    fn keys_from_cell(&self, field_id: &str, value: &Value) -> Result<FkKey> {
        let items = match value {
            Value::Null => return Ok(FkKey::Many(Vec::new())),
            Value::Array(items) => items,
            _ => {
                return Err(CellGraphError::validation(
                    ValidationCode::InvalidCellValue,
                    format!("{field_id} holds a list of links, got a single value"),
                ))
            }
        };
        let mut seen = BTreeSet::new();
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = item_id(field_id, item)?;
            if !seen.insert(id.clone()) {
                return Err(CellGraphError::validation(
                    ValidationCode::DuplicateLinkTarget,
                    format!("{id} appears twice in {field_id}"),
                ));
            }
            ids.push(id);
        }
        Ok(FkKey::Many(ids))
    }

    fn diff(&self, old: &[RecordId], new: &[RecordId]) -> LinkDiff {
        let old_set: BTreeSet<&RecordId> = old.iter().collect();
        let new_set: BTreeSet<&RecordId> = new.iter().collect();
        let removed: Vec<RecordId> = old.iter().filter(|id| !new_set.contains(id)).cloned().collect();
        let added: Vec<RecordId> = new.iter().filter(|id| !old_set.contains(id)).cloned().collect();
        // Appending keeps stored order valid; anything else needs renumbering.
        let appended: Vec<&RecordId> = old
            .iter()
            .filter(|id| new_set.contains(id))
            .chain(added.iter())
            .collect();
        let reorder = appended.len() == new.len() && appended.iter().zip(new).any(|(a, b)| *a != b);
        LinkDiff {
            removed,
            added,
            reorder,
        }
    }
}

static ONE_ONE: SingleValued = SingleValued(Relationship::OneOne);
static MANY_ONE: SingleValued = SingleValued(Relationship::ManyOne);
static ONE_MANY: MultiValued = MultiValued(Relationship::OneMany);
static MANY_MANY: MultiValued = MultiValued(Relationship::ManyMany);

pub fn handler(relationship: Relationship) -> &'static dyn CardinalityHandler {
    match relationship {
        Relationship::OneOne => &ONE_ONE,
        Relationship::ManyOne => &MANY_ONE,
        Relationship::OneMany => &ONE_MANY,
        Relationship::ManyMany => &MANY_MANY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(list: &[&str]) -> Vec<RecordId> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn shape_is_checked_per_cardinality() {
        let single = handler(Relationship::ManyOne);
        assert_eq!(
            single.keys_from_cell("fld", &json!({"id": "rec1"})).unwrap(),
            FkKey::One("rec1".into())
        );
        let err = single.keys_from_cell("fld", &json!([{"id": "rec1"}])).unwrap_err();
        assert_eq!(err.validation_code(), Some(ValidationCode::InvalidCellValue));

        let multi = handler(Relationship::ManyMany);
        let err = multi.keys_from_cell("fld", &json!({"id": "rec1"})).unwrap_err();
        assert_eq!(err.validation_code(), Some(ValidationCode::InvalidCellValue));
        let err = multi
            .keys_from_cell("fld", &json!([{"id": "rec1"}, "rec1"]))
            .unwrap_err();
        assert_eq!(err.validation_code(), Some(ValidationCode::DuplicateLinkTarget));
        assert_eq!(multi.keys_from_cell("fld", &Value::Null).unwrap(), FkKey::Many(vec![]));
    }

    #[test]
    fn appends_do_not_reorder() {
        let multi = handler(Relationship::ManyMany);
        let diff = multi.diff(&ids(&["a", "b"]), &ids(&["a", "b", "c"]));
        assert_eq!(diff.added, ids(&["c"]));
        assert!(!diff.reorder);

        let diff = multi.diff(&ids(&["a", "b"]), &ids(&["b", "a"]));
        assert!(diff.added.is_empty() && diff.removed.is_empty());
        assert!(diff.reorder);

        let diff = multi.diff(&ids(&["a", "b"]), &ids(&["c", "b"]));
        assert_eq!(diff.removed, ids(&["a"]));
        assert!(diff.reorder);
    }

    #[test]
    fn single_links_and_one_many_lists_claim_exclusively() {
        assert!(handler(Relationship::OneOne).claims_exclusive());
        assert!(handler(Relationship::ManyOne).claims_exclusive());
        assert!(handler(Relationship::OneMany).claims_exclusive());
        assert!(!handler(Relationship::ManyMany).claims_exclusive());
    }

    #[test]
    fn link_ids_are_read_from_any_shape() {
        assert_eq!(link_ids_in(&json!([{"id": "a"}, "b"])), ids(&["a", "b"]));
        assert_eq!(link_ids_in(&json!({"id": "a", "title": "x"})), ids(&["a"]));
        assert!(link_ids_in(&Value::Null).is_empty());
    }
}
