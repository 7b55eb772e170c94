use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CellValue, FieldId, RecordId, TableId};

/// One cell edit. Drives every propagation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellChangeContext {
    pub table_id: TableId,
    pub record_id: RecordId,
    pub field_id: FieldId,
    #[serde(default)]
    pub old_value: Option<CellValue>,
    #[serde(default)]
    pub new_value: Option<CellValue>,
}

impl CellChangeContext {
    pub fn new(
        table_id: impl Into<TableId>,
        record_id: impl Into<RecordId>,
        field_id: impl Into<FieldId>,
        old_value: Option<CellValue>,
        new_value: Option<CellValue>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            record_id: record_id.into(),
            field_id: field_id.into(),
            old_value,
            new_value,
        }
    }

    pub fn old_or_null(&self) -> Value {
        self.old_value.clone().unwrap_or(Value::Null)
    }

    pub fn new_or_null(&self) -> Value {
        self.new_value.clone().unwrap_or(Value::Null)
    }
}

/// Foreign-key state of one link cell: nothing, a single id, or an ordered list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FkKey {
    None,
    One(RecordId),
    Many(Vec<RecordId>),
}

impl FkKey {
    pub fn ids(&self) -> Vec<RecordId> {
        match self {
            FkKey::None => Vec::new(),
            FkKey::One(id) => vec![id.clone()],
            FkKey::Many(ids) => ids.clone(),
        }
    }

    pub fn is_none(&self) -> bool {
        match self {
            FkKey::None => true,
            FkKey::One(_) => false,
            FkKey::Many(ids) => ids.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FkRecordItem {
    pub field_id: FieldId,
    pub record_id: RecordId,
    pub old_key: FkKey,
    pub new_key: FkKey,
}

/// Field assignments for one record addressed by the base update path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordUpdate {
    pub record_id: RecordId,
    /// Expected current version; checked when present.
    #[serde(default)]
    pub version: Option<i64>,
    pub fields: BTreeMap<FieldId, CellValue>,
}

impl RecordUpdate {
    pub fn new(record_id: impl Into<RecordId>) -> Self {
        Self {
            record_id: record_id.into(),
            version: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn set(mut self, field_id: impl Into<FieldId>, value: CellValue) -> Self {
        self.fields.insert(field_id.into(), value);
        self
    }

    pub fn at_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }
}
