use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::types::{FieldId, RecordId, TableId};

/// Collection key of a table's records in the collaboration log.
pub fn record_collection(table_id: &str) -> String {
    format!("rec_{table_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCellOp {
    pub field_id: FieldId,
    pub old_value: Value,
    pub new_value: Value,
}

/// A versioned, replayable mutation of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawOp {
    pub collection: String,
    pub record_id: RecordId,
    /// Version the receiving history must be at for this op to apply.
    pub expected_version: i64,
    pub ops: Vec<SetCellOp>,
}

impl RawOp {
    pub fn new(table_id: &str, record_id: impl Into<RecordId>, expected_version: i64) -> Self {
        Self {
            collection: record_collection(table_id),
            record_id: record_id.into(),
            expected_version,
            ops: Vec::new(),
        }
    }

    pub fn push(&mut self, field_id: impl Into<FieldId>, old_value: Value, new_value: Value) {
        self.ops.push(SetCellOp {
            field_id: field_id.into(),
            old_value,
            new_value,
        });
    }

    pub fn op_for(&self, field_id: &str) -> Option<&SetCellOp> {
        self.ops.iter().find(|op| op.field_id == field_id)
    }
}

/// Transaction-scoped buffer of ops awaiting post-commit publication.
#[derive(Debug, Default)]
pub struct OpBuffer {
    ops: Mutex<Vec<RawOp>>,
}

impl OpBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend<I: IntoIterator<Item = RawOp>>(&self, ops: I) {
        self.ops.lock().extend(ops.into_iter().filter(|op| !op.ops.is_empty()));
    }

    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<RawOp> {
        self.ops.lock().clone()
    }

    pub fn take(&self) -> Vec<RawOp> {
        std::mem::take(&mut *self.ops.lock())
    }

    /// Buffered ops grouped by collection, in arrival order.
    pub fn by_collection(&self) -> BTreeMap<String, Vec<RawOp>> {
        let mut out: BTreeMap<String, Vec<RawOp>> = BTreeMap::new();
        for op in self.ops.lock().iter() {
            out.entry(op.collection.clone()).or_default().push(op.clone());
        }
        out
    }

    /// Set-cell ops buffered for one table and field.
    pub fn cell_ops(&self, table_id: &TableId, field_id: &str) -> Vec<(RecordId, SetCellOp)> {
        let collection = record_collection(table_id);
        self.ops
            .lock()
            .iter()
            .filter(|op| op.collection == collection)
            .filter_map(|op| op.op_for(field_id).map(|c| (op.record_id.clone(), c.clone())))
            .collect()
    }
}

/// Receives ops after the transaction that produced them committed.
#[async_trait]
pub trait CollaborationSink: Send + Sync {
    async fn publish(&self, ops: Vec<RawOp>) -> Result<()>;
}
