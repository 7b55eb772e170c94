//! Batch service: user field writes as versioned record ops.

use std::collections::{BTreeMap, BTreeSet};

use cellgraph_core::{
    CellGraphError, CellValue, FieldId, RawOp, RecordId, RecordRow, RecordUpdate, Result,
    StorageErrorKind, TableDomain, UpdatedRow, ValidationCode,
};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::ComputeContext;

pub struct BatchService<'a> {
    ctx: &'a ComputeContext,
}

impl<'a> BatchService<'a> {
    pub fn new(ctx: &'a ComputeContext) -> Self {
        Self { ctx }
    }

    /// Checks that every update addresses an existing record at its current
    /// version and writes only user-editable fields. Returns the current rows.
    pub async fn check_updates(
        &self,
        table: &TableDomain,
        updates: &[RecordUpdate],
    ) -> Result<BTreeMap<RecordId, RecordRow>> {
        for update in updates {
            for field_id in update.fields.keys() {
                let field = table.get_field(field_id)?;
                if field.is_derived() && field.link_options().is_none() {
                    return Err(CellGraphError::validation(
                        ValidationCode::IllegalOperation,
                        format!("{} is computed and cannot be written directly", field.name),
                    ));
                }
            }
        }
        let ids: Vec<RecordId> = updates
            .iter()
            .map(|u| u.record_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let current: BTreeMap<RecordId, RecordRow> = self
            .ctx
            .store()
            .get_records(table, &ids)
            .await?
            .into_iter()
            .map(|row| (row.id.clone(), row))
            .collect();
        for update in updates {
            let Some(row) = current.get(&update.record_id) else {
                return Err(CellGraphError::validation(
                    ValidationCode::RecordNotFound,
                    format!("record {} not found in {}", update.record_id, table.name),
                ));
            };
            if let Some(expected) = update.version {
                if expected != row.version {
                    return Err(CellGraphError::validation(
                        ValidationCode::VersionMismatch,
                        format!(
                            "record {} is at version {}, update expected {expected}",
                            row.id, row.version
                        ),
                    ));
                }
            }
        }
        Ok(current)
    }

    /// Writes user values, bumping each record's version by one, and queues
    /// one raw op per record.
    pub async fn update_records(&self, table_id: &str, updates: &[RecordUpdate]) -> Result<Vec<UpdatedRow>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.ctx.table(table_id).await?;
        self.check_updates(&table, updates).await?;

        // Repeated records collapse into one write; later values win.
        let mut merged: BTreeMap<&RecordId, BTreeMap<&FieldId, &CellValue>> = BTreeMap::new();
        for update in updates {
            merged.entry(&update.record_id).or_default().extend(update.fields.iter());
        }
        let mut groups: BTreeMap<Vec<FieldId>, Vec<(RecordId, Vec<CellValue>)>> = BTreeMap::new();
        for (record_id, fields) in merged {
            let columns: Vec<FieldId> = fields.keys().map(|id| (*id).clone()).collect();
            let values: Vec<CellValue> = fields.values().map(|v| (*v).clone()).collect();
            groups.entry(columns).or_default().push((record_id.clone(), values));
        }

        let actor = self.ctx.config().actor.as_str();
        let mut updated = Vec::new();
        for (field_ids, rows) in groups {
            if field_ids.is_empty() {
                continue;
            }
            debug!(table = %table.db_table_name, fields = field_ids.len(), records = rows.len(), "bulk update group");
            let written = self
                .ctx
                .store()
                .bulk_update(&table, &field_ids, &rows, actor)
                .await
                .map_err(|err| constraint_violation(&table, err))?;
            updated.extend(written);
        }

        let ops: Vec<RawOp> = updated
            .iter()
            .map(|row| {
                let mut op = RawOp::new(&table.id, row.record_id.clone(), row.version_before);
                for (field_id, new) in &row.new_values {
                    let old = row.old_values.get(field_id).cloned().unwrap_or(Value::Null);
                    op.push(field_id.clone(), old, new.clone());
                }
                op
            })
            .collect();
        counter!("cellgraph_base_ops_total").increment(ops.len() as u64);
        info!(table = %table.id, records = updated.len(), "base records updated");
        self.ctx.ops().extend(ops);
        Ok(updated)
    }

    /// Writes derived cells without touching versions and queues an op for
    /// every cell whose value changed. Returns the number of raw ops queued.
    pub async fn save_computed_cells(
        &self,
        table_id: &str,
        cells: Vec<(RecordId, FieldId, CellValue)>,
    ) -> Result<usize> {
        if cells.is_empty() {
            return Ok(0);
        }
        let table = self.ctx.table(table_id).await?;
        let rows = self.ctx.store().write_cells(&table, &cells).await?;
        let mut ops = Vec::new();
        for row in rows {
            let mut op = RawOp::new(&table.id, row.record_id.clone(), row.version_after);
            for (field_id, new) in &row.new_values {
                let old = row.old_values.get(field_id).cloned().unwrap_or(Value::Null);
                if old != *new {
                    op.push(field_id.clone(), old, new.clone());
                }
            }
            if !op.ops.is_empty() {
                ops.push(op);
            }
        }
        let count = ops.len();
        self.ctx.ops().extend(ops);
        self.ctx.record_computed_ops(count);
        counter!("cellgraph_computed_ops_total").increment(count as u64);
        Ok(count)
    }
}

/// Maps unique and not-null storage failures onto the offending field.
fn constraint_violation(table: &TableDomain, err: CellGraphError) -> CellGraphError {
    let violation = match &err {
        CellGraphError::Storage(storage) => match &storage.kind {
            StorageErrorKind::UniqueViolation { column } => {
                Some((ValidationCode::UniqueViolation, column.clone(), "must be unique"))
            }
            StorageErrorKind::NotNullViolation { column } => {
                Some((ValidationCode::NotNullViolation, column.clone(), "cannot be empty"))
            }
            _ => None,
        },
        _ => None,
    };
    let Some((code, column, what)) = violation else {
        return err;
    };
    let name = table
        .fields()
        .iter()
        .find(|f| f.db_field_name == column)
        .map(|f| f.name.clone())
        .unwrap_or(column);
    CellGraphError::validation(code, format!("field {name} {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgraph_core::{Field, FieldType, StorageError};

    #[test]
    fn constraint_errors_name_the_field() {
        let table = TableDomain::new(
            "tbl_people",
            "People",
            "t_people",
            vec![Field::new("fld_email", "Email", FieldType::SingleLineText).with_db_field_name("email")],
        );
        let err = constraint_violation(
            &table,
            StorageError::new(
                StorageErrorKind::UniqueViolation { column: "email".into() },
                "duplicate key",
            )
            .into(),
        );
        assert_eq!(err.validation_code(), Some(ValidationCode::UniqueViolation));
        assert!(err.to_string().contains("Email"));

        let err = constraint_violation(&table, StorageError::deadlock("deadlock detected").into());
        assert!(err.is_deadlock());
    }
}
