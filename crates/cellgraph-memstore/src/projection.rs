//! Interprets computed projections against a database snapshot, and renders
//! the equivalent SQL for diagnostics.

use std::collections::BTreeMap;

use cellgraph_core::{
    cell_title, CellGraphError, Field, FieldType, Filter, LinkOptions, LookupOptions, RecordId,
    Result, RowContext, TableDomain, AUTO_NUMBER_COLUMN, CREATED_TIME_COLUMN, ID_COLUMN,
    LAST_MODIFIED_BY_COLUMN, LAST_MODIFIED_TIME_COLUMN,
};
use serde_json::{json, Value};

use crate::database::{row_text, MemoryDatabase, Row};

/// Logical value of `field` in a physical row.
pub fn logical_value(field: &Field, row: &Row) -> Value {
    row.get(&field.db_field_name)
        .map(|v| field.from_db_value(v))
        .unwrap_or(Value::Null)
}

struct LogicalRow<'a> {
    table: &'a TableDomain,
    row: &'a Row,
    record_id: String,
}

impl<'a> LogicalRow<'a> {
    fn new(table: &'a TableDomain, row: &'a Row) -> Self {
        Self {
            table,
            row,
            record_id: row_text(row, ID_COLUMN).unwrap_or_default(),
        }
    }

    fn get(&self, field_id: &str) -> Value {
        self.table
            .field(field_id)
            .map(|f| logical_value(f, self.row))
            .unwrap_or(Value::Null)
    }
}

impl RowContext for LogicalRow<'_> {
    fn record_id(&self) -> &str {
        &self.record_id
    }

    fn value(&self, field_id: &str) -> Value {
        self.get(field_id)
    }
}

pub struct Projector<'a> {
    db: &'a MemoryDatabase,
}

impl<'a> Projector<'a> {
    pub fn new(db: &'a MemoryDatabase) -> Self {
        Self { db }
    }

    /// Recomputes `field` for one row of `table`.
    pub fn evaluate(&self, table: &TableDomain, field: &Field, row: &Row) -> Result<Value> {
        let host = LogicalRow::new(table, row);
        if let Some(lookup) = field.lookup_options() {
            return self.evaluate_lookup(table, field, lookup, &host);
        }
        Ok(match field.field_type {
            FieldType::Formula => field
                .formula_expression()
                .map(|expr| expr.evaluate(&host))
                .unwrap_or(Value::Null),
            FieldType::Link => match field.link_options() {
                Some(link) => self.link_cell(link, &host.record_id)?,
                None => Value::Null,
            },
            FieldType::AutoNumber => row.get(AUTO_NUMBER_COLUMN).cloned().unwrap_or(Value::Null),
            FieldType::CreatedTime => row.get(CREATED_TIME_COLUMN).cloned().unwrap_or(Value::Null),
            FieldType::LastModifiedTime => row
                .get(LAST_MODIFIED_TIME_COLUMN)
                .cloned()
                .unwrap_or(Value::Null),
            FieldType::LastModifiedBy => row
                .get(LAST_MODIFIED_BY_COLUMN)
                .cloned()
                .unwrap_or(Value::Null),
            _ => logical_value(field, row),
        })
    }

    fn link_cell(&self, link: &LinkOptions, record_id: &str) -> Result<Value> {
        let pairs = self.db.read_links(link, &[record_id.to_string()], false)?;
        let foreign = self.db.domain(&link.foreign_table_id)?;
        let foreign_rows = self.db.table(&foreign.db_table_name)?;
        let title_field = foreign.field(&link.lookup_field_id);
        let items: Vec<Value> = pairs
            .iter()
            .map(|pair| {
                let title = foreign_rows
                    .row_by_id(&pair.foreign_id)
                    .and_then(|row| title_field.map(|f| logical_value(f, row)))
                    .filter(|v| !v.is_null())
                    .map(|v| cell_title(&v))
                    .unwrap_or_else(|| pair.foreign_id.clone());
                json!({ "id": pair.foreign_id, "title": title })
            })
            .collect();
        Ok(if link.relationship.is_multi_valued() {
            if items.is_empty() {
                Value::Null
            } else {
                Value::Array(items)
            }
        } else {
            items.into_iter().next().unwrap_or(Value::Null)
        })
    }

    /// Foreign rows feeding a lookup or rollup, in link order.
    fn foreign_rows(
        &self,
        table: &TableDomain,
        lookup: &LookupOptions,
        host: &LogicalRow<'_>,
    ) -> Result<Vec<&'a Row>> {
        let foreign = self.db.domain(&lookup.foreign_table_id)?;
        let foreign_table = self.db.table(&foreign.db_table_name)?;
        let candidates: Vec<&Row> = match &lookup.link_field_id {
            Some(link_field_id) => {
                let link_field = table.get_field(link_field_id)?;
                let link = link_field.link_options().ok_or_else(|| {
                    CellGraphError::Consistency(format!("{link_field_id} is not a link field"))
                })?;
                self.db
                    .read_links(link, &[host.record_id.clone()], false)?
                    .iter()
                    .filter_map(|pair| foreign_table.row_by_id(&pair.foreign_id))
                    .collect()
            }
            None => foreign_table.rows().map(|(_, row)| row).collect(),
        };
        let Some(filter) = &lookup.filter else {
            return Ok(candidates);
        };
        Ok(candidates
            .into_iter()
            .filter(|row| matches_filter(filter, foreign, row, host))
            .collect())
    }

    fn evaluate_lookup(
        &self,
        table: &TableDomain,
        field: &Field,
        lookup: &LookupOptions,
        host: &LogicalRow<'_>,
    ) -> Result<Value> {
        let foreign = self.db.domain(&lookup.foreign_table_id)?;
        let looked_up = foreign.get_field(&lookup.lookup_field_id)?;
        let values: Vec<Value> = self
            .foreign_rows(table, lookup, host)?
            .into_iter()
            .map(|row| logical_value(looked_up, row))
            .collect();
        if let Some(aggregate) = field.aggregate().filter(|_| !field.is_lookup) {
            return Ok(aggregate.apply(values));
        }
        let flat: Vec<Value> = values
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            })
            .collect();
        Ok(if flat.is_empty() {
            Value::Null
        } else {
            Value::Array(flat)
        })
    }
}

fn matches_filter(filter: &Filter, foreign: &TableDomain, row: &Row, host: &LogicalRow<'_>) -> bool {
    let foreign_row = LogicalRow::new(foreign, row);
    filter.matches(&|id| foreign_row.get(id), &|id| host.get(id))
}

/// Logical values of every field in `row`.
pub fn logical_values(table: &TableDomain, row: &Row) -> BTreeMap<String, Value> {
    table
        .fields()
        .iter()
        .map(|f| (f.id.clone(), logical_value(f, row)))
        .collect()
}

pub fn record_id_of(row: &Row) -> Option<RecordId> {
    row_text(row, ID_COLUMN)
}

/// SQL the projection stands for. Only used for logs and error context.
pub fn render_select(db: &MemoryDatabase, table: &TableDomain, fields: &[&Field]) -> String {
    let mut columns = vec![format!("\"{ID_COLUMN}\"")];
    for field in fields {
        columns.push(format!("{} AS \"{}\"", render_field(db, table, field), field.db_field_name));
    }
    format!("SELECT {} FROM \"{}\"", columns.join(", "), table.db_table_name)
}

fn render_field(db: &MemoryDatabase, table: &TableDomain, field: &Field) -> String {
    let column_of = |table_id: &str, field_id: &str| -> String {
        db.domain(table_id)
            .ok()
            .and_then(|d| d.field(field_id).map(|f| f.db_field_name.clone()))
            .unwrap_or_else(|| field_id.to_string())
    };
    if let Some(lookup) = field.lookup_options() {
        let foreign_name = db
            .domain(&lookup.foreign_table_id)
            .map(|d| d.db_table_name.clone())
            .unwrap_or_else(|_| lookup.foreign_table_id.clone());
        let agg = match field.aggregate().filter(|_| !field.is_lookup) {
            Some(aggregate) => format!("{aggregate:?}").to_lowercase(),
            None => "json_agg".to_string(),
        };
        let value = column_of(&lookup.foreign_table_id, &lookup.lookup_field_id);
        let join = lookup
            .link_field_id
            .as_deref()
            .and_then(|id| table.field(id))
            .and_then(Field::link_options)
            .map(|link| {
                format!(
                    " JOIN \"{host}\" l ON l.\"{fk}\" = f.\"{ID_COLUMN}\" AND l.\"{sk}\" = t.\"{ID_COLUMN}\"",
                    host = link.fk_host_table_name,
                    fk = link.foreign_key_name,
                    sk = link.self_key_name,
                )
            })
            .unwrap_or_default();
        let filter = if lookup.filter.is_some() { " WHERE <filter>" } else { "" };
        return format!("(SELECT {agg}(f.\"{value}\") FROM \"{foreign_name}\" f{join}{filter})");
    }
    match field.field_type {
        FieldType::Formula => "<formula>".to_string(),
        FieldType::Link => field
            .link_options()
            .map(|link| {
                format!(
                    "(SELECT json_agg(l.\"{fk}\") FROM \"{host}\" l WHERE l.\"{sk}\" = t.\"{ID_COLUMN}\")",
                    host = link.fk_host_table_name,
                    fk = link.foreign_key_name,
                    sk = link.self_key_name,
                )
            })
            .unwrap_or_default(),
        FieldType::AutoNumber => format!("\"{AUTO_NUMBER_COLUMN}\""),
        FieldType::CreatedTime => format!("\"{CREATED_TIME_COLUMN}\""),
        FieldType::LastModifiedTime => format!("\"{LAST_MODIFIED_TIME_COLUMN}\""),
        FieldType::LastModifiedBy => format!("\"{LAST_MODIFIED_BY_COLUMN}\""),
        _ => format!("\"{}\"", field.db_field_name),
    }
}
