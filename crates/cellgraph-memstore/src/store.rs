use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cellgraph_core::{
    new_record_id, CellGraphError, CellValue, ComputedSelect, Field, FieldId, HostPredicate,
    LinkClosurePlan, LinkOptions, LinkPair, MetadataProvider, RecordId, RecordRow, RecordStore,
    ReferenceEdge, Result, SelectScope, StorageError, StorageErrorKind, TableDomain, TableId,
    UpdatedRow, AUTO_NUMBER_COLUMN, LAST_MODIFIED_BY_COLUMN, LAST_MODIFIED_TIME_COLUMN,
    VERSION_COLUMN,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::database::{row_i64, MemoryDatabase, Row};
use crate::projection::{logical_value, logical_values, record_id_of, render_select, Projector};

struct Shared {
    db: MemoryDatabase,
    generation: u64,
}

#[derive(Default)]
struct StoreStats {
    update_from_select_calls: AtomicUsize,
    bulk_update_calls: AtomicUsize,
    commits: AtomicUsize,
    lock_log: Mutex<Vec<(String, Vec<RecordId>)>>,
}

/// Point-in-time counters of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub update_from_select_calls: usize,
    pub bulk_update_calls: usize,
    pub commits: usize,
    /// Physical table name and record ids of every `lock_records` call, in call order.
    pub lock_log: Vec<(String, Vec<RecordId>)>,
}

struct StoreInner {
    shared: RwLock<Shared>,
    stats: StoreStats,
    pending_deadlocks: AtomicU32,
    row_locks: AtomicBool,
}

/// In-memory database with snapshot transactions.
///
/// `begin` clones the committed state; `commit` publishes the clone unless
/// another transaction committed first.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                shared: RwLock::new(Shared {
                    db: MemoryDatabase::new(),
                    generation: 0,
                }),
                stats: StoreStats::default(),
                pending_deadlocks: AtomicU32::new(0),
                row_locks: AtomicBool::new(true),
            }),
        }
    }

    /// A store reporting itself as single-writer, so callers skip row locks.
    pub fn single_writer() -> Self {
        let store = Self::new();
        store.inner.row_locks.store(false, Ordering::SeqCst);
        store
    }

    pub fn begin(&self) -> MemoryTransaction {
        let shared = self.inner.shared.read();
        MemoryTransaction {
            store: self.inner.clone(),
            base_generation: shared.generation,
            db: RwLock::new(shared.db.clone()),
            actor: "system".to_string(),
        }
    }

    /// The next `count` update-from-select calls fail with a deadlock.
    pub fn inject_deadlocks(&self, count: u32) {
        self.inner.pending_deadlocks.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.inner.stats;
        StatsSnapshot {
            update_from_select_calls: stats.update_from_select_calls.load(Ordering::SeqCst),
            bulk_update_calls: stats.bulk_update_calls.load(Ordering::SeqCst),
            commits: stats.commits.load(Ordering::SeqCst),
            lock_log: stats.lock_log.lock().clone(),
        }
    }

    pub fn reset_stats(&self) {
        let stats = &self.inner.stats;
        stats.update_from_select_calls.store(0, Ordering::SeqCst);
        stats.bulk_update_calls.store(0, Ordering::SeqCst);
        stats.commits.store(0, Ordering::SeqCst);
        stats.lock_log.lock().clear();
    }
}

/// A private working copy of the database.
pub struct MemoryTransaction {
    store: Arc<StoreInner>,
    base_generation: u64,
    db: RwLock<MemoryDatabase>,
    actor: String,
}

impl MemoryTransaction {
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn commit(&self) -> Result<()> {
        let mut shared = self.store.shared.write();
        if shared.generation != self.base_generation {
            return Err(StorageError::new(
                StorageErrorKind::WriteConflict,
                "could not serialize access due to concurrent update",
            )
            .into());
        }
        shared.db = self.db.read().clone();
        shared.generation += 1;
        self.store.stats.commits.fetch_add(1, Ordering::SeqCst);
        debug!(generation = shared.generation, "memory transaction committed");
        Ok(())
    }

    pub fn create_table(&self, domain: TableDomain) -> Result<()> {
        self.db.write().create_table(domain)
    }

    pub fn create_field(&self, table_id: &str, field: Field) -> Result<()> {
        self.db.write().create_field(table_id, field)
    }

    pub fn delete_field(&self, table_id: &str, field_id: &str) -> Result<Field> {
        self.db.write().delete_field(table_id, field_id)
    }

    pub fn add_reference(&self, from_field_id: &str, to_field_id: &str) {
        self.db
            .write()
            .add_reference(ReferenceEdge::new(from_field_id, to_field_id));
    }

    /// Drops one edge from the reference graph, simulating a graph that
    /// predates the edge.
    pub fn remove_reference(&self, from_field_id: &str, to_field_id: &str) -> bool {
        self.db.write().remove_reference(from_field_id, to_field_id)
    }

    /// Inserts records with user values keyed by field id; derived columns
    /// start empty. Returns the new ids in input order.
    pub fn insert_records(
        &self,
        table_id: &str,
        records: Vec<BTreeMap<FieldId, Value>>,
    ) -> Result<Vec<RecordId>> {
        let mut ids = Vec::with_capacity(records.len());
        for values in records {
            let id = values
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(new_record_id);
            self.insert_record_with_id(table_id, &id, values)?;
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn insert_record_with_id(
        &self,
        table_id: &str,
        record_id: &str,
        values: BTreeMap<FieldId, Value>,
    ) -> Result<()> {
        let mut db = self.db.write();
        let domain = db.domain(table_id)?.clone();
        let mut columns = Row::new();
        for (field_id, value) in values {
            if field_id == "id" {
                continue;
            }
            let field = domain.get_field(&field_id)?;
            columns.insert(field.db_field_name.clone(), field.to_db_value(&value));
        }
        let now = Utc::now().to_rfc3339();
        db.insert_record(table_id, record_id.to_string(), columns, &now, &self.actor)?;
        Ok(())
    }

    /// Inserts link key pairs directly, numbering orders per anchor.
    pub fn link(&self, table_id: &str, field_id: &str, record_id: &str, foreign_ids: &[&str]) -> Result<()> {
        let mut db = self.db.write();
        let link = db
            .domain(table_id)?
            .get_field(field_id)?
            .link_options()
            .cloned()
            .ok_or_else(|| CellGraphError::Consistency(format!("{field_id} is not a link field")))?;
        let start = db
            .read_links(&link, &[record_id.to_string()], false)?
            .iter()
            .filter_map(|p| p.order)
            .max()
            .unwrap_or(0);
        let pairs: Vec<LinkPair> = foreign_ids
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let order = link.order_column_name.as_ref().map(|_| start + i as i64 + 1);
                LinkPair::new(record_id, *f, order)
            })
            .collect();
        db.insert_links(&link, &pairs)
    }

    /// Recomputes every derived column of every table until nothing changes.
    pub fn materialize_all(&self) -> Result<usize> {
        let mut db = self.db.write();
        let max_passes = db.domains().map(|d| d.fields().len()).sum::<usize>() + 2;
        let mut passes = 0;
        loop {
            passes += 1;
            let mut changed = false;
            let domains: Vec<TableDomain> = db.domains().cloned().collect();
            for domain in &domains {
                let fields: Vec<&Field> = domain.fields().iter().filter(|f| f.is_derived()).collect();
                if fields.is_empty() {
                    continue;
                }
                let updates = compute_rows(&db, domain, &fields, &SelectScope::Table)?;
                for (row_id, _, values) in updates {
                    let table = db.table_mut(&domain.db_table_name)?;
                    if let Some(row) = table.row_by_id_mut(&row_id) {
                        for (column, value) in values {
                            if row.get(&column) != Some(&value) {
                                row.insert(column, value);
                                changed = true;
                            }
                        }
                    }
                }
            }
            if !changed || passes >= max_passes {
                break;
            }
        }
        Ok(passes)
    }

    /// Logical values of one record, for assertions.
    pub fn record(&self, table_id: &str, record_id: &str) -> Result<RecordRow> {
        let db = self.db.read();
        let domain = db.domain(table_id)?;
        let table = db.table(&domain.db_table_name)?;
        let row = table
            .row_by_id(record_id)
            .ok_or_else(|| CellGraphError::NotFound(format!("record {record_id} in {table_id}")))?;
        Ok(to_record_row(domain, row))
    }

    pub fn value(&self, table_id: &str, record_id: &str, field_id: &str) -> Result<Value> {
        Ok(self.record(table_id, record_id)?.value(field_id).clone())
    }

    fn maybe_deadlock(&self, table: &TableDomain) -> Result<()> {
        let pending = &self.store.pending_deadlocks;
        let fired = pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fired {
            return Err(StorageError::deadlock(format!(
                "deadlock detected while updating \"{}\"",
                table.db_table_name
            ))
            .into());
        }
        Ok(())
    }
}

fn to_record_row(domain: &TableDomain, row: &Row) -> RecordRow {
    RecordRow {
        id: record_id_of(row).unwrap_or_default(),
        version: row_i64(row, VERSION_COLUMN).unwrap_or(0),
        auto_number: row_i64(row, AUTO_NUMBER_COLUMN).unwrap_or(0),
        values: logical_values(domain, row),
    }
}

type ComputedRow = (RecordId, i64, Vec<(String, Value)>);

/// Evaluates `fields` for every row in `scope` against one snapshot.
fn compute_rows(
    db: &MemoryDatabase,
    domain: &TableDomain,
    fields: &[&Field],
    scope: &SelectScope,
) -> Result<Vec<ComputedRow>> {
    let table = db.table(&domain.db_table_name)?;
    let projector = Projector::new(db);
    let in_scope: Vec<&Row> = match scope {
        SelectScope::Table => table.rows().map(|(_, row)| row).collect(),
        SelectScope::RecordIds(ids) => {
            let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
            table
                .rows()
                .map(|(_, row)| row)
                .filter(|row| record_id_of(row).is_some_and(|id| wanted.contains(id.as_str())))
                .collect()
        }
        SelectScope::Cursor {
            after,
            limit,
            restrict_to,
        } => table
            .rows()
            .filter(|(row_id, _)| after.map_or(true, |a| **row_id > a))
            .map(|(_, row)| row)
            .filter(|row| match restrict_to {
                Some(ids) => record_id_of(row).is_some_and(|id| ids.contains(&id)),
                None => true,
            })
            .take(*limit)
            .collect(),
    };
    let mut out = Vec::with_capacity(in_scope.len());
    for row in in_scope {
        let Some(record_id) = record_id_of(row) else {
            continue;
        };
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let value = projector.evaluate(domain, field, row)?;
            values.push((field.db_field_name.clone(), field.to_db_value(&value)));
        }
        out.push((record_id, row_i64(row, AUTO_NUMBER_COLUMN).unwrap_or(0), values));
    }
    Ok(out)
}

fn check_constraints(
    table_rows: &crate::database::PhysicalTable,
    field: &Field,
    record_id: &str,
    value: &Value,
) -> Result<()> {
    if field.not_null && cellgraph_core::is_empty_value(value) {
        return Err(StorageError::new(
            StorageErrorKind::NotNullViolation {
                column: field.db_field_name.clone(),
            },
            format!("null value in column \"{}\" violates not-null constraint", field.db_field_name),
        )
        .into());
    }
    if field.unique && !value.is_null() {
        let stored = field.to_db_value(value);
        let clash = table_rows.rows().any(|(_, row)| {
            record_id_of(row).as_deref() != Some(record_id) && row.get(&field.db_field_name) == Some(&stored)
        });
        if clash {
            return Err(StorageError::new(
                StorageErrorKind::UniqueViolation {
                    column: field.db_field_name.clone(),
                },
                format!("duplicate key value violates unique constraint on \"{}\"", field.db_field_name),
            )
            .into());
        }
    }
    Ok(())
}

#[async_trait]
impl MetadataProvider for MemoryTransaction {
    async fn get_table_domain(&self, table_id: &str) -> Result<TableDomain> {
        self.db.read().domain(table_id).cloned()
    }

    async fn get_table_domains_by_ids(&self, table_ids: &[TableId]) -> Result<Vec<TableDomain>> {
        let db = self.db.read();
        Ok(table_ids
            .iter()
            .filter_map(|id| db.domain(id).ok().cloned())
            .collect())
    }

    async fn table_ids_by_field_ids(&self, field_ids: &[FieldId]) -> Result<BTreeMap<FieldId, TableId>> {
        let db = self.db.read();
        Ok(field_ids
            .iter()
            .filter_map(|id| db.field_table(id).map(|t| (id.clone(), t.clone())))
            .collect())
    }

    async fn reference_edges_from(&self, field_ids: &[FieldId]) -> Result<Vec<ReferenceEdge>> {
        Ok(self.db.read().reference_edges_from(field_ids))
    }

    async fn reference_edges_among(&self, field_ids: &[FieldId]) -> Result<Vec<ReferenceEdge>> {
        Ok(self.db.read().reference_edges_among(field_ids))
    }
}

#[async_trait]
impl RecordStore for MemoryTransaction {
    async fn get_records(&self, table: &TableDomain, record_ids: &[RecordId]) -> Result<Vec<RecordRow>> {
        let db = self.db.read();
        let physical = db.table(&table.db_table_name)?;
        let wanted: HashSet<&str> = record_ids.iter().map(String::as_str).collect();
        Ok(physical
            .rows()
            .filter(|(_, row)| record_id_of(row).is_some_and(|id| wanted.contains(id.as_str())))
            .map(|(_, row)| to_record_row(table, row))
            .collect())
    }

    async fn count_records(&self, table: &TableDomain) -> Result<usize> {
        Ok(self.db.read().table(&table.db_table_name)?.len())
    }

    async fn list_record_ids(&self, table: &TableDomain, limit: Option<usize>) -> Result<Vec<RecordId>> {
        let db = self.db.read();
        Ok(db
            .table(&table.db_table_name)?
            .rows()
            .filter_map(|(_, row)| record_id_of(row))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn select_record_ids(
        &self,
        table: &TableDomain,
        predicate: &HostPredicate,
        limit: usize,
    ) -> Result<Vec<RecordId>> {
        let db = self.db.read();
        Ok(db
            .table(&table.db_table_name)?
            .rows()
            .filter(|(_, row)| {
                predicate.matches(&|field_id| {
                    table
                        .field(field_id)
                        .map(|f| logical_value(f, row))
                        .unwrap_or(Value::Null)
                })
            })
            .filter_map(|(_, row)| record_id_of(row))
            .take(limit)
            .collect())
    }

    async fn link_closure(&self, plan: &LinkClosurePlan) -> Result<Vec<(TableId, RecordId)>> {
        self.db.read().link_closure(plan)
    }

    async fn read_links(&self, link: &LinkOptions, self_ids: &[RecordId]) -> Result<Vec<LinkPair>> {
        self.db.read().read_links(link, self_ids, false)
    }

    async fn read_links_by_foreign(
        &self,
        link: &LinkOptions,
        foreign_ids: &[RecordId],
    ) -> Result<Vec<LinkPair>> {
        self.db.read().read_links(link, foreign_ids, true)
    }

    async fn delete_links(&self, link: &LinkOptions, pairs: &[LinkPair]) -> Result<()> {
        let removed = self.db.write().delete_links(link, pairs)?;
        debug!(table = %link.fk_host_table_name, removed, "link keys deleted");
        Ok(())
    }

    async fn insert_links(&self, link: &LinkOptions, pairs: &[LinkPair]) -> Result<()> {
        self.db.write().insert_links(link, pairs)?;
        debug!(table = %link.fk_host_table_name, inserted = pairs.len(), "link keys inserted");
        Ok(())
    }

    fn build_select(&self, table: &TableDomain, projection: &[FieldId]) -> Result<ComputedSelect> {
        let db = self.db.read();
        let fields = projection
            .iter()
            .map(|id| table.get_field(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(ComputedSelect {
            table_id: table.id.clone(),
            db_table_name: table.db_table_name.clone(),
            projection: projection.to_vec(),
            columns: fields.iter().map(|f| f.db_field_name.clone()).collect(),
            sql: render_select(&db, table, &fields),
            scope: SelectScope::Table,
        })
    }

    async fn update_from_select(
        &self,
        table: &TableDomain,
        select: &ComputedSelect,
    ) -> Result<Vec<UpdatedRow>> {
        self.store
            .stats
            .update_from_select_calls
            .fetch_add(1, Ordering::SeqCst);
        self.maybe_deadlock(table)?;
        let mut db = self.db.write();
        // Evaluate from the live definition so renamed columns are honored.
        let domain = db.domain(&table.id)?.clone();
        let fields = select
            .projection
            .iter()
            .map(|id| domain.get_field(id))
            .collect::<Result<Vec<_>>>()?;
        let computed = compute_rows(&db, &domain, &fields, &select.scope)?;
        let physical = db.table_mut(&domain.db_table_name)?;
        let mut out = Vec::with_capacity(computed.len());
        for (record_id, auto_number, values) in computed {
            let Some(row) = physical.row_by_id_mut(&record_id) else {
                continue;
            };
            let version = row_i64(row, VERSION_COLUMN).unwrap_or(0);
            let mut old_values = BTreeMap::new();
            let mut new_values = BTreeMap::new();
            for (field, (column, value)) in fields.iter().zip(values) {
                old_values.insert(field.id.clone(), logical_value(field, row));
                new_values.insert(field.id.clone(), field.from_db_value(&value));
                row.insert(column, value);
            }
            out.push(UpdatedRow {
                record_id,
                auto_number,
                version_before: version,
                version_after: version,
                old_values,
                new_values,
            });
        }
        Ok(out)
    }

    async fn bulk_update(
        &self,
        table: &TableDomain,
        field_ids: &[FieldId],
        rows: &[(RecordId, Vec<CellValue>)],
        actor: &str,
    ) -> Result<Vec<UpdatedRow>> {
        self.store.stats.bulk_update_calls.fetch_add(1, Ordering::SeqCst);
        let fields = field_ids
            .iter()
            .map(|id| table.get_field(id))
            .collect::<Result<Vec<_>>>()?;
        let mut db = self.db.write();
        let physical = db.table_mut(&table.db_table_name)?;
        for (record_id, values) in rows {
            for (field, value) in fields.iter().zip(values) {
                check_constraints(physical, field, record_id, value)?;
            }
        }
        let now = Utc::now().to_rfc3339();
        let mut out = Vec::with_capacity(rows.len());
        for (record_id, values) in rows {
            let row = physical.row_by_id_mut(record_id).ok_or_else(|| {
                StorageError::other(format!("row {record_id} vanished from \"{}\"", table.db_table_name))
            })?;
            let version = row_i64(row, VERSION_COLUMN).unwrap_or(0);
            let mut old_values = BTreeMap::new();
            let mut new_values = BTreeMap::new();
            for (field, value) in fields.iter().zip(values) {
                old_values.insert(field.id.clone(), logical_value(field, row));
                row.insert(field.db_field_name.clone(), field.to_db_value(value));
                new_values.insert(field.id.clone(), value.clone());
            }
            row.insert(VERSION_COLUMN.to_string(), Value::from(version + 1));
            row.insert(LAST_MODIFIED_TIME_COLUMN.to_string(), Value::String(now.clone()));
            row.insert(LAST_MODIFIED_BY_COLUMN.to_string(), Value::String(actor.to_string()));
            out.push(UpdatedRow {
                record_id: record_id.clone(),
                auto_number: row_i64(row, AUTO_NUMBER_COLUMN).unwrap_or(0),
                version_before: version,
                version_after: version + 1,
                old_values,
                new_values,
            });
        }
        Ok(out)
    }

    async fn write_cells(
        &self,
        table: &TableDomain,
        cells: &[(RecordId, FieldId, CellValue)],
    ) -> Result<Vec<UpdatedRow>> {
        let mut db = self.db.write();
        let physical = db.table_mut(&table.db_table_name)?;
        let mut by_record: BTreeMap<&str, UpdatedRow> = BTreeMap::new();
        for (record_id, field_id, value) in cells {
            let field = table.get_field(field_id)?;
            let row = physical.row_by_id_mut(record_id).ok_or_else(|| {
                StorageError::other(format!("row {record_id} missing from \"{}\"", table.db_table_name))
            })?;
            let version = row_i64(row, VERSION_COLUMN).unwrap_or(0);
            let entry = by_record.entry(record_id.as_str()).or_insert_with(|| UpdatedRow {
                record_id: record_id.clone(),
                auto_number: row_i64(row, AUTO_NUMBER_COLUMN).unwrap_or(0),
                version_before: version,
                version_after: version,
                old_values: BTreeMap::new(),
                new_values: BTreeMap::new(),
            });
            entry
                .old_values
                .entry(field_id.clone())
                .or_insert_with(|| logical_value(field, row));
            entry.new_values.insert(field_id.clone(), value.clone());
            row.insert(field.db_field_name.clone(), field.to_db_value(value));
        }
        Ok(by_record.into_values().collect())
    }

    async fn lock_records(&self, table: &TableDomain, record_ids: &[RecordId]) -> Result<()> {
        let db = self.db.read();
        let physical = db.table(&table.db_table_name)?;
        let present: Vec<RecordId> = record_ids
            .iter()
            .filter(|id| physical.contains_id(id))
            .cloned()
            .collect();
        info!(table = %table.db_table_name, count = present.len(), "row locks acquired");
        self.store
            .stats
            .lock_log
            .lock()
            .push((table.db_table_name.clone(), present));
        Ok(())
    }

    fn supports_row_locks(&self) -> bool {
        self.store.row_locks.load(Ordering::SeqCst)
    }
}
