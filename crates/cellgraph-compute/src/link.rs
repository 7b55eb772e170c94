//! Link service: turns link cell edits into foreign-key state.
//!
//! Work is split in two phases. [`LinkService::plan_link_derivation`] reads
//! the before-state and validates everything without writing;
//! [`LinkService::commit_link_derivation`] applies the planned key writes,
//! normalizes the edited cells and mirrors symmetric counterparts.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cellgraph_core::{
    cell_title, CellChangeContext, CellGraphError, FieldId, FkKey, FkRecordItem, LinkOptions,
    LinkPair, RecordId, RecordRow, RecordUpdate, Result, TableId,
};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::batch::BatchService;
use crate::cardinality::{handler, CardinalityHandler};
use crate::context::ComputeContext;

/// A symmetric link cell on a foreign record touched by the edit.
#[derive(Debug, Clone, PartialEq)]
pub struct MirroredCell {
    pub table_id: TableId,
    pub record_id: RecordId,
    pub field_id: FieldId,
    pub old_value: Value,
}

#[derive(Debug, Clone, PartialEq)]
struct FieldWrite {
    link: LinkOptions,
    deletes: Vec<LinkPair>,
    inserts: Vec<LinkPair>,
}

/// Validated key writes for one batch of link edits on one table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkDerivationPlan {
    pub table_id: TableId,
    pub items: Vec<FkRecordItem>,
    /// Edited cells with titles filled in.
    pub host_cells: Vec<(RecordId, FieldId, Value)>,
    pub mirrored: Vec<MirroredCell>,
    writes: BTreeMap<FieldId, FieldWrite>,
}

impl LinkDerivationPlan {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pending_deletes(&self) -> usize {
        self.writes.values().map(|w| w.deletes.len()).sum()
    }

    pub fn pending_inserts(&self) -> usize {
        self.writes.values().map(|w| w.inserts.len()).sum()
    }

    /// `updates` with every planned link cell replaced by its titled value, so
    /// the base write and its op carry what ends up stored.
    pub fn normalize_updates(&self, updates: &[RecordUpdate]) -> Vec<RecordUpdate> {
        let cells: HashMap<(&str, &str), &Value> = self
            .host_cells
            .iter()
            .map(|(record_id, field_id, value)| ((record_id.as_str(), field_id.as_str()), value))
            .collect();
        updates
            .iter()
            .cloned()
            .map(|mut update| {
                for (field_id, value) in update.fields.iter_mut() {
                    if let Some(titled) = cells.get(&(update.record_id.as_str(), field_id.as_str())) {
                        *value = (*titled).clone();
                    }
                }
                update
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkCommitReport {
    pub fk_deleted: usize,
    pub fk_inserted: usize,
    /// Symmetric cells rewritten on foreign records, with before and after values.
    pub mirrored_changes: Vec<CellChangeContext>,
    pub op_count: usize,
}

fn title_of(row: &RecordRow, lookup_field_id: &str) -> String {
    let value = row.value(lookup_field_id);
    if value.is_null() {
        row.id.clone()
    } else {
        cell_title(value)
    }
}

fn link_cell(multi: bool, ids: &[RecordId], titles: &HashMap<RecordId, String>) -> Value {
    let items: Vec<Value> = ids
        .iter()
        .map(|id| {
            let title = titles.get(id).cloned().unwrap_or_else(|| id.clone());
            json!({ "id": id, "title": title })
        })
        .collect();
    if multi {
        if items.is_empty() {
            Value::Null
        } else {
            Value::Array(items)
        }
    } else {
        items.into_iter().next().unwrap_or(Value::Null)
    }
}

fn fk_key(cardinality: &dyn CardinalityHandler, ids: Vec<RecordId>) -> FkKey {
    if cardinality.is_multi_valued() {
        return FkKey::Many(ids);
    }
    match ids.into_iter().next() {
        Some(id) => FkKey::One(id),
        None => FkKey::None,
    }
}

pub struct LinkService<'a> {
    ctx: &'a ComputeContext,
}

impl<'a> LinkService<'a> {
    pub fn new(ctx: &'a ComputeContext) -> Self {
        Self { ctx }
    }

    /// Validates link edits on `table_id` and plans the key writes.
    ///
    /// Non-link changes are ignored. Nothing is written.
    pub async fn plan_link_derivation(
        &self,
        table_id: &str,
        changes: &[CellChangeContext],
    ) -> Result<LinkDerivationPlan> {
        let table = self.ctx.table(table_id).await?;
        let mut plan = LinkDerivationPlan {
            table_id: table_id.to_string(),
            ..Default::default()
        };

        // Last edit of a cell wins.
        let mut requested: BTreeMap<FieldId, BTreeMap<RecordId, Vec<RecordId>>> = BTreeMap::new();
        for change in changes.iter().filter(|c| c.table_id == table_id) {
            let field = table.get_field(&change.field_id)?;
            let Some(link) = field.link_options() else {
                continue;
            };
            let key = handler(link.relationship).keys_from_cell(&field.id, &change.new_or_null())?;
            requested
                .entry(field.id.clone())
                .or_default()
                .insert(change.record_id.clone(), key.ids());
        }

        for (field_id, records) in &requested {
            let field = table.get_field(field_id)?;
            let Some(link) = field.link_options() else {
                continue;
            };
            let cardinality = handler(link.relationship);
            let foreign = self.ctx.table(&link.foreign_table_id).await?;
            let host_ids: Vec<RecordId> = records.keys().cloned().collect();

            let mut old: BTreeMap<RecordId, Vec<LinkPair>> = BTreeMap::new();
            for pair in self.ctx.store().read_links(link, &host_ids).await? {
                old.entry(pair.self_id.clone()).or_default().push(pair);
            }

            let wanted: Vec<RecordId> = records
                .values()
                .flatten()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let titles: HashMap<RecordId, String> = self
                .ctx
                .store()
                .get_records(&foreign, &wanted)
                .await?
                .iter()
                .map(|row| (row.id.clone(), title_of(row, &link.lookup_field_id)))
                .collect();
            if let Some(missing) = wanted.iter().find(|id| !titles.contains_key(*id)) {
                return Err(CellGraphError::Consistency(format!(
                    "{field_id} would link to {missing}, which does not exist in {}",
                    foreign.id
                )));
            }
            if cardinality.claims_exclusive() {
                self.check_claims(link, field_id, records).await?;
            }

            let ordered = link.order_column_name.is_some();
            let mut write = FieldWrite {
                link: link.clone(),
                deletes: Vec::new(),
                inserts: Vec::new(),
            };
            let mut touched_foreign: BTreeSet<RecordId> = BTreeSet::new();
            for (record_id, new_ids) in records {
                let old_pairs = old.get(record_id).map(Vec::as_slice).unwrap_or(&[]);
                let old_ids: Vec<RecordId> = old_pairs.iter().map(|p| p.foreign_id.clone()).collect();
                let diff = cardinality.diff(&old_ids, new_ids);

                plan.host_cells.push((
                    record_id.clone(),
                    field_id.clone(),
                    link_cell(cardinality.is_multi_valued(), new_ids, &titles),
                ));
                plan.items.push(FkRecordItem {
                    field_id: field_id.clone(),
                    record_id: record_id.clone(),
                    old_key: fk_key(cardinality, old_ids),
                    new_key: fk_key(cardinality, new_ids.clone()),
                });
                if diff.is_empty() {
                    continue;
                }

                if diff.reorder {
                    write.deletes.extend(old_pairs.iter().cloned());
                    write.inserts.extend(new_ids.iter().enumerate().map(|(i, id)| {
                        LinkPair::new(record_id.clone(), id.clone(), ordered.then_some(i as i64 + 1))
                    }));
                } else {
                    write.deletes.extend(
                        old_pairs
                            .iter()
                            .filter(|p| diff.removed.contains(&p.foreign_id))
                            .cloned(),
                    );
                    let current_max = old_pairs
                        .iter()
                        .filter(|p| !diff.removed.contains(&p.foreign_id))
                        .filter_map(|p| p.order)
                        .max()
                        .unwrap_or(0);
                    write.inserts.extend(diff.added.iter().enumerate().map(|(i, id)| {
                        LinkPair::new(
                            record_id.clone(),
                            id.clone(),
                            ordered.then_some(current_max + i as i64 + 1),
                        )
                    }));
                }
                touched_foreign.extend(diff.removed.iter().cloned());
                touched_foreign.extend(diff.added.iter().cloned());
            }

            if let Some(symmetric_id) = &link.symmetric_field_id {
                if !touched_foreign.is_empty() {
                    let ids: Vec<RecordId> = touched_foreign.into_iter().collect();
                    for row in self.ctx.store().get_records(&foreign, &ids).await? {
                        plan.mirrored.push(MirroredCell {
                            table_id: foreign.id.clone(),
                            record_id: row.id.clone(),
                            field_id: symmetric_id.clone(),
                            old_value: row.value(symmetric_id).clone(),
                        });
                    }
                }
            }
            plan.writes.insert(field_id.clone(), write);
        }

        debug!(
            table = %table_id,
            items = plan.items.len(),
            deletes = plan.pending_deletes(),
            inserts = plan.pending_inserts(),
            mirrored = plan.mirrored.len(),
            "link derivation planned"
        );
        Ok(plan)
    }

    /// Rejects foreign records claimed by two hosts, in this batch or against
    /// stored keys. Links released by the same batch do not count.
    async fn check_claims(
        &self,
        link: &LinkOptions,
        field_id: &str,
        records: &BTreeMap<RecordId, Vec<RecordId>>,
    ) -> Result<()> {
        let mut claimant: BTreeMap<&RecordId, &RecordId> = BTreeMap::new();
        for (host, ids) in records {
            for id in ids {
                if let Some(previous) = claimant.insert(id, host) {
                    if previous != host {
                        return Err(CellGraphError::Consistency(format!(
                            "{id} is claimed by both {previous} and {host} through {field_id}"
                        )));
                    }
                }
            }
        }
        if claimant.is_empty() {
            return Ok(());
        }
        let claimed: Vec<RecordId> = claimant.keys().map(|id| (*id).clone()).collect();
        for pair in self.ctx.store().read_links_by_foreign(link, &claimed).await? {
            let Some(host) = claimant.get(&pair.foreign_id) else {
                continue;
            };
            if pair.self_id == **host {
                continue;
            }
            let released = records
                .get(&pair.self_id)
                .is_some_and(|ids| !ids.contains(&pair.foreign_id));
            if !released {
                return Err(CellGraphError::Consistency(format!(
                    "{} is already linked from {} through {field_id}",
                    pair.foreign_id, pair.self_id
                )));
            }
        }
        Ok(())
    }

    /// Applies a plan: key deletes first, then inserts, then cell writes.
    pub async fn commit_link_derivation(&self, plan: &LinkDerivationPlan) -> Result<LinkCommitReport> {
        let mut report = LinkCommitReport::default();
        if plan.is_empty() {
            return Ok(report);
        }
        let store = self.ctx.store();
        for write in plan.writes.values().filter(|w| !w.deletes.is_empty()) {
            store.delete_links(&write.link, &write.deletes).await?;
            report.fk_deleted += write.deletes.len();
        }
        for write in plan.writes.values().filter(|w| !w.inserts.is_empty()) {
            store.insert_links(&write.link, &write.inserts).await?;
            report.fk_inserted += write.inserts.len();
        }
        counter!("cellgraph_link_fk_writes_total").increment((report.fk_deleted + report.fk_inserted) as u64);

        let table = self.ctx.table(&plan.table_id).await?;
        store.write_cells(&table, &plan.host_cells).await?;

        let mut by_field: BTreeMap<(&str, &str), Vec<&MirroredCell>> = BTreeMap::new();
        for cell in &plan.mirrored {
            by_field
                .entry((cell.table_id.as_str(), cell.field_id.as_str()))
                .or_default()
                .push(cell);
        }
        let batch = BatchService::new(self.ctx);
        for ((table_id, field_id), cells) in by_field {
            let domain = self.ctx.table(table_id).await?;
            let link = domain
                .get_field(field_id)?
                .link_options()
                .cloned()
                .ok_or_else(|| CellGraphError::Consistency(format!("{field_id} is not a link field")))?;
            let record_ids: Vec<RecordId> = cells.iter().map(|c| c.record_id.clone()).collect();

            let mut current: BTreeMap<RecordId, Vec<RecordId>> = BTreeMap::new();
            for pair in store.read_links(&link, &record_ids).await? {
                current.entry(pair.self_id).or_default().push(pair.foreign_id);
            }
            let title_ids: Vec<RecordId> = current
                .values()
                .flatten()
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let host = self.ctx.table(&link.foreign_table_id).await?;
            let titles: HashMap<RecordId, String> = store
                .get_records(&host, &title_ids)
                .await?
                .iter()
                .map(|row| (row.id.clone(), title_of(row, &link.lookup_field_id)))
                .collect();

            let multi = link.relationship.is_multi_valued();
            let mut writes = Vec::with_capacity(cells.len());
            for cell in cells {
                let ids = current.get(&cell.record_id).map(Vec::as_slice).unwrap_or(&[]);
                let value = link_cell(multi, ids, &titles);
                report.mirrored_changes.push(CellChangeContext::new(
                    table_id,
                    cell.record_id.clone(),
                    field_id,
                    Some(cell.old_value.clone()),
                    Some(value.clone()),
                ));
                writes.push((cell.record_id.clone(), field_id.to_string(), value));
            }
            report.op_count += batch.save_computed_cells(table_id, writes).await?;
        }

        info!(
            table = %plan.table_id,
            fk_deleted = report.fk_deleted,
            fk_inserted = report.fk_inserted,
            mirrored = report.mirrored_changes.len(),
            "link derivation committed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgraph_core::Relationship;

    #[test]
    fn link_cells_fall_back_to_ids() {
        let titles = HashMap::from([("rec1".to_string(), "Ada".to_string())]);
        let ids = vec!["rec1".to_string(), "rec2".to_string()];
        assert_eq!(
            link_cell(true, &ids, &titles),
            json!([{"id": "rec1", "title": "Ada"}, {"id": "rec2", "title": "rec2"}])
        );
        assert_eq!(link_cell(false, &ids[..1], &titles), json!({"id": "rec1", "title": "Ada"}));
        assert_eq!(link_cell(true, &[], &titles), Value::Null);
    }

    #[test]
    fn keys_take_the_cardinality_shape() {
        let single = handler(Relationship::OneOne);
        assert_eq!(fk_key(single, vec![]), FkKey::None);
        assert_eq!(fk_key(single, vec!["a".into()]), FkKey::One("a".into()));
        let multi = handler(Relationship::ManyMany);
        assert_eq!(fk_key(multi, vec![]), FkKey::Many(vec![]));
    }

    #[test]
    fn updates_take_the_titled_link_cells() {
        let plan = LinkDerivationPlan {
            table_id: "tbl_left".into(),
            host_cells: vec![(
                "l1".into(),
                "fld_links".into(),
                json!([{"id": "r1", "title": "Right r1"}]),
            )],
            ..Default::default()
        };
        let updates = [
            RecordUpdate::new("l1").set("fld_links", json!(["r1"])).set("fld_name", json!("x")),
            RecordUpdate::new("l2").set("fld_links", json!(["r2"])),
        ];
        let normalized = plan.normalize_updates(&updates);
        assert_eq!(normalized[0].fields["fld_links"], json!([{"id": "r1", "title": "Right r1"}]));
        assert_eq!(normalized[0].fields["fld_name"], json!("x"));
        assert_eq!(normalized[1], updates[1]);
    }

    #[test]
    fn titles_use_the_lookup_field() {
        let row = RecordRow {
            id: "rec1".into(),
            version: 1,
            auto_number: 1,
            values: BTreeMap::from([("fld_name".to_string(), json!({"name": "Ada"}))]),
        };
        assert_eq!(title_of(&row, "fld_name"), "Ada");
        assert_eq!(title_of(&row, "fld_missing"), "rec1");
    }
}
