//! Dependency collector: turns originating changes into an [`ImpactMap`].
//!
//! Three channels feed the map. Static reference edges decide which fields
//! are impacted; link adjacency (through the cascade resolver) decides which
//! records; conditional filters add host records whose membership may change
//! with the edited values, evaluated in a worklist until no set grows.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use cellgraph_core::{
    CellChangeContext, CellGraphError, Field, FieldId, HostPredicate, ImpactMap, RecordId,
    RecordRow, Result, TableDomain, TableId, UnsupportedFilter,
};
use futures::future::try_join_all;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cardinality::link_ids_in;
use crate::context::ComputeContext;
use crate::resolver::LinkCascadeResolver;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellChangeSource {
    pub table_id: TableId,
    pub changes: Vec<CellChangeContext>,
}

/// Field definitions created, updated or about to be deleted on one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChangeSource {
    pub table_id: TableId,
    pub field_ids: Vec<FieldId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeSource {
    Cells(CellChangeSource),
    Fields(FieldChangeSource),
}

/// Edited values per (table, record), applied when evaluating filters.
type Overlay = HashMap<(TableId, RecordId), Vec<(FieldId, Value, Value)>>;

/// Foreign table -> host table through a conditional lookup or rollup.
struct ConditionalEdge {
    foreign_table_id: TableId,
    host_table_id: TableId,
    field: Field,
}

pub struct DependencyCollector<'a> {
    ctx: &'a ComputeContext,
}

impl<'a> DependencyCollector<'a> {
    pub fn new(ctx: &'a ComputeContext) -> Self {
        Self { ctx }
    }

    pub async fn collect(&self, source: &ChangeSource) -> Result<ImpactMap> {
        match source {
            ChangeSource::Cells(cells) => self.collect_cell_changes(&cells.table_id, &cells.changes).await,
            ChangeSource::Fields(fields) => self.collect_field_changes(fields).await,
        }
    }

    /// Collects every source concurrently, then merges.
    pub async fn collect_all(&self, sources: &[ChangeSource]) -> Result<ImpactMap> {
        let maps = try_join_all(sources.iter().map(|s| self.collect(s))).await?;
        let mut merged = ImpactMap::new();
        for map in maps {
            merged.merge(map);
        }
        Ok(merged)
    }

    pub async fn collect_cell_changes(
        &self,
        table_id: &str,
        changes: &[CellChangeContext],
    ) -> Result<ImpactMap> {
        let mut map = ImpactMap::new();
        if changes.is_empty() {
            return Ok(map);
        }
        let origin = self.ctx.table(table_id).await?;
        let changed: BTreeSet<FieldId> = changes.iter().map(|c| c.field_id.clone()).collect();
        for field_id in &changed {
            origin.get_field(field_id)?;
        }

        let mut start = changed.clone();
        for field in origin.fields() {
            if !field.is_audit() {
                continue;
            }
            let tracked = field.tracked_field_ids().unwrap_or_default();
            if tracked.is_empty() || tracked.iter().any(|id| changed.contains(id)) {
                start.insert(field.id.clone());
            }
        }

        // Foreign records named by the old or new value of a symmetric link.
        let mut symmetric_seeds: BTreeMap<TableId, BTreeSet<RecordId>> = BTreeMap::new();
        for change in changes {
            let Some(link) = origin.field(&change.field_id).and_then(Field::link_options) else {
                continue;
            };
            let Some(symmetric) = &link.symmetric_field_id else {
                continue;
            };
            start.insert(symmetric.clone());
            let ids = symmetric_seeds.entry(link.foreign_table_id.clone()).or_default();
            ids.extend(link_ids_in(&change.old_or_null()));
            ids.extend(link_ids_in(&change.new_or_null()));
        }

        let impacted = self.expand_fields(start).await?;
        self.place_fields(&mut map, &impacted).await?;

        map.group_mut(table_id)
            .add_records(changes.iter().map(|c| c.record_id.clone()));
        for (foreign_table_id, ids) in symmetric_seeds {
            map.group_mut(&foreign_table_id).add_records(ids);
        }

        let mut overlay: Overlay = HashMap::new();
        for change in changes {
            overlay
                .entry((change.table_id.clone(), change.record_id.clone()))
                .or_default()
                .push((change.field_id.clone(), change.old_or_null(), change.new_or_null()));
        }

        self.propagate(&mut map, &overlay).await?;
        map.prune();
        self.report(&map, "cell changes");
        Ok(map)
    }

    pub async fn collect_field_changes(&self, source: &FieldChangeSource) -> Result<ImpactMap> {
        let mut map = ImpactMap::new();
        let table = self.ctx.table(&source.table_id).await?;
        let present: BTreeSet<FieldId> = source
            .field_ids
            .iter()
            .filter(|id| table.field(id).is_some_and(Field::is_computed_classified))
            .cloned()
            .collect();
        let dependents = self
            .ctx
            .metadata()
            .reference_edges_from(&source.field_ids)
            .await?;
        let mut start = present;
        start.extend(dependents.into_iter().map(|e| e.to_field_id));
        let impacted = self.expand_fields(start).await?;
        self.place_fields(&mut map, &impacted).await?;

        let group = map.group_mut(&source.table_id);
        group.mark_all();
        group.set_prefer_all();

        self.propagate(&mut map, &HashMap::new()).await?;
        map.prune();
        self.report(&map, "field definition change");
        Ok(map)
    }

    fn report(&self, map: &ImpactMap, origin: &str) {
        let explicit: usize = map.groups().filter_map(|(_, g)| g.record_count()).sum();
        histogram!("cellgraph_impacted_records").record(explicit as f64);
        info!(
            origin,
            tables = map.len(),
            fields = map.all_field_ids().len(),
            explicit_records = explicit,
            all_tables = map.groups().filter(|(_, g)| g.is_all()).count(),
            "impact collected"
        );
    }

    /// Transitive dependents of `start`, plus lookups hanging off impacted
    /// link fields that the reference graph does not know about.
    async fn expand_fields(&self, start: BTreeSet<FieldId>) -> Result<BTreeSet<FieldId>> {
        let mut impacted = start;
        let mut frontier: Vec<FieldId> = impacted.iter().cloned().collect();
        let mut scanned_links: BTreeSet<FieldId> = BTreeSet::new();
        while !frontier.is_empty() {
            let edges = self.ctx.metadata().reference_edges_from(&frontier).await?;
            impacted.extend(edges.into_iter().map(|e| e.to_field_id));

            let owners = self
                .ctx
                .metadata()
                .table_ids_by_field_ids(&impacted.iter().cloned().collect::<Vec<_>>())
                .await?;
            let owner_tables: Vec<TableId> = owners.values().cloned().collect::<BTreeSet<_>>().into_iter().collect();
            let domains = self.ctx.tables(&owner_tables).await?;
            let mut link_ids: BTreeSet<FieldId> = BTreeSet::new();
            for domain in &domains {
                for field in domain.link_fields() {
                    if impacted.contains(&field.id) && !scanned_links.contains(&field.id) {
                        link_ids.insert(field.id.clone());
                    }
                }
            }
            frontier = Vec::new();
            for domain in &domains {
                for field in domain.fields() {
                    let Some(link_field_id) = field.lookup_options().and_then(|l| l.link_field_id.as_ref()) else {
                        continue;
                    };
                    if link_ids.contains(link_field_id) && impacted.insert(field.id.clone()) {
                        debug!(lookup = %field.id, link = %link_field_id, "back-filled lookup missing from reference graph");
                        frontier.push(field.id.clone());
                    }
                }
            }
            scanned_links.extend(link_ids);
        }
        Ok(impacted)
    }

    async fn place_fields(&self, map: &mut ImpactMap, fields: &BTreeSet<FieldId>) -> Result<()> {
        let ids: Vec<FieldId> = fields.iter().cloned().collect();
        let owners = self.ctx.metadata().table_ids_by_field_ids(&ids).await?;
        for field_id in ids {
            let table_id = owners
                .get(&field_id)
                .ok_or_else(|| CellGraphError::NotFound(format!("field {field_id}")))?;
            map.group_mut(table_id).add_fields([field_id]);
        }
        Ok(())
    }

    /// Link closure plus the conditional-filter worklist, to a fixpoint.
    async fn propagate(&self, map: &mut ImpactMap, overlay: &Overlay) -> Result<()> {
        self.close(map).await?;
        let edges = self.conditional_edges(map).await?;
        if edges.is_empty() {
            return Ok(());
        }

        let mut queue: VecDeque<TableId> = VecDeque::new();
        let mut queued: BTreeSet<TableId> = BTreeSet::new();
        for (table_id, group) in map.groups() {
            if group.is_all() || !group.records().is_empty() {
                queue.push_back(table_id.clone());
                queued.insert(table_id.clone());
            }
        }
        let mut processed: HashMap<TableId, BTreeSet<RecordId>> = HashMap::new();
        let mut processed_all: BTreeSet<TableId> = BTreeSet::new();
        let mut rounds = 0usize;

        while let Some(table_id) = queue.pop_front() {
            queued.remove(&table_id);
            let outgoing: Vec<&ConditionalEdge> = edges
                .iter()
                .filter(|e| e.foreign_table_id == table_id)
                .collect();
            if outgoing.is_empty() {
                continue;
            }
            let Some(group) = map.group(&table_id) else {
                continue;
            };
            rounds += 1;
            let mut grown: BTreeSet<TableId> = BTreeSet::new();

            if group.is_all() {
                if !processed_all.insert(table_id.clone()) {
                    continue;
                }
                for edge in outgoing {
                    if map.group_mut(&edge.host_table_id).mark_all() {
                        grown.insert(edge.host_table_id.clone());
                    }
                }
            } else {
                let done = processed.entry(table_id.clone()).or_default();
                let batch: Vec<RecordId> = group
                    .records()
                    .ids()
                    .map(|ids| ids.difference(done).cloned().collect())
                    .unwrap_or_default();
                if batch.is_empty() {
                    continue;
                }
                done.extend(batch.iter().cloned());
                let foreign = self.ctx.table(&table_id).await?;
                let rows = self.ctx.store().get_records(&foreign, &batch).await?;
                let states = overlay_states(&table_id, &rows, overlay);
                for edge in outgoing {
                    if self.apply_edge(map, edge, &foreign, &states).await? {
                        grown.insert(edge.host_table_id.clone());
                    }
                }
            }

            if grown.is_empty() {
                continue;
            }
            grown.extend(self.close(map).await?);
            for table in grown {
                if queued.insert(table.clone()) {
                    queue.push_back(table);
                }
            }
        }
        debug!(rounds, "conditional worklist drained");
        Ok(())
    }

    /// Runs the link closure over the map, returning tables whose record set grew.
    async fn close(&self, map: &mut ImpactMap) -> Result<BTreeSet<TableId>> {
        let domains = self.ctx.tables(&map.table_ids()).await?;
        let mut seeds: BTreeMap<TableId, BTreeSet<RecordId>> = BTreeMap::new();
        let mut all_tables: BTreeSet<TableId> = BTreeSet::new();
        for (table_id, group) in map.groups() {
            match group.records().ids() {
                None => {
                    all_tables.insert(table_id.clone());
                }
                Some(ids) if !ids.is_empty() => {
                    seeds.insert(table_id.clone(), ids.clone());
                }
                Some(_) => {}
            }
        }
        let mut grown = BTreeSet::new();
        if seeds.is_empty() && all_tables.is_empty() {
            return Ok(grown);
        }
        let resolver = LinkCascadeResolver::new(self.ctx);
        let plan = resolver.plan(&domains, seeds, all_tables);
        if plan.is_trivial() {
            return Ok(grown);
        }
        for (table_id, ids) in resolver.resolve(&plan).await? {
            if map.group_mut(&table_id).add_records(ids) {
                grown.insert(table_id);
            }
        }
        Ok(grown)
    }

    async fn conditional_edges(&self, map: &ImpactMap) -> Result<Vec<ConditionalEdge>> {
        let mut edges = Vec::new();
        for (table_id, group) in map.groups() {
            let domain = self.ctx.table(table_id).await?;
            for field_id in group.field_ids() {
                let Some(field) = domain.field(field_id) else {
                    continue;
                };
                if !field.is_conditional() {
                    continue;
                }
                let Some(lookup) = field.lookup_options() else {
                    warn!(field = %field.id, "conditional field without lookup options skipped");
                    continue;
                };
                edges.push(ConditionalEdge {
                    foreign_table_id: lookup.foreign_table_id.clone(),
                    host_table_id: table_id.clone(),
                    field: field.clone(),
                });
            }
        }
        Ok(edges)
    }

    /// Adds host records whose filter membership may differ between the old
    /// and new state of `states`. Returns true when the host set grew.
    async fn apply_edge(
        &self,
        map: &mut ImpactMap,
        edge: &ConditionalEdge,
        foreign: &TableDomain,
        states: &[BTreeMap<FieldId, Value>],
    ) -> Result<bool> {
        let host_id = &edge.host_table_id;
        if map.group(host_id).is_some_and(|g| g.is_all()) {
            return Ok(false);
        }
        let Some(filter) = edge.field.lookup_options().and_then(|l| l.filter.as_ref()) else {
            return Ok(map.group_mut(host_id).mark_all());
        };

        let recomputed: Vec<&FieldId> = map
            .group(&edge.foreign_table_id)
            .map(|g| {
                g.field_ids()
                    .iter()
                    .filter(|id| foreign.field(id).is_some_and(Field::is_derived))
                    .collect()
            })
            .unwrap_or_default();
        let filter_fields = filter.foreign_field_ids();
        if recomputed.iter().any(|id| filter_fields.contains(*id)) {
            debug!(field = %edge.field.id, "filter reads a field recomputed in this pass");
            return Ok(map.group_mut(host_id).mark_all());
        }

        let threshold = self.ctx.config().materialization_threshold;
        let host = self.ctx.table(host_id).await?;

        if !filter.has_host_references() {
            let any_match = states.iter().any(|state| {
                filter.matches(&|id| state.get(id).cloned().unwrap_or(Value::Null), &|_| Value::Null)
            });
            if !any_match {
                return Ok(false);
            }
            return self.add_all_host_records(map, &host, threshold).await;
        }

        let mut parts = Vec::with_capacity(states.len());
        for state in states {
            match filter.bind_foreign(&|id| state.get(id).cloned().unwrap_or(Value::Null)) {
                Ok(predicate) => parts.push(predicate),
                Err(UnsupportedFilter(reason)) => {
                    debug!(field = %edge.field.id, %reason, "filter cannot be bound; widening to ALL");
                    return Ok(map.group_mut(host_id).mark_all());
                }
            }
        }
        let predicate = HostPredicate::Or(parts).simplify();
        match predicate.as_const() {
            Some(false) => Ok(false),
            Some(true) => self.add_all_host_records(map, &host, threshold).await,
            None => {
                let ids = self
                    .ctx
                    .store()
                    .select_record_ids(&host, &predicate, threshold.saturating_add(1))
                    .await?;
                if ids.len() > threshold {
                    Ok(map.group_mut(host_id).mark_all())
                } else {
                    Ok(map.group_mut(host_id).add_records(ids))
                }
            }
        }
    }

    async fn add_all_host_records(
        &self,
        map: &mut ImpactMap,
        host: &Arc<TableDomain>,
        threshold: usize,
    ) -> Result<bool> {
        let count = self.ctx.store().count_records(host).await?;
        if count > threshold {
            return Ok(map.group_mut(&host.id).mark_all());
        }
        let ids = self.ctx.store().list_record_ids(host, None).await?;
        Ok(map.group_mut(&host.id).add_records(ids))
    }
}

/// Each row twice: with the edits' old values and with their new values.
fn overlay_states(
    table_id: &str,
    rows: &[RecordRow],
    overlay: &Overlay,
) -> Vec<BTreeMap<FieldId, Value>> {
    let mut states = Vec::with_capacity(rows.len() * 2);
    for row in rows {
        let edits = overlay.get(&(table_id.to_string(), row.id.clone()));
        let mut old = row.values.clone();
        let mut new = row.values.clone();
        for (field_id, before, after) in edits.into_iter().flatten() {
            old.insert(field_id.clone(), before.clone());
            new.insert(field_id.clone(), after.clone());
        }
        states.push(old);
        if edits.is_some() {
            states.push(new);
        }
    }
    states
}
