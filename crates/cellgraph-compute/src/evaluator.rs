//! Evaluator: recomputes impacted fields layer by layer and queues set-cell ops.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use cellgraph_core::{
    CellChangeContext, CellGraphError, ComputedSelect, FieldId, ImpactGroup, ImpactMap, RawOp, RecordId,
    ReferenceEdge, Result, StorageContext, TableDomain, TableId, UpdatedRow,
};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::context::ComputeContext;

/// Cells edited directly by the user in this pass.
///
/// Edited fields already carry the base edit, so no computed op is emitted
/// for them. Audit fields are republished on edited records even when their
/// value did not move.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectCauses {
    fields: BTreeMap<TableId, BTreeSet<FieldId>>,
    records: BTreeMap<TableId, BTreeSet<RecordId>>,
}

impl DirectCauses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_changes<'c>(changes: impl IntoIterator<Item = &'c CellChangeContext>) -> Self {
        let mut direct = Self::new();
        for change in changes {
            direct.add(change);
        }
        direct
    }

    pub fn add(&mut self, change: &CellChangeContext) {
        self.fields
            .entry(change.table_id.clone())
            .or_default()
            .insert(change.field_id.clone());
        self.records
            .entry(change.table_id.clone())
            .or_default()
            .insert(change.record_id.clone());
    }

    pub fn is_direct_field(&self, table_id: &str, field_id: &str) -> bool {
        self.fields.get(table_id).is_some_and(|ids| ids.contains(field_id))
    }

    pub fn is_edited(&self, table_id: &str, record_id: &str) -> bool {
        self.records.get(table_id).is_some_and(|ids| ids.contains(record_id))
    }

    pub fn edited_records(&self) -> &BTreeMap<TableId, BTreeSet<RecordId>> {
        &self.records
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub layers: usize,
    pub windows: usize,
    pub rows: usize,
    /// Raw ops queued, one per touched record.
    pub op_count: usize,
}

/// Longest-path layering of `field_ids` over `edges`.
///
/// Fields inside a layer keep the order of `field_ids`. A cycle collapses
/// everything into a single layer.
pub fn layer_fields(field_ids: &[FieldId], edges: &[ReferenceEdge]) -> Vec<Vec<FieldId>> {
    if field_ids.is_empty() {
        return Vec::new();
    }
    let position: HashMap<&str, usize> = field_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let mut indegree = vec![0usize; field_ids.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); field_ids.len()];
    for edge in edges {
        let (Some(&from), Some(&to)) = (
            position.get(edge.from_field_id.as_str()),
            position.get(edge.to_field_id.as_str()),
        ) else {
            continue;
        };
        if from == to || successors[from].contains(&to) {
            continue;
        }
        successors[from].push(to);
        indegree[to] += 1;
    }

    let mut level = vec![0usize; field_ids.len()];
    let mut ready: Vec<usize> = (0..field_ids.len()).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(node) = ready.pop() {
        visited += 1;
        for &next in &successors[node] {
            level[next] = level[next].max(level[node] + 1);
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(next);
            }
        }
    }
    if visited < field_ids.len() {
        warn!(fields = field_ids.len(), "reference cycle among impacted fields; evaluating as one layer");
        return vec![field_ids.to_vec()];
    }

    let depth = level.iter().copied().max().unwrap_or(0);
    let mut layers = vec![Vec::new(); depth + 1];
    for (i, id) in field_ids.iter().enumerate() {
        layers[level[i]].push(id.clone());
    }
    layers
}

pub struct ComputedEvaluator<'a> {
    ctx: &'a ComputeContext,
}

impl<'a> ComputedEvaluator<'a> {
    pub fn new(ctx: &'a ComputeContext) -> Self {
        Self { ctx }
    }

    pub async fn evaluate(&self, impact: &ImpactMap, direct: &DirectCauses) -> Result<EvaluationReport> {
        let mut report = EvaluationReport::default();

        let mut domains: BTreeMap<TableId, Arc<TableDomain>> = BTreeMap::new();
        let mut owner: HashMap<FieldId, TableId> = HashMap::new();
        let mut field_ids: Vec<FieldId> = Vec::new();
        for (table_id, group) in impact.groups() {
            let domain = match self.ctx.table(table_id).await {
                Ok(domain) => domain,
                Err(err) if err.is_not_found() => {
                    debug!(table = %table_id, "impacted table no longer exists");
                    continue;
                }
                Err(err) => return Err(err),
            };
            for field_id in group.field_ids() {
                if domain.field(field_id).is_some_and(|f| f.is_derived()) {
                    owner.insert(field_id.clone(), table_id.clone());
                    field_ids.push(field_id.clone());
                }
            }
            domains.insert(table_id.clone(), domain);
        }
        if field_ids.is_empty() {
            return Ok(report);
        }

        let edges = self.ctx.metadata().reference_edges_among(&field_ids).await?;
        let layers = layer_fields(&field_ids, &edges);
        report.layers = layers.len();

        let mut pending: BTreeMap<(TableId, RecordId), RawOp> = BTreeMap::new();
        for (depth, layer) in layers.iter().enumerate() {
            let mut per_table: BTreeMap<&str, Vec<FieldId>> = BTreeMap::new();
            for field_id in layer {
                if let Some(table_id) = owner.get(field_id) {
                    per_table.entry(table_id.as_str()).or_default().push(field_id.clone());
                }
            }
            let mut tables: Vec<(&Arc<TableDomain>, Vec<FieldId>)> = per_table
                .into_iter()
                .filter_map(|(table_id, fields)| domains.get(table_id).map(|d| (d, fields)))
                .collect();
            tables.sort_by(|a, b| a.0.db_table_name.cmp(&b.0.db_table_name));

            for (domain, fields) in tables {
                let Some(group) = impact.group(&domain.id) else {
                    continue;
                };
                debug!(layer = depth, table = %domain.db_table_name, fields = fields.len(), "evaluating layer");
                let (rows, windows) = self.evaluate_table(domain, group, &fields).await?;
                report.windows += windows;
                report.rows += rows.len();

                for row in rows {
                    let edited = direct.is_edited(&domain.id, &row.record_id);
                    for field_id in &fields {
                        if direct.is_direct_field(&domain.id, field_id) {
                            continue;
                        }
                        let Some(field) = domain.field(field_id) else {
                            continue;
                        };
                        let old = row.old_values.get(field_id).cloned().unwrap_or_default();
                        let new = row.new_values.get(field_id).cloned().unwrap_or_default();
                        if old == new && !(edited && field.is_audit()) {
                            continue;
                        }
                        pending
                            .entry((domain.id.clone(), row.record_id.clone()))
                            .or_insert_with(|| RawOp::new(&domain.id, row.record_id.clone(), row.version_before))
                            .push(field_id.clone(), old, new);
                    }
                }
            }
        }

        report.op_count = pending.len();
        self.ctx.ops().extend(pending.into_values());
        self.ctx.record_computed_ops(report.op_count);
        counter!("cellgraph_computed_ops_total").increment(report.op_count as u64);
        info!(
            layers = report.layers,
            windows = report.windows,
            rows = report.rows,
            ops = report.op_count,
            "computed fields evaluated"
        );
        Ok(report)
    }

    /// Runs the recomputation for one table, batched by id or paged by cursor.
    async fn evaluate_table(
        &self,
        domain: &TableDomain,
        group: &ImpactGroup,
        fields: &[FieldId],
    ) -> Result<(Vec<UpdatedRow>, usize)> {
        let page_size = self.ctx.config().page_size;
        let select = self.ctx.store().build_select(domain, fields)?;

        let restrict_to = match group.records().ids() {
            Some(ids) if !group.prefer_all() && ids.len() <= page_size => {
                if ids.is_empty() {
                    return Ok((Vec::new(), 0));
                }
                let batch = select.with_record_ids(ids.iter().cloned().collect());
                let rows = self.update_with_retry(domain, &batch).await?;
                return Ok((rows, 1));
            }
            Some(ids) => Some(Arc::new(ids.clone())),
            None => None,
        };

        let mut rows = Vec::new();
        let mut windows = 0;
        let mut after = None;
        loop {
            let window = select.clone().with_cursor(after, page_size, restrict_to.clone());
            let page = self.update_with_retry(domain, &window).await?;
            windows += 1;
            let len = page.len();
            debug!(table = %domain.db_table_name, window = windows, ?after, rows = len, "paged update window");
            if let Some(last) = page.last() {
                after = Some(last.auto_number);
            }
            rows.extend(page);
            if len < page_size {
                break;
            }
        }
        Ok((rows, windows))
    }

    async fn update_with_retry(&self, domain: &TableDomain, select: &ComputedSelect) -> Result<Vec<UpdatedRow>> {
        let config = self.ctx.config();
        let mut attempt: u32 = 0;
        loop {
            match self.ctx.store().update_from_select(domain, select).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_deadlock() && attempt < config.deadlock_max_retries => {
                    attempt += 1;
                    counter!("cellgraph_deadlock_retries_total").increment(1);
                    warn!(table = %domain.db_table_name, attempt, "deadlock during computed update; retrying");
                    let backoff = config.deadlock_backoff_ms.saturating_mul(u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(CellGraphError::Storage(err)) => {
                    return Err(CellGraphError::Storage(err.with_context(StorageContext {
                        sql: Some(select.update_sql()),
                        table: Some(domain.db_table_name.clone()),
                        fields: select.columns.clone(),
                    })));
                }
                Err(err) => return Err(err),
            }
        }
    }
}
