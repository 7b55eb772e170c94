//! Orchestrator: collect, lock, run the base update, evaluate.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use cellgraph_core::{
    CellChangeContext, ImpactMap, ImpactSummary, RecordId, RecordUpdate, Result, TableId,
    UpdatedRow,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::BatchService;
use crate::collector::{CellChangeSource, ChangeSource, DependencyCollector, FieldChangeSource};
use crate::context::ComputeContext;
use crate::evaluator::{ComputedEvaluator, DirectCauses};
use crate::link::LinkService;

/// When impact is collected relative to a field definition change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldChangePhase {
    /// Collect first, while the doomed fields and their edges still exist.
    BeforeDelete,
    /// Collect after the callback so new fields can be found.
    AfterCreate,
    /// Collect on both sides of the callback and merge.
    Update,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeOutcome {
    pub published_op_count: usize,
    pub impact: ImpactSummary,
}

pub struct ComputeOrchestrator<'a> {
    ctx: &'a ComputeContext,
}

impl<'a> ComputeOrchestrator<'a> {
    pub fn new(ctx: &'a ComputeContext) -> Self {
        Self { ctx }
    }

    pub async fn compute_cell_changes<T, F>(
        &self,
        table_id: &str,
        changes: &[CellChangeContext],
        base_update: F,
    ) -> Result<(T, ComputeOutcome)>
    where
        F: Future<Output = Result<T>>,
    {
        let source = CellChangeSource {
            table_id: table_id.to_string(),
            changes: changes.to_vec(),
        };
        self.compute_cell_changes_multi(&[source], base_update).await
    }

    /// Several change sources in one pass. Collection runs concurrently; the
    /// merged impact is locked and evaluated once.
    pub async fn compute_cell_changes_multi<T, F>(
        &self,
        sources: &[CellChangeSource],
        base_update: F,
    ) -> Result<(T, ComputeOutcome)>
    where
        F: Future<Output = Result<T>>,
    {
        let start = self.ctx.computed_op_count();
        let collector = DependencyCollector::new(self.ctx);
        let wrapped: Vec<ChangeSource> = sources.iter().cloned().map(ChangeSource::Cells).collect();
        let impact = collector.collect_all(&wrapped).await?;

        let direct = DirectCauses::from_changes(sources.iter().flat_map(|s| s.changes.iter()));
        self.lock_impacted(&impact, direct.edited_records()).await?;

        let value = base_update.await?;
        ComputedEvaluator::new(self.ctx).evaluate(&impact, &direct).await?;
        Ok((value, self.outcome(start, &impact)))
    }

    pub async fn compute_field_definition_change<T, F>(
        &self,
        sources: &[FieldChangeSource],
        phase: FieldChangePhase,
        base_update: F,
    ) -> Result<(T, ComputeOutcome)>
    where
        F: Future<Output = Result<T>>,
    {
        let start = self.ctx.computed_op_count();
        let wrapped: Vec<ChangeSource> = sources.iter().cloned().map(ChangeSource::Fields).collect();

        let (value, impact) = match phase {
            FieldChangePhase::BeforeDelete => {
                let impact = self.collect_fields(&wrapped).await?;
                let value = base_update.await?;
                self.ctx.invalidate();
                (value, impact)
            }
            FieldChangePhase::AfterCreate => {
                let value = base_update.await?;
                self.ctx.invalidate();
                (value, self.collect_fields(&wrapped).await?)
            }
            FieldChangePhase::Update => {
                let mut impact = self.collect_fields(&wrapped).await?;
                let value = base_update.await?;
                self.ctx.invalidate();
                impact.merge(self.collect_fields(&wrapped).await?);
                (value, impact)
            }
        };
        debug!(?phase, tables = impact.len(), "field definition impact collected");

        self.lock_impacted(&impact, &BTreeMap::new()).await?;
        ComputedEvaluator::new(self.ctx)
            .evaluate(&impact, &DirectCauses::new())
            .await?;
        Ok((value, self.outcome(start, &impact)))
    }

    /// Base update plus link maintenance for `updates`, followed by a compute pass.
    pub async fn update_records(
        &self,
        table_id: &str,
        updates: &[RecordUpdate],
    ) -> Result<(Vec<UpdatedRow>, ComputeOutcome)> {
        let table = self.ctx.table(table_id).await?;
        let batch = BatchService::new(self.ctx);
        let current = batch.check_updates(&table, updates).await?;

        let mut changes = Vec::new();
        for update in updates {
            let Some(row) = current.get(&update.record_id) else {
                continue;
            };
            for (field_id, value) in &update.fields {
                changes.push(CellChangeContext::new(
                    table_id,
                    update.record_id.clone(),
                    field_id.clone(),
                    Some(row.value(field_id).clone()),
                    Some(value.clone()),
                ));
            }
        }

        let links = LinkService::new(self.ctx);
        let plan = links.plan_link_derivation(table_id, &changes).await?;
        let updates = plan.normalize_updates(updates);
        self.compute_cell_changes(table_id, &changes, async {
            let rows = batch.update_records(table_id, &updates).await?;
            links.commit_link_derivation(&plan).await?;
            Ok(rows)
        })
        .await
    }

    async fn collect_fields(&self, sources: &[ChangeSource]) -> Result<ImpactMap> {
        DependencyCollector::new(self.ctx).collect_all(sources).await
    }

    /// Row-locks edited and impacted records, table by table in physical-name
    /// order. Tables marked ALL are skipped.
    async fn lock_impacted(
        &self,
        impact: &ImpactMap,
        edited: &BTreeMap<TableId, BTreeSet<RecordId>>,
    ) -> Result<()> {
        let store = self.ctx.store();
        if !self.ctx.config().lock_records || !store.supports_row_locks() {
            debug!("row locks skipped");
            return Ok(());
        }
        let mut wanted: BTreeMap<TableId, BTreeSet<RecordId>> = edited.clone();
        for (table_id, group) in impact.groups() {
            if let Some(ids) = group.records().ids() {
                wanted.entry(table_id.clone()).or_default().extend(ids.iter().cloned());
            }
        }
        wanted.retain(|table_id, ids| {
            !ids.is_empty() && !impact.group(table_id).is_some_and(|g| g.is_all())
        });
        if wanted.is_empty() {
            return Ok(());
        }

        let table_ids: Vec<TableId> = wanted.keys().cloned().collect();
        let mut domains = self.ctx.tables(&table_ids).await?;
        domains.sort_by(|a, b| a.db_table_name.cmp(&b.db_table_name));
        for domain in domains {
            if let Some(ids) = wanted.get(&domain.id) {
                let ids: Vec<RecordId> = ids.iter().cloned().collect();
                store.lock_records(&domain, &ids).await?;
            }
        }
        Ok(())
    }

    fn outcome(&self, start: usize, impact: &ImpactMap) -> ComputeOutcome {
        let published_op_count = self.ctx.computed_op_count().saturating_sub(start);
        info!(published_op_count, tables = impact.len(), "compute pass finished");
        ComputeOutcome {
            published_op_count,
            impact: impact.summary(),
        }
    }
}
