//! Link cascade resolver: relational closure of record sets over link edges.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cellgraph_core::{LinkClosurePlan, LinkEdge, RecordId, Result, TableDomain, TableId};
use tracing::debug;

use crate::context::ComputeContext;

/// Link edges among `tables`, one per physical relation.
///
/// A symmetric pair shares its key columns, so only the first side is kept.
pub fn link_edges(tables: &[Arc<TableDomain>]) -> Vec<LinkEdge> {
    let present: BTreeSet<&str> = tables.iter().map(|t| t.id.as_str()).collect();
    let mut seen: BTreeSet<(String, BTreeSet<(String, String)>)> = BTreeSet::new();
    let mut edges = Vec::new();
    for table in tables {
        for field in table.link_fields() {
            let Some(link) = field.link_options() else {
                continue;
            };
            if !present.contains(link.foreign_table_id.as_str()) {
                continue;
            }
            let key = (
                link.fk_host_table_name.clone(),
                BTreeSet::from([
                    (table.id.clone(), link.self_key_name.clone()),
                    (link.foreign_table_id.clone(), link.foreign_key_name.clone()),
                ]),
            );
            if !seen.insert(key) {
                continue;
            }
            edges.push(LinkEdge {
                self_table_id: table.id.clone(),
                foreign_table_id: link.foreign_table_id.clone(),
                fk_host_table_name: link.fk_host_table_name.clone(),
                self_key_name: link.self_key_name.clone(),
                foreign_key_name: link.foreign_key_name.clone(),
            });
        }
    }
    edges
}

pub struct LinkCascadeResolver<'a> {
    ctx: &'a ComputeContext,
}

impl<'a> LinkCascadeResolver<'a> {
    pub fn new(ctx: &'a ComputeContext) -> Self {
        Self { ctx }
    }

    pub fn plan(
        &self,
        tables: &[Arc<TableDomain>],
        seeds: BTreeMap<TableId, BTreeSet<RecordId>>,
        all_tables: BTreeSet<TableId>,
    ) -> LinkClosurePlan {
        LinkClosurePlan {
            edges: link_edges(tables),
            seeds,
            all_tables,
            table_names: tables
                .iter()
                .map(|t| (t.id.clone(), t.db_table_name.clone()))
                .collect(),
        }
    }

    /// Every record reachable from the seeds, grouped by table. Seeds are
    /// included; tables seeded as ALL are not enumerated in the result.
    pub async fn resolve(
        &self,
        plan: &LinkClosurePlan,
    ) -> Result<BTreeMap<TableId, BTreeSet<RecordId>>> {
        let mut out: BTreeMap<TableId, BTreeSet<RecordId>> = BTreeMap::new();
        if plan.is_trivial() {
            for (table_id, ids) in &plan.seeds {
                out.insert(table_id.clone(), ids.clone());
            }
            return Ok(out);
        }
        debug!(
            edges = plan.edges.len(),
            seeds = plan.seed_count(),
            all_tables = plan.all_tables.len(),
            sql = %plan.to_sql(),
            "resolving link closure"
        );
        for (table_id, record_id) in self.ctx.store().link_closure(plan).await? {
            if plan.all_tables.contains(&table_id) {
                continue;
            }
            out.entry(table_id).or_default().insert(record_id);
        }
        Ok(out)
    }
}
