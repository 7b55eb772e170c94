use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::field::LinkOptions;
use crate::filter::HostPredicate;
use crate::query::{ComputedSelect, LinkClosurePlan, LinkPair, ReferenceEdge, UpdatedRow};
use crate::table::TableDomain;
use crate::types::{CellValue, FieldId, RecordId, RecordRow, TableId};

/// Read access to table definitions and the field reference graph.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn get_table_domain(&self, table_id: &str) -> Result<TableDomain>;

    /// Unknown ids are skipped.
    async fn get_table_domains_by_ids(&self, table_ids: &[TableId]) -> Result<Vec<TableDomain>>;

    async fn table_ids_by_field_ids(&self, field_ids: &[FieldId]) -> Result<BTreeMap<FieldId, TableId>>;

    /// Transitive dependents of `field_ids`, as reference edges.
    async fn reference_edges_from(&self, field_ids: &[FieldId]) -> Result<Vec<ReferenceEdge>>;

    /// Edges whose both endpoints are in `field_ids`.
    async fn reference_edges_among(&self, field_ids: &[FieldId]) -> Result<Vec<ReferenceEdge>>;
}

/// Transaction-scoped access to record rows and link keys.
///
/// Every call observes the writes made earlier through the same handle.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Missing ids are skipped; rows come back in auto number order.
    async fn get_records(&self, table: &TableDomain, record_ids: &[RecordId]) -> Result<Vec<RecordRow>>;

    async fn count_records(&self, table: &TableDomain) -> Result<usize>;

    async fn list_record_ids(&self, table: &TableDomain, limit: Option<usize>) -> Result<Vec<RecordId>>;

    /// Ids of rows satisfying `predicate`, at most `limit` of them.
    async fn select_record_ids(
        &self,
        table: &TableDomain,
        predicate: &HostPredicate,
        limit: usize,
    ) -> Result<Vec<RecordId>>;

    /// Every (table, record) reachable from the plan's seeds through its edges.
    async fn link_closure(&self, plan: &LinkClosurePlan) -> Result<Vec<(TableId, RecordId)>>;

    /// Key pairs whose self key is in `self_ids`, ordered by self id then order.
    async fn read_links(&self, link: &LinkOptions, self_ids: &[RecordId]) -> Result<Vec<LinkPair>>;

    /// Key pairs whose foreign key is in `foreign_ids`.
    async fn read_links_by_foreign(
        &self,
        link: &LinkOptions,
        foreign_ids: &[RecordId],
    ) -> Result<Vec<LinkPair>>;

    async fn delete_links(&self, link: &LinkOptions, pairs: &[LinkPair]) -> Result<()>;

    async fn insert_links(&self, link: &LinkOptions, pairs: &[LinkPair]) -> Result<()>;

    /// Highest stored order per self id; ids without links are absent.
    async fn max_link_order(
        &self,
        link: &LinkOptions,
        self_ids: &[RecordId],
    ) -> Result<BTreeMap<RecordId, i64>> {
        let mut out: BTreeMap<RecordId, i64> = BTreeMap::new();
        for pair in self.read_links(link, self_ids).await? {
            let order = pair.order.unwrap_or(0);
            let entry = out.entry(pair.self_id).or_insert(order);
            *entry = (*entry).max(order);
        }
        Ok(out)
    }

    /// Builds the recomputation select for `projection` over `table`.
    fn build_select(&self, table: &TableDomain, projection: &[FieldId]) -> Result<ComputedSelect>;

    /// Writes the select's results into the table and returns every row in
    /// scope, in auto number order. Does not bump versions.
    async fn update_from_select(
        &self,
        table: &TableDomain,
        select: &ComputedSelect,
    ) -> Result<Vec<UpdatedRow>>;

    /// Writes user values for `field_ids`, one value vector per record, bumping
    /// each record's version by one and stamping audit columns with `actor`.
    async fn bulk_update(
        &self,
        table: &TableDomain,
        field_ids: &[FieldId],
        rows: &[(RecordId, Vec<CellValue>)],
        actor: &str,
    ) -> Result<Vec<UpdatedRow>>;

    /// Writes derived cells without touching versions.
    async fn write_cells(
        &self,
        table: &TableDomain,
        cells: &[(RecordId, FieldId, CellValue)],
    ) -> Result<Vec<UpdatedRow>>;

    /// Row-level exclusive locks held until the transaction ends.
    async fn lock_records(&self, table: &TableDomain, record_ids: &[RecordId]) -> Result<()>;

    fn supports_row_locks(&self) -> bool {
        true
    }
}
