use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cellgraph_core::{
    CellGraphError, CollaborationSink, ComputeConfig, MetadataProvider, OpBuffer, RecordStore,
    Result, TableDomain, TableId,
};
use dashmap::DashMap;
use tracing::{debug, info};

/// Everything one compute pass needs, scoped to a single transaction.
///
/// Built once per transaction and dropped afterwards. Table definitions are
/// cached here and nowhere else.
pub struct ComputeContext {
    metadata: Arc<dyn MetadataProvider>,
    store: Arc<dyn RecordStore>,
    config: ComputeConfig,
    tables: DashMap<TableId, Arc<TableDomain>>,
    ops: OpBuffer,
    computed_ops: AtomicUsize,
}

impl ComputeContext {
    pub fn new(
        metadata: Arc<dyn MetadataProvider>,
        store: Arc<dyn RecordStore>,
        config: ComputeConfig,
    ) -> Self {
        Self {
            metadata,
            store,
            config,
            tables: DashMap::new(),
            ops: OpBuffer::new(),
            computed_ops: AtomicUsize::new(0),
        }
    }

    pub fn metadata(&self) -> &dyn MetadataProvider {
        self.metadata.as_ref()
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    pub fn ops(&self) -> &OpBuffer {
        &self.ops
    }

    pub async fn table(&self, table_id: &str) -> Result<Arc<TableDomain>> {
        if let Some(cached) = self.tables.get(table_id) {
            return Ok(cached.clone());
        }
        let domain = Arc::new(self.metadata.get_table_domain(table_id).await?);
        self.tables.insert(table_id.to_string(), domain.clone());
        Ok(domain)
    }

    /// Loads several tables; any unknown id is an error.
    pub async fn tables(&self, table_ids: &[TableId]) -> Result<Vec<Arc<TableDomain>>> {
        let missing: Vec<TableId> = table_ids
            .iter()
            .filter(|id| !self.tables.contains_key(id.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            for domain in self.metadata.get_table_domains_by_ids(&missing).await? {
                self.tables.insert(domain.id.clone(), Arc::new(domain));
            }
        }
        table_ids
            .iter()
            .map(|id| {
                self.tables
                    .get(id.as_str())
                    .map(|d| d.clone())
                    .ok_or_else(|| CellGraphError::NotFound(format!("table {id}")))
            })
            .collect()
    }

    /// Drops every cached definition. Called between phases that change schema.
    pub fn invalidate(&self) {
        debug!(cached = self.tables.len(), "table cache invalidated");
        self.tables.clear();
    }

    pub fn cached_table_count(&self) -> usize {
        self.tables.len()
    }

    pub(crate) fn record_computed_ops(&self, count: usize) {
        self.computed_ops.fetch_add(count, Ordering::SeqCst);
    }

    /// Computed and mirrored set-cell ops queued so far.
    pub fn computed_op_count(&self) -> usize {
        self.computed_ops.load(Ordering::SeqCst)
    }

    /// Hands buffered ops to `sink`. Call after the transaction committed.
    pub async fn flush_ops(&self, sink: &dyn CollaborationSink) -> Result<usize> {
        let ops = self.ops.take();
        let count = ops.len();
        if count > 0 {
            sink.publish(ops).await?;
        }
        info!(count, "flushed ops to collaboration sink");
        Ok(count)
    }
}
