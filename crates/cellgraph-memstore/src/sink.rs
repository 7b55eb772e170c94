use std::sync::Arc;

use async_trait::async_trait;
use cellgraph_core::{CollaborationSink, RawOp, Result};
use parking_lot::Mutex;
use tracing::debug;

/// Collects published ops in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    published: Arc<Mutex<Vec<RawOp>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<RawOp> {
        self.published.lock().clone()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl CollaborationSink for MemorySink {
    async fn publish(&self, ops: Vec<RawOp>) -> Result<()> {
        debug!(count = ops.len(), "ops published");
        self.published.lock().extend(ops);
        Ok(())
    }
}
