use std::path::Path;

use ::config as cfg;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CellGraphError, Result};

/// Environment variable prefix; nested keys use `__` as separator.
pub const ENV_PREFIX: &str = "CELLGRAPH";

/// Tunables for one compute pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ComputeConfig {
    /// Above this many host ids a conditional edge switches the table to ALL.
    pub materialization_threshold: usize,
    /// Record sets larger than this are evaluated through cursor pages.
    pub page_size: usize,
    pub deadlock_max_retries: u32,
    /// Base backoff; attempt `n` sleeps `n * deadlock_backoff_ms`.
    pub deadlock_backoff_ms: u64,
    /// Take row locks on explicit impacted records before the base update.
    pub lock_records: bool,
    /// Written to last-modified-by columns.
    pub actor: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            materialization_threshold: 10_000,
            page_size: 10_000,
            deadlock_max_retries: 3,
            deadlock_backoff_ms: 20,
            lock_records: true,
            actor: "system".to_string(),
        }
    }
}

impl ComputeConfig {
    /// Layers `default.toml`, then `local.toml` from `config_dir`, then
    /// `CELLGRAPH__*` environment variables over the built-in defaults.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let settings: ComputeConfig = cfg::Config::builder()
            .add_source(cfg::File::from(config_dir.join("default.toml")).required(false))
            .add_source(cfg::File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                cfg::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        debug!(?settings, "compute configuration loaded");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(CellGraphError::Config("page_size must be positive".into()));
        }
        if self.materialization_threshold == 0 {
            return Err(CellGraphError::Config(
                "materialization_threshold must be positive".into(),
            ));
        }
        if self.actor.trim().is_empty() {
            return Err(CellGraphError::Config("actor must not be empty".into()));
        }
        Ok(())
    }

    /// JSON schema of the configuration file.
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(ComputeConfig)).unwrap_or_default()
    }
}
