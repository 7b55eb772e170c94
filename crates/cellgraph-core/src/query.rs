//! Shapes exchanged with the storage boundary: computed selects, updated rows,
//! link pairs and link closure plans.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::field::ID_COLUMN;
use crate::types::{FieldId, RecordId, TableId};

/// "to depends on from" in the field reference graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceEdge {
    pub from_field_id: FieldId,
    pub to_field_id: FieldId,
}

impl ReferenceEdge {
    pub fn new(from: impl Into<FieldId>, to: impl Into<FieldId>) -> Self {
        Self {
            from_field_id: from.into(),
            to_field_id: to.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectScope {
    Table,
    RecordIds(Vec<RecordId>),
    /// Rows with auto number greater than `after`, ascending, at most `limit`.
    Cursor {
        after: Option<i64>,
        limit: usize,
        restrict_to: Option<Arc<BTreeSet<RecordId>>>,
    },
}

/// A recomputation select produced by the query builder.
///
/// The builder embeds the link-following subqueries; callers only narrow the
/// scope and hand it back for execution as an update-from-select.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedSelect {
    pub table_id: TableId,
    pub db_table_name: String,
    pub projection: Vec<FieldId>,
    pub columns: Vec<String>,
    pub sql: String,
    pub scope: SelectScope,
}

impl ComputedSelect {
    pub fn with_record_ids(mut self, ids: Vec<RecordId>) -> Self {
        self.scope = SelectScope::RecordIds(ids);
        self
    }

    pub fn with_cursor(
        mut self,
        after: Option<i64>,
        limit: usize,
        restrict_to: Option<Arc<BTreeSet<RecordId>>>,
    ) -> Self {
        self.scope = SelectScope::Cursor {
            after,
            limit,
            restrict_to,
        };
        self
    }

    /// The select with its scope predicate applied.
    pub fn scoped_sql(&self) -> String {
        match &self.scope {
            SelectScope::Table => self.sql.clone(),
            SelectScope::RecordIds(ids) => format!(
                "{} WHERE \"{ID_COLUMN}\" = ANY($1) /* {} ids */",
                self.sql,
                ids.len()
            ),
            SelectScope::Cursor {
                after,
                limit,
                restrict_to,
            } => {
                let mut sql = format!(
                    "{} WHERE \"__auto_number\" > {}",
                    self.sql,
                    after.unwrap_or(i64::MIN)
                );
                if let Some(ids) = restrict_to {
                    let _ = write!(sql, " AND \"{ID_COLUMN}\" = ANY($1) /* {} ids */", ids.len());
                }
                let _ = write!(sql, " ORDER BY \"__auto_number\" LIMIT {limit}");
                sql
            }
        }
    }

    /// The full update-from-select statement.
    pub fn update_sql(&self) -> String {
        let assignments = self
            .columns
            .iter()
            .map(|c| format!("\"{c}\" = s.\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE \"{table}\" AS t SET {assignments} FROM ({select}) AS s WHERE t.\"{ID_COLUMN}\" = s.\"{ID_COLUMN}\" RETURNING t.*",
            table = self.db_table_name,
            select = self.scoped_sql(),
        )
    }
}

/// A row touched by an update, with values before and after.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedRow {
    pub record_id: RecordId,
    pub auto_number: i64,
    pub version_before: i64,
    pub version_after: i64,
    pub old_values: BTreeMap<FieldId, Value>,
    pub new_values: BTreeMap<FieldId, Value>,
}

/// One physical key pair as stored in a link's FK host table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkPair {
    pub self_id: RecordId,
    pub foreign_id: RecordId,
    pub order: Option<i64>,
}

impl LinkPair {
    pub fn new(self_id: impl Into<RecordId>, foreign_id: impl Into<RecordId>, order: Option<i64>) -> Self {
        Self {
            self_id: self_id.into(),
            foreign_id: foreign_id.into(),
            order,
        }
    }
}

/// One traversable link relation between two tables.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkEdge {
    pub self_table_id: TableId,
    pub foreign_table_id: TableId,
    pub fk_host_table_name: String,
    pub self_key_name: String,
    pub foreign_key_name: String,
}

/// Input to the link closure query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkClosurePlan {
    pub edges: Vec<LinkEdge>,
    pub seeds: BTreeMap<TableId, BTreeSet<RecordId>>,
    /// Tables whose every record is a seed.
    pub all_tables: BTreeSet<TableId>,
    /// Physical names of every table appearing in the plan.
    pub table_names: BTreeMap<TableId, String>,
}

impl LinkClosurePlan {
    pub fn is_trivial(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn seed_count(&self) -> usize {
        self.seeds.values().map(BTreeSet::len).sum()
    }

    /// Renders the plan as a recursive CTE.
    pub fn to_sql(&self) -> String {
        let mut seeds = vec!["SELECT table_id, record_id FROM unnest($1::text[], $2::text[]) AS s(table_id, record_id)".to_string()];
        for table_id in &self.all_tables {
            let name = self.table_names.get(table_id).map(String::as_str).unwrap_or(table_id);
            seeds.push(format!("SELECT '{table_id}', \"{ID_COLUMN}\" FROM \"{name}\""));
        }
        let mut steps = Vec::new();
        for edge in &self.edges {
            steps.push(format!(
                "SELECT '{to}', h.\"{fk}\" FROM closure c JOIN \"{host}\" h ON c.table_id = '{from}' AND h.\"{sk}\" = c.record_id WHERE h.\"{fk}\" IS NOT NULL",
                to = edge.foreign_table_id,
                from = edge.self_table_id,
                host = edge.fk_host_table_name,
                sk = edge.self_key_name,
                fk = edge.foreign_key_name,
            ));
            steps.push(format!(
                "SELECT '{to}', h.\"{sk}\" FROM closure c JOIN \"{host}\" h ON c.table_id = '{from}' AND h.\"{fk}\" = c.record_id WHERE h.\"{sk}\" IS NOT NULL",
                to = edge.self_table_id,
                from = edge.foreign_table_id,
                host = edge.fk_host_table_name,
                sk = edge.self_key_name,
                fk = edge.foreign_key_name,
            ));
        }
        let mut sql = format!(
            "WITH RECURSIVE seeds(table_id, record_id) AS ({}), closure(table_id, record_id) AS (SELECT table_id, record_id FROM seeds",
            seeds.join(" UNION ALL ")
        );
        for step in steps {
            sql.push_str(" UNION ");
            sql.push_str(&step);
        }
        sql.push_str(") SELECT DISTINCT table_id, record_id FROM closure");
        sql
    }
}
