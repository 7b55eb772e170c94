//! Physical state of the in-memory backend: row tables, table definitions and
//! the field reference graph. A transaction works on a private clone.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use cellgraph_core::{
    CellGraphError, Field, FieldId, LinkClosurePlan, LinkOptions, LinkPair, RecordId,
    ReferenceEdge, Result, StorageError, TableDomain, TableId, AUTO_NUMBER_COLUMN, ID_COLUMN,
    VERSION_COLUMN,
};
use serde_json::Value;

pub type Row = BTreeMap<String, Value>;

/// One physical table. Rows are keyed by a monotonic row id which doubles as
/// the auto number of record tables.
#[derive(Debug, Clone, Default)]
pub struct PhysicalTable {
    pub name: String,
    rows: BTreeMap<i64, Row>,
    next_row_id: i64,
    id_index: HashMap<RecordId, i64>,
}

impl PhysicalTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
            next_row_id: 1,
            id_index: HashMap::new(),
        }
    }

    pub fn insert(&mut self, mut row: Row) -> i64 {
        let row_id = self.next_row_id;
        self.next_row_id += 1;
        if let Some(Value::String(id)) = row.get(ID_COLUMN) {
            self.id_index.insert(id.clone(), row_id);
            row.insert(AUTO_NUMBER_COLUMN.to_string(), Value::from(row_id));
        }
        self.rows.insert(row_id, row);
        row_id
    }

    pub fn rows(&self) -> impl Iterator<Item = (&i64, &Row)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_by_id(&self, record_id: &str) -> Option<&Row> {
        self.id_index.get(record_id).and_then(|rid| self.rows.get(rid))
    }

    pub fn row_by_id_mut(&mut self, record_id: &str) -> Option<&mut Row> {
        let rid = self.id_index.get(record_id)?;
        self.rows.get_mut(rid)
    }

    pub fn contains_id(&self, record_id: &str) -> bool {
        self.id_index.contains_key(record_id)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Row) -> bool) {
        self.rows.retain(|_, row| keep(row));
    }
}

pub(crate) fn row_text(row: &Row, column: &str) -> Option<String> {
    match row.get(column) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn row_i64(row: &Row, column: &str) -> Option<i64> {
    row.get(column).and_then(Value::as_i64)
}

#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: BTreeMap<String, PhysicalTable>,
    domains: BTreeMap<TableId, TableDomain>,
    field_tables: BTreeMap<FieldId, TableId>,
    references: BTreeSet<ReferenceEdge>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Result<&PhysicalTable> {
        self.tables
            .get(name)
            .ok_or_else(|| StorageError::other(format!("relation \"{name}\" does not exist")).into())
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut PhysicalTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StorageError::other(format!("relation \"{name}\" does not exist")).into())
    }

    pub fn ensure_physical_table(&mut self, name: &str) {
        self.tables
            .entry(name.to_string())
            .or_insert_with(|| PhysicalTable::new(name));
    }

    pub fn domain(&self, table_id: &str) -> Result<&TableDomain> {
        self.domains
            .get(table_id)
            .ok_or_else(|| CellGraphError::NotFound(format!("table {table_id}")))
    }

    pub fn domains(&self) -> impl Iterator<Item = &TableDomain> {
        self.domains.values()
    }

    pub fn field_table(&self, field_id: &str) -> Option<&TableId> {
        self.field_tables.get(field_id)
    }

    pub fn create_table(&mut self, domain: TableDomain) -> Result<()> {
        if self.domains.contains_key(&domain.id) {
            return Err(CellGraphError::Consistency(format!(
                "table {} already exists",
                domain.id
            )));
        }
        self.ensure_physical_table(&domain.db_table_name);
        let fields: Vec<Field> = domain.fields().to_vec();
        let table_id = domain.id.clone();
        self.domains.insert(
            table_id.clone(),
            TableDomain::new(domain.id, domain.name, domain.db_table_name, Vec::new()),
        );
        for field in fields {
            self.create_field(&table_id, field)?;
        }
        Ok(())
    }

    /// Adds or replaces a field and refreshes its reference edges.
    pub fn create_field(&mut self, table_id: &str, field: Field) -> Result<()> {
        field.validate_options().map_err(CellGraphError::Consistency)?;
        if let Some(owner) = self.field_tables.get(&field.id) {
            if owner != table_id {
                return Err(CellGraphError::Consistency(format!(
                    "field {} already belongs to table {owner}",
                    field.id
                )));
            }
        }
        if let Some(link) = field.link_options() {
            self.ensure_physical_table(&link.fk_host_table_name);
        }
        self.references.retain(|edge| edge.to_field_id != field.id);
        for from in field.referenced_field_ids() {
            self.references.insert(ReferenceEdge::new(from, field.id.clone()));
        }
        self.field_tables.insert(field.id.clone(), table_id.to_string());
        let domain = self
            .domains
            .get_mut(table_id)
            .ok_or_else(|| CellGraphError::NotFound(format!("table {table_id}")))?;
        domain.push_field(field);
        Ok(())
    }

    /// Drops a field, its column and every reference edge touching it.
    pub fn delete_field(&mut self, table_id: &str, field_id: &str) -> Result<Field> {
        let domain = self
            .domains
            .get_mut(table_id)
            .ok_or_else(|| CellGraphError::NotFound(format!("table {table_id}")))?;
        let field = domain
            .remove_field(field_id)
            .ok_or_else(|| CellGraphError::NotFound(format!("field {field_id} in table {table_id}")))?;
        let db_table_name = domain.db_table_name.clone();
        if let Some(table) = self.tables.get_mut(&db_table_name) {
            for row in table.rows.values_mut() {
                row.remove(&field.db_field_name);
            }
        }
        self.field_tables.remove(field_id);
        self.references
            .retain(|edge| edge.from_field_id != field_id && edge.to_field_id != field_id);
        Ok(field)
    }

    pub fn add_reference(&mut self, edge: ReferenceEdge) {
        self.references.insert(edge);
    }

    pub fn remove_reference(&mut self, from_field_id: &str, to_field_id: &str) -> bool {
        self.references
            .remove(&ReferenceEdge::new(from_field_id, to_field_id))
    }

    pub fn references(&self) -> &BTreeSet<ReferenceEdge> {
        &self.references
    }

    /// Every edge reachable from `field_ids` along the reference direction.
    pub fn reference_edges_from(&self, field_ids: &[FieldId]) -> Vec<ReferenceEdge> {
        let mut adjacency: HashMap<&str, Vec<&ReferenceEdge>> = HashMap::new();
        for edge in &self.references {
            adjacency.entry(edge.from_field_id.as_str()).or_default().push(edge);
        }
        let mut seen: BTreeSet<&str> = field_ids.iter().map(String::as_str).collect();
        let mut queue: VecDeque<&str> = seen.iter().copied().collect();
        let mut out = BTreeSet::new();
        while let Some(current) = queue.pop_front() {
            for edge in adjacency.get(current).into_iter().flatten() {
                out.insert((*edge).clone());
                if seen.insert(edge.to_field_id.as_str()) {
                    queue.push_back(edge.to_field_id.as_str());
                }
            }
        }
        out.into_iter().collect()
    }

    pub fn reference_edges_among(&self, field_ids: &[FieldId]) -> Vec<ReferenceEdge> {
        let wanted: BTreeSet<&str> = field_ids.iter().map(String::as_str).collect();
        self.references
            .iter()
            .filter(|e| {
                wanted.contains(e.from_field_id.as_str()) && wanted.contains(e.to_field_id.as_str())
            })
            .cloned()
            .collect()
    }

    /// Adds a record row with system columns filled in.
    pub fn insert_record(&mut self, table_id: &str, record_id: RecordId, columns: Row, now: &str, actor: &str) -> Result<i64> {
        let db_table_name = self.domain(table_id)?.db_table_name.clone();
        let table = self.table_mut(&db_table_name)?;
        if table.contains_id(&record_id) {
            return Err(StorageError::new(
                cellgraph_core::StorageErrorKind::UniqueViolation {
                    column: ID_COLUMN.to_string(),
                },
                format!("duplicate key value {record_id}"),
            )
            .into());
        }
        let mut row = columns;
        row.insert(ID_COLUMN.to_string(), Value::String(record_id));
        row.insert(VERSION_COLUMN.to_string(), Value::from(1));
        row.insert(cellgraph_core::CREATED_TIME_COLUMN.to_string(), Value::String(now.to_string()));
        row.insert(
            cellgraph_core::LAST_MODIFIED_TIME_COLUMN.to_string(),
            Value::String(now.to_string()),
        );
        row.insert(
            cellgraph_core::LAST_MODIFIED_BY_COLUMN.to_string(),
            Value::String(actor.to_string()),
        );
        Ok(table.insert(row))
    }

    /// Key pairs of `link` anchored on the side named by `by_foreign`.
    pub fn read_links(&self, link: &LinkOptions, ids: &[RecordId], by_foreign: bool) -> Result<Vec<LinkPair>> {
        let table = self.table(&link.fk_host_table_name)?;
        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let position: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let mut out: Vec<(usize, i64, LinkPair)> = Vec::new();
        for (row_id, row) in table.rows() {
            let (Some(self_id), Some(foreign_id)) = (
                row_text(row, &link.self_key_name),
                row_text(row, &link.foreign_key_name),
            ) else {
                continue;
            };
            let anchor = if by_foreign { &foreign_id } else { &self_id };
            if !wanted.contains(anchor.as_str()) {
                continue;
            }
            let order = link
                .order_column_name
                .as_deref()
                .and_then(|col| row_i64(row, col));
            let rank = position.get(anchor.as_str()).copied().unwrap_or(usize::MAX);
            out.push((rank, order.unwrap_or(*row_id), LinkPair { self_id, foreign_id, order }));
        }
        out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(out.into_iter().map(|(_, _, pair)| pair).collect())
    }

    pub fn delete_links(&mut self, link: &LinkOptions, pairs: &[LinkPair]) -> Result<usize> {
        let table = self.table_mut(&link.fk_host_table_name)?;
        let mut removed = 0;
        if link.self_key_name == ID_COLUMN || link.foreign_key_name == ID_COLUMN {
            let self_is_row = link.self_key_name == ID_COLUMN;
            for pair in pairs {
                let (row_key, other, column) = if self_is_row {
                    (&pair.self_id, &pair.foreign_id, &link.foreign_key_name)
                } else {
                    (&pair.foreign_id, &pair.self_id, &link.self_key_name)
                };
                let Some(row) = table.row_by_id_mut(row_key) else {
                    continue;
                };
                if row_text(row, column).as_deref() == Some(other.as_str()) {
                    row.insert(column.clone(), Value::Null);
                    if let Some(order) = &link.order_column_name {
                        row.insert(order.clone(), Value::Null);
                    }
                    removed += 1;
                }
            }
        } else {
            let doomed: BTreeSet<(&str, &str)> = pairs
                .iter()
                .map(|p| (p.self_id.as_str(), p.foreign_id.as_str()))
                .collect();
            let before = table.len();
            table.retain(|row| {
                match (
                    row_text(row, &link.self_key_name),
                    row_text(row, &link.foreign_key_name),
                ) {
                    (Some(s), Some(f)) => !doomed.contains(&(s.as_str(), f.as_str())),
                    _ => true,
                }
            });
            removed = before - table.len();
        }
        Ok(removed)
    }

    pub fn insert_links(&mut self, link: &LinkOptions, pairs: &[LinkPair]) -> Result<()> {
        let table = self.table_mut(&link.fk_host_table_name)?;
        if link.self_key_name == ID_COLUMN || link.foreign_key_name == ID_COLUMN {
            let self_is_row = link.self_key_name == ID_COLUMN;
            for pair in pairs {
                let (row_key, other, column) = if self_is_row {
                    (&pair.self_id, &pair.foreign_id, &link.foreign_key_name)
                } else {
                    (&pair.foreign_id, &pair.self_id, &link.self_key_name)
                };
                let row = table.row_by_id_mut(row_key).ok_or_else(|| {
                    StorageError::other(format!(
                        "insert or update on \"{}\" violates foreign key: {row_key} missing",
                        link.fk_host_table_name
                    ))
                })?;
                row.insert(column.clone(), Value::String(other.clone()));
                if let (Some(order_col), Some(order)) = (&link.order_column_name, pair.order) {
                    row.insert(order_col.clone(), Value::from(order));
                }
            }
        } else {
            for pair in pairs {
                let mut row = Row::new();
                row.insert(link.self_key_name.clone(), Value::String(pair.self_id.clone()));
                row.insert(link.foreign_key_name.clone(), Value::String(pair.foreign_id.clone()));
                if let (Some(order_col), Some(order)) = (&link.order_column_name, pair.order) {
                    row.insert(order_col.clone(), Value::from(order));
                }
                table.insert(row);
            }
        }
        Ok(())
    }

    /// Semi-naive closure: each round joins only the newly reached pairs.
    pub fn link_closure(&self, plan: &LinkClosurePlan) -> Result<Vec<(TableId, RecordId)>> {
        let mut reached: BTreeSet<(TableId, RecordId)> = BTreeSet::new();
        let mut frontier: Vec<(TableId, RecordId)> = Vec::new();
        for (table_id, ids) in &plan.seeds {
            for id in ids {
                if reached.insert((table_id.clone(), id.clone())) {
                    frontier.push((table_id.clone(), id.clone()));
                }
            }
        }
        for table_id in &plan.all_tables {
            let name = plan
                .table_names
                .get(table_id)
                .cloned()
                .map(Ok)
                .unwrap_or_else(|| self.domain(table_id).map(|d| d.db_table_name.clone()))?;
            for (_, row) in self.table(&name)?.rows() {
                if let Some(id) = row_text(row, ID_COLUMN) {
                    if reached.insert((table_id.clone(), id.clone())) {
                        frontier.push((table_id.clone(), id));
                    }
                }
            }
        }

        let mut relations = Vec::with_capacity(plan.edges.len());
        for edge in &plan.edges {
            let host = self.table(&edge.fk_host_table_name)?;
            let pairs: Vec<(String, String)> = host
                .rows()
                .filter_map(|(_, row)| {
                    Some((
                        row_text(row, &edge.self_key_name)?,
                        row_text(row, &edge.foreign_key_name)?,
                    ))
                })
                .collect();
            relations.push((edge, pairs));
        }

        while !frontier.is_empty() {
            let mut by_table: HashMap<&str, BTreeSet<&str>> = HashMap::new();
            for (table_id, id) in &frontier {
                by_table.entry(table_id.as_str()).or_default().insert(id.as_str());
            }
            let mut next = Vec::new();
            for (edge, pairs) in &relations {
                let forward = by_table.get(edge.self_table_id.as_str());
                let backward = by_table.get(edge.foreign_table_id.as_str());
                for (self_id, foreign_id) in pairs {
                    if forward.is_some_and(|ids| ids.contains(self_id.as_str())) {
                        next.push((edge.foreign_table_id.clone(), foreign_id.clone()));
                    }
                    if backward.is_some_and(|ids| ids.contains(foreign_id.as_str())) {
                        next.push((edge.self_table_id.clone(), self_id.clone()));
                    }
                }
            }
            frontier = next
                .into_iter()
                .filter(|pair| reached.insert(pair.clone()))
                .collect();
        }
        Ok(reached.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellgraph_core::{FieldType, LinkEdge, Relationship};

    fn junction_link() -> LinkOptions {
        LinkOptions {
            relationship: Relationship::ManyMany,
            foreign_table_id: "tbl_b".into(),
            lookup_field_id: "fld_b_name".into(),
            fk_host_table_name: "j_ab".into(),
            self_key_name: "__fk_a".into(),
            foreign_key_name: "__fk_b".into(),
            symmetric_field_id: None,
            order_column_name: Some("__order_a".into()),
        }
    }

    #[test]
    fn junction_links_keep_order_per_anchor() {
        let mut db = MemoryDatabase::new();
        db.ensure_physical_table("j_ab");
        let link = junction_link();
        db.insert_links(
            &link,
            &[
                LinkPair::new("a1", "b2", Some(2)),
                LinkPair::new("a1", "b1", Some(1)),
                LinkPair::new("a2", "b1", Some(1)),
            ],
        )
        .unwrap();
        let pairs = db.read_links(&link, &["a1".to_string()], false).unwrap();
        let ids: Vec<_> = pairs.iter().map(|p| p.foreign_id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);

        let removed = db.delete_links(&link, &[LinkPair::new("a1", "b1", None)]).unwrap();
        assert_eq!(removed, 1);
        let reverse = db.read_links(&link, &["b1".to_string()], true).unwrap();
        assert_eq!(reverse.len(), 1);
        assert_eq!(reverse[0].self_id, "a2");
    }

    #[test]
    fn closure_follows_chains_in_both_directions() {
        let mut db = MemoryDatabase::new();
        db.ensure_physical_table("j_ab");
        db.ensure_physical_table("j_bc");
        db.insert_links(&junction_link(), &[LinkPair::new("a1", "b1", None)]).unwrap();
        let bc = LinkOptions {
            fk_host_table_name: "j_bc".into(),
            self_key_name: "__fk_b".into(),
            foreign_key_name: "__fk_c".into(),
            ..junction_link()
        };
        db.insert_links(&bc, &[LinkPair::new("b1", "c1", None), LinkPair::new("b2", "c9", None)])
            .unwrap();

        let plan = LinkClosurePlan {
            edges: vec![
                LinkEdge {
                    self_table_id: "tbl_a".into(),
                    foreign_table_id: "tbl_b".into(),
                    fk_host_table_name: "j_ab".into(),
                    self_key_name: "__fk_a".into(),
                    foreign_key_name: "__fk_b".into(),
                },
                LinkEdge {
                    self_table_id: "tbl_b".into(),
                    foreign_table_id: "tbl_c".into(),
                    fk_host_table_name: "j_bc".into(),
                    self_key_name: "__fk_b".into(),
                    foreign_key_name: "__fk_c".into(),
                },
            ],
            seeds: BTreeMap::from([("tbl_c".to_string(), BTreeSet::from(["c1".to_string()]))]),
            ..Default::default()
        };
        let reached = db.link_closure(&plan).unwrap();
        assert_eq!(
            reached,
            vec![
                ("tbl_a".to_string(), "a1".to_string()),
                ("tbl_b".to_string(), "b1".to_string()),
                ("tbl_c".to_string(), "c1".to_string()),
            ]
        );
    }

    #[test]
    fn reference_edges_follow_field_definitions() {
        let mut db = MemoryDatabase::new();
        let formula = Field::formula(
            "fld_double",
            "Double",
            cellgraph_core::Expr::binary(
                cellgraph_core::BinaryOp::Mul,
                cellgraph_core::Expr::field("fld_n"),
                cellgraph_core::Expr::literal(Value::from(2)),
            ),
        );
        let quad = Field::formula(
            "fld_quad",
            "Quad",
            cellgraph_core::Expr::binary(
                cellgraph_core::BinaryOp::Mul,
                cellgraph_core::Expr::field("fld_double"),
                cellgraph_core::Expr::literal(Value::from(2)),
            ),
        );
        db.create_table(TableDomain::new(
            "tbl_a",
            "A",
            "t_a",
            vec![Field::new("fld_n", "N", FieldType::Number), formula, quad],
        ))
        .unwrap();
        let edges = db.reference_edges_from(&["fld_n".to_string()]);
        assert_eq!(edges.len(), 2);
        db.delete_field("tbl_a", "fld_double").unwrap();
        assert!(db.reference_edges_from(&["fld_n".to_string()]).is_empty());
    }
}
