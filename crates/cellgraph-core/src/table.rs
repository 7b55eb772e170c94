use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CellGraphError, Result};
use crate::field::Field;
use crate::types::{FieldId, TableId};

/// A table definition plus lookup indices derived from its field list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "TableDomainDef", into = "TableDomainDef")]
pub struct TableDomain {
    pub id: TableId,
    pub name: String,
    pub db_table_name: String,
    fields: Vec<Field>,
    by_id: HashMap<FieldId, usize>,
    by_link_target: HashMap<TableId, Vec<FieldId>>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableDomainDef {
    id: TableId,
    name: String,
    db_table_name: String,
    fields: Vec<Field>,
}

impl From<TableDomainDef> for TableDomain {
    fn from(def: TableDomainDef) -> Self {
        TableDomain::new(def.id, def.name, def.db_table_name, def.fields)
    }
}

impl From<TableDomain> for TableDomainDef {
    fn from(domain: TableDomain) -> Self {
        Self {
            id: domain.id,
            name: domain.name,
            db_table_name: domain.db_table_name,
            fields: domain.fields,
        }
    }
}

impl TableDomain {
    pub fn new(
        id: impl Into<TableId>,
        name: impl Into<String>,
        db_table_name: impl Into<String>,
        fields: Vec<Field>,
    ) -> Self {
        let mut domain = Self {
            id: id.into(),
            name: name.into(),
            db_table_name: db_table_name.into(),
            fields: Vec::new(),
            by_id: HashMap::new(),
            by_link_target: HashMap::new(),
        };
        for field in fields {
            domain.push_field(field);
        }
        domain
    }

    /// Appends a field, replacing any field with the same id in place.
    pub fn push_field(&mut self, field: Field) {
        if let Some(&idx) = self.by_id.get(&field.id) {
            self.fields[idx] = field;
        } else {
            self.by_id.insert(field.id.clone(), self.fields.len());
            self.fields.push(field);
        }
        self.rebuild_link_index();
    }

    pub fn remove_field(&mut self, field_id: &str) -> Option<Field> {
        let idx = self.by_id.remove(field_id)?;
        let removed = self.fields.remove(idx);
        self.by_id = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.id.clone(), i))
            .collect();
        self.rebuild_link_index();
        Some(removed)
    }

    fn rebuild_link_index(&mut self) {
        self.by_link_target.clear();
        for field in &self.fields {
            if let Some(link) = field.link_options() {
                self.by_link_target
                    .entry(link.foreign_table_id.clone())
                    .or_default()
                    .push(field.id.clone());
            }
        }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, field_id: &str) -> Option<&Field> {
        self.by_id.get(field_id).map(|&idx| &self.fields[idx])
    }

    pub fn get_field(&self, field_id: &str) -> Result<&Field> {
        self.field(field_id).ok_or_else(|| {
            CellGraphError::NotFound(format!("field {field_id} in table {}", self.id))
        })
    }

    pub fn has_field(&self, field_id: &str) -> bool {
        self.by_id.contains_key(field_id)
    }

    /// The first field doubles as the record's display title.
    pub fn primary_field(&self) -> Option<&Field> {
        self.fields.first()
    }

    /// Link fields on this table pointing at `foreign_table_id`.
    pub fn link_fields_to(&self, foreign_table_id: &str) -> Vec<&Field> {
        self.by_link_target
            .get(foreign_table_id)
            .map(|ids| ids.iter().filter_map(|id| self.field(id)).collect())
            .unwrap_or_default()
    }

    pub fn link_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.link_options().is_some())
    }
}
