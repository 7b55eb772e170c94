//! Physical layouts for link fields, per cardinality.

use cellgraph_core::{Field, FieldId, LinkOptions, Relationship, Result, TableId, ID_COLUMN};

use crate::store::MemoryTransaction;

#[derive(Debug, Clone)]
pub struct SymmetricSpec {
    pub field_id: FieldId,
    /// Host field used as the title of the mirrored links.
    pub title_field_id: FieldId,
}

/// Describes a link field from a host table to a foreign table.
#[derive(Debug, Clone)]
pub struct LinkSpec {
    pub relationship: Relationship,
    pub host_table_id: TableId,
    pub host_db_table: String,
    pub field_id: FieldId,
    pub foreign_table_id: TableId,
    pub foreign_db_table: String,
    pub foreign_title_field_id: FieldId,
    pub symmetric: Option<SymmetricSpec>,
}

/// Field definitions produced for a [`LinkSpec`].
#[derive(Debug, Clone)]
pub struct LinkLayout {
    pub field: Field,
    pub symmetric: Option<Field>,
    pub junction: Option<String>,
}

struct Keys {
    host: String,
    self_key: String,
    foreign_key: String,
    order: Option<String>,
}

impl LinkSpec {
    pub fn new(
        relationship: Relationship,
        host: (&str, &str),
        field_id: &str,
        foreign: (&str, &str),
        foreign_title_field_id: &str,
    ) -> Self {
        Self {
            relationship,
            host_table_id: host.0.to_string(),
            host_db_table: host.1.to_string(),
            field_id: field_id.to_string(),
            foreign_table_id: foreign.0.to_string(),
            foreign_db_table: foreign.1.to_string(),
            foreign_title_field_id: foreign_title_field_id.to_string(),
            symmetric: None,
        }
    }

    pub fn symmetric(mut self, field_id: &str, title_field_id: &str) -> Self {
        self.symmetric = Some(SymmetricSpec {
            field_id: field_id.to_string(),
            title_field_id: title_field_id.to_string(),
        });
        self
    }

    pub fn layout(&self) -> LinkLayout {
        let f = &self.field_id;
        let sym = self.symmetric.as_ref().map(|s| s.field_id.as_str());
        let host_key = match sym {
            Some(g) => format!("__fk_{g}"),
            None => format!("__fk_self_{f}"),
        };
        let junction_name = format!("junction_{f}");

        // (forward keys, mirrored keys, junction)
        let (forward, mirrored, junction) = match (self.relationship, sym) {
            (Relationship::ManyMany, _) | (Relationship::OneMany, None) => (
                Keys {
                    host: junction_name.clone(),
                    self_key: host_key.clone(),
                    foreign_key: format!("__fk_{f}"),
                    order: Some(format!("__order_{f}")),
                },
                sym.map(|g| Keys {
                    host: junction_name.clone(),
                    self_key: format!("__fk_{f}"),
                    foreign_key: host_key.clone(),
                    order: Some(format!("__order_{g}")),
                }),
                Some(junction_name),
            ),
            (Relationship::OneMany, Some(g)) => (
                Keys {
                    host: self.foreign_db_table.clone(),
                    self_key: format!("__fk_{g}"),
                    foreign_key: ID_COLUMN.to_string(),
                    order: Some(format!("__order_{f}")),
                },
                Some(Keys {
                    host: self.foreign_db_table.clone(),
                    self_key: ID_COLUMN.to_string(),
                    foreign_key: format!("__fk_{g}"),
                    order: None,
                }),
                None,
            ),
            (Relationship::ManyOne, _) | (Relationship::OneOne, _) => (
                Keys {
                    host: self.host_db_table.clone(),
                    self_key: ID_COLUMN.to_string(),
                    foreign_key: format!("__fk_{f}"),
                    order: None,
                },
                sym.map(|g| Keys {
                    host: self.host_db_table.clone(),
                    self_key: format!("__fk_{f}"),
                    foreign_key: ID_COLUMN.to_string(),
                    order: (self.relationship == Relationship::ManyOne)
                        .then(|| format!("__order_{g}")),
                }),
                None,
            ),
        };

        let field = Field::link(
            f.clone(),
            f.clone(),
            LinkOptions {
                relationship: self.relationship,
                foreign_table_id: self.foreign_table_id.clone(),
                lookup_field_id: self.foreign_title_field_id.clone(),
                fk_host_table_name: forward.host,
                self_key_name: forward.self_key,
                foreign_key_name: forward.foreign_key,
                symmetric_field_id: sym.map(str::to_string),
                order_column_name: forward.order,
            },
        );
        let symmetric = match (&self.symmetric, mirrored) {
            (Some(spec), Some(keys)) => Some(Field::link(
                spec.field_id.clone(),
                spec.field_id.clone(),
                LinkOptions {
                    relationship: self.relationship.symmetric(),
                    foreign_table_id: self.host_table_id.clone(),
                    lookup_field_id: spec.title_field_id.clone(),
                    fk_host_table_name: keys.host,
                    self_key_name: keys.self_key,
                    foreign_key_name: keys.foreign_key,
                    symmetric_field_id: Some(f.clone()),
                    order_column_name: keys.order,
                },
            )),
            _ => None,
        };
        LinkLayout {
            field,
            symmetric,
            junction,
        }
    }
}

impl MemoryTransaction {
    /// Creates the link field, its symmetric counterpart and any junction table.
    pub fn create_link(&self, spec: &LinkSpec) -> Result<LinkLayout> {
        let layout = spec.layout();
        self.create_field(&spec.host_table_id, layout.field.clone())?;
        if let Some(symmetric) = &layout.symmetric {
            self.create_field(&spec.foreign_table_id, symmetric.clone())?;
        }
        Ok(layout)
    }
}
