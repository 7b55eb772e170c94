use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::filter::Filter;
use crate::formula::Expr;
use crate::types::{FieldId, TableId};

/// Physical column name holding the record id in every record table.
pub const ID_COLUMN: &str = "__id";
pub const VERSION_COLUMN: &str = "__version";
pub const AUTO_NUMBER_COLUMN: &str = "__auto_number";
pub const CREATED_TIME_COLUMN: &str = "__created_time";
pub const LAST_MODIFIED_TIME_COLUMN: &str = "__last_modified_time";
pub const LAST_MODIFIED_BY_COLUMN: &str = "__last_modified_by";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    SingleLineText,
    LongText,
    Number,
    Checkbox,
    Date,
    User,
    Formula,
    Rollup,
    ConditionalRollup,
    Link,
    AutoNumber,
    CreatedTime,
    LastModifiedTime,
    LastModifiedBy,
}

impl FieldType {
    pub fn default_db_type(self) -> DbFieldType {
        match self {
            FieldType::SingleLineText | FieldType::LongText => DbFieldType::Text,
            FieldType::Number => DbFieldType::Real,
            FieldType::Checkbox => DbFieldType::Boolean,
            FieldType::Date | FieldType::CreatedTime | FieldType::LastModifiedTime => {
                DbFieldType::DateTime
            }
            FieldType::AutoNumber => DbFieldType::Integer,
            FieldType::User
            | FieldType::LastModifiedBy
            | FieldType::Formula
            | FieldType::Rollup
            | FieldType::ConditionalRollup
            | FieldType::Link => DbFieldType::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DbFieldType {
    Text,
    Real,
    Integer,
    Boolean,
    DateTime,
    Json,
}

/// Cardinality of a link relationship, seen from the field that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Relationship {
    OneOne,
    OneMany,
    ManyOne,
    ManyMany,
}

impl Relationship {
    /// OneMany and ManyMany cells hold lists; the other two hold a single link.
    pub fn is_multi_valued(self) -> bool {
        matches!(self, Relationship::OneMany | Relationship::ManyMany)
    }

    /// Cardinality of the paired field on the foreign table.
    pub fn symmetric(self) -> Relationship {
        match self {
            Relationship::OneOne => Relationship::OneOne,
            Relationship::OneMany => Relationship::ManyOne,
            Relationship::ManyOne => Relationship::OneMany,
            Relationship::ManyMany => Relationship::ManyMany,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOptions {
    pub relationship: Relationship,
    pub foreign_table_id: TableId,
    /// Foreign field whose value becomes the link title.
    pub lookup_field_id: FieldId,
    /// Physical table holding the key pair (junction, host or foreign table).
    pub fk_host_table_name: String,
    /// Column in `fk_host_table_name` pointing at this field's own records.
    pub self_key_name: String,
    /// Column in `fk_host_table_name` pointing at the foreign records.
    pub foreign_key_name: String,
    #[serde(default)]
    pub symmetric_field_id: Option<FieldId>,
    #[serde(default)]
    pub order_column_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupOptions {
    pub foreign_table_id: TableId,
    pub lookup_field_id: FieldId,
    /// Absent for conditional lookups and conditional rollups.
    #[serde(default)]
    pub link_field_id: Option<FieldId>,
    #[serde(default)]
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FieldOptions {
    Plain,
    Link(LinkOptions),
    Formula {
        expression: Expr,
    },
    Rollup {
        aggregate: Aggregate,
    },
    ConditionalRollup {
        aggregate: Aggregate,
    },
    AutoNumber,
    CreatedTime,
    LastModifiedTime {
        #[serde(default)]
        tracked_field_ids: Vec<FieldId>,
    },
    LastModifiedBy {
        #[serde(default)]
        tracked_field_ids: Vec<FieldId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: FieldId,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub db_field_name: String,
    pub db_field_type: DbFieldType,
    #[serde(default)]
    pub is_computed: bool,
    #[serde(default)]
    pub is_lookup: bool,
    #[serde(default)]
    pub is_conditional_lookup: bool,
    #[serde(default)]
    pub is_multiple_cell_value: bool,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub unique: bool,
    pub options: FieldOptions,
    #[serde(default)]
    pub lookup_options: Option<LookupOptions>,
}

impl Field {
    pub fn new<I: Into<FieldId>, N: Into<String>>(id: I, name: N, field_type: FieldType) -> Self {
        let id = id.into();
        let options = match field_type {
            FieldType::AutoNumber => FieldOptions::AutoNumber,
            FieldType::CreatedTime => FieldOptions::CreatedTime,
            FieldType::LastModifiedTime => FieldOptions::LastModifiedTime {
                tracked_field_ids: Vec::new(),
            },
            FieldType::LastModifiedBy => FieldOptions::LastModifiedBy {
                tracked_field_ids: Vec::new(),
            },
            _ => FieldOptions::Plain,
        };
        Self {
            db_field_name: id.clone(),
            id,
            name: name.into(),
            field_type,
            db_field_type: field_type.default_db_type(),
            is_computed: !matches!(
                field_type,
                FieldType::SingleLineText
                    | FieldType::LongText
                    | FieldType::Number
                    | FieldType::Checkbox
                    | FieldType::Date
                    | FieldType::User
                    | FieldType::Link
            ),
            is_lookup: false,
            is_conditional_lookup: false,
            is_multiple_cell_value: false,
            not_null: false,
            unique: false,
            options,
            lookup_options: None,
        }
    }

    pub fn formula<I: Into<FieldId>, N: Into<String>>(id: I, name: N, expression: Expr) -> Self {
        Self::new(id, name, FieldType::Formula).with_options(FieldOptions::Formula { expression })
    }

    pub fn link<I: Into<FieldId>, N: Into<String>>(id: I, name: N, options: LinkOptions) -> Self {
        let multi = options.relationship.is_multi_valued();
        let mut field = Self::new(id, name, FieldType::Link).with_options(FieldOptions::Link(options));
        field.is_multiple_cell_value = multi;
        field
    }

    pub fn rollup<I: Into<FieldId>, N: Into<String>>(
        id: I,
        name: N,
        aggregate: Aggregate,
        lookup: LookupOptions,
    ) -> Self {
        let conditional = lookup.link_field_id.is_none();
        let (field_type, options) = if conditional {
            (FieldType::ConditionalRollup, FieldOptions::ConditionalRollup { aggregate })
        } else {
            (FieldType::Rollup, FieldOptions::Rollup { aggregate })
        };
        let mut field = Self::new(id, name, field_type).with_options(options);
        field.lookup_options = Some(lookup);
        field
    }

    /// A lookup field; `field_type` is the type of the looked-up field.
    pub fn lookup<I: Into<FieldId>, N: Into<String>>(
        id: I,
        name: N,
        field_type: FieldType,
        lookup: LookupOptions,
    ) -> Self {
        let mut field = Self::new(id, name, field_type);
        field.db_field_type = DbFieldType::Json;
        field.is_computed = true;
        field.is_lookup = true;
        field.is_conditional_lookup = lookup.link_field_id.is_none();
        field.is_multiple_cell_value = true;
        field.options = FieldOptions::Plain;
        field.lookup_options = Some(lookup);
        field
    }

    pub fn with_options(mut self, options: FieldOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_db_field_name(mut self, name: impl Into<String>) -> Self {
        self.db_field_name = name.into();
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn link_options(&self) -> Option<&LinkOptions> {
        match &self.options {
            FieldOptions::Link(options) => Some(options),
            _ => None,
        }
    }

    pub fn lookup_options(&self) -> Option<&LookupOptions> {
        self.lookup_options.as_ref()
    }

    /// Fields whose values flow through the static reference graph.
    pub fn is_computed_classified(&self) -> bool {
        self.is_lookup
            || matches!(
                self.field_type,
                FieldType::Formula | FieldType::Rollup | FieldType::ConditionalRollup | FieldType::Link
            )
    }

    pub fn is_audit(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::LastModifiedTime | FieldType::LastModifiedBy
        ) && !self.is_lookup
    }

    /// Whether storage can derive this field's value from other state.
    pub fn is_derived(&self) -> bool {
        self.is_computed_classified()
            || (!self.is_lookup
                && matches!(
                    self.field_type,
                    FieldType::AutoNumber
                        | FieldType::CreatedTime
                        | FieldType::LastModifiedTime
                        | FieldType::LastModifiedBy
                ))
    }

    /// Rollups and lookups whose foreign rows are picked by a filter instead of a link.
    pub fn is_conditional(&self) -> bool {
        self.is_conditional_lookup || self.field_type == FieldType::ConditionalRollup
    }

    /// Audit fields: the tracked field ids (empty tracks every field).
    pub fn tracked_field_ids(&self) -> Option<&[FieldId]> {
        match &self.options {
            FieldOptions::LastModifiedTime { tracked_field_ids }
            | FieldOptions::LastModifiedBy { tracked_field_ids } => Some(tracked_field_ids),
            _ => None,
        }
    }

    pub fn formula_expression(&self) -> Option<&Expr> {
        match &self.options {
            FieldOptions::Formula { expression } => Some(expression),
            _ => None,
        }
    }

    pub fn aggregate(&self) -> Option<Aggregate> {
        match &self.options {
            FieldOptions::Rollup { aggregate } | FieldOptions::ConditionalRollup { aggregate } => {
                Some(*aggregate)
            }
            _ => None,
        }
    }

    /// Checks that type-specific options are well formed.
    pub fn validate_options(&self) -> std::result::Result<(), String> {
        match self.field_type {
            FieldType::Link if !self.is_lookup => {
                let options = self
                    .link_options()
                    .ok_or_else(|| format!("link field {} has no link options", self.id))?;
                if options.fk_host_table_name.is_empty()
                    || options.self_key_name.is_empty()
                    || options.foreign_key_name.is_empty()
                {
                    return Err(format!("link field {} has incomplete key columns", self.id));
                }
                if options.self_key_name == options.foreign_key_name {
                    return Err(format!("link field {} uses one column for both keys", self.id));
                }
            }
            FieldType::Formula if !self.is_lookup => {
                if self.formula_expression().is_none() {
                    return Err(format!("formula field {} has no expression", self.id));
                }
            }
            FieldType::Rollup | FieldType::ConditionalRollup if !self.is_lookup => {
                if self.aggregate().is_none() {
                    return Err(format!("rollup field {} has no aggregate", self.id));
                }
            }
            _ => {}
        }
        if self.is_lookup || matches!(self.field_type, FieldType::Rollup | FieldType::ConditionalRollup) {
            let lookup = self
                .lookup_options()
                .ok_or_else(|| format!("field {} has no lookup options", self.id))?;
            if self.is_conditional() && lookup.filter.is_none() {
                return Err(format!("conditional field {} has no filter", self.id));
            }
            if !self.is_conditional() && lookup.link_field_id.is_none() {
                return Err(format!("lookup field {} has no link field", self.id));
            }
        }
        Ok(())
    }

    /// Field ids this field reads, own table and foreign tables alike.
    pub fn referenced_field_ids(&self) -> Vec<FieldId> {
        let mut refs = Vec::new();
        if let Some(expr) = self.formula_expression() {
            refs.extend(expr.field_refs());
        }
        if let Some(link) = self.link_options() {
            refs.push(link.lookup_field_id.clone());
        }
        if let Some(lookup) = self.lookup_options() {
            if let Some(link_field_id) = &lookup.link_field_id {
                refs.push(link_field_id.clone());
            }
            refs.push(lookup.lookup_field_id.clone());
            if let Some(filter) = &lookup.filter {
                refs.extend(filter.foreign_field_ids());
                refs.extend(filter.host_field_ids());
            }
        }
        if let Some(tracked) = self.tracked_field_ids() {
            refs.extend(tracked.iter().cloned());
        }
        refs.sort();
        refs.dedup();
        refs.retain(|id| id != &self.id);
        refs
    }

    /// Logical → physical conversion.
    pub fn to_db_value(&self, value: &Value) -> Value {
        match (self.db_field_type, value) {
            (DbFieldType::Boolean, Value::Bool(b)) => Value::from(i64::from(*b)),
            (DbFieldType::Boolean, Value::Null) => Value::Null,
            _ => value.clone(),
        }
    }

    /// Physical → logical conversion.
    pub fn from_db_value(&self, value: &Value) -> Value {
        match (self.db_field_type, value) {
            (DbFieldType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
            _ => value.clone(),
        }
    }
}
