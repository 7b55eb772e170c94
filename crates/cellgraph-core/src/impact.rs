//! Impact map: per-table record of fields and records requiring recomputation.
//!
//! All mutation goes through monotonic operations. Field and record sets only
//! grow, and once a table is marked [`RecordSet::All`] it stays that way for the
//! rest of the pass.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{FieldId, RecordId, TableId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSet {
    All,
    Ids(BTreeSet<RecordId>),
}

impl Default for RecordSet {
    fn default() -> Self {
        RecordSet::Ids(BTreeSet::new())
    }
}

impl RecordSet {
    pub fn is_all(&self) -> bool {
        matches!(self, RecordSet::All)
    }

    pub fn ids(&self) -> Option<&BTreeSet<RecordId>> {
        match self {
            RecordSet::All => None,
            RecordSet::Ids(ids) => Some(ids),
        }
    }

    /// `None` for the ALL sentinel.
    pub fn len(&self) -> Option<usize> {
        self.ids().map(BTreeSet::len)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RecordSet::Ids(ids) if ids.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpactGroup {
    field_ids: BTreeSet<FieldId>,
    records: RecordSet,
    prefer_all: bool,
}

impl ImpactGroup {
    pub fn field_ids(&self) -> &BTreeSet<FieldId> {
        &self.field_ids
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    pub fn prefer_all(&self) -> bool {
        self.prefer_all
    }

    pub fn is_all(&self) -> bool {
        self.records.is_all()
    }

    /// Returns true when the field set grew.
    pub fn add_fields<I: IntoIterator<Item = FieldId>>(&mut self, ids: I) -> bool {
        let before = self.field_ids.len();
        self.field_ids.extend(ids);
        self.field_ids.len() > before
    }

    /// Returns true when the record set grew. No-op once ALL.
    pub fn add_records<I: IntoIterator<Item = RecordId>>(&mut self, ids: I) -> bool {
        match &mut self.records {
            RecordSet::All => false,
            RecordSet::Ids(set) => {
                let before = set.len();
                set.extend(ids);
                set.len() > before
            }
        }
    }

    /// Returns true when this call switched the group to ALL.
    pub fn mark_all(&mut self) -> bool {
        self.prefer_all = true;
        if self.records.is_all() {
            return false;
        }
        self.records = RecordSet::All;
        true
    }

    pub fn set_prefer_all(&mut self) {
        self.prefer_all = true;
    }

    pub fn merge(&mut self, other: ImpactGroup) -> bool {
        let mut grew = self.add_fields(other.field_ids);
        if other.prefer_all {
            self.prefer_all = true;
        }
        grew |= match other.records {
            RecordSet::All => self.mark_all(),
            RecordSet::Ids(ids) => self.add_records(ids),
        };
        grew
    }

    /// Number of records when explicit; `None` for ALL.
    pub fn record_count(&self) -> Option<usize> {
        self.records.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpactMap {
    groups: BTreeMap<TableId, ImpactGroup>,
}

impl ImpactMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(&self, table_id: &str) -> Option<&ImpactGroup> {
        self.groups.get(table_id)
    }

    pub fn group_mut(&mut self, table_id: &str) -> &mut ImpactGroup {
        self.groups.entry(table_id.to_string()).or_default()
    }

    pub fn groups(&self) -> impl Iterator<Item = (&TableId, &ImpactGroup)> {
        self.groups.iter()
    }

    pub fn table_ids(&self) -> Vec<TableId> {
        self.groups.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn contains_table(&self, table_id: &str) -> bool {
        self.groups.contains_key(table_id)
    }

    pub fn all_field_ids(&self) -> BTreeSet<FieldId> {
        self.groups
            .values()
            .flat_map(|g| g.field_ids.iter().cloned())
            .collect()
    }

    /// Union with another map; ALL stays sticky.
    pub fn merge(&mut self, other: ImpactMap) -> bool {
        let mut grew = false;
        for (table_id, group) in other.groups {
            grew |= self.group_mut(&table_id).merge(group);
        }
        grew
    }

    /// Drops groups with nothing to evaluate.
    pub fn prune(&mut self) {
        self.groups.retain(|_, group| {
            !group.field_ids.is_empty() && (!group.records.is_empty() || group.prefer_all)
        });
    }

    pub fn summary(&self) -> ImpactSummary {
        ImpactSummary {
            tables: self
                .groups
                .iter()
                .map(|(table_id, group)| {
                    (
                        table_id.clone(),
                        TableImpact {
                            field_ids: group.field_ids.iter().cloned().collect(),
                            record_count: group.record_count(),
                            all_records: group.is_all(),
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableImpact {
    pub field_ids: Vec<FieldId>,
    pub record_count: Option<usize>,
    pub all_records: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactSummary {
    pub tables: BTreeMap<TableId, TableImpact>,
}

impl ImpactSummary {
    pub fn table(&self, table_id: &str) -> Option<&TableImpact> {
        self.tables.get(table_id)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
