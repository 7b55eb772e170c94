//! Filter predicates for conditional rollups and lookups.
//!
//! Conditions always name a field of the foreign table. Their comparison value is
//! either a literal or a field of the host record that owns the conditional field.
//! [`Filter::bind_foreign`] turns a filter plus one concrete foreign row into a
//! [`HostPredicate`] storage can run against the host table.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{compare_values, is_empty_value, value_to_text, values_equal, FieldId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Conjunction {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Is,
    IsNot,
    Contains,
    DoesNotContain,
    IsGreater,
    IsGreaterEqual,
    IsLess,
    IsLessEqual,
    IsEmpty,
    IsNotEmpty,
    IsAnyOf,
    IsNoneOf,
}

impl FilterOperator {
    /// The operator with its operands swapped, if one exists.
    pub fn mirrored(self) -> Option<FilterOperator> {
        use FilterOperator::*;
        match self {
            Is => Some(Is),
            IsNot => Some(IsNot),
            IsGreater => Some(IsLess),
            IsGreaterEqual => Some(IsLessEqual),
            IsLess => Some(IsGreater),
            IsLessEqual => Some(IsGreaterEqual),
            IsEmpty => Some(IsEmpty),
            IsNotEmpty => Some(IsNotEmpty),
            Contains | DoesNotContain | IsAnyOf | IsNoneOf => None,
        }
    }

    pub fn takes_value(self) -> bool {
        !matches!(self, FilterOperator::IsEmpty | FilterOperator::IsNotEmpty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum FilterValue {
    Literal(Value),
    HostField(FieldId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCondition {
    pub field_id: FieldId,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<FilterValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterItem {
    Condition(FilterCondition),
    Group(Filter),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub conjunction: Conjunction,
    pub items: Vec<FilterItem>,
}

/// A filter shape that cannot be bound to a concrete foreign row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedFilter(pub String);

impl Filter {
    pub fn and(items: Vec<FilterItem>) -> Self {
        Self {
            conjunction: Conjunction::And,
            items,
        }
    }

    pub fn or(items: Vec<FilterItem>) -> Self {
        Self {
            conjunction: Conjunction::Or,
            items,
        }
    }

    pub fn condition(field_id: impl Into<FieldId>, operator: FilterOperator, value: Value) -> FilterItem {
        FilterItem::Condition(FilterCondition {
            field_id: field_id.into(),
            operator,
            value: Some(FilterValue::Literal(value)),
        })
    }

    pub fn host_condition(
        field_id: impl Into<FieldId>,
        operator: FilterOperator,
        host_field_id: impl Into<FieldId>,
    ) -> FilterItem {
        FilterItem::Condition(FilterCondition {
            field_id: field_id.into(),
            operator,
            value: Some(FilterValue::HostField(host_field_id.into())),
        })
    }

    fn conditions(&self) -> Vec<&FilterCondition> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(filter) = stack.pop() {
            for item in &filter.items {
                match item {
                    FilterItem::Condition(c) => out.push(c),
                    FilterItem::Group(g) => stack.push(g),
                }
            }
        }
        out
    }

    pub fn foreign_field_ids(&self) -> BTreeSet<FieldId> {
        self.conditions().into_iter().map(|c| c.field_id.clone()).collect()
    }

    pub fn host_field_ids(&self) -> BTreeSet<FieldId> {
        self.conditions()
            .into_iter()
            .filter_map(|c| match &c.value {
                Some(FilterValue::HostField(id)) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_host_references(&self) -> bool {
        !self.host_field_ids().is_empty()
    }

    /// Evaluates the filter for one (foreign row, host row) pair.
    pub fn matches(&self, foreign: &dyn Fn(&str) -> Value, host: &dyn Fn(&str) -> Value) -> bool {
        let mut results = self.items.iter().map(|item| match item {
            FilterItem::Condition(c) => {
                let left = foreign(&c.field_id);
                let right = match &c.value {
                    None => None,
                    Some(FilterValue::Literal(v)) => Some(v.clone()),
                    Some(FilterValue::HostField(id)) => Some(host(id)),
                };
                apply_operator(c.operator, &left, right.as_ref())
            }
            FilterItem::Group(g) => g.matches(foreign, host),
        });
        match self.conjunction {
            Conjunction::And => results.all(|m| m),
            Conjunction::Or => results.any(|m| m),
        }
    }

    /// Substitutes a concrete foreign row, leaving a predicate over host fields.
    pub fn bind_foreign(
        &self,
        foreign: &dyn Fn(&str) -> Value,
    ) -> Result<HostPredicate, UnsupportedFilter> {
        let mut parts = Vec::with_capacity(self.items.len());
        for item in &self.items {
            let part = match item {
                FilterItem::Group(g) => g.bind_foreign(foreign)?,
                FilterItem::Condition(c) => match &c.value {
                    None => HostPredicate::Const(apply_operator(c.operator, &foreign(&c.field_id), None)),
                    Some(FilterValue::Literal(v)) => HostPredicate::Const(apply_operator(
                        c.operator,
                        &foreign(&c.field_id),
                        Some(v),
                    )),
                    Some(FilterValue::HostField(host_field)) => {
                        bind_host_condition(c, host_field, foreign(&c.field_id))?
                    }
                },
            };
            parts.push(part);
        }
        Ok(match self.conjunction {
            Conjunction::And => HostPredicate::And(parts),
            Conjunction::Or => HostPredicate::Or(parts),
        }
        .simplify())
    }
}

fn bind_host_condition(
    condition: &FilterCondition,
    host_field: &str,
    foreign_value: Value,
) -> Result<HostPredicate, UnsupportedFilter> {
    let mirrored = condition.operator.mirrored().ok_or_else(|| {
        UnsupportedFilter(format!(
            "operator {:?} on {} cannot be mirrored onto host field {host_field}",
            condition.operator, condition.field_id
        ))
    })?;
    if foreign_value.is_array() {
        return Err(UnsupportedFilter(format!(
            "list value in {} compared against host field {host_field}",
            condition.field_id
        )));
    }
    if is_empty_value(&foreign_value) {
        return Ok(match condition.operator {
            FilterOperator::Is => HostPredicate::condition(host_field, FilterOperator::IsEmpty, Value::Null),
            FilterOperator::IsNot => {
                HostPredicate::condition(host_field, FilterOperator::IsNotEmpty, Value::Null)
            }
            FilterOperator::IsEmpty => HostPredicate::Const(true),
            FilterOperator::IsNotEmpty => HostPredicate::Const(false),
            _ => HostPredicate::Const(false),
        });
    }
    Ok(match condition.operator {
        FilterOperator::IsEmpty => HostPredicate::Const(false),
        FilterOperator::IsNotEmpty => HostPredicate::Const(true),
        _ => HostPredicate::condition(host_field, mirrored, foreign_value),
    })
}

/// Predicate over the fields of one host table.
#[derive(Debug, Clone, PartialEq)]
pub enum HostPredicate {
    Const(bool),
    Condition {
        field_id: FieldId,
        operator: FilterOperator,
        value: Value,
    },
    And(Vec<HostPredicate>),
    Or(Vec<HostPredicate>),
}

impl HostPredicate {
    pub fn condition(field_id: impl Into<FieldId>, operator: FilterOperator, value: Value) -> Self {
        Self::Condition {
            field_id: field_id.into(),
            operator,
            value,
        }
    }

    pub fn as_const(&self) -> Option<bool> {
        match self {
            HostPredicate::Const(b) => Some(*b),
            _ => None,
        }
    }

    pub fn matches(&self, host: &dyn Fn(&str) -> Value) -> bool {
        match self {
            HostPredicate::Const(b) => *b,
            HostPredicate::Condition {
                field_id,
                operator,
                value,
            } => apply_operator(*operator, &host(field_id), Some(value)),
            HostPredicate::And(parts) => parts.iter().all(|p| p.matches(host)),
            HostPredicate::Or(parts) => parts.iter().any(|p| p.matches(host)),
        }
    }

    pub fn field_ids(&self) -> BTreeSet<FieldId> {
        let mut out = BTreeSet::new();
        let mut stack = vec![self];
        while let Some(p) = stack.pop() {
            match p {
                HostPredicate::Condition { field_id, .. } => {
                    out.insert(field_id.clone());
                }
                HostPredicate::And(parts) | HostPredicate::Or(parts) => stack.extend(parts.iter()),
                HostPredicate::Const(_) => {}
            }
        }
        out
    }

    /// Folds constants out of conjunctions and disjunctions.
    pub fn simplify(self) -> Self {
        match self {
            HostPredicate::And(parts) => {
                let mut kept = Vec::new();
                for part in parts.into_iter().map(HostPredicate::simplify) {
                    match part.as_const() {
                        Some(false) => return HostPredicate::Const(false),
                        Some(true) => {}
                        None => kept.push(part),
                    }
                }
                match kept.len() {
                    0 => HostPredicate::Const(true),
                    1 => kept.remove(0),
                    _ => HostPredicate::And(kept),
                }
            }
            HostPredicate::Or(parts) => {
                let mut kept = Vec::new();
                for part in parts.into_iter().map(HostPredicate::simplify) {
                    match part.as_const() {
                        Some(true) => return HostPredicate::Const(true),
                        Some(false) => {}
                        None => kept.push(part),
                    }
                }
                match kept.len() {
                    0 => HostPredicate::Const(false),
                    1 => kept.remove(0),
                    _ => HostPredicate::Or(kept),
                }
            }
            other => other,
        }
    }
}

fn candidates(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items
            .iter()
            .flat_map(|item| match item {
                Value::Object(map) => {
                    let mut out = Vec::new();
                    if let Some(id) = map.get("id") {
                        out.push(id.clone());
                    }
                    if let Some(title) = map.get("title") {
                        out.push(title.clone());
                    }
                    out
                }
                other => vec![other.clone()],
            })
            .collect(),
        Value::Object(map) => {
            let mut out = Vec::new();
            if let Some(id) = map.get("id") {
                out.push(id.clone());
            }
            if let Some(title) = map.get("title") {
                out.push(title.clone());
            }
            out
        }
        other => vec![other.clone()],
    }
}

fn any_ordering(left: &Value, right: &Value, accept: &[Ordering]) -> bool {
    if is_empty_value(left) || is_empty_value(right) {
        return false;
    }
    candidates(left)
        .iter()
        .any(|c| matches!(compare_values(c, right), Some(o) if accept.contains(&o)))
}

fn value_is(left: &Value, right: &Value) -> bool {
    if is_empty_value(right) {
        return is_empty_value(left);
    }
    if is_empty_value(left) {
        return false;
    }
    candidates(left).iter().any(|c| values_equal(c, right))
}

fn value_in(left: &Value, right: &Value) -> bool {
    let options: Vec<Value> = match right {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    candidates(left)
        .iter()
        .any(|c| options.iter().any(|o| values_equal(c, o)))
}

/// Applies `operator` with the field value on the left.
///
/// A missing comparison value leaves the condition inert (it matches).
pub fn apply_operator(operator: FilterOperator, left: &Value, right: Option<&Value>) -> bool {
    use FilterOperator::*;
    match operator {
        IsEmpty => return is_empty_value(left),
        IsNotEmpty => return !is_empty_value(left),
        _ => {}
    }
    let Some(right) = right else {
        return true;
    };
    match operator {
        Is => value_is(left, right),
        IsNot => !value_is(left, right),
        Contains => value_to_text(left)
            .to_lowercase()
            .contains(&value_to_text(right).to_lowercase()),
        DoesNotContain => !value_to_text(left)
            .to_lowercase()
            .contains(&value_to_text(right).to_lowercase()),
        IsGreater => any_ordering(left, right, &[Ordering::Greater]),
        IsGreaterEqual => any_ordering(left, right, &[Ordering::Greater, Ordering::Equal]),
        IsLess => any_ordering(left, right, &[Ordering::Less]),
        IsLessEqual => any_ordering(left, right, &[Ordering::Less, Ordering::Equal]),
        IsAnyOf => value_in(left, right),
        IsNoneOf => !value_in(left, right),
        IsEmpty => is_empty_value(left),
        IsNotEmpty => !is_empty_value(left),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn row(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn literal_filter_matches_rows() {
        let filter = Filter::and(vec![Filter::condition("fld_amount", FilterOperator::IsGreater, json!(100))]);
        let big = row(&[("fld_amount", json!(150))]);
        let small = row(&[("fld_amount", json!(50))]);
        let none = |_: &str| Value::Null;
        assert!(filter.matches(&|id| big.get(id).cloned().unwrap_or(Value::Null), &none));
        assert!(!filter.matches(&|id| small.get(id).cloned().unwrap_or(Value::Null), &none));
        assert!(!filter.has_host_references());
    }

    #[test]
    fn binding_mirrors_comparison_operators() {
        let filter = Filter::and(vec![
            Filter::condition("fld_amount", FilterOperator::IsGreater, json!(10)),
            Filter::host_condition("fld_amount", FilterOperator::IsGreater, "fld_min"),
        ]);
        let foreign = row(&[("fld_amount", json!(40))]);
        let bound = filter
            .bind_foreign(&|id| foreign.get(id).cloned().unwrap_or(Value::Null))
            .unwrap();
        assert_eq!(
            bound,
            HostPredicate::condition("fld_min", FilterOperator::IsLess, json!(40))
        );
        assert!(bound.matches(&|_| json!(30)));
        assert!(!bound.matches(&|_| json!(40)));
    }

    #[test]
    fn binding_folds_failed_literals() {
        let filter = Filter::and(vec![
            Filter::condition("fld_amount", FilterOperator::IsGreater, json!(100)),
            Filter::host_condition("fld_customer", FilterOperator::Is, "fld_name"),
        ]);
        let foreign = row(&[("fld_amount", json!(5)), ("fld_customer", json!("Ada"))]);
        let bound = filter
            .bind_foreign(&|id| foreign.get(id).cloned().unwrap_or(Value::Null))
            .unwrap();
        assert_eq!(bound, HostPredicate::Const(false));
    }

    #[test]
    fn contains_against_host_field_is_unsupported() {
        let filter = Filter::and(vec![Filter::host_condition(
            "fld_tags",
            FilterOperator::Contains,
            "fld_name",
        )]);
        assert!(filter.bind_foreign(&|_| json!("x")).is_err());
    }

    #[test]
    fn link_cells_match_by_id_or_title() {
        let cell = json!([{"id": "rec1", "title": "Ada"}]);
        assert!(apply_operator(FilterOperator::Is, &cell, Some(&json!("Ada"))));
        assert!(apply_operator(FilterOperator::IsAnyOf, &cell, Some(&json!(["rec1", "rec9"]))));
        assert!(apply_operator(FilterOperator::IsNoneOf, &cell, Some(&json!(["rec9"]))));
    }
}
