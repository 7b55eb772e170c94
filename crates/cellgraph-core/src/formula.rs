use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{as_number, is_empty_value, number_value, value_to_text, values_equal, FieldId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Concat,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Function {
    If,
    Concatenate,
    Upper,
    Lower,
    Len,
    Sum,
    Round,
    Abs,
    Blank,
    RecordId,
}

/// Formula expression tree. Parsing formula text into this shape happens upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "camelCase")]
pub enum Expr {
    Literal {
        value: Value,
    },
    Field {
        field_id: FieldId,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

/// Row access used while evaluating a formula.
pub trait RowContext {
    fn record_id(&self) -> &str;
    fn value(&self, field_id: &str) -> Value;
}

impl Expr {
    pub fn literal(value: Value) -> Self {
        Expr::Literal { value }
    }

    pub fn field(field_id: impl Into<FieldId>) -> Self {
        Expr::Field {
            field_id: field_id.into(),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn call(function: Function, args: Vec<Expr>) -> Self {
        Expr::Call { function, args }
    }

    pub fn field_refs(&self) -> Vec<FieldId> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            match expr {
                Expr::Literal { .. } => {}
                Expr::Field { field_id } => out.push(field_id.clone()),
                Expr::Binary { left, right, .. } => {
                    stack.push(left);
                    stack.push(right);
                }
                Expr::Call { args, .. } => stack.extend(args.iter()),
            }
        }
        out.sort();
        out.dedup();
        out
    }

    pub fn evaluate(&self, row: &dyn RowContext) -> Value {
        match self {
            Expr::Literal { value } => value.clone(),
            Expr::Field { field_id } => row.value(field_id),
            Expr::Binary { op, left, right } => {
                eval_binary(*op, left.evaluate(row), right.evaluate(row))
            }
            Expr::Call { function, args } => eval_call(*function, args, row),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(_) => as_number(value).map(|n| n != 0.0).unwrap_or(false),
        other => !is_empty_value(other),
    }
}

fn arithmetic(left: &Value, right: &Value, f: impl Fn(f64, f64) -> Option<f64>) -> Value {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => f(a, b).map(number_value).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> Value {
    use std::cmp::Ordering;
    let ordering = || crate::types::compare_values(&left, &right);
    match op {
        BinaryOp::Add => arithmetic(&left, &right, |a, b| Some(a + b)),
        BinaryOp::Sub => arithmetic(&left, &right, |a, b| Some(a - b)),
        BinaryOp::Mul => arithmetic(&left, &right, |a, b| Some(a * b)),
        BinaryOp::Div => arithmetic(&left, &right, |a, b| (b != 0.0).then(|| a / b)),
        BinaryOp::Concat => Value::String(format!("{}{}", value_to_text(&left), value_to_text(&right))),
        BinaryOp::Eq => Value::Bool(values_equal(&left, &right)),
        BinaryOp::Neq => Value::Bool(!values_equal(&left, &right)),
        BinaryOp::Gt => Value::Bool(ordering() == Some(Ordering::Greater)),
        BinaryOp::Gte => Value::Bool(matches!(ordering(), Some(Ordering::Greater | Ordering::Equal))),
        BinaryOp::Lt => Value::Bool(ordering() == Some(Ordering::Less)),
        BinaryOp::Lte => Value::Bool(matches!(ordering(), Some(Ordering::Less | Ordering::Equal))),
        BinaryOp::And => Value::Bool(truthy(&left) && truthy(&right)),
        BinaryOp::Or => Value::Bool(truthy(&left) || truthy(&right)),
    }
}

fn flatten_numbers(values: &[Value]) -> Vec<f64> {
    values
        .iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().filter_map(as_number).collect::<Vec<_>>(),
            other => as_number(other).into_iter().collect(),
        })
        .collect()
}

fn eval_call(function: Function, args: &[Expr], row: &dyn RowContext) -> Value {
    let arg = |i: usize| args.get(i).map(|a| a.evaluate(row)).unwrap_or(Value::Null);
    match function {
        Function::If => {
            if truthy(&arg(0)) {
                arg(1)
            } else {
                arg(2)
            }
        }
        Function::Concatenate => Value::String(
            args.iter()
                .map(|a| value_to_text(&a.evaluate(row)))
                .collect::<String>(),
        ),
        Function::Upper => Value::String(value_to_text(&arg(0)).to_uppercase()),
        Function::Lower => Value::String(value_to_text(&arg(0)).to_lowercase()),
        Function::Len => Value::from(value_to_text(&arg(0)).chars().count() as i64),
        Function::Sum => {
            let values: Vec<Value> = args.iter().map(|a| a.evaluate(row)).collect();
            number_value(flatten_numbers(&values).iter().sum())
        }
        Function::Round => {
            let digits = as_number(&arg(1)).unwrap_or(0.0) as i32;
            match as_number(&arg(0)) {
                Some(n) => {
                    let factor = 10f64.powi(digits);
                    number_value((n * factor).round() / factor)
                }
                None => Value::Null,
            }
        }
        Function::Abs => as_number(&arg(0))
            .map(|n| number_value(n.abs()))
            .unwrap_or(Value::Null),
        Function::Blank => Value::Null,
        Function::RecordId => Value::String(row.record_id().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    struct Row(HashMap<&'static str, Value>);

    impl RowContext for Row {
        fn record_id(&self) -> &str {
            "rec1"
        }
        fn value(&self, field_id: &str) -> Value {
            self.0.get(field_id).cloned().unwrap_or(Value::Null)
        }
    }

    #[test]
    fn arithmetic_and_functions() {
        let row = Row(HashMap::from([("fld_a", json!(2)), ("fld_b", json!(3.5))]));
        let expr = Expr::binary(BinaryOp::Mul, Expr::field("fld_a"), Expr::field("fld_b"));
        assert_eq!(expr.evaluate(&row), json!(7));

        let guarded = Expr::call(
            Function::If,
            vec![
                Expr::binary(BinaryOp::Gt, Expr::field("fld_a"), Expr::literal(json!(1))),
                Expr::literal(json!("big")),
                Expr::literal(json!("small")),
            ],
        );
        assert_eq!(guarded.evaluate(&row), json!("big"));
        assert_eq!(
            Expr::call(Function::RecordId, vec![]).evaluate(&row),
            json!("rec1")
        );
    }

    #[test]
    fn missing_operands_yield_null() {
        let row = Row(HashMap::new());
        let expr = Expr::binary(BinaryOp::Add, Expr::field("fld_a"), Expr::literal(json!(1)));
        assert_eq!(expr.evaluate(&row), Value::Null);
        let div = Expr::binary(BinaryOp::Div, Expr::literal(json!(1)), Expr::literal(json!(0)));
        assert_eq!(div.evaluate(&row), Value::Null);
    }

    #[test]
    fn refs_are_sorted_and_unique() {
        let expr = Expr::call(
            Function::Concatenate,
            vec![Expr::field("fld_b"), Expr::field("fld_a"), Expr::field("fld_b")],
        );
        assert_eq!(expr.field_refs(), vec!["fld_a", "fld_b"]);
    }
}
