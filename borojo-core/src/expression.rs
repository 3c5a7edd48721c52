// borojo-core/src/expression.rs
//! Computed expressions used by `$project` and `$group`.
//!
//! An expression is a field reference (`"$precio"`), a literal, an object or
//! array of expressions, or a single operator application
//! (`{"$divide": ["$totalVentas", "$cantidadVentas"]}`).

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::value_utils::number_value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Round,
    ArrayElemAt,
    Month,
    DateFromString,
    Size,
}

impl ExprOp {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$add" => ExprOp::Add,
            "$subtract" => ExprOp::Subtract,
            "$multiply" => ExprOp::Multiply,
            "$divide" => ExprOp::Divide,
            "$round" => ExprOp::Round,
            "$arrayElemAt" => ExprOp::ArrayElemAt,
            "$month" => ExprOp::Month,
            "$dateFromString" => ExprOp::DateFromString,
            "$size" => ExprOp::Size,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            ExprOp::Add => "$add",
            ExprOp::Subtract => "$subtract",
            ExprOp::Multiply => "$multiply",
            ExprOp::Divide => "$divide",
            ExprOp::Round => "$round",
            ExprOp::ArrayElemAt => "$arrayElemAt",
            ExprOp::Month => "$month",
            ExprOp::DateFromString => "$dateFromString",
            ExprOp::Size => "$size",
        }
    }

    /// Accepted argument counts (min, max).
    fn arity(self) -> (usize, usize) {
        match self {
            ExprOp::Add | ExprOp::Multiply => (1, usize::MAX),
            ExprOp::Subtract | ExprOp::Divide | ExprOp::ArrayElemAt => (2, 2),
            ExprOp::Round => (1, 2),
            ExprOp::Month | ExprOp::DateFromString | ExprOp::Size => (1, 1),
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(Value),
    /// Dot path without the leading `$`.
    Field(String),
    Object(Vec<(String, Expression)>),
    Array(Vec<Expression>),
    Operator { op: ExprOp, args: Vec<Expression> },
}

impl Expression {
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                if path.is_empty() || path.starts_with('$') {
                    return Err(StoreError::invalid(format!("invalid field reference '{}'", s)));
                }
                Ok(Expression::Field(path.to_string()))
            }
            Value::Array(items) => Ok(Expression::Array(
                items.iter().map(Expression::from_json).collect::<Result<_>>()?,
            )),
            Value::Object(obj) => Self::from_object(obj),
            other => Ok(Expression::Literal(other.clone())),
        }
    }

    fn from_object(obj: &Map<String, Value>) -> Result<Self> {
        let operator = obj.keys().find(|k| k.starts_with('$'));
        let name = match operator {
            None => {
                let fields = obj
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Expression::from_json(v)?)))
                    .collect::<Result<_>>()?;
                return Ok(Expression::Object(fields));
            }
            Some(name) if obj.len() == 1 => name,
            Some(_) => {
                return Err(StoreError::invalid(
                    "an operator expression must be the only key of its object",
                ))
            }
        };
        let arg = &obj[name.as_str()];

        if name == "$literal" {
            return Ok(Expression::Literal(arg.clone()));
        }
        let op = ExprOp::from_name(name)
            .ok_or_else(|| StoreError::invalid(format!("unknown expression operator: {}", name)))?;

        let args = match (op, arg) {
            (ExprOp::DateFromString, Value::Object(params)) => {
                let date = params.get("dateString").ok_or_else(|| {
                    StoreError::invalid("$dateFromString requires 'dateString'")
                })?;
                if params.len() > 1 {
                    return Err(StoreError::invalid(
                        "$dateFromString supports only 'dateString'",
                    ));
                }
                vec![Expression::from_json(date)?]
            }
            (ExprOp::DateFromString, _) => {
                return Err(StoreError::invalid("$dateFromString requires an object"))
            }
            (_, Value::Array(items)) => items
                .iter()
                .map(Expression::from_json)
                .collect::<Result<Vec<_>>>()?,
            (_, single) => vec![Expression::from_json(single)?],
        };

        let (min, max) = op.arity();
        if args.len() < min || args.len() > max {
            return Err(StoreError::invalid(format!(
                "{} got {} argument(s)",
                op.name(),
                args.len()
            )));
        }
        Ok(Expression::Operator { op, args })
    }

    /// Evaluate against one document. Missing fields evaluate to `null`.
    pub fn evaluate(&self, doc: &Value) -> Result<Value> {
        match self {
            Expression::Literal(v) => Ok(v.clone()),
            Expression::Field(path) => Ok(resolve_path(doc, path).unwrap_or(Value::Null)),
            Expression::Object(fields) => {
                let mut out = Map::new();
                for (key, expr) in fields {
                    out.insert(key.clone(), expr.evaluate(doc)?);
                }
                Ok(Value::Object(out))
            }
            Expression::Array(items) => Ok(Value::Array(
                items.iter().map(|e| e.evaluate(doc)).collect::<Result<_>>()?,
            )),
            Expression::Operator { op, args } => {
                let values = args
                    .iter()
                    .map(|e| e.evaluate(doc))
                    .collect::<Result<Vec<_>>>()?;
                apply_operator(*op, &values)
            }
        }
    }
}

/// Resolve a dot path, mapping over arrays the way field references do:
/// `"producto.nombre"` on `{"producto": [{"nombre": "a"}]}` yields `["a"]`.
pub fn resolve_path(doc: &Value, path: &str) -> Option<Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };

    let next = match doc {
        Value::Object(map) => map.get(head)?,
        Value::Array(arr) => {
            if let Ok(index) = head.parse::<usize>() {
                arr.get(index)?
            } else {
                let mapped: Vec<Value> = arr.iter().filter_map(|elem| resolve_path(elem, path)).collect();
                return Some(Value::Array(mapped));
            }
        }
        _ => return None,
    };

    match rest {
        None => Some(next.clone()),
        Some(rest) => resolve_path(next, rest),
    }
}

fn numeric_args(op: ExprOp, values: &[Value]) -> Result<Option<Vec<f64>>> {
    let mut nums = Vec::with_capacity(values.len());
    for v in values {
        match v {
            Value::Null => return Ok(None),
            Value::Number(n) => nums.push(n.as_f64().unwrap_or(0.0)),
            other => {
                return Err(StoreError::invalid(format!(
                    "{} only supports numeric arguments, got {}",
                    op.name(),
                    other
                )))
            }
        }
    }
    Ok(Some(nums))
}

/// Integer result when every input is an integer and nothing overflowed.
fn integer_fold(values: &[Value], step: fn(i64, i64) -> Option<i64>) -> Option<Value> {
    let mut ints = values.iter().map(Value::as_i64);
    let mut acc = ints.next()??;
    for next in ints {
        acc = step(acc, next?)?;
    }
    Some(Value::from(acc))
}

fn apply_operator(op: ExprOp, values: &[Value]) -> Result<Value> {
    match op {
        ExprOp::Add | ExprOp::Multiply | ExprOp::Subtract => {
            let nums = match numeric_args(op, values)? {
                Some(nums) => nums,
                None => return Ok(Value::Null),
            };
            let exact = match op {
                ExprOp::Add => integer_fold(values, i64::checked_add),
                ExprOp::Multiply => integer_fold(values, i64::checked_mul),
                _ => integer_fold(values, i64::checked_sub),
            };
            if let Some(exact) = exact {
                return Ok(exact);
            }
            let mut iter = nums.into_iter();
            let first = iter.next().unwrap_or(0.0);
            Ok(number_value(iter.fold(first, |acc, x| match op {
                ExprOp::Add => acc + x,
                ExprOp::Multiply => acc * x,
                _ => acc - x,
            })))
        }
        ExprOp::Divide => {
            let nums = match numeric_args(op, values)? {
                Some(nums) => nums,
                None => return Ok(Value::Null),
            };
            if nums[1] == 0.0 {
                return Err(StoreError::invalid("$divide by zero"));
            }
            Ok(number_value(nums[0] / nums[1]))
        }
        ExprOp::Round => round(values),
        ExprOp::ArrayElemAt => match (&values[0], &values[1]) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (Value::Array(arr), Value::Number(n)) => {
                let idx = n
                    .as_i64()
                    .ok_or_else(|| StoreError::invalid("$arrayElemAt index must be an integer"))?;
                let len = arr.len() as i64;
                let pos = if idx < 0 { len + idx } else { idx };
                Ok(if (0..len).contains(&pos) {
                    arr[pos as usize].clone()
                } else {
                    Value::Null
                })
            }
            _ => Err(StoreError::invalid(
                "$arrayElemAt requires an array and an integer index",
            )),
        },
        ExprOp::Size => match &values[0] {
            Value::Array(arr) => Ok(Value::from(arr.len() as u64)),
            other => Err(StoreError::invalid(format!(
                "$size requires an array, got {}",
                other
            ))),
        },
        ExprOp::DateFromString => match &values[0] {
            Value::Null => Ok(Value::Null),
            Value::String(s) => Ok(Value::String(
                parse_date(s)?.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            other => Err(StoreError::invalid(format!(
                "$dateFromString requires a string, got {}",
                other
            ))),
        },
        ExprOp::Month => match &values[0] {
            Value::Null => Ok(Value::Null),
            Value::String(s) => Ok(Value::from(parse_date(s)?.month())),
            other => Err(StoreError::invalid(format!(
                "$month requires a date, got {}",
                other
            ))),
        },
    }
}

fn round(values: &[Value]) -> Result<Value> {
    let place = match values.get(1) {
        None => 0,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(p) if (-20..=100).contains(&p) => p as i32,
            _ => return Err(StoreError::invalid("$round place must be an integer in [-20, 100]")),
        },
        Some(Value::Null) => return Ok(Value::Null),
        Some(_) => return Err(StoreError::invalid("$round place must be an integer")),
    };
    match &values[0] {
        Value::Null => Ok(Value::Null),
        Value::Number(n) if n.as_i64().is_some() && place >= 0 => Ok(values[0].clone()),
        Value::Number(n) => {
            let factor = 10f64.powi(place);
            let x = n.as_f64().unwrap_or(0.0);
            Ok(number_value(round_half_even(x * factor) / factor))
        }
        other => Err(StoreError::invalid(format!(
            "$round requires a number, got {}",
            other
        ))),
    }
}

fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
        rounded - x.signum()
    } else {
        rounded
    }
}

/// Accepts RFC 3339 timestamps, naive `YYYY-MM-DDTHH:MM:SS[.fff]` (read as
/// UTC) and plain `YYYY-MM-DD` dates.
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Some(naive) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return Ok(naive.and_utc());
    }
    Err(StoreError::invalid(format!("cannot parse date '{}'", s)))
}
