// borojo-core/src/update.rs
//! Update operators: `$inc`, `$mul`, `$push`, `$set`, `$unset`.
//!
//! An update document is parsed once into an [`UpdateSpec`] and then applied
//! per document. Application works on a copy of the document body; the copy
//! is only handed back when every operator succeeded, so a failing operator
//! never leaves a document half updated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, ID_FIELD};
use crate::error::{Result, StoreError};
use crate::value_utils::{
    get_nested_value, number_value, remove_nested_value, set_nested_value, type_name,
};

/// Policy knobs for update operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOptions {
    /// Treat an absent field as `0` for `$inc` and `$mul` instead of failing.
    pub absent_as_zero: bool,
    /// In multi-document updates, skip documents that fail with
    /// `TypeMismatch` instead of aborting the whole batch.
    pub skip_type_mismatch: bool,
}

/// Counts reported by `update_one` / `update_many`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    /// Documents the filter selected.
    pub matched: u64,
    /// Documents whose content actually changed.
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum UpdateOp {
    Inc { field: String, delta: Value },
    Mul { field: String, factor: Value },
    Push { field: String, items: Vec<Value> },
    Set { field: String, value: Value },
    Unset { field: String },
}

impl UpdateOp {
    fn field(&self) -> &str {
        match self {
            UpdateOp::Inc { field, .. }
            | UpdateOp::Mul { field, .. }
            | UpdateOp::Push { field, .. }
            | UpdateOp::Set { field, .. }
            | UpdateOp::Unset { field } => field,
        }
    }
}

/// A parsed and validated update document.
///
/// ```
/// use borojo_core::update::UpdateSpec;
/// use serde_json::json;
///
/// let spec = UpdateSpec::from_json(&json!({"$inc": {"stock": -2}})).unwrap();
/// assert_eq!(spec.len(), 1);
/// assert!(UpdateSpec::from_json(&json!({"stock": 5})).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSpec {
    ops: Vec<UpdateOp>,
}

impl UpdateSpec {
    pub fn from_json(update: &Value) -> Result<Self> {
        let update_ops = update
            .as_object()
            .ok_or_else(|| StoreError::invalid("update must be an object"))?;
        if update_ops.is_empty() {
            return Err(StoreError::invalid("update must contain at least one operator"));
        }

        let mut ops = Vec::new();
        for (op, fields) in update_ops {
            let field_values = fields.as_object().ok_or_else(|| {
                StoreError::invalid(format!("{} requires an object of fields", op))
            })?;

            for (field, arg) in field_values {
                check_target(op, field)?;
                let parsed = match op.as_str() {
                    "$inc" => UpdateOp::Inc {
                        field: field.clone(),
                        delta: require_number(op, field, arg)?,
                    },
                    "$mul" => UpdateOp::Mul {
                        field: field.clone(),
                        factor: require_number(op, field, arg)?,
                    },
                    "$push" => UpdateOp::Push {
                        field: field.clone(),
                        items: push_items(arg)?,
                    },
                    "$set" => UpdateOp::Set {
                        field: field.clone(),
                        value: arg.clone(),
                    },
                    "$unset" => UpdateOp::Unset {
                        field: field.clone(),
                    },
                    other if other.starts_with('$') => {
                        return Err(StoreError::invalid(format!(
                            "unknown update operator: {}",
                            other
                        )))
                    }
                    other => {
                        return Err(StoreError::invalid(format!(
                            "replacement documents are not supported (found field '{}')",
                            other
                        )))
                    }
                };
                ops.push(parsed);
            }
        }

        for (i, op) in ops.iter().enumerate() {
            if ops[..i].iter().any(|prev| paths_overlap(prev.field(), op.field())) {
                return Err(StoreError::invalid(format!(
                    "update targets '{}' more than once",
                    op.field()
                )));
            }
        }

        Ok(UpdateSpec { ops })
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every operator to a copy of `doc`.
    ///
    /// Returns `Ok(None)` when the result is identical to the input.
    pub fn apply(&self, doc: &Document, options: &UpdateOptions) -> Result<Option<Document>> {
        let mut body = doc.to_value();
        for op in &self.ops {
            apply_op(&mut body, op, options)?;
        }
        if body.as_object() == Some(doc.fields()) {
            return Ok(None);
        }
        doc.with_body(body).map(Some)
    }
}

fn check_target(op: &str, field: &str) -> Result<()> {
    if field.is_empty() || field.split('.').any(str::is_empty) {
        return Err(StoreError::invalid(format!("{}: invalid field path '{}'", op, field)));
    }
    if field == ID_FIELD || field.starts_with("_id.") {
        return Err(StoreError::invalid(format!("{}: the _id field is immutable", op)));
    }
    Ok(())
}

fn paths_overlap(a: &str, b: &str) -> bool {
    a == b
        || b.strip_prefix(a).map_or(false, |rest| rest.starts_with('.'))
        || a.strip_prefix(b).map_or(false, |rest| rest.starts_with('.'))
}

fn require_number(op: &str, field: &str, arg: &Value) -> Result<Value> {
    if arg.is_number() {
        Ok(arg.clone())
    } else {
        Err(StoreError::invalid(format!(
            "{} on '{}' requires a numeric argument, got {}",
            op,
            field,
            type_name(arg)
        )))
    }
}

/// `$push` value, or `{"$each": [...]}` for several items.
fn push_items(arg: &Value) -> Result<Vec<Value>> {
    match arg {
        Value::Object(modifiers) if modifiers.contains_key("$each") => {
            if modifiers.len() > 1 {
                return Err(StoreError::invalid("$push supports only the $each modifier"));
            }
            match modifiers.get("$each") {
                Some(Value::Array(items)) => Ok(items.clone()),
                _ => Err(StoreError::invalid("$each requires an array")),
            }
        }
        other => Ok(vec![other.clone()]),
    }
}

#[derive(Clone, Copy)]
enum Arith {
    Add,
    Mul,
}

/// Integer arithmetic when both sides are integers and the result fits,
/// float arithmetic otherwise.
fn arithmetic(current: &Value, arg: &Value, kind: Arith) -> Option<Value> {
    if let (Some(a), Some(b)) = (current.as_i64(), arg.as_i64()) {
        let exact = match kind {
            Arith::Add => a.checked_add(b),
            Arith::Mul => a.checked_mul(b),
        };
        if let Some(result) = exact {
            return Some(Value::from(result));
        }
    }
    let (a, b) = (current.as_f64()?, arg.as_f64()?);
    Some(number_value(match kind {
        Arith::Add => a + b,
        Arith::Mul => a * b,
    }))
}

fn write_field(body: &mut Value, field: &str, value: Value) -> Result<()> {
    if set_nested_value(body, field, value) {
        Ok(())
    } else {
        Err(StoreError::type_mismatch(
            field,
            "cannot create a field inside a non-object value",
        ))
    }
}

fn apply_numeric(
    body: &mut Value,
    field: &str,
    op_name: &str,
    arg: &Value,
    kind: Arith,
    options: &UpdateOptions,
) -> Result<()> {
    let updated = match get_nested_value(body, field) {
        Some(current) if current.is_number() => arithmetic(current, arg, kind)
            .ok_or_else(|| StoreError::type_mismatch(field, "arithmetic on a non-number"))?,
        Some(current) => {
            return Err(StoreError::type_mismatch(
                field,
                format!("{} expects a number, found {}", op_name, type_name(current)),
            ))
        }
        None if options.absent_as_zero => match kind {
            Arith::Add => arg.clone(),
            Arith::Mul if arg.is_i64() || arg.is_u64() => Value::from(0),
            Arith::Mul => number_value(0.0),
        },
        None => {
            return Err(StoreError::type_mismatch(
                field,
                format!("{} on an absent field", op_name),
            ))
        }
    };
    write_field(body, field, updated)
}

fn apply_op(body: &mut Value, op: &UpdateOp, options: &UpdateOptions) -> Result<()> {
    match op {
        UpdateOp::Inc { field, delta } => {
            apply_numeric(body, field, "$inc", delta, Arith::Add, options)
        }
        UpdateOp::Mul { field, factor } => {
            apply_numeric(body, field, "$mul", factor, Arith::Mul, options)
        }
        UpdateOp::Push { field, items } => {
            let array = match get_nested_value(body, field) {
                Some(Value::Array(existing)) => {
                    let mut array = existing.clone();
                    array.extend(items.iter().cloned());
                    array
                }
                Some(other) => {
                    return Err(StoreError::type_mismatch(
                        field,
                        format!("$push expects an array, found {}", type_name(other)),
                    ))
                }
                None => items.clone(),
            };
            write_field(body, field, Value::Array(array))
        }
        UpdateOp::Set { field, value } => write_field(body, field, value.clone()),
        UpdateOp::Unset { field } => {
            remove_nested_value(body, field);
            Ok(())
        }
    }
}

/// Convenience for callers holding a raw JSON update and a single document.
pub fn apply_update(doc: &Document, update: &Value, options: &UpdateOptions) -> Result<Option<Document>> {
    UpdateSpec::from_json(update)?.apply(doc, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn producto() -> Document {
        Document::from_value(json!({
            "_id": 1,
            "nombre": "Borojó fresco",
            "precio": 5000,
            "stock": 30,
            "tags": ["fruta"]
        }))
        .unwrap()
    }

    fn apply(doc: &Document, update: Value) -> Result<Option<Document>> {
        apply_update(doc, &update, &UpdateOptions::default())
    }

    #[test]
    fn test_inc_stays_integer() {
        let updated = apply(&producto(), json!({"$inc": {"stock": -5}})).unwrap().unwrap();
        assert_eq!(updated.get("stock"), Some(&json!(25)));
        assert!(updated.get("stock").unwrap().is_i64());
    }

    #[test]
    fn test_inc_with_float_delta() {
        let updated = apply(&producto(), json!({"$inc": {"stock": 0.5}})).unwrap().unwrap();
        assert_eq!(updated.get("stock"), Some(&json!(30.5)));
    }

    #[test]
    fn test_mul_by_fraction() {
        let updated = apply(&producto(), json!({"$mul": {"precio": 0.9}})).unwrap().unwrap();
        assert_eq!(updated.get("precio").and_then(Value::as_f64), Some(4500.0));
    }

    #[test]
    fn test_inc_type_mismatch_leaves_document_untouched() {
        let doc = producto();
        let err = apply(&doc, json!({"$inc": {"stock": 1, "nombre": 1}})).unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { ref field, .. } if field == "nombre"));
        assert_eq!(doc.get("stock"), Some(&json!(30)));
    }

    #[test]
    fn test_inc_absent_field() {
        let doc = producto();
        assert!(matches!(
            apply(&doc, json!({"$inc": {"vendidos": 1}})),
            Err(StoreError::TypeMismatch { .. })
        ));

        let options = UpdateOptions {
            absent_as_zero: true,
            ..Default::default()
        };
        let updated = apply_update(&doc, &json!({"$inc": {"vendidos": 3}}), &options)
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("vendidos"), Some(&json!(3)));

        let updated = apply_update(&doc, &json!({"$mul": {"descuento": 2}}), &options)
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("descuento"), Some(&json!(0)));
    }

    #[test]
    fn test_push_appends_and_creates() {
        let doc = producto();
        let updated = apply(&doc, json!({"$push": {"tags": "orgánico"}})).unwrap().unwrap();
        assert_eq!(updated.get("tags"), Some(&json!(["fruta", "orgánico"])));

        let updated = apply(&doc, json!({"$push": {"resenas": {"nota": 5}}})).unwrap().unwrap();
        assert_eq!(updated.get("resenas"), Some(&json!([{"nota": 5}])));

        let updated = apply(&doc, json!({"$push": {"tags": {"$each": ["a", "b"]}}}))
            .unwrap()
            .unwrap();
        assert_eq!(updated.get("tags"), Some(&json!(["fruta", "a", "b"])));
    }

    #[test]
    fn test_push_on_non_array() {
        assert!(matches!(
            apply(&producto(), json!({"$push": {"nombre": "x"}})),
            Err(StoreError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_set_and_unset_nested() {
        let doc = producto();
        let updated = apply(
            &doc,
            json!({"$set": {"proveedor.ciudad": "Quibdó"}, "$unset": {"tags": ""}}),
        )
        .unwrap()
        .unwrap();
        assert_eq!(updated.get("proveedor.ciudad"), Some(&json!("Quibdó")));
        assert!(updated.get("tags").is_none());
        assert_eq!(updated.id(), doc.id());
    }

    #[test]
    fn test_unchanged_returns_none() {
        let doc = producto();
        assert!(apply(&doc, json!({"$set": {"stock": 30}})).unwrap().is_none());
        assert!(apply(&doc, json!({"$unset": {"missing": ""}})).unwrap().is_none());
    }

    #[test]
    fn test_invalid_update_documents() {
        assert!(UpdateSpec::from_json(&json!({})).is_err());
        assert!(UpdateSpec::from_json(&json!({"$rename": {"a": "b"}})).is_err());
        assert!(UpdateSpec::from_json(&json!({"$inc": {"stock": "1"}})).is_err());
        assert!(UpdateSpec::from_json(&json!({"$set": {"_id": 2}})).is_err());
        assert!(UpdateSpec::from_json(&json!({"$inc": 5})).is_err());
        assert!(UpdateSpec::from_json(&json!({"$set": {"a": 1}, "$inc": {"a": 1}})).is_err());
        assert!(UpdateSpec::from_json(&json!({"$set": {"a": 1}, "$unset": {"a.b": ""}})).is_err());
        assert!(UpdateSpec::from_json(&json!({"$push": {"t": {"$each": 1}}})).is_err());
    }
}
