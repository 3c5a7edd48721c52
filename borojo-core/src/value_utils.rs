//! Value utility functions shared across modules
//!
//! Nested field access with dot notation, numeric-aware equality, and the
//! orderings used by comparisons, sorting and grouping.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Get nested value from JSON with dot notation support
///
/// Supports:
/// - Simple fields: "name"
/// - Nested objects: "address.city"
/// - Array indexing: "productos.0.cantidad"
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use borojo_core::value_utils::get_nested_value;
///
/// let doc = json!({"address": {"city": "Quibdó"}});
/// assert_eq!(get_nested_value(&doc, "address.city"), Some(&json!("Quibdó")));
/// ```
pub fn get_nested_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return doc.get(path);
    }

    let mut value = doc;
    for part in path.split('.') {
        match value {
            Value::Object(map) => value = map.get(part)?,
            Value::Array(arr) => {
                let index = part.parse::<usize>().ok()?;
                value = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(value)
}

/// Mutable counterpart of [`get_nested_value`]. Never creates intermediate
/// objects.
pub fn get_nested_value_mut<'a>(doc: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(part)?,
            Value::Array(arr) => arr.get_mut(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Set a value at a nested path with dot notation support
///
/// Creates intermediate objects if they don't exist. Returns `false` when the
/// path crosses a non-object value and nothing was written.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use borojo_core::value_utils::set_nested_value;
///
/// let mut doc = json!({"nombre": "Mario"});
/// set_nested_value(&mut doc, "direccion.ciudad", json!("Cali"));
/// assert_eq!(doc["direccion"]["ciudad"], "Cali");
/// ```
pub fn set_nested_value(doc: &mut Value, path: &str, value: Value) -> bool {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = match parts.split_last() {
        Some(split) => split,
        None => return false,
    };

    let mut current = doc;
    for part in parents {
        let map = match current {
            Value::Object(map) => map,
            _ => return false,
        };
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            true
        }
        _ => false,
    }
}

/// Remove the value at a nested path, returning it if present.
pub fn remove_nested_value(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.remove(path),
        Some((parent, last)) => get_nested_value_mut(doc, parent)?
            .as_object_mut()?
            .remove(last),
    }
}

/// Numeric-aware equality.
///
/// Numbers are equal when their `f64` values are equal, so `5000` and
/// `5000.0` match. Arrays and objects compare element-wise with the same
/// rule; object key order is irrelevant.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => match (n1.as_i64(), n2.as_i64()) {
            (Some(i1), Some(i2)) => i1 == i2,
            _ => n1.as_f64() == n2.as_f64(),
        },
        (Value::Array(a1), Value::Array(a2)) => {
            a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(o1), Value::Object(o2)) => {
            o1.len() == o2.len()
                && o1
                    .iter()
                    .all(|(k, v)| o2.get(k).map_or(false, |w| values_equal(v, w)))
        }
        _ => a == b,
    }
}

/// Compare two JSON values
///
/// Returns `Some(Ordering)` for comparable types (numbers, strings, booleans),
/// `None` for incompatible types (e.g., comparing string to number).
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use std::cmp::Ordering;
/// use borojo_core::value_utils::compare_values;
///
/// assert_eq!(compare_values(&json!(10), &json!(5)), Some(Ordering::Greater));
/// assert_eq!(compare_values(&json!("a"), &json!("b")), Some(Ordering::Less));
/// assert_eq!(compare_values(&json!("a"), &json!(1)), None);
/// ```
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(n1), Value::Number(n2)) => {
            if let (Some(i1), Some(i2)) = (n1.as_i64(), n2.as_i64()) {
                return Some(i1.cmp(&i2));
            }
            n1.as_f64()?.partial_cmp(&n2.as_f64()?)
        }
        (Value::String(s1), Value::String(s2)) => Some(s1.cmp(s2)),
        (Value::Bool(b1), Value::Bool(b2)) => Some(b1.cmp(b2)),
        _ => None,
    }
}

/// Total ordering used for sorting.
///
/// Missing values sort first, then by type priority
/// (null < number < string < bool < object < array), then by value.
pub fn compare_values_with_none(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(av), Some(bv)) => compare_values(av, bv)
            .unwrap_or_else(|| type_priority(av).cmp(&type_priority(bv))),
    }
}

fn type_priority(val: &Value) -> u8 {
    match val {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Bool(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
    }
}

/// Human readable type name, used in error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Creates a canonical string representation of a JSON value
/// where object keys are always sorted alphabetically and integral floats
/// are written as integers.
///
/// Two values that are [`values_equal`] produce the same string, which makes
/// it usable as a grouping key.
///
/// ```
/// use serde_json::json;
/// use borojo_core::value_utils::canonical_json_string;
///
/// assert_eq!(
///     canonical_json_string(&json!({"a": 1, "b": 2.0})),
///     canonical_json_string(&json!({"b": 2, "a": 1}))
/// );
/// ```
pub fn canonical_json_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));

            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::from(k.as_str()), canonical_json_string(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json_string).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        _ => value.to_string(),
    }
}

/// Wrap an `f64` as a JSON number; non-finite results become `null`.
pub fn number_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested_value_simple() {
        let doc = json!({"nombre": "Borojó fresco", "stock": 30});
        assert_eq!(get_nested_value(&doc, "nombre"), Some(&json!("Borojó fresco")));
        assert_eq!(get_nested_value(&doc, "stock"), Some(&json!(30)));
        assert_eq!(get_nested_value(&doc, "missing"), None);
    }

    #[test]
    fn test_get_nested_value_array_index() {
        let doc = json!({
            "productos": [
                {"productoId": 1, "cantidad": 2},
                {"productoId": 4, "cantidad": 1}
            ]
        });
        assert_eq!(get_nested_value(&doc, "productos.1.productoId"), Some(&json!(4)));
        assert_eq!(get_nested_value(&doc, "productos.5.cantidad"), None);
        assert_eq!(get_nested_value(&doc, "productos.x"), None);
    }

    #[test]
    fn test_set_nested_value_creates_path() {
        let mut doc = json!({"nombre": "Mario"});
        assert!(set_nested_value(&mut doc, "direccion.ciudad", json!("Cali")));
        assert_eq!(doc["direccion"]["ciudad"], "Cali");
    }

    #[test]
    fn test_set_nested_value_through_scalar_fails() {
        let mut doc = json!({"nombre": "Mario"});
        assert!(!set_nested_value(&mut doc, "nombre.primero", json!("x")));
        assert_eq!(doc["nombre"], "Mario");
    }

    #[test]
    fn test_remove_nested_value() {
        let mut doc = json!({"a": {"b": 1, "c": 2}, "d": 3});
        assert_eq!(remove_nested_value(&mut doc, "a.b"), Some(json!(1)));
        assert_eq!(remove_nested_value(&mut doc, "d"), Some(json!(3)));
        assert_eq!(remove_nested_value(&mut doc, "zz.b"), None);
        assert_eq!(doc, json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_values_equal_numeric() {
        assert!(values_equal(&json!(5000), &json!(5000.0)));
        assert!(!values_equal(&json!(5000), &json!(5000.5)));
        assert!(values_equal(&json!([1, 2.0]), &json!([1.0, 2])));
        assert!(values_equal(&json!({"a": 1, "b": 2}), &json!({"b": 2.0, "a": 1})));
        assert!(!values_equal(&json!("1"), &json!(1)));
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(10), &json!(5.5)), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("a"), &json!("b")), Some(Ordering::Less));
        assert_eq!(compare_values(&json!(false), &json!(true)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("a"), &json!(1)), None);
        assert_eq!(compare_values(&json!(null), &json!(null)), None);
    }

    #[test]
    fn test_compare_values_with_none() {
        assert_eq!(compare_values_with_none(None, Some(&json!(5))), Ordering::Less);
        assert_eq!(compare_values_with_none(Some(&json!(10)), None), Ordering::Greater);
        assert_eq!(
            compare_values_with_none(Some(&json!(1)), Some(&json!("a"))),
            Ordering::Less
        );
    }

    #[test]
    fn test_canonical_json_string() {
        assert_eq!(
            canonical_json_string(&json!({"b": 1, "a": [2.0, "x"]})),
            r#"{"a":[2,"x"],"b":1}"#
        );
        assert_eq!(canonical_json_string(&json!(4.5)), "4.5");
        assert_eq!(canonical_json_string(&json!(null)), "null");
    }

    #[test]
    fn test_type_name() {
        assert_eq!(type_name(&json!(1)), "int");
        assert_eq!(type_name(&json!(1.5)), "double");
        assert_eq!(type_name(&json!(["a"])), "array");
    }
}
