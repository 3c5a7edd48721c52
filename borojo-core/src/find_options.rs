// borojo-core/src/find_options.rs
// Find query options: projection, sort, limit, skip

use serde_json::{Map, Value};
use std::cmp::Ordering;

use crate::document::ID_FIELD;
use crate::error::{Result, StoreError};
use crate::value_utils::{
    compare_values_with_none, get_nested_value, remove_nested_value, set_nested_value,
};

/// Options for find queries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Projection: field → 1 (include) or 0 (exclude), in declaration order.
    /// `_id` may be excluded in include mode.
    pub projection: Option<Vec<(String, i32)>>,

    /// Sort: [(field, direction)], direction: 1 (asc) or -1 (desc)
    pub sort: Option<Vec<(String, i32)>>,

    /// Limit: maximum number of documents to return
    pub limit: Option<usize>,

    /// Skip: number of documents to skip (for pagination)
    pub skip: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Vec<(String, i32)>) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Parse `{"sort": {...}, "projection": {...}, "limit": n, "skip": n}`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| StoreError::invalid("find options must be an object"))?;

        let mut options = FindOptions::new();
        for (key, arg) in obj {
            match key.as_str() {
                "sort" => options.sort = Some(spec_pairs(arg, "sort")?),
                "projection" => options.projection = Some(spec_pairs(arg, "projection")?),
                "limit" => options.limit = Some(count_arg(arg, "limit")?),
                "skip" => options.skip = Some(count_arg(arg, "skip")?),
                other => {
                    return Err(StoreError::invalid(format!("unknown find option '{}'", other)))
                }
            }
        }
        options.validate()?;
        Ok(options)
    }

    /// Reject sort directions other than ±1 and mixed projections.
    pub fn validate(&self) -> Result<()> {
        if let Some(sort) = &self.sort {
            if let Some((field, _)) = sort.iter().find(|(_, dir)| *dir != 1 && *dir != -1) {
                return Err(StoreError::invalid(format!(
                    "sort direction for '{}' must be 1 or -1",
                    field
                )));
            }
        }
        if let Some(projection) = &self.projection {
            if let Some((field, _)) = projection.iter().find(|(_, v)| *v != 0 && *v != 1) {
                return Err(StoreError::invalid(format!(
                    "projection for '{}' must be 0 or 1",
                    field
                )));
            }
            let has_inclusions = projection.iter().any(|(_, v)| *v == 1);
            let has_non_id_exclusions = projection
                .iter()
                .any(|(field, v)| *v == 0 && field != ID_FIELD);
            if has_inclusions && has_non_id_exclusions {
                return Err(StoreError::invalid(
                    "projection cannot mix inclusion and exclusion",
                ));
            }
        }
        Ok(())
    }

    /// Sort, skip, limit and project an already filtered result set.
    pub fn apply(&self, mut docs: Vec<Value>) -> Vec<Value> {
        if let Some(sort) = &self.sort {
            apply_sort(&mut docs, sort);
        }
        let skip = self.skip.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        let page = docs.into_iter().skip(skip).take(limit);
        match &self.projection {
            Some(projection) => page.map(|doc| apply_projection(&doc, projection)).collect(),
            None => page.collect(),
        }
    }
}

fn spec_pairs(arg: &Value, what: &str) -> Result<Vec<(String, i32)>> {
    let obj = arg
        .as_object()
        .ok_or_else(|| StoreError::invalid(format!("{} must be an object", what)))?;
    obj.iter()
        .map(|(field, v)| {
            let n = match v {
                Value::Bool(b) => i64::from(*b),
                other => other.as_i64().ok_or_else(|| {
                    StoreError::invalid(format!("{} value for '{}' must be an integer", what, field))
                })?,
            };
            Ok((field.clone(), n as i32))
        })
        .collect()
}

fn count_arg(arg: &Value, what: &str) -> Result<usize> {
    match arg.as_i64() {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(StoreError::invalid(format!(
            "{} must be a non-negative integer",
            what
        ))),
    }
}

/// Apply projection to a document
/// Supports dot notation for nested fields (e.g., "direccion.ciudad")
pub fn apply_projection(doc: &Value, projection: &[(String, i32)]) -> Value {
    if projection.is_empty() {
        return doc.clone();
    }

    let include_mode = projection
        .iter()
        .any(|(field, action)| *action == 1 && field != ID_FIELD)
        || projection
            .iter()
            .all(|(field, action)| *action == 1 && field == ID_FIELD);
    let exclude_id = projection
        .iter()
        .any(|(field, action)| *action == 0 && field == ID_FIELD);

    if include_mode {
        let mut result = Value::Object(Map::new());
        if !exclude_id {
            if let Some(id) = doc.get(ID_FIELD) {
                set_nested_value(&mut result, ID_FIELD, id.clone());
            }
        }
        for (field, action) in projection {
            if *action == 1 {
                if let Some(value) = get_nested_value(doc, field) {
                    set_nested_value(&mut result, field, value.clone());
                }
            }
        }
        result
    } else {
        let mut result = doc.clone();
        for (field, action) in projection {
            if *action == 0 {
                remove_nested_value(&mut result, field);
            }
        }
        result
    }
}

/// Apply sort to documents, stable for equal keys.
/// Supports dot notation for nested fields (e.g., "direccion.ciudad")
pub fn apply_sort(docs: &mut [Value], sort: &[(String, i32)]) {
    if sort.is_empty() {
        return;
    }

    docs.sort_by(|a, b| {
        for (field, direction) in sort {
            let cmp = compare_values_with_none(get_nested_value(a, field), get_nested_value(b, field));
            if cmp != Ordering::Equal {
                return if *direction >= 0 { cmp } else { cmp.reverse() };
            }
        }
        Ordering::Equal
    });
}
