// borojo-core/src/query/operators.rs
//! Query operator trait definitions and implementations
//!
//! Each filter operator is a separate type implementing [`OperatorMatcher`],
//! looked up by name in [`OPERATOR_REGISTRY`].
//!
//! ```text
//! OperatorMatcher trait
//!     ↓
//! ┌────────────────┬────────────────┬────────────────┬──────────────┐
//! │ Comparison     │ Array          │ Logical        │ Pattern      │
//! │ ($eq, $gt...)  │ ($all, $size)  │ ($and, $or...) │ ($regex)     │
//! └────────────────┴────────────────┴────────────────┴──────────────┘
//! ```

use crate::document::Document;
use crate::error::{Result, StoreError};
use crate::expression::resolve_path;
use crate::value_utils::{compare_values, get_nested_value, values_equal};
use lazy_static::lazy_static;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::num::NonZeroUsize;

/// Default number of compiled patterns kept in the regex cache.
pub const DEFAULT_REGEX_CACHE_CAPACITY: usize = 100;

// ============================================================================
// FIELD ACCESS
// ============================================================================

/// Anything a filter can be evaluated against: stored documents, or the
/// intermediate JSON objects flowing through an aggregation pipeline.
pub trait FieldSource {
    /// Value at a dot-notation path, if present.
    fn field(&self, path: &str) -> Option<&Value>;
}

impl FieldSource for Document {
    fn field(&self, path: &str) -> Option<&Value> {
        self.get(path)
    }
}

impl FieldSource for Value {
    fn field(&self, path: &str) -> Option<&Value> {
        get_nested_value(self, path)
    }
}

impl FieldSource for Map<String, Value> {
    fn field(&self, path: &str) -> Option<&Value> {
        match path.split_once('.') {
            None => self.get(path),
            Some((head, rest)) => get_nested_value(self.get(head)?, rest),
        }
    }
}

/// Value of a dotted path that crosses an array of subdocuments, collected
/// from every element: `"productos.productoId"` on
/// `{"productos": [{"productoId": 3}, {"productoId": 8}]}` yields `[3, 8]`.
/// `None` when the path never meets an array or no element holds it.
pub fn field_through_arrays(source: &dyn FieldSource, path: &str) -> Option<Value> {
    let (head, mut rest) = path.split_once('.')?;
    let mut prefix = head.to_string();
    loop {
        if let Value::Array(items) = source.field(&prefix)? {
            let values: Vec<Value> = items.iter().filter_map(|elem| resolve_path(elem, rest)).collect();
            return if values.is_empty() {
                None
            } else {
                Some(Value::Array(values))
            };
        }
        let (next, tail) = rest.split_once('.')?;
        prefix.push('.');
        prefix.push_str(next);
        rest = tail;
    }
}

// ============================================================================
// REGEX WITH OPTIONS SUPPORT
// ============================================================================

lazy_static! {
    /// Compiled patterns keyed by "options/pattern".
    static ref REGEX_CACHE: Mutex<LruCache<String, Regex>> =
        Mutex::new(LruCache::new(cache_capacity(DEFAULT_REGEX_CACHE_CAPACITY)));
}

fn cache_capacity(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

/// Resize the process-wide compiled regex cache.
pub fn set_regex_cache_capacity(capacity: usize) {
    REGEX_CACHE.lock().resize(cache_capacity(capacity));
}

/// Build regex pattern string with inline flags for the `i`, `m`, `s`, `x`
/// options. Unknown option letters are rejected.
fn build_regex_pattern(pattern: &str, options: &str) -> Result<String> {
    if let Some(bad) = options.chars().find(|c| !matches!(c, 'i' | 'm' | 's' | 'x')) {
        return Err(StoreError::invalid(format!("unsupported $options flag '{}'", bad)));
    }
    if options.is_empty() {
        Ok(pattern.to_string())
    } else {
        Ok(format!("(?{}){}", options, pattern))
    }
}

fn get_or_compile_regex(pattern: &str, options: &str) -> Result<Regex> {
    let cache_key = format!("{}/{}", options, pattern);

    if let Some(regex) = REGEX_CACHE.lock().get(&cache_key) {
        return Ok(regex.clone());
    }

    let regex = Regex::new(&build_regex_pattern(pattern, options)?)
        .map_err(|e| StoreError::invalid(format!("invalid regex pattern '{}': {}", pattern, e)))?;

    REGEX_CACHE.lock().put(cache_key, regex.clone());
    Ok(regex)
}

/// Match a field against a pattern. Strings match directly, arrays match if
/// any string element does; every other type never matches.
fn regex_matches_value(doc_value: Option<&Value>, pattern: &str, options: &str) -> Result<bool> {
    let regex = get_or_compile_regex(pattern, options)?;
    Ok(match doc_value {
        Some(Value::String(s)) => regex.is_match(s),
        Some(Value::Array(arr)) => arr
            .iter()
            .any(|elem| elem.as_str().map_or(false, |s| regex.is_match(s))),
        _ => false,
    })
}

// ============================================================================
// TRAIT DEFINITION
// ============================================================================

/// Trait for all query operators
///
/// ```rust
/// use serde_json::json;
/// use borojo_core::query::operators::{EqOperator, OperatorMatcher};
///
/// let matches = EqOperator.matches(Some(&json!("Bebida")), &json!("Bebida"), None).unwrap();
/// assert!(matches);
/// ```
pub trait OperatorMatcher: Send + Sync {
    /// Operator name, e.g. `"$gt"`.
    fn name(&self) -> &'static str;

    /// Checks a document value against the operator's argument.
    ///
    /// - `doc_value`: the field value (`None` if the field is absent)
    /// - `filter_value`: the operator argument from the filter
    /// - `document`: the whole document, needed by logical operators
    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&dyn FieldSource>,
    ) -> Result<bool>;
}

// ============================================================================
// COMPARISON OPERATORS
// ============================================================================

/// `$eq`; on array fields, matches when any element is equal.
pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        Ok(doc_value.map_or(false, |v| equals_or_contains(v, filter_value)))
    }
}

/// `$ne`; true when the field is absent.
pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        Ok(!doc_value.map_or(false, |v| equals_or_contains(v, filter_value)))
    }
}

pub struct GtOperator;

impl OperatorMatcher for GtOperator {
    fn name(&self) -> &'static str {
        "$gt"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        Ok(compare_with_predicate(doc_value, filter_value, |ord| ord == Ordering::Greater))
    }
}

pub struct GteOperator;

impl OperatorMatcher for GteOperator {
    fn name(&self) -> &'static str {
        "$gte"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        Ok(compare_with_predicate(doc_value, filter_value, |ord| ord != Ordering::Less))
    }
}

pub struct LtOperator;

impl OperatorMatcher for LtOperator {
    fn name(&self) -> &'static str {
        "$lt"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        Ok(compare_with_predicate(doc_value, filter_value, |ord| ord == Ordering::Less))
    }
}

pub struct LteOperator;

impl OperatorMatcher for LteOperator {
    fn name(&self) -> &'static str {
        "$lte"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        Ok(compare_with_predicate(doc_value, filter_value, |ord| ord != Ordering::Greater))
    }
}

// ============================================================================
// SET MEMBERSHIP OPERATORS
// ============================================================================

/// `$in`: the field (or any of its elements) equals one of the listed values.
pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        let candidates = require_array(self.name(), filter_value)?;
        Ok(doc_value.map_or(false, |v| {
            candidates.iter().any(|c| equals_or_contains(v, c))
        }))
    }
}

/// `$nin`: negation of `$in`; true when the field is absent.
pub struct NinOperator;

impl OperatorMatcher for NinOperator {
    fn name(&self) -> &'static str {
        "$nin"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        Ok(!InOperator.matches(doc_value, filter_value, document)?)
    }
}

// ============================================================================
// ELEMENT AND ARRAY OPERATORS
// ============================================================================

pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        match filter_value {
            Value::Bool(should_exist) => Ok(doc_value.is_some() == *should_exist),
            _ => Err(StoreError::invalid("$exists requires a boolean")),
        }
    }
}

/// `$all`: the array field contains every listed value, order irrelevant.
pub struct AllOperator;

impl OperatorMatcher for AllOperator {
    fn name(&self) -> &'static str {
        "$all"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        let required = require_array(self.name(), filter_value)?;
        match doc_value {
            Some(Value::Array(doc_arr)) => Ok(required
                .iter()
                .all(|req| doc_arr.iter().any(|elem| values_equal(elem, req)))),
            _ => Ok(false),
        }
    }
}

/// `$size`: exact length (`{"$size": 2}`) or a comparison on the length
/// (`{"$size": {"$gt": 1}}`).
pub struct SizeOperator;

impl OperatorMatcher for SizeOperator {
    fn name(&self) -> &'static str {
        "$size"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        let arr = match doc_value {
            Some(Value::Array(arr)) => arr,
            _ => return Ok(false),
        };
        let len = Value::from(arr.len() as u64);
        match filter_value {
            Value::Object(_) => matches_condition(Some(&len), filter_value, document),
            Value::Number(n) if n.as_u64().is_some() => Ok(values_equal(&len, filter_value)),
            _ => Err(StoreError::invalid(
                "$size requires a non-negative integer or a comparison object",
            )),
        }
    }
}

/// `$elemMatch`: at least one element satisfies the whole sub-filter.
///
/// The sub-filter is either field conditions on object elements
/// (`{"productoId": 3, "cantidad": {"$gt": 1}}`) or operators applied to the
/// element itself (`{"$gte": 10, "$lt": 20}`).
pub struct ElemMatchOperator;

impl OperatorMatcher for ElemMatchOperator {
    fn name(&self) -> &'static str {
        "$elemMatch"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        let conditions = filter_value
            .as_object()
            .ok_or_else(|| StoreError::invalid("$elemMatch requires an object"))?;
        let arr = match doc_value {
            Some(Value::Array(arr)) => arr,
            _ => return Ok(false),
        };
        let operator_form = conditions.keys().all(|k| k.starts_with('$'));

        for elem in arr {
            let matched = if operator_form {
                matches_condition(Some(elem), filter_value, None)?
            } else if elem.is_object() {
                matches_filter(elem, filter_value)?
            } else {
                false
            };
            if matched {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// `$regex` without `$options`. With options the pair is handled together by
/// [`matches_condition`].
pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        _document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        let pattern = filter_value
            .as_str()
            .ok_or_else(|| StoreError::invalid("$regex requires a string pattern"))?;
        regex_matches_value(doc_value, pattern, "")
    }
}

// ============================================================================
// LOGICAL OPERATORS
// ============================================================================

fn logical_clauses<'a>(name: &str, filter_value: &'a Value) -> Result<&'a Vec<Value>> {
    match filter_value {
        Value::Array(clauses) if !clauses.is_empty() => Ok(clauses),
        _ => Err(StoreError::invalid(format!(
            "{} requires a non-empty array of filters",
            name
        ))),
    }
}

fn require_document<'a>(
    name: &str,
    document: Option<&'a dyn FieldSource>,
) -> Result<&'a dyn FieldSource> {
    document.ok_or_else(|| StoreError::invalid(format!("{} requires document context", name)))
}

pub struct AndOperator;

impl OperatorMatcher for AndOperator {
    fn name(&self) -> &'static str {
        "$and"
    }

    fn matches(
        &self,
        _doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        let doc = require_document(self.name(), document)?;
        for clause in logical_clauses(self.name(), filter_value)? {
            if !matches_filter_dyn(doc, clause)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

pub struct OrOperator;

impl OperatorMatcher for OrOperator {
    fn name(&self) -> &'static str {
        "$or"
    }

    fn matches(
        &self,
        _doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        let doc = require_document(self.name(), document)?;
        for clause in logical_clauses(self.name(), filter_value)? {
            if matches_filter_dyn(doc, clause)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

pub struct NorOperator;

impl OperatorMatcher for NorOperator {
    fn name(&self) -> &'static str {
        "$nor"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        Ok(!OrOperator.matches(doc_value, filter_value, document)?)
    }
}

/// `$not` negates a field-level operator object: `{"stock": {"$not": {"$gt": 5}}}`.
pub struct NotOperator;

impl OperatorMatcher for NotOperator {
    fn name(&self) -> &'static str {
        "$not"
    }

    fn matches(
        &self,
        doc_value: Option<&Value>,
        filter_value: &Value,
        document: Option<&dyn FieldSource>,
    ) -> Result<bool> {
        if !filter_value.is_object() {
            return Err(StoreError::invalid("$not requires an operator object"));
        }
        Ok(!matches_condition(doc_value, filter_value, document)?)
    }
}

// ============================================================================
// OPERATOR REGISTRY
// ============================================================================

lazy_static! {
    /// Global registry of all query operators, immutable after first use.
    pub static ref OPERATOR_REGISTRY: HashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let operators: Vec<Box<dyn OperatorMatcher>> = vec![
            Box::new(EqOperator),
            Box::new(NeOperator),
            Box::new(GtOperator),
            Box::new(GteOperator),
            Box::new(LtOperator),
            Box::new(LteOperator),
            Box::new(InOperator),
            Box::new(NinOperator),
            Box::new(ExistsOperator),
            Box::new(AllOperator),
            Box::new(SizeOperator),
            Box::new(ElemMatchOperator),
            Box::new(RegexOperator),
            Box::new(AndOperator),
            Box::new(OrOperator),
            Box::new(NorOperator),
            Box::new(NotOperator),
        ];
        operators.into_iter().map(|op| (op.name(), op)).collect()
    };
}

const TOP_LEVEL_OPERATORS: [&str; 3] = ["$and", "$or", "$nor"];

fn lookup_operator(name: &str) -> Result<&'static dyn OperatorMatcher> {
    OPERATOR_REGISTRY
        .get(name)
        .map(|op| op.as_ref())
        .ok_or_else(|| StoreError::invalid(format!("unknown operator: {}", name)))
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn require_array<'a>(name: &str, value: &'a Value) -> Result<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| StoreError::invalid(format!("{} requires an array", name)))
}

/// Equality with array-membership semantics: a field holding an array equals
/// `v` when the array itself equals `v` or any element does.
fn equals_or_contains(doc_value: &Value, filter_value: &Value) -> bool {
    if values_equal(doc_value, filter_value) {
        return true;
    }
    match doc_value {
        Value::Array(arr) => arr.iter().any(|elem| values_equal(elem, filter_value)),
        _ => false,
    }
}

/// Shared body of `$gt`/`$gte`/`$lt`/`$lte`, with array element matching.
fn compare_with_predicate<F>(doc_value: Option<&Value>, filter_value: &Value, predicate: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    let check = |v: &Value| compare_values(v, filter_value).map_or(false, &predicate);
    match doc_value {
        None => false,
        Some(Value::Array(arr)) => arr.iter().any(check),
        Some(v) => check(v),
    }
}

/// Evaluate a field condition: an operator object (`{"$gt": 5, "$lt": 9}`)
/// or a literal for implicit equality.
pub fn matches_condition(
    doc_value: Option<&Value>,
    condition: &Value,
    document: Option<&dyn FieldSource>,
) -> Result<bool> {
    let condition_obj = match condition {
        Value::Object(obj) if obj.keys().any(|k| k.starts_with('$')) => obj,
        literal => return EqOperator.matches(doc_value, literal, document),
    };

    for (op_name, op_value) in condition_obj {
        let matched = match op_name.as_str() {
            "$options" => {
                if !condition_obj.contains_key("$regex") {
                    return Err(StoreError::invalid("$options requires $regex"));
                }
                continue;
            }
            "$regex" => {
                let pattern = op_value
                    .as_str()
                    .ok_or_else(|| StoreError::invalid("$regex requires a string pattern"))?;
                let options = match condition_obj.get("$options") {
                    None => "",
                    Some(Value::String(s)) => s.as_str(),
                    Some(_) => return Err(StoreError::invalid("$options must be a string")),
                };
                regex_matches_value(doc_value, pattern, options)?
            }
            name if TOP_LEVEL_OPERATORS.contains(&name) => {
                return Err(StoreError::invalid(format!(
                    "{} is only valid at the top level of a filter",
                    name
                )))
            }
            name if name.starts_with('$') => {
                lookup_operator(name)?.matches(doc_value, op_value, document)?
            }
            other => {
                return Err(StoreError::invalid(format!(
                    "cannot mix operators and field '{}' in one condition",
                    other
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_filter_dyn(document: &dyn FieldSource, filter: &Value) -> Result<bool> {
    let filter_obj = filter
        .as_object()
        .ok_or_else(|| StoreError::invalid("filter must be an object"))?;

    for (key, condition) in filter_obj {
        let matched = if key.starts_with('$') {
            if !TOP_LEVEL_OPERATORS.contains(&key.as_str()) {
                return Err(StoreError::invalid(format!(
                    "unknown top-level operator: {}",
                    key
                )));
            }
            lookup_operator(key)?.matches(None, condition, Some(document))?
        } else if let Some(value) = document.field(key) {
            matches_condition(Some(value), condition, Some(document))?
        } else {
            let collected = field_through_arrays(document, key);
            matches_condition(collected.as_ref(), condition, Some(document))?
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Main entry point for filter matching.
///
/// Keys of the filter are ANDed; an empty filter matches everything.
/// Malformed filters yield `InvalidArgument`.
pub fn matches_filter<S: FieldSource>(document: &S, filter: &Value) -> Result<bool> {
    matches_filter_dyn(document, filter)
}

/// Check a filter's shape without a document, so malformed filters fail even
/// against empty collections.
pub fn validate_filter(filter: &Value) -> Result<()> {
    let filter_obj = filter
        .as_object()
        .ok_or_else(|| StoreError::invalid("filter must be an object"))?;

    for (key, condition) in filter_obj {
        if key.starts_with('$') {
            if !TOP_LEVEL_OPERATORS.contains(&key.as_str()) {
                return Err(StoreError::invalid(format!(
                    "unknown top-level operator: {}",
                    key
                )));
            }
            for clause in logical_clauses(key, condition)? {
                validate_filter(clause)?;
            }
        } else if let Value::Object(obj) = condition {
            validate_condition(obj)?;
        }
    }
    Ok(())
}

fn validate_condition(condition: &Map<String, Value>) -> Result<()> {
    if !condition.keys().any(|k| k.starts_with('$')) {
        return Ok(());
    }
    for (op_name, op_value) in condition {
        match op_name.as_str() {
            "$regex" => {
                let pattern = op_value
                    .as_str()
                    .ok_or_else(|| StoreError::invalid("$regex requires a string pattern"))?;
                let options = match condition.get("$options") {
                    None => "",
                    Some(Value::String(s)) => s.as_str(),
                    Some(_) => return Err(StoreError::invalid("$options must be a string")),
                };
                get_or_compile_regex(pattern, options)?;
            }
            "$options" if !condition.contains_key("$regex") => {
                return Err(StoreError::invalid("$options requires $regex"));
            }
            "$options" => {}
            "$in" | "$nin" | "$all" => {
                require_array(op_name, op_value)?;
            }
            "$exists" if !op_value.is_boolean() => {
                return Err(StoreError::invalid("$exists requires a boolean"));
            }
            "$not" | "$elemMatch" => {
                let inner = op_value
                    .as_object()
                    .ok_or_else(|| StoreError::invalid(format!("{} requires an object", op_name)))?;
                if op_name == "$not" || inner.keys().all(|k| k.starts_with('$')) {
                    validate_condition(inner)?;
                } else {
                    validate_filter(op_value)?;
                }
            }
            "$size" => match op_value {
                Value::Object(inner) => validate_condition(inner)?,
                Value::Number(n) if n.as_u64().is_some() => {}
                _ => {
                    return Err(StoreError::invalid(
                        "$size requires a non-negative integer or a comparison object",
                    ))
                }
            },
            name if TOP_LEVEL_OPERATORS.contains(&name) => {
                return Err(StoreError::invalid(format!(
                    "{} is only valid at the top level of a filter",
                    name
                )));
            }
            name if name.starts_with('$') => {
                lookup_operator(name)?;
            }
            other => {
                return Err(StoreError::invalid(format!(
                    "cannot mix operators and field '{}' in one condition",
                    other
                )));
            }
        }
    }
    Ok(())
}
