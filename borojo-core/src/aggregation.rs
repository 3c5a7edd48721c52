// borojo-core/src/aggregation.rs
// Aggregation pipeline implementation

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::document::ID_FIELD;
use crate::error::{Result, StoreError};
use crate::expression::{resolve_path, Expression};
use crate::query::Query;
use crate::value_utils::{
    canonical_json_string, compare_values_with_none, get_nested_value, number_value,
    remove_nested_value, set_nested_value, values_equal,
};

// ============================================================================
// FOREIGN COLLECTIONS
// ============================================================================

/// Where `$lookup` reads the documents of other collections from.
pub trait LookupSource {
    /// Documents of `name` in insertion order; empty when it does not exist.
    fn collection_documents(&self, name: &str) -> Vec<Value>;
}

impl LookupSource for HashMap<String, Vec<Value>> {
    fn collection_documents(&self, name: &str) -> Vec<Value> {
        self.get(name).cloned().unwrap_or_default()
    }
}

/// Source with no collections, for pipelines without `$lookup`.
pub struct NoLookup;

impl LookupSource for NoLookup {
    fn collection_documents(&self, _name: &str) -> Vec<Value> {
        Vec::new()
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Parse a field path from `"$field"`.
fn parse_field_reference(value: &Value, op_name: &str) -> Result<String> {
    match value.as_str() {
        Some(s) if s.len() > 1 && s.starts_with('$') => Ok(s[1..].to_string()),
        Some(_) => Err(StoreError::invalid(format!(
            "{} field reference must start with $",
            op_name
        ))),
        None => Err(StoreError::invalid(format!(
            "{} must be a field reference",
            op_name
        ))),
    }
}

fn stage_object<'a>(spec: &'a Value, stage: &str) -> Result<&'a Map<String, Value>> {
    spec.as_object()
        .ok_or_else(|| StoreError::invalid(format!("{} must be an object", stage)))
}

fn plain_field_name(value: &Value, what: &str) -> Result<String> {
    match value.as_str() {
        Some(s) if !s.is_empty() && !s.starts_with('$') => Ok(s.to_string()),
        _ => Err(StoreError::invalid(format!(
            "{} must be a non-empty field name",
            what
        ))),
    }
}

// ============================================================================
// PIPELINE AND STAGES
// ============================================================================

/// Aggregation pipeline
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(MatchStage),
    Unwind(UnwindStage),
    Group(GroupStage),
    Lookup(LookupStage),
    Project(ProjectStage),
    Sort(SortStage),
    Limit(LimitStage),
    Skip(SkipStage),
    Count(CountStage),
}

/// $match stage - filter documents
#[derive(Debug, Clone)]
pub struct MatchStage {
    query: Query,
}

/// $unwind stage - one output document per array element
#[derive(Debug, Clone)]
pub struct UnwindStage {
    path: String,
    preserve_null_and_empty: bool,
}

/// $group stage - group documents and compute aggregates
#[derive(Debug, Clone)]
pub struct GroupStage {
    id: Expression,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    First(Expression),
    Last(Expression),
    Count,
}

/// $lookup stage - left outer join on equality
#[derive(Debug, Clone)]
pub struct LookupStage {
    from: String,
    local_field: String,
    foreign_field: String,
    as_field: String,
}

/// $project stage - reshape documents
#[derive(Debug, Clone)]
pub struct ProjectStage {
    fields: Vec<(String, ProjectField)>,
    include_id: bool,
    exclusion: bool,
}

#[derive(Debug, Clone)]
pub enum ProjectField {
    Include,
    Exclude,
    Computed(Expression),
}

/// $sort stage - stable multi-key sort
#[derive(Debug, Clone)]
pub struct SortStage {
    fields: Vec<(String, SortDirection)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct LimitStage {
    limit: usize,
}

#[derive(Debug, Clone)]
pub struct SkipStage {
    skip: usize,
}

/// $count stage - replace the stream with `{<field>: n}`
#[derive(Debug, Clone)]
pub struct CountStage {
    field: String,
}

impl Pipeline {
    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &Value) -> Result<Self> {
        let stages_array = pipeline_json
            .as_array()
            .ok_or_else(|| StoreError::invalid("pipeline must be an array"))?;

        let stages = stages_array
            .iter()
            .map(Stage::from_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(Pipeline { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Names of the collections `$lookup` stages read.
    pub fn lookup_collections(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter_map(|stage| match stage {
                Stage::Lookup(lookup) => Some(lookup.from.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Execute pipeline on documents
    pub fn execute(&self, mut docs: Vec<Value>, source: &dyn LookupSource) -> Result<Vec<Value>> {
        for stage in &self.stages {
            docs = stage.execute(docs, source)?;
        }
        Ok(docs)
    }
}

impl Stage {
    /// Parse stage from JSON
    fn from_json(stage_json: &Value) -> Result<Self> {
        let obj = stage_object(stage_json, "stage")?;
        let (stage_name, stage_spec) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => return Err(StoreError::invalid("each stage must have exactly one operator")),
        };

        match stage_name.as_str() {
            "$match" => Ok(Stage::Match(MatchStage::from_json(stage_spec)?)),
            "$unwind" => Ok(Stage::Unwind(UnwindStage::from_json(stage_spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(stage_spec)?)),
            "$lookup" => Ok(Stage::Lookup(LookupStage::from_json(stage_spec)?)),
            "$project" => Ok(Stage::Project(ProjectStage::from_json(stage_spec)?)),
            "$sort" => Ok(Stage::Sort(SortStage::from_json(stage_spec)?)),
            "$limit" => Ok(Stage::Limit(LimitStage::from_json(stage_spec)?)),
            "$skip" => Ok(Stage::Skip(SkipStage::from_json(stage_spec)?)),
            "$count" => Ok(Stage::Count(CountStage::from_json(stage_spec)?)),
            _ => Err(StoreError::invalid(format!(
                "unknown pipeline stage: {}",
                stage_name
            ))),
        }
    }

    /// Execute this stage
    fn execute(&self, docs: Vec<Value>, source: &dyn LookupSource) -> Result<Vec<Value>> {
        match self {
            Stage::Match(stage) => stage.execute(docs),
            Stage::Unwind(stage) => Ok(stage.execute(docs)),
            Stage::Group(stage) => stage.execute(docs),
            Stage::Lookup(stage) => Ok(stage.execute(docs, source)),
            Stage::Project(stage) => stage.execute(docs),
            Stage::Sort(stage) => Ok(stage.execute(docs)),
            Stage::Limit(stage) => Ok(docs.into_iter().take(stage.limit).collect()),
            Stage::Skip(stage) => Ok(docs.into_iter().skip(stage.skip).collect()),
            Stage::Count(stage) => Ok(stage.execute(docs)),
        }
    }
}

// ===== $match =====

impl MatchStage {
    fn from_json(spec: &Value) -> Result<Self> {
        Ok(MatchStage {
            query: Query::from_json(spec)?,
        })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut results = Vec::new();
        for doc in docs {
            if self.query.matches(&doc)? {
                results.push(doc);
            }
        }
        Ok(results)
    }
}

// ===== $unwind =====

impl UnwindStage {
    fn from_json(spec: &Value) -> Result<Self> {
        match spec {
            Value::String(_) => Ok(UnwindStage {
                path: parse_field_reference(spec, "$unwind")?,
                preserve_null_and_empty: false,
            }),
            Value::Object(obj) => {
                let path = obj
                    .get("path")
                    .ok_or_else(|| StoreError::invalid("$unwind requires 'path'"))?;
                let preserve = match obj.get("preserveNullAndEmptyArrays") {
                    None => false,
                    Some(Value::Bool(b)) => *b,
                    Some(_) => {
                        return Err(StoreError::invalid(
                            "preserveNullAndEmptyArrays must be a boolean",
                        ))
                    }
                };
                if let Some(unknown) = obj
                    .keys()
                    .find(|k| *k != "path" && *k != "preserveNullAndEmptyArrays")
                {
                    return Err(StoreError::invalid(format!(
                        "unsupported $unwind option '{}'",
                        unknown
                    )));
                }
                Ok(UnwindStage {
                    path: parse_field_reference(path, "$unwind")?,
                    preserve_null_and_empty: preserve,
                })
            }
            _ => Err(StoreError::invalid(
                "$unwind must be a field reference or an object",
            )),
        }
    }

    fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            match get_nested_value(&doc, &self.path) {
                Some(Value::Array(items)) if !items.is_empty() => {
                    for item in items.clone() {
                        let mut copy = doc.clone();
                        set_nested_value(&mut copy, &self.path, item);
                        results.push(copy);
                    }
                }
                Some(Value::Array(_)) => {
                    if self.preserve_null_and_empty {
                        let mut copy = doc;
                        remove_nested_value(&mut copy, &self.path);
                        results.push(copy);
                    }
                }
                None | Some(Value::Null) => {
                    if self.preserve_null_and_empty {
                        results.push(doc);
                    }
                }
                // A scalar behaves as a one-element array.
                Some(_) => results.push(doc),
            }
        }
        results
    }
}

// ===== $group =====

impl GroupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$group")?;
        let id = obj
            .get(ID_FIELD)
            .ok_or_else(|| StoreError::invalid("$group requires an _id"))?;
        let id = Expression::from_json(id)?;

        let mut accumulators = Vec::new();
        for (field, value) in obj {
            if field == ID_FIELD {
                continue;
            }
            if field.contains('.') || field.starts_with('$') {
                return Err(StoreError::invalid(format!(
                    "invalid $group output field '{}'",
                    field
                )));
            }
            accumulators.push((field.clone(), Accumulator::from_json(value)?));
        }

        Ok(GroupStage { id, accumulators })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        // Groups in first-seen key order.
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();

        for doc in docs {
            let key = self.id.evaluate(&doc)?;
            let canonical = canonical_json_string(&key);
            match positions.get(&canonical) {
                Some(&idx) => groups[idx].1.push(doc),
                None => {
                    positions.insert(canonical, groups.len());
                    groups.push((key, vec![doc]));
                }
            }
        }

        let mut results = Vec::with_capacity(groups.len());
        for (key, group_docs) in groups {
            let mut result = Map::new();
            result.insert(ID_FIELD.to_string(), key);
            for (field, accumulator) in &self.accumulators {
                result.insert(field.clone(), accumulator.compute(&group_docs)?);
            }
            results.push(Value::Object(result));
        }
        Ok(results)
    }
}

impl Accumulator {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "accumulator")?;
        let (op, value) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => return Err(StoreError::invalid("accumulator must have exactly one operator")),
        };

        match op.as_str() {
            "$sum" => Ok(Accumulator::Sum(Expression::from_json(value)?)),
            "$avg" => Ok(Accumulator::Avg(Expression::from_json(value)?)),
            "$min" => Ok(Accumulator::Min(Expression::from_json(value)?)),
            "$max" => Ok(Accumulator::Max(Expression::from_json(value)?)),
            "$first" => Ok(Accumulator::First(Expression::from_json(value)?)),
            "$last" => Ok(Accumulator::Last(Expression::from_json(value)?)),
            "$count" => match value {
                Value::Object(args) if args.is_empty() => Ok(Accumulator::Count),
                _ => Err(StoreError::invalid("$count accumulator takes {}")),
            },
            _ => Err(StoreError::invalid(format!("unknown accumulator: {}", op))),
        }
    }

    fn values(expr: &Expression, docs: &[Value]) -> Result<Vec<Value>> {
        docs.iter().map(|doc| expr.evaluate(doc)).collect()
    }

    fn compute(&self, docs: &[Value]) -> Result<Value> {
        match self {
            Accumulator::Count => Ok(Value::from(docs.len() as u64)),

            Accumulator::Sum(expr) => {
                let mut sum_int: i64 = 0;
                let mut sum_float: f64 = 0.0;
                let mut has_float = false;

                for value in Self::values(expr, docs)? {
                    match value.as_i64() {
                        Some(n) => match sum_int.checked_add(n) {
                            Some(total) => sum_int = total,
                            None => {
                                sum_float += n as f64;
                                has_float = true;
                            }
                        },
                        None => {
                            if let Some(f) = value.as_f64() {
                                sum_float += f;
                                has_float = true;
                            }
                        }
                    }
                }

                if has_float {
                    Ok(number_value(sum_float + sum_int as f64))
                } else {
                    Ok(Value::from(sum_int))
                }
            }

            Accumulator::Avg(expr) => {
                let nums: Vec<f64> = Self::values(expr, docs)?
                    .iter()
                    .filter_map(Value::as_f64)
                    .collect();
                if nums.is_empty() {
                    Ok(Value::Null)
                } else {
                    Ok(number_value(nums.iter().sum::<f64>() / nums.len() as f64))
                }
            }

            Accumulator::Min(expr) => Ok(Self::extremum(expr, docs, Ordering::Less)?),
            Accumulator::Max(expr) => Ok(Self::extremum(expr, docs, Ordering::Greater)?),

            Accumulator::First(expr) => match docs.first() {
                Some(doc) => expr.evaluate(doc),
                None => Ok(Value::Null),
            },
            Accumulator::Last(expr) => match docs.last() {
                Some(doc) => expr.evaluate(doc),
                None => Ok(Value::Null),
            },
        }
    }

    /// Min or max over the non-null values of a group.
    fn extremum(expr: &Expression, docs: &[Value], keep: Ordering) -> Result<Value> {
        let mut best: Option<Value> = None;
        for value in Self::values(expr, docs)? {
            if value.is_null() {
                continue;
            }
            let replace = match &best {
                None => true,
                Some(current) => compare_values_with_none(Some(&value), Some(current)) == keep,
            };
            if replace {
                best = Some(value);
            }
        }
        Ok(best.unwrap_or(Value::Null))
    }
}

// ===== $lookup =====

impl LookupStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$lookup")?;
        let field = |name: &str| {
            obj.get(name)
                .ok_or_else(|| StoreError::invalid(format!("$lookup requires '{}'", name)))
                .and_then(|v| plain_field_name(v, &format!("$lookup.{}", name)))
        };
        Ok(LookupStage {
            from: field("from")?,
            local_field: field("localField")?,
            foreign_field: field("foreignField")?,
            as_field: field("as")?,
        })
    }

    fn execute(&self, docs: Vec<Value>, source: &dyn LookupSource) -> Vec<Value> {
        let foreign = source.collection_documents(&self.from);

        docs.into_iter()
            .map(|mut doc| {
                let local = resolve_path(&doc, &self.local_field).unwrap_or(Value::Null);
                let matches: Vec<Value> = foreign
                    .iter()
                    .filter(|candidate| {
                        let theirs =
                            resolve_path(candidate, &self.foreign_field).unwrap_or(Value::Null);
                        join_keys_match(&local, &theirs)
                    })
                    .cloned()
                    .collect();
                set_nested_value(&mut doc, &self.as_field, Value::Array(matches));
                doc
            })
            .collect()
    }
}

/// Equality with membership on either side when it holds an array.
fn join_keys_match(local: &Value, foreign: &Value) -> bool {
    if values_equal(local, foreign) {
        return true;
    }
    match (local, foreign) {
        (Value::Array(items), other) | (other, Value::Array(items)) => {
            items.iter().any(|item| values_equal(item, other))
        }
        _ => false,
    }
}

// ===== $project =====

impl ProjectStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$project")?;
        if obj.is_empty() {
            return Err(StoreError::invalid("$project requires at least one field"));
        }

        let mut fields = Vec::new();
        let mut include_id = true;
        for (field, value) in obj {
            let projected = match value {
                Value::Bool(b) => flag(*b),
                Value::Number(n) => flag(n.as_f64().map_or(false, |f| f != 0.0)),
                other => ProjectField::Computed(Expression::from_json(other)?),
            };
            if field == ID_FIELD {
                if let ProjectField::Exclude = projected {
                    include_id = false;
                    continue;
                }
            }
            fields.push((field.clone(), projected));
        }

        let excludes = fields
            .iter()
            .any(|(_, f)| matches!(f, ProjectField::Exclude));
        let includes = fields
            .iter()
            .any(|(name, f)| name != ID_FIELD && !matches!(f, ProjectField::Exclude));
        if excludes && includes {
            return Err(StoreError::invalid(
                "$project cannot mix inclusion and exclusion",
            ));
        }
        let exclusion = excludes || (fields.is_empty() && !include_id);

        Ok(ProjectStage {
            fields,
            include_id,
            exclusion,
        })
    }

    fn execute(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        docs.into_iter().map(|doc| self.project_document(doc)).collect()
    }

    fn project_document(&self, doc: Value) -> Result<Value> {
        if self.exclusion {
            let mut out = doc;
            for (field, _) in &self.fields {
                remove_nested_value(&mut out, field);
            }
            if !self.include_id {
                remove_nested_value(&mut out, ID_FIELD);
            }
            return Ok(out);
        }

        let mut out = Value::Object(Map::new());
        if self.include_id {
            if let Some(id) = doc.get(ID_FIELD) {
                set_nested_value(&mut out, ID_FIELD, id.clone());
            }
        }
        for (field, projected) in &self.fields {
            match projected {
                ProjectField::Include => {
                    if let Some(value) = get_nested_value(&doc, field) {
                        set_nested_value(&mut out, field, value.clone());
                    }
                }
                ProjectField::Computed(expr) => {
                    set_nested_value(&mut out, field, expr.evaluate(&doc)?);
                }
                ProjectField::Exclude => {}
            }
        }
        Ok(out)
    }
}

fn flag(include: bool) -> ProjectField {
    if include {
        ProjectField::Include
    } else {
        ProjectField::Exclude
    }
}

// ===== $sort / $limit / $skip / $count =====

impl SortStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let obj = stage_object(spec, "$sort")?;
        if obj.is_empty() {
            return Err(StoreError::invalid("$sort requires at least one field"));
        }

        let mut fields = Vec::new();
        for (field, value) in obj {
            let direction = match value.as_i64() {
                Some(1) => SortDirection::Ascending,
                Some(-1) => SortDirection::Descending,
                _ => return Err(StoreError::invalid("sort direction must be 1 or -1")),
            };
            fields.push((field.clone(), direction));
        }
        Ok(SortStage { fields })
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for (field, direction) in &self.fields {
            let cmp = compare_values_with_none(get_nested_value(a, field), get_nested_value(b, field));
            let cmp = match direction {
                SortDirection::Ascending => cmp,
                SortDirection::Descending => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }

    fn execute(&self, mut docs: Vec<Value>) -> Vec<Value> {
        // sort_by is stable: ties keep their input order
        docs.sort_by(|a, b| self.compare(a, b));
        docs
    }
}

fn non_negative(spec: &Value, stage: &str) -> Result<usize> {
    match spec.as_i64() {
        Some(n) if n >= 0 => Ok(n as usize),
        Some(n) => Err(StoreError::invalid(format!(
            "{} must be non-negative, got {}",
            stage, n
        ))),
        None => match spec.as_f64() {
            Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as usize),
            _ => Err(StoreError::invalid(format!(
                "{} must be a non-negative integer",
                stage
            ))),
        },
    }
}

impl LimitStage {
    fn from_json(spec: &Value) -> Result<Self> {
        Ok(LimitStage {
            limit: non_negative(spec, "$limit")?,
        })
    }
}

impl SkipStage {
    fn from_json(spec: &Value) -> Result<Self> {
        Ok(SkipStage {
            skip: non_negative(spec, "$skip")?,
        })
    }
}

impl CountStage {
    fn from_json(spec: &Value) -> Result<Self> {
        let field = plain_field_name(spec, "$count")?;
        if field.contains('.') {
            return Err(StoreError::invalid("$count field cannot contain '.'"));
        }
        Ok(CountStage { field })
    }

    fn execute(&self, docs: Vec<Value>) -> Vec<Value> {
        if docs.is_empty() {
            return Vec::new();
        }
        let mut out = Map::new();
        out.insert(self.field.clone(), Value::from(docs.len() as u64));
        vec![Value::Object(out)]
    }
}
