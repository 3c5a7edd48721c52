// borojo-core/src/index.rs
// Secondary indexes: ordered key → document maps, unique constraints and
// the query planner that picks an index for a filter.

use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::document::{Document, DocumentId, ID_FIELD};
use crate::error::{Result, StoreError};
use crate::query::operators::field_through_arrays;
use crate::value_utils::canonical_json_string;

/// Name of the implicit identity index every collection has.
pub const ID_INDEX_NAME: &str = "_id_";

// ============================================================================
// INDEX KEYS
// ============================================================================

/// Index key - supported types for indexing
///
/// Integers and floats share the `Number` variant so `5000` and `5000.0`
/// collide in unique indexes and compare equal in scans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexKey {
    Null,
    Number(OrderedFloat),
    String(String),
    Bool(bool),
    /// Arrays and embedded documents, keyed by their canonical JSON.
    Other(String),
    /// Compound key for multi-field indexes (e.g., ["categoria", "precio"])
    Compound(Vec<IndexKey>),
}

/// OrderedFloat wrapper for f64 to enable Ord
#[derive(Debug, Clone, Copy)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedFloat {}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal),
        }
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => n
                .as_f64()
                .map_or(IndexKey::Null, |f| IndexKey::Number(OrderedFloat(f))),
            Value::String(s) => IndexKey::String(s.clone()),
            other => IndexKey::Other(canonical_json_string(other)),
        }
    }
}

impl IndexKey {
    /// Leading component, used for prefix scans on compound indexes.
    fn first(&self) -> &IndexKey {
        match self {
            IndexKey::Compound(parts) => parts.first().unwrap_or(&IndexKey::Null),
            key => key,
        }
    }

    fn type_class(&self) -> u8 {
        match self {
            IndexKey::Null => 0,
            IndexKey::Number(_) => 1,
            IndexKey::String(_) => 2,
            IndexKey::Bool(_) => 3,
            IndexKey::Other(_) => 4,
            IndexKey::Compound(_) => 5,
        }
    }

    /// True when every component is `Null` (all indexed fields missing).
    fn is_all_null(&self) -> bool {
        match self {
            IndexKey::Null => true,
            IndexKey::Compound(parts) => parts.iter().all(|p| *p == IndexKey::Null),
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            IndexKey::Null => "null".to_string(),
            IndexKey::Number(n) => n.0.to_string(),
            IndexKey::String(s) => format!("{:?}", s),
            IndexKey::Bool(b) => b.to_string(),
            IndexKey::Other(json) => json.clone(),
            IndexKey::Compound(parts) => {
                let inner: Vec<String> = parts.iter().map(IndexKey::describe).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }
}

/// Scalars that can drive an index lookup.
fn scalar_key(value: &Value) -> Option<IndexKey> {
    match value {
        Value::Array(_) | Value::Object(_) => None,
        scalar => Some(IndexKey::from(scalar)),
    }
}

// ============================================================================
// DESCRIPTORS
// ============================================================================

/// Index descriptor: ordered `(field, direction)` pairs plus uniqueness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub fields: Vec<(String, i32)>,
    pub unique: bool,
}

impl IndexDescriptor {
    /// Parse a key specification such as `{"categoria": 1, "precio": -1}`.
    ///
    /// The name is derived as `categoria_1_precio_-1`.
    pub fn from_keys(keys: &Value, unique: bool) -> Result<Self> {
        let obj = keys
            .as_object()
            .ok_or_else(|| StoreError::invalid("index keys must be an object"))?;
        if obj.is_empty() {
            return Err(StoreError::invalid("index must have at least one field"));
        }

        let mut fields = Vec::with_capacity(obj.len());
        for (field, dir) in obj {
            if field.is_empty() || field.starts_with('$') {
                return Err(StoreError::invalid(format!("invalid index field '{}'", field)));
            }
            let direction = match dir.as_i64() {
                Some(1) => 1,
                Some(-1) => -1,
                _ => {
                    return Err(StoreError::invalid(format!(
                        "index direction for '{}' must be 1 or -1",
                        field
                    )))
                }
            };
            fields.push((field.clone(), direction));
        }
        if fields.len() == 1 && fields[0].0 == ID_FIELD {
            return Err(StoreError::invalid("the _id index always exists"));
        }

        let name = fields
            .iter()
            .map(|(field, dir)| format!("{}_{}", field, dir))
            .collect::<Vec<_>>()
            .join("_");
        Ok(IndexDescriptor {
            name,
            fields,
            unique,
        })
    }

    fn identity() -> Self {
        IndexDescriptor {
            name: ID_INDEX_NAME.to_string(),
            fields: vec![(ID_FIELD.to_string(), 1)],
            unique: true,
        }
    }

    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }

    /// `{"name": ..., "key": {...}, "unique": ...}`
    pub fn to_json(&self) -> Value {
        let mut key = Map::new();
        for (field, dir) in &self.fields {
            key.insert(field.clone(), Value::from(*dir));
        }
        serde_json::json!({
            "name": self.name,
            "key": key,
            "unique": self.unique,
        })
    }
}

// ============================================================================
// SECONDARY INDEX
// ============================================================================

/// One secondary index: key → positions of the documents holding it.
#[derive(Debug, Clone)]
struct SecondaryIndex {
    descriptor: IndexDescriptor,
    entries: BTreeMap<IndexKey, BTreeSet<u64>>,
    /// Documents whose indexed value is an array.
    multikey_docs: usize,
}

impl SecondaryIndex {
    fn new(descriptor: IndexDescriptor) -> Self {
        SecondaryIndex {
            descriptor,
            entries: BTreeMap::new(),
            multikey_docs: 0,
        }
    }

    fn extract_key(&self, doc: &Document) -> (IndexKey, bool) {
        let mut is_array = false;
        let mut parts: Vec<IndexKey> = self
            .descriptor
            .fields
            .iter()
            .map(|(field, _)| match doc.get(field) {
                Some(value) => {
                    is_array |= value.is_array();
                    IndexKey::from(value)
                }
                None => match field_through_arrays(doc, field) {
                    Some(values) => {
                        is_array = true;
                        IndexKey::from(&values)
                    }
                    None => IndexKey::Null,
                },
            })
            .collect();

        let key = if parts.len() == 1 {
            parts.remove(0)
        } else {
            IndexKey::Compound(parts)
        };
        (key, is_array)
    }

    fn conflicting(&self, key: &IndexKey, seq: u64) -> bool {
        if !self.descriptor.unique || key.is_all_null() {
            return false;
        }
        self.entries
            .get(key)
            .map_or(false, |holders| holders.iter().any(|s| *s != seq))
    }

    fn insert(&mut self, seq: u64, doc: &Document) {
        let (key, is_array) = self.extract_key(doc);
        if is_array {
            self.multikey_docs += 1;
        }
        self.entries.entry(key).or_default().insert(seq);
    }

    fn remove(&mut self, seq: u64, doc: &Document) {
        let (key, is_array) = self.extract_key(doc);
        if is_array {
            self.multikey_docs = self.multikey_docs.saturating_sub(1);
        }
        if let Some(holders) = self.entries.get_mut(&key) {
            holders.remove(&seq);
            if holders.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// Positions whose leading key component satisfies `predicate`, scanning
    /// from `start`, stopping at the first key past the bound's type class.
    fn scan<F>(&self, start: Bound<IndexKey>, class: u8, predicate: F) -> BTreeSet<u64>
    where
        F: Fn(&IndexKey) -> Option<bool>,
    {
        let mut out = BTreeSet::new();
        let range = self.entries.range((start, Bound::Unbounded));
        for (key, holders) in range {
            let first = key.first();
            if first.type_class() != class {
                if first.type_class() > class {
                    break;
                }
                continue;
            }
            match predicate(first) {
                Some(true) => out.extend(holders.iter().copied()),
                Some(false) => {}
                None => break,
            }
        }
        out
    }

    fn lower_start(&self, key: &IndexKey) -> Bound<IndexKey> {
        if self.descriptor.is_compound() {
            Bound::Included(IndexKey::Compound(vec![key.clone()]))
        } else {
            Bound::Included(key.clone())
        }
    }

    fn candidates(&self, predicate: &KeyPredicate) -> BTreeSet<u64> {
        match predicate {
            KeyPredicate::Eq(key) => self.scan(self.lower_start(key), key.type_class(), |k| {
                if k == key {
                    Some(true)
                } else {
                    None
                }
            }),
            KeyPredicate::In(keys) => keys
                .iter()
                .flat_map(|key| self.candidates(&KeyPredicate::Eq(key.clone())))
                .collect(),
            KeyPredicate::Range { lower, upper } => {
                let class = lower
                    .as_ref()
                    .or(upper.as_ref())
                    .map_or(0, |(k, _)| k.type_class());
                let start = match lower {
                    Some((key, _)) => self.lower_start(key),
                    None => Bound::Unbounded,
                };
                self.scan(start, class, |k| {
                    if let Some((hi, inclusive)) = upper {
                        match k.cmp(hi) {
                            Ordering::Greater => return None,
                            Ordering::Equal if !inclusive => return None,
                            _ => {}
                        }
                    }
                    Some(match lower {
                        Some((lo, inclusive)) => match k.cmp(lo) {
                            Ordering::Greater => true,
                            Ordering::Equal => *inclusive,
                            Ordering::Less => false,
                        },
                        None => true,
                    })
                })
            }
        }
    }
}

// ============================================================================
// QUERY PLANNING
// ============================================================================

/// Condition on an index's leading field.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPredicate {
    Eq(IndexKey),
    In(Vec<IndexKey>),
    Range {
        lower: Option<(IndexKey, bool)>,
        upper: Option<(IndexKey, bool)>,
    },
}

impl KeyPredicate {
    /// Derive an index predicate from one field condition, if possible.
    fn from_condition(condition: &Value) -> Option<Self> {
        let ops = match condition {
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => ops,
            literal => return scalar_key(literal).map(KeyPredicate::Eq),
        };

        if let Some(key) = ops.get("$eq").and_then(scalar_key) {
            return Some(KeyPredicate::Eq(key));
        }
        if let Some(Value::Array(items)) = ops.get("$in") {
            let keys: Option<Vec<IndexKey>> = items.iter().map(scalar_key).collect();
            return keys.map(KeyPredicate::In);
        }

        let bound = |a: &str, b: &str| {
            ops.get(a)
                .and_then(scalar_key)
                .map(|k| (k, true))
                .or_else(|| ops.get(b).and_then(scalar_key).map(|k| (k, false)))
        };
        let lower = bound("$gte", "$gt");
        let upper = bound("$lte", "$lt");
        if lower.is_none() && upper.is_none() {
            return None;
        }
        if let (Some((lo, _)), Some((hi, _))) = (&lower, &upper) {
            if lo.type_class() != hi.type_class() {
                return None;
            }
        }
        if lower
            .as_ref()
            .or(upper.as_ref())
            .map_or(false, |(k, _)| matches!(k, IndexKey::Null | IndexKey::Other(_)))
        {
            return None;
        }
        Some(KeyPredicate::Range { lower, upper })
    }

    fn rank(&self) -> u8 {
        match self {
            KeyPredicate::Eq(_) => 0,
            KeyPredicate::In(_) => 1,
            KeyPredicate::Range { .. } => 2,
        }
    }
}

/// How a filter will be evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Every document is examined.
    CollectionScan,
    /// Equality or `$in` on `_id`.
    IdLookup(Vec<DocumentId>),
    /// Leading field of a secondary index.
    IndexScan {
        index_name: String,
        predicate: KeyPredicate,
    },
}

impl QueryPlan {
    pub fn stage_name(&self) -> &'static str {
        match self {
            QueryPlan::CollectionScan => "COLLSCAN",
            QueryPlan::IdLookup(_) | QueryPlan::IndexScan { .. } => "IXSCAN",
        }
    }

    pub fn index_name(&self) -> Option<&str> {
        match self {
            QueryPlan::CollectionScan => None,
            QueryPlan::IdLookup(_) => Some(ID_INDEX_NAME),
            QueryPlan::IndexScan { index_name, .. } => Some(index_name),
        }
    }
}

fn id_plan(condition: &Value) -> Option<QueryPlan> {
    let ids = match KeyPredicate::from_condition(condition)? {
        KeyPredicate::Eq(_) => {
            let raw = match condition {
                Value::Object(ops) => ops.get("$eq")?,
                literal => literal,
            };
            vec![DocumentId::from_value(raw).ok()?]
        }
        KeyPredicate::In(_) => match condition.get("$in")? {
            Value::Array(items) => items
                .iter()
                .filter_map(|v| DocumentId::from_value(v).ok())
                .collect(),
            _ => return None,
        },
        KeyPredicate::Range { .. } => return None,
    };
    Some(QueryPlan::IdLookup(ids))
}

// ============================================================================
// INDEX MANAGER
// ============================================================================

/// Index Manager - manages all secondary indexes of a collection
#[derive(Debug, Clone, Default)]
pub struct IndexManager {
    indexes: Vec<SecondaryIndex>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a new index over `docs`.
    ///
    /// Re-creating an identical index is a no-op; a different index under
    /// the same name is `InvalidArgument`. A unique index whose keys already
    /// collide is not created (`DuplicateKey`).
    pub fn create_index<'a, I>(
        &mut self,
        collection: &str,
        descriptor: IndexDescriptor,
        docs: I,
    ) -> Result<String>
    where
        I: IntoIterator<Item = (u64, &'a Document)>,
    {
        if let Some(existing) = self.get(&descriptor.name) {
            if existing.descriptor == descriptor {
                return Ok(descriptor.name);
            }
            return Err(StoreError::invalid(format!(
                "index '{}' already exists with different options",
                descriptor.name
            )));
        }

        let mut index = SecondaryIndex::new(descriptor);
        for (seq, doc) in docs {
            let (key, _) = index.extract_key(doc);
            if index.conflicting(&key, seq) {
                return Err(duplicate(collection, &index.descriptor.name, &key));
            }
            index.insert(seq, doc);
        }

        let name = index.descriptor.name.clone();
        self.indexes.push(index);
        Ok(name)
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        if name == ID_INDEX_NAME {
            return Err(StoreError::invalid("cannot drop the _id index"));
        }
        let before = self.indexes.len();
        self.indexes.retain(|idx| idx.descriptor.name != name);
        if self.indexes.len() == before {
            return Err(StoreError::NotFound(format!("index '{}'", name)));
        }
        Ok(())
    }

    /// All indexes, the implicit `_id_` first, then in creation order.
    pub fn list(&self) -> Vec<IndexDescriptor> {
        std::iter::once(IndexDescriptor::identity())
            .chain(self.indexes.iter().map(|idx| idx.descriptor.clone()))
            .collect()
    }

    fn get(&self, name: &str) -> Option<&SecondaryIndex> {
        self.indexes.iter().find(|idx| idx.descriptor.name == name)
    }

    /// Fail with `DuplicateKey` if storing `doc` at `seq` would break a
    /// unique index. `seq` itself is ignored, so an update may keep its key.
    pub fn check_unique(&self, collection: &str, seq: u64, doc: &Document) -> Result<()> {
        for index in &self.indexes {
            let (key, _) = index.extract_key(doc);
            if index.conflicting(&key, seq) {
                return Err(duplicate(collection, &index.descriptor.name, &key));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, seq: u64, doc: &Document) {
        for index in &mut self.indexes {
            index.insert(seq, doc);
        }
    }

    pub fn remove(&mut self, seq: u64, doc: &Document) {
        for index in &mut self.indexes {
            index.remove(seq, doc);
        }
    }

    /// Choose a plan for `filter`: `_id` lookups first, then the index with
    /// the most selective predicate on its leading field. Multikey indexes
    /// are never used.
    pub fn plan(&self, filter: &Value) -> QueryPlan {
        let conditions = match filter.as_object() {
            Some(obj) => obj,
            None => return QueryPlan::CollectionScan,
        };

        if let Some(plan) = conditions.get(ID_FIELD).and_then(id_plan) {
            return plan;
        }

        let mut best: Option<(u8, &SecondaryIndex, KeyPredicate)> = None;
        for index in &self.indexes {
            if index.multikey_docs > 0 {
                continue;
            }
            let leading = &index.descriptor.fields[0].0;
            let predicate = match conditions.get(leading).and_then(KeyPredicate::from_condition) {
                Some(p) => p,
                None => continue,
            };
            let rank = predicate.rank();
            if best.as_ref().map_or(true, |(r, _, _)| rank < *r) {
                best = Some((rank, index, predicate));
            }
        }

        match best {
            Some((_, index, predicate)) => QueryPlan::IndexScan {
                index_name: index.descriptor.name.clone(),
                predicate,
            },
            None => QueryPlan::CollectionScan,
        }
    }

    /// Candidate positions for an index scan, in ascending position order.
    pub fn candidates(&self, index_name: &str, predicate: &KeyPredicate) -> BTreeSet<u64> {
        self.get(index_name)
            .map(|index| index.candidates(predicate))
            .unwrap_or_default()
    }
}

fn duplicate(collection: &str, index_name: &str, key: &IndexKey) -> StoreError {
    StoreError::DuplicateKey {
        collection: collection.to_string(),
        key: format!("{}: {}", index_name, key.describe()),
    }
}

/// Serializable view of an explain result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainReport {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    pub docs_examined: u64,
    pub n_returned: u64,
}
