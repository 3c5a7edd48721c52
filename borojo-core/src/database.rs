// borojo-core/src/database.rs
// Database handle, shared collection catalog and per-collection handles
//
// All collections live in one `Catalog` behind a single RwLock. Direct
// writes through a `CollectionHandle` take the write lock for one operation;
// transactions clone the catalog at `begin()` and merge back at commit.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::aggregation::{LookupSource, Pipeline};
use crate::collection::Collection;
use crate::config::DatabaseConfig;
use crate::document::{Document, DocumentId};
use crate::error::{Result, StoreError};
use crate::find_options::FindOptions;
use crate::index::{ExplainReport, IndexDescriptor};
use crate::query::operators::set_regex_cache_capacity;
use crate::query::Query;
use crate::transaction::{StagedWrite, Transaction};
use crate::update::{UpdateOptions, UpdateResult, UpdateSpec};
use crate::value_utils::canonical_json_string;

/// Result of insert_many operation
#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<DocumentId>,
    pub inserted_count: usize,
}

// ============================================================================
// CATALOG
// ============================================================================

/// What a single write operation did.
#[derive(Debug, Default)]
pub(crate) struct WriteSummary {
    /// Documents the filter selected.
    pub matched: u64,
    /// Written identities and the version each carried before the write
    /// (`None` when the document did not exist).
    pub touched: Vec<(DocumentId, Option<u64>)>,
}

/// The full set of collections plus the last commit version.
///
/// Write operations are shared by direct handles and transactions: each one
/// runs on a clone of the target collection that is swapped in only when the
/// whole operation, reference checks included, succeeded.
#[derive(Debug, Clone, Default)]
pub(crate) struct Catalog {
    collections: HashMap<String, Collection>,
    version: u64,
}

impl Catalog {
    pub(crate) fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn drop_collection(&mut self, name: &str) -> bool {
        let dropped = self.collections.remove(name).is_some();
        if dropped {
            self.version += 1;
            debug!(collection = %name, "collection dropped");
        }
        dropped
    }

    pub(crate) fn get(&self, name: &str, id: &DocumentId) -> Option<Arc<Document>> {
        self.collections.get(name)?.get(id).cloned()
    }

    pub(crate) fn find(&self, name: &str, query: &Query) -> Result<Vec<Arc<Document>>> {
        match self.collections.get(name) {
            Some(coll) => Ok(coll.find_matching(query)?.docs),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn explain(&self, name: &str, query: &Query) -> Result<ExplainReport> {
        match self.collections.get(name) {
            Some(coll) => coll.explain(query),
            None => Collection::new(name).explain(query),
        }
    }

    pub(crate) fn documents(&self, name: &str) -> Vec<Value> {
        self.collections
            .get(name)
            .map(|coll| coll.documents().map(|doc| doc.to_value()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn aggregate(&self, name: &str, pipeline: &Pipeline) -> Result<Vec<Value>> {
        pipeline.execute(self.documents(name), self)
    }

    pub(crate) fn insert(&mut self, name: &str, docs: Vec<Document>) -> Result<WriteSummary> {
        if docs.is_empty() {
            return Ok(WriteSummary::default());
        }
        self.write(name, |coll, version| {
            let mut summary = WriteSummary::default();
            for doc in docs {
                let id = doc.id().clone();
                coll.insert(Arc::new(doc), version)?;
                summary.touched.push((id, None));
            }
            summary.matched = summary.touched.len() as u64;
            Ok(summary)
        })
    }

    pub(crate) fn update(
        &mut self,
        name: &str,
        query: &Query,
        spec: &UpdateSpec,
        options: &UpdateOptions,
        multi: bool,
    ) -> Result<WriteSummary> {
        let mut targets = self.find(name, query)?;
        if !multi {
            targets.truncate(1);
        }
        if targets.is_empty() {
            return Ok(WriteSummary::default());
        }
        let matched = targets.len() as u64;

        self.write(name, |coll, version| {
            let mut summary = WriteSummary {
                matched,
                touched: Vec::new(),
            };
            for doc in targets {
                let updated = match spec.apply(&doc, options) {
                    Ok(Some(updated)) => updated,
                    Ok(None) => continue,
                    Err(err @ StoreError::TypeMismatch { .. })
                        if multi && options.skip_type_mismatch =>
                    {
                        debug!(collection = %name, id = %doc.id(), error = %err, "update skipped");
                        continue;
                    }
                    Err(err) => return Err(err),
                };
                let before = coll.version_of(doc.id());
                coll.replace(Arc::new(updated), version)?;
                summary.touched.push((doc.id().clone(), before));
            }
            Ok(summary)
        })
    }

    pub(crate) fn delete(&mut self, name: &str, query: &Query, multi: bool) -> Result<WriteSummary> {
        let mut targets = self.find(name, query)?;
        if !multi {
            targets.truncate(1);
        }
        let ids = targets.iter().map(|doc| doc.id().clone()).collect();
        self.delete_ids(name, ids)
    }

    pub(crate) fn delete_ids(&mut self, name: &str, ids: Vec<DocumentId>) -> Result<WriteSummary> {
        if ids.is_empty() || !self.collections.contains_key(name) {
            return Ok(WriteSummary::default());
        }
        self.write(name, |coll, _version| {
            let mut summary = WriteSummary::default();
            for id in ids {
                let before = coll.version_of(&id);
                if coll.remove(&id).is_some() {
                    summary.touched.push((id, before));
                }
            }
            summary.matched = summary.touched.len() as u64;
            Ok(summary)
        })
    }

    /// Run `op` on a clone of `name`, check declared references of the
    /// documents it wrote, then swap the clone in.
    ///
    /// The clone copies every document handle and index entry, so each
    /// direct write costs O(n) in the collection size. Use a transaction
    /// or `insert_many`/`update_many` to pay it once for a batch.
    fn write<F>(&mut self, name: &str, op: F) -> Result<WriteSummary>
    where
        F: FnOnce(&mut Collection, u64) -> Result<WriteSummary>,
    {
        let version = self.version + 1;
        let mut working = match self.collections.get(name) {
            Some(coll) => coll.clone(),
            None => Collection::new(name),
        };

        let summary = op(&mut working, version)?;
        if summary.touched.is_empty() {
            return Ok(summary);
        }

        let written = summary.touched.iter().filter_map(|(id, _)| working.get(id));
        check_references(&working, written, |target| {
            if target == name {
                Some(&working)
            } else {
                self.collections.get(target)
            }
        })?;

        if !self.collections.contains_key(name) {
            debug!(collection = %name, "collection created");
        }
        self.collections.insert(name.to_string(), working);
        self.version = version;
        Ok(summary)
    }

    // ========== INDEXES AND REFERENCES ==========

    pub(crate) fn create_index(&mut self, name: &str, descriptor: IndexDescriptor) -> Result<String> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Collection::new(name))
            .create_index(descriptor)
    }

    pub(crate) fn drop_index(&mut self, name: &str, index_name: &str) -> Result<()> {
        match self.collections.get_mut(name) {
            Some(coll) => coll.drop_index(index_name),
            None => Err(StoreError::NotFound(format!("index '{}'", index_name))),
        }
    }

    pub(crate) fn list_indexes(&self, name: &str) -> Vec<IndexDescriptor> {
        match self.collections.get(name) {
            Some(coll) => coll.list_indexes(),
            None => Collection::new(name).list_indexes(),
        }
    }

    /// Register `name.field -> target._id`. Documents already stored must
    /// satisfy it.
    pub(crate) fn declare_reference(&mut self, name: &str, field: &str, target: &str) -> Result<()> {
        if field.is_empty() || target.is_empty() {
            return Err(StoreError::invalid("reference field and target must be non-empty"));
        }
        let mut working = match self.collections.get(name) {
            Some(coll) => coll.clone(),
            None => Collection::new(name),
        };
        if !working.add_reference(field, target) {
            return Ok(());
        }

        check_references(&working, working.documents(), |t| {
            if t == name {
                Some(&working)
            } else {
                self.collections.get(t)
            }
        })?;

        debug!(collection = %name, field, target, "reference declared");
        self.collections.insert(name.to_string(), working);
        Ok(())
    }

    // ========== COMMIT ==========

    /// Every staged document must still carry the version its transaction
    /// saw in the snapshot.
    pub(crate) fn check_conflicts(&self, writes: &[StagedWrite]) -> Result<()> {
        for write in writes {
            let current = self
                .collections
                .get(&write.collection)
                .and_then(|coll| coll.version_of(&write.id));
            if current != write.seen {
                return Err(StoreError::Conflict {
                    collection: write.collection.clone(),
                    id: write.id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Copy the final state of each staged document from `working` into
    /// clones of the touched collections and swap them in together.
    pub(crate) fn apply_staged(&mut self, writes: &[StagedWrite], working: &Catalog) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let version = self.version + 1;

        // final state per collection: ids gone from the working copy and
        // documents present in it, each id once
        let mut finals: HashMap<&str, (Vec<DocumentId>, Vec<Arc<Document>>)> = HashMap::new();
        let mut seen: HashSet<(&str, &DocumentId)> = HashSet::new();
        for write in writes {
            if !seen.insert((write.collection.as_str(), &write.id)) {
                continue;
            }
            let (removed, docs) = finals.entry(write.collection.as_str()).or_default();
            match working.get(&write.collection, &write.id) {
                Some(doc) => docs.push(doc),
                None => removed.push(write.id.clone()),
            }
        }

        let mut staged: HashMap<String, Collection> = HashMap::new();
        for (name, (removed, docs)) in &finals {
            let mut coll = match self.collections.get(*name) {
                Some(coll) => coll.clone(),
                None => Collection::new(*name),
            };
            coll.merge(removed, docs, version)?;
            staged.insert(name.to_string(), coll);
        }

        for (name, coll) in &staged {
            let written = writes
                .iter()
                .filter(|write| &write.collection == name)
                .filter_map(|write| coll.get(&write.id));
            check_references(coll, written, |target| {
                staged
                    .get(target)
                    .or_else(|| self.collections.get(target))
            })?;
        }

        for (name, coll) in staged {
            if !self.collections.contains_key(&name) {
                debug!(collection = %name, "collection created");
            }
            self.collections.insert(name, coll);
        }
        self.version = version;
        Ok(())
    }
}

impl LookupSource for Catalog {
    fn collection_documents(&self, name: &str) -> Vec<Value> {
        self.documents(name)
    }
}

/// Fail with `DanglingReference` when a written document holds a value in a
/// referencing field that is not an `_id` of the target collection. Missing
/// and null fields are allowed; arrays are checked element by element.
fn check_references<'a, 'c, I, L>(collection: &Collection, written: I, lookup: L) -> Result<()>
where
    I: IntoIterator<Item = &'a Arc<Document>>,
    L: Fn(&str) -> Option<&'c Collection>,
{
    if collection.references().is_empty() {
        return Ok(());
    }
    for doc in written {
        for reference in collection.references() {
            let values: Vec<&Value> = match doc.get(&reference.field) {
                None | Some(Value::Null) => continue,
                Some(Value::Array(items)) => items.iter().collect(),
                Some(value) => vec![value],
            };
            let target = lookup(&reference.target);
            for value in values.into_iter().filter(|v| !v.is_null()) {
                let resolved = DocumentId::from_value(value)
                    .ok()
                    .and_then(|id| target.and_then(|t| t.get(&id)))
                    .is_some();
                if !resolved {
                    return Err(StoreError::DanglingReference {
                        collection: collection.name().to_string(),
                        field: reference.field.clone(),
                        target: reference.target.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// DATABASE
// ============================================================================

#[derive(Debug)]
struct DatabaseInner {
    catalog: RwLock<Catalog>,
    config: DatabaseConfig,
    next_tx_id: AtomicU64,
}

/// In-process document store.
///
/// Cheap to clone; clones share the same collections. There is no global
/// instance: every caller holds an explicit `Database` value.
///
/// ```
/// use borojo_core::Database;
/// use serde_json::json;
///
/// let db = Database::new();
/// let productos = db.collection("productos");
/// productos.insert_one(json!({"_id": 1, "nombre": "Borojó", "stock": 30})).unwrap();
/// assert_eq!(productos.count_documents(&json!({"stock": {"$gt": 20}})).unwrap(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        Self::with_config(DatabaseConfig::default())
    }

    /// Create a database with explicit settings. The regex cache capacity is
    /// process-wide, so the last configured database wins.
    pub fn with_config(config: DatabaseConfig) -> Self {
        set_regex_cache_capacity(config.regex_cache_capacity);
        debug!(regex_cache_capacity = config.regex_cache_capacity, "database created");
        Database {
            inner: Arc::new(DatabaseInner {
                catalog: RwLock::new(Catalog::default()),
                config,
                next_tx_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Handle to a collection. The collection itself is created on first write.
    pub fn collection(&self, name: &str) -> CollectionHandle {
        CollectionHandle {
            db: self.clone(),
            name: name.to_string(),
        }
    }

    /// Names of existing collections, sorted.
    pub fn list_collections(&self) -> Vec<String> {
        self.inner.catalog.read().names()
    }

    pub fn drop_collection(&self, name: &str) -> bool {
        self.inner.catalog.write().drop_collection(name)
    }

    /// Run an aggregation pipeline over `collection`. `$lookup` stages read
    /// the same consistent state.
    pub fn aggregate(&self, collection: &str, pipeline: &Value) -> Result<Vec<Value>> {
        let pipeline = Pipeline::from_json(pipeline)?;
        self.inner.catalog.read().aggregate(collection, &pipeline)
    }

    /// Start a transaction on a snapshot of every collection.
    pub fn begin(&self) -> Transaction {
        let id = self.inner.next_tx_id.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.inner.catalog.read().clone();
        Transaction::new(id, self.clone(), snapshot)
    }

    /// Run `f` inside a transaction: commit when it returns `Ok`, abort when
    /// it returns `Err`. A commit failure is returned as the error.
    pub fn with_transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Transaction) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin();
        match f(&mut tx) {
            Ok(value) => {
                if tx.is_active() {
                    tx.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                if tx.is_active() {
                    tx.abort()?;
                }
                Err(err)
            }
        }
    }

    pub(crate) fn catalog(&self) -> &RwLock<Catalog> {
        &self.inner.catalog
    }
}

// ============================================================================
// COLLECTION HANDLE
// ============================================================================

/// Named access to one collection of a [`Database`].
///
/// Every method is a single atomic operation against the shared state.
#[derive(Debug, Clone)]
pub struct CollectionHandle {
    db: Database,
    name: String,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    // ========== INSERT ==========

    /// Insert one document; `_id` is generated when absent.
    pub fn insert_one(&self, doc: Value) -> Result<DocumentId> {
        let doc = Document::from_value(doc)?;
        let id = doc.id().clone();
        self.db.catalog().write().insert(&self.name, vec![doc])?;
        Ok(id)
    }

    /// Insert a batch; either every document is stored or none is.
    pub fn insert_many(&self, docs: Vec<Value>) -> Result<InsertManyResult> {
        let docs = docs
            .into_iter()
            .map(Document::from_value)
            .collect::<Result<Vec<_>>>()?;
        let inserted_ids: Vec<DocumentId> = docs.iter().map(|doc| doc.id().clone()).collect();
        self.db.catalog().write().insert(&self.name, docs)?;
        Ok(InsertManyResult {
            inserted_count: inserted_ids.len(),
            inserted_ids,
        })
    }

    // ========== QUERY ==========

    /// Lazy, restartable result set for `filter`.
    pub fn find(&self, filter: &Value) -> Result<FindCursor> {
        Ok(FindCursor {
            db: self.db.clone(),
            collection: self.name.clone(),
            query: Query::from_json(filter)?,
            options: FindOptions::new(),
        })
    }

    pub fn find_one(&self, filter: &Value) -> Result<Option<Value>> {
        let query = Query::from_json(filter)?;
        let docs = self.db.catalog().read().find(&self.name, &query)?;
        Ok(docs.first().map(|doc| doc.to_value()))
    }

    pub fn find_with_options(&self, filter: &Value, options: &FindOptions) -> Result<Vec<Value>> {
        options.validate()?;
        self.find(filter)?.with_options(options.clone()).to_vec()
    }

    pub fn find_by_id(&self, id: impl Into<DocumentId>) -> Option<Document> {
        let id = id.into();
        self.db
            .catalog()
            .read()
            .get(&self.name, &id)
            .map(|doc| Document::clone(&doc))
    }

    /// Like `find_by_id`, but a miss is `NotFound`.
    pub fn get_by_id(&self, id: impl Into<DocumentId>) -> Result<Document> {
        let id = id.into();
        self.find_by_id(id.clone())
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", self.name, id)))
    }

    pub fn count_documents(&self, filter: &Value) -> Result<u64> {
        let query = Query::from_json(filter)?;
        let docs = self.db.catalog().read().find(&self.name, &query)?;
        Ok(docs.len() as u64)
    }

    /// Distinct values of `field` among documents matching `filter`, in
    /// first-seen order. Array values contribute their elements.
    pub fn distinct(&self, field: &str, filter: &Value) -> Result<Vec<Value>> {
        let query = Query::from_json(filter)?;
        let docs = self.db.catalog().read().find(&self.name, &query)?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut distinct_values = Vec::new();
        for doc in &docs {
            let values: Vec<&Value> = match doc.get(field) {
                None => continue,
                Some(Value::Array(items)) => items.iter().collect(),
                Some(value) => vec![value],
            };
            for value in values {
                if seen.insert(canonical_json_string(value)) {
                    distinct_values.push(value.clone());
                }
            }
        }
        Ok(distinct_values)
    }

    pub fn explain(&self, filter: &Value) -> Result<ExplainReport> {
        let query = Query::from_json(filter)?;
        self.db.catalog().read().explain(&self.name, &query)
    }

    // ========== UPDATE ==========

    /// Update the first matching document (insertion order), with the
    /// database's configured update policy.
    pub fn update_one(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        self.update_one_with(filter, update, &self.db.config().update)
    }

    pub fn update_one_with(&self, filter: &Value, update: &Value, options: &UpdateOptions) -> Result<UpdateResult> {
        self.update(filter, update, options, false)
    }

    /// Update every matching document. By default a failure on any document
    /// leaves all of them unchanged.
    pub fn update_many(&self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        self.update_many_with(filter, update, &self.db.config().update)
    }

    pub fn update_many_with(&self, filter: &Value, update: &Value, options: &UpdateOptions) -> Result<UpdateResult> {
        self.update(filter, update, options, true)
    }

    fn update(&self, filter: &Value, update: &Value, options: &UpdateOptions, multi: bool) -> Result<UpdateResult> {
        let query = Query::from_json(filter)?;
        let spec = UpdateSpec::from_json(update)?;
        let summary = self
            .db
            .catalog()
            .write()
            .update(&self.name, &query, &spec, options, multi)?;
        Ok(UpdateResult {
            matched: summary.matched,
            modified: summary.touched.len() as u64,
        })
    }

    // ========== DELETE ==========

    pub fn delete_by_id(&self, id: impl Into<DocumentId>) -> Result<u64> {
        let summary = self.db.catalog().write().delete_ids(&self.name, vec![id.into()])?;
        Ok(summary.touched.len() as u64)
    }

    pub fn delete_one(&self, filter: &Value) -> Result<u64> {
        self.delete(filter, false)
    }

    pub fn delete_many(&self, filter: &Value) -> Result<u64> {
        self.delete(filter, true)
    }

    fn delete(&self, filter: &Value, multi: bool) -> Result<u64> {
        let query = Query::from_json(filter)?;
        let summary = self.db.catalog().write().delete(&self.name, &query, multi)?;
        Ok(summary.touched.len() as u64)
    }

    // ========== AGGREGATION ==========

    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        self.db.aggregate(&self.name, pipeline)
    }

    // ========== INDEXES ==========

    /// Create an index from a key document such as `{"categoria": 1, "precio": -1}`.
    /// Returns the index name.
    pub fn create_index(&self, keys: &Value, unique: bool) -> Result<String> {
        let descriptor = IndexDescriptor::from_keys(keys, unique)?;
        self.db.catalog().write().create_index(&self.name, descriptor)
    }

    pub fn drop_index(&self, index_name: &str) -> Result<()> {
        self.db.catalog().write().drop_index(&self.name, index_name)
    }

    /// Index descriptions (`name`, `key`, `unique`), `_id_` first.
    pub fn list_indexes(&self) -> Vec<Value> {
        self.db
            .catalog()
            .read()
            .list_indexes(&self.name)
            .iter()
            .map(IndexDescriptor::to_json)
            .collect()
    }

    // ========== REFERENCES ==========

    /// Require every value of `field` to be an `_id` in `target`.
    pub fn declare_reference(&self, field: &str, target: &str) -> Result<()> {
        self.db
            .catalog()
            .write()
            .declare_reference(&self.name, field, target)
    }
}

// ============================================================================
// FIND CURSOR
// ============================================================================

/// Result set of a `find`. Nothing is read until `iter()` or `to_vec()`,
/// and every call evaluates the filter against the current state again.
#[derive(Debug, Clone)]
pub struct FindCursor {
    db: Database,
    collection: String,
    query: Query,
    options: FindOptions,
}

impl FindCursor {
    pub fn sort(mut self, sort: Vec<(String, i32)>) -> Self {
        self.options.sort = Some(sort);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.options.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn projection(mut self, projection: Vec<(String, i32)>) -> Self {
        self.options.projection = Some(projection);
        self
    }

    pub fn with_options(mut self, options: FindOptions) -> Self {
        self.options = options;
        self
    }

    pub fn to_vec(&self) -> Result<Vec<Value>> {
        self.options.validate()?;
        let docs = self
            .db
            .catalog()
            .read()
            .find(&self.collection, &self.query)?;
        let values = docs.iter().map(|doc| doc.to_value()).collect();
        Ok(self.options.apply(values))
    }

    pub fn iter(&self) -> Result<std::vec::IntoIter<Value>> {
        Ok(self.to_vec()?.into_iter())
    }
}
