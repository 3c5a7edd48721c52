// borojo-core/src/transaction.rs
//! Multi-collection transactions.
//!
//! A transaction reads and writes a private copy of the catalog taken at
//! `begin()`. Commit re-checks, under the store's write lock, that nothing it
//! wrote was changed by someone else since the snapshot, then installs the
//! final state of every written document in one step.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

use crate::aggregation::Pipeline;
use crate::database::{Catalog, Database, InsertManyResult, WriteSummary};
use crate::document::{Document, DocumentId};
use crate::error::{Result, StoreError};
use crate::find_options::FindOptions;
use crate::query::Query;
use crate::update::{UpdateOptions, UpdateResult, UpdateSpec};

pub type TransactionId = u64;

/// State of a transaction. `Committed` and `Aborted` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// First write of a transaction to one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StagedWrite {
    pub collection: String,
    pub id: DocumentId,
    /// Version in the snapshot, `None` if the document did not exist.
    pub seen: Option<u64>,
}

/// An open unit of work over any number of collections.
///
/// Dropping an active transaction aborts it.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    db: Database,
    state: TransactionState,
    working: Catalog,
    log: Vec<StagedWrite>,
    written: HashSet<(String, DocumentId)>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, db: Database, snapshot: Catalog) -> Self {
        debug!(tx = id, "transaction started");
        Transaction {
            id,
            db,
            state: TransactionState::Active,
            working: snapshot,
            log: Vec::new(),
            written: HashSet::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Number of distinct documents written so far.
    pub fn write_count(&self) -> usize {
        self.log.len()
    }

    /// Collection view bound to this transaction.
    pub fn collection(&mut self, name: &str) -> TxCollection<'_> {
        TxCollection {
            tx: self,
            name: name.to_string(),
        }
    }

    /// Install every staged write, or none of them.
    ///
    /// Fails with `Conflict` when another commit changed a document this
    /// transaction wrote, and with `DuplicateKey` / `DanglingReference` when
    /// the merged state would break a unique index or a declared reference.
    /// On failure the transaction ends `Aborted`.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;

        let outcome = {
            let mut catalog = self.db.catalog().write();
            catalog
                .check_conflicts(&self.log)
                .and_then(|()| catalog.apply_staged(&self.log, &self.working))
        };
        let writes = self.log.len();
        self.release();

        match outcome {
            Ok(()) => {
                self.state = TransactionState::Committed;
                debug!(tx = self.id, writes, "transaction committed");
                Ok(())
            }
            Err(err) => {
                self.state = TransactionState::Aborted;
                warn!(tx = self.id, error = %err, "transaction aborted at commit");
                Err(err)
            }
        }
    }

    /// Discard every staged write.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.release();
        self.state = TransactionState::Aborted;
        debug!(tx = self.id, "transaction aborted");
        Ok(())
    }

    fn release(&mut self) {
        self.working = Catalog::default();
        self.log.clear();
        self.written.clear();
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StoreError::TransactionState {
                id: self.id,
                state: self.state.to_string(),
            })
        }
    }

    fn record(&mut self, collection: &str, summary: &WriteSummary) {
        for (id, seen) in &summary.touched {
            if self.written.insert((collection.to_string(), id.clone())) {
                self.log.push(StagedWrite {
                    collection: collection.to_string(),
                    id: id.clone(),
                    seen: *seen,
                });
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            self.state = TransactionState::Aborted;
            debug!(tx = self.id, writes = self.log.len(), "transaction dropped while active, aborted");
        }
    }
}

// ============================================================================
// TRANSACTION COLLECTION VIEW
// ============================================================================

/// Reads and writes against a transaction's private copy.
///
/// Reads see the snapshot plus the transaction's own writes; nothing is
/// visible to other readers before `commit()`.
pub struct TxCollection<'a> {
    tx: &'a mut Transaction,
    name: String,
}

impl<'a> TxCollection<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn working(&self) -> Result<&Catalog> {
        self.tx.ensure_active()?;
        Ok(&self.tx.working)
    }

    fn staged<F>(&mut self, op: F) -> Result<WriteSummary>
    where
        F: FnOnce(&mut Catalog, &str) -> Result<WriteSummary>,
    {
        self.tx.ensure_active()?;
        let summary = op(&mut self.tx.working, &self.name)?;
        self.tx.record(&self.name, &summary);
        Ok(summary)
    }

    // ========== WRITES ==========

    pub fn insert_one(&mut self, doc: Value) -> Result<DocumentId> {
        let doc = Document::from_value(doc)?;
        let id = doc.id().clone();
        self.staged(|catalog, name| catalog.insert(name, vec![doc]))?;
        Ok(id)
    }

    pub fn insert_many(&mut self, docs: Vec<Value>) -> Result<InsertManyResult> {
        let docs = docs
            .into_iter()
            .map(Document::from_value)
            .collect::<Result<Vec<_>>>()?;
        let inserted_ids: Vec<DocumentId> = docs.iter().map(|doc| doc.id().clone()).collect();
        self.staged(|catalog, name| catalog.insert(name, docs))?;
        Ok(InsertManyResult {
            inserted_count: inserted_ids.len(),
            inserted_ids,
        })
    }

    pub fn update_one(&mut self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        let options = self.tx.db.config().update;
        self.update(filter, update, &options, false)
    }

    pub fn update_one_with(&mut self, filter: &Value, update: &Value, options: &UpdateOptions) -> Result<UpdateResult> {
        self.update(filter, update, options, false)
    }

    pub fn update_many(&mut self, filter: &Value, update: &Value) -> Result<UpdateResult> {
        let options = self.tx.db.config().update;
        self.update(filter, update, &options, true)
    }

    pub fn update_many_with(&mut self, filter: &Value, update: &Value, options: &UpdateOptions) -> Result<UpdateResult> {
        self.update(filter, update, options, true)
    }

    fn update(&mut self, filter: &Value, update: &Value, options: &UpdateOptions, multi: bool) -> Result<UpdateResult> {
        let query = Query::from_json(filter)?;
        let spec = UpdateSpec::from_json(update)?;
        let summary =
            self.staged(|catalog, name| catalog.update(name, &query, &spec, options, multi))?;
        Ok(UpdateResult {
            matched: summary.matched,
            modified: summary.touched.len() as u64,
        })
    }

    pub fn delete_by_id(&mut self, id: impl Into<DocumentId>) -> Result<u64> {
        let id = id.into();
        let summary = self.staged(|catalog, name| catalog.delete_ids(name, vec![id]))?;
        Ok(summary.touched.len() as u64)
    }

    pub fn delete_one(&mut self, filter: &Value) -> Result<u64> {
        let query = Query::from_json(filter)?;
        let summary = self.staged(|catalog, name| catalog.delete(name, &query, false))?;
        Ok(summary.touched.len() as u64)
    }

    pub fn delete_many(&mut self, filter: &Value) -> Result<u64> {
        let query = Query::from_json(filter)?;
        let summary = self.staged(|catalog, name| catalog.delete(name, &query, true))?;
        Ok(summary.touched.len() as u64)
    }

    // ========== READS ==========

    pub fn find(&self, filter: &Value) -> Result<Vec<Value>> {
        self.find_with_options(filter, &FindOptions::new())
    }

    pub fn find_with_options(&self, filter: &Value, options: &FindOptions) -> Result<Vec<Value>> {
        options.validate()?;
        let query = Query::from_json(filter)?;
        let docs = self.working()?.find(&self.name, &query)?;
        Ok(options.apply(docs.iter().map(|doc| doc.to_value()).collect()))
    }

    pub fn find_one(&self, filter: &Value) -> Result<Option<Value>> {
        let query = Query::from_json(filter)?;
        let docs = self.working()?.find(&self.name, &query)?;
        Ok(docs.first().map(|doc| doc.to_value()))
    }

    pub fn find_by_id(&self, id: impl Into<DocumentId>) -> Result<Option<Document>> {
        let id = id.into();
        Ok(self
            .working()?
            .get(&self.name, &id)
            .map(|doc| Document::clone(&doc)))
    }

    pub fn get_by_id(&self, id: impl Into<DocumentId>) -> Result<Document> {
        let id = id.into();
        self.find_by_id(id.clone())?
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", self.name, id)))
    }

    pub fn count_documents(&self, filter: &Value) -> Result<u64> {
        let query = Query::from_json(filter)?;
        Ok(self.working()?.find(&self.name, &query)?.len() as u64)
    }

    /// Aggregate over the transaction's view; `$lookup` sees it too.
    pub fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        let pipeline = Pipeline::from_json(pipeline)?;
        self.working()?.aggregate(&self.name, &pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db_with_stock(stock: i64) -> Database {
        let db = Database::new();
        db.collection("productos")
            .insert_one(json!({"_id": 1, "nombre": "Borojó fresco", "stock": stock}))
            .unwrap();
        db
    }

    fn stock(db: &Database) -> Value {
        db.collection("productos").get_by_id(1).unwrap().get("stock").cloned().unwrap()
    }

    #[test]
    fn test_commit_publishes_writes() {
        let db = db_with_stock(30);
        let mut tx = db.begin();
        tx.collection("productos")
            .update_one(&json!({"_id": 1}), &json!({"$inc": {"stock": -5}}))
            .unwrap();
        tx.collection("ventas")
            .insert_one(json!({"_id": 1, "productoId": 1, "cantidad": 5}))
            .unwrap();

        // invisible until commit, visible to the transaction itself
        assert_eq!(stock(&db), json!(30));
        assert_eq!(db.collection("ventas").count_documents(&json!({})).unwrap(), 0);
        assert_eq!(
            tx.collection("productos").get_by_id(1).unwrap().get("stock"),
            Some(&json!(25))
        );
        assert_eq!(tx.write_count(), 2);

        tx.commit().unwrap();
        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(stock(&db), json!(25));
        assert_eq!(db.collection("ventas").count_documents(&json!({})).unwrap(), 1);
    }

    #[test]
    fn test_abort_discards_writes() {
        let db = db_with_stock(30);
        let mut tx = db.begin();
        tx.collection("productos").delete_by_id(1).unwrap();
        tx.abort().unwrap();
        assert_eq!(tx.state(), TransactionState::Aborted);
        assert_eq!(stock(&db), json!(30));
    }

    #[test]
    fn test_terminal_state_rejects_operations() {
        let db = db_with_stock(30);
        let mut tx = db.begin();
        tx.commit().unwrap();

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, StoreError::TransactionState { .. }));
        assert!(tx.abort().is_err());
        assert!(tx.collection("productos").find(&json!({})).is_err());
        assert!(tx
            .collection("productos")
            .insert_one(json!({"_id": 2}))
            .is_err());
    }

    #[test]
    fn test_snapshot_isolation() {
        let db = db_with_stock(30);
        let mut tx = db.begin();
        db.collection("productos")
            .insert_one(json!({"_id": 2, "stock": 1}))
            .unwrap();
        assert_eq!(tx.collection("productos").count_documents(&json!({})).unwrap(), 1);
        tx.abort().unwrap();
    }

    #[test]
    fn test_write_write_conflict() {
        let db = db_with_stock(30);
        let mut first = db.begin();
        let mut second = db.begin();
        for tx in [&mut first, &mut second] {
            tx.collection("productos")
                .update_one(&json!({"_id": 1}), &json!({"$inc": {"stock": -5}}))
                .unwrap();
        }
        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(second.state(), TransactionState::Aborted);
        assert_eq!(stock(&db), json!(25));
    }

    #[test]
    fn test_disjoint_writes_both_commit() {
        let db = db_with_stock(30);
        let mut first = db.begin();
        let mut second = db.begin();
        first.collection("productos").insert_one(json!({"_id": 2})).unwrap();
        second.collection("productos").insert_one(json!({"_id": 3})).unwrap();
        first.commit().unwrap();
        second.commit().unwrap();
        assert_eq!(db.collection("productos").count_documents(&json!({})).unwrap(), 3);
    }

    #[test]
    fn test_commit_enforces_unique_index() {
        let db = Database::new();
        let clientes = db.collection("clientes");
        clientes.create_index(&json!({"email": 1}), true).unwrap();

        let mut first = db.begin();
        let mut second = db.begin();
        first.collection("clientes").insert_one(json!({"_id": 1, "email": "a@x.co"})).unwrap();
        second.collection("clientes").insert_one(json!({"_id": 2, "email": "a@x.co"})).unwrap();
        first.commit().unwrap();

        let err = second.commit().unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(clientes.count_documents(&json!({})).unwrap(), 1);
    }

    #[test]
    fn test_drop_aborts() {
        let db = db_with_stock(30);
        {
            let mut tx = db.begin();
            tx.collection("productos").delete_by_id(1).unwrap();
        }
        assert_eq!(stock(&db), json!(30));
    }

    #[test]
    fn test_with_transaction_scopes() {
        let db = db_with_stock(30);
        let result: Result<()> = db.with_transaction(|tx| {
            tx.collection("productos")
                .update_one(&json!({"_id": 1}), &json!({"$inc": {"stock": -10}}))?;
            Err(StoreError::invalid("business rule failed"))
        });
        assert!(result.is_err());
        assert_eq!(stock(&db), json!(30));

        let id = db
            .with_transaction(|tx| {
                tx.collection("productos")
                    .update_one(&json!({"_id": 1}), &json!({"$inc": {"stock": -10}}))?;
                Ok::<_, StoreError>(tx.id())
            })
            .unwrap();
        assert!(id > 0);
        assert_eq!(stock(&db), json!(20));
    }
}
