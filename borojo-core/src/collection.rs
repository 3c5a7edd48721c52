// borojo-core/src/collection.rs
// In-memory collection: insertion-ordered documents, identity map, indexes
//
// Positions (`seq`) are assigned on insert and never reused. A replaced
// document keeps its position, so scans without a sort return documents in
// insertion order.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::document::{Document, DocumentId};
use crate::error::{Result, StoreError};
use crate::index::{ExplainReport, IndexDescriptor, IndexManager, QueryPlan, ID_INDEX_NAME};
use crate::query::Query;

/// A stored document version and the commit version that wrote it.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub doc: Arc<Document>,
    pub version: u64,
}

/// Declared reference: `field` holds `_id` values of `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reference {
    pub field: String,
    pub target: String,
}

/// Documents selected by a query plus how they were found.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub docs: Vec<Arc<Document>>,
    pub plan: QueryPlan,
    pub examined: u64,
}

#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    docs: BTreeMap<u64, StoredDocument>,
    by_id: HashMap<DocumentId, u64>,
    next_seq: u64,
    indexes: IndexManager,
    references: Vec<Reference>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Collection {
            name: name.into(),
            docs: BTreeMap::new(),
            by_id: HashMap::new(),
            next_seq: 0,
            indexes: IndexManager::new(),
            references: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, id: &DocumentId) -> Option<&Arc<Document>> {
        self.stored(id).map(|stored| &stored.doc)
    }

    /// Commit version of the current document under `id`.
    pub fn version_of(&self, id: &DocumentId) -> Option<u64> {
        self.stored(id).map(|stored| stored.version)
    }

    fn stored(&self, id: &DocumentId) -> Option<&StoredDocument> {
        self.by_id.get(id).and_then(|seq| self.docs.get(seq))
    }

    /// All documents in insertion order.
    pub fn documents(&self) -> impl Iterator<Item = &Arc<Document>> + '_ {
        self.docs.values().map(|stored| &stored.doc)
    }

    // ========== WRITES ==========

    /// Append a new document. Identity and unique index collisions are
    /// `DuplicateKey` and leave the collection unchanged.
    pub fn insert(&mut self, doc: Arc<Document>, version: u64) -> Result<()> {
        if self.by_id.contains_key(doc.id()) {
            return Err(StoreError::DuplicateKey {
                collection: self.name.clone(),
                key: format!("{}: {}", ID_INDEX_NAME, doc.id()),
            });
        }
        let seq = self.next_seq;
        self.indexes.check_unique(&self.name, seq, &doc)?;

        self.indexes.insert(seq, &doc);
        self.by_id.insert(doc.id().clone(), seq);
        self.docs.insert(seq, StoredDocument { doc, version });
        self.next_seq += 1;
        Ok(())
    }

    /// Swap in a new version of an existing document, keeping its position.
    pub fn replace(&mut self, doc: Arc<Document>, version: u64) -> Result<()> {
        let seq = match self.by_id.get(doc.id()) {
            Some(seq) => *seq,
            None => return Err(StoreError::NotFound(format!("{}/{}", self.name, doc.id()))),
        };
        self.indexes.check_unique(&self.name, seq, &doc)?;

        if let Some(old) = self.docs.get(&seq) {
            self.indexes.remove(seq, &old.doc);
        }
        self.indexes.insert(seq, &doc);
        self.docs.insert(seq, StoredDocument { doc, version });
        Ok(())
    }

    pub fn remove(&mut self, id: &DocumentId) -> Option<Arc<Document>> {
        let seq = self.by_id.remove(id)?;
        let stored = self.docs.remove(&seq)?;
        self.indexes.remove(seq, &stored.doc);
        Some(stored.doc)
    }

    /// Apply a batch of final states at once: drop `removed`, store every
    /// document of `docs`, then check unique indexes against the merged
    /// result. Intermediate states inside the batch are never checked, so
    /// two documents may swap unique keys. On error the collection is left
    /// half-merged and must be discarded.
    pub fn merge(
        &mut self,
        removed: &[DocumentId],
        docs: &[Arc<Document>],
        version: u64,
    ) -> Result<()> {
        for id in removed {
            self.remove(id);
        }

        let mut placed = Vec::with_capacity(docs.len());
        for doc in docs {
            let seq = match self.by_id.get(doc.id()) {
                Some(seq) => *seq,
                None => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.by_id.insert(doc.id().clone(), seq);
                    seq
                }
            };
            if let Some(old) = self.docs.get(&seq) {
                self.indexes.remove(seq, &old.doc);
            }
            placed.push(seq);
        }

        for (seq, doc) in placed.iter().zip(docs) {
            self.indexes.insert(*seq, doc);
            self.docs.insert(
                *seq,
                StoredDocument {
                    doc: Arc::clone(doc),
                    version,
                },
            );
        }

        for (seq, doc) in placed.iter().zip(docs) {
            self.indexes.check_unique(&self.name, *seq, doc)?;
        }
        Ok(())
    }

    // ========== QUERIES ==========

    /// Evaluate `query`, using an index to narrow the candidates when the
    /// planner finds one. The full filter is always applied to candidates.
    pub fn find_matching(&self, query: &Query) -> Result<ScanResult> {
        let plan = if query.is_empty() {
            QueryPlan::CollectionScan
        } else {
            self.indexes.plan(query.as_json())
        };

        let candidates: Vec<&StoredDocument> = match &plan {
            QueryPlan::CollectionScan => self.docs.values().collect(),
            QueryPlan::IdLookup(ids) => {
                let mut seqs: Vec<u64> = ids
                    .iter()
                    .filter_map(|id| self.by_id.get(id).copied())
                    .collect();
                seqs.sort_unstable();
                seqs.dedup();
                seqs.iter().filter_map(|seq| self.docs.get(seq)).collect()
            }
            QueryPlan::IndexScan {
                index_name,
                predicate,
            } => self
                .indexes
                .candidates(index_name, predicate)
                .iter()
                .filter_map(|seq| self.docs.get(seq))
                .collect(),
        };

        let examined = candidates.len() as u64;
        let mut docs = Vec::new();
        for stored in candidates {
            if query.matches(stored.doc.as_ref())? {
                docs.push(Arc::clone(&stored.doc));
            }
        }

        trace!(
            collection = %self.name,
            stage = plan.stage_name(),
            index = plan.index_name().unwrap_or("-"),
            examined,
            returned = docs.len(),
            "query plan"
        );

        Ok(ScanResult {
            docs,
            plan,
            examined,
        })
    }

    pub fn explain(&self, query: &Query) -> Result<ExplainReport> {
        let scan = self.find_matching(query)?;
        Ok(ExplainReport {
            stage: scan.plan.stage_name().to_string(),
            index_name: scan.plan.index_name().map(str::to_string),
            docs_examined: scan.examined,
            n_returned: scan.docs.len() as u64,
        })
    }

    // ========== INDEXES ==========

    pub fn create_index(&mut self, descriptor: IndexDescriptor) -> Result<String> {
        let docs = self.docs.iter().map(|(seq, stored)| (*seq, stored.doc.as_ref()));
        let name = self.indexes.create_index(&self.name, descriptor, docs)?;
        debug!(collection = %self.name, index = %name, "index ready");
        Ok(name)
    }

    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        self.indexes.drop_index(name)?;
        debug!(collection = %self.name, index = %name, "index dropped");
        Ok(())
    }

    pub fn list_indexes(&self) -> Vec<IndexDescriptor> {
        self.indexes.list()
    }

    // ========== REFERENCES ==========

    /// Returns false when the same reference was already declared.
    pub fn add_reference(&mut self, field: &str, target: &str) -> bool {
        let reference = Reference {
            field: field.to_string(),
            target: target.to_string(),
        };
        if self.references.contains(&reference) {
            return false;
        }
        self.references.push(reference);
        true
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn doc(v: Value) -> Arc<Document> {
        Arc::new(Document::from_value(v).unwrap())
    }

    fn clientes() -> Collection {
        let mut coll = Collection::new("clientes");
        coll.insert(doc(json!({"_id": 1, "nombre": "Ana", "email": "ana@mail.co"})), 1)
            .unwrap();
        coll.insert(doc(json!({"_id": 2, "nombre": "Luis", "email": "luis@mail.co"})), 1)
            .unwrap();
        coll.insert(doc(json!({"_id": 3, "nombre": "Marta", "email": "marta@mail.co"})), 1)
            .unwrap();
        coll
    }

    fn ids(docs: &[Arc<Document>]) -> Vec<DocumentId> {
        docs.iter().map(|d| d.id().clone()).collect()
    }

    #[test]
    fn test_insert_duplicate_id() {
        let mut coll = clientes();
        let err = coll.insert(doc(json!({"_id": 2, "nombre": "Otro"})), 2).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(coll.len(), 3);
        assert_eq!(coll.get(&DocumentId::Int(2)).unwrap().get("nombre"), Some(&json!("Luis")));
    }

    #[test]
    fn test_replace_keeps_position_and_version() {
        let mut coll = clientes();
        coll.replace(doc(json!({"_id": 1, "nombre": "Ana María"})), 7).unwrap();
        let order: Vec<_> = coll.documents().map(|d| d.id().clone()).collect();
        assert_eq!(order, vec![DocumentId::Int(1), DocumentId::Int(2), DocumentId::Int(3)]);
        assert_eq!(coll.version_of(&DocumentId::Int(1)), Some(7));
        assert_eq!(coll.version_of(&DocumentId::Int(2)), Some(1));

        let err = coll.replace(doc(json!({"_id": 9})), 8).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_remove_then_reinsert_goes_last() {
        let mut coll = clientes();
        assert!(coll.remove(&DocumentId::Int(1)).is_some());
        assert!(coll.remove(&DocumentId::Int(1)).is_none());
        coll.insert(doc(json!({"_id": 1, "nombre": "Ana"})), 2).unwrap();
        let order: Vec<_> = coll.documents().map(|d| d.id().clone()).collect();
        assert_eq!(order, vec![DocumentId::Int(2), DocumentId::Int(3), DocumentId::Int(1)]);
    }

    #[test]
    fn test_unique_index_enforced_on_insert_and_replace() {
        let mut coll = clientes();
        let descriptor = IndexDescriptor::from_keys(&json!({"email": 1}), true).unwrap();
        assert_eq!(coll.create_index(descriptor).unwrap(), "email_1");

        let err = coll
            .insert(doc(json!({"_id": 4, "email": "ana@mail.co"})), 2)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(coll.len(), 3);

        let err = coll
            .replace(doc(json!({"_id": 2, "email": "marta@mail.co"})), 2)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));

        // keeping its own key is fine
        coll.replace(doc(json!({"_id": 2, "email": "luis@mail.co", "activo": true})), 2)
            .unwrap();
    }

    #[test]
    fn test_merge_checks_uniqueness_on_final_state() {
        let mut coll = clientes();
        coll.create_index(IndexDescriptor::from_keys(&json!({"email": 1}), true).unwrap())
            .unwrap();

        // 1 and 2 swap keys; 4 takes the key of the removed 3
        let swapped = vec![
            doc(json!({"_id": 1, "nombre": "Ana", "email": "luis@mail.co"})),
            doc(json!({"_id": 2, "nombre": "Luis", "email": "ana@mail.co"})),
            doc(json!({"_id": 4, "nombre": "Rosa", "email": "marta@mail.co"})),
        ];
        coll.merge(&[DocumentId::Int(3)], &swapped, 5).unwrap();

        let order: Vec<_> = coll.documents().map(|d| d.id().clone()).collect();
        assert_eq!(order, vec![DocumentId::Int(1), DocumentId::Int(2), DocumentId::Int(4)]);
        assert_eq!(coll.version_of(&DocumentId::Int(2)), Some(5));
        let query = Query::from_json(&json!({"email": "ana@mail.co"})).unwrap();
        assert_eq!(ids(&coll.find_matching(&query).unwrap().docs), vec![DocumentId::Int(2)]);

        let mut clashing = clientes();
        clashing
            .create_index(IndexDescriptor::from_keys(&json!({"email": 1}), true).unwrap())
            .unwrap();
        let err = clashing
            .merge(&[], &[doc(json!({"_id": 1, "email": "luis@mail.co"}))], 5)
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[test]
    fn test_find_matching_uses_id_lookup() {
        let coll = clientes();
        let query = Query::from_json(&json!({"_id": {"$in": [3, 1, 42]}})).unwrap();
        let scan = coll.find_matching(&query).unwrap();
        assert_eq!(scan.plan.stage_name(), "IXSCAN");
        assert_eq!(scan.examined, 2);
        assert_eq!(ids(&scan.docs), vec![DocumentId::Int(1), DocumentId::Int(3)]);
    }

    #[test]
    fn test_index_scan_matches_collection_scan() {
        let mut coll = clientes();
        let query = Query::from_json(&json!({"nombre": {"$gte": "L"}})).unwrap();
        let before = coll.find_matching(&query).unwrap();
        assert_eq!(before.plan, QueryPlan::CollectionScan);
        assert_eq!(before.examined, 3);

        coll.create_index(IndexDescriptor::from_keys(&json!({"nombre": 1}), false).unwrap())
            .unwrap();
        let after = coll.find_matching(&query).unwrap();
        assert_eq!(after.plan.index_name(), Some("nombre_1"));
        assert_eq!(after.examined, 2);
        assert_eq!(ids(&before.docs), ids(&after.docs));
    }

    #[test]
    fn test_explain_report() {
        let coll = clientes();
        let report = coll
            .explain(&Query::from_json(&json!({"nombre": "Ana"})).unwrap())
            .unwrap();
        assert_eq!(report.stage, "COLLSCAN");
        assert_eq!(report.index_name, None);
        assert_eq!(report.docs_examined, 3);
        assert_eq!(report.n_returned, 1);
    }

    #[test]
    fn test_add_reference_is_idempotent() {
        let mut coll = Collection::new("ventas");
        assert!(coll.add_reference("clienteId", "clientes"));
        assert!(!coll.add_reference("clienteId", "clientes"));
        assert_eq!(coll.references().len(), 1);
    }
}
