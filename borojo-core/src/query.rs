// borojo-core/src/query.rs
//! Filter language for document queries
//!
//! Filters are JSON objects in the familiar document-store shape:
//!
//! ```text
//! {"categoria": "Fruta", "stock": {"$gt": 20}, "$or": [{...}, {...}]}
//! ```
//!
//! Matching is implemented by the operator registry in [`operators`];
//! [`Query`] is a validated wrapper around the JSON filter.

pub mod operators;

use serde_json::{Map, Value};

use crate::error::Result;
use operators::FieldSource;

pub use operators::{matches_filter, validate_filter};

/// A validated filter.
///
/// Construction checks operator names, argument shapes and regex patterns, so
/// a `Query` can be evaluated against any document without shape errors
/// surfacing halfway through a scan.
///
/// ```
/// use borojo_core::query::Query;
/// use serde_json::json;
///
/// let query = Query::from_json(&json!({"stock": {"$gt": 20}})).unwrap();
/// assert!(query.matches(&json!({"stock": 30})).unwrap());
/// assert!(Query::from_json(&json!({"stock": {"$between": 1}})).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    json: Value,
}

impl Query {
    /// Empty filter, matches every document.
    pub fn new() -> Self {
        Query {
            json: Value::Object(Map::new()),
        }
    }

    pub fn from_json(json: &Value) -> Result<Self> {
        validate_filter(json)?;
        Ok(Query { json: json.clone() })
    }

    pub fn matches<S: FieldSource>(&self, document: &S) -> Result<bool> {
        matches_filter(document, &self.json)
    }

    pub fn is_empty(&self) -> bool {
        self.json.as_object().map_or(true, Map::is_empty)
    }

    pub fn as_json(&self) -> &Value {
        &self.json
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use serde_json::json;

    #[test]
    fn test_empty_query_matches_all() {
        let doc = Document::from_value(json!({"_id": 1, "nombre": "Borojó fresco"})).unwrap();
        let query = Query::new();
        assert!(query.is_empty());
        assert!(query.matches(&doc).unwrap());
    }

    #[test]
    fn test_query_on_document() {
        let doc = Document::from_value(json!({
            "_id": 1,
            "categoria": "Fruta",
            "stock": 30,
            "tags": ["natural", "orgánico"]
        }))
        .unwrap();

        let query = Query::from_json(&json!({
            "categoria": "Fruta",
            "tags": {"$all": ["orgánico", "natural"]},
            "_id": {"$in": [1, 2]}
        }))
        .unwrap();
        assert!(query.matches(&doc).unwrap());

        let query = Query::from_json(&json!({"stock": {"$lt": 30}})).unwrap();
        assert!(!query.matches(&doc).unwrap());
    }

    #[test]
    fn test_query_rejects_malformed_filter() {
        assert!(Query::from_json(&json!("categoria")).is_err());
        assert!(Query::from_json(&json!({"$and": {"a": 1}})).is_err());
        assert!(Query::from_json(&json!({"nombre": {"$regex": 5}})).is_err());
    }
}
