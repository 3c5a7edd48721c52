// borojo-core/src/document.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::value_utils::get_nested_value;

/// Name of the identity field every stored document carries.
pub const ID_FIELD: &str = "_id";

/// Document identity.
///
/// Untagged, so it appears in documents as a plain value: `{"_id": 11}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(untagged)]
pub enum DocumentId {
    Int(i64),
    String(String),
}

impl DocumentId {
    /// Generated identity for documents inserted without `_id` (UUID v4).
    pub fn new_object_id() -> Self {
        DocumentId::String(Uuid::new_v4().to_string())
    }

    /// Parse an identity out of a JSON value.
    ///
    /// Integral numbers (including `11.0`) become `Int`; strings stay strings.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Ok(DocumentId::Int(i));
                }
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(DocumentId::Int(f as i64)),
                    _ => Err(StoreError::invalid(format!("_id must be an integer, got {}", n))),
                }
            }
            Value::String(s) => Ok(DocumentId::String(s.clone())),
            other => Err(StoreError::invalid(format!(
                "_id must be an integer or a string, got {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DocumentId::Int(i) => Value::from(*i),
            DocumentId::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Int(i) => write!(f, "{}", i),
            DocumentId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for DocumentId {
    fn from(id: i64) -> Self {
        DocumentId::Int(id)
    }
}

impl From<i32> for DocumentId {
    fn from(id: i32) -> Self {
        DocumentId::Int(i64::from(id))
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        DocumentId::String(id.to_string())
    }
}

/// A stored document: a JSON object whose `_id` always matches `id`.
///
/// Documents handed out by the store are snapshots; changing one never
/// changes what the collection holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: DocumentId,
    body: Map<String, Value>,
}

impl Document {
    /// Build a document from an identity and its other fields.
    ///
    /// An `_id` entry inside `fields` is overwritten with `id`.
    pub fn new(id: DocumentId, mut fields: Map<String, Value>) -> Self {
        fields.insert(ID_FIELD.to_string(), id.to_value());
        Document { id, body: fields }
    }

    /// Build a document from a JSON object, generating an identity if `_id`
    /// is absent.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut body = match value {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::invalid(format!(
                    "document must be an object, got {}",
                    other
                )))
            }
        };

        let id = match body.get(ID_FIELD) {
            Some(raw) => DocumentId::from_value(raw)?,
            None => DocumentId::new_object_id(),
        };
        body.insert(ID_FIELD.to_string(), id.to_value());
        Ok(Document { id, body })
    }

    /// Parse a document from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Field lookup with dot notation, `_id` included.
    pub fn get(&self, field: &str) -> Option<&Value> {
        if field.is_empty() {
            return None;
        }
        match field.split_once('.') {
            None => self.body.get(field),
            Some((head, rest)) => get_nested_value(self.body.get(head)?, rest),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Top-level field map, `_id` included.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Owned JSON object view of the document.
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.body)?)
    }

    /// Rebuild from an edited body, refusing identity changes.
    pub(crate) fn with_body(&self, body: Value) -> Result<Self> {
        let body = match body {
            Value::Object(map) => map,
            _ => return Err(StoreError::invalid("document body must stay an object")),
        };
        match body.get(ID_FIELD) {
            Some(raw) if DocumentId::from_value(raw).ok().as_ref() == Some(&self.id) => Ok(Document {
                id: self.id.clone(),
                body,
            }),
            _ => Err(StoreError::invalid(format!(
                "the _id of document {} cannot be changed",
                self.id
            ))),
        }
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}
