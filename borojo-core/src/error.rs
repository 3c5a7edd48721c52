// borojo-core/src/error.rs
//! Error taxonomy shared by every store operation.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by the document store.
///
/// Every failure is reported to the immediate caller; the store never applies
/// half of a document update or half of a transaction.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A lookup by identity found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Identity or unique-index collision.
    #[error("duplicate key in '{collection}': {key}")]
    DuplicateKey {
        /// Collection where the collision happened.
        collection: String,
        /// Index name and offending key.
        key: String,
    },

    /// An update operator met a field of the wrong type.
    #[error("type mismatch on field '{field}': {message}")]
    TypeMismatch {
        /// Field the operator targeted.
        field: String,
        /// What was expected and what was found.
        message: String,
    },

    /// Malformed filter, update, pipeline or index specification.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Optimistic write-write collision detected at commit.
    #[error("write conflict on {collection}/{id}")]
    Conflict {
        /// Collection of the conflicting document.
        collection: String,
        /// Identity of the conflicting document.
        id: String,
    },

    /// Operation attempted on a committed or aborted transaction.
    #[error("transaction {id} is {state}")]
    TransactionState {
        /// Transaction id.
        id: u64,
        /// Terminal state the transaction is in.
        state: String,
    },

    /// A declared reference points at a document that does not exist.
    #[error("dangling reference {collection}.{field} = {value} (no such document in '{target}')")]
    DanglingReference {
        /// Referencing collection.
        collection: String,
        /// Referencing field.
        field: String,
        /// Referenced collection.
        target: String,
        /// Value that failed to resolve.
        value: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument(message.into())
    }

    pub(crate) fn type_mismatch(field: &str, message: impl Into<String>) -> Self {
        StoreError::TypeMismatch {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// True for errors a caller is expected to retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = StoreError::DuplicateKey {
            collection: "clientes".to_string(),
            key: "email_1: \"juan@email.com\"".to_string(),
        };
        assert!(err.to_string().contains("clientes"));
        assert!(err.to_string().contains("email_1"));

        let err = StoreError::type_mismatch("stock", "expected number, found string");
        assert_eq!(
            err.to_string(),
            "type mismatch on field 'stock': expected number, found string"
        );
    }

    #[test]
    fn test_is_conflict() {
        let conflict = StoreError::Conflict {
            collection: "productos".to_string(),
            id: "1".to_string(),
        };
        assert!(conflict.is_conflict());
        assert!(!StoreError::invalid("bad").is_conflict());
    }

    #[test]
    fn test_from_serde_error() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: StoreError = serde_err.into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
