// borojo-core/src/lib.rs
// In-process transactional document store

pub mod aggregation;
pub mod collection;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod expression;
pub mod find_options;
pub mod functions;
pub mod index;
pub mod query;
pub mod retail;
pub mod transaction;
pub mod update;
pub mod value_utils;

// Public exports
pub use aggregation::Pipeline;
pub use config::DatabaseConfig;
pub use database::{CollectionHandle, Database, FindCursor, InsertManyResult};
pub use document::{Document, DocumentId};
pub use error::{Result, StoreError};
pub use find_options::FindOptions;
pub use functions::FunctionRegistry;
pub use index::{ExplainReport, IndexDescriptor};
pub use query::Query;
pub use transaction::{Transaction, TransactionId, TransactionState, TxCollection};
pub use update::{UpdateOptions, UpdateResult};
