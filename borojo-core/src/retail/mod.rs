// borojo-core/src/retail/mod.rs
//! Retail scenario: a small borojó shop with products, clients, sales and
//! stock movements.
//!
//! [`fixtures::seed`] loads the sample data set with its indexes and
//! references; [`operations`] holds the transactional workflows (sales,
//! stock entries, returns).

pub mod fixtures;
pub mod operations;

pub const PRODUCTOS: &str = "productos";
pub const CLIENTES: &str = "clientes";
pub const VENTAS: &str = "ventas";
pub const INVENTARIO: &str = "inventario";

pub use fixtures::seed;
pub use operations::{
    process_return, register_sale, register_stock_entry, OperationError, ReturnReceipt,
    ReturnRequest, SaleReceipt, SaleRequest, StockEntry, StockEntryReceipt,
};
