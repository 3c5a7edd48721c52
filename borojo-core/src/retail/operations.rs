// borojo-core/src/retail/operations.rs
//! Transactional shop workflows.
//!
//! Each workflow runs in one transaction: business checks happen on the
//! transaction's snapshot and any failure aborts it, so stock, sales and
//! inventory never disagree.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use super::{INVENTARIO, PRODUCTOS, VENTAS};
use crate::database::Database;
use crate::document::{Document, DocumentId};
use crate::error::StoreError;
use crate::transaction::Transaction;
use crate::update::UpdateOptions;
use crate::value_utils::number_value;

/// Why a workflow was rejected.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("product {0} not found")]
    ProductNotFound(DocumentId),

    #[error("sale {0} not found")]
    SaleNotFound(DocumentId),

    #[error("insufficient stock for product {product}: {available} available, {requested} requested")]
    InsufficientStock {
        product: DocumentId,
        available: i64,
        requested: i64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type OperationResult<T> = std::result::Result<T, OperationError>;

// ============================================================================
// REQUESTS AND RECEIPTS
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SaleRequest {
    pub producto_id: DocumentId,
    pub cliente_id: DocumentId,
    pub cantidad: i64,
    /// Defaults to the product's current `precio`.
    pub precio_unitario: Option<f64>,
    pub metodo_pago: String,
    /// ISO-8601 timestamp; defaults to now.
    pub fecha: Option<String>,
}

impl SaleRequest {
    pub fn new(producto_id: impl Into<DocumentId>, cliente_id: impl Into<DocumentId>, cantidad: i64) -> Self {
        SaleRequest {
            producto_id: producto_id.into(),
            cliente_id: cliente_id.into(),
            cantidad,
            precio_unitario: None,
            metodo_pago: "efectivo".to_string(),
            fecha: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleReceipt {
    pub venta_id: DocumentId,
    pub total: Value,
    pub stock_restante: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StockEntry {
    pub producto_id: DocumentId,
    pub cantidad: i64,
    pub precio_compra: Option<f64>,
    pub proveedor_id: Option<String>,
    pub fecha: Option<String>,
}

impl StockEntry {
    pub fn new(producto_id: impl Into<DocumentId>, cantidad: i64) -> Self {
        StockEntry {
            producto_id: producto_id.into(),
            cantidad,
            precio_compra: None,
            proveedor_id: None,
            fecha: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockEntryReceipt {
    pub inventario_id: DocumentId,
    pub stock_actualizado: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnRequest {
    pub venta_id: DocumentId,
    pub producto_id: DocumentId,
    pub cantidad: i64,
    pub motivo: Option<String>,
}

impl ReturnRequest {
    pub fn new(venta_id: impl Into<DocumentId>, producto_id: impl Into<DocumentId>, cantidad: i64) -> Self {
        ReturnRequest {
            venta_id: venta_id.into(),
            producto_id: producto_id.into(),
            cantidad,
            motivo: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnReceipt {
    pub inventario_id: DocumentId,
    pub venta_eliminada: DocumentId,
    pub stock_actualizado: i64,
}

// ============================================================================
// WORKFLOWS
// ============================================================================

/// Sell `cantidad` units: check stock, decrement it and record the sale.
pub fn register_sale(db: &Database, request: &SaleRequest) -> OperationResult<SaleReceipt> {
    positive_quantity(request.cantidad)?;
    let receipt = db.with_transaction(|tx| -> OperationResult<SaleReceipt> {
        let producto = load_product(tx, &request.producto_id)?;
        let available = stock_of(&producto);
        if available < request.cantidad {
            return Err(OperationError::InsufficientStock {
                product: request.producto_id.clone(),
                available,
                requested: request.cantidad,
            });
        }

        let precio = match request.precio_unitario {
            Some(precio) => number_value(precio),
            None => producto.get("precio").cloned().unwrap_or(Value::Null),
        };
        let total = line_total(&precio, request.cantidad);

        adjust_stock(tx, &request.producto_id, -request.cantidad)?;
        let venta_id = tx.collection(VENTAS).insert_one(json!({
            "fecha": request.fecha.clone().unwrap_or_else(now),
            "clienteId": request.cliente_id.to_value(),
            "productos": [{
                "productoId": request.producto_id.to_value(),
                "cantidad": request.cantidad,
                "precioUnitario": precio,
            }],
            "total": total,
            "metodoPago": request.metodo_pago,
            "estado": "completada",
        }))?;

        Ok(SaleReceipt {
            venta_id,
            total,
            stock_restante: available - request.cantidad,
        })
    })?;

    info!(venta = %receipt.venta_id, total = %receipt.total, "sale registered");
    Ok(receipt)
}

/// Receive `cantidad` units from a supplier.
pub fn register_stock_entry(db: &Database, entry: &StockEntry) -> OperationResult<StockEntryReceipt> {
    positive_quantity(entry.cantidad)?;
    let receipt = db.with_transaction(|tx| -> OperationResult<StockEntryReceipt> {
        let producto = load_product(tx, &entry.producto_id)?;

        let inventario_id = tx.collection(INVENTARIO).insert_one(json!({
            "fecha": entry.fecha.clone().unwrap_or_else(now),
            "productoId": entry.producto_id.to_value(),
            "tipo": "entrada",
            "cantidad": entry.cantidad,
            "precioUnitario": entry.precio_compra.map_or(Value::Null, number_value),
            "proveedorId": entry.proveedor_id,
            "motivo": "Compra a proveedor",
            "estado": "confirmada",
        }))?;
        adjust_stock(tx, &entry.producto_id, entry.cantidad)?;

        Ok(StockEntryReceipt {
            inventario_id,
            stock_actualizado: stock_of(&producto) + entry.cantidad,
        })
    })?;

    info!(inventario = %receipt.inventario_id, stock = receipt.stock_actualizado, "stock entry registered");
    Ok(receipt)
}

/// Take back `cantidad` units of a sale: restock, delete the sale and log
/// the return in `inventario`.
pub fn process_return(db: &Database, request: &ReturnRequest) -> OperationResult<ReturnReceipt> {
    positive_quantity(request.cantidad)?;
    let receipt = db.with_transaction(|tx| -> OperationResult<ReturnReceipt> {
        if tx.collection(VENTAS).find_by_id(request.venta_id.clone())?.is_none() {
            return Err(OperationError::SaleNotFound(request.venta_id.clone()));
        }
        let producto = load_product(tx, &request.producto_id)?;

        adjust_stock(tx, &request.producto_id, request.cantidad)?;
        tx.collection(VENTAS).delete_by_id(request.venta_id.clone())?;
        let inventario_id = tx.collection(INVENTARIO).insert_one(json!({
            "fecha": now(),
            "productoId": request.producto_id.to_value(),
            "tipo": "devolucion",
            "cantidad": request.cantidad,
            "motivo": request.motivo.clone().unwrap_or_else(|| "Devolución del cliente".to_string()),
            "ventaId": request.venta_id.to_value(),
            "estado": "confirmada",
        }))?;

        Ok(ReturnReceipt {
            inventario_id,
            venta_eliminada: request.venta_id.clone(),
            stock_actualizado: stock_of(&producto) + request.cantidad,
        })
    })?;

    info!(venta = %receipt.venta_eliminada, "return processed");
    Ok(receipt)
}

// ============================================================================
// HELPERS
// ============================================================================

fn positive_quantity(cantidad: i64) -> OperationResult<()> {
    if cantidad <= 0 {
        return Err(StoreError::invalid(format!("quantity must be positive, got {}", cantidad)).into());
    }
    Ok(())
}

fn load_product(tx: &mut Transaction, id: &DocumentId) -> OperationResult<Document> {
    tx.collection(PRODUCTOS)
        .find_by_id(id.clone())?
        .ok_or_else(|| OperationError::ProductNotFound(id.clone()))
}

/// Integer stock of a product; missing or non-numeric counts as 0.
fn stock_of(producto: &Document) -> i64 {
    match producto.get("stock") {
        Some(stock) => stock
            .as_i64()
            .or_else(|| stock.as_f64().map(|f| f.floor() as i64))
            .unwrap_or(0),
        None => 0,
    }
}

fn adjust_stock(tx: &mut Transaction, id: &DocumentId, delta: i64) -> OperationResult<()> {
    let options = UpdateOptions {
        absent_as_zero: true,
        ..UpdateOptions::default()
    };
    let result = tx.collection(PRODUCTOS).update_one_with(
        &json!({"_id": id.to_value()}),
        &json!({"$inc": {"stock": delta}}),
        &options,
    )?;
    if result.modified == 0 {
        return Err(OperationError::ProductNotFound(id.clone()));
    }
    debug!(producto = %id, delta, "stock adjusted");
    Ok(())
}

fn line_total(precio: &Value, cantidad: i64) -> Value {
    match precio.as_i64().and_then(|p| p.checked_mul(cantidad)) {
        Some(total) => json!(total),
        None => precio
            .as_f64()
            .map_or(Value::Null, |p| number_value(p * cantidad as f64)),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retail::{seed, CLIENTES};

    fn shop() -> Database {
        let db = Database::new();
        seed(&db).unwrap();
        db
    }

    fn stock(db: &Database, id: i64) -> i64 {
        db.collection(PRODUCTOS).get_by_id(id).unwrap().get("stock").and_then(Value::as_i64).unwrap()
    }

    #[test]
    fn test_register_sale() {
        let db = shop();
        let receipt = register_sale(&db, &SaleRequest::new(1, 2, 2)).unwrap();
        assert_eq!(receipt.total, json!(11000));
        assert_eq!(receipt.stock_restante, 28);
        assert_eq!(stock(&db, 1), 28);

        let venta = db.collection(VENTAS).get_by_id(receipt.venta_id).unwrap();
        assert_eq!(venta.get("clienteId"), Some(&json!(2)));
        assert_eq!(venta.get("productos").unwrap()[0]["precioUnitario"], json!(5500));
        assert_eq!(db.collection(VENTAS).count_documents(&json!({})).unwrap(), 13);
    }

    #[test]
    fn test_sale_with_insufficient_stock_changes_nothing() {
        let db = shop();
        let err = register_sale(&db, &SaleRequest::new(9, 1, 4)).unwrap_err();
        assert!(matches!(err, OperationError::InsufficientStock { available: 3, requested: 4, .. }));
        assert_eq!(stock(&db, 9), 3);
        assert_eq!(db.collection(VENTAS).count_documents(&json!({})).unwrap(), 12);
    }

    #[test]
    fn test_sale_for_unknown_client_aborts() {
        let db = shop();
        let err = register_sale(&db, &SaleRequest::new(1, 99, 1)).unwrap_err();
        assert!(matches!(err, OperationError::Store(StoreError::DanglingReference { .. })));
        assert_eq!(stock(&db, 1), 30);
    }

    #[test]
    fn test_sale_rejects_unknown_product_and_bad_quantity() {
        let db = shop();
        assert!(matches!(
            register_sale(&db, &SaleRequest::new(404, 1, 1)),
            Err(OperationError::ProductNotFound(_))
        ));
        assert!(matches!(
            register_sale(&db, &SaleRequest::new(1, 1, 0)),
            Err(OperationError::Store(StoreError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn test_register_stock_entry() {
        let db = shop();
        let mut entry = StockEntry::new(5, 10);
        entry.precio_compra = Some(6300.0);
        entry.proveedor_id = Some("proveedor001".to_string());
        let receipt = register_stock_entry(&db, &entry).unwrap();
        assert_eq!(receipt.stock_actualizado, 18);
        assert_eq!(stock(&db, 5), 18);

        let movimiento = db.collection(INVENTARIO).get_by_id(receipt.inventario_id).unwrap();
        assert_eq!(movimiento.get("tipo"), Some(&json!("entrada")));
        assert_eq!(movimiento.get("proveedorId"), Some(&json!("proveedor001")));
    }

    #[test]
    fn test_process_return() {
        let db = shop();
        let receipt = process_return(&db, &ReturnRequest::new(1, 1, 1)).unwrap();
        assert_eq!(receipt.stock_actualizado, 31);
        assert_eq!(stock(&db, 1), 31);
        assert!(db.collection(VENTAS).find_by_id(1).is_none());

        let movimiento = db.collection(INVENTARIO).get_by_id(receipt.inventario_id).unwrap();
        assert_eq!(movimiento.get("tipo"), Some(&json!("devolucion")));
        assert_eq!(movimiento.get("ventaId"), Some(&json!(1)));

        let err = process_return(&db, &ReturnRequest::new(1, 1, 1)).unwrap_err();
        assert!(matches!(err, OperationError::SaleNotFound(_)));
        assert_eq!(stock(&db, 1), 31);
    }

    #[test]
    fn test_return_for_unknown_product_keeps_sale() {
        let db = shop();
        let err = process_return(&db, &ReturnRequest::new(2, 404, 1)).unwrap_err();
        assert!(matches!(err, OperationError::ProductNotFound(_)));
        assert!(db.collection(VENTAS).find_by_id(2).is_some());
        assert!(db.collection(CLIENTES).find_by_id(2).is_some());
    }
}
