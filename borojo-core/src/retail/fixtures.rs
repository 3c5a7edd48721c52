// borojo-core/src/retail/fixtures.rs
// Sample data set for the borojó shop

use serde_json::{json, Value};
use tracing::debug;

use super::{CLIENTES, INVENTARIO, PRODUCTOS, VENTAS};
use crate::database::Database;
use crate::error::Result;

/// Load the sample data into `db`.
///
/// Creates the indexes (`clientes.email` unique, `productos.nombre`,
/// `productos.{categoria: 1, precio: -1}`) and declares the references
/// `ventas.clienteId -> clientes` and `inventario.productoId -> productos`.
/// Fails with `DuplicateKey` if any of the documents already exist.
pub fn seed(db: &Database) -> Result<()> {
    let productos = db.collection(PRODUCTOS);
    productos.create_index(&json!({"nombre": 1}), false)?;
    productos.create_index(&json!({"categoria": 1, "precio": -1}), false)?;
    let n_productos = productos.insert_many(productos_docs())?.inserted_count;

    let clientes = db.collection(CLIENTES);
    clientes.create_index(&json!({"email": 1}), true)?;
    let n_clientes = clientes.insert_many(clientes_docs())?.inserted_count;

    let ventas = db.collection(VENTAS);
    ventas.declare_reference("clienteId", CLIENTES)?;
    let n_ventas = ventas.insert_many(ventas_docs())?.inserted_count;

    let inventario = db.collection(INVENTARIO);
    inventario.declare_reference("productoId", PRODUCTOS)?;
    let n_inventario = inventario.insert_many(inventario_docs())?.inserted_count;

    debug!(
        productos = n_productos,
        clientes = n_clientes,
        ventas = n_ventas,
        inventario = n_inventario,
        "sample data loaded"
    );
    Ok(())
}

/// Ten products; four hold more than 20 units and three are `Bebida`
/// priced 5000, 6000 and 8000.
pub fn productos_docs() -> Vec<Value> {
    vec![
        json!({"_id": 1, "nombre": "Borojó fresco", "categoria": "Fruta", "precio": 5500, "stock": 30,
               "tags": ["natural", "orgánico", "fruta"]}),
        json!({"_id": 2, "nombre": "Jugo de borojó", "categoria": "Bebida", "precio": 5000, "stock": 15,
               "tags": ["natural", "refrescante"]}),
        json!({"_id": 3, "nombre": "Borojó deshidratado", "categoria": "Snack", "precio": 7000, "stock": 25,
               "tags": ["natural", "energético"]}),
        json!({"_id": 4, "nombre": "Batido de borojó con leche", "categoria": "Bebida", "precio": 6000, "stock": 12,
               "tags": ["energético", "dulce"]}),
        json!({"_id": 5, "nombre": "Mermelada de borojó", "categoria": "Conserva", "precio": 9000, "stock": 8,
               "tags": ["dulce", "artesanal"]}),
        json!({"_id": 6, "nombre": "Vino de borojó", "categoria": "Bebida", "precio": 8000, "stock": 22,
               "tags": ["artesanal"]}),
        json!({"_id": 7, "nombre": "Pulpa de borojó congelada", "categoria": "Fruta", "precio": 12000, "stock": 18,
               "tags": ["natural", "orgánico"]}),
        json!({"_id": 8, "nombre": "Galletas de borojó", "categoria": "Snack", "precio": 3500, "stock": 40,
               "tags": ["dulce"]}),
        json!({"_id": 9, "nombre": "Helado de borojó", "categoria": "Postre", "precio": 4500, "stock": 3,
               "tags": ["dulce", "refrescante"]}),
        json!({"_id": 10, "nombre": "Cápsulas de borojó", "categoria": "Suplemento", "precio": 25000, "stock": 10,
               "tags": ["energético", "natural", "orgánico"]}),
    ]
}

pub fn clientes_docs() -> Vec<Value> {
    vec![
        json!({"_id": 1, "nombre": "Juan Pérez", "email": "juan@email.com",
               "compras": [1, 3, 5, 8], "preferencias": ["natural", "fruta"]}),
        json!({"_id": 2, "nombre": "María Gómez", "email": "maria@email.com",
               "compras": [2, 7, 10], "preferencias": ["dulce"]}),
        json!({"_id": 3, "nombre": "Carlos Ruiz", "email": "carlos@email.co",
               "compras": [4], "preferencias": ["energético", "dulce"]}),
        json!({"_id": 4, "nombre": "Ana Martínez", "email": "ana@email.com",
               "compras": [6], "preferencias": ["artesanal"]}),
        json!({"_id": 5, "nombre": "Luis Fernández", "email": "luis@email.com",
               "compras": [9], "preferencias": ["energético", "natural"]}),
        json!({"_id": 6, "nombre": "Sofía Ramírez", "email": "sofia@email.co",
               "compras": [11], "preferencias": ["dulce", "refrescante"]}),
        json!({"_id": 7, "nombre": "Pedro Sánchez", "email": "pedro@email.com",
               "compras": [12], "preferencias": ["natural"]}),
        json!({"_id": 8, "nombre": "Laura Díaz", "email": "laura@email.com",
               "compras": [], "preferencias": ["orgánico", "natural"]}),
        json!({"_id": 9, "nombre": "Andrés López", "email": "andres@email.com",
               "compras": [], "preferencias": []}),
        json!({"_id": 10, "nombre": "Valentina Torres", "email": "valentina@email.co",
               "compras": [], "preferencias": ["dulce", "natural", "artesanal"]}),
    ]
}

/// Twelve sales between January and May 2025. Client 1 has four sales,
/// client 2 has three.
pub fn ventas_docs() -> Vec<Value> {
    fn venta(id: i64, fecha: &str, cliente: i64, lineas: &[(i64, i64, i64)], pago: &str) -> Value {
        let productos: Vec<Value> = lineas
            .iter()
            .map(|(producto, cantidad, precio)| {
                json!({"productoId": producto, "cantidad": cantidad, "precioUnitario": precio})
            })
            .collect();
        let total: i64 = lineas.iter().map(|(_, cantidad, precio)| cantidad * precio).sum();
        json!({
            "_id": id,
            "fecha": fecha,
            "clienteId": cliente,
            "productos": productos,
            "total": total,
            "metodoPago": pago,
            "estado": "completada"
        })
    }

    vec![
        venta(1, "2025-01-10T10:15:00.000Z", 1, &[(1, 2, 5500)], "efectivo"),
        venta(2, "2025-01-22T16:40:00.000Z", 2, &[(2, 3, 5000), (8, 2, 3500)], "tarjeta"),
        venta(3, "2025-02-03T09:05:00.000Z", 1, &[(3, 1, 7000)], "efectivo"),
        venta(4, "2025-02-14T12:30:00.000Z", 3, &[(4, 2, 6000)], "transferencia"),
        venta(5, "2025-02-20T18:10:00.000Z", 1, &[(6, 1, 8000), (2, 1, 5000)], "tarjeta"),
        venta(6, "2025-03-05T11:00:00.000Z", 4, &[(5, 1, 9000)], "efectivo"),
        venta(7, "2025-03-11T15:25:00.000Z", 2, &[(8, 4, 3500)], "efectivo"),
        venta(8, "2025-03-18T10:50:00.000Z", 1, &[(1, 1, 5500)], "tarjeta"),
        venta(9, "2025-04-02T14:20:00.000Z", 5, &[(10, 1, 25000)], "transferencia"),
        venta(10, "2025-04-09T17:45:00.000Z", 2, &[(7, 2, 12000)], "tarjeta"),
        venta(11, "2025-04-21T13:35:00.000Z", 6, &[(9, 2, 4500)], "efectivo"),
        venta(12, "2025-05-06T08:55:00.000Z", 7, &[(3, 2, 7000), (1, 1, 5500)], "tarjeta"),
    ]
}

pub fn inventario_docs() -> Vec<Value> {
    vec![
        json!({"_id": 1, "fecha": "2025-01-02T08:00:00.000Z", "productoId": 1, "tipo": "entrada", "cantidad": 50,
               "precioUnitario": 3850, "proveedorId": "proveedor001", "motivo": "Compra a proveedor", "estado": "confirmada"}),
        json!({"_id": 2, "fecha": "2025-01-05T08:00:00.000Z", "productoId": 2, "tipo": "entrada", "cantidad": 30,
               "precioUnitario": 3500, "proveedorId": "proveedor002", "motivo": "Compra a proveedor", "estado": "confirmada"}),
        json!({"_id": 3, "fecha": "2025-02-01T08:00:00.000Z", "productoId": 8, "tipo": "entrada", "cantidad": 60,
               "precioUnitario": 2450, "proveedorId": "proveedor001", "motivo": "Compra a proveedor", "estado": "confirmada"}),
        json!({"_id": 4, "fecha": "2025-03-01T08:00:00.000Z", "productoId": 10, "tipo": "entrada", "cantidad": 15,
               "precioUnitario": 17500, "proveedorId": "proveedor003", "motivo": "Compra a proveedor", "estado": "confirmada"}),
    ]
}
