// Aggregation pipelines over the sample shop data
use borojo_core::retail::{seed, CLIENTES, PRODUCTOS, VENTAS};
use borojo_core::{Database, StoreError};
use serde_json::{json, Value};

fn shop() -> Database {
    let db = Database::new();
    seed(&db).unwrap();
    db
}

fn num(value: &Value) -> f64 {
    value.as_f64().unwrap_or_else(|| panic!("not a number: {}", value))
}

fn assert_close(value: &Value, expected: f64) {
    assert!((num(value) - expected).abs() < 1e-6, "{} != {}", value, expected);
}

#[test]
fn test_best_selling_products() {
    let db = shop();
    let out = db
        .collection(VENTAS)
        .aggregate(&json!([
            {"$unwind": "$productos"},
            {"$group": {"_id": "$productos.productoId", "totalVendido": {"$sum": "$productos.cantidad"}}},
            {"$lookup": {"from": "productos", "localField": "_id", "foreignField": "_id", "as": "producto"}},
            {"$project": {"nombre": {"$arrayElemAt": ["$producto.nombre", 0]}, "totalVendido": 1}},
            {"$sort": {"totalVendido": -1}}
        ]))
        .unwrap();

    assert_eq!(out.len(), 10);
    assert_eq!(out[0], json!({"_id": 8, "nombre": "Galletas de borojó", "totalVendido": 6}));
    // ties keep first-seen group order
    assert_eq!(out[1]["_id"], json!(1));
    assert_eq!(out[2]["_id"], json!(2));
    assert_eq!(out[1]["totalVendido"], json!(4));
    assert_eq!(out[2]["totalVendido"], json!(4));
}

#[test]
fn test_sales_by_month() {
    let db = shop();
    let out = db
        .aggregate(
            VENTAS,
            &json!([
                {"$group": {
                    "_id": {"$month": {"$dateFromString": {"dateString": "$fecha"}}},
                    "totalVentas": {"$sum": "$total"},
                    "cantidadVentas": {"$sum": 1}
                }},
                {"$project": {
                    "mes": "$_id",
                    "totalVentas": 1,
                    "cantidadVentas": 1,
                    "promedioVenta": {"$divide": ["$totalVentas", "$cantidadVentas"]}
                }},
                {"$sort": {"mes": 1}}
            ]),
        )
        .unwrap();

    let meses: Vec<i64> = out.iter().map(|m| m["mes"].as_i64().unwrap()).collect();
    assert_eq!(meses, vec![1, 2, 3, 4, 5]);

    let totales: Vec<i64> = out.iter().map(|m| m["totalVentas"].as_i64().unwrap()).collect();
    assert_eq!(totales, vec![33000, 32000, 28500, 58000, 19500]);
    assert_eq!(out[0]["cantidadVentas"], json!(2));
    assert_close(&out[0]["promedioVenta"], 16500.0);
    assert_close(&out[2]["promedioVenta"], 9500.0);
}

#[test]
fn test_category_price_stats() {
    let db = shop();
    let out = db
        .collection(PRODUCTOS)
        .aggregate(&json!([
            {"$group": {
                "_id": "$categoria",
                "precioPromedio": {"$avg": "$precio"},
                "precioMinimo": {"$min": "$precio"},
                "precioMaximo": {"$max": "$precio"},
                "productos": {"$sum": 1}
            }},
            {"$project": {
                "categoria": "$_id",
                "_id": 0,
                "productos": 1,
                "precioPromedio": {"$round": ["$precioPromedio", 2]},
                "rango": {"$subtract": ["$precioMaximo", "$precioMinimo"]}
            }},
            {"$sort": {"categoria": 1}}
        ]))
        .unwrap();

    let categorias: Vec<&str> = out.iter().map(|c| c["categoria"].as_str().unwrap()).collect();
    assert_eq!(categorias, vec!["Bebida", "Conserva", "Fruta", "Postre", "Snack", "Suplemento"]);

    let bebida = &out[0];
    assert_eq!(bebida["productos"], json!(3));
    assert_close(&bebida["precioPromedio"], 6333.33);
    assert_close(&bebida["rango"], 3000.0);
    assert!(bebida.get("_id").is_none());

    let fruta = &out[2];
    assert_close(&fruta["precioPromedio"], 8750.0);
    assert_close(&fruta["rango"], 6500.0);
}

#[test]
fn test_revenue_per_product() {
    let db = shop();
    let out = db
        .collection(VENTAS)
        .aggregate(&json!([
            {"$unwind": "$productos"},
            {"$group": {
                "_id": "$productos.productoId",
                "ingresos": {"$sum": {"$multiply": ["$productos.cantidad", "$productos.precioUnitario"]}}
            }},
            {"$sort": {"ingresos": -1}},
            {"$limit": 3}
        ]))
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({"_id": 10, "ingresos": 25000}),
            json!({"_id": 7, "ingresos": 24000}),
            json!({"_id": 1, "ingresos": 22000}),
        ]
    );
}

#[test]
fn test_top_clients_with_names() {
    let db = shop();
    let out = db
        .collection(VENTAS)
        .aggregate(&json!([
            {"$group": {"_id": "$clienteId", "compras": {"$sum": 1}, "gastado": {"$sum": "$total"}}},
            {"$sort": {"compras": -1}},
            {"$limit": 2},
            {"$lookup": {"from": "clientes", "localField": "_id", "foreignField": "_id", "as": "cliente"}},
            {"$project": {"_id": 0, "nombre": {"$arrayElemAt": ["$cliente.nombre", 0]}, "compras": 1, "gastado": 1}}
        ]))
        .unwrap();
    assert_eq!(
        out[0],
        json!({"nombre": "Juan Pérez", "compras": 4, "gastado": 36500})
    );
    assert_eq!(out[1]["nombre"], json!("María Gómez"));
    assert_eq!(out[1]["compras"], json!(3));
}

#[test]
fn test_match_then_count() {
    let db = shop();
    let out = db
        .collection(VENTAS)
        .aggregate(&json!([
            {"$match": {"fecha": {"$gte": "2025-03-01"}, "metodoPago": "tarjeta"}},
            {"$count": "ventas"}
        ]))
        .unwrap();
    assert_eq!(out, vec![json!({"ventas": 3})]);

    let none = db
        .collection(VENTAS)
        .aggregate(&json!([{"$match": {"metodoPago": "cheque"}}, {"$count": "ventas"}]))
        .unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_unwind_skips_empty_purchase_lists() {
    let db = shop();
    let out = db
        .collection(CLIENTES)
        .aggregate(&json!([{"$unwind": "$compras"}, {"$count": "n"}]))
        .unwrap();
    assert_eq!(out, vec![json!({"n": 12})]);
}

#[test]
fn test_top_stock_projection() {
    let db = shop();
    let out = db
        .collection(PRODUCTOS)
        .aggregate(&json!([
            {"$sort": {"stock": -1}},
            {"$skip": 1},
            {"$limit": 2},
            {"$project": {"_id": 0, "nombre": 1, "stock": 1, "etiquetas": {"$size": "$tags"}}}
        ]))
        .unwrap();
    assert_eq!(
        out,
        vec![
            json!({"nombre": "Borojó fresco", "stock": 30, "etiquetas": 3}),
            json!({"nombre": "Borojó deshidratado", "stock": 25, "etiquetas": 2}),
        ]
    );
}

#[test]
fn test_pipeline_does_not_modify_collection() {
    let db = shop();
    let before = db.collection(PRODUCTOS).find(&json!({})).unwrap().to_vec().unwrap();
    db.collection(PRODUCTOS)
        .aggregate(&json!([{"$project": {"precio": {"$multiply": ["$precio", 2]}}}]))
        .unwrap();
    let after = db.collection(PRODUCTOS).find(&json!({})).unwrap().to_vec().unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_invalid_pipelines() {
    let db = shop();
    let productos = db.collection(PRODUCTOS);
    assert!(matches!(
        productos.aggregate(&json!([{"$out": "copia"}])),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(productos.aggregate(&json!({"$match": {}})).is_err());
    assert!(productos.aggregate(&json!([{"$limit": -1}])).is_err());
    assert!(productos
        .aggregate(&json!([{"$group": {"_id": "$categoria", "x": {"$push": "$precio"}}}]))
        .is_err());
    assert!(db.aggregate("nada", &json!([])).unwrap().is_empty());
}
