// Index integration tests
use borojo_core::retail::{seed, CLIENTES, PRODUCTOS};
use borojo_core::{Database, StoreError};
use serde_json::{json, Value};

fn shop() -> Database {
    let db = Database::new();
    seed(&db).unwrap();
    db
}

fn index_names(db: &Database, collection: &str) -> Vec<Value> {
    db.collection(collection)
        .list_indexes()
        .into_iter()
        .map(|idx| idx["name"].clone())
        .collect()
}

#[test]
fn test_automatic_id_index() {
    let db = Database::new();
    db.collection("usuarios").insert_one(json!({"_id": 1})).unwrap();
    assert_eq!(index_names(&db, "usuarios"), vec![json!("_id_")]);

    let plan = db.collection("usuarios").explain(&json!({"_id": 1})).unwrap();
    assert_eq!(plan.stage, "IXSCAN");
    assert_eq!(plan.index_name.as_deref(), Some("_id_"));
    assert_eq!(plan.n_returned, 1);
}

#[test]
fn test_create_index_on_existing_documents() {
    let db = shop();
    let name = db
        .collection(PRODUCTOS)
        .create_index(&json!({"stock": -1}), false)
        .unwrap();
    assert_eq!(name, "stock_-1");

    let plan = db.collection(PRODUCTOS).explain(&json!({"stock": {"$gt": 20}})).unwrap();
    assert_eq!(plan.stage, "IXSCAN");
    assert_eq!(plan.index_name.as_deref(), Some("stock_-1"));
    assert_eq!(plan.n_returned, 4);
    assert!(plan.docs_examined < 10);
}

#[test]
fn test_compound_index_used_for_leading_field() {
    let db = shop();
    let productos = db.collection(PRODUCTOS);

    let plan = productos.explain(&json!({"categoria": "Bebida"})).unwrap();
    assert_eq!(plan.index_name.as_deref(), Some("categoria_1_precio_-1"));
    assert_eq!((plan.docs_examined, plan.n_returned), (3, 3));

    // precio alone is not a leading field
    let plan = productos.explain(&json!({"precio": {"$gt": 8000}})).unwrap();
    assert_eq!(plan.stage, "COLLSCAN");
    assert_eq!(plan.docs_examined, 10);
    assert_eq!(plan.n_returned, 3);
}

#[test]
fn test_indexed_and_scanned_results_agree() {
    let db = shop();
    let productos = db.collection(PRODUCTOS);
    let filters = [
        json!({"nombre": "Jugo de borojó"}),
        json!({"categoria": {"$in": ["Snack", "Fruta"]}}),
        json!({"categoria": "Bebida", "precio": {"$lt": 7000}}),
        json!({"categoria": {"$gte": "P"}}),
    ];
    for filter in &filters {
        let indexed = productos.find(filter).unwrap().to_vec().unwrap();
        productos.drop_index("nombre_1").ok();
        productos.drop_index("categoria_1_precio_-1").ok();
        let scanned = productos.find(filter).unwrap().to_vec().unwrap();
        assert_eq!(indexed, scanned, "{}", filter);
        productos.create_index(&json!({"nombre": 1}), false).unwrap();
        productos.create_index(&json!({"categoria": 1, "precio": -1}), false).unwrap();
    }
}

#[test]
fn test_index_follows_updates_and_deletes() {
    let db = shop();
    let productos = db.collection(PRODUCTOS);

    productos
        .update_one(&json!({"_id": 2}), &json!({"$set": {"nombre": "Jugo natural de borojó"}}))
        .unwrap();
    assert!(productos.find_one(&json!({"nombre": "Jugo de borojó"})).unwrap().is_none());
    assert_eq!(
        productos.find_one(&json!({"nombre": "Jugo natural de borojó"})).unwrap().unwrap()["_id"],
        json!(2)
    );

    productos.delete_by_id(2).unwrap();
    let plan = productos.explain(&json!({"nombre": "Jugo natural de borojó"})).unwrap();
    assert_eq!(plan.stage, "IXSCAN");
    assert_eq!(plan.n_returned, 0);
}

#[test]
fn test_unique_index_rejects_update_batch() {
    let db = shop();
    let clientes = db.collection(CLIENTES);
    let err = clientes
        .update_many(&json!({"compras": {"$size": 0}}), &json!({"$set": {"email": "nuevo@email.com"}}))
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey { .. }));
    assert_eq!(clientes.count_documents(&json!({"email": "nuevo@email.com"})).unwrap(), 0);

    // one document may take the value
    clientes
        .update_one(&json!({"_id": 9}), &json!({"$set": {"email": "nuevo@email.com"}}))
        .unwrap();
    assert!(clientes
        .update_one(&json!({"_id": 10}), &json!({"$set": {"email": "nuevo@email.com"}}))
        .is_err());
}

#[test]
fn test_unique_index_build_fails_on_duplicates() {
    let db = shop();
    let err = db
        .collection(PRODUCTOS)
        .create_index(&json!({"categoria": 1}), true)
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey { .. }));
    assert_eq!(
        index_names(&db, PRODUCTOS),
        vec![json!("_id_"), json!("nombre_1"), json!("categoria_1_precio_-1")]
    );
}

#[test]
fn test_drop_index() {
    let db = shop();
    let productos = db.collection(PRODUCTOS);
    productos.drop_index("nombre_1").unwrap();
    assert_eq!(productos.explain(&json!({"nombre": "Vino de borojó"})).unwrap().stage, "COLLSCAN");
    assert!(productos.drop_index("nombre_1").is_err());
    assert!(productos.drop_index("_id_").is_err());
    assert!(db.collection("nada").drop_index("x_1").is_err());
}
