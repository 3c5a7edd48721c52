//! Property-based tests for borojo-core using proptest.

use borojo_core::{Database, StoreError};
use proptest::prelude::*;
use serde_json::json;

fn with_stock(stocks: &[i64]) -> Database {
    let db = Database::new();
    let docs = stocks
        .iter()
        .enumerate()
        .map(|(i, stock)| json!({"_id": i as i64, "stock": stock}))
        .collect();
    db.collection("productos").insert_many(docs).unwrap();
    db
}

proptest! {
    /// Applying `$inc k` n times equals one `$inc n*k`.
    #[test]
    fn inc_repeated_equals_single(start in -1000i64..1000, k in -50i64..50, n in 0usize..20) {
        let db = with_stock(&[start, start]);
        let productos = db.collection("productos");
        for _ in 0..n {
            productos.update_one(&json!({"_id": 0}), &json!({"$inc": {"stock": k}})).unwrap();
        }
        productos
            .update_one(&json!({"_id": 1}), &json!({"$inc": {"stock": k * n as i64}}))
            .unwrap();

        let a = productos.get_by_id(0i64).unwrap().get("stock").cloned();
        let b = productos.get_by_id(1i64).unwrap().get("stock").cloned();
        prop_assert_eq!(a, b);
    }

    /// `find` and `count_documents` agree, and both agree with a direct filter.
    #[test]
    fn find_count_agree(stocks in prop::collection::vec(0i64..100, 0..60), threshold in 0i64..100) {
        let db = with_stock(&stocks);
        let filter = json!({"stock": {"$gt": threshold}});
        let found = db.collection("productos").find(&filter).unwrap().to_vec().unwrap();
        let counted = db.collection("productos").count_documents(&filter).unwrap();
        let expected = stocks.iter().filter(|s| **s > threshold).count();
        prop_assert_eq!(found.len(), expected);
        prop_assert_eq!(counted as usize, expected);
    }

    /// An index never changes what a query returns.
    #[test]
    fn index_preserves_results(stocks in prop::collection::vec(0i64..50, 1..60), lo in 0i64..50, hi in 0i64..50) {
        let plain = with_stock(&stocks);
        let indexed = with_stock(&stocks);
        indexed.collection("productos").create_index(&json!({"stock": 1}), false).unwrap();

        for filter in [
            json!({"stock": lo}),
            json!({"stock": {"$gte": lo, "$lt": hi}}),
            json!({"stock": {"$in": [lo, hi]}}),
        ] {
            let a = plain.collection("productos").find(&filter).unwrap().to_vec().unwrap();
            let b = indexed.collection("productos").find(&filter).unwrap().to_vec().unwrap();
            prop_assert_eq!(a, b);
        }
    }

    /// Inserting a duplicate `_id` never changes the collection.
    #[test]
    fn duplicate_insert_is_rejected(stocks in prop::collection::vec(0i64..100, 1..30), pick in 0usize..30) {
        let db = with_stock(&stocks);
        let id = (pick % stocks.len()) as i64;
        let before = db.collection("productos").find(&json!({})).unwrap().to_vec().unwrap();
        let err = db.collection("productos").insert_one(json!({"_id": id, "stock": -1})).unwrap_err();
        let is_duplicate = matches!(err, StoreError::DuplicateKey { .. });
        prop_assert!(is_duplicate);
        let after = db.collection("productos").find(&json!({})).unwrap().to_vec().unwrap();
        prop_assert_eq!(before, after);
    }

    /// Aborted transactions leave no trace.
    #[test]
    fn abort_is_invisible(stocks in prop::collection::vec(0i64..100, 1..30), delta in -10i64..10) {
        let db = with_stock(&stocks);
        let before = db.collection("productos").find(&json!({})).unwrap().to_vec().unwrap();

        let mut tx = db.begin();
        tx.collection("productos")
            .update_many(&json!({}), &json!({"$inc": {"stock": delta}}))
            .unwrap();
        tx.collection("productos").delete_many(&json!({"stock": {"$lt": 50}})).unwrap();
        tx.abort().unwrap();

        let after = db.collection("productos").find(&json!({})).unwrap().to_vec().unwrap();
        prop_assert_eq!(before, after);
    }
}
