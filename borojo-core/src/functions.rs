// borojo-core/src/functions.rs
//! Named helper functions callable by name with JSON arguments.
//!
//! Functions are plain Rust closures registered when the registry is built;
//! there is no stored source code and no evaluation of scripts.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::retail::{PRODUCTOS, VENTAS};
use crate::value_utils::{compare_values, number_value};

/// Signature every registered function has.
pub type NamedFunction = Arc<dyn Fn(&Database, &[Value]) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
struct RegisteredFunction {
    params: Vec<String>,
    description: String,
    func: NamedFunction,
}

/// Registry of named callables.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, RegisteredFunction>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `calcularDescuento`, `clienteActivo` and `verificarStock`.
    pub fn with_retail_functions() -> Self {
        let mut registry = Self::new();
        registry.insert(
            "calcularDescuento",
            &["precio", "porcentaje"],
            "price after applying a percentage discount",
            Arc::new(calcular_descuento),
        );
        registry.insert(
            "clienteActivo",
            &["idCliente"],
            "true when the client has more than 3 sales",
            Arc::new(cliente_activo),
        );
        registry.insert(
            "verificarStock",
            &["productoId", "cantidad"],
            "true when the product exists and has at least `cantidad` units",
            Arc::new(verificar_stock),
        );
        registry
    }

    /// Register `func` under `name`. Names are unique.
    pub fn register<F>(&mut self, name: &str, params: &[&str], description: &str, func: F) -> Result<()>
    where
        F: Fn(&Database, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(StoreError::invalid("function name must be non-empty"));
        }
        if self.functions.contains_key(name) {
            return Err(StoreError::invalid(format!("function '{}' already registered", name)));
        }
        self.insert(name, params, description, Arc::new(func));
        Ok(())
    }

    fn insert(&mut self, name: &str, params: &[&str], description: &str, func: NamedFunction) {
        self.functions.insert(
            name.to_string(),
            RegisteredFunction {
                params: params.iter().map(|p| p.to_string()).collect(),
                description: description.to_string(),
                func,
            },
        );
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// `{"name", "params", "description"}` for every function.
    pub fn describe(&self) -> Vec<Value> {
        self.functions
            .iter()
            .map(|(name, f)| {
                json!({
                    "name": name,
                    "params": f.params,
                    "description": f.description,
                })
            })
            .collect()
    }

    /// Call `name` with positional `args`. Unknown names are `NotFound`,
    /// a wrong argument count is `InvalidArgument`.
    pub fn call(&self, db: &Database, name: &str, args: &[Value]) -> Result<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("function '{}'", name)))?;
        if args.len() != function.params.len() {
            return Err(StoreError::invalid(format!(
                "{} expects {} argument(s), got {}",
                name,
                function.params.len(),
                args.len()
            )));
        }
        let result = (function.func)(db, args)?;
        trace!(function = name, result = %result, "function called");
        Ok(result)
    }
}

fn numeric_arg(args: &[Value], index: usize, name: &str) -> Result<f64> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| StoreError::invalid(format!("{} must be a number", name)))
}

fn calcular_descuento(_db: &Database, args: &[Value]) -> Result<Value> {
    let precio = numeric_arg(args, 0, "precio")?;
    let porcentaje = numeric_arg(args, 1, "porcentaje")?;
    Ok(number_value(precio * (1.0 - porcentaje / 100.0)))
}

fn cliente_activo(db: &Database, args: &[Value]) -> Result<Value> {
    let compras = db
        .collection(VENTAS)
        .count_documents(&json!({"clienteId": {"$eq": args[0]}}))?;
    Ok(Value::Bool(compras > 3))
}

fn verificar_stock(db: &Database, args: &[Value]) -> Result<Value> {
    let producto = db
        .collection(PRODUCTOS)
        .find_one(&json!({"_id": {"$eq": args[0]}}))?;
    let suficiente = producto
        .as_ref()
        .and_then(|p| p.get("stock"))
        .and_then(|stock| compare_values(stock, &args[1]))
        .map_or(false, |ord| ord.is_ge());
    Ok(Value::Bool(suficiente))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        let db = Database::new();
        db.collection(PRODUCTOS)
            .insert_many(vec![
                json!({"_id": 1, "nombre": "Borojó fresco", "stock": 30}),
                json!({"_id": 2, "nombre": "Jugo", "stock": 3}),
            ])
            .unwrap();
        let ventas = (1..=5)
            .map(|i| json!({"_id": i, "clienteId": if i <= 4 { 1 } else { 2 }}))
            .collect();
        db.collection(VENTAS).insert_many(ventas).unwrap();
        db
    }

    #[test]
    fn test_calcular_descuento() {
        let registry = FunctionRegistry::with_retail_functions();
        let out = registry
            .call(&Database::new(), "calcularDescuento", &[json!(100), json!(20)])
            .unwrap();
        assert_eq!(out.as_f64(), Some(80.0));
        assert!(registry
            .call(&Database::new(), "calcularDescuento", &[json!("100"), json!(20)])
            .is_err());
    }

    #[test]
    fn test_cliente_activo() {
        let db = db();
        let registry = FunctionRegistry::with_retail_functions();
        assert_eq!(registry.call(&db, "clienteActivo", &[json!(1)]).unwrap(), json!(true));
        assert_eq!(registry.call(&db, "clienteActivo", &[json!(2)]).unwrap(), json!(false));
        assert_eq!(registry.call(&db, "clienteActivo", &[json!(9)]).unwrap(), json!(false));
    }

    #[test]
    fn test_verificar_stock() {
        let db = db();
        let registry = FunctionRegistry::with_retail_functions();
        let call = |id: i64, qty: i64| registry.call(&db, "verificarStock", &[json!(id), json!(qty)]).unwrap();
        assert_eq!(call(1, 5), json!(true));
        assert_eq!(call(1, 30), json!(true));
        assert_eq!(call(2, 5), json!(false));
        assert_eq!(call(42, 1), json!(false));
    }

    #[test]
    fn test_registry_errors() {
        let db = Database::new();
        let mut registry = FunctionRegistry::with_retail_functions();
        assert_eq!(registry.names(), vec!["calcularDescuento", "clienteActivo", "verificarStock"]);
        assert!(matches!(registry.call(&db, "nada", &[]), Err(StoreError::NotFound(_))));
        assert!(matches!(
            registry.call(&db, "clienteActivo", &[]),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(registry
            .register("clienteActivo", &[], "", |_, _| Ok(Value::Null))
            .is_err());

        registry
            .register("doble", &["x"], "x * 2", |_, args| {
                Ok(number_value(numeric_arg(args, 0, "x")? * 2.0))
            })
            .unwrap();
        assert_eq!(registry.call(&db, "doble", &[json!(21)]).unwrap().as_f64(), Some(42.0));
        assert!(registry.unregister("doble"));
        assert_eq!(registry.describe().len(), 3);
    }
}
