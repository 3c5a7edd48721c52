use anyhow::{bail, Context, Result};
use borojo_core::retail::{self, ReturnRequest, SaleRequest, StockEntry};
use borojo_core::{Database, DatabaseConfig, DocumentId, FindOptions, FunctionRegistry};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "borojo")]
#[command(about = "Borojo CLI - run queries and shop workflows against an in-memory document store")]
#[command(version)]
struct Cli {
    /// JSON configuration file (see DatabaseConfig)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON data file `{"collection": [documents...]}`; the built-in sample
    /// shop is loaded when omitted
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG and the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Write every collection to this file after the command runs
    #[arg(long, global = true)]
    save: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Query a collection
    Find {
        collection: String,
        /// Filter document
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Sort document, e.g. '{"stock": -1}'
        #[arg(long)]
        sort: Option<String>,
        /// Projection document, e.g. '{"nombre": 1}'
        #[arg(long)]
        projection: Option<String>,
        #[arg(long)]
        skip: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Count matching documents
    Count {
        collection: String,
        #[arg(long, default_value = "{}")]
        filter: String,
    },
    /// Run an aggregation pipeline
    Aggregate {
        collection: String,
        /// Pipeline as a JSON array of stages
        pipeline: String,
    },
    /// Show the access plan for a filter
    Explain {
        collection: String,
        #[arg(default_value = "{}")]
        filter: String,
    },
    /// List the indexes of a collection
    Indexes { collection: String },
    /// List collections with their document counts
    Collections,
    /// Register a sale
    Sale {
        #[arg(long)]
        producto: String,
        #[arg(long)]
        cliente: String,
        #[arg(long)]
        cantidad: i64,
        /// Unit price; defaults to the product's price
        #[arg(long)]
        precio: Option<f64>,
        #[arg(long, default_value = "efectivo")]
        metodo_pago: String,
    },
    /// Register a stock entry from a supplier
    Restock {
        #[arg(long)]
        producto: String,
        #[arg(long)]
        cantidad: i64,
        #[arg(long)]
        precio_compra: Option<f64>,
        #[arg(long)]
        proveedor: Option<String>,
    },
    /// Process a return: restock and delete the sale
    Return {
        #[arg(long)]
        venta: String,
        #[arg(long)]
        producto: String,
        #[arg(long)]
        cantidad: i64,
        #[arg(long)]
        motivo: Option<String>,
    },
    /// List the helper functions, or call one
    Functions {
        /// Function to call
        #[arg(long)]
        call: Option<String>,
        /// Arguments as a JSON array
        #[arg(long, default_value = "[]")]
        args: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(cli.log_level.as_deref(), &config.log_level);

    let db = Database::with_config(config);
    match &cli.data {
        Some(path) => import_data(&db, path)?,
        None => retail::seed(&db).context("Failed to load the sample data")?,
    }

    run(&db, cli.command)?;

    if let Some(path) = &cli.save {
        export_data(&db, path)?;
    }
    Ok(())
}

/// `--log-level` wins, then `RUST_LOG`, then the config file.
fn init_tracing(cli_level: Option<&str>, config_level: &str) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<DatabaseConfig> {
    let Some(path) = path else {
        return Ok(DatabaseConfig::default());
    };
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    DatabaseConfig::from_json_str(&content)
        .with_context(|| format!("Invalid config in: {}", path.display()))
}

fn run(db: &Database, command: Commands) -> Result<()> {
    match command {
        Commands::Find {
            collection,
            filter,
            sort,
            projection,
            skip,
            limit,
        } => {
            let filter = parse_json(&filter, "filter")?;
            let options = find_options(sort.as_deref(), projection.as_deref(), skip, limit)?;
            let docs = db
                .collection(&collection)
                .find_with_options(&filter, &options)
                .with_context(|| format!("Failed to query collection: {}", collection))?;
            print_json(&docs)
        }
        Commands::Count { collection, filter } => {
            let filter = parse_json(&filter, "filter")?;
            let n = db
                .collection(&collection)
                .count_documents(&filter)
                .with_context(|| format!("Failed to count collection: {}", collection))?;
            print_json(&json!({ "count": n }))
        }
        Commands::Aggregate { collection, pipeline } => {
            let pipeline = parse_json(&pipeline, "pipeline")?;
            let out = db
                .aggregate(&collection, &pipeline)
                .with_context(|| format!("Aggregation failed on: {}", collection))?;
            print_json(&out)
        }
        Commands::Explain { collection, filter } => {
            let filter = parse_json(&filter, "filter")?;
            let report = db.collection(&collection).explain(&filter)?;
            print_json(&report)
        }
        Commands::Indexes { collection } => print_json(&db.collection(&collection).list_indexes()),
        Commands::Collections => {
            let mut out = Map::new();
            for name in db.list_collections() {
                let n = db.collection(&name).count_documents(&json!({}))?;
                out.insert(name, json!(n));
            }
            print_json(&out)
        }
        Commands::Sale {
            producto,
            cliente,
            cantidad,
            precio,
            metodo_pago,
        } => {
            let mut request = SaleRequest::new(parse_id(&producto)?, parse_id(&cliente)?, cantidad);
            request.precio_unitario = precio;
            request.metodo_pago = metodo_pago;
            let receipt = retail::register_sale(db, &request).context("Sale rejected")?;
            print_json(&receipt)
        }
        Commands::Restock {
            producto,
            cantidad,
            precio_compra,
            proveedor,
        } => {
            let mut entry = StockEntry::new(parse_id(&producto)?, cantidad);
            entry.precio_compra = precio_compra;
            entry.proveedor_id = proveedor;
            let receipt = retail::register_stock_entry(db, &entry).context("Stock entry rejected")?;
            print_json(&receipt)
        }
        Commands::Return {
            venta,
            producto,
            cantidad,
            motivo,
        } => {
            let mut request = ReturnRequest::new(parse_id(&venta)?, parse_id(&producto)?, cantidad);
            request.motivo = motivo;
            let receipt = retail::process_return(db, &request).context("Return rejected")?;
            print_json(&receipt)
        }
        Commands::Functions { call, args } => {
            let registry = FunctionRegistry::with_retail_functions();
            match call {
                None => print_json(&registry.describe()),
                Some(name) => {
                    let args = match parse_json(&args, "args")? {
                        Value::Array(items) => items,
                        _ => bail!("--args must be a JSON array"),
                    };
                    let result = registry
                        .call(db, &name, &args)
                        .with_context(|| format!("Function '{}' failed", name))?;
                    print_json(&result)
                }
            }
        }
    }
}

fn parse_json(text: &str, what: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("Invalid JSON in --{}: {}", what, text))
}

/// Numbers become integer ids, anything else is taken as a string id.
fn parse_id(text: &str) -> Result<DocumentId> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Number(_) | Value::String(_))) => {
            DocumentId::from_value(&value).with_context(|| format!("Invalid id: {}", text))
        }
        _ => Ok(DocumentId::String(text.to_string())),
    }
}

fn find_options(
    sort: Option<&str>,
    projection: Option<&str>,
    skip: Option<usize>,
    limit: Option<usize>,
) -> Result<FindOptions> {
    let mut spec = Map::new();
    if let Some(sort) = sort {
        spec.insert("sort".to_string(), parse_json(sort, "sort")?);
    }
    if let Some(projection) = projection {
        spec.insert("projection".to_string(), parse_json(projection, "projection")?);
    }
    if let Some(skip) = skip {
        spec.insert("skip".to_string(), json!(skip));
    }
    if let Some(limit) = limit {
        spec.insert("limit".to_string(), json!(limit));
    }
    FindOptions::from_json(&Value::Object(spec)).context("Invalid find options")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

/// Import data from JSON file
/// Format: { "collection_name": [documents...], ... }
fn import_data(db: &Database, file: &Path) -> Result<()> {
    let content = fs::read_to_string(file)
        .with_context(|| format!("Failed to read file: {}", file.display()))?;

    let data: Map<String, Value> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid JSON in file: {}", file.display()))?;

    let mut total_docs = 0;
    for (collection_name, documents) in data {
        let docs = match documents {
            Value::Array(docs) => docs,
            _ => bail!("Collection '{}' must be an array", collection_name),
        };
        let result = db
            .collection(&collection_name)
            .insert_many(docs)
            .with_context(|| format!("Failed to insert documents into {}", collection_name))?;
        debug!(collection = %collection_name, documents = result.inserted_count, "collection imported");
        total_docs += result.inserted_count;
    }

    info!(documents = total_docs, file = %file.display(), "data imported");
    Ok(())
}

/// Write every collection to `file` in the import format.
fn export_data(db: &Database, file: &Path) -> Result<()> {
    let mut output = Map::new();
    let mut total_docs = 0;
    for coll_name in db.list_collections() {
        let docs = db
            .collection(&coll_name)
            .find(&json!({}))
            .and_then(|cursor| cursor.to_vec())
            .with_context(|| format!("Failed to query collection: {}", coll_name))?;
        total_docs += docs.len();
        output.insert(coll_name, Value::Array(docs));
    }

    let json = serde_json::to_string_pretty(&output).context("Failed to serialize to JSON")?;
    fs::write(file, json).with_context(|| format!("Failed to write to file: {}", file.display()))?;

    info!(documents = total_docs, file = %file.display(), "data exported");
    Ok(())
}
