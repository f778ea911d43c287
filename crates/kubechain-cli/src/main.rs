//! kubechain - control plane for LLM agent tasks
//!
//! - `kubechain run`: reconcile resources until ctrl+c
//! - `kubechain apply -f <file>`: create or update resources from YAML manifests
//! - `kubechain get <kind> [name]`: show resources and their status
//! - `kubechain delete <kind> <name>`: delete a resource and everything it owns
//!
//! All commands share the SQLite store named in the config, so `apply` in
//! one terminal is picked up by `run` in another.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kubechain_core::api::{
    parse_manifests, DynamicObject, Kind, ObjectKey, API_VERSION, DEFAULT_NAMESPACE,
};
use kubechain_core::config::KubechainConfig;
use kubechain_core::paths;
use kubechain_core::store::{LabelSelector, ResourceStore, SqliteStore};

mod run;

#[derive(Parser)]
#[command(name = "kubechain")]
#[command(about = "Level-triggered control plane for LLM agent tasks", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.kubechain/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every controller against the store
    Run {
        /// Log to ~/.kubechain/logs/kubechain.log instead of stderr
        #[arg(long)]
        log_file: bool,
    },

    /// Create or update resources from a manifest file
    Apply {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List resources of a kind, or show one
    Get {
        kind: Kind,
        name: Option<String>,
        #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
        #[arg(short, long, value_enum)]
        output: Option<Format>,
    },

    /// Delete a resource; owned resources are deleted with it
    Delete {
        kind: Kind,
        name: String,
        #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
        namespace: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Yaml,
    Json,
}

fn init_logging(log_file: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    if log_file {
        let log_dir = paths::logs_dir();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {:?}", log_dir))?;
        let file = std::fs::File::create(log_dir.join("kubechain.log"))
            .context("Failed to create log file")?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn open_store(config: &KubechainConfig) -> Result<Arc<dyn ResourceStore>> {
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open store {:?}", config.database_path))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { log_file } => {
            init_logging(log_file)?;
            let config = KubechainConfig::load(cli.config.as_deref())?;
            run::run(config).await
        }
        command => {
            // One-shot commands only log warnings unless RUST_LOG says otherwise
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_writer(std::io::stderr)
                .init();
            let config = KubechainConfig::load(cli.config.as_deref())?;
            let store = open_store(&config)?;
            match command {
                Commands::Apply { file } => apply(store.as_ref(), &file).await,
                Commands::Get {
                    kind,
                    name,
                    namespace,
                    output,
                } => get(store.as_ref(), kind, name, &namespace, output).await,
                Commands::Delete {
                    kind,
                    name,
                    namespace,
                } => delete(store.as_ref(), kind, &ObjectKey::new(namespace, name)).await,
                Commands::Run { .. } => unreachable!(),
            }
        }
    }
}

async fn apply(store: &dyn ResourceStore, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read manifest {:?}", file))?;
    let objects =
        parse_manifests(&raw).with_context(|| format!("Failed to parse manifest {:?}", file))?;
    if objects.is_empty() {
        bail!("no resources found in {:?}", file);
    }

    for obj in objects {
        let kind = obj.kind;
        let applied = store
            .apply_dynamic(obj)
            .await
            .with_context(|| format!("Failed to apply {}", kind))?;
        let verb = if applied.metadata.resource_version == 1 {
            "created"
        } else {
            "configured"
        };
        println!("{}/{} {}", kind, applied.metadata.name, verb);
    }
    Ok(())
}

async fn get(
    store: &dyn ResourceStore,
    kind: Kind,
    name: Option<String>,
    namespace: &str,
    output: Option<Format>,
) -> Result<()> {
    let objects = match name {
        Some(name) => vec![store
            .get_dynamic(kind, &ObjectKey::new(namespace, name))
            .await?],
        None => {
            store
                .list_dynamic(kind, Some(namespace), &LabelSelector::everything())
                .await?
        }
    };

    match output {
        Some(format) => {
            for (i, obj) in objects.iter().enumerate() {
                let doc = manifest_view(obj);
                match format {
                    Format::Json => println!("{}", serde_json::to_string_pretty(&doc)?),
                    Format::Yaml => {
                        if i > 0 {
                            println!("---");
                        }
                        print!("{}", serde_yaml::to_string(&doc)?);
                    }
                }
            }
        }
        None if objects.is_empty() => {
            println!("No {} resources found in {} namespace.", kind, namespace);
        }
        None => print_table(&objects),
    }
    Ok(())
}

async fn delete(store: &dyn ResourceStore, kind: Kind, key: &ObjectKey) -> Result<()> {
    let removed = store
        .delete(kind, key)
        .await
        .with_context(|| format!("Failed to delete {} {}", kind, key))?;
    for (kind, key) in removed {
        println!("{}/{} deleted", kind, key.name);
    }
    Ok(())
}

fn manifest_view(obj: &DynamicObject) -> Value {
    json!({
        "apiVersion": API_VERSION,
        "kind": obj.kind,
        "metadata": obj.metadata,
        "spec": obj.spec,
        "status": obj.status,
    })
}

fn status_field<'a>(obj: &'a DynamicObject, field: &str) -> &'a str {
    obj.status.get(field).and_then(Value::as_str).unwrap_or("")
}

fn print_table(objects: &[DynamicObject]) {
    let rows: Vec<[&str; 4]> = objects
        .iter()
        .map(|obj| {
            [
                obj.metadata.name.as_str(),
                status_field(obj, "status"),
                status_field(obj, "phase"),
                status_field(obj, "statusDetail"),
            ]
        })
        .collect();

    let name_width = rows.iter().map(|r| r[0].len()).max().unwrap_or(0).max(4);
    println!(
        "{:<name_width$}  {:<9}  {:<26}  DETAIL",
        "NAME", "STATUS", "PHASE"
    );
    for [name, status, phase, detail] in rows {
        println!("{:<name_width$}  {:<9}  {:<26}  {}", name, status, phase, detail);
    }
}
