use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use thread_core::SortOrder;
use thread_storage::{StoreConfig, ThreadStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "threadctl")]
#[command(about = "Inspect and maintain a thread store database", long_about = None)]
struct Cli {
    /// Database file; falls back to THREAD_STORE_DB
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the schema
    Migrate,
    /// Mark active streams past their expiry as expired
    ExpireStreams,
    /// Print a thread and its items as JSON
    Show {
        thread_id: String,
        /// Newest item first
        #[arg(long)]
        desc: bool,
    },
    /// Print a thread's dependency graph, execution order and ready frontier
    Dag {
        thread_id: String,
        /// Item ids already done, for the ready frontier
        #[arg(long = "completed", value_delimiter = ',')]
        completed: Vec<String>,
    },
    /// List a project's threads
    Threads { project_id: String },
}

#[derive(Serialize)]
struct SchemaReport {
    db_path: PathBuf,
    schema_version: i64,
}

#[derive(Serialize)]
struct DagReport {
    #[serde(flatten)]
    structure: thread_core::DagStructure,
    order: Vec<String>,
    ready: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = StoreConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }
    let Some(db_path) = config.db_path.clone() else {
        bail!("no database given; pass --db or set THREAD_STORE_DB");
    };
    let store = ThreadStore::open_with_config(config)
        .with_context(|| format!("Failed to open thread store at {}", db_path.display()))?;

    match cli.command {
        Commands::Migrate => {
            let schema_version = store.schema_version().context("Failed to read schema version")?;
            print_json(&SchemaReport {
                db_path,
                schema_version,
            })?;
        }
        Commands::ExpireStreams => {
            let expired = store
                .streams()
                .expire_stale()
                .context("Failed to expire streams")?;
            info!(event = "expire_streams_done", expired);
            println!("Expired {expired} stream(s)");
        }
        Commands::Show { thread_id, desc } => {
            let Some(mut thread) = store
                .get_thread_with_items(&thread_id)
                .context("Failed to load thread")?
            else {
                bail!("thread {thread_id} not found");
            };
            if desc {
                thread.items = store
                    .items()
                    .list_by_thread(&thread_id, SortOrder::Desc)
                    .context("Failed to load items")?;
            }
            print_json(&thread)?;
        }
        Commands::Dag {
            thread_id,
            completed,
        } => {
            let edges = store.edges();
            let completed: BTreeSet<String> = completed.into_iter().collect();
            let report = DagReport {
                structure: edges
                    .get_dag_structure(&thread_id)
                    .context("Failed to load edges")?,
                order: edges
                    .topological_order(&thread_id)
                    .context("Failed to order dependency graph")?,
                ready: edges
                    .ready_items(&thread_id, &completed)
                    .context("Failed to compute ready items")?,
            };
            print_json(&report)?;
        }
        Commands::Threads { project_id } => {
            let threads = store
                .threads()
                .list_by_project(&project_id)
                .context("Failed to list threads")?;
            if threads.is_empty() {
                println!("No threads for project {project_id}");
                return Ok(());
            }
            println!("Found {} threads:", threads.len());
            for thread in &threads {
                let scope = match (thread.scope_type.as_deref(), thread.scope_id.as_deref()) {
                    (Some(kind), Some(id)) => format!("{kind}:{id}"),
                    (Some(kind), None) => kind.to_string(),
                    _ => "-".to_string(),
                };
                println!(
                    "- [{}] {} ({})",
                    thread.id,
                    thread.title.as_deref().unwrap_or("untitled"),
                    scope
                );
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{rendered}");
    Ok(())
}

/// `RUST_LOG` wins, then `THREAD_STORE_LOG_LEVEL`, then `--debug`, then `info`. Logs go to
/// stderr so JSON on stdout stays clean.
fn init_logging(debug: bool) {
    let level = if let Ok(level) = std::env::var("THREAD_STORE_LOG_LEVEL") {
        level
    } else if debug {
        "debug".to_string()
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("logging already initialized");
    }
}
