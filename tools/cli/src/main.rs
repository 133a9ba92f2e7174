//! Tether CLI - inspect and maintain an offline sync database.
//!
//! Operates directly on the SQLite file an application's sync engine uses,
//! so it should not be pointed at a database that a running engine has open.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use tether_common::{RecordId, SessionKey};
use tether_store::{MutationRecord, MutationStore, SessionRow, SessionStore, SqliteStore};
use tether_sync::SyncConfig;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether - offline sync queue maintenance")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the sync database (default: <data dir>/tether/queue.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print machine readable JSON instead of a table.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List pending mutations in replay order.
    Queue,

    /// List delta sync sessions.
    Sessions,

    /// Remove a single pending mutation.
    Drop {
        /// Record identifier as shown by `queue`.
        record_id: String,
    },

    /// Remove every pending mutation.
    Clear,

    /// Delete a delta sync session so its next run starts from the baseline.
    ForgetSession {
        /// Session key as shown by `sessions`.
        session_key: String,
    },

    /// Print the effective engine configuration.
    Config {
        /// Configuration file to load (default: built-in defaults).
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Config { path } = &cli.command {
        return cmd_config(path.as_deref());
    }

    let db_path = match cli.db {
        Some(path) => path,
        None => default_db_path()?,
    };
    debug!("Using database {}", db_path.display());
    let store = open_store(&db_path)?;

    match cli.command {
        Commands::Queue => cmd_queue(&store, cli.json),
        Commands::Sessions => cmd_sessions(&store, cli.json),
        Commands::Drop { record_id } => cmd_drop(&store, &record_id),
        Commands::Clear => cmd_clear(&store),
        Commands::ForgetSession { session_key } => cmd_forget_session(&store, &session_key),
        Commands::Config { .. } => Ok(()),
    }
}

fn default_db_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("Could not determine the user data directory")?;
    Ok(data_dir.join("tether").join("queue.db"))
}

fn open_store(path: &Path) -> Result<SqliteStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    SqliteStore::open(path).with_context(|| format!("Failed to open database {}", path.display()))
}

/// Row printed by `queue --json`.
#[derive(Serialize)]
struct QueueEntry<'a> {
    position: usize,
    record_id: &'a str,
    response_type_tag: &'a str,
    attachment: Option<&'a str>,
    request: serde_json::Value,
}

impl<'a> QueueEntry<'a> {
    fn new(position: usize, record: &'a MutationRecord) -> Self {
        Self {
            position,
            record_id: record.record_id.as_str(),
            response_type_tag: &record.response_type_tag,
            attachment: record.attachment.as_ref().map(|a| a.local_path.as_str()),
            request: serde_json::from_str(&record.serialized_request)
                .unwrap_or_else(|_| serde_json::Value::String(record.serialized_request.clone())),
        }
    }
}

/// List pending mutations.
fn cmd_queue(store: &impl MutationStore, json: bool) -> Result<()> {
    let records = store.load_all().context("Failed to load queue")?;
    let entries: Vec<QueueEntry<'_>> = records
        .iter()
        .enumerate()
        .map(|(i, record)| QueueEntry::new(i + 1, record))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }

    println!("{} pending mutation(s):", entries.len());
    for entry in &entries {
        let attachment = entry
            .attachment
            .map(|path| format!(" [attachment: {}]", path))
            .unwrap_or_default();
        println!(
            "  {:>3}. {}  {}{}",
            entry.position, entry.record_id, entry.response_type_tag, attachment
        );
    }
    Ok(())
}

/// List delta sync sessions.
fn cmd_sessions(store: &impl SessionStore, json: bool) -> Result<()> {
    let sessions = store.list().context("Failed to list sessions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No delta sync sessions.");
        return Ok(());
    }

    for SessionRow {
        id,
        session_key,
        last_run_time_millis,
    } in &sessions
    {
        println!("  [{}] {}", id, session_key);
        println!("       last run: {}", format_last_run(*last_run_time_millis));
    }
    Ok(())
}

fn format_last_run(millis: i64) -> String {
    if millis == 0 {
        return "never".to_string();
    }
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| format!("{} ms (out of range)", millis))
}

/// Remove one pending mutation.
fn cmd_drop(store: &SqliteStore, record_id: &str) -> Result<()> {
    let record_id = RecordId::new(record_id).context("Invalid record id")?;
    if store.get(&record_id)?.is_none() {
        anyhow::bail!("No pending mutation with id {}", record_id);
    }

    store
        .remove(&record_id)
        .context("Failed to remove mutation")?;
    info!("Dropped mutation {}", record_id);
    println!("Dropped {}", record_id);
    Ok(())
}

/// Remove every pending mutation.
fn cmd_clear(store: &impl MutationStore) -> Result<()> {
    let count = store.count().context("Failed to count queue")?;
    store.clear().context("Failed to clear queue")?;
    info!("Cleared {} mutation(s)", count);
    println!("Cleared {} pending mutation(s)", count);
    Ok(())
}

/// Delete a session row.
fn cmd_forget_session(store: &impl SessionStore, session_key: &str) -> Result<()> {
    let key = SessionKey::from_raw(session_key);
    if !store.delete(&key).context("Failed to delete session")? {
        anyhow::bail!("No delta sync session with key {}", session_key);
    }
    println!("Forgot session {}", session_key);
    Ok(())
}

/// Print the configuration the engine would run with.
fn cmd_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    println!("{}", config.to_json()?);
    Ok(())
}
