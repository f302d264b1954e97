use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::DateTime;
use clap::{Parser, Subcommand};
use tracing::Level;

use kipp_core::SessionId;
use kipp_replay::{ExportConfig, ExportMode, Exporter};
use kipp_session::{IngestMode, SessionProcessor};
use kipp_store::{SqliteStore, StorageProvider};
use kipp_telemetry::{init_telemetry, LogQuery, TelemetryConfig, TelemetryGuard};

#[derive(Parser)]
#[command(name = "kipp", version, about = "Inspect and export kipp agent sessions")]
struct Cli {
    /// Path to the session database. Defaults to ~/.kipp/database/kipp.db.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List stored sessions, most recently updated first.
    Sessions,
    /// Print a session transcript.
    Show { session_id: String },
    /// Export a session as a standalone replay page.
    Export {
        session_id: String,
        /// Directory the HTML file is written to.
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Show persisted warn+ log records, oldest first.
    Logs {
        /// Only records tagged with this session id.
        #[arg(long)]
        session: Option<String>,
        /// Only records tagged with this event kind, e.g. tool_call.
        #[arg(long)]
        kind: Option<String>,
        /// Maximum number of records to show.
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Quiet by default; RUST_LOG overrides.
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: Level::WARN,
        ..TelemetryConfig::default()
    });

    match cli.command {
        Command::Sessions => {
            let store = open_store(&cli.db)?;
            list_sessions(store.as_ref()).await
        }
        Command::Show { session_id } => {
            let store = open_store(&cli.db)?;
            show_session(store.as_ref(), &session_id).await
        }
        Command::Export { session_id, out } => {
            let store = open_store(&cli.db)?;
            export_session(store, &session_id, out).await
        }
        Command::Logs { session, kind, limit } => show_logs(&telemetry, session, kind, limit),
    }
}

fn open_store(db: &Option<PathBuf>) -> anyhow::Result<Arc<SqliteStore>> {
    let db_path = match db {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    Ok(Arc::new(SqliteStore::open(&db_path)?))
}

async fn list_sessions(store: &SqliteStore) -> anyhow::Result<()> {
    let sessions = store.all_sessions().await?;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for session in sessions {
        let metadata = session
            .metadata
            .as_ref()
            .map(|value| format!("  {}", serde_json::to_string(value).unwrap_or_default()))
            .unwrap_or_default();
        println!(
            "{}  {}  {}{}",
            session.id,
            format_timestamp(session.updated_at),
            session.workspace,
            metadata
        );
    }
    Ok(())
}

async fn show_session(store: &SqliteStore, raw_id: &str) -> anyhow::Result<()> {
    let session_id = SessionId::from_raw(raw_id);
    let info = store
        .session_info(&session_id)
        .await?
        .with_context(|| format!("session {raw_id} not found"))?;
    let events = store.session_events(&session_id).await?;

    let mut processor = SessionProcessor::new();
    processor.process_batch(&session_id, &events, IngestMode::Replay);

    println!("session {}  workspace {}", info.id, info.workspace);
    println!(
        "created {}  updated {}  events {}",
        format_timestamp(info.created_at),
        format_timestamp(info.updated_at),
        events.len()
    );
    println!();

    for group in processor.groups(&session_id) {
        for message in group.messages() {
            println!(
                "[{}] {}: {}",
                format_timestamp(message.timestamp),
                message.role.as_str(),
                message.content.plain_text()
            );
            if let Some(thinking) = &message.thinking {
                println!("    (thinking) {thinking}");
            }
        }
        println!();
    }
    Ok(())
}

async fn export_session(
    store: Arc<SqliteStore>,
    raw_id: &str,
    out: PathBuf,
) -> anyhow::Result<()> {
    let session_id = SessionId::from_raw(raw_id);
    let exporter = Exporter::new(
        store,
        ExportConfig {
            output_dir: out,
            ..ExportConfig::default()
        },
    );

    let result = exporter.export(&session_id, ExportMode::LocalFile).await;
    if result.success {
        match result.path {
            Some(path) => println!("replay written to {path}"),
            None => println!("replay exported"),
        }
        Ok(())
    } else {
        anyhow::bail!(
            "export failed: {}",
            result.error.unwrap_or_else(|| "unknown error".to_owned())
        )
    }
}

fn show_logs(
    telemetry: &TelemetryGuard,
    session: Option<String>,
    kind: Option<String>,
    limit: u32,
) -> anyhow::Result<()> {
    let sink = telemetry.logs().context("log persistence is disabled")?;
    let records = sink.query(&LogQuery {
        session_id: session,
        event_kind: kind,
        limit: Some(limit),
        ..LogQuery::default()
    })?;
    if records.is_empty() {
        println!("no log records");
        return Ok(());
    }

    // query returns newest first; print chronologically
    for record in records.iter().rev() {
        let session = record
            .session_id
            .as_deref()
            .map(|id| format!("  session={id}"))
            .unwrap_or_default();
        let kind = record
            .event_kind
            .as_deref()
            .map(|kind| format!("  kind={kind}"))
            .unwrap_or_default();
        println!(
            "{}  {:5}  {}  {}{}{}",
            format_timestamp(record.timestamp),
            record.level,
            record.target,
            record.message,
            session,
            kind
        );
    }
    let total = sink.count()?;
    if total > records.len() as i64 {
        println!("(showing {} of {} records)", records.len(), total);
    }
    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let dir = dirs_home().join(".kipp").join("database");
    std::fs::create_dir_all(&dir).context("creating database directory")?;
    Ok(dir.join("kipp.db"))
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

fn format_timestamp(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}
