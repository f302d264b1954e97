use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A persisted log record. Timestamps are epoch milliseconds, the same
/// unit the event log uses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: i64,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    /// Name of the innermost span the record was emitted under, e.g. the
    /// storage method that failed.
    pub span: Option<String>,
    pub session_id: Option<String>,
    pub event_kind: Option<String>,
}

/// Filters for searching persisted logs. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub session_id: Option<String>,
    pub event_kind: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<u32>,
}

const DEFAULT_QUERY_LIMIT: u32 = 100;

/// SQLite sink that persists warn+ records.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp INTEGER NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 span TEXT,
                 session_id TEXT,
                 event_kind TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
             CREATE INDEX IF NOT EXISTS idx_logs_kind ON logs(event_kind);
             CREATE INDEX IF NOT EXISTS idx_logs_time ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Best-effort: a record that cannot be written is dropped rather than
    /// feeding an error back into the logging path.
    fn insert(&self, entry: &LogEntry) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span, session_id, event_kind)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.span,
                entry.session_id,
                entry.event_kind,
            ],
        );
    }

    /// Matching records, newest first, insertion order breaking timestamp
    /// ties the same way the event log does.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            conditions.push("level = ?");
            params.push(Box::new(level.clone()));
        }
        if let Some(target) = &q.target {
            conditions.push("target LIKE ?");
            params.push(Box::new(format!("%{target}%")));
        }
        if let Some(session_id) = &q.session_id {
            conditions.push("session_id = ?");
            params.push(Box::new(session_id.clone()));
        }
        if let Some(event_kind) = &q.event_kind {
            conditions.push("event_kind = ?");
            params.push(Box::new(event_kind.clone()));
        }
        if let Some(since) = q.since {
            conditions.push("timestamp >= ?");
            params.push(Box::new(since));
        }

        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, span, session_id, event_kind
             FROM logs",
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        params.push(Box::new(q.limit.unwrap_or(DEFAULT_QUERY_LIMIT)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                span: row.get(6)?,
                session_id: row.get(7)?,
                event_kind: row.get(8)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct LogEntry {
    timestamp: i64,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span: Option<String>,
    session_id: Option<String>,
    event_kind: Option<String>,
}

/// tracing layer that forwards warn+ records to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// Collects every recorded field into a JSON map; the layer pulls the
/// well-known keys back out afterwards.
#[derive(Default)]
struct JsonVisitor {
    fields: Map<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_owned(), Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields
            .insert(field.name().to_owned(), Value::String(value.to_owned()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_owned(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_owned(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_owned(), Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_owned(), value.into());
    }
}

/// Removes `key` from the map and renders it as plain text. Values that
/// arrived through `record_debug` carry their `Debug` quotes; strip them.
fn take_text(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    Some(match fields.remove(key)? {
        Value::String(s) => s.trim_matches('"').to_owned(),
        other => other.to_string(),
    })
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // tracing orders levels ERROR < WARN < INFO < ...
        if metadata.level() > &Level::WARN {
            return;
        }

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let mut fields = visitor.fields;
        let message = take_text(&mut fields, "message").unwrap_or_default();
        let mut session_id = take_text(&mut fields, "session_id");
        let mut event_kind = take_text(&mut fields, "kind");

        // Fall back to the span scope for the session / kind keys and pick
        // up the innermost span's name in the same walk.
        let mut span_name = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if span_name.is_none() {
                    span_name = Some(span.name().to_owned());
                }
                let extensions = span.extensions();
                if let Some(context) = extensions.get::<SpanContext>() {
                    if session_id.is_none() {
                        session_id.clone_from(&context.session_id);
                    }
                    if event_kind.is_none() {
                        event_kind.clone_from(&context.event_kind);
                    }
                }
            }
        }

        let entry = LogEntry {
            timestamp: Utc::now().timestamp_millis(),
            level: metadata.level().to_string(),
            target: metadata.target().to_owned(),
            message,
            fields: (!fields.is_empty()).then(|| Value::Object(fields).to_string()),
            span: span_name,
            session_id,
            event_kind,
        };
        self.sink.insert(&entry);
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        let mut fields = visitor.fields;
        let session_id = take_text(&mut fields, "session_id");
        let event_kind = take_text(&mut fields, "kind");

        if session_id.is_some() || event_kind.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanContext {
                    session_id,
                    event_kind,
                });
            }
        }
    }
}

/// Stored on spans so child events inherit session / kind keys.
struct SpanContext {
    session_id: Option<String>,
    event_kind: Option<String>,
}
