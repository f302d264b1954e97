use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use tracing::{error, instrument, warn};

use kipp_core::{now_ms, EventKind, SessionEvent, SessionId};

use crate::database::Database;
use crate::error::StoreError;
use crate::provider::{SessionInfo, SessionUpdate, StorageProvider};
use crate::row_helpers;
use crate::schema;

/// Reference [`StorageProvider`] backed by SQLite.
///
/// One WAL-mode connection behind a mutex; every call runs a short
/// transaction-free statement batch, so holding the lock across a call is
/// cheap. Cascade from sessions to events is enforced by the schema.
pub struct SqliteStore {
    db: Database,
    closed: AtomicBool,
}

impl SqliteStore {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            db: Database::open(path)?,
            closed: AtomicBool::new(false),
        })
    }

    /// In-memory store, used by tests and ephemeral runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            db: Database::in_memory()?,
            closed: AtomicBool::new(false),
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn session_exists(conn: &rusqlite::Connection, id: &SessionId) -> Result<bool, StoreError> {
        let row: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionInfo, StoreError> {
    let id: String = row_helpers::get(row, 0, "sessions", "id")?;
    let metadata_raw: Option<String> = row_helpers::get_opt(row, 5, "sessions", "metadata")?;
    let metadata = metadata_raw
        .map(|raw| row_helpers::parse_json(&raw, "sessions", "metadata"))
        .transpose()?;

    Ok(SessionInfo {
        id: SessionId::from_raw(id),
        created_at: row_helpers::get(row, 1, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 2, "sessions", "updated_at")?,
        workspace: row_helpers::get(row, 3, "sessions", "workspace")?,
        user_id: row_helpers::get_opt(row, 4, "sessions", "user_id")?,
        metadata,
    })
}

const SESSION_COLUMNS: &str = "id, created_at, updated_at, workspace, user_id, metadata";

/// Decode one persisted event record. A record that no longer parses is
/// substituted with a synthetic `system` event carrying the failure, so one
/// bad row cannot take the whole session log down with it.
fn decode_event(row_id: i64, timestamp: i64, raw: &str) -> SessionEvent {
    match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(err) => {
            warn!(row_id, error = %err, "unreadable event record, substituting system event");
            SessionEvent::with_timestamp(
                EventKind::System,
                serde_json::json!({
                    "level": "error",
                    "message": "unreadable event record",
                    "details": { "rowId": row_id, "error": err.to_string() },
                }),
                timestamp,
            )
        }
    }
}

#[async_trait]
impl StorageProvider for SqliteStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        // The schema is IF NOT EXISTS throughout, so re-running it is safe.
        self.db.with_conn(|conn| {
            conn.execute_batch(schema::CREATE_TABLES)
                .map_err(|e| StoreError::Database(format!("schema: {e}")))
        })
    }

    #[instrument(skip(self, info), fields(session_id = %info.id))]
    async fn create_session(&self, mut info: SessionInfo) -> Result<SessionInfo, StoreError> {
        self.ensure_open()?;
        let now = now_ms();
        if info.created_at == 0 {
            info.created_at = now;
        }
        if info.updated_at == 0 {
            info.updated_at = info.created_at;
        }

        self.db.with_conn(|conn| {
            if Self::session_exists(conn, &info.id)? {
                return Err(StoreError::DuplicateSession(info.id.to_string()));
            }
            let metadata = info
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                "INSERT INTO sessions (id, created_at, updated_at, workspace, user_id, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    info.id.as_str(),
                    info.created_at,
                    info.updated_at,
                    info.workspace,
                    info.user_id,
                    metadata,
                ],
            )?;
            Ok(())
        })?;

        Ok(info)
    }

    async fn session_info(&self, id: &SessionId) -> Result<Option<SessionInfo>, StoreError> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self, update), fields(session_id = %id))]
    async fn update_session_info(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StoreError> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            let mut info = match rows.next()? {
                Some(row) => row_to_session(row)?,
                None => return Err(StoreError::SessionNotFound(id.to_string())),
            };
            drop(rows);
            drop(stmt);

            update.apply_to(&mut info);
            info.updated_at = now_ms();

            let metadata = info
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                "UPDATE sessions SET updated_at = ?1, workspace = ?2, user_id = ?3, metadata = ?4
                 WHERE id = ?5",
                params![
                    info.updated_at,
                    info.workspace,
                    info.user_id,
                    metadata,
                    id.as_str(),
                ],
            )?;
            Ok(info)
        })
    }

    async fn all_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC, created_at DESC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
    }

    async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>, StoreError> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1
                 ORDER BY updated_at DESC, created_at DESC"
            ))?;
            let mut rows = stmt.query([user_id])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.ensure_open()?;
        self.db.with_conn(|conn| {
            // events go with the session via ON DELETE CASCADE
            let affected = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(affected > 0)
        })
    }

    #[instrument(skip(self, event), fields(session_id = %session_id, kind = %event.kind))]
    async fn save_event(
        &self,
        session_id: &SessionId,
        event: &SessionEvent,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let raw = serde_json::to_string(event)?;
        self.db.with_conn(|conn| {
            if !Self::session_exists(conn, session_id)? {
                return Err(StoreError::SessionNotFound(session_id.to_string()));
            }
            conn.execute(
                "INSERT INTO events (session_id, timestamp, event_data) VALUES (?1, ?2, ?3)",
                params![session_id.as_str(), event.timestamp, raw],
            )?;
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                params![now_ms(), session_id.as_str()],
            )?;
            Ok(())
        })
    }

    async fn session_events(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        self.ensure_open()?;
        let result = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, event_data FROM events
                 WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                let row_id: i64 = row_helpers::get(row, 0, "events", "id")?;
                let timestamp: i64 = row_helpers::get(row, 1, "events", "timestamp")?;
                let raw: String = row_helpers::get(row, 2, "events", "event_data")?;
                events.push(decode_event(row_id, timestamp, &raw));
            }
            Ok(events)
        });

        // A session view that cannot load is worse than a shorter one, so
        // engine-level read failures degrade to an empty log.
        match result {
            Ok(events) => Ok(events),
            Err(err) => {
                error!(session_id = %session_id, error = %err, "event log read failed, returning empty");
                Ok(Vec::new())
            }
        }
    }

    async fn health_check(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.db
            .with_conn(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(StoreError::from)
            })
            .is_ok()
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Flush the WAL so a following process sees everything.
        let _ = self.db.with_conn(|conn| {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
                .map_err(StoreError::from)
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use kipp_core::{EventPayload, SystemLevel};

    use super::*;

    fn setup() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    fn session(id: &str) -> SessionInfo {
        SessionInfo::with_id(SessionId::from_raw(id), "/tmp/ws")
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = setup();
        let mut info = session("sess_1");
        info.metadata = Some(json!({ "name": "demo", "model": "m-1" }));

        let created = store.create_session(info.clone()).await.unwrap();
        assert_eq!(created, info);

        let found = store
            .session_info(&SessionId::from_raw("sess_1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, info);
    }

    #[tokio::test]
    async fn get_missing_session_is_none() {
        let store = setup();
        let found = store
            .session_info(&SessionId::from_raw("sess_nope"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let store = setup();
        store.create_session(session("sess_1")).await.unwrap();
        let err = store.create_session(session("sess_1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSession(_)), "got: {err}");
    }

    #[tokio::test]
    async fn zero_timestamps_are_stamped() {
        let store = setup();
        let mut info = session("sess_1");
        info.created_at = 0;
        info.updated_at = 0;
        let created = store.create_session(info).await.unwrap();
        assert!(created.created_at > 0);
        assert_eq!(created.updated_at, created.created_at);
    }

    #[tokio::test]
    async fn explicit_timestamps_are_kept() {
        let store = setup();
        let mut info = session("sess_1");
        info.created_at = 1_000;
        info.updated_at = 2_000;
        let created = store.create_session(info).await.unwrap();
        assert_eq!(created.created_at, 1_000);
        assert_eq!(created.updated_at, 2_000);
    }

    #[tokio::test]
    async fn update_refreshes_updated_at() {
        let store = setup();
        let mut info = session("sess_1");
        info.created_at = 1_000;
        info.updated_at = 1_000;
        store.create_session(info).await.unwrap();

        let id = SessionId::from_raw("sess_1");
        let update = SessionUpdate {
            metadata: Some(json!({ "name": "renamed" })),
            ..Default::default()
        };
        let updated = store.update_session_info(&id, update).await.unwrap();
        assert_eq!(updated.metadata, Some(json!({ "name": "renamed" })));
        assert_eq!(updated.workspace, "/tmp/ws");
        assert!(updated.updated_at > 1_000);

        // persisted, not just returned
        let reread = store.session_info(&id).await.unwrap().unwrap();
        assert_eq!(reread, updated);
    }

    #[tokio::test]
    async fn update_missing_session_fails() {
        let store = setup();
        let err = store
            .update_session_info(&SessionId::from_raw("sess_nope"), SessionUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)), "got: {err}");
    }

    #[tokio::test]
    async fn sessions_ordered_by_recency() {
        let store = setup();
        let mut a = session("sess_a");
        a.created_at = 1_000;
        a.updated_at = 1_000;
        let mut b = session("sess_b");
        b.created_at = 2_000;
        b.updated_at = 2_000;
        store.create_session(a).await.unwrap();
        store.create_session(b).await.unwrap();

        let order: Vec<String> = store
            .all_sessions()
            .await
            .unwrap()
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(order, vec!["sess_b", "sess_a"]);

        // touching a moves it to the front
        store
            .update_session_info(&SessionId::from_raw("sess_a"), SessionUpdate::default())
            .await
            .unwrap();
        let order: Vec<String> = store
            .all_sessions()
            .await
            .unwrap()
            .iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(order, vec!["sess_a", "sess_b"]);
    }

    #[tokio::test]
    async fn user_sessions_filters_by_owner() {
        let store = setup();
        let mut mine = session("sess_mine");
        mine.user_id = Some("user_1".to_owned());
        let mut theirs = session("sess_theirs");
        theirs.user_id = Some("user_2".to_owned());
        store.create_session(mine).await.unwrap();
        store.create_session(theirs).await.unwrap();
        store.create_session(session("sess_anon")).await.unwrap();

        let sessions = store.user_sessions("user_1").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id.as_str(), "sess_mine");
    }

    #[tokio::test]
    async fn save_event_requires_session() {
        let store = setup();
        let err = store
            .save_event(&SessionId::from_raw("sess_nope"), &SessionEvent::user_text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)), "got: {err}");
    }

    #[tokio::test]
    async fn event_round_trip_refreshes_session() {
        let store = setup();
        let mut info = session("sess_1");
        info.created_at = 1_000;
        info.updated_at = 1_000;
        store.create_session(info).await.unwrap();

        let id = SessionId::from_raw("sess_1");
        let event = SessionEvent::user_text("hello");
        store.save_event(&id, &event).await.unwrap();

        let events = store.session_events(&id).await.unwrap();
        assert_eq!(events, vec![event]);

        let info = store.session_info(&id).await.unwrap().unwrap();
        assert!(info.updated_at >= info.created_at);
        assert!(info.updated_at > 1_000);
    }

    #[tokio::test]
    async fn events_ordered_by_timestamp_then_insertion() {
        let store = setup();
        store.create_session(session("sess_1")).await.unwrap();
        let id = SessionId::from_raw("sess_1");

        let late = SessionEvent::with_timestamp(EventKind::UserMessage, json!({"content": "late"}), 200);
        let early = SessionEvent::with_timestamp(EventKind::UserMessage, json!({"content": "early"}), 100);
        let tied = SessionEvent::with_timestamp(EventKind::UserMessage, json!({"content": "tied"}), 200);

        store.save_event(&id, &late).await.unwrap();
        store.save_event(&id, &early).await.unwrap();
        store.save_event(&id, &tied).await.unwrap();

        let events = store.session_events(&id).await.unwrap();
        let contents: Vec<&str> = events
            .iter()
            .map(|e| e.payload["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["early", "late", "tied"]);
    }

    #[tokio::test]
    async fn empty_and_unknown_sessions_read_as_empty() {
        let store = setup();
        store.create_session(session("sess_1")).await.unwrap();
        assert!(store
            .session_events(&SessionId::from_raw("sess_1"))
            .await
            .unwrap()
            .is_empty());
        assert!(store
            .session_events(&SessionId::from_raw("sess_unknown"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_to_events() {
        let store = setup();
        store.create_session(session("sess_1")).await.unwrap();
        let id = SessionId::from_raw("sess_1");
        store.save_event(&id, &SessionEvent::user_text("a")).await.unwrap();
        store.save_event(&id, &SessionEvent::user_text("b")).await.unwrap();

        assert!(store.delete_session(&id).await.unwrap());
        assert!(store.session_info(&id).await.unwrap().is_none());
        assert!(store.session_events(&id).await.unwrap().is_empty());

        // rows are really gone, not just invisible through the provider
        let orphaned: i64 = store
            .database()
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM events WHERE session_id = 'sess_1'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(orphaned, 0);
    }

    #[tokio::test]
    async fn delete_missing_returns_false() {
        let store = setup();
        assert!(!store
            .delete_session(&SessionId::from_raw("sess_nope"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn malformed_record_recovers_as_system_event() {
        let store = setup();
        store.create_session(session("sess_1")).await.unwrap();
        let id = SessionId::from_raw("sess_1");
        store.save_event(&id, &SessionEvent::user_text("ok")).await.unwrap();

        store
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO events (session_id, timestamp, event_data) VALUES ('sess_1', 99999999999999, 'not json at all')",
                    [],
                )
                .map_err(StoreError::from)
            })
            .unwrap();

        let events = store.session_events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["content"], "ok");

        let synthetic = &events[1];
        assert_eq!(synthetic.kind, EventKind::System);
        match synthetic.typed_payload().unwrap() {
            EventPayload::System(p) => {
                assert_eq!(p.level, SystemLevel::Error);
                assert_eq!(p.message, "unreadable event record");
                assert!(p.details.unwrap()["rowId"].as_i64().is_some());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn corrupt_session_row_is_reported() {
        let store = setup();
        store
            .database()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO sessions (id, created_at, updated_at, workspace, metadata)
                     VALUES ('sess_bad', 1, 2, '/w', '{broken')",
                    [],
                )
                .map_err(StoreError::from)
            })
            .unwrap();

        let err = store
            .session_info(&SessionId::from_raw("sess_bad"))
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                StoreError::CorruptRow {
                    table: "sessions",
                    column: "metadata",
                    ..
                }
            ),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let store = setup();
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
        assert!(store.health_check().await);
    }

    #[tokio::test]
    async fn close_blocks_later_writes() {
        let store = setup();
        store.create_session(session("sess_1")).await.unwrap();

        store.close().await.unwrap();
        // repeated close is a no-op
        store.close().await.unwrap();
        assert!(!store.health_check().await);

        let err = store.create_session(session("sess_2")).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed), "got: {err}");
        let err = store
            .save_event(&SessionId::from_raw("sess_1"), &SessionEvent::user_text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed), "got: {err}");
    }
}
