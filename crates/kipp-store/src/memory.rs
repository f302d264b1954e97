use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use kipp_core::{now_ms, SessionEvent, SessionId};

use crate::error::StoreError;
use crate::provider::{SessionInfo, SessionUpdate, StorageProvider};

/// Event plus its insertion sequence, the tiebreak for equal timestamps.
struct StoredEvent {
    seq: u64,
    event: SessionEvent,
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, SessionInfo>,
    events: HashMap<String, Vec<StoredEvent>>,
    next_seq: u64,
}

/// Non-durable [`StorageProvider`] holding everything in process memory.
///
/// Used for tests and ephemeral headless runs. Matches the SQLite provider's
/// contract exactly, including ordering and close semantics.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for MemoryStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        self.ensure_open()
    }

    async fn create_session(&self, mut info: SessionInfo) -> Result<SessionInfo, StoreError> {
        self.ensure_open()?;
        let now = now_ms();
        if info.created_at == 0 {
            info.created_at = now;
        }
        if info.updated_at == 0 {
            info.updated_at = info.created_at;
        }

        let mut inner = self.inner.write();
        if inner.sessions.contains_key(info.id.as_str()) {
            return Err(StoreError::DuplicateSession(info.id.to_string()));
        }
        inner.sessions.insert(info.id.to_string(), info.clone());
        Ok(info)
    }

    async fn session_info(&self, id: &SessionId) -> Result<Option<SessionInfo>, StoreError> {
        self.ensure_open()?;
        Ok(self.inner.read().sessions.get(id.as_str()).cloned())
    }

    async fn update_session_info(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StoreError> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        let info = inner
            .sessions
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        update.apply_to(info);
        info.updated_at = now_ms();
        Ok(info.clone())
    }

    async fn all_sessions(&self) -> Result<Vec<SessionInfo>, StoreError> {
        self.ensure_open()?;
        let mut sessions: Vec<SessionInfo> =
            self.inner.read().sessions.values().cloned().collect();
        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(sessions)
    }

    async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>, StoreError> {
        let mut sessions = self.all_sessions().await?;
        sessions.retain(|s| s.user_id.as_deref() == Some(user_id));
        Ok(sessions)
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        let existed = inner.sessions.remove(id.as_str()).is_some();
        inner.events.remove(id.as_str());
        if existed {
            debug!(session_id = %id, "session deleted");
        }
        Ok(existed)
    }

    async fn save_event(
        &self,
        session_id: &SessionId,
        event: &SessionEvent,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        if !inner.sessions.contains_key(session_id.as_str()) {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .events
            .entry(session_id.to_string())
            .or_default()
            .push(StoredEvent {
                seq,
                event: event.clone(),
            });
        if let Some(info) = inner.sessions.get_mut(session_id.as_str()) {
            info.updated_at = now_ms();
        }
        Ok(())
    }

    async fn session_events(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        self.ensure_open()?;
        let inner = self.inner.read();
        let Some(stored) = inner.events.get(session_id.as_str()) else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<&StoredEvent> = stored.iter().collect();
        ordered.sort_by_key(|s| (s.event.timestamp, s.seq));
        Ok(ordered.into_iter().map(|s| s.event.clone()).collect())
    }

    async fn health_check(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
