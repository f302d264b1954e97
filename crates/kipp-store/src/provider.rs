//! The durability contract between the session engine and its backends.
//!
//! A provider owns the source of truth: session metadata plus an append-only
//! event log per session. Everything the engine derives (messages, groups,
//! panel state) can be rebuilt from `session_events`, so providers never
//! store derived state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use kipp_core::{now_ms, SessionEvent, SessionId};

use crate::error::StoreError;

/// Durable metadata for one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    /// Epoch milliseconds, stamped at creation.
    pub created_at: i64,
    /// Epoch milliseconds, refreshed on every append and metadata update.
    pub updated_at: i64,
    /// Workspace path or identifier. Opaque to the store.
    pub workspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Open extension map: model selection, tags, display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SessionInfo {
    pub fn new(workspace: impl Into<String>) -> Self {
        Self::with_id(SessionId::new(), workspace)
    }

    pub fn with_id(id: SessionId, workspace: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id,
            created_at: now,
            updated_at: now,
            workspace: workspace.into(),
            user_id: None,
            metadata: None,
        }
    }
}

/// Partial update for session metadata. Fields left `None` are untouched;
/// supplied fields are replaced whole (`metadata` is not deep-merged).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SessionUpdate {
    pub fn apply_to(&self, info: &mut SessionInfo) {
        if let Some(workspace) = &self.workspace {
            info.workspace = workspace.clone();
        }
        if let Some(user_id) = &self.user_id {
            info.user_id = Some(user_id.clone());
        }
        if let Some(metadata) = &self.metadata {
            info.metadata = Some(metadata.clone());
        }
    }
}

/// Async durability backend for sessions and their event logs.
///
/// Implementations must serialize their own internal access; callers are
/// expected to serialize `save_event` calls per session (the provider does
/// not order concurrent appends to one session beyond what its engine does
/// naturally). After `close`, every method except `close` and `health_check`
/// fails with [`StoreError::Closed`].
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Prepares backing storage. Idempotent; safe to call repeatedly.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Creates a session record. Zero timestamps are stamped with the
    /// current time. Fails with [`StoreError::DuplicateSession`] if the id
    /// already exists.
    async fn create_session(&self, info: SessionInfo) -> Result<SessionInfo, StoreError>;

    /// Returns the session's metadata, or `None` if absent (not an error).
    async fn session_info(&self, id: &SessionId) -> Result<Option<SessionInfo>, StoreError>;

    /// Applies a partial update and refreshes `updated_at`, returning the
    /// new record. Fails with [`StoreError::SessionNotFound`] if absent.
    async fn update_session_info(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<SessionInfo, StoreError>;

    /// All sessions, most recently updated first.
    async fn all_sessions(&self) -> Result<Vec<SessionInfo>, StoreError>;

    /// Sessions owned by `user_id`, most recently updated first.
    async fn user_sessions(&self, user_id: &str) -> Result<Vec<SessionInfo>, StoreError>;

    /// Deletes the session and all its events atomically. Returns `false`
    /// (not an error) if no such session existed.
    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError>;

    /// Appends one event and refreshes the session's `updated_at`. The log
    /// is append-only; events are never updated or removed individually.
    /// Fails with [`StoreError::SessionNotFound`] if the session is absent.
    async fn save_event(
        &self,
        session_id: &SessionId,
        event: &SessionEvent,
    ) -> Result<(), StoreError>;

    /// The full event log in append order (timestamp, then insertion order
    /// as tiebreak). Unknown sessions and empty logs both yield `[]`. A
    /// record that cannot be decoded is substituted with a synthetic
    /// `system` event describing the failure instead of poisoning the read.
    async fn session_events(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SessionEvent>, StoreError>;

    /// Best-effort liveness check. `false` means "do not trust me right
    /// now", not necessarily "data lost".
    async fn health_check(&self) -> bool;

    /// Releases underlying resources. Repeated calls are no-ops.
    async fn close(&self) -> Result<(), StoreError>;
}
