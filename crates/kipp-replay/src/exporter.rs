//! Turns a stored session into a shareable replay.
//!
//! Export never panics and never returns `Err` to the caller: every outcome
//! folds into a [`ShareResult`] so callers can surface failures in the UI
//! without unwinding whatever drove the export.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use kipp_core::{EventKind, EventPayload, SessionEvent, SessionId};
use kipp_store::StorageProvider;

use crate::artifact::ReplayArtifact;
use crate::error::ReplayError;

/// Where exported artifacts go and how the viewer is wired in.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub output_dir: PathBuf,
    /// Viewer bundle to reference from the HTML. `None` produces a page
    /// that only carries the embedded state.
    pub ui_bundle_url: Option<String>,
    pub ui_config: Value,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            ui_bundle_url: None,
            ui_config: Value::Null,
        }
    }
}

/// Labels attached to an uploaded replay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareMeta {
    pub session_id: SessionId,
    pub slug: String,
    pub query: String,
}

/// Destination for uploaded replays.
#[async_trait]
pub trait ShareBackend: Send + Sync {
    /// Stores the rendered HTML and returns a public URL for it.
    async fn upload(&self, html: &str, meta: &ShareMeta) -> Result<String, ReplayError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportMode {
    LocalFile,
    Upload,
}

/// Outcome of an export, shaped for direct serialization to a client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShareResult {
    fn failed(err: &ReplayError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

pub struct Exporter {
    store: Arc<dyn StorageProvider>,
    config: ExportConfig,
    backend: Option<Arc<dyn ShareBackend>>,
}

impl Exporter {
    pub fn new(store: Arc<dyn StorageProvider>, config: ExportConfig) -> Self {
        Self {
            store,
            config,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ShareBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Exports a session replay, writing a local file or uploading through
    /// the configured backend.
    pub async fn export(&self, session_id: &SessionId, mode: ExportMode) -> ShareResult {
        match self.try_export(session_id, mode).await {
            Ok(result) => result,
            Err(err) => {
                error!(session_id = %session_id, error = %err, "replay export failed");
                ShareResult::failed(&err)
            }
        }
    }

    async fn try_export(
        &self,
        session_id: &SessionId,
        mode: ExportMode,
    ) -> Result<ShareResult, ReplayError> {
        let info = self
            .store
            .session_info(session_id)
            .await?
            .ok_or_else(|| ReplayError::SessionNotFound(session_id.to_string()))?;
        let events = self.store.session_events(session_id).await?;
        let artifact = ReplayArtifact::new(info, &events, self.config.ui_config.clone());
        let html = artifact.to_html(self.config.ui_bundle_url.as_deref())?;

        match mode {
            ExportMode::LocalFile => {
                std::fs::create_dir_all(&self.config.output_dir)?;
                let path = self.config.output_dir.join(export_filename(session_id));
                std::fs::write(&path, &html)?;
                info!(session_id = %session_id, path = %path.display(), "replay exported");
                Ok(ShareResult {
                    success: true,
                    path: Some(path.display().to_string()),
                    ..ShareResult::default()
                })
            }
            ExportMode::Upload => {
                let backend = self.backend.as_ref().ok_or_else(|| {
                    ReplayError::Configuration("no share backend configured".to_owned())
                })?;
                let query = first_query(&artifact.events);
                let meta = ShareMeta {
                    session_id: session_id.clone(),
                    slug: slugify(&query, session_id),
                    query,
                };
                let url = backend.upload(&html, &meta).await?;
                info!(session_id = %session_id, url = %url, "replay uploaded");
                Ok(ShareResult {
                    success: true,
                    url: Some(url),
                    ..ShareResult::default()
                })
            }
        }
    }
}

fn export_filename(session_id: &SessionId) -> String {
    format!(
        "kipp-replay-{}-{}.html",
        session_id,
        Utc::now().format("%Y%m%d-%H%M%S")
    )
}

/// First user query in the log, used to label shared replays.
fn first_query(events: &[SessionEvent]) -> String {
    events
        .iter()
        .find(|event| event.kind == EventKind::UserMessage)
        .and_then(|event| match event.typed_payload() {
            Ok(EventPayload::UserMessage(payload)) => {
                payload.content.first_text().map(str::to_owned)
            }
            _ => None,
        })
        .unwrap_or_default()
}

/// Lowercase alphanumerics and single dashes, at most 50 characters. Falls
/// back to the session id when the query yields nothing usable.
fn slugify(text: &str, session_id: &SessionId) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in text.chars() {
        if !c.is_ascii_alphanumeric() {
            pending_dash = true;
            continue;
        }
        let needed = if pending_dash && !slug.is_empty() { 2 } else { 1 };
        if slug.len() + needed > 50 {
            break;
        }
        if pending_dash && !slug.is_empty() {
            slug.push('-');
        }
        pending_dash = false;
        slug.push(c.to_ascii_lowercase());
    }
    if slug.is_empty() {
        session_id.to_string()
    } else {
        slug
    }
}
