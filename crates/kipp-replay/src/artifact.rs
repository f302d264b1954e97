//! Self-contained replay artifacts.
//!
//! A replay is the session's key frames plus enough metadata for a viewer
//! to rebuild the transcript offline. Streaming fragments are dropped at
//! construction: the terminal events carry the full content, so replays
//! stay small and re-render without animation jitter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kipp_core::SessionEvent;
use kipp_store::SessionInfo;

/// Keeps only events worth replaying: everything except streaming fragments.
pub fn key_frames(events: &[SessionEvent]) -> Vec<SessionEvent> {
    events
        .iter()
        .filter(|event| !event.kind.is_streaming())
        .cloned()
        .collect()
}

/// Which engine produced the artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Everything a replay viewer needs, embeddable in a single HTML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayArtifact {
    pub session_info: SessionInfo,
    pub events: Vec<SessionEvent>,
    pub server_info: ServerInfo,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub ui_config: Value,
}

impl ReplayArtifact {
    /// Builds an artifact from a full event log. Streaming fragments are
    /// filtered here so every artifact holds key frames only.
    pub fn new(session_info: SessionInfo, events: &[SessionEvent], ui_config: Value) -> Self {
        Self {
            session_info,
            events: key_frames(events),
            server_info: ServerInfo::default(),
            ui_config,
        }
    }

    /// Renders the artifact as a standalone HTML page with the state inlined
    /// on `window.__KIPP_REPLAY__`.
    ///
    /// When `ui_bundle_url` is set the page loads the viewer from there;
    /// otherwise it renders a notice and leaves the state for tooling to
    /// extract.
    pub fn to_html(&self, ui_bundle_url: Option<&str>) -> Result<String, serde_json::Error> {
        let state = serde_json::to_string(self)?;
        // "</" would let event content close the script tag early.
        let state = state.replace("</", "<\\/");

        let bundle = match ui_bundle_url {
            Some(url) => format!("\n  <script src=\"{url}\"></script>"),
            None => String::new(),
        };

        Ok(format!(
            "<!doctype html>\n\
             <html lang=\"en\">\n\
             <head>\n\
             \x20 <meta charset=\"utf-8\">\n\
             \x20 <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
             \x20 <title>Replay: {title}</title>\n\
             </head>\n\
             <body>\n\
             \x20 <div id=\"root\">This replay needs the viewer bundle to render.</div>\n\
             \x20 <script>window.__KIPP_REPLAY__ = {state};</script>{bundle}\n\
             </body>\n\
             </html>\n",
            title = self.session_info.id,
        ))
    }
}
