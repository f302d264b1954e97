//! Core data model for the kipp session engine: branded ids, the session
//! event schema, and the derived message view.

pub mod events;
pub mod ids;
pub mod messages;

pub use events::{EventKind, EventPayload, SessionEvent, SystemLevel, now_ms};
pub use ids::{EventId, SessionId, ToolCallId};
pub use messages::{ContentPart, Message, MessageContent, MessageGroup, Role};
