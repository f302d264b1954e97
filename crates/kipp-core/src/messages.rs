//! Derived, UI-facing view of a session: messages and message groups.
//!
//! Messages are never persisted. They are folded out of the event log and can
//! be rebuilt from it at any time, which is why every field here is plain data
//! with structural equality.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Environment,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Environment => "environment",
        }
    }
}

// --- Content types ---

/// Message content is either plain text or a list of typed parts. The wire
/// shape is untagged: a JSON string parses as `Text`, an array as `Parts`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageRef },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl MessageContent {
    /// First text fragment, if any.
    pub fn first_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Parts(parts) => parts.iter().find_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// All text fragments joined, for plain rendering and search.
    pub fn plain_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn first_image(&self) -> Option<&ImageRef> {
        match self {
            Self::Text(_) => None,
            Self::Parts(parts) => parts.iter().find_map(|part| match part {
                ContentPart::ImageUrl { image_url } => Some(image_url),
                _ => None,
            }),
        }
    }

    pub fn has_image(&self) -> bool {
        self.first_image().is_some()
    }

    /// Appends a text fragment, used when accumulating streaming deltas.
    pub fn append_text(&mut self, fragment: &str) {
        match self {
            Self::Text(text) => text.push_str(fragment),
            Self::Parts(parts) => {
                if let Some(ContentPart::Text { text }) = parts.last_mut() {
                    text.push_str(fragment);
                } else {
                    parts.push(ContentPart::Text {
                        text: fragment.to_owned(),
                    });
                }
            }
        }
    }
}

// --- Messages ---

/// One conversational turn, reconstructed from one or more events.
///
/// `id` is unique per message; `message_id` correlates streaming fragments
/// and the thinking channel that belong to the same logical turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttlt_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// --- Convenience constructors ---

impl Message {
    pub fn new(
        id: impl Into<String>,
        role: Role,
        content: MessageContent,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            role,
            content,
            timestamp,
            message_id: None,
            thinking: None,
            is_streaming: false,
            tool_calls: None,
            finish_reason: None,
            ttft_ms: None,
            ttlt_ms: None,
            description: None,
        }
    }

    pub fn user(id: impl Into<String>, content: MessageContent, timestamp: i64) -> Self {
        Self::new(id, Role::User, content, timestamp)
    }

    pub fn system(id: impl Into<String>, text: impl Into<String>, timestamp: i64) -> Self {
        Self::new(id, Role::System, MessageContent::Text(text.into()), timestamp)
    }

    pub fn environment(
        id: impl Into<String>,
        description: Option<String>,
        content: MessageContent,
        timestamp: i64,
    ) -> Self {
        let mut message = Self::new(id, Role::Environment, content, timestamp);
        message.description = description;
        message
    }

    /// Empty assistant message, the merge target when an update arrives for a
    /// turn nothing has been recorded for yet.
    pub fn assistant_placeholder(id: impl Into<String>, timestamp: i64) -> Self {
        Self::new(id, Role::Assistant, MessageContent::default(), timestamp)
    }
}

// --- Groups ---

/// An ordered run of messages forming one logical exchange, typically a user
/// question plus the assistant response cycle that answers it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageGroup {
    messages: Vec<Message>,
}

impl MessageGroup {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn opening_role(&self) -> Option<Role> {
        self.messages.first().map(|m| m.role)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
