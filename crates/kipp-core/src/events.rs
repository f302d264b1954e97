//! Canonical event schema for session streams.
//!
//! Every fact about a session is recorded as a [`SessionEvent`]: an immutable,
//! timestamped envelope with a string discriminant and a JSON payload. Streams
//! are append-only; a streaming message is "updated" by emitting further
//! fragment events that share a `messageId`, never by rewriting history.
//!
//! The discriminant set is open on the wire: kinds this crate does not know
//! about parse into [`EventKind::Other`] and serialize back verbatim, so newer
//! producers can add kinds without breaking older consumers.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{EventId, SessionId, ToolCallId};
use crate::messages::MessageContent;

/// Epoch milliseconds, the timestamp unit used across the event log.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// The string mapping in `as_str` / `From<String>` is the source of truth for
// the wire names; serde goes through it via `from`/`into`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    // ── Run lifecycle ──
    AgentRunStart,
    AgentRunEnd,

    // ── Conversation ──
    UserMessage,
    AssistantMessage,
    AssistantStreamingMessage,
    AssistantThinkingMessage,
    AssistantStreamingThinkingMessage,

    // ── Tools ──
    AssistantStreamingToolCall,
    ToolCall,
    ToolResult,

    // ── Side channels ──
    EnvironmentInput,
    PlanUpdate,
    PlanFinish,
    FinalAnswer,
    FinalAnswerStreaming,
    System,

    /// Any kind this crate does not recognize, preserved verbatim.
    Other(String),
}

/// Every kind with a fixed wire name, in declaration order.
pub const KNOWN_KINDS: [EventKind; 16] = [
    EventKind::AgentRunStart,
    EventKind::AgentRunEnd,
    EventKind::UserMessage,
    EventKind::AssistantMessage,
    EventKind::AssistantStreamingMessage,
    EventKind::AssistantThinkingMessage,
    EventKind::AssistantStreamingThinkingMessage,
    EventKind::AssistantStreamingToolCall,
    EventKind::ToolCall,
    EventKind::ToolResult,
    EventKind::EnvironmentInput,
    EventKind::PlanUpdate,
    EventKind::PlanFinish,
    EventKind::FinalAnswer,
    EventKind::FinalAnswerStreaming,
    EventKind::System,
];

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentRunStart => "agent_run_start",
            Self::AgentRunEnd => "agent_run_end",
            Self::UserMessage => "user_message",
            Self::AssistantMessage => "assistant_message",
            Self::AssistantStreamingMessage => "assistant_streaming_message",
            Self::AssistantThinkingMessage => "assistant_thinking_message",
            Self::AssistantStreamingThinkingMessage => "assistant_streaming_thinking_message",
            Self::AssistantStreamingToolCall => "assistant_streaming_tool_call",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::EnvironmentInput => "environment_input",
            Self::PlanUpdate => "plan_update",
            Self::PlanFinish => "plan_finish",
            Self::FinalAnswer => "final_answer",
            Self::FinalAnswerStreaming => "final_answer_streaming",
            Self::System => "system",
            Self::Other(name) => name,
        }
    }

    /// Transient fragment kinds, superseded by a terminal event with the
    /// settled content. Replay and export drop these.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::AssistantStreamingMessage
                | Self::AssistantStreamingThinkingMessage
                | Self::AssistantStreamingToolCall
                | Self::FinalAnswerStreaming
        )
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::AgentRunStart | Self::AgentRunEnd)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "agent_run_start" => Self::AgentRunStart,
            "agent_run_end" => Self::AgentRunEnd,
            "user_message" => Self::UserMessage,
            "assistant_message" => Self::AssistantMessage,
            "assistant_streaming_message" => Self::AssistantStreamingMessage,
            "assistant_thinking_message" => Self::AssistantThinkingMessage,
            "assistant_streaming_thinking_message" => Self::AssistantStreamingThinkingMessage,
            "assistant_streaming_tool_call" => Self::AssistantStreamingToolCall,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "environment_input" => Self::EnvironmentInput,
            "plan_update" => Self::PlanUpdate,
            "plan_finish" => Self::PlanFinish,
            "final_answer" => Self::FinalAnswer,
            "final_answer_streaming" => Self::FinalAnswerStreaming,
            "system" => Self::System,
            _ => Self::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_owned()))
    }
}

/// One immutable record in a session's event log.
///
/// The envelope carries no session affinity; the caller routes `(session_id,
/// event)` pairs. The payload shape depends on `kind`, see [`EventPayload`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Epoch milliseconds. Non-decreasing per session under normal operation,
    /// but not strictly increasing; concurrent producers may collide.
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
}

impl SessionEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self::with_timestamp(kind, payload, now_ms())
    }

    pub fn with_timestamp(kind: EventKind, payload: Value, timestamp: i64) -> Self {
        Self {
            id: EventId::new(),
            kind,
            timestamp,
            payload,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(
            EventKind::UserMessage,
            serde_json::json!({ "content": text.into() }),
        )
    }

    pub fn system(level: SystemLevel, message: impl Into<String>) -> Self {
        Self::new(
            EventKind::System,
            serde_json::json!({ "level": level.as_str(), "message": message.into() }),
        )
    }

    /// Parses the payload into the typed shape for this event's kind.
    ///
    /// Kinds without a fixed payload schema (`assistant_streaming_tool_call`
    /// and anything unrecognized) come back as [`EventPayload::Other`] with
    /// the raw value.
    pub fn typed_payload(&self) -> Result<EventPayload, serde_json::Error> {
        let payload = self.payload.clone();
        Ok(match &self.kind {
            EventKind::AgentRunStart => EventPayload::RunStart(serde_json::from_value(payload)?),
            EventKind::AgentRunEnd => EventPayload::RunEnd(serde_json::from_value(payload)?),
            EventKind::UserMessage => EventPayload::UserMessage(serde_json::from_value(payload)?),
            EventKind::AssistantMessage => {
                EventPayload::AssistantMessage(serde_json::from_value(payload)?)
            }
            EventKind::AssistantStreamingMessage => {
                EventPayload::StreamingMessage(serde_json::from_value(payload)?)
            }
            EventKind::AssistantThinkingMessage
            | EventKind::AssistantStreamingThinkingMessage => {
                EventPayload::Thinking(serde_json::from_value(payload)?)
            }
            EventKind::ToolCall => EventPayload::ToolCall(serde_json::from_value(payload)?),
            EventKind::ToolResult => EventPayload::ToolResult(serde_json::from_value(payload)?),
            EventKind::EnvironmentInput => {
                EventPayload::EnvironmentInput(serde_json::from_value(payload)?)
            }
            EventKind::PlanUpdate => EventPayload::PlanUpdate(serde_json::from_value(payload)?),
            EventKind::PlanFinish => EventPayload::PlanFinish(serde_json::from_value(payload)?),
            EventKind::FinalAnswer | EventKind::FinalAnswerStreaming => {
                EventPayload::FinalAnswer(serde_json::from_value(payload)?)
            }
            EventKind::System => EventPayload::System(serde_json::from_value(payload)?),
            EventKind::AssistantStreamingToolCall | EventKind::Other(_) => {
                EventPayload::Other(payload)
            }
        })
    }
}

/// Typed view over [`SessionEvent::payload`], keyed by [`EventKind`].
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    RunStart(RunStartPayload),
    RunEnd(RunEndPayload),
    UserMessage(UserMessagePayload),
    AssistantMessage(AssistantMessagePayload),
    StreamingMessage(StreamingMessagePayload),
    Thinking(ThinkingPayload),
    ToolCall(ToolCallPayload),
    ToolResult(ToolResultPayload),
    EnvironmentInput(EnvironmentInputPayload),
    PlanUpdate(PlanUpdatePayload),
    PlanFinish(PlanFinishPayload),
    FinalAnswer(FinalAnswerPayload),
    System(SystemPayload),
    Other(Value),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStartPayload {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_options: Option<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Error,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEndPayload {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessagePayload {
    pub content: MessageContent,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessagePayload {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttlt_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingMessagePayload {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub is_complete: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingPayload {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub is_complete: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    pub tool_call_id: ToolCallId,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub tool_call_id: ToolCallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInputPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub content: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanUpdatePayload {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFinishPayload {
    #[serde(default)]
    pub summary: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalAnswerPayload {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub is_complete: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl SystemLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SystemLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPayload {
    #[serde(default)]
    pub level: SystemLevel,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}
