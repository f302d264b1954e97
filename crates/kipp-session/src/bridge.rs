//! Fans session events out to UI-facing subscribers as named signals.
//!
//! The bridge sits between the event stream and anything that renders it.
//! [`translate`] maps each event kind onto one or more [`Signal`]s; the
//! bridge delivers them synchronously to every subscriber in registration
//! order. Unknown event kinds pass through verbatim on a [`SignalChannel::Raw`]
//! channel so new producers keep working against old consumers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use kipp_core::{EventKind, SessionEvent};

/// Named delivery channel for a translated signal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalChannel {
    /// Coarse agent state: running, idle, error, executing-tool:<name>.
    AgentStatus,
    Query,
    Answer,
    StreamingMessage,
    ToolCall,
    ToolResult,
    System,
    Error,
    Debug,
    /// Verbatim passthrough for event kinds without a translation.
    Raw(String),
}

impl SignalChannel {
    pub fn as_str(&self) -> &str {
        match self {
            Self::AgentStatus => "agent-status",
            Self::Query => "query",
            Self::Answer => "answer",
            Self::StreamingMessage => "streaming_message",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::System => "system",
            Self::Error => "error",
            Self::Debug => "debug",
            Self::Raw(name) => name,
        }
    }
}

impl From<String> for SignalChannel {
    fn from(value: String) -> Self {
        match value.as_str() {
            "agent-status" => Self::AgentStatus,
            "query" => Self::Query,
            "answer" => Self::Answer,
            "streaming_message" => Self::StreamingMessage,
            "tool_call" => Self::ToolCall,
            "tool_result" => Self::ToolResult,
            "system" => Self::System,
            "error" => Self::Error,
            "debug" => Self::Debug,
            _ => Self::Raw(value),
        }
    }
}

impl From<SignalChannel> for String {
    fn from(value: SignalChannel) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for SignalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One translated notification on its way to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub channel: SignalChannel,
    pub payload: Value,
}

impl Signal {
    pub fn new(channel: SignalChannel, payload: Value) -> Self {
        Self { channel, payload }
    }
}

/// Maps an event onto the signals it produces.
///
/// Most kinds forward their payload on a matching channel. Lifecycle and
/// tool events additionally produce an `agent-status` signal so status
/// consumers never have to understand the full event model. Kinds without
/// an entry pass through on [`SignalChannel::Raw`] under their own name.
pub fn translate(event: &SessionEvent) -> Vec<Signal> {
    match &event.kind {
        EventKind::AgentRunStart => {
            vec![Signal::new(SignalChannel::AgentStatus, json!({"status": "running"}))]
        }
        EventKind::AgentRunEnd => {
            let status = match event.payload.get("status").and_then(Value::as_str) {
                Some("error") => "error",
                _ => "idle",
            };
            vec![Signal::new(SignalChannel::AgentStatus, json!({"status": status}))]
        }
        EventKind::UserMessage => {
            vec![Signal::new(SignalChannel::Query, event.payload.clone())]
        }
        EventKind::AssistantMessage | EventKind::FinalAnswer => {
            vec![Signal::new(SignalChannel::Answer, event.payload.clone())]
        }
        EventKind::AssistantStreamingMessage | EventKind::FinalAnswerStreaming => {
            vec![Signal::new(SignalChannel::StreamingMessage, event.payload.clone())]
        }
        EventKind::ToolCall => {
            let name = event
                .payload
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            vec![
                Signal::new(SignalChannel::ToolCall, event.payload.clone()),
                Signal::new(
                    SignalChannel::AgentStatus,
                    json!({"status": format!("executing-tool:{name}")}),
                ),
            ]
        }
        EventKind::ToolResult => {
            vec![Signal::new(SignalChannel::ToolResult, event.payload.clone())]
        }
        EventKind::System => {
            let channel = match event.payload.get("level").and_then(Value::as_str) {
                Some("error") => SignalChannel::Error,
                Some("debug") => SignalChannel::Debug,
                _ => SignalChannel::System,
            };
            vec![Signal::new(channel, event.payload.clone())]
        }
        other => vec![Signal::new(
            SignalChannel::Raw(other.as_str().to_owned()),
            event.payload.clone(),
        )],
    }
}

/// Opaque handle for one bridge subscription.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct SubscriberId(String);

impl SubscriberId {
    fn new() -> Self {
        Self(format!("sub_{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type SignalHandler = dyn Fn(&Signal) + Send + Sync;

struct Subscriber {
    seq: u64,
    handler: Arc<SignalHandler>,
}

/// Synchronous fan-out of translated signals.
///
/// Subscribers are invoked in registration order on the emitting thread.
/// Handlers must be fast and must not block; slow consumers belong behind
/// their own channel. Clones share the subscriber table.
#[derive(Clone, Default)]
pub struct EventBridge {
    subscribers: Arc<DashMap<SubscriberId, Subscriber>>,
    next_seq: Arc<AtomicU64>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&Signal) + Send + Sync + 'static) -> SubscriberId {
        let id = SubscriberId::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                seq,
                handler: Arc::new(handler),
            },
        );
        debug!(subscriber_id = %id, "bridge subscriber added");
        id
    }

    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            debug!(subscriber_id = %id, "bridge subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Delivers a signal to every subscriber registered at the time of the
    /// call. The subscriber table is snapshotted first, so handlers may
    /// subscribe or unsubscribe while a dispatch is in flight; such changes
    /// take effect from the next emit.
    pub fn emit(&self, signal: &Signal) {
        let mut handlers: Vec<(u64, Arc<SignalHandler>)> = self
            .subscribers
            .iter()
            .map(|entry| (entry.value().seq, Arc::clone(&entry.value().handler)))
            .collect();
        handlers.sort_unstable_by_key(|(seq, _)| *seq);
        for (_, handler) in handlers {
            handler(signal);
        }
    }

    /// Translates an event and emits every resulting signal in order.
    pub fn forward(&self, event: &SessionEvent) {
        for signal in translate(event) {
            self.emit(&signal);
        }
    }

    /// Pumps a broadcast receiver into the bridge until the channel closes.
    pub fn connect_broadcast(
        &self,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => bridge.forward(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bridge fell behind the event broadcast");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("event broadcast closed, stopping bridge pump");
                        break;
                    }
                }
            }
        })
    }
}
