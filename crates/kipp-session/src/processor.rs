//! Folds session events into renderable state.
//!
//! The processor owns one [`SessionState`] per session (messages, processing
//! flag, plan, pending tool calls, group cache) plus two pieces of
//! cross-session UI state: the foreground session pointer and the single
//! panel slot. Every session's state is kept current as events arrive; only
//! panel updates are gated on the session being foreground.
//!
//! Events can arrive one at a time ([`SessionProcessor::process_event`]) or
//! as a stored batch ([`SessionProcessor::process_batch`]). Batch ingestion
//! coalesces consecutive streaming fragments before dispatch but produces
//! the same final state as feeding the fragments individually.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use kipp_core::events::{
    AssistantMessagePayload, EnvironmentInputPayload, FinalAnswerPayload, PlanFinishPayload,
    PlanStep, PlanUpdatePayload, RunEndPayload, RunStartPayload, StreamingMessagePayload,
    SystemLevel, SystemPayload, ThinkingPayload, ToolCallPayload, ToolResultPayload,
    UserMessagePayload,
};
use kipp_core::{
    EventKind, EventPayload, Message, MessageContent, MessageGroup, Role, SessionEvent, SessionId,
    ToolCallId,
};

use crate::grouping::GroupCache;

/// How a stream of events is being consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestMode {
    /// Events arriving as they happen. Streaming fragments are applied.
    Live,
    /// Historical events replayed from storage. Streaming fragments are
    /// skipped; the terminal events carry the full content.
    Replay,
}

/// Current plan snapshot for a session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanState {
    pub steps: Vec<PlanStep>,
    pub finished: bool,
    pub summary: Option<String>,
}

/// What the foreground panel is showing.
#[derive(Clone, Debug, PartialEq)]
pub enum PanelContent {
    Image { url: String, caption: Option<String> },
    Plan(PlanState),
}

/// A handler rejected an event. The dispatcher logs these and moves on;
/// one undecodable event never stalls the stream.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct SessionState {
    messages: Vec<Message>,
    processing: bool,
    plan: Option<PlanState>,
    pending_tool_calls: HashSet<ToolCallId>,
    groups: GroupCache,
}

impl SessionState {
    /// Upsert identity: `message_id` when the payload carries one, the
    /// envelope event id otherwise. Latest match wins.
    fn find_message(&self, message_id: Option<&str>, event_id: &str) -> Option<usize> {
        match message_id {
            Some(mid) => self
                .messages
                .iter()
                .rposition(|m| m.message_id.as_deref() == Some(mid)),
            None => self.messages.iter().rposition(|m| m.id == event_id),
        }
    }

    /// Target for a streaming fragment: the message with the fragment's
    /// `message_id`, or the most recent still-streaming assistant message
    /// when the fragment carries none.
    fn find_streaming_target(&self, message_id: Option<&str>) -> Option<usize> {
        match message_id {
            Some(mid) => self
                .messages
                .iter()
                .rposition(|m| m.message_id.as_deref() == Some(mid)),
            None => self
                .messages
                .iter()
                .rposition(|m| m.role == Role::Assistant && m.is_streaming),
        }
    }
}

/// Session-scoped event fold with a foreground pointer and one panel slot.
#[derive(Debug, Default)]
pub struct SessionProcessor {
    sessions: HashMap<SessionId, SessionState>,
    active_session: Option<SessionId>,
    panel: Option<PanelContent>,
}

impl SessionProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one event to the session it belongs to.
    ///
    /// Handler failures are logged and swallowed so the rest of the stream
    /// still applies.
    pub fn process_event(&mut self, session_id: &SessionId, event: &SessionEvent, mode: IngestMode) {
        if mode == IngestMode::Replay && event.kind.is_streaming() {
            return;
        }
        if let Err(err) = self.dispatch(session_id, event) {
            warn!(
                session_id = %session_id,
                kind = %event.kind,
                error = %err,
                "event handler failed"
            );
        }
    }

    /// Applies a stored batch in order.
    ///
    /// In live mode, runs of consecutive `assistant_streaming_message`
    /// fragments that share a `message_id` are merged into one fragment
    /// first. The merge never crosses a completed fragment, so the result
    /// matches one-at-a-time ingestion exactly.
    pub fn process_batch(
        &mut self,
        session_id: &SessionId,
        events: &[SessionEvent],
        mode: IngestMode,
    ) {
        match mode {
            IngestMode::Replay => {
                for event in events {
                    self.process_event(session_id, event, mode);
                }
            }
            IngestMode::Live => {
                let coalesced = coalesce_streaming_runs(events);
                for event in &coalesced {
                    self.process_event(session_id, event, mode);
                }
            }
        }
    }

    /// Messages for a session, empty for sessions never seen.
    pub fn messages(&self, session_id: &SessionId) -> &[Message] {
        self.sessions
            .get(session_id)
            .map(|s| s.messages.as_slice())
            .unwrap_or_default()
    }

    /// Rendering groups for a session, recomputed only when its messages
    /// changed since the last call.
    pub fn groups(&mut self, session_id: &SessionId) -> &[MessageGroup] {
        match self.sessions.get_mut(session_id) {
            Some(state) => state.groups.get_or_compute(&state.messages),
            None => &[],
        }
    }

    pub fn is_processing(&self, session_id: &SessionId) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.processing)
            .unwrap_or(false)
    }

    pub fn plan(&self, session_id: &SessionId) -> Option<&PlanState> {
        self.sessions.get(session_id)?.plan.as_ref()
    }

    /// Tool calls started but not yet resolved, in no particular order.
    pub fn pending_tool_calls(&self, session_id: &SessionId) -> Vec<ToolCallId> {
        self.sessions
            .get(session_id)
            .map(|s| s.pending_tool_calls.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_session(&self) -> Option<&SessionId> {
        self.active_session.as_ref()
    }

    /// Moves the foreground pointer. Switching sessions clears the panel;
    /// the new foreground repopulates it from its own events.
    pub fn set_active_session(&mut self, session_id: Option<SessionId>) {
        if self.active_session != session_id {
            self.panel = None;
            self.active_session = session_id;
        }
    }

    pub fn panel(&self) -> Option<&PanelContent> {
        self.panel.as_ref()
    }

    /// Number of sessions with tracked state.
    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Drops all state for a session, including its group cache. Called
    /// when the session is deleted from storage.
    pub fn evict_session(&mut self, session_id: &SessionId) {
        self.sessions.remove(session_id);
        if self.active_session.as_ref() == Some(session_id) {
            self.active_session = None;
            self.panel = None;
        }
        debug!(session_id = %session_id, "session state evicted");
    }

    fn is_active(&self, session_id: &SessionId) -> bool {
        self.active_session.as_ref() == Some(session_id)
    }

    fn state_mut(&mut self, session_id: &SessionId) -> &mut SessionState {
        self.sessions.entry(session_id.clone()).or_default()
    }

    fn dispatch(&mut self, session_id: &SessionId, event: &SessionEvent) -> Result<(), HandlerError> {
        match event.typed_payload()? {
            EventPayload::RunStart(p) => self.handle_run_start(session_id, p),
            EventPayload::RunEnd(p) => self.handle_run_end(session_id, p),
            EventPayload::UserMessage(p) => self.handle_user_message(session_id, event, p),
            EventPayload::AssistantMessage(p) => {
                self.handle_assistant_message(session_id, event, p)
            }
            EventPayload::StreamingMessage(p) => {
                self.handle_streaming_message(session_id, event, p)
            }
            EventPayload::Thinking(p) => {
                let streaming = event.kind == EventKind::AssistantStreamingThinkingMessage;
                self.handle_thinking(session_id, event, p, streaming);
            }
            EventPayload::ToolCall(p) => self.handle_tool_call(session_id, p),
            EventPayload::ToolResult(p) => self.handle_tool_result(session_id, p),
            EventPayload::EnvironmentInput(p) => {
                self.handle_environment_input(session_id, event, p)
            }
            EventPayload::PlanUpdate(p) => self.handle_plan_update(session_id, p),
            EventPayload::PlanFinish(p) => self.handle_plan_finish(session_id, p),
            EventPayload::FinalAnswer(p) => {
                let streaming = event.kind == EventKind::FinalAnswerStreaming;
                self.handle_final_answer(session_id, event, p, streaming);
            }
            EventPayload::System(p) => self.handle_system(session_id, event, p),
            EventPayload::Other(_) => {
                debug!(
                    session_id = %session_id,
                    kind = %event.kind,
                    "no state handler for event kind"
                );
            }
        }
        Ok(())
    }

    fn handle_run_start(&mut self, session_id: &SessionId, payload: RunStartPayload) {
        if payload.session_id != *session_id {
            debug!(
                envelope = %session_id,
                payload = %payload.session_id,
                "run start payload names a different session"
            );
        }
        debug!(session_id = %session_id, "agent run started");
        self.state_mut(session_id).processing = true;
    }

    fn handle_run_end(&mut self, session_id: &SessionId, payload: RunEndPayload) {
        debug!(
            session_id = %session_id,
            status = %payload.status,
            elapsed_ms = ?payload.elapsed_ms,
            "agent run finished"
        );
        self.state_mut(session_id).processing = false;
    }

    fn handle_user_message(
        &mut self,
        session_id: &SessionId,
        event: &SessionEvent,
        payload: UserMessagePayload,
    ) {
        let panel = if self.is_active(session_id) {
            payload.content.first_image().map(|image| PanelContent::Image {
                url: image.url.clone(),
                caption: None,
            })
        } else {
            None
        };
        let state = self.state_mut(session_id);
        state
            .messages
            .push(Message::user(event.id.as_str(), payload.content, event.timestamp));
        if let Some(panel) = panel {
            self.panel = Some(panel);
        }
    }

    fn handle_assistant_message(
        &mut self,
        session_id: &SessionId,
        event: &SessionEvent,
        payload: AssistantMessagePayload,
    ) {
        let active = self.is_active(session_id);
        let state = self.state_mut(session_id);

        let idx = match state.find_message(payload.message_id.as_deref(), event.id.as_str()) {
            Some(idx) => idx,
            None => {
                state
                    .messages
                    .push(Message::assistant_placeholder(event.id.as_str(), event.timestamp));
                state.messages.len() - 1
            }
        };

        let message = &mut state.messages[idx];
        message.content = MessageContent::Text(payload.content);
        message.is_streaming = false;
        if payload.message_id.is_some() {
            message.message_id = payload.message_id.clone();
        }
        if payload.tool_calls.is_some() {
            message.tool_calls = payload.tool_calls;
        }
        if payload.finish_reason.is_some() {
            message.finish_reason = payload.finish_reason.clone();
        }
        if payload.ttft_ms.is_some() {
            message.ttft_ms = payload.ttft_ms;
        }
        if payload.ttlt_ms.is_some() {
            message.ttlt_ms = payload.ttlt_ms;
        }

        // A turn that did not stop to call tools is finished: surface the
        // most recent environment image and drop the processing flag.
        let turn_finished = payload.finish_reason.as_deref() != Some("tool_calls");
        if turn_finished {
            state.processing = false;
            if active {
                let panel = state
                    .messages
                    .iter()
                    .rev()
                    .filter(|m| m.role == Role::Environment)
                    .find_map(|m| {
                        m.content.first_image().map(|image| PanelContent::Image {
                            url: image.url.clone(),
                            caption: m.description.clone(),
                        })
                    });
                if let Some(panel) = panel {
                    self.panel = Some(panel);
                }
            }
        }
    }

    fn handle_streaming_message(
        &mut self,
        session_id: &SessionId,
        event: &SessionEvent,
        payload: StreamingMessagePayload,
    ) {
        let state = self.state_mut(session_id);
        match state.find_streaming_target(payload.message_id.as_deref()) {
            Some(idx) => {
                let message = &mut state.messages[idx];
                message.content.append_text(&payload.content);
                message.is_streaming = !payload.is_complete;
            }
            None => {
                let mut message =
                    Message::assistant_placeholder(event.id.as_str(), event.timestamp);
                message.message_id = payload.message_id;
                message.content = MessageContent::Text(payload.content);
                message.is_streaming = !payload.is_complete;
                state.messages.push(message);
            }
        }
        if payload.is_complete {
            state.processing = false;
        }
    }

    fn handle_thinking(
        &mut self,
        session_id: &SessionId,
        event: &SessionEvent,
        payload: ThinkingPayload,
        streaming: bool,
    ) {
        let state = self.state_mut(session_id);
        let found = match payload.message_id.as_deref() {
            Some(mid) => state
                .messages
                .iter()
                .rposition(|m| m.message_id.as_deref() == Some(mid)),
            None => state.messages.iter().rposition(|m| m.role == Role::Assistant),
        };
        let idx = match found {
            Some(idx) => idx,
            None => {
                let mut message =
                    Message::assistant_placeholder(event.id.as_str(), event.timestamp);
                message.message_id = payload.message_id.clone();
                state.messages.push(message);
                state.messages.len() - 1
            }
        };
        let message = &mut state.messages[idx];
        if streaming {
            message
                .thinking
                .get_or_insert_with(String::new)
                .push_str(&payload.content);
        } else {
            message.thinking = Some(payload.content);
        }
    }

    fn handle_tool_call(&mut self, session_id: &SessionId, payload: ToolCallPayload) {
        debug!(
            session_id = %session_id,
            tool_call_id = %payload.tool_call_id,
            tool = %payload.name,
            "tool call started"
        );
        let state = self.state_mut(session_id);
        if !state.pending_tool_calls.insert(payload.tool_call_id.clone()) {
            warn!(
                session_id = %session_id,
                tool_call_id = %payload.tool_call_id,
                "tool call id already pending"
            );
        }
    }

    fn handle_tool_result(&mut self, session_id: &SessionId, payload: ToolResultPayload) {
        let state = self.state_mut(session_id);
        if !state.pending_tool_calls.remove(&payload.tool_call_id) {
            debug!(
                session_id = %session_id,
                tool_call_id = %payload.tool_call_id,
                "tool result without a pending call, ignored"
            );
        }
    }

    fn handle_environment_input(
        &mut self,
        session_id: &SessionId,
        event: &SessionEvent,
        payload: EnvironmentInputPayload,
    ) {
        let state = self.state_mut(session_id);
        state.messages.push(Message::environment(
            event.id.as_str(),
            payload.description,
            payload.content,
            event.timestamp,
        ));
    }

    fn handle_plan_update(&mut self, session_id: &SessionId, payload: PlanUpdatePayload) {
        let active = self.is_active(session_id);
        let plan = PlanState {
            steps: payload.steps,
            finished: false,
            summary: None,
        };
        let state = self.state_mut(session_id);
        state.plan = Some(plan.clone());
        if active {
            self.panel = Some(PanelContent::Plan(plan));
        }
    }

    fn handle_plan_finish(&mut self, session_id: &SessionId, payload: PlanFinishPayload) {
        let active = self.is_active(session_id);
        let state = self.state_mut(session_id);
        let plan = state.plan.get_or_insert_with(PlanState::default);
        plan.finished = true;
        plan.summary = Some(payload.summary);
        let snapshot = plan.clone();
        if active {
            self.panel = Some(PanelContent::Plan(snapshot));
        }
    }

    fn handle_final_answer(
        &mut self,
        session_id: &SessionId,
        event: &SessionEvent,
        payload: FinalAnswerPayload,
        streaming: bool,
    ) {
        let state = self.state_mut(session_id);
        if streaming {
            match state.find_streaming_target(payload.message_id.as_deref()) {
                Some(idx) => {
                    let message = &mut state.messages[idx];
                    message.content.append_text(&payload.content);
                    message.is_streaming = !payload.is_complete;
                    if payload.title.is_some() {
                        message.description = payload.title;
                    }
                }
                None => {
                    let mut message =
                        Message::assistant_placeholder(event.id.as_str(), event.timestamp);
                    message.message_id = payload.message_id;
                    message.content = MessageContent::Text(payload.content);
                    message.is_streaming = !payload.is_complete;
                    message.description = payload.title;
                    state.messages.push(message);
                }
            }
            if payload.is_complete {
                state.processing = false;
            }
        } else {
            let idx = match state.find_message(payload.message_id.as_deref(), event.id.as_str()) {
                Some(idx) => idx,
                None => {
                    state
                        .messages
                        .push(Message::assistant_placeholder(event.id.as_str(), event.timestamp));
                    state.messages.len() - 1
                }
            };
            let message = &mut state.messages[idx];
            message.content = MessageContent::Text(payload.content);
            message.is_streaming = false;
            if payload.message_id.is_some() {
                message.message_id = payload.message_id;
            }
            if payload.title.is_some() {
                message.description = payload.title;
            }
            state.processing = false;
        }
    }

    fn handle_system(&mut self, session_id: &SessionId, event: &SessionEvent, payload: SystemPayload) {
        match payload.level {
            SystemLevel::Debug => debug!(
                session_id = %session_id,
                details = ?payload.details,
                "{}", payload.message
            ),
            SystemLevel::Info => info!(
                session_id = %session_id,
                details = ?payload.details,
                "{}", payload.message
            ),
            SystemLevel::Warning => warn!(
                session_id = %session_id,
                details = ?payload.details,
                "{}", payload.message
            ),
            SystemLevel::Error => error!(
                session_id = %session_id,
                details = ?payload.details,
                "{}", payload.message
            ),
        }
        let state = self.state_mut(session_id);
        state
            .messages
            .push(Message::system(event.id.as_str(), payload.message, event.timestamp));
    }
}

/// Merges runs of consecutive `assistant_streaming_message` fragments that
/// share a `message_id` into a single fragment. A completed fragment ends
/// its run: the fragment after it starts a new message in one-at-a-time
/// ingestion, so it must stay a separate unit here too. Fragments whose
/// payload does not decode stay separate as well; dispatch drops them with
/// a warning, exactly as it would one at a time.
fn coalesce_streaming_runs(events: &[SessionEvent]) -> Vec<SessionEvent> {
    let mut out: Vec<SessionEvent> = Vec::with_capacity(events.len());
    for event in events {
        if event.kind == EventKind::AssistantStreamingMessage {
            if let Some(prev) = out.last_mut() {
                if can_merge_fragments(prev, event) {
                    merge_fragment(prev, event);
                    continue;
                }
            }
        }
        out.push(event.clone());
    }
    out
}

fn can_merge_fragments(prev: &SessionEvent, next: &SessionEvent) -> bool {
    if prev.kind != EventKind::AssistantStreamingMessage {
        return false;
    }
    let (Some(prev), Some(next)) = (decode_fragment(prev), decode_fragment(next)) else {
        return false;
    };
    prev.message_id == next.message_id && !prev.is_complete
}

/// `Some` only when the payload would survive [`SessionEvent::typed_payload`]
/// in the one-at-a-time path.
fn decode_fragment(event: &SessionEvent) -> Option<StreamingMessagePayload> {
    serde_json::from_value(event.payload.clone()).ok()
}

fn merge_fragment(prev: &mut SessionEvent, next: &SessionEvent) {
    let fragment = next
        .payload
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let complete = next
        .payload
        .get("isComplete")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let Some(fields) = prev.payload.as_object_mut() else {
        return;
    };
    let content = fields
        .entry("content")
        .or_insert_with(|| Value::String(String::new()));
    if let Value::String(text) = content {
        text.push_str(&fragment);
    }
    fields.insert("isComplete".to_owned(), Value::Bool(complete));
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use kipp_core::EventId;

    use super::*;

    fn sid(raw: &str) -> SessionId {
        SessionId::from_raw(raw)
    }

    fn ev(kind: EventKind, payload: Value) -> SessionEvent {
        SessionEvent::new(kind, payload)
    }

    fn fragment(message_id: &str, content: &str, complete: bool) -> SessionEvent {
        ev(
            EventKind::AssistantStreamingMessage,
            json!({"messageId": message_id, "content": content, "isComplete": complete}),
        )
    }

    #[test]
    fn run_lifecycle_toggles_processing() {
        let mut processor = SessionProcessor::new();
        let a = sid("sess_a");
        let b = sid("sess_b");

        processor.process_event(
            &a,
            &ev(EventKind::AgentRunStart, json!({"sessionId": "sess_a"})),
            IngestMode::Live,
        );
        assert!(processor.is_processing(&a));
        assert!(!processor.is_processing(&b));

        processor.process_event(
            &a,
            &ev(EventKind::AgentRunEnd, json!({"status": "completed", "elapsedMs": 1200})),
            IngestMode::Live,
        );
        assert!(!processor.is_processing(&a));
    }

    #[test]
    fn user_message_appends() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(EventKind::UserMessage, json!({"content": "find the report"})),
            IngestMode::Live,
        );

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content.plain_text(), "find the report");
    }

    #[test]
    fn streaming_fragments_accumulate_into_one_message() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(&id, &fragment("m1", "Hel", false), IngestMode::Live);
        processor.process_event(&id, &fragment("m1", "lo", false), IngestMode::Live);
        processor.process_event(&id, &fragment("m1", "", true), IngestMode::Live);

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.plain_text(), "Hello");
        assert!(!messages[0].is_streaming);
        assert!(!processor.is_processing(&id));
    }

    #[test]
    fn fragments_without_message_id_use_streaming_fallback() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(EventKind::AssistantStreamingMessage, json!({"content": "one "})),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(EventKind::AssistantStreamingMessage, json!({"content": "stream"})),
            IngestMode::Live,
        );

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.plain_text(), "one stream");
        assert!(messages[0].is_streaming);
    }

    #[test]
    fn fragment_after_completion_starts_a_new_message() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantStreamingMessage,
                json!({"content": "done", "isComplete": true}),
            ),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(EventKind::AssistantStreamingMessage, json!({"content": "next"})),
            IngestMode::Live,
        );

        assert_eq!(processor.messages(&id).len(), 2);
    }

    #[test]
    fn assistant_events_with_same_message_id_collapse() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantMessage,
                json!({"messageId": "m1", "content": "draft", "finishReason": "tool_calls"}),
            ),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantMessage,
                json!({"messageId": "m1", "content": "final", "finishReason": "stop"}),
            ),
            IngestMode::Live,
        );

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.plain_text(), "final");
        assert_eq!(messages[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn replaying_the_same_event_is_idempotent() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");
        let event = ev(EventKind::AssistantMessage, json!({"content": "answer"}));

        processor.process_event(&id, &event, IngestMode::Live);
        processor.process_event(&id, &event, IngestMode::Live);

        // No messageId, so identity falls back to the envelope event id.
        assert_eq!(processor.messages(&id).len(), 1);
    }

    #[test]
    fn assistant_message_merges_into_thinking_placeholder() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantStreamingThinkingMessage,
                json!({"messageId": "m1", "content": "weighing options"}),
            ),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantMessage,
                json!({"messageId": "m1", "content": "the answer"}),
            ),
            IngestMode::Live,
        );

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].thinking.as_deref(), Some("weighing options"));
        assert_eq!(messages[0].content.plain_text(), "the answer");
    }

    #[test]
    fn streaming_thinking_appends_and_final_replaces() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantStreamingThinkingMessage,
                json!({"messageId": "m1", "content": "first "}),
            ),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantStreamingThinkingMessage,
                json!({"messageId": "m1", "content": "pass"}),
            ),
            IngestMode::Live,
        );
        assert_eq!(
            processor.messages(&id)[0].thinking.as_deref(),
            Some("first pass")
        );

        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantThinkingMessage,
                json!({"messageId": "m1", "content": "settled reasoning", "isComplete": true}),
            ),
            IngestMode::Live,
        );
        assert_eq!(
            processor.messages(&id)[0].thinking.as_deref(),
            Some("settled reasoning")
        );
    }

    #[test]
    fn tool_calls_are_tracked_until_resolved() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(
                EventKind::ToolCall,
                json!({"toolCallId": "call_1", "name": "browser.navigate", "arguments": {"url": "https://example.com"}}),
            ),
            IngestMode::Live,
        );
        assert_eq!(processor.pending_tool_calls(&id).len(), 1);

        processor.process_event(
            &id,
            &ev(
                EventKind::ToolResult,
                json!({"toolCallId": "call_1", "content": {"ok": true}}),
            ),
            IngestMode::Live,
        );
        assert!(processor.pending_tool_calls(&id).is_empty());
    }

    #[test]
    fn unmatched_tool_result_is_ignored() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(EventKind::UserMessage, json!({"content": "hi"})),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(EventKind::ToolResult, json!({"toolCallId": "call_ghost", "content": "late"})),
            IngestMode::Live,
        );

        assert_eq!(processor.messages(&id).len(), 1);
        assert!(processor.pending_tool_calls(&id).is_empty());
    }

    #[test]
    fn malformed_event_does_not_stall_the_stream() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        // toolCallId is required, so this payload fails to decode.
        processor.process_event(
            &id,
            &ev(EventKind::ToolCall, json!({"name": "browser.navigate"})),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(EventKind::UserMessage, json!({"content": "still here"})),
            IngestMode::Live,
        );

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.plain_text(), "still here");
    }

    #[test]
    fn unknown_kinds_leave_state_untouched() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(
                EventKind::Other("agent_heartbeat".to_owned()),
                json!({"uptimeMs": 5000}),
            ),
            IngestMode::Live,
        );

        assert!(processor.messages(&id).is_empty());
        assert!(!processor.is_processing(&id));
    }

    #[test]
    fn user_image_fills_panel_for_active_session() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");
        processor.set_active_session(Some(id.clone()));

        processor.process_event(
            &id,
            &ev(
                EventKind::UserMessage,
                json!({"content": [
                    {"type": "text", "text": "what is in this picture?"},
                    {"type": "image_url", "image_url": {"url": "https://cdn.test/upload.png"}}
                ]}),
            ),
            IngestMode::Live,
        );

        assert_eq!(
            processor.panel(),
            Some(&PanelContent::Image {
                url: "https://cdn.test/upload.png".to_owned(),
                caption: None
            })
        );
    }

    #[test]
    fn background_session_never_touches_panel() {
        let mut processor = SessionProcessor::new();
        let foreground = sid("sess_fg");
        let background = sid("sess_bg");
        processor.set_active_session(Some(foreground));

        processor.process_event(
            &background,
            &ev(
                EventKind::UserMessage,
                json!({"content": [
                    {"type": "image_url", "image_url": {"url": "https://cdn.test/other.png"}}
                ]}),
            ),
            IngestMode::Live,
        );

        assert!(processor.panel().is_none());
        // State for the background session still advanced.
        assert_eq!(processor.messages(&background).len(), 1);
    }

    #[test]
    fn finished_turn_surfaces_latest_environment_image() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");
        processor.set_active_session(Some(id.clone()));

        processor.process_event(
            &id,
            &ev(
                EventKind::EnvironmentInput,
                json!({
                    "description": "Browser screenshot",
                    "content": [
                        {"type": "image_url", "image_url": {"url": "https://cdn.test/page.png"}}
                    ]
                }),
            ),
            IngestMode::Live,
        );
        assert!(processor.panel().is_none());

        // Still calling tools: panel stays empty.
        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantMessage,
                json!({"messageId": "m1", "content": "", "finishReason": "tool_calls"}),
            ),
            IngestMode::Live,
        );
        assert!(processor.panel().is_none());

        processor.process_event(
            &id,
            &ev(
                EventKind::AssistantMessage,
                json!({"messageId": "m1", "content": "done", "finishReason": "stop"}),
            ),
            IngestMode::Live,
        );
        assert_eq!(
            processor.panel(),
            Some(&PanelContent::Image {
                url: "https://cdn.test/page.png".to_owned(),
                caption: Some("Browser screenshot".to_owned())
            })
        );
    }

    #[test]
    fn plan_events_track_progress_and_fill_panel() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");
        processor.set_active_session(Some(id.clone()));

        processor.process_event(
            &id,
            &ev(
                EventKind::PlanUpdate,
                json!({"steps": [
                    {"content": "open the site", "done": true},
                    {"content": "extract prices", "done": false}
                ]}),
            ),
            IngestMode::Live,
        );

        let plan = processor.plan(&id).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps[0].done);
        assert!(!plan.finished);
        assert!(matches!(processor.panel(), Some(PanelContent::Plan(_))));

        processor.process_event(
            &id,
            &ev(EventKind::PlanFinish, json!({"summary": "prices collected"})),
            IngestMode::Live,
        );
        let plan = processor.plan(&id).unwrap();
        assert!(plan.finished);
        assert_eq!(plan.summary.as_deref(), Some("prices collected"));
    }

    #[test]
    fn system_events_append_messages() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(
                EventKind::System,
                json!({"level": "warning", "message": "model fallback engaged"}),
            ),
            IngestMode::Live,
        );

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content.plain_text(), "model fallback engaged");
    }

    #[test]
    fn final_answer_builds_report_message() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(EventKind::AgentRunStart, json!({"sessionId": "sess_a"})),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(
                EventKind::FinalAnswer,
                json!({"messageId": "r1", "title": "Research Report", "content": "full findings"}),
            ),
            IngestMode::Live,
        );

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].description.as_deref(), Some("Research Report"));
        assert_eq!(messages[0].content.plain_text(), "full findings");
        assert!(!processor.is_processing(&id));
    }

    #[test]
    fn streaming_final_answer_accumulates() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(
                EventKind::FinalAnswerStreaming,
                json!({"messageId": "r1", "content": "part one, "}),
            ),
            IngestMode::Live,
        );
        processor.process_event(
            &id,
            &ev(
                EventKind::FinalAnswerStreaming,
                json!({"messageId": "r1", "content": "part two", "isComplete": true}),
            ),
            IngestMode::Live,
        );

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.plain_text(), "part one, part two");
        assert!(!messages[0].is_streaming);
    }

    #[test]
    fn replay_skips_streaming_fragments() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");
        let events = vec![
            fragment("m1", "Hel", false),
            fragment("m1", "lo", false),
            fragment("m1", "", true),
            ev(
                EventKind::AssistantMessage,
                json!({"messageId": "m1", "content": "Hello", "finishReason": "stop"}),
            ),
        ];

        processor.process_batch(&id, &events, IngestMode::Replay);

        let messages = processor.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.plain_text(), "Hello");
        assert!(!messages[0].is_streaming);
    }

    #[test]
    fn batch_matches_incremental_ingestion() {
        let id = sid("sess_a");
        let events = vec![
            ev(EventKind::AgentRunStart, json!({"sessionId": "sess_a"})),
            ev(EventKind::UserMessage, json!({"content": "compare prices"})),
            ev(
                EventKind::ToolCall,
                json!({"toolCallId": "call_1", "name": "browser.navigate", "arguments": {}}),
            ),
            ev(EventKind::ToolResult, json!({"toolCallId": "call_1", "content": "ok"})),
            fragment("m1", "The ", false),
            fragment("m1", "cheapest ", false),
            fragment("m1", "option", true),
            ev(
                EventKind::AssistantMessage,
                json!({"messageId": "m1", "content": "The cheapest option", "finishReason": "stop"}),
            ),
            ev(EventKind::AgentRunEnd, json!({"status": "completed"})),
        ];

        let mut incremental = SessionProcessor::new();
        for event in &events {
            incremental.process_event(&id, event, IngestMode::Live);
        }

        let mut batched = SessionProcessor::new();
        batched.process_batch(&id, &events, IngestMode::Live);

        assert_eq!(incremental.messages(&id), batched.messages(&id));
        assert_eq!(incremental.is_processing(&id), batched.is_processing(&id));
        assert_eq!(
            incremental.pending_tool_calls(&id).len(),
            batched.pending_tool_calls(&id).len()
        );
    }

    #[test]
    fn coalescing_respects_completion_boundaries() {
        let id = sid("sess_a");
        // A completed fragment mid-run must not be merged over, or the batch
        // result drifts from one-at-a-time ingestion.
        let events = vec![
            fragment("m1", "first", false),
            fragment("m1", " run", true),
            fragment("m1", "second run", false),
        ];

        let mut incremental = SessionProcessor::new();
        for event in &events {
            incremental.process_event(&id, event, IngestMode::Live);
        }
        let mut batched = SessionProcessor::new();
        batched.process_batch(&id, &events, IngestMode::Live);

        assert_eq!(incremental.messages(&id), batched.messages(&id));
    }

    #[test]
    fn coalescing_keeps_distinct_message_ids_apart() {
        let events = vec![
            fragment("m1", "alpha", false),
            fragment("m2", "beta", false),
            fragment("m2", " gamma", false),
        ];
        let coalesced = coalesce_streaming_runs(&events);
        assert_eq!(coalesced.len(), 2);
        assert_eq!(coalesced[1].payload["content"], "beta gamma");
    }

    #[test]
    fn coalescing_skips_undecodable_fragments() {
        let id = sid("sess_a");
        // One-at-a-time ingestion drops the null-flag fragment at dispatch,
        // so the batch path must not fold it into its neighbours.
        let events = vec![
            fragment("m1", "Hel", false),
            ev(
                EventKind::AssistantStreamingMessage,
                json!({"messageId": "m1", "content": "lo", "isComplete": null}),
            ),
            fragment("m1", "lo", false),
        ];

        let mut incremental = SessionProcessor::new();
        for event in &events {
            incremental.process_event(&id, event, IngestMode::Live);
        }
        let mut batched = SessionProcessor::new();
        batched.process_batch(&id, &events, IngestMode::Live);

        assert_eq!(incremental.messages(&id), batched.messages(&id));
        let messages = batched.messages(&id);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.plain_text(), "Hello");
        assert!(messages[0].is_streaming);
    }

    #[test]
    fn switching_sessions_clears_panel() {
        let mut processor = SessionProcessor::new();
        let a = sid("sess_a");
        let b = sid("sess_b");
        processor.set_active_session(Some(a.clone()));

        processor.process_event(
            &a,
            &ev(
                EventKind::UserMessage,
                json!({"content": [
                    {"type": "image_url", "image_url": {"url": "https://cdn.test/a.png"}}
                ]}),
            ),
            IngestMode::Live,
        );
        assert!(processor.panel().is_some());

        processor.set_active_session(Some(b));
        assert!(processor.panel().is_none());
        assert_eq!(processor.active_session(), Some(&sid("sess_b")));
    }

    #[test]
    fn evicting_a_session_drops_all_state() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");
        processor.set_active_session(Some(id.clone()));

        processor.process_event(
            &id,
            &ev(
                EventKind::UserMessage,
                json!({"content": [
                    {"type": "image_url", "image_url": {"url": "https://cdn.test/a.png"}}
                ]}),
            ),
            IngestMode::Live,
        );
        assert_eq!(processor.tracked_sessions(), 1);

        processor.evict_session(&id);
        assert_eq!(processor.tracked_sessions(), 0);
        assert!(processor.messages(&id).is_empty());
        assert!(processor.panel().is_none());
        assert!(processor.active_session().is_none());
    }

    #[test]
    fn groups_follow_in_place_updates() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_a");

        processor.process_event(
            &id,
            &ev(EventKind::UserMessage, json!({"content": "hi"})),
            IngestMode::Live,
        );
        processor.process_event(&id, &fragment("m1", "Hel", false), IngestMode::Live);
        assert_eq!(processor.groups(&id).len(), 1);
        assert_eq!(
            processor.groups(&id)[0].messages()[1].content.plain_text(),
            "Hel"
        );

        processor.process_event(&id, &fragment("m1", "lo", true), IngestMode::Live);
        assert_eq!(
            processor.groups(&id)[0].messages()[1].content.plain_text(),
            "Hello"
        );
    }

    #[test]
    fn unseen_session_reads_are_empty() {
        let mut processor = SessionProcessor::new();
        let id = sid("sess_missing");

        assert!(processor.messages(&id).is_empty());
        assert!(processor.groups(&id).is_empty());
        assert!(processor.plan(&id).is_none());
        assert!(!processor.is_processing(&id));
    }

    #[test]
    fn event_ids_stay_stable_through_coalescing() {
        let first = fragment("m1", "a", false);
        let first_id: EventId = first.id.clone();
        let events = vec![first, fragment("m1", "b", false)];

        let coalesced = coalesce_streaming_runs(&events);
        assert_eq!(coalesced.len(), 1);
        assert_eq!(coalesced[0].id, first_id);
        assert_eq!(coalesced[0].payload["content"], "ab");
    }
}
