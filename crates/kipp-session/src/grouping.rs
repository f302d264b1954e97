//! Groups a flat message list into conversation cycles for rendering.
//!
//! A cycle is one user turn plus everything the agent produced in response.
//! Grouping is a pure function of the message list; [`GroupCache`] memoizes
//! it so repeated reads of an unchanged session stay cheap.

use kipp_core::{Message, MessageGroup, Role};

/// Splits messages into rendering groups.
///
/// Rules, applied in order:
/// - a user message always opens a new group
/// - a system message forms a singleton group of its own
/// - an assistant or environment message opens a new group only when its
///   `message_id` differs from the most recent assistant message already in
///   the current group (a new model turn inside the same user turn)
/// - everything else appends to the current group
pub fn group_messages(messages: &[Message]) -> Vec<MessageGroup> {
    let mut groups = Vec::new();
    let mut current: Vec<Message> = Vec::new();

    for message in messages {
        match message.role {
            Role::User => {
                if !current.is_empty() {
                    groups.push(MessageGroup::new(std::mem::take(&mut current)));
                }
                current.push(message.clone());
            }
            Role::System => {
                if !current.is_empty() {
                    groups.push(MessageGroup::new(std::mem::take(&mut current)));
                }
                groups.push(MessageGroup::new(vec![message.clone()]));
            }
            Role::Assistant | Role::Environment => {
                if starts_new_turn(&current, message) {
                    groups.push(MessageGroup::new(std::mem::take(&mut current)));
                }
                current.push(message.clone());
            }
        }
    }

    if !current.is_empty() {
        groups.push(MessageGroup::new(current));
    }
    groups
}

/// An assistant/environment message starts a new turn when it carries a
/// `message_id` and the current group's latest assistant message carries a
/// different one. Messages without a `message_id` never split; neither does
/// a group that has no assistant message yet.
fn starts_new_turn(current: &[Message], message: &Message) -> bool {
    if current.is_empty() {
        return false;
    }
    let Some(incoming) = message.message_id.as_deref() else {
        return false;
    };
    let Some(last_assistant) = current.iter().rev().find(|m| m.role == Role::Assistant) else {
        return false;
    };
    last_assistant.message_id.as_deref() != Some(incoming)
}

/// Memoized [`group_messages`] keyed on the full message list.
///
/// Invalidation compares every message, not just the list length or tail.
/// Streaming and upsert handlers mutate messages in place, so a sampled
/// check can hand back stale groups.
#[derive(Debug, Default)]
pub struct GroupCache {
    snapshot: Vec<Message>,
    groups: Vec<MessageGroup>,
    recomputes: u64,
}

impl GroupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the groups for `messages`, recomputing only when the list
    /// differs from the one the cache last saw.
    pub fn get_or_compute(&mut self, messages: &[Message]) -> &[MessageGroup] {
        if self.snapshot.as_slice() != messages {
            self.groups = group_messages(messages);
            self.snapshot = messages.to_vec();
            self.recomputes += 1;
        }
        &self.groups
    }

    /// How many times the cache has recomputed since creation.
    pub fn recomputes(&self) -> u64 {
        self.recomputes
    }
}
