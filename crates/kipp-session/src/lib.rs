//! Session state derivation: event folding, message grouping, and signal
//! fan-out for whatever is rendering the session.

pub mod bridge;
pub mod grouping;
pub mod processor;

pub use bridge::{translate, EventBridge, Signal, SignalChannel, SubscriberId};
pub use grouping::{group_messages, GroupCache};
pub use processor::{HandlerError, IngestMode, PanelContent, PlanState, SessionProcessor};
