//! # Events synthesized by the bus itself.
//!
//! - [`CommandResultEvent`] / [`CommandErrorEvent`]: outcome of one command
//!   execution. Ordinary events (category `event`): they go through the same
//!   publish path and can be subscribed to.
//! - [`EventHandlerFailed`], [`EventsDropped`], [`ForcedTermination`]:
//!   internal diagnostics (category `diagnostic`), written to the log only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::envelope::{Category, EventPayload};

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handler returned an error.
    Failed,
    /// Handler panicked.
    Panicked,
    /// Execution was cancelled (caller, shutdown, or dropped future).
    Cancelled,
}

/// Structured error description carried by failure records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescription {
    pub kind: ErrorKind,
    pub message: String,
}

/// Successful command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResultEvent {
    pub command_id: Uuid,
    pub command_kind: String,
    pub result: Value,
}

impl EventPayload for CommandResultEvent {
    const KIND: &'static str = "CommandResultEvent";
}

/// Failed (or cancelled) command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandErrorEvent {
    pub command_id: Uuid,
    pub command_kind: String,
    pub error: ErrorDescription,
}

impl EventPayload for CommandErrorEvent {
    const KIND: &'static str = "CommandErrorEvent";
}

/// An event handler failed while processing a published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHandlerFailed {
    pub event_id: Uuid,
    pub event_kind: String,
    pub handler: String,
    pub error: ErrorDescription,
}

impl EventPayload for EventHandlerFailed {
    const KIND: &'static str = "EventHandlerError";
    const CATEGORY: Category = Category::Diagnostic;
}

/// Queued events discarded because the shutdown grace period ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventsDropped {
    pub count: usize,
    pub grace_ms: u64,
}

impl EventPayload for EventsDropped {
    const KIND: &'static str = "EventsDropped";
    const CATEGORY: Category = Category::Diagnostic;
}

/// Command executions abandoned at shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForcedTermination {
    pub grace_ms: u64,
    /// `"<kind>:<command id>"` of every abandoned execution.
    pub abandoned: Vec<String>,
}

impl EventPayload for ForcedTermination {
    const KIND: &'static str = "ForcedTermination";
    const CATEGORY: Category = Category::Diagnostic;
}
