//! # Envelope header, session identity and the generic command/event wrappers.
//!
//! Every object that traverses the bus is an envelope: a [`Header`]
//! (identity, creation time, session, optional parent span) plus a typed
//! payload. Application code defines payload types and implements
//! [`CommandPayload`] or [`EventPayload`] for them; the bus wraps them as
//! [`Command<P>`] / [`Event<P>`].
//!
//! ## Rules
//! - Envelopes are immutable once built: fields are private, builders
//!   (`child_of`) consume `self` and are only usable before dispatch.
//! - The payload's `TypeId` is the registry key (exact type, no supertype
//!   matching). `KIND` is the explicit type tag written to the log.
//! - Handlers receive `Arc<Command<P>>` / `Arc<Event<P>>`: shared read access.
//!
//! ## Example
//! ```rust
//! use msgbus::{Command, CommandPayload, SessionId};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Ping;
//!
//! impl CommandPayload for Ping {
//!     const KIND: &'static str = "Ping";
//!     type Output = String;
//! }
//!
//! let cmd = Command::new(SessionId::global(), Ping);
//! assert_eq!(cmd.kind(), "Ping");
//! assert!(cmd.session_id().is_global());
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trace::SpanContext;

/// Name of the session used when no explicit session is given.
pub const GLOBAL_SESSION: &str = "global";

/// Scope identifier bounding a set of handler registrations.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Creates a session id from any string.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// The process-wide default session.
    pub fn global() -> Self {
        Self(Arc::from(GLOBAL_SESSION))
    }

    /// A fresh random session id.
    pub fn random() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        &*self.0 == GLOBAL_SESSION
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::global()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Observability category of an envelope.
///
/// Only [`Category::Event`] envelopes are delivered to event handlers.
/// The other categories are observational and stop at the sink/console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Command,
    Event,
    Metric,
    Trace,
    Diagnostic,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Command => "command",
            Category::Event => "event",
            Category::Metric => "metric",
            Category::Trace => "trace",
            Category::Diagnostic => "diagnostic",
        }
    }
}

/// Common envelope header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub session_id: SessionId,
    /// Span of the caller, if the envelope was created inside a traced unit of work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span: Option<SpanContext>,
}

impl Header {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            session_id,
            parent_span: None,
        }
    }
}

/// A requested action. Exactly one handler per payload type and session.
pub trait CommandPayload: Serialize + Send + Sync + 'static {
    /// Type tag written to the observability log.
    const KIND: &'static str;

    /// Value returned by the handler and carried by `CommandResultEvent`.
    type Output: Serialize + Send + 'static;
}

/// Something that happened. Zero or more handlers per payload type and session.
pub trait EventPayload: Serialize + Send + Sync + 'static {
    /// Type tag written to the observability log.
    const KIND: &'static str;

    /// Observability category; anything other than `Event` is not dispatched.
    const CATEGORY: Category = Category::Event;
}

/// Command envelope.
#[derive(Debug, Serialize)]
pub struct Command<P> {
    #[serde(flatten)]
    header: Header,
    payload: P,
}

impl<P: CommandPayload> Command<P> {
    pub fn new(session_id: SessionId, payload: P) -> Self {
        Self {
            header: Header::new(session_id),
            payload,
        }
    }

    /// Links this command to the caller's span; its execution span becomes a child.
    #[must_use]
    pub fn child_of(mut self, parent: &SpanContext) -> Self {
        self.header.parent_span = Some(parent.clone());
        self
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        P::KIND
    }
}

impl<P> Command<P> {
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.header.id
    }

    #[inline]
    pub fn session_id(&self) -> &SessionId {
        &self.header.session_id
    }

    #[inline]
    pub fn payload(&self) -> &P {
        &self.payload
    }
}

/// Event envelope.
#[derive(Debug, Serialize)]
pub struct Event<P> {
    #[serde(flatten)]
    header: Header,
    payload: P,
}

impl<P: EventPayload> Event<P> {
    pub fn new(session_id: SessionId, payload: P) -> Self {
        Self {
            header: Header::new(session_id),
            payload,
        }
    }

    #[must_use]
    pub fn child_of(mut self, parent: &SpanContext) -> Self {
        self.header.parent_span = Some(parent.clone());
        self
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        P::KIND
    }

    #[inline]
    pub fn category(&self) -> Category {
        P::CATEGORY
    }
}

impl<P> Event<P> {
    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.header.id
    }

    #[inline]
    pub fn session_id(&self) -> &SessionId {
        &self.header.session_id
    }

    #[inline]
    pub fn payload(&self) -> &P {
        &self.payload
    }
}
