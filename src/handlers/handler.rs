//! # Handler traits.
//!
//! This module defines [`CommandHandler`] (exactly one per command type and
//! session) and [`EventHandler`] (any number per event type and session).
//! Both are async and receive a [`HandlerContext`] carrying the session, the
//! active span and a [`CancellationToken`]. Handlers should check the token
//! and return [`HandlerError::Canceled`] promptly once it fires: `stop()`
//! cancels it and abandons handlers still running after the grace period.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use msgbus::{Command, CommandHandler, CommandPayload, HandlerContext, HandlerError};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Add(i64, i64);
//!
//! impl CommandPayload for Add {
//!     const KIND: &'static str = "Add";
//!     type Output = i64;
//! }
//!
//! struct Adder;
//!
//! #[async_trait]
//! impl CommandHandler<Add> for Adder {
//!     async fn handle(&self, ctx: HandlerContext, cmd: Arc<Command<Add>>) -> Result<i64, HandlerError> {
//!         if ctx.is_cancelled() {
//!             return Err(HandlerError::Canceled);
//!         }
//!         let Add(a, b) = *cmd.payload();
//!         Ok(a + b)
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::envelopes::{Command, CommandPayload, Event, EventPayload, SessionId, SpanContext};
use crate::error::HandlerError;

/// Execution context passed to every handler invocation.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    session: SessionId,
    span: Option<SpanContext>,
    token: CancellationToken,
}

impl HandlerContext {
    pub(crate) fn new(session: SessionId, span: Option<SpanContext>, token: CancellationToken) -> Self {
        Self {
            session,
            span,
            token,
        }
    }

    /// Session the envelope belongs to.
    #[inline]
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Span of the current unit of work: the execution span for commands,
    /// the publisher's span (if any) for events. Pass it to `child_of`.
    #[inline]
    pub fn span(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when the execution is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Handles one command type.
#[async_trait]
pub trait CommandHandler<P: CommandPayload>: Send + Sync + 'static {
    /// Executes the command and returns its output.
    async fn handle(&self, ctx: HandlerContext, command: Arc<Command<P>>) -> Result<P::Output, HandlerError>;

    /// Name used in logs. The default is the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Reacts to one event type.
///
/// Failures (errors and panics) are isolated: they are recorded as
/// `EventHandlerError` diagnostics and never reach the publisher or the
/// other handlers of the same event.
#[async_trait]
pub trait EventHandler<P: EventPayload>: Send + Sync + 'static {
    async fn on_event(&self, ctx: HandlerContext, event: Arc<Event<P>>) -> Result<(), HandlerError>;

    /// Name used in logs and in `EventHandlerError` records.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Shared handle to a command handler.
pub type CommandHandlerRef<P> = Arc<dyn CommandHandler<P>>;

/// Shared handle to an event handler.
pub type EventHandlerRef<P> = Arc<dyn EventHandler<P>>;
