//! Error types used by the bus and by handlers.
//!
//! This module defines three error enums:
//!
//! - [`BusError`]: errors returned to callers of the registration, submission
//!   and lifecycle APIs.
//! - [`HandlerError`]: errors raised by command and event handlers.
//! - [`SinkError`]: failures of the observability log. The dispatch path never
//!   propagates these; they surface only from the log reader.
//!
//! All types provide helper methods (`as_label`, `as_message`) for logging.

use uuid::Uuid;

use crate::core::BusState;
use crate::envelopes::{ErrorDescription, ErrorKind, SessionId};

/// # Errors returned by the message bus.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum BusError {
    /// A command handler is already registered for this type in this session.
    #[error("command handler for {kind} already registered in session {session}")]
    DuplicateHandler {
        /// Session the registration targeted.
        session: SessionId,
        /// Command type tag.
        kind: &'static str,
    },

    /// No command handler is registered for this type (neither in the session nor globally).
    #[error("no handler registered for command {kind} in session {session}")]
    NoHandlerRegistered {
        /// Session of the command.
        session: SessionId,
        /// Command type tag.
        kind: &'static str,
    },

    /// The command handler ran and failed; a `CommandErrorEvent` was also published.
    #[error("handler for {kind} (command {command_id}) failed: {source}")]
    HandlerExecution {
        /// Id of the failed command.
        command_id: Uuid,
        /// Command type tag.
        kind: &'static str,
        /// Original cause.
        #[source]
        source: HandlerError,
    },

    /// The bus is not in a state that accepts this call.
    #[error("message bus is not running (state: {state:?})")]
    NotRunning {
        /// State observed by the call.
        state: BusState,
    },

    /// `start`/`stop` called while another transition is in flight.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// State observed by the call.
        from: BusState,
        /// State the call tried to reach.
        to: BusState,
    },
}

impl BusError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use msgbus::{BusError, BusState};
    ///
    /// let err = BusError::NotRunning { state: BusState::Stopped };
    /// assert_eq!(err.as_label(), "bus_not_running");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::DuplicateHandler { .. } => "duplicate_handler",
            BusError::NoHandlerRegistered { .. } => "no_handler_registered",
            BusError::HandlerExecution { .. } => "handler_execution",
            BusError::NotRunning { .. } => "bus_not_running",
            BusError::InvalidStateTransition { .. } => "invalid_state_transition",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            BusError::DuplicateHandler { session, kind } => {
                format!("duplicate handler: kind={kind} session={session}")
            }
            BusError::NoHandlerRegistered { session, kind } => {
                format!("no handler: kind={kind} session={session}")
            }
            BusError::HandlerExecution {
                command_id,
                kind,
                source,
            } => format!("handler failed: kind={kind} command={command_id} cause={source}"),
            BusError::NotRunning { state } => format!("not running: state={state:?}"),
            BusError::InvalidStateTransition { from, to } => {
                format!("invalid transition: {from:?} -> {to:?}")
            }
        }
    }

    /// The handler error wrapped by [`BusError::HandlerExecution`], if any.
    pub fn handler_error(&self) -> Option<&HandlerError> {
        match self {
            BusError::HandlerExecution { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// # Errors produced by handlers.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Handler failed.
    #[error("execution failed: {error}")]
    Fail {
        /// The underlying error message.
        error: String,
    },

    /// Handler panicked; the panic was caught by the bus.
    #[error("handler panicked: {info}")]
    Panicked {
        /// Panic payload, if it was a string.
        info: String,
    },

    /// Execution was cancelled.
    #[error("execution cancelled")]
    Canceled,
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Fail`].
    pub fn fail(error: impl std::fmt::Display) -> Self {
        HandlerError::Fail {
            error: error.to_string(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use msgbus::HandlerError;
    ///
    /// assert_eq!(HandlerError::fail("boom").as_label(), "handler_failed");
    /// assert_eq!(HandlerError::Canceled.as_label(), "handler_canceled");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Fail { .. } => "handler_failed",
            HandlerError::Panicked { .. } => "handler_panicked",
            HandlerError::Canceled => "handler_canceled",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        match self {
            HandlerError::Fail { error } => format!("error: {error}"),
            HandlerError::Panicked { info } => format!("panic: {info}"),
            HandlerError::Canceled => "cancelled".to_string(),
        }
    }

    /// Classification recorded in failure events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Fail { .. } => ErrorKind::Failed,
            HandlerError::Panicked { .. } => ErrorKind::Panicked,
            HandlerError::Canceled => ErrorKind::Cancelled,
        }
    }

    /// Structured description for `CommandErrorEvent` / `EventHandlerFailed`.
    pub fn describe(&self) -> ErrorDescription {
        ErrorDescription {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Converts a caught panic payload into [`HandlerError::Panicked`].
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let info = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        HandlerError::Panicked { info }
    }
}

impl From<String> for HandlerError {
    fn from(error: String) -> Self {
        HandlerError::Fail { error }
    }
}

impl From<&str> for HandlerError {
    fn from(error: &str) -> Self {
        HandlerError::Fail {
            error: error.to_string(),
        }
    }
}

/// # Errors of the observability log.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    /// Destination could not be opened or written.
    #[error("log io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("log serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The sink is not open.
    #[error("sink closed")]
    Closed,
}

impl SinkError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SinkError::Io(_) => "sink_io",
            SinkError::Serialize(_) => "sink_serialize",
            SinkError::Closed => "sink_closed",
        }
    }
}
