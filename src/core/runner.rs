//! # Run one command execution.
//!
//! Executes a resolved [`CommandHandler`] for one [`Command`] inside its own
//! task and records the lifecycle through the sink and the tracer.
//!
//! ## Record flow
//!
//! ```text
//! Success:
//!   acquire slot → span START → handler → Ok(v)  → CommandResultEvent(v) → span END (OK)
//!
//! Failure:
//!   acquire slot → span START → handler → Err(e) → CommandErrorEvent(e)  → span END (ERROR)
//!
//! Caller cancellation (token or dropped future) / abandonment at stop:
//!   ... → CommandErrorEvent(cancelled) → span END (CANCELLED, if it was opened)
//! ```
//!
//! ## Rules
//! - Always records **exactly one** outcome event: `CommandResultEvent` or `CommandErrorEvent`.
//! - The outcome guard is armed before the first await: if the task is aborted
//!   anywhere, `Drop` records the cancelled outcome.
//! - Handler panics are caught and reported as [`HandlerError::Panicked`].
//! - The handler sees a child of the bus run token: `stop()` cancels it
//!   cooperatively; caller cancellation drops the handler future immediately.
//! - A command executed from inside a running command handler is *nested*: it
//!   runs on its parent's concurrency slot instead of waiting for one, so a
//!   full bus cannot deadlock on its own sub-commands.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Map, Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::bus::{Inner, Runtime};
use crate::envelopes::{
    Command, CommandErrorEvent, CommandPayload, CommandResultEvent, Event, EventPayload,
    SpanContext, SpanStatus,
};
use crate::error::{BusError, HandlerError};
use crate::handlers::{CommandHandlerRef, HandlerContext};

tokio::task_local! {
    /// Present while a command handler is being polled.
    static IN_HANDLER: ();
}

/// True when called from inside a running command handler.
pub(crate) fn in_handler() -> bool {
    IN_HANDLER.try_with(|_| ()).is_ok()
}

/// Everything one execution needs, moved into its task.
pub(crate) struct Execution<P: CommandPayload> {
    pub(crate) inner: Arc<Inner>,
    pub(crate) runtime: Arc<Runtime>,
    pub(crate) command: Arc<Command<P>>,
    pub(crate) handler: CommandHandlerRef<P>,
    pub(crate) caller: CancellationToken,
    /// Issued from inside another handler: skips the concurrency limit.
    pub(crate) nested: bool,
}

impl<P: CommandPayload> Execution<P> {
    pub(crate) async fn run(self) -> Result<P::Output, BusError> {
        let Execution {
            inner,
            runtime,
            command,
            handler,
            caller,
            nested,
        } = self;
        let mut outcome = Outcome {
            inner: Arc::clone(&inner),
            runtime: Arc::clone(&runtime),
            command: Arc::clone(&command),
            span: None,
            settled: false,
        };

        let semaphore = runtime.semaphore.as_ref().filter(|_| !nested);
        let _permit = match acquire_slot(semaphore, &runtime.token, &caller).await {
            Ok(permit) => permit,
            Err(e) => return Err(outcome.failed(e)),
        };

        let mut attributes = Map::new();
        attributes.insert("command_id".into(), Value::String(command.id().to_string()));
        attributes.insert("command_kind".into(), Value::String(P::KIND.to_string()));
        attributes.insert("session_id".into(), Value::String(command.session_id().to_string()));
        let span = inner.tracer.start_span(
            command.session_id(),
            &format!("execute {}", P::KIND),
            command.header().parent_span.as_ref(),
            attributes,
        );
        outcome.span = Some(span.clone());

        let token = runtime.token.child_token();
        let ctx = HandlerContext::new(command.session_id().clone(), Some(span), token.clone());
        let call = AssertUnwindSafe(handler.handle(ctx, Arc::clone(&command))).catch_unwind();
        let call = IN_HANDLER.scope((), call);

        let res = tokio::select! {
            r = call => r.unwrap_or_else(|panic| Err(HandlerError::from_panic(panic))),
            _ = caller.cancelled() => {
                token.cancel();
                Err(HandlerError::Canceled)
            }
        };

        match res {
            Ok(output) => {
                outcome.succeeded(&output);
                Ok(output)
            }
            Err(e) => Err(outcome.failed(e)),
        }
    }
}

/// Waits for a concurrency slot. `Ok(None)` when the bus is unbounded.
async fn acquire_slot(
    semaphore: Option<&Arc<Semaphore>>,
    run: &CancellationToken,
    caller: &CancellationToken,
) -> Result<Option<OwnedSemaphorePermit>, HandlerError> {
    let Some(sem) = semaphore else {
        return Ok(None);
    };
    tokio::select! {
        permit = Arc::clone(sem).acquire_owned() => permit.map(Some).map_err(|_| HandlerError::Canceled),
        _ = run.cancelled() => Err(HandlerError::Canceled),
        _ = caller.cancelled() => Err(HandlerError::Canceled),
    }
}

/// Records the outcome of one execution exactly once.
struct Outcome<P: CommandPayload> {
    inner: Arc<Inner>,
    runtime: Arc<Runtime>,
    command: Arc<Command<P>>,
    span: Option<SpanContext>,
    settled: bool,
}

impl<P: CommandPayload> Outcome<P> {
    fn succeeded(&mut self, output: &P::Output) {
        self.settled = true;
        let result = serde_json::to_value(output).unwrap_or_else(|e| {
            tracing::warn!(kind = P::KIND, error = %e, "command result not serializable");
            json!({ "unserializable": e.to_string() })
        });
        let event = self.derived(CommandResultEvent {
            command_id: self.command.id(),
            command_kind: P::KIND.to_string(),
            result,
        });
        self.inner.emit(&self.runtime, event);
        self.close_span(SpanStatus::Ok, Map::new());
        tracing::debug!(kind = P::KIND, command_id = %self.command.id(), "command succeeded");
    }

    fn failed(&mut self, err: HandlerError) -> BusError {
        self.settled = true;
        let event = self.derived(CommandErrorEvent {
            command_id: self.command.id(),
            command_kind: P::KIND.to_string(),
            error: err.describe(),
        });
        self.inner.emit(&self.runtime, event);

        let status = match err {
            HandlerError::Canceled => SpanStatus::Cancelled,
            _ => SpanStatus::Error,
        };
        let mut attributes = Map::new();
        attributes.insert("error".into(), Value::String(err.to_string()));
        attributes.insert("error_kind".into(), Value::String(err.as_label().to_string()));
        self.close_span(status, attributes);

        tracing::warn!(
            kind = P::KIND,
            command_id = %self.command.id(),
            label = err.as_label(),
            "command failed: {}",
            err.as_message()
        );
        BusError::HandlerExecution {
            command_id: self.command.id(),
            kind: P::KIND,
            source: err,
        }
    }

    /// Outcome events hang under the execution span (or the caller's span).
    fn derived<E: EventPayload>(&self, payload: E) -> Event<E> {
        let event = Event::new(self.command.session_id().clone(), payload);
        match self.span.as_ref().or(self.command.header().parent_span.as_ref()) {
            Some(span) => event.child_of(span),
            None => event,
        }
    }

    fn close_span(&mut self, status: SpanStatus, attributes: Map<String, Value>) {
        if let Some(span) = self.span.take() {
            self.inner
                .tracer
                .end_span(self.command.session_id(), &span, status, attributes);
        }
    }
}

impl<P: CommandPayload> Drop for Outcome<P> {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.failed(HandlerError::Canceled);
        }
    }
}
