//! # EventQueue: ordered, isolated delivery of published events
//!
//! `publish` records the event and enqueues a [`Dispatch`]; a single drain task
//! pops dispatches in FIFO order and invokes the resolved handlers one after
//! another.
//!
//! ## Diagram
//! ```text
//!    publish(Event<P>)
//!        │ sink.record()
//!        ▼
//!   [unbounded queue] ─► drain task ─► resolve(session) ++ resolve(global)
//!                                         │
//!                                         ├─► h1.on_event()   Err/panic ─► EventHandlerError record
//!                                         ├─► h2.on_event()
//!                                         └─► hN.on_event()
//! ```
//!
//! ## Rules
//! - Handlers are resolved at dispatch time (a handler cleared before its event
//!   is dispatched is not called).
//! - Invocation order = session handlers in registration order, then global ones.
//! - A failing or panicking handler produces exactly one diagnostic record and
//!   never prevents its siblings from running.
//! - `pending` counts enqueued and not yet completed dispatches; events published
//!   by handlers are counted before their parent completes, so `pending == 0`
//!   means quiescent.

use std::any::{Any, TypeId};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelopes::{Event, EventHandlerFailed, EventPayload, SessionId, SpanContext};
use crate::error::HandlerError;
use crate::handlers::{HandlerContext, Registry};
use crate::observability::ObservabilitySink;

/// One queued event, erased to its payload type id.
pub(crate) struct Dispatch {
    session: SessionId,
    type_id: TypeId,
    kind: &'static str,
    event_id: Uuid,
    span: Option<SpanContext>,
    event: Arc<dyn Any + Send + Sync>,
}

impl Dispatch {
    pub(crate) fn new<P: EventPayload>(event: Event<P>) -> Self {
        Self {
            session: event.session_id().clone(),
            type_id: TypeId::of::<P>(),
            kind: P::KIND,
            event_id: event.id(),
            span: event.header().parent_span.clone(),
            event: Arc::new(event),
        }
    }
}

/// Queue handle plus the drain task that serves it.
pub(crate) struct EventQueue {
    tx: mpsc::UnboundedSender<Dispatch>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    token: CancellationToken,
    drain: JoinHandle<()>,
}

impl EventQueue {
    /// Spawns the drain task.
    pub(crate) fn spawn(registry: Arc<Registry>, sink: Arc<ObservabilitySink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        let token = CancellationToken::new();

        let drain = tokio::spawn(drain_loop(
            rx,
            registry,
            sink,
            token.clone(),
            Arc::clone(&pending),
            Arc::clone(&idle),
        ));

        Self {
            tx,
            pending,
            idle,
            token,
            drain,
        }
    }

    /// Enqueues one dispatch. Returns `false` if the drain task is gone.
    pub(crate) fn enqueue(&self, dispatch: Dispatch) -> bool {
        self.pending.fetch_add(1, Ordering::AcqRel);
        match self.tx.send(dispatch) {
            Ok(()) => true,
            Err(mpsc::error::SendError(d)) => {
                self.complete_one();
                tracing::warn!(kind = d.kind, event_id = %d.event_id, "event not dispatched: queue closed");
                false
            }
        }
    }

    /// Dispatches enqueued and not yet completed.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn complete_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolves once every enqueued dispatch has completed.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancels running handlers and stops the drain task. Returns the number
    /// of dispatches that never completed.
    pub(crate) fn abort(&self) -> usize {
        self.token.cancel();
        self.drain.abort();
        self.pending()
    }
}

async fn drain_loop(
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    registry: Arc<Registry>,
    sink: Arc<ObservabilitySink>,
    token: CancellationToken,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    while let Some(dispatch) = rx.recv().await {
        deliver(&registry, &sink, &token, dispatch).await;
        if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            idle.notify_waiters();
        }
    }
}

/// Invokes every handler of one event, isolating failures.
async fn deliver(registry: &Registry, sink: &ObservabilitySink, token: &CancellationToken, d: Dispatch) {
    let mut handlers = registry.resolve_event_handlers_by_type(&d.session, d.type_id);
    if !d.session.is_global() {
        handlers.extend(registry.resolve_event_handlers_by_type(&SessionId::global(), d.type_id));
    }
    if handlers.is_empty() {
        tracing::trace!(kind = d.kind, session = %d.session, "event has no handlers");
        return;
    }

    for entry in handlers {
        let ctx = HandlerContext::new(d.session.clone(), d.span.clone(), token.child_token());
        let fut = entry.handler.call(ctx, Arc::clone(&d.event));
        let err = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(panic) => HandlerError::from_panic(panic),
        };

        tracing::warn!(
            kind = d.kind,
            event_id = %d.event_id,
            handler = entry.name(),
            label = err.as_label(),
            "event handler failed: {}",
            err.as_message()
        );
        let mut diagnostic = Event::new(
            d.session.clone(),
            EventHandlerFailed {
                event_id: d.event_id,
                event_kind: d.kind.to_string(),
                handler: entry.name().to_string(),
                error: err.describe(),
            },
        );
        if let Some(span) = &d.span {
            diagnostic = diagnostic.child_of(span);
        }
        sink.record(&diagnostic);
    }
}
