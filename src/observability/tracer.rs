//! # Tracer: span bookkeeping
//!
//! Emits [`TraceEvent`] start/end records through the sink and remembers open
//! spans so an end can carry its duration. Bookkeeping only: nothing here
//! fails the caller.
//!
//! ## Rules
//! - `start_span` always returns a fresh [`SpanContext`] (a child of `parent`
//!   when given, sharing its trace id).
//! - `end_span` without a matching `start_span` in the same session logs a
//!   warning and still records the end.
//! - With tracing disabled no record is emitted and no span is tracked.
//! - The bus forgets spans still open when it stops; ending one later is
//!   treated as unmatched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::envelopes::{Event, SessionId, SpanContext, SpanStatus, TraceEvent};
use crate::observability::sink::ObservabilitySink;

struct OpenSpan {
    name: String,
    session: SessionId,
    started: Instant,
}

/// Produces correlated span records.
pub struct Tracer {
    sink: Arc<ObservabilitySink>,
    enabled: bool,
    open: Mutex<HashMap<Uuid, OpenSpan>>,
}

impl Tracer {
    pub fn new(sink: Arc<ObservabilitySink>, enabled: bool) -> Self {
        Self {
            sink,
            enabled,
            open: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Number of spans started and not yet ended.
    pub fn open_spans(&self) -> usize {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Forgets every open span without recording an end. Returns how many were dropped.
    pub fn clear_open_spans(&self) -> usize {
        let stale: Vec<(Uuid, OpenSpan)> = self
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (span_id, span) in &stale {
            tracing::debug!(span_id = %span_id, name = %span.name, session = %span.session, "span left open");
        }
        stale.len()
    }

    /// Opens a span and records its start.
    pub fn start_span(
        &self,
        session: &SessionId,
        name: &str,
        parent: Option<&SpanContext>,
        attributes: Map<String, Value>,
    ) -> SpanContext {
        let span = SpanContext::under(parent);
        if !self.enabled {
            return span;
        }

        self.open.lock().unwrap_or_else(PoisonError::into_inner).insert(
            span.span_id,
            OpenSpan {
                name: name.to_string(),
                session: session.clone(),
                started: Instant::now(),
            },
        );

        let mut event = Event::new(session.clone(), TraceEvent::start(name, span.clone(), attributes));
        if let Some(parent) = parent {
            event = event.child_of(parent);
        }
        self.sink.record(&event);
        span
    }

    /// Closes a span and records its end with `status`.
    pub fn end_span(
        &self,
        session: &SessionId,
        span: &SpanContext,
        status: SpanStatus,
        attributes: Map<String, Value>,
    ) {
        if !self.enabled {
            return;
        }

        let opened = self
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&span.span_id);

        let (name, duration_ms) = match opened {
            Some(open) => {
                if open.session != *session {
                    tracing::warn!(
                        span_id = %span.span_id,
                        started_in = %open.session,
                        ended_in = %session,
                        "span ended in a different session than it was started in"
                    );
                }
                (open.name, Some(open.started.elapsed().as_secs_f64() * 1000.0))
            }
            None => {
                tracing::warn!(
                    span_id = %span.span_id,
                    session = %session,
                    "end_span without matching start_span"
                );
                ("unknown".to_string(), None)
            }
        };

        let event = Event::new(
            session.clone(),
            TraceEvent::end(name, span.clone(), status, duration_ms, attributes),
        );
        self.sink.record(&event);
    }
}
