//! # Trace records.
//!
//! A trace is a tree of spans sharing one `trace_id`. Parent/child linkage
//! is by convention: callers thread a [`SpanContext`] through
//! (`Command::child_of`), the bus does not enforce it.
//!
//! Each span produces two [`TraceEvent`] records: a start record
//! (`start_time` set) and an end record (`end_time`, `duration_ms`, `status`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::envelope::{Category, EventPayload};

/// Correlates a logical unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<Uuid>,
}

impl SpanContext {
    /// Starts a new trace.
    pub fn root() -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
        }
    }

    /// A new span in the same trace, parented to `self`.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
        }
    }

    /// Child of `parent` if given, otherwise a new root.
    pub fn under(parent: Option<&SpanContext>) -> Self {
        parent.map_or_else(Self::root, Self::child)
    }
}

/// Final status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanStatus {
    Ok,
    Error,
    Cancelled,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "OK",
            SpanStatus::Error => "ERROR",
            SpanStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Start or end of a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub name: String,
    pub span: SpanContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SpanStatus>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl TraceEvent {
    pub fn start(name: impl Into<String>, span: SpanContext, attributes: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            span,
            start_time: Some(Utc::now()),
            end_time: None,
            duration_ms: None,
            status: None,
            attributes,
        }
    }

    pub fn end(
        name: impl Into<String>,
        span: SpanContext,
        status: SpanStatus,
        duration_ms: Option<f64>,
        attributes: Map<String, Value>,
    ) -> Self {
        Self {
            name: name.into(),
            span,
            start_time: None,
            end_time: Some(Utc::now()),
            duration_ms,
            status: Some(status),
            attributes,
        }
    }

    #[inline]
    pub fn is_start(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_none()
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.end_time.is_some()
    }
}

impl EventPayload for TraceEvent {
    const KIND: &'static str = "TraceEvent";
    const CATEGORY: Category = Category::Trace;
}
