//! # Log records and the serialization capability.
//!
//! [`Observable`] is the contract every envelope satisfies: it can describe
//! itself (type tag, category, header) and serialize its payload. The sink
//! turns any `&dyn Observable` into a [`Record`], the unit written to the log
//! as one JSON line.
//!
//! Serialization is total: if a payload fails to serialize, the record still
//! carries the type tag and header, and the payload is replaced by
//! `{"unserializable": "<error>"}`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::envelopes::{
    Category, Command, CommandPayload, Event, EventPayload, Header, SessionId, SpanContext,
};

/// Something the bus can write to the observability log.
pub trait Observable: Send + Sync {
    /// Type tag.
    fn kind(&self) -> &'static str;

    fn category(&self) -> Category;

    fn header(&self) -> &Header;

    /// Payload as a JSON value.
    fn payload_value(&self) -> Result<Value, serde_json::Error>;
}

impl<P: CommandPayload> Observable for Command<P> {
    fn kind(&self) -> &'static str {
        P::KIND
    }

    fn category(&self) -> Category {
        Category::Command
    }

    fn header(&self) -> &Header {
        Command::header(self)
    }

    fn payload_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self.payload())
    }
}

impl<P: EventPayload> Observable for Event<P> {
    fn kind(&self) -> &'static str {
        P::KIND
    }

    fn category(&self) -> Category {
        P::CATEGORY
    }

    fn header(&self) -> &Header {
        Event::header(self)
    }

    fn payload_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self.payload())
    }
}

/// One line of the observability log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Position in the log (traversal order), assigned by the sink.
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub kind: String,
    pub category: Category,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span: Option<SpanContext>,
    pub payload: Value,
}

impl Record {
    /// Captures `item` into a record. `seq` is filled in by the sink.
    pub fn capture(item: &dyn Observable) -> Self {
        let header = item.header();
        let payload = item.payload_value().unwrap_or_else(|e| {
            tracing::warn!(kind = item.kind(), error = %e, "payload not serializable; using fallback");
            serde_json::json!({ "unserializable": e.to_string() })
        });
        Self {
            seq: 0,
            recorded_at: Utc::now(),
            kind: item.kind().to_string(),
            category: item.category(),
            id: header.id,
            created_at: header.created_at,
            session_id: header.session_id.clone(),
            parent_span: header.parent_span.clone(),
            payload,
        }
    }

    /// Decodes the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    #[inline]
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Trace the record belongs to: the span of a trace record, otherwise the parent span.
    pub fn trace_id(&self) -> Option<Uuid> {
        if self.category == Category::Trace {
            self.payload
                .get("span")
                .and_then(|s| s.get("trace_id"))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
        } else {
            self.parent_span.as_ref().map(|s| s.trace_id)
        }
    }
}
