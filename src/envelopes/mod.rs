//! Envelope data model: commands, events and the records the bus synthesizes.
//!
//! ## Contents
//! - [`Header`], [`SessionId`], [`Category`] common envelope data
//! - [`Command`], [`Event`] typed envelopes over user payloads
//! - [`CommandPayload`], [`EventPayload`] payload contracts (type tag + output)
//! - [`CommandResultEvent`], [`CommandErrorEvent`] command outcomes
//! - [`MetricEvent`], [`TraceEvent`], [`SpanContext`] observational records
//! - [`EventHandlerFailed`], [`EventsDropped`], [`ForcedTermination`] diagnostics

mod envelope;
mod lifecycle;
mod metric;
mod trace;

pub use envelope::{
    Category, Command, CommandPayload, Event, EventPayload, GLOBAL_SESSION, Header, SessionId,
};
pub use lifecycle::{
    CommandErrorEvent, CommandResultEvent, ErrorDescription, ErrorKind, EventHandlerFailed,
    EventsDropped, ForcedTermination,
};
pub use metric::{Metric, MetricEvent, MetricValue};
pub use trace::{SpanContext, SpanStatus, TraceEvent};
