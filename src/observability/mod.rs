//! # Observability: the durable record log and span tracking.
//!
//! - [`Observable`] / [`Record`] serialization capability and log line shape
//! - [`ObservabilitySink`] append-only JSONL writer with optional console mirror
//! - [`Tracer`] span start/end bookkeeping
//! - [`replay`] reading a log back for diagnostics

mod console;
mod record;
pub mod replay;
mod sink;
mod tracer;

pub use record::{Observable, Record};
pub use replay::{RecordFilter, read_records};
pub use sink::{ConsoleOptions, ObservabilitySink};
pub use tracer::Tracer;
