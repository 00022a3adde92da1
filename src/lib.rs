//! # msgbus
//!
//! **msgbus** is an in-process command/event bus with a durable observability log.
//!
//! Application components never call each other directly: they submit
//! commands (exactly one handler, a result comes back) and publish events
//! (zero or more handlers, fire-and-forget). Every envelope that crosses the
//! bus is appended to a line-delimited JSON log, and every command execution
//! is wrapped in a trace span.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   collaborators                       ┌──────────────────────────────┐
//!   ─────────────                       │          Registry            │
//!   execute(Command<P>) ─┐              │ session ─► TypeId ─► handler │
//!   publish(Event<P>)  ──┤              └──────────────▲───────────────┘
//!   register_*()       ──┤                             │ resolve (session, then global)
//!                        ▼                             │
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  MessageBus                                                       │
//! │  - lifecycle: STOPPED → STARTING → RUNNING → STOPPING → STOPPED   │
//! │  - Runtime (per run): token, TaskTracker, Semaphore, EventQueue   │
//! └──────┬──────────────────────────┬──────────────────────────┬──────┘
//!        │ Execution task           │ drain task               │ every envelope
//!        ▼                          ▼                          ▼
//!  permit → span → handler    h1 → h2 → ... → hN     ┌────────────────────┐
//!  → CommandResultEvent /     (failures isolated,    │ ObservabilitySink  │
//!    CommandErrorEvent         one diagnostic each)  │  writer ─► .jsonl  │
//!  → span end                                        │  console mirror    │
//!                                                    └────────────────────┘
//! ```
//!
//! ### Log of one successful command
//! ```text
//! seq 0  command  Ping
//! seq 1  trace    TraceEvent          (start, "execute Ping")
//! seq 2  event    CommandResultEvent  (result = "ok")
//! seq 3  trace    TraceEvent          (end, status OK, duration_ms)
//! ```
//!
//! ## Features
//! | Area              | Description                                                 | Key types / traits                          |
//! |-------------------|-------------------------------------------------------------|---------------------------------------------|
//! | **Envelopes**     | Typed commands and events over serializable payloads.       | [`Command`], [`Event`], [`CommandPayload`], [`EventPayload`] |
//! | **Handlers**      | Async handler traits and closure adapters.                  | [`CommandHandler`], [`EventHandler`], [`HandlerFn`] |
//! | **Dispatch**      | Lifecycle, execution, fan-out, sessions.                    | [`MessageBus`], [`Session`], [`BusConfig`]  |
//! | **Observability** | Append-only record log, spans, metrics, log replay.         | [`ObservabilitySink`], [`Tracer`], [`Record`] |
//! | **Errors**        | Typed errors for callers, handlers and the log.             | [`BusError`], [`HandlerError`], [`SinkError`] |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use msgbus::{BusConfig, Command, CommandPayload, HandlerContext, HandlerError, HandlerFn, MessageBus};
//! use serde::Serialize;
//!
//! #[derive(Serialize)]
//! struct Greet { name: String }
//!
//! impl CommandPayload for Greet {
//!     const KIND: &'static str = "Greet";
//!     type Output = String;
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dir = tempfile::tempdir()?;
//!     let bus = MessageBus::new(BusConfig {
//!         log_dir: dir.path().to_path_buf(),
//!         ..BusConfig::default()
//!     });
//!     bus.start().await?;
//!
//!     let session = bus.create_session();
//!     session.register_command_handler(HandlerFn::arc(
//!         "greet",
//!         |_ctx: HandlerContext, cmd: Arc<Command<Greet>>| async move {
//!             Ok::<_, HandlerError>(format!("hello, {}", cmd.payload().name))
//!         },
//!     ))?;
//!
//!     let out = session.execute(Greet { name: "bus".into() }).await?;
//!     assert_eq!(out, "hello, bus");
//!
//!     session.close();
//!     bus.stop().await?;
//!     Ok(())
//! }
//! ```
mod core;
mod envelopes;
mod error;
mod handlers;
pub mod logging;
pub mod observability;

// ---- Public re-exports ----

pub use core::{BusConfig, BusState, MessageBus, Session};
pub use envelopes::{
    Category, Command, CommandErrorEvent, CommandPayload, CommandResultEvent, ErrorDescription,
    ErrorKind, Event, EventHandlerFailed, EventPayload, EventsDropped, ForcedTermination,
    GLOBAL_SESSION, Header, Metric, MetricEvent, MetricValue, SessionId, SpanContext, SpanStatus,
    TraceEvent,
};
pub use error::{BusError, HandlerError, SinkError};
pub use handlers::{
    CommandHandler, CommandHandlerRef, EventHandler, EventHandlerRef, HandlerContext, HandlerFn,
    HandlerId, Registry, ResolvedEventHandler,
};
pub use observability::{ObservabilitySink, Observable, Record, RecordFilter, Tracer};
