//! Bus core: configuration, lifecycle and dispatch.
//!
//! The public API of this module is [`MessageBus`], [`BusConfig`], [`BusState`]
//! and [`Session`].
//!
//! Internal modules:
//! - [`bus`]: lifecycle state machine, submission API, per-run runtime;
//! - [`runner`]: one command execution with span and outcome records;
//! - [`queue`]: event queue and the drain task that fans events out;
//! - [`session`]: session-scoped handles.

mod bus;
mod config;
mod queue;
mod runner;
mod session;

pub use bus::{BusState, MessageBus};
pub use config::BusConfig;
pub use session::Session;
