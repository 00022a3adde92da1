//! # Handlers and their registry.
//!
//! This module provides the handler-related types:
//! - [`CommandHandler`] / [`EventHandler`] - async handler traits
//! - [`HandlerContext`] - session, span and cancellation token of one invocation
//! - [`HandlerFn`] - closure-backed implementation of both traits
//! - [`Registry`] - session-scoped type-to-handler bindings

mod handler;
mod handler_fn;
mod registry;

pub use handler::{CommandHandler, CommandHandlerRef, EventHandler, EventHandlerRef, HandlerContext};
pub use handler_fn::HandlerFn;
pub use registry::{HandlerId, Registry, ResolvedEventHandler};
