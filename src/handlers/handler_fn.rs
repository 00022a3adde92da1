//! # Function-backed handlers.
//!
//! [`HandlerFn`] wraps a closure `Fn(HandlerContext, Arc<Envelope>) -> Future`
//! and implements [`CommandHandler`] or [`EventHandler`] depending on the
//! envelope it accepts. The closure is `Fn` (not `FnMut`): every call builds
//! a fresh future, so state shared between calls must live behind an `Arc`.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelopes::{Command, CommandPayload, Event, EventPayload};
use crate::error::HandlerError;
use crate::handlers::handler::{CommandHandler, EventHandler, HandlerContext};

/// Closure-backed handler.
#[derive(Debug)]
pub struct HandlerFn<F> {
    name: Cow<'static, str>,
    f: F,
}

impl<F> HandlerFn<F> {
    /// Creates a new function-backed handler.
    ///
    /// Prefer [`HandlerFn::arc`] when you immediately register it.
    pub fn new(name: impl Into<Cow<'static, str>>, f: F) -> Self {
        Self { name: name.into(), f }
    }

    /// Creates the handler as a shared handle.
    ///
    /// ## Example
    /// ```rust
    /// use std::sync::Arc;
    /// use msgbus::{Command, CommandHandler, CommandPayload, HandlerContext, HandlerError, HandlerFn};
    /// use serde::Serialize;
    ///
    /// #[derive(Serialize)]
    /// struct Ping;
    /// impl CommandPayload for Ping {
    ///     const KIND: &'static str = "Ping";
    ///     type Output = String;
    /// }
    ///
    /// let h = HandlerFn::arc("ping", |_ctx: HandlerContext, _cmd: Arc<Command<Ping>>| async {
    ///     Ok::<_, HandlerError>("ok".to_string())
    /// });
    /// assert_eq!(CommandHandler::<Ping>::name(&*h), "ping");
    /// ```
    pub fn arc(name: impl Into<Cow<'static, str>>, f: F) -> Arc<Self> {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<P, F, Fut> CommandHandler<P> for HandlerFn<F>
where
    P: CommandPayload,
    F: Fn(HandlerContext, Arc<Command<P>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P::Output, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, command: Arc<Command<P>>) -> Result<P::Output, HandlerError> {
        (self.f)(ctx, command).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl<P, F, Fut> EventHandler<P> for HandlerFn<F>
where
    P: EventPayload,
    F: Fn(HandlerContext, Arc<Event<P>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn on_event(&self, ctx: HandlerContext, event: Arc<Event<P>>) -> Result<(), HandlerError> {
        (self.f)(ctx, event).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
