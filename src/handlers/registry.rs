//! # Handler registry - session-scoped type-to-handler bindings.
//!
//! Maps payload types to handlers, per session:
//! - commands: at most **one** handler per `(session, type)`; a second
//!   registration fails with [`BusError::DuplicateHandler`].
//! - events: an ordered list per `(session, type)`; insertion order is
//!   invocation order.
//!
//! ## Architecture
//! ```text
//! RwLock<HashMap<SessionId, SessionTable>>
//!                              ├─ commands: HashMap<TypeId, CommandSlot>
//!                              └─ events:   HashMap<TypeId, Vec<EventSlot>>
//! ```
//!
//! ## Rules
//! - Lookup uses the payload's exact `TypeId` (no supertype matching).
//! - Mutations take the write lock (single writer); resolution takes the
//!   read lock and returns cloned `Arc`s, so a dispatch that resolved a
//!   handler before a `clear_session` completes still runs it, and one that
//!   resolves afterwards sees nothing.
//! - Operations are strictly per session; the global-session fallback is
//!   applied by the dispatcher, not here.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::envelopes::{CommandPayload, Event, EventPayload, SessionId};
use crate::error::{BusError, HandlerError};
use crate::handlers::handler::{CommandHandlerRef, EventHandlerRef, HandlerContext};

/// Identifies one event handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Type-erased event handler invoked by the drain loop.
pub(crate) trait ErasedEventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn call(
        &self,
        ctx: HandlerContext,
        event: Arc<dyn Any + Send + Sync>,
    ) -> BoxFuture<'static, Result<(), HandlerError>>;
}

struct TypedEventHandler<P: EventPayload>(EventHandlerRef<P>);

impl<P: EventPayload> ErasedEventHandler for TypedEventHandler<P> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn call(
        &self,
        ctx: HandlerContext,
        event: Arc<dyn Any + Send + Sync>,
    ) -> BoxFuture<'static, Result<(), HandlerError>> {
        let handler = Arc::clone(&self.0);
        async move {
            match event.downcast::<Event<P>>() {
                Ok(ev) => handler.on_event(ctx, ev).await,
                Err(_) => Err(HandlerError::fail(format!("payload is not {}", P::KIND))),
            }
        }
        .boxed()
    }
}

/// Resolved event handler, in invocation order.
#[derive(Clone)]
pub struct ResolvedEventHandler {
    id: HandlerId,
    pub(crate) handler: Arc<dyn ErasedEventHandler>,
}

impl ResolvedEventHandler {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }
}

struct CommandSlot {
    kind: &'static str,
    /// `Arc<dyn CommandHandler<P>>` boxed as `Any`.
    handler: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct SessionTable {
    commands: HashMap<TypeId, CommandSlot>,
    events: HashMap<TypeId, Vec<ResolvedEventHandler>>,
}

impl SessionTable {
    fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.values().all(Vec::is_empty)
    }

    fn len(&self) -> usize {
        self.commands.len() + self.events.values().map(Vec::len).sum::<usize>()
    }
}

/// Session-scoped registry of command and event handlers.
#[derive(Default)]
pub struct Registry {
    sessions: RwLock<HashMap<SessionId, SessionTable>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to command type `P` in `session`.
    pub fn register_command_handler<P: CommandPayload>(
        &self,
        session: &SessionId,
        handler: CommandHandlerRef<P>,
    ) -> Result<(), BusError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let table = sessions.entry(session.clone()).or_default();
        let key = TypeId::of::<P>();
        if table.commands.contains_key(&key) {
            return Err(BusError::DuplicateHandler {
                session: session.clone(),
                kind: P::KIND,
            });
        }
        table.commands.insert(
            key,
            CommandSlot {
                kind: P::KIND,
                handler: Arc::new(handler),
            },
        );
        tracing::debug!(kind = P::KIND, session = %session, "command handler registered");
        Ok(())
    }

    /// Appends `handler` to the handlers of event type `P` in `session`.
    pub fn register_event_handler<P: EventPayload>(
        &self,
        session: &SessionId,
        handler: EventHandlerRef<P>,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = ResolvedEventHandler {
            id,
            handler: Arc::new(TypedEventHandler(handler)),
        };
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(session.clone())
            .or_default()
            .events
            .entry(TypeId::of::<P>())
            .or_default()
            .push(entry);
        tracing::debug!(kind = P::KIND, session = %session, ?id, "event handler registered");
        id
    }

    /// Returns the single handler for `P` in `session`.
    pub fn resolve_command_handler<P: CommandPayload>(
        &self,
        session: &SessionId,
    ) -> Result<CommandHandlerRef<P>, BusError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session)
            .and_then(|t| t.commands.get(&TypeId::of::<P>()))
            .and_then(|slot| Arc::clone(&slot.handler).downcast::<CommandHandlerRef<P>>().ok())
            .map(|h| Arc::clone(&*h))
            .ok_or_else(|| BusError::NoHandlerRegistered {
                session: session.clone(),
                kind: P::KIND,
            })
    }

    /// Returns the ordered (possibly empty) handlers for `P` in `session`.
    pub fn resolve_event_handlers<P: EventPayload>(&self, session: &SessionId) -> Vec<ResolvedEventHandler> {
        self.resolve_event_handlers_by_type(session, TypeId::of::<P>())
    }

    pub(crate) fn resolve_event_handlers_by_type(
        &self,
        session: &SessionId,
        type_id: TypeId,
    ) -> Vec<ResolvedEventHandler> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session)
            .and_then(|t| t.events.get(&type_id))
            .cloned()
            .unwrap_or_default()
    }

    /// Removes the command handler for `P` in `session`. Returns `true` if one existed.
    pub fn unregister_command_handler<P: CommandPayload>(&self, session: &SessionId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let removed = sessions
            .get_mut(session)
            .is_some_and(|t| t.commands.remove(&TypeId::of::<P>()).is_some());
        Self::prune(&mut sessions, session);
        removed
    }

    /// Removes one event handler registration. Returns `true` if it existed.
    pub fn unregister_event_handler(&self, session: &SessionId, id: HandlerId) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        if let Some(table) = sessions.get_mut(session) {
            for list in table.events.values_mut() {
                let before = list.len();
                list.retain(|h| h.id != id);
                removed |= list.len() != before;
            }
        }
        Self::prune(&mut sessions, session);
        removed
    }

    /// Removes every registration owned by `session`. Idempotent.
    pub fn clear_session(&self, session: &SessionId) {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session);
        if let Some(table) = removed {
            tracing::debug!(session = %session, handlers = table.len(), "session cleared");
        }
    }

    /// Removes every registration of every session.
    pub fn clear_all(&self) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Sorted list of sessions that own registrations.
    pub fn sessions(&self) -> Vec<SessionId> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<SessionId> = sessions.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registrations (command + event) owned by `session`.
    pub fn handler_count(&self, session: &SessionId) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session)
            .map_or(0, SessionTable::len)
    }

    /// Command type tags registered in `session`, sorted.
    pub fn command_kinds(&self, session: &SessionId) -> Vec<&'static str> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut kinds: Vec<&'static str> = sessions
            .get(session)
            .map(|t| t.commands.values().map(|s| s.kind).collect())
            .unwrap_or_default();
        kinds.sort_unstable();
        kinds
    }

    fn prune(sessions: &mut HashMap<SessionId, SessionTable>, session: &SessionId) {
        if sessions.get(session).is_some_and(SessionTable::is_empty) {
            sessions.remove(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelopes::Command;
    use crate::handlers::HandlerFn;
    use serde::Serialize;
    use tokio_util::sync::CancellationToken;

    #[derive(Serialize)]
    struct Ping;
    impl CommandPayload for Ping {
        const KIND: &'static str = "Ping";
        type Output = &'static str;
    }

    #[derive(Serialize)]
    struct Pong;
    impl CommandPayload for Pong {
        const KIND: &'static str = "Pong";
        type Output = ();
    }

    #[derive(Serialize)]
    struct Tick;
    impl EventPayload for Tick {
        const KIND: &'static str = "Tick";
    }

    fn ping_handler(reply: &'static str) -> CommandHandlerRef<Ping> {
        HandlerFn::arc("ping", move |_ctx: HandlerContext, _cmd: Arc<Command<Ping>>| async move {
            Ok::<_, HandlerError>(reply)
        })
    }

    fn tick_handler(name: &'static str) -> EventHandlerRef<Tick> {
        HandlerFn::arc(name, |_ctx: HandlerContext, _ev: Arc<Event<Tick>>| async {
            Ok::<(), HandlerError>(())
        })
    }

    fn ctx(session: &SessionId) -> HandlerContext {
        HandlerContext::new(session.clone(), None, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_duplicate_command_handler_rejected() {
        let reg = Registry::new();
        let s = SessionId::from("s1");
        reg.register_command_handler(&s, ping_handler("a")).unwrap();
        let err = reg.register_command_handler(&s, ping_handler("b")).unwrap_err();
        assert!(matches!(err, BusError::DuplicateHandler { kind: "Ping", .. }));

        // The first registration is untouched.
        let h = reg.resolve_command_handler::<Ping>(&s).unwrap();
        let out = h.handle(ctx(&s), Arc::new(Command::new(s.clone(), Ping))).await.unwrap();
        assert_eq!(out, "a");
    }

    #[test]
    fn test_same_type_in_two_sessions() {
        let reg = Registry::new();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");
        reg.register_command_handler(&s1, ping_handler("a")).unwrap();
        reg.register_command_handler(&s2, ping_handler("b")).unwrap();
        assert_eq!(reg.sessions(), vec![s1, s2]);
    }

    #[test]
    fn test_exact_type_lookup() {
        let reg = Registry::new();
        let s = SessionId::global();
        reg.register_command_handler(&s, ping_handler("a")).unwrap();
        assert!(reg.resolve_command_handler::<Ping>(&s).is_ok());
        let err = reg.resolve_command_handler::<Pong>(&s).err().unwrap();
        assert!(matches!(err, BusError::NoHandlerRegistered { kind: "Pong", .. }));
    }

    #[test]
    fn test_event_handlers_keep_insertion_order() {
        let reg = Registry::new();
        let s = SessionId::global();
        for name in ["first", "second", "third"] {
            reg.register_event_handler(&s, tick_handler(name));
        }
        let names: Vec<String> = reg
            .resolve_event_handlers::<Tick>(&s)
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert!(reg.resolve_event_handlers::<Tick>(&SessionId::from("other")).is_empty());
    }

    #[test]
    fn test_clear_session_is_scoped_and_idempotent() {
        let reg = Registry::new();
        let s1 = SessionId::from("s1");
        let s2 = SessionId::from("s2");
        reg.register_command_handler(&s1, ping_handler("a")).unwrap();
        reg.register_event_handler(&s1, tick_handler("t1"));
        reg.register_command_handler(&s2, ping_handler("b")).unwrap();

        reg.clear_session(&s1);
        reg.clear_session(&s1);

        assert!(reg.resolve_command_handler::<Ping>(&s1).is_err());
        assert!(reg.resolve_event_handlers::<Tick>(&s1).is_empty());
        assert!(reg.resolve_command_handler::<Ping>(&s2).is_ok());
        assert_eq!(reg.handler_count(&s1), 0);
        assert_eq!(reg.handler_count(&s2), 1);
    }

    #[test]
    fn test_unregister_single_bindings() {
        let reg = Registry::new();
        let s = SessionId::from("s");
        reg.register_command_handler(&s, ping_handler("a")).unwrap();
        let keep = reg.register_event_handler(&s, tick_handler("keep"));
        let drop_id = reg.register_event_handler(&s, tick_handler("drop"));

        assert!(reg.unregister_event_handler(&s, drop_id));
        assert!(!reg.unregister_event_handler(&s, drop_id));
        let ids: Vec<HandlerId> = reg.resolve_event_handlers::<Tick>(&s).iter().map(|h| h.id()).collect();
        assert_eq!(ids, [keep]);

        assert!(reg.unregister_command_handler::<Ping>(&s));
        assert_eq!(reg.command_kinds(&s), Vec::<&str>::new());
        // Re-registering after removal works.
        reg.register_command_handler(&s, ping_handler("b")).unwrap();
    }

    #[tokio::test]
    async fn test_resolved_handler_survives_clear() {
        let reg = Registry::new();
        let s = SessionId::from("s");
        reg.register_event_handler(&s, tick_handler("t"));
        let resolved = reg.resolve_event_handlers::<Tick>(&s);
        reg.clear_session(&s);

        let ev: Arc<dyn Any + Send + Sync> = Arc::new(Event::new(s.clone(), Tick));
        let res = resolved[0].handler.call(ctx(&s), ev).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_erased_call_rejects_wrong_payload() {
        let reg = Registry::new();
        let s = SessionId::global();
        reg.register_event_handler(&s, tick_handler("t"));
        let resolved = reg.resolve_event_handlers::<Tick>(&s);
        let wrong: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        let res = resolved[0].handler.call(ctx(&s), wrong).await;
        assert!(matches!(res, Err(HandlerError::Fail { .. })));
    }
}
