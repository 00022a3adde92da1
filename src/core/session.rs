//! # Session: a scope bounding a set of handler registrations.
//!
//! A [`Session`] is a handle pairing a [`MessageBus`] with a [`SessionId`]. It
//! registers handlers under that id, stamps the envelopes it builds with it,
//! and clears every registration of the session when closed.
//!
//! ## Ownership
//! - [`MessageBus::create_session`] returns an **owned** handle: dropping it
//!   clears the session (like an explicit [`Session::close`]).
//! - [`MessageBus::session`] and [`MessageBus::global_session`] return
//!   **borrowed** handles: dropping them leaves registrations in place.

use crate::core::bus::MessageBus;
use crate::envelopes::{Command, CommandPayload, Event, EventPayload, SessionId};
use crate::error::BusError;
use crate::handlers::{CommandHandlerRef, EventHandlerRef, HandlerId};

/// Handle to one session of a bus.
pub struct Session {
    bus: MessageBus,
    id: SessionId,
    owned: bool,
}

impl Session {
    pub(crate) fn owned(bus: MessageBus, id: SessionId) -> Self {
        tracing::debug!(session = %id, "session created");
        Self { bus, id, owned: true }
    }

    pub(crate) fn borrowed(bus: MessageBus, id: SessionId) -> Self {
        Self {
            bus,
            id,
            owned: false,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// True if dropping this handle clears the session.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn register_command_handler<P: CommandPayload>(
        &self,
        handler: CommandHandlerRef<P>,
    ) -> Result<(), BusError> {
        self.bus.register_command_handler(&self.id, handler)
    }

    pub fn register_event_handler<P: EventPayload>(&self, handler: EventHandlerRef<P>) -> HandlerId {
        self.bus.register_event_handler(&self.id, handler)
    }

    pub fn unregister_event_handler(&self, id: HandlerId) -> bool {
        self.bus.unregister_event_handler(&self.id, id)
    }

    /// Registrations currently held by this session.
    pub fn handler_count(&self) -> usize {
        self.bus.registry().handler_count(&self.id)
    }

    /// A command stamped with this session.
    pub fn command<P: CommandPayload>(&self, payload: P) -> Command<P> {
        Command::new(self.id.clone(), payload)
    }

    /// An event stamped with this session.
    pub fn event<P: EventPayload>(&self, payload: P) -> Event<P> {
        Event::new(self.id.clone(), payload)
    }

    /// Executes `payload` as a command of this session.
    pub async fn execute<P: CommandPayload>(&self, payload: P) -> Result<P::Output, BusError> {
        self.bus.execute(self.command(payload)).await
    }

    /// Publishes `payload` as an event of this session.
    pub fn publish<P: EventPayload>(&self, payload: P) -> Result<(), BusError> {
        self.bus.publish(self.event(payload))
    }

    /// Clears every registration of this session, whether owned or not.
    pub fn close(mut self) {
        self.clear();
        self.owned = false;
    }

    fn clear(&self) {
        self.bus.clear_session(&self.id);
        tracing::debug!(session = %self.id, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.owned {
            self.clear();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owned", &self.owned)
            .finish()
    }
}
