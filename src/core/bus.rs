//! # MessageBus: command routing, event fan-out, lifecycle.
//!
//! The [`MessageBus`] owns the handler [`Registry`], the [`ObservabilitySink`]
//! and the [`Tracer`]. While running it also owns a per-run [`Runtime`]: the run
//! cancellation token, the task tracker of in-flight executions, the optional
//! concurrency semaphore and the event queue.
//!
//! ## Architecture
//! ```text
//! execute(Command<P>)                          publish(Event<P>)
//!   │ state == Running                            │ state ∈ {Running, Stopping}
//!   │ sink.record(command)                        │ sink.record(event)
//!   │ resolve(session) → resolve(global)          │ category == event?
//!   │     └─ none → NoHandlerRegistered           ▼
//!   ▼                                          EventQueue ─► drain task ─► handlers
//!  tracker.spawn(Execution::run)
//!     └─ permit → span → handler → outcome event → span end
//!
//! stop():
//!   Running → Stopping, spawns the shutdown task and waits for Stopped
//!     ├─ run token cancelled (handlers observe it cooperatively)
//!     ├─ wait executions until deadline ── exceeded → abort + ForcedTermination
//!     ├─ wait event queue until deadline ── exceeded → abort + EventsDropped
//!     └─ sink.close()
//!   → Stopped
//! ```
//!
//! ## Rules
//! - `STOPPED → STARTING → RUNNING → STOPPING → STOPPED`.
//! - `start()` while Running and `stop()` while Stopped are no-ops.
//! - `start()` during Starting and `stop()` during Stopping wait for the
//!   transition in flight and succeed with it.
//! - `start()` during Stopping and `stop()` during Starting fail with
//!   [`BusError::InvalidStateTransition`].
//! - Shutdown runs in its own task: dropping a `stop()` future does not
//!   interrupt it.
//! - Executions are spawned under the lifecycle lock, so every accepted
//!   execution is waited for (or abandoned) by `stop()` before the sink closes.
//! - One grace period bounds the whole stop: executions first, then the queue.
//! - The registry survives stop/start; `reset()` clears it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::sync::{Semaphore, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::{AbortOnDropHandle, TaskTracker};
use uuid::Uuid;

use crate::core::config::BusConfig;
use crate::core::queue::{Dispatch, EventQueue};
use crate::core::runner::{self, Execution};
use crate::core::session::Session;
use crate::envelopes::{
    Category, Command, CommandPayload, Event, EventPayload, EventsDropped, ForcedTermination,
    Metric, MetricEvent, SessionId, SpanContext, SpanStatus,
};
use crate::error::{BusError, HandlerError};
use crate::handlers::{CommandHandlerRef, EventHandlerRef, HandlerId, Registry};
use crate::observability::{ObservabilitySink, Tracer};

/// Lifecycle state of a [`MessageBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl BusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusState::Stopped => "STOPPED",
            BusState::Starting => "STARTING",
            BusState::Running => "RUNNING",
            BusState::Stopping => "STOPPING",
        }
    }
}

struct InFlight {
    kind: &'static str,
    abort: AbortHandle,
}

/// Resources of one start/stop cycle.
pub(crate) struct Runtime {
    pub(crate) token: CancellationToken,
    pub(crate) semaphore: Option<Arc<Semaphore>>,
    pub(crate) queue: EventQueue,
    tracker: TaskTracker,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
}

impl Runtime {
    fn new(cfg: &BusConfig, registry: Arc<Registry>, sink: Arc<ObservabilitySink>) -> Self {
        Self {
            token: CancellationToken::new(),
            semaphore: cfg.concurrency_limit().map(|n| Arc::new(Semaphore::new(n))),
            queue: EventQueue::spawn(registry, sink),
            tracker: TaskTracker::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a tracked execution; dropping the returned handle aborts it.
    fn spawn_execution<F>(&self, id: Uuid, kind: &'static str, fut: F) -> AbortOnDropHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.tracker.spawn(fut);
        let mut in_flight = self.in_flight();
        in_flight.retain(|_, f| !f.abort.is_finished());
        in_flight.insert(
            id,
            InFlight {
                kind,
                abort: handle.abort_handle(),
            },
        );
        AbortOnDropHandle::new(handle)
    }

    /// Aborts every unfinished execution; returns `"<kind>:<id>"` of each.
    fn abort_in_flight(&self) -> Vec<String> {
        let mut abandoned: Vec<String> = self
            .in_flight()
            .drain()
            .filter(|(_, f)| !f.abort.is_finished())
            .map(|(id, f)| {
                f.abort.abort();
                format!("{}:{id}", f.kind)
            })
            .collect();
        abandoned.sort();
        abandoned
    }
}

struct Lifecycle {
    state: BusState,
    runtime: Option<Arc<Runtime>>,
}

impl Lifecycle {
    /// Runtime of a running bus.
    fn running(&self) -> Result<Arc<Runtime>, BusError> {
        match (self.state, self.runtime.as_ref()) {
            (BusState::Running, Some(rt)) => Ok(Arc::clone(rt)),
            (state, _) => Err(BusError::NotRunning { state }),
        }
    }

    /// Runtime of a bus that still accepts events (running or draining).
    fn accepting(&self) -> Result<Arc<Runtime>, BusError> {
        match (self.state, self.runtime.as_ref()) {
            (BusState::Running | BusState::Stopping, Some(rt)) => Ok(Arc::clone(rt)),
            (state, _) => Err(BusError::NotRunning { state }),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) cfg: BusConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) sink: Arc<ObservabilitySink>,
    pub(crate) tracer: Tracer,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<BusState>,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the state; `lc` must be the guard of `self.lifecycle`.
    fn set_state(&self, lc: &mut Lifecycle, state: BusState) {
        lc.state = state;
        self.state_tx.send_replace(state);
    }

    /// Waits until the bus is in any state other than `state`.
    async fn wait_past(&self, state: BusState) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s != state).await;
    }

    fn accepting(&self) -> Result<Arc<Runtime>, BusError> {
        self.lifecycle().accepting()
    }

    /// Records `event` and, for the `event` category, queues it for handlers.
    pub(crate) fn emit<P: EventPayload>(&self, runtime: &Runtime, event: Event<P>) {
        self.sink.record(&event);
        if P::CATEGORY == Category::Event {
            runtime.queue.enqueue(Dispatch::new(event));
        }
    }

    /// The command's session first, then the global session.
    fn resolve_command<P: CommandPayload>(&self, session: &SessionId) -> Result<CommandHandlerRef<P>, BusError> {
        match self.registry.resolve_command_handler::<P>(session) {
            Ok(handler) => Ok(handler),
            Err(e) if session.is_global() => Err(e),
            Err(e) => self
                .registry
                .resolve_command_handler::<P>(&SessionId::global())
                .map_err(|_| e),
        }
    }

    /// Body of `stop()`, run in its own task: drains `runtime`, closes the
    /// sink and publishes `Stopped`.
    async fn shut_down(&self, runtime: Option<Arc<Runtime>>) {
        tracing::info!(grace = ?self.cfg.grace, "message bus stopping");
        if let Some(runtime) = runtime {
            self.wind_down(&runtime).await;
        }
        self.tracer.clear_open_spans();
        self.sink.close().await;

        let mut lc = self.lifecycle();
        lc.runtime = None;
        self.set_state(&mut lc, BusState::Stopped);
        tracing::info!("message bus stopped");
    }

    async fn wind_down(&self, runtime: &Runtime) {
        let grace_ms = self.cfg.grace_ms();
        let deadline = Instant::now() + self.cfg.grace;

        runtime.token.cancel();
        runtime.tracker.close();
        if tokio::time::timeout_at(deadline, runtime.tracker.wait()).await.is_err() {
            let abandoned = runtime.abort_in_flight();
            tracing::warn!(grace_ms, count = abandoned.len(), "grace exceeded; abandoning executions");
            self.sink.record(&Event::new(
                SessionId::global(),
                ForcedTermination { grace_ms, abandoned },
            ));
            runtime.tracker.wait().await;
        }

        let _ = tokio::time::timeout_at(deadline, runtime.queue.wait_idle()).await;
        let count = runtime.queue.abort();
        if count > 0 {
            tracing::warn!(grace_ms, count, "grace exceeded; dropping queued events");
            self.sink
                .record(&Event::new(SessionId::global(), EventsDropped { count, grace_ms }));
        }
    }
}

/// Puts a bus whose `start()` was dropped mid-way back to `Stopped`.
struct RevertStart<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for RevertStart<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut lc = self.inner.lifecycle();
        if lc.state == BusState::Starting {
            self.inner.set_state(&mut lc, BusState::Stopped);
        }
    }
}

/// In-process command/event bus with a durable observability log.
///
/// Cheap to clone: every clone is a handle to the same bus.
///
/// ## Example
/// ```rust
/// use std::sync::Arc;
/// use msgbus::{BusConfig, Command, CommandPayload, HandlerContext, HandlerError, HandlerFn, MessageBus, SessionId};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Ping;
/// impl CommandPayload for Ping {
///     const KIND: &'static str = "Ping";
///     type Output = String;
/// }
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let dir = tempfile::tempdir()?;
///     let bus = MessageBus::new(BusConfig {
///         log_dir: dir.path().to_path_buf(),
///         ..BusConfig::default()
///     });
///     bus.start().await?;
///
///     let global = SessionId::global();
///     bus.register_command_handler(
///         &global,
///         HandlerFn::arc("ping", |_ctx: HandlerContext, _cmd: Arc<Command<Ping>>| async {
///             Ok::<_, HandlerError>("ok".to_string())
///         }),
///     )?;
///
///     let out = bus.execute(Command::new(global, Ping)).await?;
///     assert_eq!(out, "ok");
///     bus.stop().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl MessageBus {
    /// Builds a stopped bus. The log path is resolved here, once.
    pub fn new(cfg: BusConfig) -> Self {
        let sink = Arc::new(ObservabilitySink::new(cfg.log_path(), cfg.console_options()));
        let tracer = Tracer::new(Arc::clone(&sink), cfg.tracing_enabled);
        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(Registry::new()),
                sink,
                tracer,
                lifecycle: Mutex::new(Lifecycle {
                    state: BusState::Stopped,
                    runtime: None,
                }),
                state_tx: watch::Sender::new(BusState::Stopped),
                cfg,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.cfg
    }

    pub fn state(&self) -> BusState {
        self.inner.lifecycle().state
    }

    /// Path of the observability log.
    pub fn log_path(&self) -> PathBuf {
        self.inner.sink.path().to_path_buf()
    }

    /// True once the observability log failed and records go to the console only.
    pub fn is_log_degraded(&self) -> bool {
        self.inner.sink.is_degraded()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    // ---- lifecycle ----

    /// `STOPPED → STARTING → RUNNING`: opens the sink and spawns the drain task.
    pub async fn start(&self) -> Result<(), BusError> {
        loop {
            {
                let mut lc = self.inner.lifecycle();
                match lc.state {
                    BusState::Running => return Ok(()),
                    BusState::Stopped => {
                        self.inner.set_state(&mut lc, BusState::Starting);
                        break;
                    }
                    BusState::Starting => {}
                    BusState::Stopping => {
                        return Err(BusError::InvalidStateTransition {
                            from: BusState::Stopping,
                            to: BusState::Running,
                        });
                    }
                }
            }
            // Another start() is opening the sink; it either finishes or reverts.
            self.inner.wait_past(BusState::Starting).await;
        }

        let mut revert = RevertStart {
            inner: &self.inner,
            armed: true,
        };
        self.inner.sink.open().await;
        let runtime = Runtime::new(
            &self.inner.cfg,
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.sink),
        );

        let mut lc = self.inner.lifecycle();
        lc.runtime = Some(Arc::new(runtime));
        self.inner.set_state(&mut lc, BusState::Running);
        revert.armed = false;
        tracing::info!(log = %self.inner.sink.path().display(), "message bus started");
        Ok(())
    }

    /// `RUNNING → STOPPING → STOPPED` within the grace period.
    ///
    /// Shutdown runs in a spawned task; this future only waits for it, so
    /// dropping it (e.g. under a timeout) still lets the bus reach `Stopped`.
    pub async fn stop(&self) -> Result<(), BusError> {
        {
            let mut lc = self.inner.lifecycle();
            match lc.state {
                BusState::Stopped => return Ok(()),
                BusState::Stopping => {}
                BusState::Running => {
                    self.inner.set_state(&mut lc, BusState::Stopping);
                    let inner = Arc::clone(&self.inner);
                    let runtime = lc.runtime.clone();
                    tokio::spawn(async move { inner.shut_down(runtime).await });
                }
                BusState::Starting => {
                    return Err(BusError::InvalidStateTransition {
                        from: BusState::Starting,
                        to: BusState::Stopped,
                    });
                }
            }
        }
        self.inner.wait_past(BusState::Stopping).await;
        Ok(())
    }

    /// Stops the bus and clears every session's registrations.
    pub async fn reset(&self) -> Result<(), BusError> {
        self.stop().await?;
        self.inner.registry.clear_all();
        tracing::info!("message bus reset");
        Ok(())
    }

    /// Waits until every queued event has been dispatched (no-op when stopped).
    pub async fn drain(&self) {
        let runtime = self.inner.lifecycle().runtime.clone();
        if let Some(runtime) = runtime {
            runtime.queue.wait_idle().await;
        }
    }

    /// [`drain`](Self::drain), then waits until the log holds every record so far.
    pub async fn flush(&self) {
        self.drain().await;
        self.inner.sink.flush().await;
    }

    // ---- registration ----

    pub fn register_command_handler<P: CommandPayload>(
        &self,
        session: &SessionId,
        handler: CommandHandlerRef<P>,
    ) -> Result<(), BusError> {
        self.inner.registry.register_command_handler(session, handler)
    }

    pub fn register_event_handler<P: EventPayload>(
        &self,
        session: &SessionId,
        handler: EventHandlerRef<P>,
    ) -> HandlerId {
        self.inner.registry.register_event_handler(session, handler)
    }

    pub fn unregister_command_handler<P: CommandPayload>(&self, session: &SessionId) -> bool {
        self.inner.registry.unregister_command_handler::<P>(session)
    }

    pub fn unregister_event_handler(&self, session: &SessionId, id: HandlerId) -> bool {
        self.inner.registry.unregister_event_handler(session, id)
    }

    /// Removes every registration of `session`. Executions that already
    /// resolved their handler finish normally.
    pub fn clear_session(&self, session: &SessionId) {
        self.inner.registry.clear_session(session);
    }

    // ---- submission ----

    /// Executes `command` and returns its handler's output.
    ///
    /// Dropping the returned future cancels the execution; the cancelled
    /// outcome is still recorded.
    pub async fn execute<P: CommandPayload>(&self, command: Command<P>) -> Result<P::Output, BusError> {
        self.execute_with(command, CancellationToken::new()).await
    }

    /// Like [`execute`](Self::execute), cancelled when `token` is.
    pub async fn execute_with<P: CommandPayload>(
        &self,
        command: Command<P>,
        token: CancellationToken,
    ) -> Result<P::Output, BusError> {
        let nested = runner::in_handler();
        let command = Arc::new(command);
        let id = command.id();

        let handle = {
            let lc = self.inner.lifecycle();
            let runtime = lc.running()?;
            self.inner.sink.record(&*command);

            let handler = self.inner.resolve_command::<P>(command.session_id())?;
            let execution = Execution {
                inner: Arc::clone(&self.inner),
                runtime: Arc::clone(&runtime),
                command,
                handler,
                caller: token,
                nested,
            };
            runtime.spawn_execution(id, P::KIND, execution.run())
        };

        match handle.await {
            Ok(res) => res,
            Err(join) => {
                let source = if join.is_panic() {
                    HandlerError::from_panic(join.into_panic())
                } else {
                    HandlerError::Canceled
                };
                Err(BusError::HandlerExecution {
                    command_id: id,
                    kind: P::KIND,
                    source,
                })
            }
        }
    }

    /// Records `event` and queues it for its handlers. Never fails on behalf of a handler.
    pub fn publish<P: EventPayload>(&self, event: Event<P>) -> Result<(), BusError> {
        let runtime = self.inner.accepting()?;
        self.inner.emit(&runtime, event);
        Ok(())
    }

    /// Publishes a single metric sample.
    pub fn emit_metric(&self, session: &SessionId, metric: Metric) -> Result<(), BusError> {
        self.publish(Event::new(session.clone(), MetricEvent::new(vec![metric])))
    }

    // ---- tracing ----

    /// Opens an application span (child of `parent` when given).
    pub fn start_span(&self, session: &SessionId, name: &str, parent: Option<&SpanContext>) -> SpanContext {
        self.inner.tracer.start_span(session, name, parent, Map::new())
    }

    /// Closes a span opened by [`start_span`](Self::start_span).
    pub fn end_span(&self, session: &SessionId, span: &SpanContext, status: SpanStatus) {
        self.inner.tracer.end_span(session, span, status, Map::new());
    }

    // ---- sessions ----

    /// A fresh session owned by the returned handle (cleared on drop).
    pub fn create_session(&self) -> Session {
        Session::owned(self.clone(), SessionId::random())
    }

    /// A handle to `id` that does not own it.
    pub fn session(&self, id: impl Into<SessionId>) -> Session {
        Session::borrowed(self.clone(), id.into())
    }

    /// A handle to the global session.
    pub fn global_session(&self) -> Session {
        Session::borrowed(self.clone(), SessionId::global())
    }
}
