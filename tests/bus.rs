use std::sync::{Arc, Mutex};
use std::time::Duration;

use msgbus::observability::{RecordFilter, read_records};
use msgbus::{
    BusConfig, BusError, BusState, Category, Command, CommandErrorEvent, CommandHandlerRef,
    CommandPayload, CommandResultEvent, ErrorKind, Event, EventHandlerRef, EventPayload,
    HandlerContext, HandlerError, HandlerFn, MessageBus, Metric, Record, SessionId, SpanStatus,
    TraceEvent,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Serialize)]
struct Ping;
impl CommandPayload for Ping {
    const KIND: &'static str = "Ping";
    type Output = String;
}

#[derive(Serialize)]
struct Unregistered;
impl CommandPayload for Unregistered {
    const KIND: &'static str = "Unregistered";
    type Output = ();
}

#[derive(Serialize)]
struct Explode;
impl CommandPayload for Explode {
    const KIND: &'static str = "Explode";
    type Output = ();
}

#[derive(Serialize)]
struct Sleep(u64);
impl CommandPayload for Sleep {
    const KIND: &'static str = "Sleep";
    type Output = ();
}

/// Executes a `Ping` from inside its own handler.
#[derive(Serialize)]
struct Relay;
impl CommandPayload for Relay {
    const KIND: &'static str = "Relay";
    type Output = String;
}

#[derive(Serialize)]
struct Tick(u32);
impl EventPayload for Tick {
    const KIND: &'static str = "Tick";
}

fn bus_in(dir: &tempfile::TempDir) -> MessageBus {
    bus_with(dir, |_| {})
}

fn bus_with(dir: &tempfile::TempDir, tweak: impl FnOnce(&mut BusConfig)) -> MessageBus {
    let mut cfg = BusConfig {
        log_dir: dir.path().to_path_buf(),
        log_filename: Some("events.jsonl".into()),
        grace: Duration::from_millis(300),
        ..BusConfig::default()
    };
    tweak(&mut cfg);
    MessageBus::new(cfg)
}

fn ping(reply: &'static str) -> CommandHandlerRef<Ping> {
    HandlerFn::arc("ping", move |_ctx: HandlerContext, _cmd: Arc<Command<Ping>>| async move {
        Ok::<_, HandlerError>(reply.to_string())
    })
}

fn sleeper() -> CommandHandlerRef<Sleep> {
    HandlerFn::arc("sleep", |ctx: HandlerContext, cmd: Arc<Command<Sleep>>| async move {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(cmd.payload().0)) => Ok(()),
            _ = ctx.cancelled() => Err(HandlerError::Canceled),
        }
    })
}

fn records(bus: &MessageBus) -> Vec<Record> {
    read_records(bus.log_path()).unwrap()
}

#[tokio::test]
async fn ping_returns_ok_and_logs_four_records() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(&SessionId::global(), ping("ok"))
        .unwrap();
    bus.start().await.unwrap();

    let cmd = Command::new(SessionId::global(), Ping);
    let id = cmd.id();
    assert_eq!(bus.execute(cmd).await.unwrap(), "ok");
    bus.stop().await.unwrap();

    let recs = records(&bus);
    assert_eq!(recs.len(), 4);

    assert_eq!(recs[0].kind, "Ping");
    assert_eq!(recs[0].id, id);

    let start: TraceEvent = recs[1].payload_as().unwrap();
    assert!(start.is_start());
    assert_eq!(start.attributes["command_id"], id.to_string());

    assert_eq!(recs[2].kind, "CommandResultEvent");
    let result: CommandResultEvent = recs[2].payload_as().unwrap();
    assert_eq!(result.command_id, id);
    assert_eq!(result.result, "ok");

    let end: TraceEvent = recs[3].payload_as().unwrap();
    assert!(end.is_end());
    assert_eq!(end.status, Some(SpanStatus::Ok));
    assert_eq!(end.span, start.span);
    assert!(end.duration_ms.is_some());
    assert_eq!(recs[2].parent_span.as_ref(), Some(&start.span));
}

#[tokio::test]
async fn unregistered_command_logs_only_itself() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.start().await.unwrap();

    let err = bus
        .execute(Command::new(SessionId::global(), Unregistered))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::NoHandlerRegistered { kind: "Unregistered", .. }));
    bus.stop().await.unwrap();

    let recs = records(&bus);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].kind, "Unregistered");
}

#[tokio::test]
async fn handler_failure_reaches_caller_and_log() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(
        &SessionId::global(),
        HandlerFn::arc("explode", |_ctx: HandlerContext, _cmd: Arc<Command<Explode>>| async {
            Err::<(), _>(HandlerError::fail("kaboom"))
        }),
    )
    .unwrap();
    bus.start().await.unwrap();

    let cmd = Command::new(SessionId::global(), Explode);
    let id = cmd.id();
    let err = bus.execute(cmd).await.unwrap_err();
    assert_eq!(err.as_label(), "handler_execution");
    assert_eq!(err.handler_error(), Some(&HandlerError::fail("kaboom")));
    bus.stop().await.unwrap();

    let recs = records(&bus);
    let failures = RecordFilter::new().kind("CommandErrorEvent").apply(&recs);
    assert_eq!(failures.len(), 1);
    let failure: CommandErrorEvent = failures[0].payload_as().unwrap();
    assert_eq!(failure.command_id, id);
    assert_eq!(failure.error.kind, ErrorKind::Failed);
    assert!(failure.error.message.contains("kaboom"));

    let end: TraceEvent = recs.last().unwrap().payload_as().unwrap();
    assert_eq!(end.status, Some(SpanStatus::Error));
}

#[tokio::test]
async fn handler_panic_is_reported_as_failure() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(
        &SessionId::global(),
        HandlerFn::arc("explode", |_ctx: HandlerContext, cmd: Arc<Command<Explode>>| async move {
            if cmd.session_id().is_global() {
                panic!("handler blew up");
            }
            Ok::<(), HandlerError>(())
        }),
    )
    .unwrap();
    bus.start().await.unwrap();

    let err = bus
        .execute(Command::new(SessionId::global(), Explode))
        .await
        .unwrap_err();
    assert!(matches!(err.handler_error(), Some(HandlerError::Panicked { .. })));
    assert_eq!(bus.state(), BusState::Running);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn event_handlers_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let session = SessionId::from("fanout");

    for (name, fail) in [("first", false), ("second", true), ("third", false), ("fourth", true)] {
        let seen = Arc::clone(&seen);
        let handler: EventHandlerRef<Tick> =
            HandlerFn::arc(name, move |_ctx: HandlerContext, _ev: Arc<Event<Tick>>| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(name);
                    if fail {
                        Err(HandlerError::fail(format!("{name} failed")))
                    } else {
                        Ok(())
                    }
                }
            });
        bus.register_event_handler(&session, handler);
    }
    bus.start().await.unwrap();

    bus.publish(Event::new(session.clone(), Tick(1))).unwrap();
    bus.drain().await;
    assert_eq!(*seen.lock().unwrap(), ["first", "second", "third", "fourth"]);
    bus.stop().await.unwrap();

    let recs = records(&bus);
    let diagnostics = RecordFilter::new()
        .category(Category::Diagnostic)
        .kind("EventHandlerError")
        .apply(&recs);
    assert_eq!(diagnostics.len(), 2);
    assert_eq!(diagnostics[0].payload["handler"], "second");
    assert_eq!(diagnostics[1].payload["handler"], "fourth");
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.start().await.unwrap();
    bus.start().await.unwrap();
    bus.emit_metric(&SessionId::global(), Metric::new("once", 1u64))
        .unwrap();
    bus.stop().await.unwrap();
    bus.stop().await.unwrap();
    assert_eq!(bus.state(), BusState::Stopped);

    let recs = records(&bus);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].category, Category::Metric);
}

#[tokio::test]
async fn clear_session_is_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    let s1 = SessionId::from("s1");
    let s2 = SessionId::from("s2");
    bus.register_command_handler(&s1, ping("one")).unwrap();
    bus.register_command_handler(&s2, ping("two")).unwrap();
    assert!(matches!(
        bus.register_command_handler(&s1, ping("again")),
        Err(BusError::DuplicateHandler { .. })
    ));
    bus.start().await.unwrap();

    bus.clear_session(&s1);
    assert!(matches!(
        bus.execute(Command::new(s1.clone(), Ping)).await,
        Err(BusError::NoHandlerRegistered { .. })
    ));
    assert_eq!(bus.execute(Command::new(s2, Ping)).await.unwrap(), "two");
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn session_handlers_precede_global_ones() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(&SessionId::global(), ping("global"))
        .unwrap();
    let session = bus.create_session();
    session.register_command_handler(ping("local")).unwrap();
    bus.start().await.unwrap();

    assert_eq!(session.execute(Ping).await.unwrap(), "local");
    let id = session.id().clone();
    drop(session);
    assert_eq!(bus.execute(Command::new(id, Ping)).await.unwrap(), "global");
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn caller_cancellation_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(&SessionId::global(), sleeper())
        .unwrap();
    bus.start().await.unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = bus
        .execute_with(Command::new(SessionId::global(), Sleep(10_000)), token)
        .await
        .unwrap_err();
    assert_eq!(err.handler_error(), Some(&HandlerError::Canceled));
    bus.stop().await.unwrap();

    let recs = records(&bus);
    let failure: CommandErrorEvent = RecordFilter::new().kind("CommandErrorEvent").apply(&recs)[0]
        .payload_as()
        .unwrap();
    assert_eq!(failure.error.kind, ErrorKind::Cancelled);
    let end: TraceEvent = recs.last().unwrap().payload_as().unwrap();
    assert_eq!(end.status, Some(SpanStatus::Cancelled));
}

#[tokio::test]
async fn dropped_execute_future_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(&SessionId::global(), sleeper())
        .unwrap();
    bus.start().await.unwrap();

    let timed = tokio::time::timeout(
        Duration::from_millis(20),
        bus.execute(Command::new(SessionId::global(), Sleep(10_000))),
    )
    .await;
    assert!(timed.is_err());
    bus.stop().await.unwrap();

    let recs = records(&bus);
    let failures = RecordFilter::new().kind("CommandErrorEvent").apply(&recs);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].payload["error"]["kind"], "cancelled");
}

#[tokio::test]
async fn stop_cancels_cooperative_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(&SessionId::global(), sleeper())
        .unwrap();
    bus.start().await.unwrap();

    let pending = tokio::spawn({
        let bus = bus.clone();
        async move { bus.execute(Command::new(SessionId::global(), Sleep(10_000))).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.stop().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.handler_error(), Some(&HandlerError::Canceled));
    let recs = records(&bus);
    assert!(RecordFilter::new().kind("ForcedTermination").apply(&recs).is_empty());
}

#[tokio::test]
async fn stop_abandons_stuck_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_with(&dir, |cfg| cfg.grace = Duration::from_millis(50));
    bus.register_command_handler(
        &SessionId::global(),
        HandlerFn::arc("stuck", |_ctx: HandlerContext, _cmd: Arc<Command<Sleep>>| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), HandlerError>(())
        }),
    )
    .unwrap();
    bus.start().await.unwrap();

    let pending = tokio::spawn({
        let bus = bus.clone();
        async move { bus.execute(Command::new(SessionId::global(), Sleep(0))).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.stop().await.unwrap();
    assert!(pending.await.unwrap().is_err());

    let recs = records(&bus);
    let forced = RecordFilter::new().kind("ForcedTermination").apply(&recs);
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].payload["abandoned"].as_array().unwrap().len(), 1);
    let failures = RecordFilter::new().kind("CommandErrorEvent").apply(&recs);
    assert_eq!(failures.len(), 1);
}

#[tokio::test]
async fn events_left_after_grace_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_with(&dir, |cfg| cfg.grace = Duration::from_millis(50));
    let slow: EventHandlerRef<Tick> =
        HandlerFn::arc("slow", |_ctx: HandlerContext, _ev: Arc<Event<Tick>>| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), HandlerError>(())
        });
    bus.register_event_handler(&SessionId::global(), slow);
    bus.start().await.unwrap();

    for n in 0..3 {
        bus.publish(Event::new(SessionId::global(), Tick(n))).unwrap();
    }
    bus.stop().await.unwrap();

    let recs = records(&bus);
    let dropped = RecordFilter::new().kind("EventsDropped").apply(&recs);
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].payload["count"], 3);
}

#[tokio::test]
async fn concurrency_limit_queues_executions() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_with(&dir, |cfg| cfg.max_concurrent = 1);
    let running = Arc::new(Mutex::new((0usize, 0usize)));
    let counter = Arc::clone(&running);
    bus.register_command_handler(
        &SessionId::global(),
        HandlerFn::arc("counter", move |_ctx: HandlerContext, _cmd: Arc<Command<Sleep>>| {
            let counter = Arc::clone(&counter);
            async move {
                {
                    let mut g = counter.lock().unwrap();
                    g.0 += 1;
                    g.1 = g.1.max(g.0);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.lock().unwrap().0 -= 1;
                Ok::<(), HandlerError>(())
            }
        }),
    )
    .unwrap();
    bus.start().await.unwrap();

    let calls = (0..4).map(|_| bus.execute(Command::new(SessionId::global(), Sleep(0))));
    for res in futures::future::join_all(calls).await {
        res.unwrap();
    }
    assert_eq!(running.lock().unwrap().1, 1);
    bus.stop().await.unwrap();
}

#[tokio::test]
async fn publish_is_rejected_when_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    let err = bus
        .publish(Event::new(SessionId::global(), Tick(0)))
        .unwrap_err();
    assert!(matches!(err, BusError::NotRunning { state: BusState::Stopped }));
}

#[tokio::test]
async fn nested_commands_share_a_trace() {
    #[derive(Serialize)]
    struct Outer;
    impl CommandPayload for Outer {
        const KIND: &'static str = "Outer";
        type Output = String;
    }

    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(&SessionId::global(), ping("inner"))
        .unwrap();
    let inner_bus = bus.clone();
    bus.register_command_handler(
        &SessionId::global(),
        HandlerFn::arc("outer", move |ctx: HandlerContext, _cmd: Arc<Command<Outer>>| {
            let bus = inner_bus.clone();
            async move {
                let mut cmd = Command::new(ctx.session().clone(), Ping);
                if let Some(span) = ctx.span() {
                    cmd = cmd.child_of(span);
                }
                bus.execute(cmd).await.map_err(HandlerError::fail)
            }
        }),
    )
    .unwrap();
    bus.start().await.unwrap();

    assert_eq!(
        bus.execute(Command::new(SessionId::global(), Outer)).await.unwrap(),
        "inner"
    );
    bus.stop().await.unwrap();

    let recs = records(&bus);
    let outer_start: TraceEvent = recs[1].payload_as().unwrap();
    let traced = RecordFilter::new()
        .category(Category::Trace)
        .trace_id(outer_start.span.trace_id)
        .apply(&recs);
    assert_eq!(traced.len(), 4);
}

fn relay(bus: &MessageBus) -> CommandHandlerRef<Relay> {
    let bus = bus.clone();
    HandlerFn::arc("relay", move |ctx: HandlerContext, _cmd: Arc<Command<Relay>>| {
        let bus = bus.clone();
        async move {
            bus.execute(Command::new(ctx.session().clone(), Ping))
                .await
                .map_err(HandlerError::fail)
        }
    })
}

#[tokio::test]
async fn nested_command_does_not_wait_for_a_slot() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_with(&dir, |cfg| cfg.max_concurrent = 1);
    bus.register_command_handler(&SessionId::global(), ping("inner"))
        .unwrap();
    bus.register_command_handler(&SessionId::global(), relay(&bus))
        .unwrap();
    bus.start().await.unwrap();

    let calls = (0..3).map(|_| bus.execute(Command::new(SessionId::global(), Relay)));
    let results = tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(calls))
        .await
        .expect("nested executions must not deadlock at the limit");
    for res in results {
        assert_eq!(res.unwrap(), "inner");
    }
    bus.stop().await.unwrap();

    let recs = records(&bus);
    let results = RecordFilter::new().kind("CommandResultEvent").apply(&recs);
    assert_eq!(results.len(), 6);
}

#[tokio::test]
async fn every_accepted_command_is_settled_when_stop_races() {
    let dir = tempfile::tempdir().unwrap();
    let bus = bus_in(&dir);
    bus.register_command_handler(&SessionId::global(), sleeper())
        .unwrap();
    bus.start().await.unwrap();

    let callers: Vec<_> = (0..32)
        .map(|n| {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(n % 8)).await;
                bus.execute(Command::new(SessionId::global(), Sleep(5))).await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(3)).await;
    bus.stop().await.unwrap();

    let mut rejected = 0;
    for caller in callers {
        if let Err(BusError::NotRunning { .. }) = caller.await.unwrap() {
            rejected += 1;
        }
    }

    let recs = records(&bus);
    let commands: Vec<&Record> = recs.iter().filter(|r| r.category == Category::Command).collect();
    assert_eq!(commands.len() + rejected, 32);
    for cmd in commands {
        let outcomes = recs
            .iter()
            .filter(|r| r.is_kind("CommandResultEvent") || r.is_kind("CommandErrorEvent"))
            .filter(|r| r.payload["command_id"] == cmd.id.to_string())
            .count();
        assert_eq!(outcomes, 1, "command {} has {outcomes} outcome records", cmd.id);
    }
}
