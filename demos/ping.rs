//! # Example: Ping
//!
//! Registers a command handler and an event subscriber in a session, executes
//! a few commands, emits a metric and prints the resulting observability log.
//!
//! ```text
//! cargo run --example ping
//! RUST_LOG=debug cargo run --example ping
//! ```

use std::{sync::Arc, time::Duration};

use msgbus::{
    BusConfig, Command, CommandPayload, CommandResultEvent, Event, EventHandlerRef, HandlerContext,
    HandlerError, HandlerFn, MessageBus, Metric, SpanStatus, observability::read_records,
};
use serde::Serialize;

#[derive(Serialize)]
struct Ping {
    n: u32,
}

impl CommandPayload for Ping {
    const KIND: &'static str = "Ping";
    type Output = String;
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    msgbus::logging::init();

    let dir = std::env::temp_dir().join("msgbus-ping");
    let bus = MessageBus::new(BusConfig {
        log_dir: dir,
        console_traces: true,
        console_metrics: true,
        grace: Duration::from_secs(2),
        ..BusConfig::default()
    });
    bus.start().await?;

    let session = bus.create_session();
    session.register_command_handler(HandlerFn::arc(
        "pong",
        |_ctx: HandlerContext, cmd: Arc<Command<Ping>>| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if cmd.payload().n == 3 {
                return Err(HandlerError::fail("three is unlucky"));
            }
            Ok(format!("pong #{}", cmd.payload().n))
        },
    ))?;

    let results: EventHandlerRef<CommandResultEvent> = HandlerFn::arc(
        "results",
        |_ctx: HandlerContext, ev: Arc<Event<CommandResultEvent>>| async move {
            println!("[results] {} -> {}", ev.payload().command_kind, ev.payload().result);
            Ok::<(), HandlerError>(())
        },
    );
    session.register_event_handler(results);

    let span = bus.start_span(session.id(), "demo", None);
    for n in 1..=4 {
        let cmd = session.command(Ping { n }).child_of(&span);
        match bus.execute(cmd).await {
            Ok(reply) => println!("[main] {reply}"),
            Err(e) => println!("[main] {}: {}", e.as_label(), e.as_message()),
        }
    }
    bus.emit_metric(session.id(), Metric::new("pings", 4u64).with_unit("count"))?;
    bus.end_span(session.id(), &span, SpanStatus::Ok);

    session.close();
    bus.stop().await?;

    let records = read_records(bus.log_path())?;
    println!("\n{} records in {}", records.len(), bus.log_path().display());
    for rec in records {
        println!("{:>3} {:<10} {}", rec.seq, rec.category.as_str(), rec.kind);
    }
    Ok(())
}
