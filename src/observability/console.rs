//! # ConsoleMirror: best-effort human-readable mirror of metric and trace records
//!
//! Records are handed over through a bounded queue to a dedicated worker that
//! prints them to stdout. The caller never waits: when the queue is full the
//! record is dropped for the console only (the durable log is unaffected).
//!
//! ## Example output
//! ```text
//! TRACE START: execute Ping [trace=3f2a9c1e] [span=9d01b7aa] (parent=None)
//! TRACE END: execute Ping [trace=3f2a9c1e] [span=9d01b7aa] OK (0.42ms)
//! METRIC tokens=512 count model=gpt
//! ```

use tokio::{sync::mpsc, task::JoinHandle};

use crate::envelopes::{Category, MetricEvent, MetricValue, TraceEvent};
use crate::observability::record::Record;

/// Bounded queue + printer worker.
pub(crate) struct ConsoleMirror {
    sender: mpsc::Sender<Record>,
    worker: JoinHandle<()>,
}

impl ConsoleMirror {
    /// Spawns the printer worker. Capacity is clamped to a minimum of 1.
    pub(crate) fn spawn(capacity: usize) -> Self {
        let (sender, mut rx) = mpsc::channel::<Record>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(rec) = rx.recv().await {
                println!("{}", render(&rec));
            }
        });
        Self { sender, worker }
    }

    /// Queues a record without waiting; drops it if the queue is full or closed.
    pub(crate) fn mirror(&self, record: Record) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(rec)) => {
                tracing::debug!(kind = %rec.kind, seq = rec.seq, "console mirror dropped record: queue full");
            }
            Err(mpsc::error::TrySendError::Closed(rec)) => {
                tracing::debug!(kind = %rec.kind, seq = rec.seq, "console mirror dropped record: worker closed");
            }
        }
    }

    /// Closes the queue and waits until the worker printed what it holds.
    pub(crate) async fn shutdown(self) {
        drop(self.sender);
        let _ = self.worker.await;
    }
}

fn short(id: &uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Formats one record for humans.
pub(crate) fn render(rec: &Record) -> String {
    match rec.category {
        Category::Trace => match rec.payload_as::<TraceEvent>() {
            Some(t) if t.is_start() => format!(
                "TRACE START: {} [trace={}] [span={}] (parent={})",
                t.name,
                short(&t.span.trace_id),
                short(&t.span.span_id),
                t.span.parent_span_id.as_ref().map_or_else(|| "None".to_string(), short),
            ),
            Some(t) if t.is_end() => {
                let status = t.status.map_or("UNKNOWN", |s| s.as_str());
                let duration = t
                    .duration_ms
                    .map(|d| format!(" ({d:.2}ms)"))
                    .unwrap_or_default();
                format!(
                    "TRACE END: {} [trace={}] [span={}] {status}{duration}",
                    t.name,
                    short(&t.span.trace_id),
                    short(&t.span.span_id),
                )
            }
            Some(t) => format!(
                "TRACE EVENT: {} [trace={}] [span={}]",
                t.name,
                short(&t.span.trace_id),
                short(&t.span.span_id)
            ),
            None => fallback(rec),
        },
        Category::Metric => match rec.payload_as::<MetricEvent>() {
            Some(m) => {
                let parts: Vec<String> = m
                    .metrics
                    .iter()
                    .map(|metric| {
                        let value = match &metric.value {
                            MetricValue::Number(n) => n.to_string(),
                            MetricValue::Text(s) => s.clone(),
                        };
                        let unit = metric.unit.as_ref().map(|u| format!(" {u}")).unwrap_or_default();
                        let tags: String = metric.tags.iter().map(|(k, v)| format!(" {k}={v}")).collect();
                        format!("METRIC {}={value}{unit}{tags}", metric.name)
                    })
                    .collect();
                parts.join(", ")
            }
            None => fallback(rec),
        },
        _ => fallback(rec),
    }
}

fn fallback(rec: &Record) -> String {
    format!("[{}] {} id={}", rec.category.as_str(), rec.kind, rec.id)
}
