//! # ObservabilitySink: append-only record log
//!
//! Every envelope that traverses the bus is handed to [`ObservabilitySink::record`].
//! The sink turns it into a [`Record`] (see [`Observable`]), assigns the next
//! sequence number and queues one JSON line for a dedicated writer task.
//!
//! ```text
//!  record(&dyn Observable) ──► Record ──► seq ──► unbounded queue ──► writer task ──► file.jsonl
//!                                              └─► ConsoleMirror (metrics/traces, best effort)
//! ```
//!
//! ## Rules
//! - `record` is synchronous and never fails: the dispatch path never waits on I/O.
//! - Sequence assignment and enqueueing happen under one lock, so file order
//!   equals sequence order equals traversal order.
//! - The durable queue is unbounded (records are never dropped for
//!   backpressure); the console queue is bounded and drops when full.
//! - Any I/O failure puts the sink into *degraded* mode: it is logged once via
//!   `tracing::error!`, later records are discarded for the file, and the bus
//!   keeps running.
//! - `open` is idempotent; `close` drains the queue, flushes and stops the writer.
//!   A closed sink can be opened again (the file is appended to).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::envelopes::Category;
use crate::observability::console::ConsoleMirror;
use crate::observability::record::{Observable, Record};

/// Upper bound of lines written between two flushes of the buffered writer.
const BATCH_LIMIT: usize = 256;

/// Console mirroring switches.
#[derive(Clone, Copy, Debug)]
pub struct ConsoleOptions {
    /// Mirror metric records.
    pub metrics: bool,
    /// Mirror trace records.
    pub traces: bool,
    /// Capacity of the bounded console queue.
    pub capacity: usize,
}

impl ConsoleOptions {
    fn enabled(&self) -> bool {
        self.metrics || self.traces
    }

    fn wants(&self, category: Category) -> bool {
        match category {
            Category::Metric => self.metrics,
            Category::Trace => self.traces,
            _ => false,
        }
    }
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            metrics: false,
            traces: false,
            capacity: 1024,
        }
    }
}

enum SinkMsg {
    Line(String),
    Flush(oneshot::Sender<()>),
}

struct Writer {
    tx: mpsc::UnboundedSender<SinkMsg>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct SinkState {
    open: bool,
    next_seq: u64,
    writer: Option<Writer>,
    console: Option<ConsoleMirror>,
}

/// Durable, append-only recorder of all bus traffic.
pub struct ObservabilitySink {
    path: PathBuf,
    console: ConsoleOptions,
    degraded: Arc<AtomicBool>,
    state: Mutex<SinkState>,
}

impl ObservabilitySink {
    /// Creates a closed sink writing to `path`.
    pub fn new(path: impl Into<PathBuf>, console: ConsoleOptions) -> Self {
        Self {
            path: path.into(),
            console,
            degraded: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SinkState::default()),
        }
    }

    /// Destination of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// True once a write or open failure switched the sink to degraded mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the destination and spawns the writer (and console worker).
    ///
    /// Never fails: if the destination cannot be opened the sink is marked
    /// degraded and accepts records for the console only.
    pub async fn open(&self) {
        if self.is_open() {
            return;
        }

        let writer = match open_file(&self.path).await {
            Ok(file) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let join = tokio::spawn(write_loop(
                    file,
                    rx,
                    Arc::clone(&self.degraded),
                    self.path.clone(),
                ));
                Some(Writer { tx, join })
            }
            Err(e) => {
                degrade(&self.degraded, &self.path, &e);
                None
            }
        };
        let console = self
            .console
            .enabled()
            .then(|| ConsoleMirror::spawn(self.console.capacity));

        let mut state = self.lock();
        if state.open {
            return;
        }
        state.open = true;
        state.writer = writer;
        state.console = console;
        tracing::debug!(path = %self.path.display(), "observability sink opened");
    }

    /// Appends one record. Returns its sequence number, or `None` if the sink is closed.
    pub fn record(&self, item: &dyn Observable) -> Option<u64> {
        let mut rec = Record::capture(item);
        let mut state = self.lock();
        if !state.open {
            tracing::debug!(kind = %rec.kind, id = %rec.id, "record dropped: sink closed");
            return None;
        }

        rec.seq = state.next_seq;
        state.next_seq += 1;

        if let Some(writer) = state.writer.as_ref()
            && !self.degraded.load(Ordering::Acquire)
        {
            match serde_json::to_string(&rec) {
                Ok(mut line) => {
                    line.push('\n');
                    if writer.tx.send(SinkMsg::Line(line)).is_err() {
                        tracing::warn!(kind = %rec.kind, "record dropped: writer stopped");
                    }
                }
                Err(e) => tracing::warn!(kind = %rec.kind, error = %e, "record not encodable"),
            }
        }

        if self.console.wants(rec.category)
            && let Some(console) = state.console.as_ref()
        {
            console.mirror(rec.clone());
        }
        Some(rec.seq)
    }

    /// Waits until every record queued so far reached the file.
    pub async fn flush(&self) {
        let tx = match self.lock().writer.as_ref() {
            Some(w) => w.tx.clone(),
            None => return,
        };
        let (ack, done) = oneshot::channel();
        if tx.send(SinkMsg::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Drains and closes the writer and the console worker. Idempotent.
    pub async fn close(&self) {
        let (writer, console) = {
            let mut state = self.lock();
            state.open = false;
            (state.writer.take(), state.console.take())
        };
        if let Some(Writer { tx, join }) = writer {
            drop(tx);
            if let Err(e) = join.await {
                tracing::error!(error = %e, "observability writer task failed");
            }
        }
        if let Some(console) = console {
            console.shutdown().await;
        }
        tracing::debug!(path = %self.path.display(), "observability sink closed");
    }
}

async fn open_file(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(dir).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

fn degrade(flag: &AtomicBool, path: &Path, err: &dyn std::fmt::Display) {
    if !flag.swap(true, Ordering::AcqRel) {
        tracing::error!(
            path = %path.display(),
            error = %err,
            "observability log unavailable; continuing without durable logging"
        );
    }
}

async fn write_loop(
    file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<SinkMsg>,
    degraded: Arc<AtomicBool>,
    path: PathBuf,
) {
    let mut out = BufWriter::new(file);
    let mut batch = Vec::with_capacity(BATCH_LIMIT);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < BATCH_LIMIT {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }

        let mut acks = Vec::new();
        for msg in batch.drain(..) {
            match msg {
                SinkMsg::Line(line) => {
                    if degraded.load(Ordering::Acquire) {
                        continue;
                    }
                    if let Err(e) = out.write_all(line.as_bytes()).await {
                        degrade(&degraded, &path, &e);
                    }
                }
                SinkMsg::Flush(ack) => acks.push(ack),
            }
        }
        if !degraded.load(Ordering::Acquire)
            && let Err(e) = out.flush().await
        {
            degrade(&degraded, &path, &e);
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }

    if !degraded.load(Ordering::Acquire)
        && let Err(e) = out.flush().await
    {
        degrade(&degraded, &path, &e);
    }
}
