//! # Bus configuration.
//!
//! Provides [`BusConfig`], the settings consumed by [`MessageBus::new`](crate::MessageBus::new).
//!
//! ## Sentinel values
//! - `max_concurrent = 0` → unlimited (no semaphore created)
//! - `log_filename = None` → `events_<YYYYmmdd_HHMMSS>.jsonl`, resolved once when the bus is built
//! - `grace = 0s` → no wait at stop: in-flight executions are abandoned, queued events dropped

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use crate::observability::ConsoleOptions;

/// Configuration of a [`MessageBus`](crate::MessageBus).
///
/// ## Field semantics
/// - `log_dir` / `log_filename`: destination of the observability log (directory created on start)
/// - `console_metrics` / `console_traces`: independent console mirrors (best effort)
/// - `console_capacity`: bounded console queue; records beyond it are dropped for the console
/// - `max_concurrent`: concurrent top-level command executions (`0` = unlimited); excess `execute` calls queue
/// - `grace`: shutdown budget shared by in-flight executions and the event drain
/// - `tracing_enabled`: emit trace spans around command execution
///
/// ## Notes
/// All fields are public. Prefer the helper accessors over sentinel checks.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Directory of the observability log.
    pub log_dir: PathBuf,

    /// File name of the observability log; `None` picks a timestamped name.
    pub log_filename: Option<String>,

    /// Mirror metric records to stdout.
    pub console_metrics: bool,

    /// Mirror trace records to stdout.
    pub console_traces: bool,

    /// Capacity of the console mirror queue (min 1).
    pub console_capacity: usize,

    /// Maximum number of command executions running at once.
    ///
    /// - `0` = unlimited
    /// - `n > 0` = at most `n` handlers run; further `execute` calls wait for a slot
    ///   (the wait is cancellable by the caller)
    ///
    /// Commands executed from inside a running command handler never wait:
    /// they run on the slot of the handler that issued them.
    pub max_concurrent: usize,

    /// Maximum time `stop()` waits for in-flight executions and queued events.
    pub grace: Duration,

    /// Emit `TraceEvent` spans around every command execution.
    pub tracing_enabled: bool,
}

impl BusConfig {
    /// Returns the concurrency limit as an `Option`.
    ///
    /// - `None` → unlimited (no semaphore)
    /// - `Some(n)` → at most `n` concurrent executions
    #[inline]
    pub fn concurrency_limit(&self) -> Option<usize> {
        if self.max_concurrent == 0 {
            None
        } else {
            Some(self.max_concurrent)
        }
    }

    /// Full path of the observability log.
    ///
    /// With `log_filename = None` every call produces a fresh timestamped name;
    /// the bus resolves it once at construction.
    pub fn log_path(&self) -> PathBuf {
        match &self.log_filename {
            Some(name) => self.log_dir.join(name),
            None => self
                .log_dir
                .join(format!("events_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"))),
        }
    }

    /// Console mirror switches for the sink.
    pub(crate) fn console_options(&self) -> ConsoleOptions {
        ConsoleOptions {
            metrics: self.console_metrics,
            traces: self.console_traces,
            capacity: self.console_capacity.max(1),
        }
    }

    /// Grace period in whole milliseconds, as carried by diagnostics.
    pub(crate) fn grace_ms(&self) -> u64 {
        u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for BusConfig {
    /// Default configuration:
    ///
    /// - `log_dir = "logs"`, timestamped file name
    /// - console mirrors off, `console_capacity = 1024`
    /// - `max_concurrent = 64`
    /// - `grace = 5s`
    /// - `tracing_enabled = true`
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            log_filename: None,
            console_metrics: false,
            console_traces: false,
            console_capacity: 1024,
            max_concurrent: 64,
            grace: Duration::from_secs(5),
            tracing_enabled: true,
        }
    }
}
