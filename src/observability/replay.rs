//! Reading an observability log back for diagnostics.
//!
//! The log is one JSON [`Record`] per line. Malformed lines (a torn last write,
//! manual edits) are skipped with a warning. Replay is read-only; it does not
//! rehydrate bus state.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use uuid::Uuid;

use crate::envelopes::{Category, SessionId};
use crate::error::SinkError;
use crate::observability::record::Record;

/// Reads every well-formed record of the log at `path`, in file order.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<Record>, SinkError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(&line) {
            Ok(rec) => records.push(rec),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "skipping malformed log line"
            ),
        }
    }
    Ok(records)
}

/// Conjunction of optional criteria over records.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    kind: Option<String>,
    category: Option<Category>,
    session: Option<SessionId>,
    trace_id: Option<Uuid>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn matches(&self, rec: &Record) -> bool {
        self.kind.as_deref().is_none_or(|k| rec.kind == k)
            && self.category.is_none_or(|c| rec.category == c)
            && self.session.as_ref().is_none_or(|s| rec.session_id == *s)
            && self.trace_id.is_none_or(|t| rec.trace_id() == Some(t))
    }

    pub fn apply<'a>(&self, records: &'a [Record]) -> Vec<&'a Record> {
        records.iter().filter(|r| self.matches(r)).collect()
    }
}
