//! Change and task recording.
//!
//! The daemon records operator-visible operations (service starts and
//! stops, check recovery attempts) through a [`ChangeSink`]. Persistent
//! change tracking lives outside the core; embedders without it can use
//! [`NoopChangeSink`] and the supervision semantics are unaffected.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

/// Identifier of a recorded change.
pub type ChangeId = String;

/// Kind string used for the change opened when a check starts failing.
pub const RECOVER_CHECK_KIND: &str = "recover-check";

/// Kind string for per-failure tasks inside a recover change.
pub const CHECK_FAILURE_KIND: &str = "check-failure";

/// Destination for change and task records.
pub trait ChangeSink: Send + Sync {
    /// Opens a change and returns its identifier.
    fn open_change(&self, kind: &str, summary: &str) -> ChangeId;

    /// Appends a task with a log line to an open change.
    fn append_task(&self, change: &ChangeId, kind: &str, message: &str, details: Option<&str>);

    /// Closes a change, recording whether it ended well.
    fn close_change(&self, change: &ChangeId, ok: bool);
}

/// Discards every record. For embedders without task machinery.
#[derive(Debug, Default)]
pub struct NoopChangeSink {
    counter: AtomicU64,
}

impl ChangeSink for NoopChangeSink {
    fn open_change(&self, _kind: &str, _summary: &str) -> ChangeId {
        // Ids still have to be unique; callers hold on to them.
        (self.counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn append_task(
        &self,
        _change: &ChangeId,
        _kind: &str,
        _message: &str,
        _details: Option<&str>,
    ) {
    }

    fn close_change(&self, _change: &ChangeId, _ok: bool) {}
}

/// One recorded task inside a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// Task kind (e.g. "check-failure").
    pub kind: String,
    /// Log line for the task.
    pub message: String,
    /// Optional multi-line details.
    pub details: Option<String>,
}

/// One recorded change and its tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// The change identifier handed back to the caller.
    pub id: ChangeId,
    /// Change kind (e.g. "recover-check", "start").
    pub kind: String,
    /// Human-readable summary.
    pub summary: String,
    /// Tasks appended so far.
    pub tasks: Vec<TaskRecord>,
    /// Whether the change has been closed, and how.
    pub outcome: Option<bool>,
}

/// Keeps every record in memory. Used by the daemon by default and by
/// tests asserting on recorded history.
#[derive(Debug, Default)]
pub struct MemoryChangeSink {
    counter: AtomicU64,
    records: Mutex<Vec<ChangeRecord>>,
}

impl MemoryChangeSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records so far.
    pub fn records(&self) -> Vec<ChangeRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Snapshot of records of one kind.
    pub fn records_of_kind(&self, kind: &str) -> Vec<ChangeRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.kind == kind)
            .collect()
    }
}

impl ChangeSink for MemoryChangeSink {
    fn open_change(&self, kind: &str, summary: &str) -> ChangeId {
        let id = (self.counter.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.records.lock().unwrap().push(ChangeRecord {
            id: id.clone(),
            kind: kind.to_string(),
            summary: summary.to_string(),
            tasks: Vec::new(),
            outcome: None,
        });
        id
    }

    fn append_task(
        &self,
        change: &ChangeId,
        kind: &str,
        message: &str,
        details: Option<&str>,
    ) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|record| &record.id == change) {
            record.tasks.push(TaskRecord {
                kind: kind.to_string(),
                message: message.to_string(),
                details: details.map(str::to_string),
            });
        }
    }

    fn close_change(&self, change: &ChangeId, ok: bool) {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.iter_mut().find(|record| &record.id == change) {
            record.outcome = Some(ok);
        }
    }
}

/// Convenience alias used throughout the managers.
pub type SharedSink = Arc<dyn ChangeSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_tracks_lifecycle() {
        let sink = MemoryChangeSink::new();

        let id = sink.open_change(RECOVER_CHECK_KIND, "recover check \"ping\"");
        sink.append_task(&id, CHECK_FAILURE_KIND, "connection refused", None);
        sink.append_task(
            &id,
            CHECK_FAILURE_KIND,
            "connection refused",
            Some("dial tcp: refused"),
        );
        sink.close_change(&id, true);

        let records = sink.records_of_kind(RECOVER_CHECK_KIND);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tasks.len(), 2);
        assert_eq!(records[0].outcome, Some(true));
        assert_eq!(
            records[0].tasks[1].details.as_deref(),
            Some("dial tcp: refused")
        );
    }

    #[test]
    fn change_ids_are_unique() {
        let sink = NoopChangeSink::default();
        let a = sink.open_change("start", "start services");
        let b = sink.open_change("start", "start services");
        assert_ne!(a, b);
    }
}
