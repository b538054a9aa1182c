//! Shared task table.
//!
//! Every status change goes through here, under one lock, and is published
//! while the lock is held. Subscribers therefore see each task's transitions
//! in the order they happened.

use super::types::{Task, TaskEvent, TaskId, TaskKind, TaskOutput, TaskProgress, TaskSpec, TaskStatus};
use crate::cancel::CancellationToken;
use crate::error::{AtelierError, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

struct TaskRecord {
    task: Task,
    cancel: CancellationToken,
    watch: watch::Sender<Task>,
    dedup_key: (TaskKind, String),
}

impl TaskRecord {
    fn publish(&self, events: &broadcast::Sender<TaskEvent>) {
        // No subscribers is fine.
        let _ = events.send(TaskEvent::from(&self.task));
        self.watch.send_replace(self.task.clone());
    }
}

#[derive(Default)]
struct TableInner {
    tasks: HashMap<TaskId, TaskRecord>,
    /// Submission order, for listing
    order: Vec<TaskId>,
    /// Dedup index over queued and running tasks
    in_flight: HashMap<(TaskKind, String), TaskId>,
}

/// Outcome of [`TaskTable::insert_or_attach`].
pub(crate) struct Admission {
    pub id: TaskId,
    /// `false` when the spec attached to an in-flight task
    pub created: bool,
}

pub(crate) struct TaskTable {
    inner: Mutex<TableInner>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskTable {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Mutex::new(TableInner::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        // A panic while holding the lock leaves the table itself consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Register `spec`, or attach to the in-flight task of the same kind
    /// admitted under `key`.
    pub fn insert_or_attach(&self, spec: &TaskSpec, key: String) -> Admission {
        let dedup_key = (spec.kind(), key);
        let mut inner = self.lock();

        let existing = inner.in_flight.get(&dedup_key).copied();
        if let Some(id) = existing {
            if let Some(record) = inner.tasks.get_mut(&id) {
                record.task.observers += 1;
                debug!(
                    "Attached to in-flight {} task {} ({} observers)",
                    record.task.kind, id, record.task.observers
                );
                record.watch.send_replace(record.task.clone());
                return Admission { id, created: false };
            }
        }

        let id = TaskId::new();
        let task = Task::queued(id, spec);
        let (watch, _) = watch::channel(task.clone());
        let record = TaskRecord {
            task,
            cancel: CancellationToken::new(),
            watch,
            dedup_key: dedup_key.clone(),
        };
        record.publish(&self.events);
        inner.tasks.insert(id, record);
        inner.order.push(id);
        inner.in_flight.insert(dedup_key, id);
        Admission { id, created: true }
    }

    /// Move a queued task to running. Returns its cancellation token, or
    /// `None` if the task is no longer queued (cancelled while waiting).
    pub fn start(&self, id: TaskId) -> Option<CancellationToken> {
        let mut inner = self.lock();
        let record = inner.tasks.get_mut(&id)?;
        if record.task.status != TaskStatus::Queued {
            return None;
        }
        record.task.status = TaskStatus::Running;
        record.task.started_at = Some(Utc::now());
        record.publish(&self.events);
        Some(record.cancel.clone())
    }

    pub fn set_progress(&self, id: TaskId, progress: TaskProgress) {
        let mut inner = self.lock();
        let Some(record) = inner.tasks.get_mut(&id) else {
            return;
        };
        if record.task.status != TaskStatus::Running || record.task.progress == progress {
            return;
        }
        record.task.progress = progress;
        record.publish(&self.events);
    }

    /// Record the terminal outcome of a running task.
    pub fn finish(&self, id: TaskId, result: Result<TaskOutput>) {
        let mut inner = self.lock();
        let Some(record) = inner.tasks.get_mut(&id) else {
            warn!("Finished task {} is no longer in the table", id);
            return;
        };
        if record.task.is_terminal() {
            return;
        }

        match result {
            Ok(output) => {
                record.task.status = TaskStatus::Succeeded;
                if !matches!(output, TaskOutput::Scanned { .. }) {
                    record.task.progress = TaskProgress::percent(100.0);
                }
                record.task.output = Some(output);
            }
            Err(e) => {
                record.task.status = TaskStatus::from_error(&e);
                record.task.error = Some(e.to_string());
            }
        }
        record.task.finished_at = Some(Utc::now());
        record.publish(&self.events);

        let dedup_key = record.dedup_key.clone();
        if inner.in_flight.get(&dedup_key) == Some(&id) {
            inner.in_flight.remove(&dedup_key);
        }
    }

    /// Request cancellation. A queued task is cancelled on the spot; a
    /// running one is signalled and reaches `Cancelled` when its worker
    /// notices. Returns `false` for tasks already in a terminal state.
    pub fn cancel(&self, id: TaskId) -> Result<bool> {
        let mut inner = self.lock();
        let record = inner.tasks.get_mut(&id).ok_or_else(|| AtelierError::NotFound {
            what: format!("task {}", id),
        })?;

        match record.task.status {
            TaskStatus::Queued => {
                record.cancel.cancel();
                record.task.status = TaskStatus::Cancelled;
                record.task.error = Some(AtelierError::Cancelled.to_string());
                record.task.finished_at = Some(Utc::now());
                record.publish(&self.events);
                let dedup_key = record.dedup_key.clone();
                if inner.in_flight.get(&dedup_key) == Some(&id) {
                    inner.in_flight.remove(&dedup_key);
                }
                Ok(true)
            }
            TaskStatus::Running => {
                record.cancel.cancel();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Cancel every queued or running task.
    pub fn cancel_all(&self) {
        let ids: Vec<TaskId> = {
            let inner = self.lock();
            inner
                .tasks
                .values()
                .filter(|r| !r.task.is_terminal())
                .map(|r| r.task.id)
                .collect()
        };
        for id in ids {
            let _ = self.cancel(id);
        }
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&id).map(|r| r.task.clone())
    }

    /// Snapshots in submission order.
    pub fn list(&self) -> Vec<Task> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .map(|r| r.task.clone())
            .collect()
    }

    pub fn watch(&self, id: TaskId) -> Option<watch::Receiver<Task>> {
        self.lock().tasks.get(&id).map(|r| r.watch.subscribe())
    }

    /// Drop terminal tasks. Returns how many were removed.
    pub fn clear_done(&self) -> usize {
        let mut inner = self.lock();
        let done: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|r| r.task.is_terminal())
            .map(|r| r.task.id)
            .collect();
        for id in &done {
            inner.tasks.remove(id);
        }
        inner.order.retain(|id| !done.contains(id));
        done.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn hash_spec(path: &str) -> TaskSpec {
        TaskSpec::Hash {
            path: PathBuf::from(path),
        }
    }

    fn admit(table: &TaskTable, path: &str) -> Admission {
        let spec = hash_spec(path);
        table.insert_or_attach(&spec, spec.key())
    }

    #[test]
    fn test_dedup_attaches() {
        let table = TaskTable::new(16);
        let first = admit(&table, "/a");
        let second = admit(&table, "/a");
        let other = admit(&table, "/b");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert_eq!(table.get(first.id).unwrap().observers, 2);
        assert_eq!(table.list().len(), 2);
    }

    #[test]
    fn test_shared_key_attaches_across_paths() {
        let table = TaskTable::new(16);
        let first = table.insert_or_attach(&hash_spec("/a"), "abc:5".to_string());
        let copy = table.insert_or_attach(&hash_spec("/copy/a"), "abc:5".to_string());
        assert_eq!(first.id, copy.id);
        assert!(!copy.created);
        assert_eq!(table.get(first.id).unwrap().key, "/a");

        table.start(first.id).unwrap();
        table.finish(first.id, Err(AtelierError::Other("disk".into())));
        let later = table.insert_or_attach(&hash_spec("/copy/a"), "abc:5".to_string());
        assert!(later.created);
    }

    #[test]
    fn test_finished_key_can_run_again() {
        let table = TaskTable::new(16);
        let first = admit(&table, "/a");
        table.start(first.id).unwrap();
        table.finish(first.id, Err(AtelierError::Other("disk".into())));

        let again = admit(&table, "/a");
        assert!(again.created);
        assert_ne!(again.id, first.id);
        let failed = table.get(first.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk"));
    }

    #[test]
    fn test_cancel_queued_is_immediate() {
        let table = TaskTable::new(16);
        let admission = admit(&table, "/a");
        assert!(table.cancel(admission.id).unwrap());
        assert_eq!(table.get(admission.id).unwrap().status, TaskStatus::Cancelled);
        assert!(table.start(admission.id).is_none());
        assert!(!table.cancel(admission.id).unwrap());
    }

    #[test]
    fn test_cancel_running_signals_token() {
        let table = TaskTable::new(16);
        let admission = admit(&table, "/a");
        let token = table.start(admission.id).unwrap();
        assert!(table.cancel(admission.id).unwrap());
        assert!(token.is_cancelled());
        assert_eq!(table.get(admission.id).unwrap().status, TaskStatus::Running);

        table.finish(admission.id, Err(AtelierError::Cancelled));
        assert_eq!(table.get(admission.id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_terminal_state_is_final() {
        let table = TaskTable::new(16);
        let admission = admit(&table, "/a");
        table.start(admission.id).unwrap();
        table.finish(admission.id, Err(AtelierError::NotFound { what: "x".into() }));
        table.finish(admission.id, Err(AtelierError::Other("late".into())));
        assert_eq!(table.get(admission.id).unwrap().status, TaskStatus::NotFound);
    }

    #[test]
    fn test_clear_done_keeps_active() {
        let table = TaskTable::new(16);
        let done = admit(&table, "/a");
        let running = admit(&table, "/b");
        let queued = admit(&table, "/c");
        table.start(done.id).unwrap();
        table.finish(
            done.id,
            Ok(TaskOutput::Scanned { assets: Vec::new() }),
        );
        table.start(running.id).unwrap();

        assert_eq!(table.clear_done(), 1);
        let ids: Vec<_> = table.list().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![running.id, queued.id]);
    }

    #[test]
    fn test_events_in_transition_order() {
        let table = TaskTable::new(16);
        let mut rx = table.subscribe();
        let admission = admit(&table, "/a");
        table.start(admission.id).unwrap();
        table.set_progress(admission.id, TaskProgress::percent(50.0));
        table.finish(
            admission.id,
            Err(AtelierError::NotFound { what: "x".into() }),
        );

        let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Running,
                TaskStatus::NotFound
            ]
        );
    }
}
