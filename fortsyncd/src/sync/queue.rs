use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fortsync_core::FolderId;
use serde::Serialize;

use super::task::{Task, TaskError, TaskId, TaskSpec, TaskStatus};

/// Point-in-time view of the queue; safe to take at any poll rate without
/// blocking transfers for longer than one counter pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
}

impl QueueSnapshot {
    /// No task is pending or in progress.
    pub fn is_quiescent(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// Everything a worker needs to execute one attempt. Handed to exactly one
/// caller per attempt by `dequeue_next`.
#[derive(Debug, Clone)]
pub struct TaskClaim {
    pub id: TaskId,
    pub local_path: PathBuf,
    pub relative_path: String,
    pub remote_folder_id: FolderId,
    pub size_bytes: u64,
    pub attempt: u32,
}

#[derive(Debug, Default)]
pub struct TransferQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    tasks: Vec<Task>,
    pending: VecDeque<TaskId>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all session tasks; the next enumeration starts from a clean
    /// table.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.tasks.clear();
        inner.pending.clear();
    }

    pub fn enqueue_all(&self, specs: Vec<TaskSpec>) {
        let mut inner = self.lock();
        for spec in specs {
            let id = inner.tasks.len();
            inner.tasks.push(Task {
                id,
                local_path: spec.local_path,
                relative_path: spec.relative_path,
                remote_folder_id: spec.remote_folder_id,
                size_bytes: spec.size_bytes,
                status: TaskStatus::Pending,
                bytes_transferred: 0,
                attempt_count: 0,
                last_error: None,
            });
            inner.pending.push_back(id);
        }
    }

    /// Pops the next pending task and marks it in-progress in one critical
    /// section, so no two callers can ever claim the same task.
    pub fn dequeue_next(&self) -> Option<TaskClaim> {
        let mut inner = self.lock();
        let id = inner.pending.pop_front()?;
        let task = &mut inner.tasks[id];
        task.status = TaskStatus::InProgress;
        task.attempt_count += 1;
        task.bytes_transferred = 0;
        Some(TaskClaim {
            id,
            local_path: task.local_path.clone(),
            relative_path: task.relative_path.clone(),
            remote_folder_id: task.remote_folder_id,
            size_bytes: task.size_bytes,
            attempt: task.attempt_count,
        })
    }

    pub fn record_progress(&self, id: TaskId, bytes: u64) {
        let mut inner = self.lock();
        if let Some(task) = inner.tasks.get_mut(id)
            && task.status == TaskStatus::InProgress
        {
            task.bytes_transferred = bytes.min(task.size_bytes);
        }
    }

    pub fn mark_succeeded(&self, id: TaskId) {
        let mut inner = self.lock();
        if let Some(task) = inner.tasks.get_mut(id) {
            task.status = TaskStatus::Succeeded;
            task.bytes_transferred = task.size_bytes;
            task.last_error = None;
        }
    }

    /// Failure discards partial progress so aggregate byte counts only ever
    /// reflect durable transfers.
    pub fn mark_failed(&self, id: TaskId, error: TaskError) {
        let mut inner = self.lock();
        if let Some(task) = inner.tasks.get_mut(id) {
            task.status = TaskStatus::Failed;
            task.bytes_transferred = 0;
            task.last_error = Some(error);
        }
    }

    /// Marks every still-pending task cancelled. Used once the pool has
    /// drained after a stop; nothing is in flight at that point.
    pub fn cancel_pending(&self) -> usize {
        let mut inner = self.lock();
        let mut cancelled = 0;
        while let Some(id) = inner.pending.pop_front() {
            inner.tasks[id].status = TaskStatus::Cancelled;
            cancelled += 1;
        }
        cancelled
    }

    /// Failed tasks, and tasks cancelled by a stop, go back to pending.
    /// Attempt counters and recorded errors stay untouched until a worker
    /// actually re-attempts the task.
    pub fn requeue_failed(&self) -> usize {
        let mut inner = self.lock();
        let ids: Vec<TaskId> = inner
            .tasks
            .iter()
            .filter(|task| matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled))
            .map(|task| task.id)
            .collect();
        for &id in &ids {
            inner.tasks[id].status = TaskStatus::Pending;
            inner.pending.push_back(id);
        }
        ids.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.lock();
        let mut snapshot = QueueSnapshot {
            total: inner.tasks.len(),
            ..QueueSnapshot::default()
        };
        for task in &inner.tasks {
            snapshot.bytes_total += task.size_bytes;
            snapshot.bytes_transferred += task.bytes_transferred;
            match task.status {
                TaskStatus::Pending => snapshot.pending += 1,
                TaskStatus::InProgress => snapshot.in_progress += 1,
                TaskStatus::Succeeded => snapshot.succeeded += 1,
                TaskStatus::Failed => snapshot.failed += 1,
                TaskStatus::Cancelled => snapshot.cancelled += 1,
            }
        }
        snapshot
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // A poisoned lock means a holder panicked; every critical section
        // leaves the table in a countable state, so recover the guard.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
