use serde::Serialize;

use super::controller::Phase;
use super::task::{TaskError, TaskId};

/// Push-side observer stream. Receivers that fall behind lose old events but
/// never block the engine; pollers should use the queue snapshot instead.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    TaskStarted {
        id: TaskId,
        relative_path: String,
        size_bytes: u64,
        attempt: u32,
    },
    TaskProgress {
        id: TaskId,
        relative_path: String,
        bytes_transferred: u64,
        size_bytes: u64,
    },
    TaskSucceeded {
        id: TaskId,
        relative_path: String,
        size_bytes: u64,
    },
    TaskFailed {
        id: TaskId,
        relative_path: String,
        error: TaskError,
    },
    PhaseChanged {
        phase: Phase,
    },
}
