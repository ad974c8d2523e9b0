use std::fmt;
use std::path::PathBuf;

use fortsync_core::{ApiErrorClass, DriveError, FolderId};
use serde::Serialize;

/// Index of a task in the session's task table.
pub type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    SourceChanged,
    Auth,
    Network,
    Quota,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_drive(err: &DriveError) -> Self {
        let kind = match err {
            // Local read failures mean the source moved out from under us,
            // not that the remote misbehaved.
            DriveError::Io(_) => TaskErrorKind::SourceChanged,
            other => match other.classification() {
                Some(ApiErrorClass::Auth) => TaskErrorKind::Auth,
                Some(ApiErrorClass::Quota) => TaskErrorKind::Quota,
                Some(ApiErrorClass::Conflict) => TaskErrorKind::Conflict,
                _ => TaskErrorKind::Network,
            },
        };
        Self::new(kind, err.to_string())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// One file transfer unit. The path, destination folder and size are fixed at
/// enumeration time; the worker holding the claim owns the mutable fields
/// while the task is in progress.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub local_path: PathBuf,
    pub relative_path: String,
    pub remote_folder_id: FolderId,
    pub size_bytes: u64,
    pub status: TaskStatus,
    pub bytes_transferred: u64,
    pub attempt_count: u32,
    pub last_error: Option<TaskError>,
}

/// What the path mapper hands to the queue for each enumerated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub local_path: PathBuf,
    pub relative_path: String,
    pub remote_folder_id: FolderId,
    pub size_bytes: u64,
}
