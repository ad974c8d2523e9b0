use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fortsync_core::{DriveClient, FolderId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::events::SyncEvent;
use super::mapper::{MapperError, MapperIssue, PathMapper};
use super::queue::{QueueSnapshot, TransferQueue};
use super::task::Task;
use super::worker::{self, WorkerContext};

pub const DEFAULT_WORKER_COUNT: usize = 3;
const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(200);
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The engine's single run-state value. Only the controller writes it; every
/// worker observes the same watch channel, never a private copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Paused => "paused",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("{command} is not valid while the engine is {phase}")]
    InvalidStateTransition { command: &'static str, phase: Phase },
    #[error(transparent)]
    Enumeration(#[from] MapperError),
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub worker_count: usize,
    pub idle_poll: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            idle_poll: DEFAULT_IDLE_POLL,
        }
    }
}

/// Owns the queue and the phase, and is the only component that moves the
/// phase. All commands are explicit; an illegal one is rejected with the
/// current phase and changes nothing.
pub struct SyncController {
    client: DriveClient,
    options: SyncOptions,
    queue: Arc<TransferQueue>,
    phase_tx: watch::Sender<Phase>,
    events: broadcast::Sender<SyncEvent>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    issues: Vec<MapperIssue>,
}

impl SyncController {
    pub fn new(client: DriveClient) -> Self {
        Self::with_options(client, SyncOptions::default())
    }

    pub fn with_options(client: DriveClient, options: SyncOptions) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            client,
            options,
            queue: Arc::new(TransferQueue::new()),
            phase_tx,
            events,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.queue.tasks()
    }

    pub fn queue(&self) -> Arc<TransferQueue> {
        Arc::clone(&self.queue)
    }

    /// Subtrees the mapper had to skip during the current session.
    pub fn enumeration_issues(&self) -> Vec<MapperIssue> {
        self.session_lock().issues.clone()
    }

    /// Enumerates `root`, mirrors its directories under the remote
    /// `destination` folder, and launches the worker pool. Valid from Idle or
    /// from a settled session (Stopped/Completed); the previous session's
    /// tasks are discarded.
    pub async fn start(&self, root: &Path, destination: FolderId) -> Result<(), ControllerError> {
        let previous = self.transition(
            "start",
            &[Phase::Idle, Phase::Stopped, Phase::Completed],
            Phase::Running,
        )?;

        self.queue.reset();
        self.session_lock().issues.clear();

        // A stop during enumeration cuts the walk short; a pause does not,
        // it only gates the workers that have not started yet.
        let phase_rx = self.phase_tx.subscribe();
        let mut mapper = PathMapper::new(&self.client);
        let outcome = match mapper
            .enumerate(root, destination, move || {
                matches!(*phase_rx.borrow(), Phase::Stopping | Phase::Stopped)
            })
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // Nothing was enqueued and no worker started; put the phase
                // back where the caller left it.
                self.set_phase(previous);
                return Err(err.into());
            }
        };

        self.queue.enqueue_all(outcome.tasks);
        self.session_lock().issues = outcome.issues;

        self.spawn_pool();
        Ok(())
    }

    /// In-flight uploads run to completion; nothing new is dequeued until
    /// resume.
    pub fn pause(&self) -> Result<(), ControllerError> {
        self.transition("pause", &[Phase::Running], Phase::Paused)?;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ControllerError> {
        self.transition("resume", &[Phase::Paused], Phase::Running)?;
        Ok(())
    }

    /// Cooperative stop: returns immediately, in-flight uploads drain, and
    /// the phase settles to Stopped once every executor has exited. Tasks
    /// still pending at that point become Cancelled.
    pub fn stop(&self) -> Result<(), ControllerError> {
        self.transition("stop", &[Phase::Running, Phase::Paused], Phase::Stopping)?;
        Ok(())
    }

    /// Puts every Failed task (and tasks cancelled by a stop) back in the
    /// queue. From a settled session this also restarts the pool; while
    /// running, live workers pick the tasks up on their own. Returns how many
    /// tasks were revived.
    pub fn retry_failed(&self) -> Result<usize, ControllerError> {
        let mut observed = Phase::Idle;
        let mut requeued = 0;
        let mut restart = false;
        let mut invalid = false;
        let changed = self.phase_tx.send_if_modified(|phase| {
            observed = *phase;
            match *phase {
                // Requeue under the watch lock so a draining pool either sees
                // the new pending tasks or hands off to a fresh pool, never
                // neither.
                Phase::Running => {
                    requeued = self.queue.requeue_failed();
                    false
                }
                Phase::Stopped | Phase::Completed => {
                    requeued = self.queue.requeue_failed();
                    *phase = Phase::Running;
                    restart = true;
                    true
                }
                _ => {
                    invalid = true;
                    false
                }
            }
        });
        if invalid {
            return Err(ControllerError::InvalidStateTransition {
                command: "retry_failed",
                phase: observed,
            });
        }
        if changed {
            let _ = self.events.send(SyncEvent::PhaseChanged {
                phase: Phase::Running,
            });
        }
        if restart {
            self.spawn_pool();
        }
        Ok(requeued)
    }

    /// Resolves once the engine settles in Stopped or Completed.
    pub async fn wait_until_settled(&self) -> Phase {
        let mut rx = self.phase_tx.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            if matches!(phase, Phase::Stopped | Phase::Completed) {
                return phase;
            }
            if rx.changed().await.is_err() {
                return phase;
            }
        }
    }

    fn spawn_pool(&self) {
        let context = WorkerContext {
            client: self.client.clone(),
            queue: Arc::clone(&self.queue),
            phase: self.phase_tx.subscribe(),
            events: self.events.clone(),
            idle_poll: self.options.idle_poll,
        };
        let worker_count = self.options.worker_count.max(1);
        let handles = worker::spawn_workers(&context, worker_count);
        let phase_tx = self.phase_tx.clone();
        let events = self.events.clone();
        tokio::spawn(supervise(context, handles, worker_count, phase_tx, events));
    }

    /// Atomic compare-and-transition on the shared phase. Rejections report
    /// the phase that was actually observed.
    fn transition(
        &self,
        command: &'static str,
        from: &[Phase],
        to: Phase,
    ) -> Result<Phase, ControllerError> {
        let mut observed = Phase::Idle;
        let changed = self.phase_tx.send_if_modified(|phase| {
            observed = *phase;
            if from.contains(phase) {
                *phase = to;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = self.events.send(SyncEvent::PhaseChanged { phase: to });
            Ok(observed)
        } else {
            Err(ControllerError::InvalidStateTransition {
                command,
                phase: observed,
            })
        }
    }

    fn set_phase(&self, to: Phase) {
        let changed = self.phase_tx.send_if_modified(|phase| {
            if *phase == to {
                false
            } else {
                *phase = to;
                true
            }
        });
        if changed {
            let _ = self.events.send(SyncEvent::PhaseChanged { phase: to });
        }
    }

    fn session_lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Joins the pool, then settles the session: Stopping becomes Stopped (with
/// leftover pending tasks cancelled first, so a later retry can revive them),
/// a drained Running pool becomes Completed, and a retry that raced the drain
/// gets a fresh round of workers instead.
async fn supervise(
    context: WorkerContext,
    mut handles: Vec<JoinHandle<()>>,
    worker_count: usize,
    phase_tx: watch::Sender<Phase>,
    events: broadcast::Sender<SyncEvent>,
) {
    enum Verdict {
        Settled(Phase),
        Respawn,
        Park,
    }

    loop {
        for handle in handles.drain(..) {
            let _ = handle.await;
        }

        // Decide under the watch lock; retry_failed requeues under the same
        // lock, so pending tasks cannot appear between the check and the
        // phase change.
        let mut verdict = Verdict::Park;
        phase_tx.send_if_modified(|phase| match *phase {
            Phase::Stopping => {
                context.queue.cancel_pending();
                *phase = Phase::Stopped;
                verdict = Verdict::Settled(Phase::Stopped);
                true
            }
            Phase::Running => {
                if context.queue.snapshot().pending > 0 {
                    verdict = Verdict::Respawn;
                    false
                } else {
                    *phase = Phase::Completed;
                    verdict = Verdict::Settled(Phase::Completed);
                    true
                }
            }
            _ => {
                verdict = Verdict::Park;
                false
            }
        });

        match verdict {
            Verdict::Settled(phase) => {
                let _ = events.send(SyncEvent::PhaseChanged { phase });
                return;
            }
            Verdict::Respawn => {
                handles = worker::spawn_workers(&context, worker_count);
            }
            Verdict::Park => {
                // Paused with an empty pool (every worker drained before the
                // pause landed); wait for the next command.
                let mut rx = phase_tx.subscribe();
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
