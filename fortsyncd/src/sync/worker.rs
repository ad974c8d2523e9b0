use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fortsync_core::{DriveClient, ProgressFn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::controller::Phase;
use super::events::SyncEvent;
use super::queue::{TaskClaim, TransferQueue};
use super::task::{TaskError, TaskErrorKind};

/// Emit a TaskProgress event at most once per this many transferred bytes;
/// the final chunk always emits.
const PROGRESS_EVENT_STEP: u64 = 128 * 1024;

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub client: DriveClient,
    pub queue: Arc<TransferQueue>,
    pub phase: watch::Receiver<Phase>,
    pub events: broadcast::Sender<SyncEvent>,
    pub idle_poll: Duration,
}

pub(crate) fn spawn_workers(context: &WorkerContext, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|_| tokio::spawn(worker_loop(context.clone())))
        .collect()
}

/// One executor. Dequeues while the engine is running, parks while paused,
/// and exits once stopping or once the queue is quiescent. A claimed task is
/// always driven to a terminal status before the phase is looked at again.
async fn worker_loop(mut context: WorkerContext) {
    loop {
        let phase = *context.phase.borrow_and_update();
        match phase {
            Phase::Running => match context.queue.dequeue_next() {
                Some(claim) => run_task(&context, claim).await,
                None => {
                    if context.queue.snapshot().is_quiescent() {
                        break;
                    }
                    // Another worker still holds an in-flight task; re-check
                    // shortly in case a retry re-populates the queue.
                    tokio::time::sleep(context.idle_poll).await;
                }
            },
            Phase::Paused => {
                // Parked until resume or stop; nothing is dequeued meanwhile.
                if context.phase.changed().await.is_err() {
                    break;
                }
            }
            Phase::Idle | Phase::Stopping | Phase::Stopped | Phase::Completed => break,
        }
    }
}

async fn run_task(context: &WorkerContext, claim: TaskClaim) {
    let _ = context.events.send(SyncEvent::TaskStarted {
        id: claim.id,
        relative_path: claim.relative_path.clone(),
        size_bytes: claim.size_bytes,
        attempt: claim.attempt,
    });

    // The file may have changed or vanished since enumeration; never upload
    // bytes that no longer match the task we advertised.
    match tokio::fs::metadata(&claim.local_path).await {
        Ok(meta) if meta.len() != claim.size_bytes => {
            return fail(
                context,
                &claim,
                TaskError::new(
                    TaskErrorKind::SourceChanged,
                    format!(
                        "size changed from {} to {} bytes since enumeration",
                        claim.size_bytes,
                        meta.len()
                    ),
                ),
            );
        }
        Err(err) => {
            return fail(
                context,
                &claim,
                TaskError::new(TaskErrorKind::SourceChanged, format!("source unreadable: {err}")),
            );
        }
        Ok(_) => {}
    }

    let progress: ProgressFn = {
        let queue = Arc::clone(&context.queue);
        let events = context.events.clone();
        let id = claim.id;
        let relative_path = claim.relative_path.clone();
        let size_bytes = claim.size_bytes;
        let transferred = AtomicU64::new(0);
        let last_emitted = AtomicU64::new(0);
        Arc::new(move |delta| {
            let done = transferred.fetch_add(delta, Ordering::Relaxed) + delta;
            queue.record_progress(id, done);
            let emitted = last_emitted.load(Ordering::Relaxed);
            if done >= size_bytes || done.saturating_sub(emitted) >= PROGRESS_EVENT_STEP {
                last_emitted.store(done, Ordering::Relaxed);
                let _ = events.send(SyncEvent::TaskProgress {
                    id,
                    relative_path: relative_path.clone(),
                    bytes_transferred: done,
                    size_bytes,
                });
            }
        })
    };

    match context
        .client
        .upload_file(claim.remote_folder_id, &claim.local_path, progress)
        .await
    {
        Ok(()) => {
            context.queue.mark_succeeded(claim.id);
            let _ = context.events.send(SyncEvent::TaskSucceeded {
                id: claim.id,
                relative_path: claim.relative_path.clone(),
                size_bytes: claim.size_bytes,
            });
        }
        Err(err) => fail(context, &claim, TaskError::from_drive(&err)),
    }
}

fn fail(context: &WorkerContext, claim: &TaskClaim, error: TaskError) {
    context.queue.mark_failed(claim.id, error.clone());
    let _ = context.events.send(SyncEvent::TaskFailed {
        id: claim.id,
        relative_path: claim.relative_path.clone(),
        error,
    });
}
