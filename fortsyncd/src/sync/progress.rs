use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::queue::{QueueSnapshot, TransferQueue};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressReport {
    pub files_total: usize,
    pub files_done: usize,
    pub files_failed: usize,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub throughput_bps: f64,
    pub eta_seconds: Option<u64>,
}

/// Read-side statistics. Polling takes one queue snapshot and updates only
/// the aggregator's own sample ring; engine state is never mutated, so any
/// poll rate is safe.
pub struct ProgressAggregator {
    queue: Arc<TransferQueue>,
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl ProgressAggregator {
    pub fn new(queue: Arc<TransferQueue>) -> Self {
        Self::with_window(queue, DEFAULT_WINDOW)
    }

    pub fn with_window(queue: Arc<TransferQueue>, window: Duration) -> Self {
        Self {
            queue,
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn report(&self) -> ProgressReport {
        let snapshot = self.queue.snapshot();
        let throughput_bps = self.sample(snapshot.bytes_transferred);
        assemble(snapshot, throughput_bps)
    }

    /// Moving-window throughput over the caller's own polling cadence.
    fn sample(&self, bytes_done: u64) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples_lock();
        samples.push_back((now, bytes_done));
        while samples
            .front()
            .is_some_and(|&(taken, _)| now.duration_since(taken) > self.window)
        {
            samples.pop_front();
        }
        let Some(&(first_taken, first_bytes)) = samples.front() else {
            return 0.0;
        };
        let elapsed = now.duration_since(first_taken).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        // A failed attempt resets its partial bytes, so the window total can
        // go backwards; clamp rather than report negative throughput.
        bytes_done.saturating_sub(first_bytes) as f64 / elapsed
    }

    fn samples_lock(&self) -> MutexGuard<'_, VecDeque<(Instant, u64)>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn assemble(snapshot: QueueSnapshot, throughput_bps: f64) -> ProgressReport {
    let remaining = snapshot.bytes_total.saturating_sub(snapshot.bytes_transferred);
    let eta_seconds = if throughput_bps > 0.0 {
        Some((remaining as f64 / throughput_bps).ceil() as u64)
    } else {
        None
    };
    ProgressReport {
        files_total: snapshot.total,
        files_done: snapshot.succeeded,
        files_failed: snapshot.failed,
        bytes_total: snapshot.bytes_total,
        bytes_done: snapshot.bytes_transferred,
        throughput_bps,
        eta_seconds,
    }
}
