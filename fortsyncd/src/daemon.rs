use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fortsync_core::{DriveClient, FolderId};
use tokio::sync::broadcast::error::RecvError;

use crate::sync::controller::{DEFAULT_WORKER_COUNT, Phase, SyncController, SyncOptions};
use crate::sync::events::SyncEvent;
use crate::sync::progress::{ProgressAggregator, ProgressReport};
use crate::sync::task::TaskStatus;
use crate::token_store::TokenStore;

const DEFAULT_IDLE_POLL_MS: u64 = 200;
const DEFAULT_REPORT_SECS: u64 = 2;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub local_root: PathBuf,
    pub destination: FolderId,
    pub base_url: Option<String>,
    pub workers: usize,
    pub idle_poll: Duration,
    pub report_interval: Duration,
    pub json_output: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let local_root = std::env::var("FORTSYNC_LOCAL_DIR")
            .ok()
            .map(PathBuf::from)
            .context("FORTSYNC_LOCAL_DIR is not set")?;
        let destination = std::env::var("FORTSYNC_PARENT_ID")
            .ok()
            .context(
                "FORTSYNC_PARENT_ID is not set (run with --list-folders to pick a destination)",
            )?
            .parse::<FolderId>()
            .context("FORTSYNC_PARENT_ID must be a numeric folder id")?;
        let base_url = std::env::var("FORTSYNC_BASE_URL").ok();
        let workers = read_usize_env("FORTSYNC_WORKERS", DEFAULT_WORKER_COUNT);
        let idle_poll =
            Duration::from_millis(read_u64_env("FORTSYNC_IDLE_POLL_MS", DEFAULT_IDLE_POLL_MS));
        let report_interval =
            Duration::from_secs(read_u64_env("FORTSYNC_REPORT_SECS", DEFAULT_REPORT_SECS));

        Ok(Self {
            local_root,
            destination,
            base_url,
            workers,
            idle_poll,
            report_interval,
            json_output: false,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    controller: Arc<SyncController>,
}

impl DaemonRuntime {
    pub fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let client = build_client(config.base_url.as_deref())?;
        let options = SyncOptions {
            worker_count: config.workers,
            idle_poll: config.idle_poll,
        };
        let controller = Arc::new(SyncController::with_options(client, options));
        Ok(Self { config, controller })
    }

    /// Runs one sync session to Completion or Stop. Returns whether every
    /// enumerated file made it to the remote side.
    pub async fn run(&self) -> anyhow::Result<bool> {
        eprintln!(
            "[fortsyncd] started: local_root={}, destination={}, workers={}",
            self.config.local_root.display(),
            self.config.destination,
            self.config.workers
        );

        let mut events = self.controller.subscribe();
        let aggregator = ProgressAggregator::new(self.controller.queue());

        self.controller
            .start(&self.config.local_root, self.config.destination)
            .await
            .context("sync session failed to start")?;

        for issue in self.controller.enumeration_issues() {
            eprintln!(
                "[fortsyncd] skipped subtree {}: {}",
                issue.relative_path, issue.detail
            );
        }
        let snapshot = self.controller.snapshot();
        eprintln!(
            "[fortsyncd] enumerated {} files, {} bytes",
            snapshot.total, snapshot.bytes_total
        );

        let mut report_timer = tokio::time::interval(self.config.report_interval);
        let settled: Phase = loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.print_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        eprintln!("[fortsyncd] warning: observer lagged, {missed} events dropped");
                    }
                    Err(RecvError::Closed) => break self.controller.phase(),
                },
                _ = report_timer.tick() => self.print_report(&aggregator.report()),
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        eprintln!("[fortsyncd] interrupt received, letting in-flight uploads finish");
                        if let Err(err) = self.controller.stop() {
                            eprintln!("[fortsyncd] stop ignored: {err}");
                        }
                    }
                }
                phase = self.controller.wait_until_settled() => break phase,
            }
        };

        // The pool settles before the last events drain; flush what is left.
        while let Ok(event) = events.try_recv() {
            self.print_event(&event);
        }

        let snapshot = self.controller.snapshot();
        eprintln!(
            "[fortsyncd] finished: phase={settled}, uploaded={}, failed={}, cancelled={}, bytes={}",
            snapshot.succeeded, snapshot.failed, snapshot.cancelled, snapshot.bytes_transferred
        );
        for task in self.controller.tasks() {
            if task.status == TaskStatus::Failed {
                let cause = task
                    .last_error
                    .map(|error| error.to_string())
                    .unwrap_or_else(|| "unknown".into());
                eprintln!("[fortsyncd] failed: {} ({cause})", task.relative_path);
            }
        }
        Ok(snapshot.failed == 0)
    }

    fn print_event(&self, event: &SyncEvent) {
        if self.config.json_output {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{line}");
            }
            return;
        }
        match event {
            SyncEvent::TaskStarted {
                relative_path,
                size_bytes,
                attempt,
                ..
            } => {
                if *attempt > 1 {
                    eprintln!(
                        "[fortsyncd] upload start: {relative_path} ({size_bytes} bytes, attempt {attempt})"
                    );
                } else {
                    eprintln!("[fortsyncd] upload start: {relative_path} ({size_bytes} bytes)");
                }
            }
            // Per-chunk progress is too chatty for the log; the periodic
            // report covers it.
            SyncEvent::TaskProgress { .. } => {}
            SyncEvent::TaskSucceeded { relative_path, .. } => {
                eprintln!("[fortsyncd] upload done: {relative_path}");
            }
            SyncEvent::TaskFailed {
                relative_path,
                error,
                ..
            } => {
                eprintln!("[fortsyncd] upload failed: {relative_path}: {error}");
            }
            SyncEvent::PhaseChanged { phase } => eprintln!("[fortsyncd] phase: {phase}"),
        }
    }

    fn print_report(&self, report: &ProgressReport) {
        if self.config.json_output {
            if let Ok(line) =
                serde_json::to_string(&serde_json::json!({"event": "progress_report", "report": report}))
            {
                println!("{line}");
            }
            return;
        }
        if report.files_total == 0 {
            return;
        }
        match report.eta_seconds {
            Some(eta) => eprintln!(
                "[fortsyncd] progress: {}/{} files, {}/{} bytes, {:.0} B/s, eta {eta}s",
                report.files_done,
                report.files_total,
                report.bytes_done,
                report.bytes_total,
                report.throughput_bps
            ),
            None => eprintln!(
                "[fortsyncd] progress: {}/{} files, {}/{} bytes",
                report.files_done, report.files_total, report.bytes_done, report.bytes_total
            ),
        }
    }
}

/// Prints the account's root folders so the user can pick a destination id
/// for FORTSYNC_PARENT_ID.
pub async fn list_root_folders(base_url: Option<&str>) -> anyhow::Result<()> {
    let client = build_client(base_url)?;
    let folders = client
        .list_folders(None)
        .await
        .context("failed to list folders")?;
    if folders.is_empty() {
        eprintln!("[fortsyncd] the account has no folders yet");
        return Ok(());
    }
    for folder in folders {
        println!("{}\t{}", folder.id, folder.name);
    }
    Ok(())
}

fn build_client(base_url: Option<&str>) -> anyhow::Result<DriveClient> {
    let store = TokenStore::new().context("failed to open token store")?;
    let token = store
        .load()
        .context("failed to read stored token")?
        .context("no API token configured; set FORTSYNC_API_TOKEN or run --save-token")?;
    match base_url {
        Some(base_url) => DriveClient::with_base_url(base_url, token),
        None => DriveClient::new(token),
    }
    .context("failed to build API client")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_usize_env(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
