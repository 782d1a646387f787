use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::{Backoff, FailureStreak};
use super::engine::{BatchReport, EngineError, ItemStatus, ItemSyncEngine, ItemSyncReport, WorkItem};
use super::ledger::TransferLedger;
use super::selection::SelectionStore;
use crate::store::unix_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    pub sync_interval: Duration,
    pub pause_poll: Duration,
    pub idle_poll: Duration,
    pub stop_timeout: Duration,
    pub workers: usize,
    pub error_backoff_base: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
            pause_poll: Duration::from_secs(10),
            idle_poll: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
            workers: 1,
            error_backoff_base: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    pub items_synced: u64,
    pub items_failed: u64,
    pub items_skipped: u64,
    pub dedup_hits: u64,
    pub bytes_transferred: u64,
    pub bytes_saved: u64,
    pub passes_completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub started_at: Option<i64>,
    pub last_pass_at: Option<i64>,
    pub uptime_secs: Option<u64>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub stats: DaemonStats,
}

#[derive(Debug)]
struct RunState {
    state: DaemonState,
    started_at: Option<i64>,
    started: Option<Instant>,
    last_pass_at: Option<i64>,
    consecutive_errors: u32,
    last_error: Option<String>,
    stats: DaemonStats,
}

impl RunState {
    fn new() -> Self {
        Self {
            state: DaemonState::Stopped,
            started_at: None,
            started: None,
            last_pass_at: None,
            consecutive_errors: 0,
            last_error: None,
            stats: DaemonStats::default(),
        }
    }

    fn record_item(&mut self, report: &ItemSyncReport) {
        match report.status {
            ItemStatus::Synced => self.stats.items_synced += 1,
            ItemStatus::Deduplicated => {
                self.stats.items_synced += 1;
                self.stats.dedup_hits += 1;
            }
            ItemStatus::Skipped(_) => self.stats.items_skipped += 1,
            ItemStatus::Failed => self.stats.items_failed += 1,
        }
        self.stats.bytes_transferred += report.bytes_transferred;
        self.stats.bytes_saved += report.bytes_saved;
        if let Some(error) = &report.error {
            self.last_error = Some(format!("{}: {}", report.item_id, error));
        }
    }
}

type SharedState = Arc<Mutex<RunState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

enum PassOutcome {
    Completed(BatchReport),
    Interrupted(BatchReport),
}

/// Everything one pass needs; cloned into the background task.
#[derive(Clone)]
struct PassRunner {
    engine: Arc<ItemSyncEngine>,
    selection: SelectionStore,
    ledger: TransferLedger,
    workers: usize,
    state: SharedState,
}

impl PassRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        paused: &watch::Receiver<bool>,
    ) -> Result<PassOutcome, EngineError> {
        self.engine.begin_pass();
        let policies = self.engine.policy_snapshot().await?;
        let selection = self.selection.snapshot().await?;
        let halted = || cancel.is_cancelled() || *paused.borrow();

        let pending = self.ledger.pending_items().await?;
        let retried: HashSet<String> = pending.iter().cloned().collect();

        let mut seen = HashSet::new();
        let mut work = Vec::new();
        for container_id in &selection.containers {
            if halted() {
                return Ok(PassOutcome::Interrupted(BatchReport::default()));
            }
            match self.engine.expand_container(container_id).await {
                Ok(walk) => {
                    for walked in walk.items {
                        if seen.insert(walked.item.id.clone()) {
                            work.push(WorkItem::Walked(walked));
                        }
                    }
                }
                Err(err) => {
                    warn!(container_id = container_id.as_str(), error = %err, "failed to expand selected container");
                    lock(&self.state).last_error = Some(format!("{container_id}: {err}"));
                }
            }
        }
        for item_id in selection.items.into_iter().chain(pending) {
            if seen.insert(item_id.clone()) {
                work.push(WorkItem::Id(item_id));
            }
        }
        info!(items = work.len(), "sync pass started");

        let policies = &policies;
        let retried = &retried;
        let mut results = stream::iter(work)
            .map(|item| async move {
                if halted() {
                    return None;
                }
                let report = self.engine.sync_work(item, policies).await;
                if retried.contains(&report.item_id) {
                    self.engine.settle_pending(&report).await;
                }
                Some(report)
            })
            .buffer_unordered(self.workers.max(1));

        let mut batch = BatchReport::default();
        let mut interrupted = false;
        while let Some(result) = results.next().await {
            match result {
                Some(report) => {
                    lock(&self.state).record_item(&report);
                    batch.add(report);
                }
                None => interrupted = true,
            }
        }

        if interrupted {
            info!(done = batch.total, "sync pass interrupted");
            return Ok(PassOutcome::Interrupted(batch));
        }
        info!(
            total = batch.total,
            synced = batch.synced,
            deduplicated = batch.deduplicated,
            skipped = batch.skipped,
            failed = batch.failed,
            bytes = batch.bytes_transferred,
            "sync pass finished"
        );
        Ok(PassOutcome::Completed(batch))
    }

    fn pass_completed(&self) {
        let mut state = lock(&self.state);
        state.last_pass_at = Some(unix_now());
        state.stats.passes_completed += 1;
        state.consecutive_errors = 0;
    }

    fn pass_failed(&self, err: &EngineError) {
        let mut state = lock(&self.state);
        state.last_error = Some(err.to_string());
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
    }
}

struct LoopHandle {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Background sync loop with a start/stop/pause/resume lifecycle.
///
/// Control calls only touch the lifecycle flags; sync work happens on the
/// spawned task and notices pause or stop before starting each item.
pub struct SyncDaemon {
    runner: PassRunner,
    settings: DaemonSettings,
    control: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl SyncDaemon {
    pub fn new(
        engine: Arc<ItemSyncEngine>,
        selection: SelectionStore,
        ledger: TransferLedger,
        settings: DaemonSettings,
    ) -> Self {
        Self {
            runner: PassRunner {
                engine,
                selection,
                ledger,
                workers: settings.workers,
                state: Arc::new(Mutex::new(RunState::new())),
            },
            settings,
            control: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn start(&self) -> bool {
        let mut control = self.control.lock().await;
        if control.is_some() {
            warn!("sync daemon is already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let (paused_tx, paused_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            self.runner.clone(),
            self.settings.clone(),
            cancel.clone(),
            paused_rx,
        ));
        *control = Some(LoopHandle {
            cancel,
            paused: paused_tx,
            task,
        });

        let mut state = lock(&self.runner.state);
        state.state = DaemonState::Running;
        state.started_at = Some(unix_now());
        state.started = Some(Instant::now());
        info!("sync daemon started");
        true
    }

    /// Signals the loop and waits up to the stop timeout for it to exit. A
    /// loop still busy after the timeout is left to finish its current item
    /// in the background.
    pub async fn stop(&self) -> bool {
        let mut control = self.control.lock().await;
        let Some(handle) = control.take() else {
            warn!("sync daemon is not running");
            return false;
        };
        handle.cancel.cancel();
        match tokio::time::timeout(self.settings.stop_timeout, handle.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "sync loop task failed"),
            Err(_) => warn!(
                timeout_secs = self.settings.stop_timeout.as_secs(),
                "sync loop did not stop in time, detaching"
            ),
        }

        let mut state = lock(&self.runner.state);
        state.state = DaemonState::Stopped;
        state.started = None;
        info!("sync daemon stopped");
        true
    }

    pub async fn pause(&self) -> bool {
        let control = self.control.lock().await;
        let Some(handle) = control.as_ref() else {
            warn!("cannot pause, sync daemon is not running");
            return false;
        };
        let mut state = lock(&self.runner.state);
        if state.state != DaemonState::Running {
            return false;
        }
        handle.paused.send_replace(true);
        state.state = DaemonState::Paused;
        info!("sync daemon paused");
        true
    }

    /// Resuming a daemon that is already running is a no-op success.
    pub async fn resume(&self) -> bool {
        let control = self.control.lock().await;
        let Some(handle) = control.as_ref() else {
            warn!("cannot resume, sync daemon is not running");
            return false;
        };
        handle.paused.send_replace(false);
        let mut state = lock(&self.runner.state);
        if state.state == DaemonState::Paused {
            info!("sync daemon resumed");
        }
        state.state = DaemonState::Running;
        true
    }

    pub fn status(&self) -> DaemonStatus {
        let state = lock(&self.runner.state);
        DaemonStatus {
            state: state.state,
            started_at: state.started_at,
            last_pass_at: state.last_pass_at,
            uptime_secs: state.started.map(|started| started.elapsed().as_secs()),
            consecutive_errors: state.consecutive_errors,
            last_error: state.last_error.clone(),
            stats: state.stats.clone(),
        }
    }

    /// Runs one full pass on the calling task, independent of the lifecycle.
    pub async fn run_once(&self) -> Result<BatchReport, EngineError> {
        let cancel = CancellationToken::new();
        let (_paused_tx, paused_rx) = watch::channel(false);
        match self.runner.run(&cancel, &paused_rx).await {
            Ok(PassOutcome::Completed(batch)) | Ok(PassOutcome::Interrupted(batch)) => {
                self.runner.pass_completed();
                Ok(batch)
            }
            Err(err) => {
                error!(error = %err, "sync pass failed");
                self.runner.pass_failed(&err);
                Err(err)
            }
        }
    }
}

/// Idle wait before the next pass, capped by the idle poll. `None` means a
/// pass is due now.
fn time_until_next_pass(since_last: Option<Duration>, settings: &DaemonSettings) -> Option<Duration> {
    since_last
        .map(|elapsed| settings.sync_interval.saturating_sub(elapsed))
        .filter(|remaining| !remaining.is_zero())
        .map(|remaining| remaining.min(settings.idle_poll))
}

async fn run_loop(
    runner: PassRunner,
    settings: DaemonSettings,
    cancel: CancellationToken,
    mut paused: watch::Receiver<bool>,
) {
    info!(interval_secs = settings.sync_interval.as_secs(), "sync loop started");
    let mut streak = FailureStreak::new(Backoff::new(
        settings.error_backoff_base,
        settings.sync_interval,
        true,
    ));
    let mut last_pass: Option<Instant> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let wait = if *paused.borrow() {
            debug!("sync daemon paused");
            Some(settings.pause_poll)
        } else {
            time_until_next_pass(last_pass.map(|at| at.elapsed()), &settings)
        };

        if let Some(wait) = wait {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = paused.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }

        match runner.run(&cancel, &paused).await {
            Ok(PassOutcome::Completed(_)) => {
                last_pass = Some(Instant::now());
                streak.reset();
                runner.pass_completed();
            }
            Ok(PassOutcome::Interrupted(_)) => {}
            Err(err) => {
                error!(error = %err, "sync pass failed");
                runner.pass_failed(&err);
                let delay = streak.next_delay();
                warn!(delay_ms = delay.as_millis() as u64, "backing off after failed pass");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    info!("sync loop exited");
}
