//! Periodic sync of configured (workspace, account) targets.
//!
//! The scheduler owns no global state: it is built from an injected
//! [`SchedulerConfig`] and an orchestrator, and [`SyncScheduler::start`]
//! hands back the only way to drive or stop it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::orchestrator::{SyncMode, SyncOrchestrator, SyncRequest, SyncResult, SyncScope};

/// One (workspace, account) pair to keep in sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncTarget {
    pub workspace_id: String,
    pub account_id: String,
}

impl SyncTarget {
    pub fn new(workspace_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            account_id: account_id.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between cycles (default: 15 minutes).
    pub interval: Duration,
    pub targets: Vec<SyncTarget>,
    pub mode: SyncMode,
    pub scope: SyncScope,
    /// Maximum targets synced at once.
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            targets: Vec::new(),
            mode: SyncMode::Incremental,
            scope: SyncScope::Both,
            max_concurrent: 2,
        }
    }
}

/// Last outcome for a target.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TargetOutcome {
    Completed(SyncResult),
    /// A pass for the pair was already running.
    Skipped,
    Failed { error: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_outcomes: HashMap<String, TargetOutcome>,
}

fn target_key(target: &SyncTarget) -> String {
    format!("{}/{}", target.workspace_id, target.account_id)
}

pub struct SyncScheduler {
    config: SchedulerConfig,
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncScheduler {
    pub fn new(config: SchedulerConfig, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Spawn the scheduling loop. The first cycle runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let trigger = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let orchestrator = self.orchestrator.clone();

        info!(
            "Starting scheduler with {} targets every {:?}",
            self.config.targets.len(),
            self.config.interval
        );
        let task = tokio::spawn(run_loop(self, stop_rx, trigger.clone(), stats.clone()));

        SchedulerHandle {
            stop_tx,
            trigger,
            stats,
            orchestrator,
            task,
        }
    }
}

async fn run_loop(
    scheduler: SyncScheduler,
    mut stop_rx: watch::Receiver<bool>,
    trigger: Arc<Notify>,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    let mut interval = time::interval(scheduler.config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = trigger.notified() => debug!("Manual trigger"),
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        if *stop_rx.borrow() {
            break;
        }

        let outcomes = run_cycle(&scheduler, &stop_rx).await;
        let mut current = stats.lock().unwrap_or_else(|e| e.into_inner());
        current.cycles += 1;
        current.last_cycle_at = Some(Utc::now());
        current.last_outcomes.extend(outcomes);
    }
    info!("Scheduler stopped");
}

async fn run_cycle(
    scheduler: &SyncScheduler,
    stop_rx: &watch::Receiver<bool>,
) -> Vec<(String, TargetOutcome)> {
    debug!("Starting sync cycle");
    let semaphore = Arc::new(Semaphore::new(scheduler.config.max_concurrent.max(1)));
    let mut tasks = Vec::new();

    for target in &scheduler.config.targets {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if *stop_rx.borrow() {
            break;
        }

        let orchestrator = scheduler.orchestrator.clone();
        let request = SyncRequest::new(&target.workspace_id, &target.account_id)
            .mode(scheduler.config.mode)
            .scope(scheduler.config.scope);
        let key = target_key(target);

        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            let outcome = match orchestrator.run_sync(request).await {
                Ok(result) => TargetOutcome::Completed(result),
                Err(SyncError::AlreadyRunning { .. }) => {
                    debug!("Skipping {}: already running", key);
                    TargetOutcome::Skipped
                }
                Err(e) => {
                    warn!("Scheduled sync of {} failed: {}", key, e);
                    TargetOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            (key, outcome)
        }));
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => warn!("Scheduled sync task panicked: {}", e),
        }
    }
    debug!("Sync cycle completed");
    outcomes
}

/// Control surface of a running scheduler.
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    trigger: Arc<Notify>,
    stats: Arc<Mutex<SchedulerStats>>,
    orchestrator: Arc<SyncOrchestrator>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Run a cycle now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Cancel in-flight passes, stop the loop and wait for it to exit.
    pub async fn stop(self) -> SchedulerStats {
        let _ = self.stop_tx.send(true);
        let cancelled = self.orchestrator.cancel_all();
        if cancelled > 0 {
            info!("Cancelling {} running syncs", cancelled);
        }
        if let Err(e) = self.task.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SyncOptions;
    use crate::testing::FakeProvider;
    use samsync_ingest::SqliteStore;

    async fn orchestrator(provider: FakeProvider) -> Arc<SyncOrchestrator> {
        let store = SqliteStore::in_memory().await.unwrap();
        Arc::new(SyncOrchestrator::new(
            Arc::new(provider),
            Arc::new(store),
            SyncOptions::default(),
        ))
    }

    fn config(targets: Vec<SyncTarget>) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            targets,
            ..Default::default()
        }
    }

    async fn wait_for_cycles(handle: &SchedulerHandle, cycles: u64) {
        for _ in 0..300 {
            if handle.stats().cycles >= cycles {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scheduler did not reach {} cycles", cycles);
    }

    #[tokio::test]
    async fn test_first_cycle_and_trigger() {
        let orchestrator = orchestrator(FakeProvider::scenario()).await;
        let handle = SyncScheduler::new(
            config(vec![SyncTarget::new("ws_1", "acc_a"), SyncTarget::new("ws_1", "acc_missing")]),
            orchestrator,
        )
        .start();

        wait_for_cycles(&handle, 1).await;
        let stats = handle.stats();
        match &stats.last_outcomes["ws_1/acc_a"] {
            TargetOutcome::Completed(result) => assert_eq!(result.created, 3),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            stats.last_outcomes["ws_1/acc_missing"],
            TargetOutcome::Failed { .. }
        ));

        handle.trigger();
        wait_for_cycles(&handle, 2).await;
        match &handle.stats().last_outcomes["ws_1/acc_a"] {
            TargetOutcome::Completed(result) => assert_eq!(result.created, 0),
            other => panic!("unexpected outcome {:?}", other),
        }

        let stats = handle.stop().await;
        assert_eq!(stats.cycles, 2);
    }

    #[tokio::test]
    async fn test_running_target_is_skipped() {
        let mut provider = FakeProvider::scenario();
        provider.delay = Some(Duration::from_millis(300));
        let orchestrator = orchestrator(provider).await;

        let manual = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .run_sync(SyncRequest::new("ws_1", "acc_a"))
                    .await
            })
        };
        time::sleep(Duration::from_millis(30)).await;

        let handle = SyncScheduler::new(config(vec![SyncTarget::new("ws_1", "acc_a")]), orchestrator).start();
        wait_for_cycles(&handle, 1).await;
        assert_eq!(
            handle.stats().last_outcomes["ws_1/acc_a"],
            TargetOutcome::Skipped
        );

        handle.stop().await;
        assert!(manual.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_runs() {
        let mut provider = FakeProvider::scenario();
        provider.delay = Some(Duration::from_millis(200));
        let orchestrator = orchestrator(provider).await;

        let handle = SyncScheduler::new(
            config(vec![SyncTarget::new("ws_1", "acc_a")]),
            orchestrator.clone(),
        )
        .start();
        time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.is_running("ws_1", "acc_a"));

        let stats = handle.stop().await;
        match &stats.last_outcomes["ws_1/acc_a"] {
            TargetOutcome::Completed(result) => assert!(result.cancelled),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!orchestrator.is_running("ws_1", "acc_a"));
    }
}
