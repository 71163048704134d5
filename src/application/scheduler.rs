use crate::application::calendar_sync::{CalendarSyncService, SyncRunSummary};
use crate::application::credentials::AccessTokenProvider;
use crate::application::materializer::{MaterializationSummary, Materializer};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::google_calendar_client::GoogleCalendarClient;
use crate::infrastructure::storage::{
    InstanceStore, SyncRecordRepository, TaskRepository, UserRepository,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[async_trait]
pub trait MaterializationJob: Send + Sync {
    async fn run_materialization(&self) -> Result<MaterializationSummary, InfraError>;
}

#[async_trait]
pub trait SyncJob: Send + Sync {
    async fn run_sync(&self) -> Result<SyncRunSummary, InfraError>;
}

#[async_trait]
impl<S> MaterializationJob for Materializer<S>
where
    S: UserRepository + TaskRepository + InstanceStore,
{
    async fn run_materialization(&self) -> Result<MaterializationSummary, InfraError> {
        self.ensure_all_materialized(self.config().horizon_days)
    }
}

#[async_trait]
impl<S, C, A> SyncJob for CalendarSyncService<S, C, A>
where
    S: UserRepository + TaskRepository + InstanceStore + SyncRecordRepository,
    C: GoogleCalendarClient,
    A: AccessTokenProvider,
{
    async fn run_sync(&self) -> Result<SyncRunSummary, InfraError> {
        self.sync_all_users().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub materialize_interval: Duration,
    pub sync_interval: Duration,
}

impl SchedulerConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            materialize_interval: Duration::from_secs(config.materialization.interval_secs),
            sync_interval: Duration::from_secs(config.sync.interval_secs),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

struct RunningLoops {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Runs materialization catch-up and calendar sync on independent timers.
///
/// Both loops run once right after `start` and then on their interval. A sync
/// pass can also be requested early with `trigger_sync`. `stop` cancels both
/// loops at their next sleep boundary and waits for them to exit; the
/// scheduler can be started again afterwards.
pub struct BackgroundScheduler {
    materialization: Arc<dyn MaterializationJob>,
    sync: Arc<dyn SyncJob>,
    config: SchedulerConfig,
    sync_trigger: Arc<Notify>,
    running: Mutex<Option<RunningLoops>>,
}

impl BackgroundScheduler {
    pub fn new(
        materialization: Arc<dyn MaterializationJob>,
        sync: Arc<dyn SyncJob>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            materialization,
            sync,
            config,
            sync_trigger: Arc::new(Notify::new()),
            running: Mutex::new(None),
        }
    }

    /// Spawns both loops. Returns false when they are already running.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let handles = vec![
            tokio::spawn(materialization_loop(
                Arc::clone(&self.materialization),
                self.config.materialize_interval,
                cancel.child_token(),
            )),
            tokio::spawn(sync_loop(
                Arc::clone(&self.sync),
                self.config.sync_interval,
                Arc::clone(&self.sync_trigger),
                cancel.child_token(),
            )),
        ];
        *running = Some(RunningLoops { cancel, handles });
        info!(
            materialize_interval_secs = self.config.materialize_interval.as_secs(),
            sync_interval_secs = self.config.sync_interval.as_secs(),
            "background scheduler started"
        );
        true
    }

    pub async fn stop(&self) {
        let loops = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(loops) = loops else {
            return;
        };

        loops.cancel.cancel();
        for handle in loops.handles {
            if let Err(error) = handle.await {
                warn!(%error, "scheduler loop ended abnormally");
            }
        }
        info!("background scheduler stopped");
    }

    /// Requests a sync pass without waiting for the interval.
    pub fn trigger_sync(&self) {
        self.sync_trigger.notify_one();
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

async fn materialization_loop(
    job: Arc<dyn MaterializationJob>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        match job.run_materialization().await {
            Ok(summary) => debug!(
                users = summary.users_processed,
                created = summary.instances_created,
                failures = summary.failures,
                "materialization tick"
            ),
            Err(error) => warn!(%error, "materialization pass failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("materialization loop exited");
}

async fn sync_loop(
    job: Arc<dyn SyncJob>,
    interval: Duration,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        match job.run_sync().await {
            Ok(summary) => debug!(
                users = summary.users_synced,
                failed_users = summary.users_failed,
                created = summary.stats.created,
                updated = summary.stats.updated,
                deleted = summary.stats.deleted,
                "sync tick"
            ),
            Err(error) => warn!(%error, "sync pass failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
            _ = trigger.notified() => debug!("sync triggered"),
        }
    }
    debug!("sync loop exited");
}
