//! Recurring-task materialization and one-way calendar mirroring.
//!
//! Recurring tasks are expanded into dated instances within a rolling
//! horizon, and tasks and instances are pushed to a Google calendar. A
//! background scheduler keeps both up to date.

pub mod application;
pub mod domain;
pub mod infrastructure;

use application::bootstrap::bootstrap_workspace;
use application::calendar_sync::{CalendarSyncService, RetryPolicy, SyncConfig, SyncRunSummary};
use application::credentials::{CredentialRefresher, RefreshPolicy};
use application::materializer::{MaterializationConfig, Materializer};
use application::scheduler::{BackgroundScheduler, SchedulerConfig, SyncJob};
use async_trait::async_trait;
use infrastructure::config::{AppConfig, load_oauth_config_from_env};
use infrastructure::error::InfraError;
use infrastructure::google_calendar_client::ReqwestGoogleCalendarClient;
use infrastructure::oauth_client::ReqwestOAuthClient;
use infrastructure::storage::SqliteStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Stand-in sync job used when no OAuth client is configured.
struct DisabledSync;

#[async_trait]
impl SyncJob for DisabledSync {
    async fn run_sync(&self) -> Result<SyncRunSummary, InfraError> {
        tracing::debug!("calendar sync disabled; skipping pass");
        Ok(SyncRunSummary::default())
    }
}

fn build_sync_job(config: &AppConfig, store: &Arc<SqliteStore>) -> Result<Arc<dyn SyncJob>, InfraError> {
    let oauth = match load_oauth_config_from_env() {
        Ok(oauth) => oauth,
        Err(error) => {
            tracing::warn!(%error, "google client not configured; calendar sync disabled");
            return Ok(Arc::new(DisabledSync));
        }
    };

    let timeout = Duration::from_secs(config.sync.request_timeout_secs);
    let refresher = CredentialRefresher::new(
        oauth,
        Arc::clone(store),
        Arc::new(ReqwestOAuthClient::new(timeout)?),
    )
    .with_policy(RefreshPolicy::from(&config.credentials));

    let service = CalendarSyncService::new(
        Arc::clone(store),
        Arc::new(ReqwestGoogleCalendarClient::new(timeout)?),
        Arc::new(refresher),
        config.calendar_name.clone(),
    )
    .with_config(SyncConfig::from_app_config(config))
    .with_retry_policy(RetryPolicy::from(&config.sync));
    Ok(Arc::new(service))
}

/// Bootstraps the workspace and runs the background loops until ctrl-c.
pub async fn run(workspace_root: &Path) -> Result<(), InfraError> {
    let workspace = bootstrap_workspace(workspace_root)?;
    let config = workspace.config;
    let store = Arc::new(SqliteStore::open(&workspace.database_path)?);

    let materializer = Materializer::new(
        Arc::clone(&store),
        MaterializationConfig::from(&config.materialization),
    );
    let scheduler = BackgroundScheduler::new(
        Arc::new(materializer),
        build_sync_job(&config, &store)?,
        SchedulerConfig::from_app_config(&config),
    );

    scheduler.start();
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    scheduler.stop().await;
    Ok(())
}
