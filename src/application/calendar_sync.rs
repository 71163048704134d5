use crate::application::NowProvider;
use crate::application::calendar_setup::CalendarResolver;
use crate::application::credentials::AccessTokenProvider;
use crate::domain::models::{
    InstanceStatus, LocalRef, SyncRecord, Task, TaskInstance, TaskStatus, User, local_instant,
};
use crate::infrastructure::config::{AppConfig, SyncSettings};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::{
    EventContent, GoogleCalendarEvent, content_hash, encode_event, local_ref_of,
};
use crate::infrastructure::google_calendar_client::{GoogleCalendarClient, ListEventsRequest};
use crate::infrastructure::storage::{
    InstanceStore, SyncRecordRepository, TaskRepository, UserRepository,
};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration as TokioDuration, sleep};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

impl From<&SyncSettings> for RetryPolicy {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            max_attempts: settings.retry_max_attempts,
            base_delay_ms: settings.retry_base_delay_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub horizon_days: i64,
    pub lookback_days: i64,
    pub page_size: u32,
    pub max_events: usize,
}

impl SyncConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            horizon_days: i64::from(config.materialization.horizon_days),
            lookback_days: i64::from(config.sync.lookback_days),
            page_size: config.sync.page_size,
            max_events: config.sync.max_events as usize,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// A local item that can occupy a date on the remote calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulableItem {
    Task(Task),
    Instance { instance: TaskInstance, task: Task },
}

impl SchedulableItem {
    pub fn local_ref(&self) -> LocalRef {
        match self {
            Self::Task(task) => LocalRef::Task(task.id.clone()),
            Self::Instance { instance, .. } => LocalRef::Instance(instance.id.clone()),
        }
    }

    /// What the remote event should show, or `None` when the item should not
    /// be on the calendar at all.
    pub fn content(&self, tz: Tz) -> Option<EventContent> {
        match self {
            Self::Task(task) => {
                if task.archived || task.is_recurring {
                    return None;
                }
                Some(EventContent {
                    title: task.title.clone(),
                    description: task.description.clone(),
                    date: task.effective_date(tz)?,
                    time: task.scheduled_time,
                    duration_minutes: task.duration_minutes,
                    priority: task.priority,
                    completed: task.status == TaskStatus::Completed,
                })
            }
            Self::Instance { instance, task } => {
                if task.archived || instance.status == InstanceStatus::Skipped {
                    return None;
                }
                Some(EventContent {
                    title: task.title.clone(),
                    description: task.description.clone(),
                    date: instance.instance_date,
                    // A rescheduled instance carries its own time.
                    time: instance
                        .scheduled_datetime
                        .map(|at| at.with_timezone(&tz).time())
                        .or(task.scheduled_time),
                    duration_minutes: task.duration_minutes,
                    priority: task.priority,
                    completed: instance.status == InstanceStatus::Completed,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    Created,
    Updated,
    Removed,
    /// A remote call failed; the item is retried on the next pass.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Remote events carrying our marker that no record pointed at.
    pub swept: usize,
}

impl SyncStats {
    fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Unchanged => self.skipped += 1,
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Removed => self.deleted += 1,
            SyncOutcome::Failed => self.failed += 1,
        }
    }

    fn absorb(&mut self, other: SyncStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.swept += other.swept;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRunSummary {
    pub users_synced: usize,
    pub users_failed: usize,
    pub stats: SyncStats,
}

/// Access token and target calendar, resolved once per batch.
#[derive(Debug, Clone)]
struct SyncSession {
    access_token: String,
    calendar_id: String,
}

/// Pushes local tasks and instances to the remote calendar.
///
/// Sync is one-way. Every mirrored item has a sync record holding the remote
/// event id and a fingerprint of what was last pushed; items whose
/// fingerprint is unchanged cost no remote calls at all.
pub struct CalendarSyncService<S, C, A>
where
    S: UserRepository + TaskRepository + InstanceStore + SyncRecordRepository,
    C: GoogleCalendarClient,
    A: AccessTokenProvider,
{
    store: Arc<S>,
    calendar_client: Arc<C>,
    token_provider: Arc<A>,
    resolver: CalendarResolver<S, C>,
    config: SyncConfig,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
}

impl<S, C, A> CalendarSyncService<S, C, A>
where
    S: UserRepository + TaskRepository + InstanceStore + SyncRecordRepository,
    C: GoogleCalendarClient,
    A: AccessTokenProvider,
{
    pub fn new(
        store: Arc<S>,
        calendar_client: Arc<C>,
        token_provider: Arc<A>,
        calendar_name: impl Into<String>,
    ) -> Self {
        let resolver = CalendarResolver::new(
            Arc::clone(&store),
            Arc::clone(&calendar_client),
            calendar_name,
        );
        Self {
            store,
            calendar_client,
            token_provider,
            resolver,
            config: SyncConfig::default(),
            retry_policy: RetryPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    /// Mirrors a single item. The fingerprint check runs before any
    /// credential or remote work.
    pub async fn sync_one(&self, user: &User, item: &SchedulableItem) -> Result<SyncOutcome, InfraError> {
        let local_ref = item.local_ref();
        let record = self.store.find_record(&user.id, &local_ref)?;

        let Some(content) = item.content(user.tz()) else {
            return match record {
                Some(_) => self.remove_one(user, &local_ref).await,
                None => Ok(SyncOutcome::Unchanged),
            };
        };
        let hash = content_hash(&content);
        if record.as_ref().is_some_and(|existing| existing.content_hash == hash) {
            return Ok(SyncOutcome::Unchanged);
        }

        let session = self.open_session(user).await?;
        self.push_item(&session, user, &local_ref, &content, &hash, record.as_ref())
            .await
    }

    /// Deletes the remote event of an item that should no longer be mirrored.
    pub async fn remove_one(&self, user: &User, local_ref: &LocalRef) -> Result<SyncOutcome, InfraError> {
        let Some(record) = self.store.find_record(&user.id, local_ref)? else {
            return Ok(SyncOutcome::Unchanged);
        };
        let session = self.open_session(user).await?;
        self.remove_record(&session, user, &record).await
    }

    pub async fn bulk_sync(&self, user: &User) -> Result<SyncStats, InfraError> {
        let now = (self.now_provider)();
        let tz = user.tz();
        let today = user.today(now);
        let window_start = today - Duration::days(self.config.lookback_days);
        let window_end = today + Duration::days(self.config.horizon_days);

        let mut items: Vec<SchedulableItem> = self
            .store
            .syncable_tasks_for_user(&user.id)?
            .into_iter()
            .map(SchedulableItem::Task)
            .collect();
        items.extend(
            self.store
                .syncable_instances_for_user(&user.id, window_start, window_end)?
                .into_iter()
                .map(|(instance, task)| SchedulableItem::Instance { instance, task }),
        );
        let records: HashMap<LocalRef, SyncRecord> = self
            .store
            .records_for_user(&user.id)?
            .into_iter()
            .map(|record| (record.local_ref.clone(), record))
            .collect();

        let session = self.open_session(user).await?;
        let mut stats = SyncStats::default();
        let mut touched: HashSet<LocalRef> = HashSet::new();

        for item in &items {
            let local_ref = item.local_ref();
            let Some(content) = item.content(tz) else {
                continue;
            };
            touched.insert(local_ref.clone());

            let record = records.get(&local_ref);
            let hash = content_hash(&content);
            if record.is_some_and(|existing| existing.content_hash == hash) {
                stats.skipped += 1;
                continue;
            }
            let outcome = self
                .push_item(&session, user, &local_ref, &content, &hash, record)
                .await?;
            stats.record(outcome);
        }

        for record in records.values().filter(|record| !touched.contains(&record.local_ref)) {
            if !self.is_orphan(record, window_start, window_end)? {
                continue;
            }
            let outcome = self.remove_record(&session, user, record).await?;
            stats.record(outcome);
        }

        stats.swept = self
            .sweep_untracked(&session, user, window_start, window_end)
            .await?;

        tracing::info!(
            user_id = %user.id,
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            skipped = stats.skipped,
            failed = stats.failed,
            swept = stats.swept,
            "bulk sync finished"
        );
        Ok(stats)
    }

    /// Removes every mirrored event and all sync records for the user.
    ///
    /// Local records are cleared even when the remote side is unreachable.
    pub async fn delete_all(&self, user: &User) -> Result<usize, InfraError> {
        let records = self.store.records_for_user(&user.id)?;
        match self.open_session(user).await {
            Ok(session) => {
                for record in &records {
                    let result = self
                        .delete_remote(&session, &record.external_event_id)
                        .await;
                    if let Err(error) = result {
                        tracing::warn!(
                            user_id = %user.id,
                            event_id = %record.external_event_id,
                            %error,
                            "failed deleting remote event"
                        );
                    }
                }
            }
            Err(error) => {
                tracing::warn!(user_id = %user.id, %error, "remote unavailable; clearing local sync records only");
            }
        }
        let deleted = self.store.delete_records_for_user(&user.id)?;
        tracing::info!(user_id = %user.id, deleted, "cleared sync records");
        Ok(deleted)
    }

    /// One bulk pass per sync-enabled user. A failing user does not stop the
    /// others.
    pub async fn sync_all_users(&self) -> Result<SyncRunSummary, InfraError> {
        let mut summary = SyncRunSummary::default();
        for user in self.store.sync_enabled_users()? {
            match self.bulk_sync(&user).await {
                Ok(stats) => {
                    summary.users_synced += 1;
                    summary.stats.absorb(stats);
                }
                Err(error) => {
                    summary.users_failed += 1;
                    tracing::warn!(user_id = %user.id, %error, "sync failed for user");
                }
            }
        }
        Ok(summary)
    }

    async fn open_session(&self, user: &User) -> Result<SyncSession, InfraError> {
        let token = self.token_provider.ensure_fresh_token(&user.id).await?;
        let calendar = self.resolver.ensure_calendar(user, &token.access_token).await?;
        Ok(SyncSession {
            access_token: token.access_token,
            calendar_id: calendar.calendar_id().to_string(),
        })
    }

    async fn push_item(
        &self,
        session: &SyncSession,
        user: &User,
        local_ref: &LocalRef,
        content: &EventContent,
        hash: &str,
        record: Option<&SyncRecord>,
    ) -> Result<SyncOutcome, InfraError> {
        let event = encode_event(content, local_ref, user.tz());
        let now = (self.now_provider)();

        let Some(record) = record else {
            let event_id = match self.create_remote(session, &event).await {
                Ok(event_id) => event_id,
                Err(error) => {
                    tracing::warn!(user_id = %user.id, local_ref = %local_ref.encode(), %error, "event create failed");
                    return Ok(SyncOutcome::Failed);
                }
            };
            let record = SyncRecord {
                id: Uuid::new_v4().to_string(),
                user_id: user.id.clone(),
                local_ref: local_ref.clone(),
                external_event_id: event_id.clone(),
                content_hash: hash.to_string(),
                last_synced_at: now,
            };
            if self.store.insert_record(&record)? {
                return Ok(SyncOutcome::Created);
            }
            // A concurrent pass mirrored the same item first; drop our copy.
            tracing::debug!(user_id = %user.id, local_ref = %local_ref.encode(), "lost record race");
            if let Err(error) = self.delete_remote(session, &event_id).await {
                tracing::warn!(user_id = %user.id, event_id = %event_id, %error, "failed deleting duplicate event");
            }
            return Ok(SyncOutcome::Unchanged);
        };

        match self.update_remote(session, &record.external_event_id, &event).await {
            Ok(()) => {
                self.store
                    .update_record(&record.id, &record.external_event_id, hash, now)?;
                Ok(SyncOutcome::Updated)
            }
            Err(error) if error.is_gone() => {
                tracing::info!(
                    user_id = %user.id,
                    event_id = %record.external_event_id,
                    "remote event disappeared; recreating"
                );
                match self.create_remote(session, &event).await {
                    Ok(event_id) => {
                        self.store.update_record(&record.id, &event_id, hash, now)?;
                        Ok(SyncOutcome::Updated)
                    }
                    Err(error) => {
                        tracing::warn!(user_id = %user.id, local_ref = %local_ref.encode(), %error, "event recreate failed");
                        Ok(SyncOutcome::Failed)
                    }
                }
            }
            Err(error) => {
                tracing::warn!(user_id = %user.id, local_ref = %local_ref.encode(), %error, "event update failed");
                Ok(SyncOutcome::Failed)
            }
        }
    }

    async fn remove_record(
        &self,
        session: &SyncSession,
        user: &User,
        record: &SyncRecord,
    ) -> Result<SyncOutcome, InfraError> {
        match self.delete_remote(session, &record.external_event_id).await {
            Ok(()) => {
                self.store.delete_record(&record.id)?;
                Ok(SyncOutcome::Removed)
            }
            Err(error) => {
                tracing::warn!(
                    user_id = %user.id,
                    event_id = %record.external_event_id,
                    %error,
                    "orphan delete failed; keeping record"
                );
                Ok(SyncOutcome::Failed)
            }
        }
    }

    /// Untouched records are orphans unless they belong to an instance that
    /// merely aged out of the sync window.
    fn is_orphan(
        &self,
        record: &SyncRecord,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<bool, InfraError> {
        match &record.local_ref {
            LocalRef::Task(_) => Ok(true),
            LocalRef::Instance(instance_id) => Ok(match self.store.get_instance(instance_id)? {
                Some(instance) => {
                    (window_start..=window_end).contains(&instance.instance_date)
                }
                None => true,
            }),
        }
    }

    /// Whether the item behind `local_ref` still belongs on this user's calendar.
    fn is_live(&self, user: &User, local_ref: &LocalRef) -> Result<bool, InfraError> {
        let item = match local_ref {
            LocalRef::Task(task_id) => self.store.get_task(task_id)?.map(SchedulableItem::Task),
            LocalRef::Instance(instance_id) => match self.store.get_instance(instance_id)? {
                Some(instance) => self
                    .store
                    .get_task(&instance.task_id)?
                    .map(|task| SchedulableItem::Instance { instance, task }),
                None => None,
            },
        };
        Ok(item.is_some_and(|item| {
            let owner = match &item {
                SchedulableItem::Task(task) | SchedulableItem::Instance { task, .. } => &task.user_id,
            };
            *owner == user.id && item.content(user.tz()).is_some()
        }))
    }

    async fn sweep_untracked(
        &self,
        session: &SyncSession,
        user: &User,
        window_start: NaiveDate,
        window_end: NaiveDate,
    ) -> Result<usize, InfraError> {
        let tz = user.tz();
        let request = ListEventsRequest {
            time_min: Some(start_of_day(tz, window_start)),
            time_max: Some(start_of_day(tz, window_end + Duration::days(1))),
            page_size: self.config.page_size,
            max_events: self.config.max_events,
        };
        let client = self.calendar_client.as_ref();
        let access_token = session.access_token.as_str();
        let calendar_id = session.calendar_id.as_str();
        let listed = match self
            .with_retry(move || client.list_events(access_token, calendar_id, request.clone()))
            .await
        {
            Ok(listed) => listed,
            Err(error) => {
                tracing::warn!(user_id = %user.id, %error, "listing remote events failed; sweep skipped");
                return Ok(0);
            }
        };
        if listed.truncated {
            tracing::debug!(user_id = %user.id, "remote listing hit the event ceiling");
        }

        // Records are read after listing so events created meanwhile are known.
        let known: HashSet<String> = self
            .store
            .records_for_user(&user.id)?
            .into_iter()
            .map(|record| record.external_event_id)
            .collect();

        let mut swept = 0;
        for event in listed.events {
            let cancelled = event
                .status
                .as_deref()
                .is_some_and(|status| status.eq_ignore_ascii_case("cancelled"));
            let Some(event_id) = event.id.as_deref() else {
                continue;
            };
            let Some(local_ref) = local_ref_of(&event) else {
                continue;
            };
            if cancelled || known.contains(event_id) {
                continue;
            }
            // A sync of this item may have created the event after the records
            // were read; only a record pointing elsewhere or a dead item
            // makes it safe to delete.
            match self.store.find_record(&user.id, &local_ref)? {
                Some(record) if record.external_event_id == event_id => continue,
                Some(_) => {}
                None if self.is_live(user, &local_ref)? => {
                    tracing::debug!(user_id = %user.id, event_id, "untracked event for live item kept");
                    continue;
                }
                None => {}
            }
            match self.delete_remote(session, event_id).await {
                Ok(()) => swept += 1,
                Err(error) => {
                    tracing::warn!(user_id = %user.id, event_id, %error, "failed deleting untracked event");
                }
            }
        }
        Ok(swept)
    }

    async fn create_remote(
        &self,
        session: &SyncSession,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError> {
        let client = self.calendar_client.as_ref();
        let access_token = session.access_token.as_str();
        let calendar_id = session.calendar_id.as_str();
        self.with_retry(move || client.create_event(access_token, calendar_id, event))
            .await
    }

    async fn update_remote(
        &self,
        session: &SyncSession,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError> {
        let client = self.calendar_client.as_ref();
        let access_token = session.access_token.as_str();
        let calendar_id = session.calendar_id.as_str();
        self.with_retry(move || client.update_event(access_token, calendar_id, event_id, event))
            .await
    }

    /// Deleting something already gone counts as success.
    async fn delete_remote(&self, session: &SyncSession, event_id: &str) -> Result<(), InfraError> {
        let client = self.calendar_client.as_ref();
        let access_token = session.access_token.as_str();
        let calendar_id = session.calendar_id.as_str();
        match self
            .with_retry(move || client.delete_event(access_token, calendar_id, event_id))
            .await
        {
            Err(error) if error.is_gone() => Ok(()),
            other => other,
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, InfraError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, InfraError>>,
    {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self
                        .retry_policy
                        .base_delay_ms
                        .saturating_mul(2u64.saturating_pow(u32::from(attempt)));
                    tracing::debug!(attempt, delay_ms = delay, %error, "transient remote failure; retrying");
                    sleep(TokioDuration::from_millis(delay)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn start_of_day(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    local_instant(tz, date, NaiveTime::MIN).unwrap_or_else(|| date.and_time(NaiveTime::MIN).and_utc())
}
