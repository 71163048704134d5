use crate::application::NowProvider;
use crate::domain::models::{InstanceStatus, Task, TaskInstance, User, local_instant};
use crate::domain::recurrence::{MAX_OCCURRENCES, Occurrence, generate_anchored};
use crate::infrastructure::config::MaterializationSettings;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::{InsertOutcome, InstanceStore, TaskRepository, UserRepository};
use chrono::{Duration, NaiveDate, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterializationConfig {
    /// Days past today that instances are kept materialized for.
    pub horizon_days: i64,
    /// Catch-up only re-runs tasks whose furthest instance falls inside this
    /// many days of the horizon edge.
    pub grace_days: i64,
}

impl Default for MaterializationConfig {
    fn default() -> Self {
        Self::from(&MaterializationSettings::default())
    }
}

impl From<&MaterializationSettings> for MaterializationConfig {
    fn from(settings: &MaterializationSettings) -> Self {
        Self {
            horizon_days: i64::from(settings.horizon_days),
            grace_days: i64::from(settings.grace_days),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegenerateOutcome {
    pub deleted: usize,
    pub created: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializationSummary {
    pub users_processed: usize,
    pub tasks_checked: usize,
    pub tasks_materialized: usize,
    pub instances_created: usize,
    pub failures: usize,
}

pub struct Materializer<S>
where
    S: UserRepository + TaskRepository + InstanceStore,
{
    store: Arc<S>,
    config: MaterializationConfig,
    now_provider: NowProvider,
}

impl<S> Materializer<S>
where
    S: UserRepository + TaskRepository + InstanceStore,
{
    pub fn new(store: Arc<S>, config: MaterializationConfig) -> Self {
        Self {
            store,
            config,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn config(&self) -> MaterializationConfig {
        self.config
    }

    /// Persists every missing occurrence of `task` up to `horizon_days` past
    /// today and returns only the rows this call created.
    pub fn materialize(&self, task: &Task, horizon_days: i64) -> Result<Vec<TaskInstance>, InfraError> {
        if !task.is_materializable() {
            return Ok(Vec::new());
        }
        let user = self.owner_of(task)?;
        self.materialize_for(&user, task, horizon_days)
    }

    /// Drops pending instances from today on and rebuilds them from the
    /// current rule. Completed and skipped instances are history and stay.
    pub fn regenerate(&self, task: &Task) -> Result<RegenerateOutcome, InfraError> {
        let user = self.owner_of(task)?;
        let today = user.today((self.now_provider)());
        let deleted = self.store.delete_pending_from(&task.id, today)?;
        let created = if task.is_materializable() {
            self.materialize_for(&user, task, self.config.horizon_days)?.len()
        } else {
            0
        };
        tracing::info!(task_id = %task.id, deleted, created, "regenerated task instances");
        Ok(RegenerateOutcome { deleted, created })
    }

    /// Catch-up pass over every user with pending recurring work.
    pub fn ensure_all_materialized(&self, horizon_days: i64) -> Result<MaterializationSummary, InfraError> {
        let mut summary = MaterializationSummary::default();
        let users = self.store.users_with_pending_recurring_tasks()?;

        for user in users {
            match self.ensure_user_materialized(&user, horizon_days, &mut summary) {
                Ok(()) => summary.users_processed += 1,
                Err(error) => {
                    summary.failures += 1;
                    tracing::warn!(user_id = %user.id, %error, "materialization failed for user");
                }
            }
        }

        tracing::info!(
            users = summary.users_processed,
            checked = summary.tasks_checked,
            materialized = summary.tasks_materialized,
            created = summary.instances_created,
            failures = summary.failures,
            "materialization pass finished"
        );
        Ok(summary)
    }

    fn ensure_user_materialized(
        &self,
        user: &User,
        horizon_days: i64,
        summary: &mut MaterializationSummary,
    ) -> Result<(), InfraError> {
        let tasks = self.store.recurring_tasks_for_user(&user.id)?;
        if tasks.is_empty() {
            return Ok(());
        }
        let task_ids: Vec<String> = tasks.iter().map(|task| task.id.clone()).collect();
        let furthest = self.store.max_instance_dates(&task_ids)?;

        let today = user.today((self.now_provider)());
        let threshold = today + Duration::days(horizon_days - self.config.grace_days);

        for task in tasks.iter().filter(|task| task.is_materializable()) {
            summary.tasks_checked += 1;
            let behind = furthest
                .get(&task.id)
                .is_none_or(|max_date| *max_date < threshold);
            if !behind {
                continue;
            }
            match self.materialize_for(user, task, horizon_days) {
                Ok(created) => {
                    summary.tasks_materialized += 1;
                    summary.instances_created += created.len();
                }
                Err(error) => {
                    summary.failures += 1;
                    tracing::warn!(user_id = %user.id, task_id = %task.id, %error, "task materialization failed");
                }
            }
        }
        Ok(())
    }

    fn materialize_for(
        &self,
        user: &User,
        task: &Task,
        horizon_days: i64,
    ) -> Result<Vec<TaskInstance>, InfraError> {
        let now = (self.now_provider)();
        let tz = user.tz();
        let today = user.today(now);

        let start = task.recurrence_start.unwrap_or(today);
        let horizon_end = today + Duration::days(horizon_days.max(0));
        let end = match task.recurrence_end {
            Some(recurrence_end) => horizon_end.min(recurrence_end),
            None => horizon_end,
        };
        if end < start {
            return Ok(Vec::new());
        }
        let anchor = task
            .recurrence_start
            .unwrap_or_else(|| task.created_at.with_timezone(&tz).date_naive());

        let occurrences = self.occurrences_between(task, anchor, start, end);
        let existing = self.store.instance_dates_in_range(&task.id, start, end)?;

        let mut created = Vec::new();
        for occurrence in occurrences.into_iter().filter(|item| !existing.contains(&item.date)) {
            let instance = TaskInstance {
                id: Uuid::new_v4().to_string(),
                task_id: task.id.clone(),
                instance_date: occurrence.date,
                scheduled_datetime: occurrence
                    .time
                    .and_then(|time| local_instant(tz, occurrence.date, time)),
                status: InstanceStatus::Pending,
                completed_at: None,
                created_at: now,
                updated_at: now,
            };
            match self.store.insert_instance(&instance)? {
                InsertOutcome::Created(row) => created.push(row),
                InsertOutcome::AlreadyExists(row) => {
                    tracing::debug!(task_id = %task.id, date = %row.instance_date, "instance already materialized");
                }
            }
        }

        if !created.is_empty() {
            tracing::debug!(task_id = %task.id, created = created.len(), %start, %end, "materialized instances");
        }
        Ok(created)
    }

    /// All occurrences in `[start, end]`. A window holding more than one
    /// generator call's worth is walked in consecutive slices so a long
    /// backfill still reaches the horizon.
    fn occurrences_between(
        &self,
        task: &Task,
        anchor: NaiveDate,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Vec<Occurrence> {
        let mut occurrences = Vec::new();
        let mut slice_start = start;
        loop {
            let slice = generate_anchored(
                task.recurrence_rule.as_ref(),
                anchor,
                slice_start,
                end,
                task.scheduled_time,
            );
            let full = slice.len() >= MAX_OCCURRENCES;
            let resume = slice.last().and_then(|last| last.date.succ_opt());
            occurrences.extend(slice);
            match resume {
                Some(next) if full && next <= end => {
                    tracing::warn!(
                        task_id = %task.id,
                        generated = occurrences.len(),
                        %next,
                        "occurrence ceiling reached; continuing with the next slice"
                    );
                    slice_start = next;
                }
                _ => break,
            }
        }
        occurrences
    }

    fn owner_of(&self, task: &Task) -> Result<User, InfraError> {
        self.store
            .get_user(&task.user_id)?
            .ok_or_else(|| InfraError::NotFound(format!("user {} not found", task.user_id)))
    }
}
