use crate::domain::models::{
    InstanceStatus, InstanceWithTask, LocalRef, OAuthToken, Priority, SyncRecord, Task,
    TaskInstance, TaskStatus, User,
};
use crate::domain::recurrence::RecurrenceRule;
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str = "t.id, t.user_id, t.title, t.description, t.domain, t.is_recurring, \
     t.recurrence_rule, t.recurrence_start, t.recurrence_end, t.scheduled_date, t.scheduled_time, \
     t.duration_minutes, t.priority, t.status, t.completed_at, t.archived, t.created_at, t.updated_at";

const INSTANCE_COLUMNS: &str = "i.id, i.task_id, i.instance_date, i.scheduled_datetime, i.status, \
     i.completed_at, i.created_at, i.updated_at";
const INSTANCE_COLUMN_COUNT: usize = 8;

const RECORD_COLUMNS: &str =
    "id, user_id, task_id, instance_id, external_event_id, content_hash, last_synced_at";

/// Result of an idempotent instance insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(TaskInstance),
    /// Another writer already materialized this `(task_id, instance_date)`.
    AlreadyExists(TaskInstance),
}

impl InsertOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn into_instance(self) -> TaskInstance {
        match self {
            Self::Created(instance) | Self::AlreadyExists(instance) => instance,
        }
    }
}

pub trait UserRepository: Send + Sync {
    fn upsert_user(&self, user: &User) -> Result<(), InfraError>;
    fn get_user(&self, user_id: &str) -> Result<Option<User>, InfraError>;
    fn users_with_pending_recurring_tasks(&self) -> Result<Vec<User>, InfraError>;
    fn sync_enabled_users(&self) -> Result<Vec<User>, InfraError>;
    fn set_calendar_id(&self, user_id: &str, calendar_id: &str) -> Result<(), InfraError>;
}

pub trait TaskRepository: Send + Sync {
    fn upsert_task(&self, task: &Task) -> Result<(), InfraError>;
    fn get_task(&self, task_id: &str) -> Result<Option<Task>, InfraError>;
    fn tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError>;
    /// Pending, unarchived recurring tasks.
    fn recurring_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError>;
    /// Unarchived one-off tasks that occupy a calendar date.
    fn syncable_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError>;
    fn delete_task(&self, task_id: &str) -> Result<bool, InfraError>;
}

pub trait InstanceStore: Send + Sync {
    fn insert_instance(&self, instance: &TaskInstance) -> Result<InsertOutcome, InfraError>;
    fn get_instance(&self, instance_id: &str) -> Result<Option<TaskInstance>, InfraError>;
    fn instances_for_task(&self, task_id: &str) -> Result<Vec<TaskInstance>, InfraError>;
    fn instance_dates_in_range(
        &self,
        task_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HashSet<NaiveDate>, InfraError>;
    fn max_instance_dates(&self, task_ids: &[String]) -> Result<HashMap<String, NaiveDate>, InfraError>;
    /// Deletes pending instances dated `from` or later; resolved ones are kept.
    fn delete_pending_from(&self, task_id: &str, from: NaiveDate) -> Result<usize, InfraError>;
    fn instances_in_range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceWithTask>, InfraError>;
    /// Earliest pending instance on or after `from`, per task.
    fn next_pending_instances(
        &self,
        task_ids: &[String],
        from: NaiveDate,
    ) -> Result<HashMap<String, TaskInstance>, InfraError>;
    fn pending_instances_before(
        &self,
        user_id: &str,
        cutoff: NaiveDate,
    ) -> Result<Vec<InstanceWithTask>, InfraError>;
    fn resolve_pending_before(
        &self,
        user_id: &str,
        cutoff: NaiveDate,
        status: InstanceStatus,
        at: DateTime<Utc>,
    ) -> Result<usize, InfraError>;
    fn set_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, InfraError>;
    fn reschedule_instance(
        &self,
        instance_id: &str,
        new_date: NaiveDate,
        scheduled_datetime: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, InfraError>;
    /// Instances of unarchived tasks in `[start, end]` with their parent task.
    fn syncable_instances_for_user(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<(TaskInstance, Task)>, InfraError>;
}

pub trait SyncRecordRepository: Send + Sync {
    fn find_record(&self, user_id: &str, local_ref: &LocalRef) -> Result<Option<SyncRecord>, InfraError>;
    fn records_for_user(&self, user_id: &str) -> Result<Vec<SyncRecord>, InfraError>;
    /// Returns false when a record for the same local item already exists.
    fn insert_record(&self, record: &SyncRecord) -> Result<bool, InfraError>;
    fn update_record(
        &self,
        record_id: &str,
        external_event_id: &str,
        content_hash: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), InfraError>;
    fn delete_record(&self, record_id: &str) -> Result<(), InfraError>;
    fn delete_records_for_user(&self, user_id: &str) -> Result<usize, InfraError>;
}

pub trait TokenStore: Send + Sync {
    fn load_token(&self, user_id: &str) -> Result<Option<OAuthToken>, InfraError>;
    /// Writes every token field in one statement; the lease columns are untouched.
    fn save_token(&self, user_id: &str, token: &OAuthToken, at: DateTime<Utc>) -> Result<(), InfraError>;
    /// Like `save_token`, but only while `owner` still holds the refresh lease.
    /// Returns false, writing nothing, when the lease has passed to someone else.
    fn save_token_under_lease(
        &self,
        user_id: &str,
        owner: &str,
        token: &OAuthToken,
        at: DateTime<Utc>,
    ) -> Result<bool, InfraError>;
    fn delete_token(&self, user_id: &str) -> Result<(), InfraError>;
    /// Non-blocking: takes the lease only if it is free or expired.
    fn try_acquire_refresh_lease(
        &self,
        user_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<bool, InfraError>;
    fn release_refresh_lease(&self, user_id: &str, owner: &str) -> Result<(), InfraError>;
}

pub struct SqliteStore {
    connection: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, InfraError> {
        let connection = Connection::open(path)?;
        let journal_mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), %journal_mode, "opened sqlite store");
        Self::initialize(connection)
    }

    pub fn open_in_memory() -> Result<Self, InfraError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(connection: Connection) -> Result<Self, InfraError> {
        connection.busy_timeout(BUSY_TIMEOUT)?;
        connection.pragma_update(None, "foreign_keys", true)?;
        connection.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, InfraError> {
        self.connection
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("sqlite connection: {error}")))
    }
}

pub fn initialize_database(path: &Path) -> Result<(), InfraError> {
    SqliteStore::open(path).map(|_| ())
}

impl UserRepository for SqliteStore {
    fn upsert_user(&self, user: &User) -> Result<(), InfraError> {
        if user.id.trim().is_empty() {
            return Err(InfraError::InvalidInput("user.id must not be empty".to_string()));
        }
        self.connection()?.execute(
            "INSERT INTO users (id, timezone, sync_enabled, calendar_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
               timezone = excluded.timezone,
               sync_enabled = excluded.sync_enabled,
               calendar_id = excluded.calendar_id",
            params![user.id, user.timezone, user.sync_enabled, user.calendar_id],
        )?;
        Ok(())
    }

    fn get_user(&self, user_id: &str) -> Result<Option<User>, InfraError> {
        let user = self
            .connection()?
            .query_row(
                "SELECT id, timezone, sync_enabled, calendar_id FROM users WHERE id = ?1",
                params![user_id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn users_with_pending_recurring_tasks(&self) -> Result<Vec<User>, InfraError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT u.id, u.timezone, u.sync_enabled, u.calendar_id
             FROM users u
             WHERE EXISTS (
               SELECT 1 FROM tasks t
               WHERE t.user_id = u.id AND t.is_recurring = 1
                 AND t.archived = 0 AND t.status = 'pending'
             )
             ORDER BY u.id",
        )?;
        let users = statement
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn sync_enabled_users(&self) -> Result<Vec<User>, InfraError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT id, timezone, sync_enabled, calendar_id FROM users
             WHERE sync_enabled = 1 ORDER BY id",
        )?;
        let users = statement
            .query_map([], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn set_calendar_id(&self, user_id: &str, calendar_id: &str) -> Result<(), InfraError> {
        let updated = self.connection()?.execute(
            "UPDATE users SET calendar_id = ?2 WHERE id = ?1",
            params![user_id, calendar_id],
        )?;
        if updated == 0 {
            return Err(InfraError::NotFound(format!("user {user_id}")));
        }
        Ok(())
    }
}

impl TaskRepository for SqliteStore {
    fn upsert_task(&self, task: &Task) -> Result<(), InfraError> {
        task.validate().map_err(InfraError::InvalidInput)?;
        let rule_json = task.recurrence_rule.as_ref().map(RecurrenceRule::to_json);
        self.connection()?.execute(
            "INSERT INTO tasks (
               id, user_id, title, description, domain, is_recurring, recurrence_rule,
               recurrence_start, recurrence_end, scheduled_date, scheduled_time,
               duration_minutes, priority, status, completed_at, archived, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(id) DO UPDATE SET
               title = excluded.title,
               description = excluded.description,
               domain = excluded.domain,
               is_recurring = excluded.is_recurring,
               recurrence_rule = excluded.recurrence_rule,
               recurrence_start = excluded.recurrence_start,
               recurrence_end = excluded.recurrence_end,
               scheduled_date = excluded.scheduled_date,
               scheduled_time = excluded.scheduled_time,
               duration_minutes = excluded.duration_minutes,
               priority = excluded.priority,
               status = excluded.status,
               completed_at = excluded.completed_at,
               archived = excluded.archived,
               updated_at = excluded.updated_at",
            params![
                task.id,
                task.user_id,
                task.title,
                task.description,
                task.domain,
                task.is_recurring,
                rule_json,
                task.recurrence_start,
                task.recurrence_end,
                task.scheduled_date,
                task.scheduled_time,
                task.duration_minutes,
                task.priority.as_str(),
                task.status.as_str(),
                task.completed_at,
                task.archived,
                task.created_at,
                task.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
        let task = self
            .connection()?
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1"),
                params![task_id],
                |row| task_from_row(row, 0),
            )
            .optional()?;
        Ok(task)
    }

    fn tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        self.query_tasks("t.user_id = ?1", user_id)
    }

    fn recurring_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        self.query_tasks(
            "t.user_id = ?1 AND t.is_recurring = 1 AND t.archived = 0 AND t.status = 'pending'",
            user_id,
        )
    }

    fn syncable_tasks_for_user(&self, user_id: &str) -> Result<Vec<Task>, InfraError> {
        self.query_tasks(
            "t.user_id = ?1 AND t.is_recurring = 0 AND t.archived = 0
             AND (t.scheduled_date IS NOT NULL
                  OR (t.status = 'completed' AND t.completed_at IS NOT NULL))",
            user_id,
        )
    }

    fn delete_task(&self, task_id: &str) -> Result<bool, InfraError> {
        let deleted = self
            .connection()?
            .execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        Ok(deleted > 0)
    }
}

impl SqliteStore {
    fn query_tasks(&self, condition: &str, user_id: &str) -> Result<Vec<Task>, InfraError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t WHERE {condition} ORDER BY t.created_at, t.id"
        ))?;
        let tasks = statement
            .query_map(params![user_id], |row| task_from_row(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn query_instances_with_task(
        &self,
        condition: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<InstanceWithTask>, InfraError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS}, t.title, t.domain
             FROM task_instances i JOIN tasks t ON t.id = i.task_id
             WHERE {condition}
             ORDER BY i.instance_date, i.scheduled_datetime, t.title"
        ))?;
        let rows = statement
            .query_map(params, |row| {
                Ok(InstanceWithTask {
                    instance: instance_from_row(row, 0)?,
                    task_title: row.get(INSTANCE_COLUMN_COUNT)?,
                    task_domain: row.get(INSTANCE_COLUMN_COUNT + 1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl InstanceStore for SqliteStore {
    fn insert_instance(&self, instance: &TaskInstance) -> Result<InsertOutcome, InfraError> {
        let connection = self.connection()?;
        let inserted = connection.execute(
            "INSERT INTO task_instances (
               id, task_id, instance_date, scheduled_datetime, status, completed_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(task_id, instance_date) DO NOTHING",
            params![
                instance.id,
                instance.task_id,
                instance.instance_date,
                instance.scheduled_datetime,
                instance.status.as_str(),
                instance.completed_at,
                instance.created_at,
                instance.updated_at,
            ],
        )?;
        if inserted == 1 {
            return Ok(InsertOutcome::Created(instance.clone()));
        }

        let existing = connection.query_row(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM task_instances i
                 WHERE i.task_id = ?1 AND i.instance_date = ?2"
            ),
            params![instance.task_id, instance.instance_date],
            |row| instance_from_row(row, 0),
        )?;
        Ok(InsertOutcome::AlreadyExists(existing))
    }

    fn get_instance(&self, instance_id: &str) -> Result<Option<TaskInstance>, InfraError> {
        let instance = self
            .connection()?
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM task_instances i WHERE i.id = ?1"),
                params![instance_id],
                |row| instance_from_row(row, 0),
            )
            .optional()?;
        Ok(instance)
    }

    fn instances_for_task(&self, task_id: &str) -> Result<Vec<TaskInstance>, InfraError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances i
             WHERE i.task_id = ?1 ORDER BY i.instance_date"
        ))?;
        let instances = statement
            .query_map(params![task_id], |row| instance_from_row(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    fn instance_dates_in_range(
        &self,
        task_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HashSet<NaiveDate>, InfraError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT instance_date FROM task_instances
             WHERE task_id = ?1 AND instance_date BETWEEN ?2 AND ?3",
        )?;
        let dates = statement
            .query_map(params![task_id, start, end], |row| row.get::<_, NaiveDate>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(dates)
    }

    fn max_instance_dates(&self, task_ids: &[String]) -> Result<HashMap<String, NaiveDate>, InfraError> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let connection = self.connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT task_id, MAX(instance_date) FROM task_instances
             WHERE task_id IN ({}) GROUP BY task_id",
            placeholders(1, task_ids.len())
        ))?;
        let dates = statement
            .query_map(params_from_iter(task_ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, NaiveDate>(1)?))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(dates)
    }

    fn delete_pending_from(&self, task_id: &str, from: NaiveDate) -> Result<usize, InfraError> {
        let deleted = self.connection()?.execute(
            "DELETE FROM task_instances
             WHERE task_id = ?1 AND instance_date >= ?2 AND status = 'pending'",
            params![task_id, from],
        )?;
        Ok(deleted)
    }

    fn instances_in_range(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<InstanceWithTask>, InfraError> {
        self.query_instances_with_task(
            "t.user_id = ?1 AND i.instance_date BETWEEN ?2 AND ?3 AND (?4 IS NULL OR i.status = ?4)",
            params![user_id, start, end, status.map(InstanceStatus::as_str)],
        )
    }

    fn next_pending_instances(
        &self,
        task_ids: &[String],
        from: NaiveDate,
    ) -> Result<HashMap<String, TaskInstance>, InfraError> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let connection = self.connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances i
             WHERE i.task_id IN ({}) AND i.status = 'pending' AND i.instance_date >= ?1
               AND i.instance_date = (
                 SELECT MIN(j.instance_date) FROM task_instances j
                 WHERE j.task_id = i.task_id AND j.status = 'pending' AND j.instance_date >= ?1
               )",
            placeholders(2, task_ids.len())
        ))?;
        let values = std::iter::once(from.to_string()).chain(task_ids.iter().cloned());
        let instances = statement
            .query_map(params_from_iter(values), |row| instance_from_row(row, 0))?
            .map(|instance| instance.map(|instance| (instance.task_id.clone(), instance)))
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(instances)
    }

    fn pending_instances_before(
        &self,
        user_id: &str,
        cutoff: NaiveDate,
    ) -> Result<Vec<InstanceWithTask>, InfraError> {
        self.query_instances_with_task(
            "t.user_id = ?1 AND i.instance_date < ?2 AND i.status = 'pending'",
            params![user_id, cutoff],
        )
    }

    fn resolve_pending_before(
        &self,
        user_id: &str,
        cutoff: NaiveDate,
        status: InstanceStatus,
        at: DateTime<Utc>,
    ) -> Result<usize, InfraError> {
        if !status.is_resolved() {
            return Err(InfraError::InvalidInput(
                "pending instances can only be resolved to completed or skipped".to_string(),
            ));
        }
        let completed_at = (status == InstanceStatus::Completed).then_some(at);
        let updated = self.connection()?.execute(
            "UPDATE task_instances
             SET status = ?3, completed_at = ?4, updated_at = ?5
             WHERE status = 'pending' AND instance_date < ?2
               AND task_id IN (SELECT id FROM tasks WHERE user_id = ?1)",
            params![user_id, cutoff, status.as_str(), completed_at, at],
        )?;
        Ok(updated)
    }

    fn set_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, InfraError> {
        let completed_at = (status == InstanceStatus::Completed).then_some(at);
        let updated = self.connection()?.execute(
            "UPDATE task_instances SET status = ?2, completed_at = ?3, updated_at = ?4 WHERE id = ?1",
            params![instance_id, status.as_str(), completed_at, at],
        )?;
        Ok(updated > 0)
    }

    fn reschedule_instance(
        &self,
        instance_id: &str,
        new_date: NaiveDate,
        scheduled_datetime: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, InfraError> {
        let connection = self.connection()?;
        let task_id: Option<String> = connection
            .query_row(
                "SELECT task_id FROM task_instances WHERE id = ?1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(task_id) = task_id else {
            return Ok(false);
        };
        let occupied: bool = connection.query_row(
            "SELECT EXISTS(
               SELECT 1 FROM task_instances WHERE task_id = ?1 AND instance_date = ?2 AND id <> ?3
             )",
            params![task_id, new_date, instance_id],
            |row| row.get(0),
        )?;
        if occupied {
            return Err(InfraError::InvalidInput(format!(
                "task {task_id} already has an instance on {new_date}"
            )));
        }
        let updated = connection.execute(
            "UPDATE task_instances SET instance_date = ?2, scheduled_datetime = ?3, updated_at = ?4
             WHERE id = ?1",
            params![instance_id, new_date, scheduled_datetime, at],
        )?;
        Ok(updated > 0)
    }

    fn syncable_instances_for_user(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<(TaskInstance, Task)>, InfraError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS}, {TASK_COLUMNS}
             FROM task_instances i JOIN tasks t ON t.id = i.task_id
             WHERE t.user_id = ?1 AND t.archived = 0 AND i.instance_date BETWEEN ?2 AND ?3
             ORDER BY i.instance_date, t.id"
        ))?;
        let rows = statement
            .query_map(params![user_id, start, end], |row| {
                Ok((instance_from_row(row, 0)?, task_from_row(row, INSTANCE_COLUMN_COUNT)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl SyncRecordRepository for SqliteStore {
    fn find_record(&self, user_id: &str, local_ref: &LocalRef) -> Result<Option<SyncRecord>, InfraError> {
        let column = match local_ref {
            LocalRef::Task(_) => "task_id",
            LocalRef::Instance(_) => "instance_id",
        };
        let record = self
            .connection()?
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM sync_records WHERE user_id = ?1 AND {column} = ?2"),
                params![user_id, local_ref.id()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn records_for_user(&self, user_id: &str) -> Result<Vec<SyncRecord>, InfraError> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE user_id = ?1 ORDER BY last_synced_at, id"
        ))?;
        let records = statement
            .query_map(params![user_id], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn insert_record(&self, record: &SyncRecord) -> Result<bool, InfraError> {
        let (task_id, instance_id) = match &record.local_ref {
            LocalRef::Task(id) => (Some(id.as_str()), None),
            LocalRef::Instance(id) => (None, Some(id.as_str())),
        };
        let inserted = self.connection()?.execute(
            "INSERT INTO sync_records (
               id, user_id, task_id, instance_id, external_event_id, content_hash, last_synced_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT DO NOTHING",
            params![
                record.id,
                record.user_id,
                task_id,
                instance_id,
                record.external_event_id,
                record.content_hash,
                record.last_synced_at,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn update_record(
        &self,
        record_id: &str,
        external_event_id: &str,
        content_hash: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        self.connection()?.execute(
            "UPDATE sync_records
             SET external_event_id = ?2, content_hash = ?3, last_synced_at = ?4
             WHERE id = ?1",
            params![record_id, external_event_id, content_hash, synced_at],
        )?;
        Ok(())
    }

    fn delete_record(&self, record_id: &str) -> Result<(), InfraError> {
        self.connection()?
            .execute("DELETE FROM sync_records WHERE id = ?1", params![record_id])?;
        Ok(())
    }

    fn delete_records_for_user(&self, user_id: &str) -> Result<usize, InfraError> {
        let deleted = self
            .connection()?
            .execute("DELETE FROM sync_records WHERE user_id = ?1", params![user_id])?;
        Ok(deleted)
    }
}

impl TokenStore for SqliteStore {
    fn load_token(&self, user_id: &str) -> Result<Option<OAuthToken>, InfraError> {
        let token = self
            .connection()?
            .query_row(
                "SELECT access_token, refresh_token, expires_at, token_type, scope
                 FROM oauth_tokens WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(OAuthToken {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                        expires_at: row.get(2)?,
                        token_type: row.get(3)?,
                        scope: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(token)
    }

    fn save_token(&self, user_id: &str, token: &OAuthToken, at: DateTime<Utc>) -> Result<(), InfraError> {
        self.connection()?.execute(
            "INSERT INTO oauth_tokens (
               user_id, access_token, refresh_token, expires_at, token_type, scope, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id) DO UPDATE SET
               access_token = excluded.access_token,
               refresh_token = excluded.refresh_token,
               expires_at = excluded.expires_at,
               token_type = excluded.token_type,
               scope = excluded.scope,
               updated_at = excluded.updated_at",
            params![
                user_id,
                token.access_token,
                token.refresh_token,
                token.expires_at,
                token.token_type,
                token.scope,
                at,
            ],
        )?;
        Ok(())
    }

    fn save_token_under_lease(
        &self,
        user_id: &str,
        owner: &str,
        token: &OAuthToken,
        at: DateTime<Utc>,
    ) -> Result<bool, InfraError> {
        let updated = self.connection()?.execute(
            "UPDATE oauth_tokens
             SET access_token = ?3, refresh_token = ?4, expires_at = ?5,
                 token_type = ?6, scope = ?7, updated_at = ?8
             WHERE user_id = ?1 AND refresh_lock_owner = ?2",
            params![
                user_id,
                owner,
                token.access_token,
                token.refresh_token,
                token.expires_at,
                token.token_type,
                token.scope,
                at,
            ],
        )?;
        Ok(updated == 1)
    }

    fn delete_token(&self, user_id: &str) -> Result<(), InfraError> {
        self.connection()?
            .execute("DELETE FROM oauth_tokens WHERE user_id = ?1", params![user_id])?;
        Ok(())
    }

    fn try_acquire_refresh_lease(
        &self,
        user_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<bool, InfraError> {
        let now_ms = now.timestamp_millis();
        let until_ms = (now + lease).timestamp_millis();
        let acquired = self.connection()?.execute(
            "UPDATE oauth_tokens
             SET refresh_lock_owner = ?2, refresh_lock_until = ?3
             WHERE user_id = ?1
               AND (refresh_lock_owner IS NULL OR refresh_lock_until IS NULL OR refresh_lock_until <= ?4)",
            params![user_id, owner, until_ms, now_ms],
        )?;
        Ok(acquired == 1)
    }

    fn release_refresh_lease(&self, user_id: &str, owner: &str) -> Result<(), InfraError> {
        self.connection()?.execute(
            "UPDATE oauth_tokens SET refresh_lock_owner = NULL, refresh_lock_until = NULL
             WHERE user_id = ?1 AND refresh_lock_owner = ?2",
            params![user_id, owner],
        )?;
        Ok(())
    }
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>()
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        timezone: row.get(1)?,
        sync_enabled: row.get(2)?,
        calendar_id: row.get(3)?,
    })
}

fn task_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Task> {
    let rule_json: Option<String> = row.get(offset + 6)?;
    Ok(Task {
        id: row.get(offset)?,
        user_id: row.get(offset + 1)?,
        title: row.get(offset + 2)?,
        description: row.get(offset + 3)?,
        domain: row.get(offset + 4)?,
        is_recurring: row.get(offset + 5)?,
        // An undecodable rule is the same as no rule: nothing gets scheduled.
        recurrence_rule: rule_json.as_deref().and_then(RecurrenceRule::from_json),
        recurrence_start: row.get(offset + 7)?,
        recurrence_end: row.get(offset + 8)?,
        scheduled_date: row.get(offset + 9)?,
        scheduled_time: row.get(offset + 10)?,
        duration_minutes: row.get(offset + 11)?,
        priority: parse_column::<Priority>(row, offset + 12)?,
        status: parse_column::<TaskStatus>(row, offset + 13)?,
        completed_at: row.get(offset + 14)?,
        archived: row.get(offset + 15)?,
        created_at: row.get(offset + 16)?,
        updated_at: row.get(offset + 17)?,
    })
}

fn instance_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<TaskInstance> {
    Ok(TaskInstance {
        id: row.get(offset)?,
        task_id: row.get(offset + 1)?,
        instance_date: row.get(offset + 2)?,
        scheduled_datetime: row.get(offset + 3)?,
        status: parse_column::<InstanceStatus>(row, offset + 4)?,
        completed_at: row.get(offset + 5)?,
        created_at: row.get(offset + 6)?,
        updated_at: row.get(offset + 7)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    let task_id: Option<String> = row.get(2)?;
    let instance_id: Option<String> = row.get(3)?;
    let local_ref = match (task_id, instance_id) {
        (Some(id), None) => LocalRef::Task(id),
        (None, Some(id)) => LocalRef::Instance(id),
        _ => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                "sync record must reference exactly one local item".into(),
            ));
        }
    };
    Ok(SyncRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        local_ref,
        external_event_id: row.get(4)?,
        content_hash: row.get(5)?,
        last_synced_at: row.get(6)?,
    })
}
