use crate::domain::recurrence::RecurrenceRule;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_TIMEZONE: &str = "UTC";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Completed,
    Skipped,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
        }
    }

    /// Completed and skipped instances are history and never regenerated.
    pub fn is_resolved(self) -> bool {
        match self {
            Self::Pending => false,
            Self::Completed | Self::Skipped => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} value: {}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(ParseEnumError {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            other => Err(ParseEnumError {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }
}

impl FromStr for InstanceStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            other => Err(ParseEnumError {
                kind: "instance status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub timezone: String,
    pub sync_enabled: bool,
    pub calendar_id: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            sync_enabled: false,
            calendar_id: None,
        }
    }

    /// Unknown zone names fall back to UTC rather than failing the caller.
    pub fn tz(&self) -> Tz {
        parse_timezone(&self.timezone)
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz()).date_naive()
    }
}

pub fn parse_timezone(name: &str) -> Tz {
    name.trim().parse::<Tz>().unwrap_or(Tz::UTC)
}

/// UTC instant of a wall-clock time in `tz`.
///
/// Ambiguous times (DST fall-back) take the earlier instant. Times skipped by
/// a DST jump move forward to the first valid quarter hour after the gap.
pub fn local_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    (0..=12)
        .map(|step| naive + Duration::minutes(15 * step))
        .find_map(|candidate| tz.from_local_datetime(&candidate).earliest())
        .map(|local| local.with_timezone(&Utc))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub is_recurring: bool,
    pub recurrence_rule: Option<RecurrenceRule>,
    pub recurrence_start: Option<NaiveDate>,
    pub recurrence_end: Option<NaiveDate>,
    pub scheduled_date: Option<NaiveDate>,
    pub scheduled_time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            title: title.into(),
            description: None,
            domain: None,
            is_recurring: false,
            recurrence_rule: None,
            recurrence_start: None,
            recurrence_end: None,
            scheduled_date: None,
            scheduled_time: None,
            duration_minutes: None,
            priority: Priority::Medium,
            status: TaskStatus::Pending,
            completed_at: None,
            archived: false,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "task.id")?;
        validate_non_empty(&self.user_id, "task.user_id")?;
        validate_non_empty(&self.title, "task.title")?;
        if let (Some(start), Some(end)) = (self.recurrence_start, self.recurrence_end) {
            if end < start {
                return Err("task.recurrence_end must be >= task.recurrence_start".to_string());
            }
        }
        if self.duration_minutes == Some(0) {
            return Err("task.duration_minutes must be > 0".to_string());
        }
        Ok(())
    }

    /// Whether the materializer has anything to do for this task.
    pub fn is_materializable(&self) -> bool {
        self.is_recurring && !self.archived && self.recurrence_rule.is_some()
    }

    /// The calendar date a non-recurring task occupies on the remote calendar.
    ///
    /// Completed items without a schedule (imported history) fall back to the
    /// date they were completed on.
    pub fn effective_date(&self, tz: Tz) -> Option<NaiveDate> {
        if let Some(date) = self.scheduled_date {
            return Some(date);
        }
        match (self.status, self.completed_at) {
            (TaskStatus::Completed, Some(completed_at)) => {
                Some(completed_at.with_timezone(&tz).date_naive())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskInstance {
    pub id: String,
    pub task_id: String,
    pub instance_date: NaiveDate,
    pub scheduled_datetime: Option<DateTime<Utc>>,
    pub status: InstanceStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An instance together with the parent fields callers need for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceWithTask {
    pub instance: TaskInstance,
    pub task_title: String,
    pub task_domain: Option<String>,
}

/// The local item a sync record mirrors. Exactly one kind per record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LocalRef {
    Task(String),
    Instance(String),
}

impl LocalRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Task(id) | Self::Instance(id) => id,
        }
    }

    /// Compact form stored in the remote event's private properties.
    pub fn encode(&self) -> String {
        match self {
            Self::Task(id) => format!("task:{id}"),
            Self::Instance(id) => format!("instance:{id}"),
        }
    }

    pub fn decode(value: &str) -> Option<Self> {
        let (kind, id) = value.trim().split_once(':')?;
        if id.trim().is_empty() {
            return None;
        }
        match kind {
            "task" => Some(Self::Task(id.to_string())),
            "instance" => Some(Self::Instance(id.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub id: String,
    pub user_id: String,
    pub local_ref: LocalRef,
    pub external_event_id: String,
    pub content_hash: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// `None` means the provider issued a non-expiring token.
    pub expires_at: Option<DateTime<Utc>>,
    pub token_type: String,
    pub scope: Option<String>,
}

impl OAuthToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>, leeway_seconds: i64) -> bool {
        if self.access_token.trim().is_empty() {
            return false;
        }
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at > now + chrono::Duration::seconds(leeway_seconds),
        }
    }
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_task() -> Task {
        Task::new("tsk-1", "usr-1", "Water plants", fixed_time("2026-02-16T08:00:00Z"))
    }

    #[test]
    fn task_validate_rejects_empty_title() {
        let mut task = sample_task();
        task.title = "   ".to_string();
        assert!(task.validate().is_err());
    }

    #[test]
    fn task_validate_rejects_reversed_recurrence_bounds() {
        let mut task = sample_task();
        task.recurrence_start = NaiveDate::from_ymd_opt(2026, 3, 1);
        task.recurrence_end = NaiveDate::from_ymd_opt(2026, 2, 1);
        assert!(task.validate().is_err());
    }

    #[test]
    fn effective_date_prefers_schedule_then_completion() {
        let mut task = sample_task();
        assert_eq!(task.effective_date(Tz::UTC), None);

        task.status = TaskStatus::Completed;
        task.completed_at = Some(fixed_time("2026-02-18T23:30:00Z"));
        assert_eq!(task.effective_date(Tz::UTC), NaiveDate::from_ymd_opt(2026, 2, 18));
        assert_eq!(
            task.effective_date(chrono_tz::Asia::Tokyo),
            NaiveDate::from_ymd_opt(2026, 2, 19)
        );

        task.scheduled_date = NaiveDate::from_ymd_opt(2026, 2, 10);
        assert_eq!(task.effective_date(Tz::UTC), NaiveDate::from_ymd_opt(2026, 2, 10));
    }

    #[test]
    fn local_instant_resolves_dst_gap_forward() {
        let berlin = chrono_tz::Europe::Berlin;
        let gap_day = NaiveDate::from_ymd_opt(2026, 3, 29).expect("valid date");
        let in_gap = NaiveTime::from_hms_opt(2, 30, 0).expect("valid time");
        assert_eq!(
            local_instant(berlin, gap_day, in_gap),
            Some(fixed_time("2026-03-29T01:00:00Z"))
        );

        let winter = NaiveDate::from_ymd_opt(2026, 2, 20).expect("valid date");
        let nine = NaiveTime::from_hms_opt(9, 0, 0).expect("valid time");
        assert_eq!(
            local_instant(berlin, winter, nine),
            Some(fixed_time("2026-02-20T08:00:00Z"))
        );
    }

    #[test]
    fn user_with_unknown_timezone_falls_back_to_utc() {
        let mut user = User::new("usr-1");
        user.timezone = "Mars/Olympus".to_string();
        assert_eq!(user.tz(), Tz::UTC);
    }

    #[test]
    fn token_without_expiry_never_expires() {
        let token = OAuthToken {
            access_token: "access".to_string(),
            refresh_token: None,
            expires_at: None,
            token_type: "Bearer".to_string(),
            scope: None,
        };
        assert!(token.is_valid_at(fixed_time("2099-01-01T00:00:00Z"), 300));
    }

    #[test]
    fn local_ref_decode_rejects_foreign_values() {
        assert_eq!(LocalRef::decode("gcal:abc"), None);
        assert_eq!(LocalRef::decode("task:"), None);
        assert_eq!(
            LocalRef::decode("instance:i-1"),
            Some(LocalRef::Instance("i-1".to_string()))
        );
    }

    // Feature: cadence, Property 1: status strings parse back to the same variant
    proptest! {
        #[test]
        fn property1_instance_status_text_is_stable(
            status in prop_oneof![
                Just(InstanceStatus::Pending),
                Just(InstanceStatus::Completed),
                Just(InstanceStatus::Skipped),
            ]
        ) {
            prop_assert_eq!(status.as_str().parse::<InstanceStatus>().ok(), Some(status));
        }
    }

    // Feature: cadence, Property 2: local refs survive the remote property encoding
    proptest! {
        #[test]
        fn property2_local_ref_encoding_is_reversible(id in "[A-Za-z0-9\\-]{1,40}", is_task in any::<bool>()) {
            let local_ref = if is_task { LocalRef::Task(id) } else { LocalRef::Instance(id) };
            prop_assert_eq!(LocalRef::decode(&local_ref.encode()), Some(local_ref));
        }
    }
}
