use crate::domain::models::{LocalRef, Priority};
use chrono::{Duration, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const KEY_LOCAL_REF: &str = "cadence_ref";
const COMPLETED_PREFIX: &str = "✓ ";
pub const DEFAULT_DURATION_MINUTES: u32 = 30;
// Bumped whenever the encoding changes so every event is rewritten once.
const FINGERPRINT_VERSION: &str = "v1";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventDateTime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(rename = "dateTime", skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct CalendarEventExtendedProperties {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub private: HashMap<String, String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct GoogleCalendarEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "colorId", skip_serializing_if = "Option::is_none")]
    pub color_id: Option<String>,
    #[serde(default)]
    pub start: CalendarEventDateTime,
    #[serde(default)]
    pub end: CalendarEventDateTime,
    #[serde(rename = "extendedProperties", skip_serializing_if = "Option::is_none")]
    pub extended_properties: Option<CalendarEventExtendedProperties>,
}

/// The fields of a local item that show up on the remote calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContent {
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    pub priority: Priority,
    pub completed: bool,
}

impl EventContent {
    fn duration(&self) -> u32 {
        self.duration_minutes
            .filter(|minutes| *minutes > 0)
            .unwrap_or(DEFAULT_DURATION_MINUTES)
    }
}

pub fn encode_event(content: &EventContent, local_ref: &LocalRef, tz: Tz) -> GoogleCalendarEvent {
    let summary = if content.completed {
        format!("{COMPLETED_PREFIX}{}", content.title)
    } else {
        content.title.clone()
    };

    let (start, end) = match content.time {
        None => (
            CalendarEventDateTime {
                date: Some(content.date.to_string()),
                ..Default::default()
            },
            // All-day end dates are exclusive.
            CalendarEventDateTime {
                date: Some((content.date + Duration::days(1)).to_string()),
                ..Default::default()
            },
        ),
        Some(time) => {
            // Wall-clock time plus zone name; the calendar resolves DST itself.
            let start_at = content.date.and_time(time);
            let end_at = start_at + Duration::minutes(i64::from(content.duration()));
            (
                CalendarEventDateTime {
                    date_time: Some(start_at.format("%Y-%m-%dT%H:%M:%S").to_string()),
                    time_zone: Some(tz.name().to_string()),
                    ..Default::default()
                },
                CalendarEventDateTime {
                    date_time: Some(end_at.format("%Y-%m-%dT%H:%M:%S").to_string()),
                    time_zone: Some(tz.name().to_string()),
                    ..Default::default()
                },
            )
        }
    };

    GoogleCalendarEvent {
        id: None,
        summary: Some(summary),
        description: content.description.clone().filter(|value| !value.trim().is_empty()),
        status: Some("confirmed".to_string()),
        color_id: Some(priority_color(content.priority).to_string()),
        start,
        end,
        extended_properties: Some(CalendarEventExtendedProperties {
            private: HashMap::from([(KEY_LOCAL_REF.to_string(), local_ref.encode())]),
        }),
    }
}

/// SHA-256 over every field that influences the remote representation.
pub fn content_hash(content: &EventContent) -> String {
    let time = content
        .time
        .map(|time| time.format("%H:%M:%S").to_string())
        .unwrap_or_default();
    let date = content.date.to_string();
    let duration = content.duration().to_string();
    let fields: [&str; 8] = [
        FINGERPRINT_VERSION,
        &content.title,
        content.description.as_deref().unwrap_or_default(),
        &date,
        &time,
        &duration,
        priority_color(content.priority),
        if content.completed { "1" } else { "0" },
    ];

    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}

/// The local item an event was created for, if it was created by us.
pub fn local_ref_of(event: &GoogleCalendarEvent) -> Option<LocalRef> {
    event
        .extended_properties
        .as_ref()
        .and_then(|properties| properties.private.get(KEY_LOCAL_REF))
        .and_then(|value| LocalRef::decode(value))
}

fn priority_color(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "2",
        Priority::Medium => "5",
        Priority::High => "6",
        Priority::Urgent => "11",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_content() -> EventContent {
        EventContent {
            title: "Water plants".to_string(),
            description: Some("balcony first".to_string()),
            date: NaiveDate::from_ymd_opt(2026, 2, 20).expect("valid date"),
            time: None,
            duration_minutes: None,
            priority: Priority::Medium,
            completed: false,
        }
    }

    #[test]
    fn untimed_item_becomes_all_day_event() {
        let event = encode_event(
            &sample_content(),
            &LocalRef::Task("tsk-1".to_string()),
            Tz::UTC,
        );
        assert_eq!(event.start.date.as_deref(), Some("2026-02-20"));
        assert_eq!(event.end.date.as_deref(), Some("2026-02-21"));
        assert!(event.start.date_time.is_none());
        assert_eq!(event.summary.as_deref(), Some("Water plants"));
    }

    #[test]
    fn timed_item_uses_duration_and_user_zone() {
        let mut content = sample_content();
        content.time = NaiveTime::from_hms_opt(23, 45, 0);
        content.duration_minutes = Some(45);
        content.completed = true;

        let event = encode_event(
            &content,
            &LocalRef::Instance("ins-1".to_string()),
            chrono_tz::Europe::Berlin,
        );
        assert_eq!(event.start.date_time.as_deref(), Some("2026-02-20T23:45:00"));
        assert_eq!(event.end.date_time.as_deref(), Some("2026-02-21T00:30:00"));
        assert_eq!(event.start.time_zone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(event.summary.as_deref(), Some("✓ Water plants"));
        assert_eq!(
            local_ref_of(&event),
            Some(LocalRef::Instance("ins-1".to_string()))
        );
    }

    #[test]
    fn hash_tracks_visible_changes_only() {
        let content = sample_content();
        let baseline = content_hash(&content);
        assert_eq!(baseline, content_hash(&content.clone()));
        assert_eq!(baseline.len(), 64);

        let mut completed = content.clone();
        completed.completed = true;
        assert_ne!(baseline, content_hash(&completed));

        let mut explicit_default = content.clone();
        explicit_default.duration_minutes = Some(DEFAULT_DURATION_MINUTES);
        assert_eq!(baseline, content_hash(&explicit_default));
    }

    #[test]
    fn foreign_events_have_no_local_ref() {
        let event = GoogleCalendarEvent {
            id: Some("external".to_string()),
            summary: Some("Dentist".to_string()),
            ..Default::default()
        };
        assert_eq!(local_ref_of(&event), None);
    }

    #[test]
    fn event_payload_uses_calendar_field_names() {
        let event = encode_event(
            &sample_content(),
            &LocalRef::Task("tsk-1".to_string()),
            Tz::UTC,
        );
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["colorId"], "5");
        assert_eq!(json["extendedProperties"]["private"]["cadence_ref"], "task:tsk-1");
        assert!(json.get("id").is_none());
    }
}
