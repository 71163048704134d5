use crate::infrastructure::error::InfraError;
use crate::infrastructure::event_mapper::GoogleCalendarEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use std::time::Duration;
use url::Url;

pub const DEFAULT_CALENDAR_API_BASE: &str = "https://www.googleapis.com/calendar/v3/";
const MAX_PAGE_SIZE: u32 = 2500;
/// Calendar lists are short; a server that keeps paging is cut off here.
const MAX_CALENDAR_PAGES: usize = 20;
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleCalendarSummary {
    pub id: String,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct ListEventsRequest {
    pub time_min: Option<DateTime<Utc>>,
    pub time_max: Option<DateTime<Utc>>,
    pub page_size: u32,
    /// Pagination stops once this many events were collected.
    pub max_events: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ListEventsResponse {
    pub events: Vec<GoogleCalendarEvent>,
    /// True when `max_events` cut the listing short.
    pub truncated: bool,
}

#[async_trait]
pub trait GoogleCalendarClient: Send + Sync {
    async fn list_calendars(&self, access_token: &str) -> Result<Vec<GoogleCalendarSummary>, InfraError>;

    async fn create_calendar(
        &self,
        access_token: &str,
        summary: &str,
        time_zone: Option<&str>,
    ) -> Result<GoogleCalendarSummary, InfraError>;

    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, InfraError>;

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError>;

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError>;

    async fn delete_event(&self, access_token: &str, calendar_id: &str, event_id: &str) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestGoogleCalendarClient {
    client: Client,
    api_base: Url,
}

#[derive(Debug, serde::Deserialize)]
struct CalendarListResponse {
    items: Option<Vec<CalendarListItem>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct CalendarListItem {
    id: String,
    summary: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct CreateCalendarRequest<'a> {
    summary: &'a str,
    #[serde(rename = "timeZone", skip_serializing_if = "Option::is_none")]
    time_zone: Option<&'a str>,
}

#[derive(Debug, serde::Deserialize)]
struct CalendarResourceResponse {
    id: Option<String>,
    summary: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct EventsPageResponse {
    items: Option<Vec<GoogleCalendarEvent>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

impl ReqwestGoogleCalendarClient {
    pub fn new(timeout: Duration) -> Result<Self, InfraError> {
        Self::with_base_url(DEFAULT_CALENDAR_API_BASE, timeout)
    }

    pub fn with_base_url(api_base: &str, timeout: Duration) -> Result<Self, InfraError> {
        let mut api_base = Url::parse(api_base)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid calendar api base url: {error}")))?;
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| InfraError::InvalidConfig(format!("failed building http client: {error}")))?;
        Ok(Self { client, api_base })
    }

    fn ensure_non_empty(value: &str, field: &str) -> Result<(), InfraError> {
        if value.trim().is_empty() {
            return Err(InfraError::InvalidInput(format!("{field} must not be empty")));
        }
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, InfraError> {
        let mut url = self.api_base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| InfraError::InvalidConfig("calendar api base URL cannot be a base".to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    /// Sends the request and returns the body of a successful response.
    async fn execute(&self, request: RequestBuilder, action: &str) -> Result<String, InfraError> {
        let response = request
            .send()
            .await
            .map_err(|error| InfraError::Network(format!("{action}: {error}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Network(format!("{action}: failed reading response: {error}")))?;

        if !status.is_success() {
            let mut message = format!("{action} failed");
            if !body.trim().is_empty() {
                let excerpt: String = body.chars().take(ERROR_BODY_LIMIT).collect();
                message.push_str(&format!("; body={excerpt}"));
            }
            return Err(InfraError::Http {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }

    fn parse<T: serde::de::DeserializeOwned>(body: &str, action: &str) -> Result<T, InfraError> {
        serde_json::from_str(body)
            .map_err(|error| InfraError::InvalidResponse(format!("{action}: {error}")))
    }
}

#[async_trait]
impl GoogleCalendarClient for ReqwestGoogleCalendarClient {
    async fn list_calendars(&self, access_token: &str) -> Result<Vec<GoogleCalendarSummary>, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;

        let endpoint = self.endpoint(&["users", "me", "calendarList"])?;
        let mut page_token: Option<String> = None;
        let mut calendars = Vec::new();

        for page in 1..=MAX_CALENDAR_PAGES {
            let mut request = self
                .client
                .get(endpoint.clone())
                .bearer_auth(access_token)
                .query(&[("maxResults", "250")]);
            if let Some(token) = page_token.as_deref() {
                request = request.query(&[("pageToken", token)]);
            }
            let body = self.execute(request, "list calendars").await?;
            let parsed: CalendarListResponse = Self::parse(&body, "list calendars")?;

            calendars.extend(parsed.items.unwrap_or_default().into_iter().filter_map(|item| {
                let id = item.id.trim();
                if id.is_empty() {
                    return None;
                }
                let summary = item.summary.unwrap_or_else(|| id.to_string()).trim().to_string();
                Some(GoogleCalendarSummary {
                    id: id.to_string(),
                    summary,
                })
            }));

            match parsed.next_page_token {
                Some(token) if page < MAX_CALENDAR_PAGES => page_token = Some(token),
                Some(_) => {
                    tracing::warn!(pages = page, "calendar list still paging; keeping what was read");
                }
                None => break,
            }
        }
        Ok(calendars)
    }

    async fn create_calendar(
        &self,
        access_token: &str,
        summary: &str,
        time_zone: Option<&str>,
    ) -> Result<GoogleCalendarSummary, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(summary, "calendar summary")?;

        let summary = summary.trim();
        let payload = CreateCalendarRequest {
            summary,
            time_zone: time_zone.map(str::trim).filter(|value| !value.is_empty()),
        };
        let request = self
            .client
            .post(self.endpoint(&["calendars"])?)
            .bearer_auth(access_token)
            .json(&payload);
        let body = self.execute(request, "create calendar").await?;
        let parsed: CalendarResourceResponse = Self::parse(&body, "create calendar")?;

        let id = parsed
            .id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::InvalidResponse("calendar create response did not include id".to_string()))?;
        let created_summary = parsed
            .summary
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| summary.to_string());

        Ok(GoogleCalendarSummary {
            id,
            summary: created_summary,
        })
    }

    async fn list_events(
        &self,
        access_token: &str,
        calendar_id: &str,
        request: ListEventsRequest,
    ) -> Result<ListEventsResponse, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let endpoint = self.endpoint(&["calendars", calendar_id, "events"])?;
        let page_size = request.page_size.clamp(1, MAX_PAGE_SIZE).to_string();
        let mut page_token: Option<String> = None;
        let mut response = ListEventsResponse::default();

        loop {
            let mut req = self
                .client
                .get(endpoint.clone())
                .bearer_auth(access_token)
                .query(&[("singleEvents", "true"), ("maxResults", page_size.as_str())]);
            if let Some(time_min) = request.time_min {
                req = req.query(&[("timeMin", time_min.to_rfc3339())]);
            }
            if let Some(time_max) = request.time_max {
                req = req.query(&[("timeMax", time_max.to_rfc3339())]);
            }
            if let Some(token) = page_token.as_deref() {
                req = req.query(&[("pageToken", token)]);
            }

            let body = self.execute(req, "list events").await?;
            let parsed: EventsPageResponse = Self::parse(&body, "list events")?;
            response.events.extend(parsed.items.unwrap_or_default());

            if response.events.len() >= request.max_events {
                response.truncated =
                    response.events.len() > request.max_events || parsed.next_page_token.is_some();
                response.events.truncate(request.max_events);
                break;
            }
            match parsed.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(response)
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<String, InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;

        let request = self
            .client
            .post(self.endpoint(&["calendars", calendar_id, "events"])?)
            .bearer_auth(access_token)
            .json(event);
        let body = self.execute(request, "create event").await?;
        let parsed: GoogleCalendarEvent = Self::parse(&body, "create event")?;
        parsed
            .id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::InvalidResponse("event create response did not include id".to_string()))
    }

    async fn update_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        event_id: &str,
        event: &GoogleCalendarEvent,
    ) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let request = self
            .client
            .put(self.endpoint(&["calendars", calendar_id, "events", event_id])?)
            .bearer_auth(access_token)
            .json(event);
        self.execute(request, "update event").await?;
        Ok(())
    }

    async fn delete_event(&self, access_token: &str, calendar_id: &str, event_id: &str) -> Result<(), InfraError> {
        Self::ensure_non_empty(access_token, "access token")?;
        Self::ensure_non_empty(calendar_id, "calendar id")?;
        Self::ensure_non_empty(event_id, "event id")?;

        let request = self
            .client
            .delete(self.endpoint(&["calendars", calendar_id, "events", event_id])?)
            .bearer_auth(access_token);
        self.execute(request, "delete event").await?;
        Ok(())
    }
}
