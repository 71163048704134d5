use crate::domain::models::User;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::google_calendar_client::GoogleCalendarClient;
use crate::infrastructure::storage::UserRepository;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureCalendarResult {
    Reused(String),
    LinkedExisting(String),
    Created(String),
}

impl EnsureCalendarResult {
    pub fn calendar_id(&self) -> &str {
        match self {
            Self::Reused(id) | Self::LinkedExisting(id) | Self::Created(id) => id,
        }
    }
}

/// Finds or creates the calendar a user's items are mirrored into.
///
/// Lookup order is the stored id, then an existing calendar with the
/// configured name, then a new calendar. The resolved id is persisted on the
/// user so later passes skip the remote lookups.
pub struct CalendarResolver<S, C>
where
    S: UserRepository,
    C: GoogleCalendarClient,
{
    store: Arc<S>,
    calendar_client: Arc<C>,
    calendar_name: String,
}

impl<S, C> CalendarResolver<S, C>
where
    S: UserRepository,
    C: GoogleCalendarClient,
{
    pub fn new(store: Arc<S>, calendar_client: Arc<C>, calendar_name: impl Into<String>) -> Self {
        Self {
            store,
            calendar_client,
            calendar_name: calendar_name.into(),
        }
    }

    pub async fn ensure_calendar(
        &self,
        user: &User,
        access_token: &str,
    ) -> Result<EnsureCalendarResult, InfraError> {
        if let Some(calendar_id) = user
            .calendar_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Ok(EnsureCalendarResult::Reused(calendar_id.to_string()));
        }

        let calendars = self.calendar_client.list_calendars(access_token).await?;
        if let Some(existing) = calendars
            .into_iter()
            .find(|calendar| calendar.summary == self.calendar_name)
        {
            self.store.set_calendar_id(&user.id, &existing.id)?;
            tracing::info!(user_id = %user.id, calendar_id = %existing.id, "linked existing calendar");
            return Ok(EnsureCalendarResult::LinkedExisting(existing.id));
        }

        let created = self
            .calendar_client
            .create_calendar(access_token, &self.calendar_name, Some(&user.timezone))
            .await?;
        self.store.set_calendar_id(&user.id, &created.id)?;
        tracing::info!(user_id = %user.id, calendar_id = %created.id, "created calendar");
        Ok(EnsureCalendarResult::Created(created.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::event_mapper::GoogleCalendarEvent;
    use crate::infrastructure::google_calendar_client::{
        GoogleCalendarSummary, ListEventsRequest, ListEventsResponse,
    };
    use crate::infrastructure::storage::SqliteStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeGoogleCalendarClient {
        calendars: Vec<GoogleCalendarSummary>,
        list_calls: AtomicUsize,
        create_calls: AtomicUsize,
        last_create_timezone: Mutex<Option<String>>,
    }

    #[async_trait]
    impl GoogleCalendarClient for FakeGoogleCalendarClient {
        async fn list_calendars(
            &self,
            _access_token: &str,
        ) -> Result<Vec<GoogleCalendarSummary>, InfraError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.calendars.clone())
        }

        async fn create_calendar(
            &self,
            _access_token: &str,
            summary: &str,
            time_zone: Option<&str>,
        ) -> Result<GoogleCalendarSummary, InfraError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            *self
                .last_create_timezone
                .lock()
                .expect("timezone mutex poisoned") = time_zone.map(ToOwned::to_owned);
            Ok(GoogleCalendarSummary {
                id: "cal-created".to_string(),
                summary: summary.to_string(),
            })
        }

        async fn list_events(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _request: ListEventsRequest,
        ) -> Result<ListEventsResponse, InfraError> {
            Ok(ListEventsResponse::default())
        }

        async fn create_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _event: &GoogleCalendarEvent,
        ) -> Result<String, InfraError> {
            Err(InfraError::InvalidInput("not used by resolver".to_string()))
        }

        async fn update_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _event_id: &str,
            _event: &GoogleCalendarEvent,
        ) -> Result<(), InfraError> {
            Ok(())
        }

        async fn delete_event(
            &self,
            _access_token: &str,
            _calendar_id: &str,
            _event_id: &str,
        ) -> Result<(), InfraError> {
            Ok(())
        }
    }

    fn store_with_user(calendar_id: Option<&str>) -> (Arc<SqliteStore>, User) {
        let store = SqliteStore::open_in_memory().expect("open store");
        let mut user = User::new("usr-1");
        user.timezone = "Asia/Tokyo".to_string();
        user.calendar_id = calendar_id.map(ToOwned::to_owned);
        store.upsert_user(&user).expect("save user");
        (Arc::new(store), user)
    }

    #[tokio::test]
    async fn stored_calendar_is_reused_without_remote_calls() {
        let (store, user) = store_with_user(Some("cal-stored"));
        let client = Arc::new(FakeGoogleCalendarClient::default());
        let resolver = CalendarResolver::new(store, Arc::clone(&client), "Cadence");

        let result = resolver.ensure_calendar(&user, "token").await.expect("resolve");
        assert_eq!(result, EnsureCalendarResult::Reused("cal-stored".to_string()));
        assert_eq!(client.list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.create_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn calendar_with_matching_name_is_linked() {
        let (store, user) = store_with_user(None);
        let client = Arc::new(FakeGoogleCalendarClient {
            calendars: vec![
                GoogleCalendarSummary {
                    id: "primary".to_string(),
                    summary: "me@example.com".to_string(),
                },
                GoogleCalendarSummary {
                    id: "cal-existing".to_string(),
                    summary: "Cadence".to_string(),
                },
            ],
            ..Default::default()
        });
        let resolver = CalendarResolver::new(Arc::clone(&store), Arc::clone(&client), "Cadence");

        let result = resolver.ensure_calendar(&user, "token").await.expect("resolve");
        assert_eq!(result, EnsureCalendarResult::LinkedExisting("cal-existing".to_string()));
        assert_eq!(client.create_calls.load(Ordering::SeqCst), 0);

        let persisted = store.get_user("usr-1").expect("load").expect("user");
        assert_eq!(persisted.calendar_id.as_deref(), Some("cal-existing"));
    }

    #[tokio::test]
    async fn missing_calendar_is_created_in_user_zone() {
        let (store, user) = store_with_user(None);
        let client = Arc::new(FakeGoogleCalendarClient::default());
        let resolver = CalendarResolver::new(Arc::clone(&store), Arc::clone(&client), "Cadence");

        let result = resolver.ensure_calendar(&user, "token").await.expect("resolve");
        assert_eq!(result.calendar_id(), "cal-created");
        assert_eq!(client.create_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            client
                .last_create_timezone
                .lock()
                .expect("timezone mutex poisoned")
                .as_deref(),
            Some("Asia/Tokyo")
        );
        let persisted = store.get_user("usr-1").expect("load").expect("user");
        assert_eq!(persisted.calendar_id.as_deref(), Some("cal-created"));
    }
}
