use crate::application::NowProvider;
use crate::domain::models::OAuthToken;
use crate::infrastructure::config::{CredentialSettings, OAuthConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::oauth_client::{
    OAuthCodeExchangeRequest, OAuthHttpClient, OAuthRefreshRequest, OAuthTokenResponse,
};
use crate::infrastructure::storage::TokenStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::{Duration as TokioDuration, sleep};
use url::Url;
use uuid::Uuid;

/// Hands out an access token that is good for the next few minutes.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn ensure_fresh_token(&self, user_id: &str) -> Result<OAuthToken, InfraError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub refresh_buffer: Duration,
    pub lock_retry_ceiling: u32,
    pub lock_backoff_base_ms: u64,
    pub lock_lease: Duration,
    pub refresh_max_attempts: u32,
    pub refresh_backoff_base_ms: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from(&CredentialSettings::default())
    }
}

impl From<&CredentialSettings> for RefreshPolicy {
    fn from(settings: &CredentialSettings) -> Self {
        Self {
            refresh_buffer: Duration::seconds(settings.refresh_buffer_secs),
            lock_retry_ceiling: settings.lock_retry_ceiling,
            lock_backoff_base_ms: settings.lock_backoff_base_ms,
            lock_lease: Duration::seconds(settings.lock_lease_secs),
            refresh_max_attempts: settings.refresh_max_attempts,
            refresh_backoff_base_ms: settings.refresh_backoff_base_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Valid,
    NearExpiry,
    Expired,
    NeverExpires,
}

impl TokenState {
    pub fn of(token: &OAuthToken, now: DateTime<Utc>, buffer: Duration) -> Self {
        match token.expires_at {
            None => Self::NeverExpires,
            Some(expires_at) if expires_at <= now => Self::Expired,
            Some(expires_at) if expires_at <= now + buffer => Self::NearExpiry,
            Some(_) => Self::Valid,
        }
    }

    pub fn needs_refresh(self) -> bool {
        matches!(self, Self::NearExpiry | Self::Expired)
    }
}

fn backoff(base_ms: u64, attempt: u32) -> TokioDuration {
    TokioDuration::from_millis(base_ms.saturating_mul(2u64.saturating_pow(attempt)))
}

/// Keeps per-user access tokens fresh.
///
/// Concurrent callers coordinate through a lease on the token row, so one
/// refresh happens per expiry no matter how many request handlers and
/// background passes ask at once. The lease carries an expiry; a holder that
/// dies mid-refresh blocks the others for at most `lock_lease`.
pub struct CredentialRefresher<T, C>
where
    T: TokenStore,
    C: OAuthHttpClient,
{
    config: OAuthConfig,
    store: Arc<T>,
    oauth_client: Arc<C>,
    policy: RefreshPolicy,
    now_provider: NowProvider,
}

impl<T, C> CredentialRefresher<T, C>
where
    T: TokenStore,
    C: OAuthHttpClient,
{
    pub fn new(config: OAuthConfig, store: Arc<T>, oauth_client: Arc<C>) -> Self {
        Self {
            config,
            store,
            oauth_client,
            policy: RefreshPolicy::default(),
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn token_state(&self, token: &OAuthToken) -> TokenState {
        TokenState::of(token, (self.now_provider)(), self.policy.refresh_buffer)
    }

    pub fn authorization_url(&self, state: &str) -> Result<String, InfraError> {
        if state.trim().is_empty() {
            return Err(InfraError::InvalidInput("state must not be empty".to_string()));
        }
        if self.config.scopes.is_empty() {
            return Err(InfraError::InvalidConfig("at least one scope is required".to_string()));
        }

        let mut url = Url::parse(&self.config.authorization_endpoint).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid authorization endpoint: {error}"))
        })?;
        let scope = self.config.scopes.join(" ");
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &scope)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);
        Ok(url.to_string())
    }

    /// Initial grant. Replaces whatever token the user had.
    pub async fn authenticate_with_code(
        &self,
        user_id: &str,
        authorization_code: &str,
    ) -> Result<OAuthToken, InfraError> {
        if authorization_code.trim().is_empty() {
            return Err(InfraError::InvalidInput(
                "authorization code must not be empty".to_string(),
            ));
        }

        let response = self
            .oauth_client
            .exchange_authorization_code(OAuthCodeExchangeRequest {
                token_endpoint: self.config.token_endpoint.clone(),
                client_id: self.config.client_id.clone(),
                client_secret: self.config.client_secret.clone(),
                redirect_uri: self.config.redirect_uri.clone(),
                authorization_code: authorization_code.to_string(),
            })
            .await?;

        let token = self.token_from_response(response, None);
        self.store.save_token(user_id, &token, (self.now_provider)())?;
        tracing::info!(user_id, "stored authorized credential");
        Ok(token)
    }

    pub fn revoke_local(&self, user_id: &str) -> Result<(), InfraError> {
        self.store.delete_token(user_id)?;
        tracing::info!(user_id, "removed stored credential");
        Ok(())
    }

    pub async fn ensure_fresh_token(&self, user_id: &str) -> Result<OAuthToken, InfraError> {
        let token = self.load(user_id)?;
        if !self.token_state(&token).needs_refresh() {
            return Ok(token);
        }

        let owner = Uuid::new_v4().to_string();
        for attempt in 0..self.policy.lock_retry_ceiling {
            let acquired = self.store.try_acquire_refresh_lease(
                user_id,
                &owner,
                (self.now_provider)(),
                self.policy.lock_lease,
            )?;

            if acquired {
                let result = self.refresh_if_due(user_id, Some(owner.as_str())).await;
                if let Err(error) = self.store.release_refresh_lease(user_id, &owner) {
                    tracing::warn!(user_id, %error, "failed releasing refresh lease");
                }
                return result;
            }

            // Someone else is refreshing; their result may already be stored.
            let current = self.load(user_id)?;
            if !self.token_state(&current).needs_refresh() {
                return Ok(current);
            }
            sleep(backoff(self.policy.lock_backoff_base_ms, attempt)).await;
        }

        tracing::warn!(
            user_id,
            attempts = self.policy.lock_retry_ceiling,
            "refresh lease unavailable; refreshing without it"
        );
        self.refresh_if_due(user_id, None).await
    }

    /// `lease_owner` is set when the caller holds the refresh lease; the new
    /// token is then only written while that lease is still ours.
    async fn refresh_if_due(
        &self,
        user_id: &str,
        lease_owner: Option<&str>,
    ) -> Result<OAuthToken, InfraError> {
        let current = self.load(user_id)?;
        if !self.token_state(&current).needs_refresh() {
            return Ok(current);
        }
        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(InfraError::CredentialRevoked(format!(
                "user {user_id} has no refresh token"
            )));
        };

        let response = self.refresh_with_backoff(user_id, refresh_token).await?;
        let token = self.token_from_response(response, current.refresh_token);
        let now = (self.now_provider)();
        match lease_owner {
            Some(owner) => {
                if !self.store.save_token_under_lease(user_id, owner, &token, now)? {
                    return self.after_lost_lease(user_id, token);
                }
            }
            None => self.store.save_token(user_id, &token, now)?,
        }
        tracing::info!(user_id, expires_at = ?token.expires_at, "refreshed access token");
        Ok(token)
    }

    /// The lease lapsed while we were refreshing and another caller took it.
    /// Their token wins; ours is handed back unsaved only if nothing fresh is
    /// stored yet.
    fn after_lost_lease(&self, user_id: &str, refreshed: OAuthToken) -> Result<OAuthToken, InfraError> {
        let stored = self.load(user_id)?;
        if !self.token_state(&stored).needs_refresh() {
            tracing::warn!(user_id, "refresh lease lost mid-refresh; using the stored token");
            return Ok(stored);
        }
        tracing::warn!(user_id, "refresh lease lost mid-refresh; token not persisted");
        Ok(refreshed)
    }

    async fn refresh_with_backoff(
        &self,
        user_id: &str,
        refresh_token: String,
    ) -> Result<OAuthTokenResponse, InfraError> {
        let max_attempts = self.policy.refresh_max_attempts.max(1);
        let request = OAuthRefreshRequest {
            token_endpoint: self.config.token_endpoint.clone(),
            client_id: self.config.client_id.clone(),
            client_secret: self.config.client_secret.clone(),
            refresh_token,
        };

        let mut attempt: u32 = 0;
        loop {
            match self.oauth_client.refresh_access_token(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(InfraError::RefreshExhausted(format!(
                            "{attempt} attempts failed; last error: {error}"
                        )));
                    }
                    tracing::warn!(user_id, attempt, %error, "transient refresh failure; retrying");
                    sleep(backoff(self.policy.refresh_backoff_base_ms, attempt - 1)).await;
                }
                Err(error) => {
                    tracing::warn!(user_id, %error, "refresh rejected; reauthorization required");
                    return Err(InfraError::CredentialRevoked(error.to_string()));
                }
            }
        }
    }

    fn load(&self, user_id: &str) -> Result<OAuthToken, InfraError> {
        self.store
            .load_token(user_id)?
            .ok_or_else(|| InfraError::CredentialMissing(user_id.to_string()))
    }

    fn token_from_response(
        &self,
        response: OAuthTokenResponse,
        fallback_refresh_token: Option<String>,
    ) -> OAuthToken {
        let now = (self.now_provider)();
        OAuthToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(fallback_refresh_token),
            expires_at: response.expires_in.map(|seconds| now + Duration::seconds(seconds)),
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            scope: response.scope,
        }
    }
}

#[async_trait]
impl<T, C> AccessTokenProvider for CredentialRefresher<T, C>
where
    T: TokenStore,
    C: OAuthHttpClient,
{
    async fn ensure_fresh_token(&self, user_id: &str) -> Result<OAuthToken, InfraError> {
        CredentialRefresher::ensure_fresh_token(self, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::SqliteStore;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    enum FakeResponse {
        Success(OAuthTokenResponse),
        Unavailable,
        InvalidGrant,
    }

    fn success(access_token: &str, refresh_token: Option<&str>) -> FakeResponse {
        FakeResponse::Success(OAuthTokenResponse {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(ToOwned::to_owned),
            expires_in: Some(3600),
            token_type: Some("Bearer".to_string()),
            scope: None,
        })
    }

    #[derive(Debug, Default)]
    struct FakeOAuthHttpClient {
        responses: Mutex<VecDeque<FakeResponse>>,
        delay_ms: u64,
        exchange_calls: AtomicUsize,
        refresh_calls: AtomicUsize,
    }

    impl FakeOAuthHttpClient {
        fn with_responses(responses: Vec<FakeResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn next(&self) -> Result<OAuthTokenResponse, InfraError> {
            let response = self
                .responses
                .lock()
                .expect("responses lock poisoned")
                .pop_front()
                .unwrap_or_else(|| success("fallback-access", None));
            match response {
                FakeResponse::Success(value) => Ok(value),
                FakeResponse::Unavailable => Err(InfraError::Http {
                    status: 503,
                    message: "unavailable".to_string(),
                }),
                FakeResponse::InvalidGrant => Err(InfraError::Http {
                    status: 400,
                    message: "token endpoint error: invalid_grant; revoked".to_string(),
                }),
            }
        }
    }

    #[async_trait]
    impl OAuthHttpClient for FakeOAuthHttpClient {
        async fn exchange_authorization_code(
            &self,
            _request: OAuthCodeExchangeRequest,
        ) -> Result<OAuthTokenResponse, InfraError> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            self.next()
        }

        async fn refresh_access_token(
            &self,
            _request: OAuthRefreshRequest,
        ) -> Result<OAuthTokenResponse, InfraError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                sleep(TokioDuration::from_millis(self.delay_ms)).await;
            }
            self.next()
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-16T09:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn test_config() -> OAuthConfig {
        OAuthConfig::new(
            "client-id",
            "client-secret",
            "http://localhost/oauth2/callback",
            vec!["https://www.googleapis.com/auth/calendar".to_string()],
        )
    }

    fn fast_policy() -> RefreshPolicy {
        RefreshPolicy {
            lock_backoff_base_ms: 10,
            refresh_backoff_base_ms: 1,
            ..RefreshPolicy::default()
        }
    }

    fn stored_token(expires_in_secs: Option<i64>) -> OAuthToken {
        OAuthToken {
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: expires_in_secs.map(|seconds| fixed_time() + Duration::seconds(seconds)),
            token_type: "Bearer".to_string(),
            scope: None,
        }
    }

    fn store_with(token: Option<OAuthToken>) -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().expect("open store");
        if let Some(token) = token {
            store.save_token("usr-1", &token, fixed_time()).expect("save token");
        }
        Arc::new(store)
    }

    fn refresher(
        store: &Arc<SqliteStore>,
        client: &Arc<FakeOAuthHttpClient>,
    ) -> CredentialRefresher<SqliteStore, FakeOAuthHttpClient> {
        CredentialRefresher::new(test_config(), Arc::clone(store), Arc::clone(client))
            .with_policy(fast_policy())
            .with_now_provider(Arc::new(fixed_time))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let store = store_with(Some(stored_token(Some(-60))));
        let client = Arc::new(FakeOAuthHttpClient {
            delay_ms: 40,
            ..FakeOAuthHttpClient::with_responses(vec![success("access-2", None)])
        });
        let first = refresher(&store, &client);
        let second = refresher(&store, &client);

        let (left, right) = tokio::join!(
            first.ensure_fresh_token("usr-1"),
            second.ensure_fresh_token("usr-1")
        );

        assert_eq!(left.expect("first caller").access_token, "access-2");
        assert_eq!(right.expect("second caller").access_token, "access-2");
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_and_non_expiring_tokens_skip_the_provider() {
        for token in [stored_token(Some(3600)), stored_token(None)] {
            let store = store_with(Some(token.clone()));
            let client = Arc::new(FakeOAuthHttpClient::default());
            let loaded = refresher(&store, &client)
                .ensure_fresh_token("usr-1")
                .await
                .expect("token");
            assert_eq!(loaded, token);
            assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn near_expiry_token_is_refreshed_and_keeps_refresh_token() {
        let store = store_with(Some(stored_token(Some(120))));
        let client = Arc::new(FakeOAuthHttpClient::with_responses(vec![success("access-2", None)]));

        let token = refresher(&store, &client)
            .ensure_fresh_token("usr-1")
            .await
            .expect("token");
        assert_eq!(token.access_token, "access-2");
        assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(token.expires_at, Some(fixed_time() + Duration::seconds(3600)));

        let persisted = store.load_token("usr-1").expect("load").expect("token");
        assert_eq!(persisted, token);
    }

    #[tokio::test]
    async fn rotated_refresh_token_replaces_the_old_one() {
        let store = store_with(Some(stored_token(Some(-1))));
        let client = Arc::new(FakeOAuthHttpClient::with_responses(vec![success(
            "access-2",
            Some("refresh-2"),
        )]));

        refresher(&store, &client)
            .ensure_fresh_token("usr-1")
            .await
            .expect("token");
        let persisted = store.load_token("usr-1").expect("load").expect("token");
        assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn missing_token_is_reported() {
        let store = store_with(None);
        let client = Arc::new(FakeOAuthHttpClient::default());
        let result = refresher(&store, &client).ensure_fresh_token("usr-1").await;
        assert!(matches!(result, Err(InfraError::CredentialMissing(_))));
    }

    #[tokio::test]
    async fn invalid_grant_fails_without_retrying() {
        let store = store_with(Some(stored_token(Some(-1))));
        let client = Arc::new(FakeOAuthHttpClient::with_responses(vec![FakeResponse::InvalidGrant]));

        let result = refresher(&store, &client).ensure_fresh_token("usr-1").await;
        assert!(matches!(result, Err(InfraError::CredentialRevoked(_))));
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);

        // The lease is released even on failure.
        assert!(
            store
                .try_acquire_refresh_lease("usr-1", "next-owner", fixed_time(), Duration::seconds(30))
                .expect("lease")
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_exhausted() {
        let store = store_with(Some(stored_token(Some(-1))));
        let client = Arc::new(FakeOAuthHttpClient::with_responses(vec![
            FakeResponse::Unavailable,
            FakeResponse::Unavailable,
            FakeResponse::Unavailable,
        ]));

        let result = refresher(&store, &client).ensure_fresh_token("usr-1").await;
        assert!(matches!(result, Err(InfraError::RefreshExhausted(_))));
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failure_then_success_refreshes() {
        let store = store_with(Some(stored_token(Some(-1))));
        let client = Arc::new(FakeOAuthHttpClient::with_responses(vec![
            FakeResponse::Unavailable,
            success("access-2", None),
        ]));

        let token = refresher(&store, &client)
            .ensure_fresh_token("usr-1")
            .await
            .expect("token");
        assert_eq!(token.access_token, "access-2");
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn held_lease_falls_back_to_unlocked_refresh() {
        let store = store_with(Some(stored_token(Some(-1))));
        assert!(
            store
                .try_acquire_refresh_lease("usr-1", "stuck", fixed_time(), Duration::seconds(30))
                .expect("lease")
        );
        let client = Arc::new(FakeOAuthHttpClient::with_responses(vec![success("access-2", None)]));
        let service = refresher(&store, &client).with_policy(RefreshPolicy {
            lock_retry_ceiling: 2,
            lock_backoff_base_ms: 1,
            ..fast_policy()
        });

        let token = service.ensure_fresh_token("usr-1").await.expect("token");
        assert_eq!(token.access_token, "access-2");
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);
    }

    /// Hands the lease to another owner, who stores a newer token, while the
    /// first caller's refresh request is still in flight.
    struct LeaseTakeoverClient {
        store: Arc<SqliteStore>,
        newer: OAuthToken,
        refresh_calls: AtomicUsize,
    }

    #[async_trait]
    impl OAuthHttpClient for LeaseTakeoverClient {
        async fn exchange_authorization_code(
            &self,
            _request: OAuthCodeExchangeRequest,
        ) -> Result<OAuthTokenResponse, InfraError> {
            Err(InfraError::OAuth("not used".to_string()))
        }

        async fn refresh_access_token(
            &self,
            _request: OAuthRefreshRequest,
        ) -> Result<OAuthTokenResponse, InfraError> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let after_expiry = fixed_time() + Duration::hours(1);
            assert!(
                self.store
                    .try_acquire_refresh_lease("usr-1", "other", after_expiry, Duration::seconds(30))
                    .expect("take over lease")
            );
            assert!(
                self.store
                    .save_token_under_lease("usr-1", "other", &self.newer, after_expiry)
                    .expect("newer token")
            );
            Ok(OAuthTokenResponse {
                access_token: "stale-access".to_string(),
                refresh_token: Some("stale-refresh".to_string()),
                expires_in: Some(3600),
                token_type: Some("Bearer".to_string()),
                scope: None,
            })
        }
    }

    #[tokio::test]
    async fn lapsed_lease_never_overwrites_the_newer_token() {
        let store = store_with(Some(stored_token(Some(-1))));
        let newer = OAuthToken {
            access_token: "newer-access".to_string(),
            refresh_token: Some("newer-refresh".to_string()),
            expires_at: Some(fixed_time() + Duration::hours(2)),
            token_type: "Bearer".to_string(),
            scope: None,
        };
        let client = Arc::new(LeaseTakeoverClient {
            store: Arc::clone(&store),
            newer: newer.clone(),
            refresh_calls: AtomicUsize::new(0),
        });
        let service = CredentialRefresher::new(test_config(), Arc::clone(&store), Arc::clone(&client))
            .with_policy(fast_policy())
            .with_now_provider(Arc::new(fixed_time));

        let token = service.ensure_fresh_token("usr-1").await.expect("token");

        assert_eq!(token, newer);
        assert_eq!(store.load_token("usr-1").expect("load"), Some(newer));
        assert_eq!(client.refresh_calls.load(Ordering::SeqCst), 1);
        // The lease stays with the caller that took it over.
        assert!(
            !store
                .try_acquire_refresh_lease("usr-1", "third", fixed_time(), Duration::seconds(30))
                .expect("lease")
        );
    }

    #[tokio::test]
    async fn authenticate_with_code_persists_token() {
        let store = store_with(None);
        let client = Arc::new(FakeOAuthHttpClient::with_responses(vec![success(
            "code-access",
            Some("code-refresh"),
        )]));
        let service = refresher(&store, &client);

        let token = service
            .authenticate_with_code("usr-1", "sample-code")
            .await
            .expect("authenticate");
        assert_eq!(client.exchange_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.load_token("usr-1").expect("load"), Some(token));

        service.revoke_local("usr-1").expect("revoke");
        assert_eq!(store.load_token("usr-1").expect("load"), None);
    }

    #[test]
    fn authorization_url_requests_offline_access() {
        let store = store_with(None);
        let client = Arc::new(FakeOAuthHttpClient::default());
        let url = refresher(&store, &client)
            .authorization_url("state-123")
            .expect("url");
        let parsed = Url::parse(&url).expect("parse url");
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("access_type".to_string(), "offline".to_string())));
        assert!(pairs.contains(&("state".to_string(), "state-123".to_string())));
        assert!(pairs.contains(&("client_id".to_string(), "client-id".to_string())));
    }

    // Feature: cadence, Property 5: a token is due for refresh iff it expires within the buffer
    proptest! {
        #[test]
        fn property5_refresh_due_iff_within_buffer(
            offset_secs in -86_400i64..86_400i64,
            buffer_secs in 0i64..3_600i64
        ) {
            let token = stored_token(Some(offset_secs));
            let state = TokenState::of(&token, fixed_time(), Duration::seconds(buffer_secs));
            prop_assert_eq!(state.needs_refresh(), offset_secs <= buffer_secs);
            prop_assert_eq!(state == TokenState::Expired, offset_secs <= 0);
        }
    }
}
