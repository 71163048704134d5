use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OAuthCodeExchangeRequest {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorization_code: String,
}

#[derive(Debug, Clone)]
pub struct OAuthRefreshRequest {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthTokenResponse {
    pub access_token: String,
    /// Present only when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    /// `None` when the provider did not bound the token's lifetime.
    pub expires_in: Option<i64>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

#[async_trait]
pub trait OAuthHttpClient: Send + Sync {
    async fn exchange_authorization_code(
        &self,
        request: OAuthCodeExchangeRequest,
    ) -> Result<OAuthTokenResponse, InfraError>;

    async fn refresh_access_token(
        &self,
        request: OAuthRefreshRequest,
    ) -> Result<OAuthTokenResponse, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestOAuthClient {
    client: Client,
}

#[derive(Debug, Default, serde::Deserialize)]
struct TokenEndpointPayload {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl ReqwestOAuthClient {
    pub fn new(timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| InfraError::InvalidConfig(format!("failed building http client: {error}")))?;
        Ok(Self { client })
    }

    async fn post_form(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<OAuthTokenResponse, InfraError> {
        let response = self
            .client
            .post(endpoint)
            .form(params)
            .send()
            .await
            .map_err(|error| InfraError::Network(format!("token request failed: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Network(format!("failed reading token response: {error}")))?;

        // Error bodies are not always JSON (proxies, 5xx pages).
        let parsed = serde_json::from_str::<TokenEndpointPayload>(&body);

        if !status.is_success() {
            let payload = parsed.unwrap_or_default();
            let code = payload
                .error
                .unwrap_or_else(|| format!("http_{}", status.as_u16()));
            let detail = payload.error_description.unwrap_or(body);
            return Err(InfraError::Http {
                status: status.as_u16(),
                message: format!("token endpoint error: {code}; {detail}"),
            });
        }

        let payload = parsed.map_err(|error| {
            InfraError::OAuth(format!("invalid token response payload: {error}"))
        })?;
        if let Some(code) = payload.error {
            let detail = payload.error_description.unwrap_or_default();
            return Err(InfraError::OAuth(format!("token endpoint error: {code}; {detail}")));
        }
        let access_token = payload
            .access_token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| InfraError::OAuth("token response did not include access_token".to_string()))?;

        Ok(OAuthTokenResponse {
            access_token,
            refresh_token: payload.refresh_token.filter(|value| !value.trim().is_empty()),
            expires_in: payload.expires_in.map(|seconds| seconds.max(0)),
            token_type: payload.token_type,
            scope: payload.scope,
        })
    }
}

#[async_trait]
impl OAuthHttpClient for ReqwestOAuthClient {
    async fn exchange_authorization_code(
        &self,
        request: OAuthCodeExchangeRequest,
    ) -> Result<OAuthTokenResponse, InfraError> {
        self.post_form(
            &request.token_endpoint,
            &[
                ("grant_type", "authorization_code".to_string()),
                ("client_id", request.client_id),
                ("client_secret", request.client_secret),
                ("redirect_uri", request.redirect_uri),
                ("code", request.authorization_code),
            ],
        )
        .await
    }

    async fn refresh_access_token(
        &self,
        request: OAuthRefreshRequest,
    ) -> Result<OAuthTokenResponse, InfraError> {
        self.post_form(
            &request.token_endpoint,
            &[
                ("grant_type", "refresh_token".to_string()),
                ("client_id", request.client_id),
                ("client_secret", request.client_secret),
                ("refresh_token", request.refresh_token),
            ],
        )
        .await
    }
}
