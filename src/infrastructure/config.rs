use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const SUPPORTED_SCHEMA: u64 = 1;

pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_REDIRECT_URI: &str = "http://127.0.0.1:8765/oauth2/callback";
pub const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub schema: u8,
    /// Name of the remote calendar events are mirrored into.
    pub calendar_name: String,
    pub materialization: MaterializationSettings,
    pub sync: SyncSettings,
    pub credentials: CredentialSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializationSettings {
    pub horizon_days: u32,
    pub interval_secs: u64,
    pub grace_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    pub page_size: u32,
    pub max_events: u32,
    pub lookback_days: u32,
    pub request_timeout_secs: u64,
    pub retry_max_attempts: u8,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialSettings {
    pub refresh_buffer_secs: i64,
    pub lock_retry_ceiling: u32,
    pub lock_backoff_base_ms: u64,
    pub lock_lease_secs: i64,
    pub refresh_max_attempts: u32,
    pub refresh_backoff_base_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema: 1,
            calendar_name: "Cadence".to_string(),
            materialization: MaterializationSettings::default(),
            sync: SyncSettings::default(),
            credentials: CredentialSettings::default(),
        }
    }
}

impl Default for MaterializationSettings {
    fn default() -> Self {
        Self {
            horizon_days: 60,
            interval_secs: 3600,
            grace_days: 7,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            page_size: 250,
            max_events: 2500,
            lookback_days: 30,
            request_timeout_secs: 30,
            retry_max_attempts: 3,
            retry_base_delay_ms: 200,
        }
    }
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            refresh_buffer_secs: 300,
            lock_retry_ceiling: 5,
            lock_backoff_base_ms: 100,
            lock_lease_secs: 120,
            refresh_max_attempts: 3,
            refresh_backoff_base_ms: 500,
        }
    }
}

impl CredentialSettings {
    /// Longest a lease holder can spend refreshing: every attempt running into
    /// the request timeout plus the backoff sleeps between attempts.
    pub fn worst_case_refresh_ms(&self, request_timeout_secs: u64) -> u64 {
        let attempts = u64::from(self.refresh_max_attempts.max(1));
        let requests = attempts.saturating_mul(request_timeout_secs.saturating_mul(1000));
        let backoff = (0..attempts.saturating_sub(1) as u32)
            .map(|attempt| self.refresh_backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt)))
            .fold(0u64, u64::saturating_add);
        requests.saturating_add(backoff)
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), InfraError> {
        let checks: [(bool, &str); 8] = [
            (self.calendar_name.trim().is_empty(), "calendar_name must not be empty"),
            (self.materialization.horizon_days == 0, "materialization.horizon_days must be > 0"),
            (self.materialization.interval_secs == 0, "materialization.interval_secs must be > 0"),
            (self.sync.interval_secs == 0, "sync.interval_secs must be > 0"),
            (
                !(1..=2500).contains(&self.sync.page_size),
                "sync.page_size must be within 1..=2500",
            ),
            (self.sync.request_timeout_secs == 0, "sync.request_timeout_secs must be > 0"),
            (self.credentials.lock_lease_secs <= 0, "credentials.lock_lease_secs must be > 0"),
            (
                self.credentials.refresh_buffer_secs < 0,
                "credentials.refresh_buffer_secs must be >= 0",
            ),
        ];
        if let Some((_, message)) = checks.into_iter().find(|(failed, _)| *failed) {
            return Err(InfraError::InvalidConfig(message.to_string()));
        }

        // A lease that lapses mid-refresh lets a second caller refresh too.
        let worst_case_ms = self
            .credentials
            .worst_case_refresh_ms(self.sync.request_timeout_secs);
        let lease_ms = u64::try_from(self.credentials.lock_lease_secs)
            .unwrap_or(0)
            .saturating_mul(1000);
        if lease_ms <= worst_case_ms {
            return Err(InfraError::InvalidConfig(format!(
                "credentials.lock_lease_secs must exceed the worst-case refresh time of {worst_case_ms} ms"
            )));
        }
        Ok(())
    }
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    let path = config_dir.join(APP_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&AppConfig::default())?;
        fs::write(&path, format!("{formatted}\n"))?;
        tracing::info!(path = %path.display(), "wrote default app config");
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != SUPPORTED_SCHEMA {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_app_config(config_dir: &Path) -> Result<AppConfig, InfraError> {
    let path = config_dir.join(APP_JSON);
    let value = read_config(&path)?;
    let config: AppConfig = serde_json::from_value(value).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid {}: {error}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub token_endpoint: String,
    pub authorization_endpoint: String,
}

impl OAuthConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            authorization_endpoint: DEFAULT_AUTHORIZATION_ENDPOINT.to_string(),
        }
    }
}

pub fn load_oauth_config_from_env() -> Result<OAuthConfig, InfraError> {
    load_oauth_config_from_lookup(|key| std::env::var(key).ok())
}

pub fn load_oauth_config_from_lookup<F>(lookup: F) -> Result<OAuthConfig, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    let client_id = required_lookup_value(
        &lookup,
        &["CADENCE_GOOGLE_CLIENT_ID", "GOOGLE_CLIENT_ID"],
        "google client id",
    )?;
    let client_secret = required_lookup_value(
        &lookup,
        &["CADENCE_GOOGLE_CLIENT_SECRET", "GOOGLE_CLIENT_SECRET"],
        "google client secret",
    )?;
    let redirect_uri =
        optional_lookup_value(&lookup, &["CADENCE_GOOGLE_REDIRECT_URI", "GOOGLE_REDIRECT_URI"])
            .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string());
    let scopes = optional_lookup_value(&lookup, &["CADENCE_GOOGLE_SCOPES", "GOOGLE_SCOPES"])
        .map(|raw| parse_scope_list(&raw))
        .filter(|scopes| !scopes.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_SCOPE.to_string()]);

    let mut config = OAuthConfig::new(client_id, client_secret, redirect_uri, scopes);
    if let Some(endpoint) = optional_lookup_value(&lookup, &["CADENCE_GOOGLE_TOKEN_ENDPOINT"]) {
        config.token_endpoint = endpoint;
    }
    Ok(config)
}

fn required_lookup_value<F>(lookup: &F, keys: &[&str], field_name: &str) -> Result<String, InfraError>
where
    F: Fn(&str) -> Option<String>,
{
    optional_lookup_value(lookup, keys).ok_or_else(|| {
        InfraError::InvalidConfig(format!(
            "missing {} (set one of: {})",
            field_name,
            keys.join(", ")
        ))
    })
}

fn optional_lookup_value<F>(lookup: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|key| lookup(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn parse_scope_list(raw: &str) -> Vec<String> {
    raw.split([',', ' ', '\n', '\t'])
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
