use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote api error: http {status}; {message}")]
    Http { status: u16, message: String },
    #[error("OAuth error: {0}")]
    OAuth(String),
    #[error("invalid remote response: {0}")]
    InvalidResponse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no stored credential for user {0}")]
    CredentialMissing(String),
    #[error("credential revoked: {0}")]
    CredentialRevoked(String),
    #[error("credential refresh exhausted: {0}")]
    RefreshExhausted(String),
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

impl InfraError {
    /// Timeouts, dropped connections, 5xx and rate limiting.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The remote resource was removed independently of us.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status == 404 || *status == 410)
    }

    /// Failures that invalidate the whole user operation for this cycle.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            Self::CredentialMissing(_) | Self::CredentialRevoked(_) | Self::RefreshExhausted(_)
        )
    }
}
