use thiserror::Error;

/// Classification of a failed provider call.
///
/// Matches what the observability layer derives from error text, so the
/// same categories show up in breaker decisions and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimit,
    Auth,
    Connection,
    Api,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::Connection => "connection",
            ProviderErrorKind::Api => "api",
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque wrapper for a backing-store driver error, so the core crate
/// stays independent of the storage driver.
#[derive(Debug)]
pub struct StorageError(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for StorageError {}

/// Error kinds surfaced across the core.
///
/// Provider errors never escape the gateway (they manifest as a skipped
/// provider in the chain); storage errors propagate to the caller
/// unchanged; supervisor errors are reported via exit codes.
#[derive(Debug, Error)]
pub enum KaitError {
    /// Backing store unavailable or corrupt. Not retried locally.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("provider {provider} failed ({kind}): {message}")]
    Provider {
        provider: String,
        kind: ProviderErrorKind,
        message: String,
    },

    /// Synthetic signal: the breaker refused the request. From outside the
    /// gateway this is indistinguishable from plain unavailability.
    #[error("circuit open for provider {0}")]
    CircuitOpen(String),

    /// Another live instance of the same worker holds the PID lock.
    #[error("lock held by pid {pid} for worker {worker}")]
    LockHeld { worker: String, pid: u32 },

    #[error("worker {worker} failed to start: {reason}")]
    StartFailed { worker: String, reason: String },

    /// Caller should back off for `retry_after_s` seconds.
    #[error("rate limited, retry after {retry_after_s}s")]
    RateLimited { retry_after_s: u64 },

    /// Event quarantined; not retried.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KaitError {
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        KaitError::Storage(StorageError(Box::new(err)))
    }

    pub fn provider(provider: &str, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        KaitError::Provider {
            provider: provider.to_string(),
            kind,
            message: message.into(),
        }
    }
}
