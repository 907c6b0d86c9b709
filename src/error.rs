//! Error types for modelrelay.
//!
//! Two layers: [`ProviderError`] describes a single failed attempt against a
//! single provider, [`Error`] describes the outcome of a whole routed request.

use std::fmt;
use std::time::Duration;

/// Result type alias for modelrelay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for a routed request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No eligible providers: {0}")]
    NoEligibleProvider(Exclusions),

    #[error("All providers failed: {}", summarize_failures(.failures))]
    AllProvidersFailed { failures: Vec<ProviderFailure> },

    #[error("Request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure of a single attempt against one provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The provider is throttling us.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Connection failure, timeout or an interrupted stream.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Non-success status that is not throttling.
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Shorthand for a rate-limit error without a retry hint.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        ProviderError::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    /// Server-provided hint for how long to wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short category tag used in health records and log fields.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limit",
            ProviderError::Unavailable(_) => "unavailable",
            ProviderError::Api { .. } => "api",
            ProviderError::InvalidResponse(_) => "invalid_response",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ProviderError::InvalidResponse(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                return ProviderError::rate_limited(err.to_string());
            }
            return ProviderError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        ProviderError::Unavailable(err.to_string())
    }
}

/// Terminal error of one provider after its retries were exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub attempts: u32,
    pub error: ProviderError,
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.provider, self.attempts, self.error
        )
    }
}

/// Why the eligible set came out empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub registered: usize,
    pub circuit_open: usize,
    pub missing_capabilities: usize,
    pub over_budget: usize,
}

impl fmt::Display for Exclusions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.registered == 0 {
            return write!(f, "no providers registered");
        }
        write!(
            f,
            "{} registered, {} with open circuit, {} missing capabilities, {} over cost threshold",
            self.registered, self.circuit_open, self.missing_capabilities, self.over_budget
        )
    }
}

/// Format provider failures as `"3/alpha (rate_limit), 1/beta (api)"`.
///
/// Preserves the order in which providers were attempted.
pub fn summarize_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "no attempts made".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}/{} ({})", f.attempts, f.provider, f.error.error_type()))
        .collect::<Vec<_>>()
        .join(", ")
}
