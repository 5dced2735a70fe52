//! Completion client error types.

use thiserror::Error;

/// Errors that can occur while requesting a chat completion.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// The provider could not be reached or answered with a server error.
    /// Retried with backoff; surfaced only once the retry budget is spent.
    #[error("completion service unavailable: {0}")]
    Unavailable(String),

    /// The provider rejected the request with HTTP 429. Never retried
    /// internally; the caller decides how to degrade.
    #[error("rate limited by completion provider")]
    RateLimited {
        /// Provider-suggested wait, from the Retry-After header if present.
        retry_after_ms: Option<u64>,
    },

    /// Authentication failed (HTTP 401/403). Fatal: retrying with the same
    /// credentials cannot succeed.
    #[error("completion provider rejected credentials: {0}")]
    Auth(String),

    /// The provider answered 2xx but the body was not a usable completion.
    #[error("malformed completion response: {0}")]
    InvalidResponse(String),
}

impl CompletionError {
    /// Whether a retry with the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CompletionError::Unavailable(_))
    }
}
