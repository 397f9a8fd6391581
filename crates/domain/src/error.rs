use serde::Serialize;

/// Shared error type used across all chatcore crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Recoverability classification for an error surfaced to a client over the
/// WebSocket Gateway. Classification is first-match-wins over a small set of
/// substring patterns, mirroring how provider HTTP error bodies are
/// inspected before a typed error is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ContextLimit,
    RateLimit,
    AuthError,
    ProviderError,
    Unknown,
}

impl ErrorClass {
    /// Whether a turn in this error class may be retried automatically by
    /// the gateway (as opposed to surfaced to the client as terminal).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::RateLimit | ErrorClass::ProviderError)
    }
}

/// Classify an error message into a recoverability bucket.
///
/// Patterns are checked in order; the first match wins. This deliberately
/// favors precision over provider-specific exhaustiveness — providers that
/// return structured error codes should be classified before the message
/// ever reaches this function.
pub fn classify_error(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();

    const CONTEXT_LIMIT_PATTERNS: &[&str] = &[
        "context_length_exceeded",
        "maximum context length",
        "context window",
        "too many tokens",
        "prompt is too long",
    ];
    const RATE_LIMIT_PATTERNS: &[&str] = &["rate_limit", "rate limit", "too many requests", "429"];
    const AUTH_PATTERNS: &[&str] = &[
        "invalid api key",
        "unauthorized",
        "authentication",
        "401",
        "403",
        "invalid_api_key",
    ];
    const PROVIDER_PATTERNS: &[&str] = &[
        "internal server error",
        "bad gateway",
        "service unavailable",
        "gateway timeout",
        "502",
        "503",
        "504",
        "overloaded",
    ];

    if CONTEXT_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::ContextLimit;
    }
    if RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::RateLimit;
    }
    if AUTH_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::AuthError;
    }
    if PROVIDER_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::ProviderError;
    }
    ErrorClass::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_context_limit() {
        assert_eq!(
            classify_error("Error: context_length_exceeded for this model"),
            ErrorClass::ContextLimit
        );
    }

    #[test]
    fn classifies_rate_limit() {
        assert_eq!(classify_error("429 Too Many Requests"), ErrorClass::RateLimit);
    }

    #[test]
    fn classifies_auth_error() {
        assert_eq!(
            classify_error("401 Unauthorized: invalid api key"),
            ErrorClass::AuthError
        );
    }

    #[test]
    fn classifies_provider_error() {
        assert_eq!(
            classify_error("502 Bad Gateway from upstream"),
            ErrorClass::ProviderError
        );
    }

    #[test]
    fn unknown_when_no_pattern_matches() {
        assert_eq!(classify_error("something unexpected happened"), ErrorClass::Unknown);
    }

    #[test]
    fn first_match_wins_when_multiple_patterns_present() {
        let msg = "maximum context length reached, upstream also returned 503";
        assert_eq!(classify_error(msg), ErrorClass::ContextLimit);
    }

    #[test]
    fn retryability_matches_class() {
        assert!(ErrorClass::RateLimit.is_retryable());
        assert!(ErrorClass::ProviderError.is_retryable());
        assert!(!ErrorClass::ContextLimit.is_retryable());
        assert!(!ErrorClass::AuthError.is_retryable());
        assert!(!ErrorClass::Unknown.is_retryable());
    }
}
