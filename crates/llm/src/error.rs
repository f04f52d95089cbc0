use thiserror::Error;

/// Error taxonomy for LLM calls. Categories drive the resilient wrapper's
/// fallback decision and the journal's user-facing hints.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("rate limited by {provider}: {message}")]
    RateLimited {
        provider: String,
        message: String,
        /// Parsed Retry-After, seconds.
        retry_after: Option<u64>,
    },

    #[error("unauthorized for {provider}: {message}")]
    Unauthorized { provider: String, message: String },

    #[error("transient failure from {provider}: {message}")]
    Transient { provider: String, message: String },

    #[error("provider returned unparseable output: {0}")]
    Parse(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

/// Substrings that mark an error text as retryable regardless of status code.
const RETRYABLE_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "fetch failed",
    "econnrefused",
    "econnreset",
    "enotfound",
    "network",
    "timeout",
    "timed out",
    "socket hang up",
    "aborted",
];

const UNAUTHORIZED_MARKERS: &[&str] = &["invalid api key", "invalid x-api-key", "authentication"];

impl LlmError {
    /// Whether the resilient wrapper may walk the fallback chain for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Transient { .. } | LlmError::Timeout(_)
        )
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            LlmError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// One-line hint shown to the user on terminal failure.
    pub fn user_hint(&self) -> &'static str {
        match self {
            LlmError::RateLimited { .. } => "rate limits usually reset within a minute",
            LlmError::Unauthorized { .. } => "check the API key for this provider",
            LlmError::Transient { .. } => "the provider had a hiccup; try again shortly",
            LlmError::Parse(_) => "try rephrasing with a simpler request",
            LlmError::Timeout(_) => "try a smaller or simpler request",
            LlmError::Cancelled => "the request was cancelled",
            LlmError::Unknown(_) => "try again; if it persists, check the logs",
        }
    }
}

/// Classify a provider failure from its HTTP status, response text, and the
/// raw `Retry-After` header value when present.
pub fn classify(
    provider: &str,
    status: Option<u16>,
    body: &str,
    retry_after_header: Option<&str>,
) -> LlmError {
    let lower = body.to_lowercase();
    let retry_after = retry_after_header.and_then(|v| v.trim().parse::<u64>().ok());

    match status {
        Some(429) => {
            return LlmError::RateLimited {
                provider: provider.to_string(),
                message: body.to_string(),
                retry_after,
            };
        }
        Some(401) | Some(403) => {
            return LlmError::Unauthorized {
                provider: provider.to_string(),
                message: body.to_string(),
            };
        }
        Some(500) | Some(502) | Some(503) | Some(504) => {
            return LlmError::Transient {
                provider: provider.to_string(),
                message: body.to_string(),
            };
        }
        _ => {}
    }

    if UNAUTHORIZED_MARKERS.iter().any(|m| lower.contains(m)) {
        return LlmError::Unauthorized {
            provider: provider.to_string(),
            message: body.to_string(),
        };
    }
    if lower.contains("rate limit") || lower.contains("too many requests") {
        return LlmError::RateLimited {
            provider: provider.to_string(),
            message: body.to_string(),
            retry_after,
        };
    }
    if RETRYABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        return LlmError::Transient {
            provider: provider.to_string(),
            message: body.to_string(),
        };
    }

    LlmError::Unknown(format!("{provider}: {body}"))
}
