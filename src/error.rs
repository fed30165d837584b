//! Stable, boundary-facing error types shared by every subsystem.
//!
//! Every error enum in this crate implements [`std::error::Error`] plus a `code()` method
//! returning a stable `&'static str`, so the WebSocket and HTTP boundaries can render a
//! uniform `{code, message}` body regardless of which subsystem raised the error. Errors are
//! hand-rolled enums rather than built on `thiserror` — matching the teacher crate's own
//! `ToolError`/`ResourceError` style — and exceptions are reserved for truly unexpected
//! failures; expected failure modes are explicit variants.

use std::fmt;

/// Failures surfaced while validating a bearer credential (§4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization` header and no `session_user` query parameter.
    MissingCredentials,
    /// The token's structure, signature, or expiry is invalid.
    InvalidToken(String),
    /// The token decoded fine but no matching user exists in the user store.
    UserNotFound,
    /// The user record exists but is marked inactive.
    InactiveUser,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingCredentials => write!(f, "missing Authorization header or session_user"),
            AuthError::InvalidToken(reason) => write!(f, "invalid token: {reason}"),
            AuthError::UserNotFound => write!(f, "no user matches the supplied credentials"),
            AuthError::InactiveUser => write!(f, "user account is inactive"),
        }
    }
}

impl std::error::Error for AuthError {}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials => "missing_credentials",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::UserNotFound => "user_not_found",
            AuthError::InactiveUser => "inactive_user",
        }
    }

    /// Short human-readable reason, matching §4.1's "stable error code and short reason".
    pub fn reason(&self) -> String {
        self.to_string()
    }
}

/// Failures resolving an [`crate::config_resolver`] lookup (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// None of the resolution steps (handle, space token, phone lookup, session binding)
    /// produced a match. The resolver never guesses past this point.
    NotFound,
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionError::NotFound => write!(f, "no agent config could be resolved for this session"),
        }
    }
}

impl std::error::Error for ResolutionError {}

impl ResolutionError {
    pub fn code(&self) -> &'static str {
        "agent_not_found"
    }
}

/// Validation failures surfaced inline to a caller rather than closing a connection (§4.7, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        "validation_error"
    }
}

/// Failures from an upstream STT/LLM/TTS provider during an active call (§4.8, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    Unavailable { provider: String, reason: String },
    Timeout { provider: String },
    QuotaExhausted { provider: String },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unavailable { provider, reason } => {
                write!(f, "{provider} unavailable: {reason}")
            }
            ProviderError::Timeout { provider } => write!(f, "{provider} timed out"),
            ProviderError::QuotaExhausted { provider } => write!(f, "{provider} quota exhausted"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::Unavailable { .. } => "provider_unavailable",
            ProviderError::Timeout { .. } => "provider_timeout",
            ProviderError::QuotaExhausted { .. } => "provider_quota_exhausted",
        }
    }
}

/// Pool-exhaustion / backpressure failures surfaced only after retries are exhausted (§4.2, §7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    Exhausted,
    TooManyConnections,
    Other(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Exhausted => write!(f, "connection pool exhausted"),
            PoolError::TooManyConnections => write!(f, "too many connections"),
            PoolError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl PoolError {
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::Exhausted => "pool_exhausted",
            PoolError::TooManyConnections => "too_many_connections",
            PoolError::Other(_) => "pool_error",
        }
    }

    /// `true` for the two retryable failure modes the backoff loop recognizes (§4.2).
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted | PoolError::TooManyConnections)
    }
}

/// Invalid state transitions for [`crate::tasks::model::Task`] or [`crate::voice::CallSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub from: String,
    pub to: String,
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal transition from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

impl TransitionError {
    pub fn code(&self) -> &'static str {
        "invalid_transition"
    }
}
