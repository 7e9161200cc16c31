use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed failure reported by a model backend for one generation call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum BackendError {
    #[error("authentication failed: {message}")]
    Auth { message: String },
    #[error("insufficient credits: {message}")]
    Credits { message: String },
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_s: Option<u64>,
    },
    #[error("timed out: {message}")]
    Timeout { message: String },
    #[error("network failure: {message}")]
    Network { message: String },
    #[error("content policy rejection: {message}")]
    ContentPolicy { message: String },
    #[error("server error: {message}")]
    ServerError {
        message: String,
        status: Option<u16>,
    },
    #[error("model unavailable: {message}")]
    Unavailable { message: String },
    #[error("generation cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn server(message: impl Into<String>) -> Self {
        Self::ServerError {
            message: message.into(),
            status: None,
        }
    }

    /// Only transient provider-side failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Unavailable { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Credits { .. } => "credits",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::Network { .. } => "network",
            Self::ContentPolicy { .. } => "content_policy",
            Self::ServerError { .. } => "server_error",
            Self::Unavailable { .. } => "unavailable",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn retry_after_s(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_s, .. } => *retry_after_s,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("session {session_id} already has an edit in flight")]
    ConcurrentModificationConflict { session_id: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("all {} variations of batch {batch_id} failed", failures.len())]
    BatchFailed {
        batch_id: String,
        failures: Vec<(usize, BackendError)>,
    },
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "invalid_state",
            Self::NotFound(_) => "not_found",
            Self::ConcurrentModificationConflict { .. } => "concurrent_modification_conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Backend(err) => err.kind(),
            Self::BatchFailed { .. } => "batch_failed",
            Self::Storage(_) => "storage",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
