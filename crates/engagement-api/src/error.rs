//! Error taxonomy for the engagement API layer.
//!
//! Every variant maps to a stable code and a retry hint so the service can choose a
//! status without inspecting messages.

use engagement_core::EngagementError;

/// Failures raised by a fast (ephemeral) store backend.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FastStoreError {
    #[error("fast store connection failed: {0}")]
    Connection(String),
    #[error("fast store command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for FastStoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("signal store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("dedupe lock {key} not acquired within {timeout_ms}ms")]
    LockTimeout { key: String, timeout_ms: u64 },
    #[error(transparent)]
    FastStore(#[from] FastStoreError),
    #[error("config error: {0}")]
    Config(String),
}

impl ApiError {
    /// Transient failures the caller may retry as-is.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::LockTimeout { .. } | Self::FastStore(_))
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_INVALID_INPUT",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::FastStore(_) => "FAST_STORE_FAILED",
            Self::Config(_) => "CONFIG_INVALID",
        }
    }

    pub(crate) fn store(err: &anyhow::Error) -> Self {
        Self::StoreUnavailable(format!("{err:#}"))
    }
}

impl From<EngagementError> for ApiError {
    fn from(err: EngagementError) -> Self {
        match err {
            EngagementError::Validation(message) => Self::Validation(message),
            EngagementError::Config(message) => Self::Config(message),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_covers_transient_failures_only() {
        assert!(ApiError::StoreUnavailable("db locked".to_string()).is_retryable());
        assert!(ApiError::LockTimeout { key: "view:a:b".to_string(), timeout_ms: 250 }
            .is_retryable());
        assert!(ApiError::FastStore(FastStoreError::Connection("refused".to_string()))
            .is_retryable());
        assert!(!ApiError::Validation("blank".to_string()).is_retryable());
        assert!(!ApiError::Config("weights".to_string()).is_retryable());
    }

    #[test]
    fn core_errors_keep_their_category() {
        let err = ApiError::from(EngagementError::Config("prior weight MUST be > 0".to_string()));
        assert_eq!(err.code(), "CONFIG_INVALID");
        assert_eq!(err.to_string(), "config error: prior weight MUST be > 0");
    }
}
