//! Error taxonomy for the telemetry pipeline
//!
//! Only [`PipelineError::Validation`] is ever surfaced to application code.
//! Every other variant is absorbed by the pipeline and turned into a retry
//! or a counted, bounded loss.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed event, rejected synchronously and never queued
    #[error("invalid event: {0}")]
    Validation(String),

    /// One transport attempt failed (network error, non-2xx, timeout)
    #[error("transport {transport} failed: {message}")]
    Transport { transport: String, message: String },

    /// Every transport was exhausted
    #[error("delivery failed after {attempts} transport attempts")]
    DeliveryFailed { attempts: usize },

    /// The ingestion gate refused admission
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// A queued event aged past the retention ceiling
    #[error("event {event_id} expired after {age_secs}s in the offline queue")]
    RetentionExpired { event_id: String, age_secs: i64 },

    /// The durable queue store could not be written or read
    #[error("queue persistence error: {0}")]
    Persistence(String),

    /// The gate's analytics store rejected a write
    #[error("storage error: {0}")]
    Storage(String),

    #[error("analyzer cleanup is not available in production")]
    CleanupForbidden,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The pipeline task is gone
    #[error("telemetry pipeline is closed")]
    PipelineClosed,
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Failures the client answers by queueing and retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::DeliveryFailed { .. }
                | Self::RateLimited { .. }
                | Self::Storage(_)
        )
    }
}

/// Result type alias for the telemetry pipeline
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_is_retryable_like_delivery_failure() {
        assert!(PipelineError::RateLimited { retry_after_secs: 3 }.is_retryable());
        assert!(PipelineError::DeliveryFailed { attempts: 3 }.is_retryable());
        assert!(PipelineError::Storage("analytics store unavailable".into()).is_retryable());
        assert!(!PipelineError::validation("missing name").is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::transport("primary", "timed out");
        assert_eq!(err.to_string(), "transport primary failed: timed out");
    }
}
