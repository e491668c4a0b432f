use std::time::Duration;

use thiserror::Error;

/// Why a document could not be (or was not yet) uploaded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("document '{filename}' is {size} bytes, over the {limit} byte limit")]
    PayloadTooLarge {
        filename: String,
        size: u64,
        limit: u64,
    },
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("upload interrupted: {0}")]
    Interrupted(String),
    #[error("upload acknowledged without a message id")]
    MissingAck,
}

impl UploadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Interrupted(_) | UploadError::MissingAck)
    }
}

/// Failure of one outbound attempt, classified for the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("terminal delivery failure: {0}")]
    Terminal(String),
    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::RateLimited { .. } | DeliveryError::Transient(_) => true,
            DeliveryError::Terminal(_) => false,
            DeliveryError::Upload(err) => err.is_transient(),
        }
    }

    /// Platform-supplied wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(DeliveryError::Transient("502".into()).is_transient());
        assert!(DeliveryError::RateLimited {
            retry_after: Duration::from_secs(3)
        }
        .is_transient());
        assert!(!DeliveryError::Terminal("chat not found".into()).is_transient());
        assert!(DeliveryError::from(UploadError::MissingAck).is_transient());
        assert!(DeliveryError::from(UploadError::Interrupted("reset".into())).is_transient());
        assert!(!DeliveryError::from(UploadError::PayloadTooLarge {
            filename: "a.bin".into(),
            size: 2,
            limit: 1,
        })
        .is_transient());
    }

    #[test]
    fn test_retry_after_only_for_rate_limits() {
        let limited = DeliveryError::RateLimited {
            retry_after: Duration::from_secs(5),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(limited.to_string(), "rate limited, retry after 5s");
        assert_eq!(DeliveryError::Transient("x".into()).retry_after(), None);
    }
}
