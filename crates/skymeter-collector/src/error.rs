//! Error types for the metering pipeline.

use std::time::Duration;

use thiserror::Error;

/// Failures raised by the provider client, classified for the retry policy.
///
/// All provider failures are handled locally within the cycle that observed
/// them; none terminate other workers or the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The named resource group does not exist (404-class). Counts toward
    /// the removal threshold only when it names the cluster's own group.
    #[error("resource group {name} not found")]
    ResourceGroupNotFound {
        /// Name of the missing resource group.
        name: String,
    },

    /// The provider is throttling requests (429-class). Triggers a one-cycle
    /// self-throttle.
    #[error("too many requests, provider is throttling")]
    RateLimited,

    /// The bounded per-cycle fetch exceeded its deadline.
    #[error("metrics fetch exceeded the {limit:?} cycle deadline")]
    Timeout {
        /// The configured per-cycle fetch timeout.
        limit: Duration,
    },

    /// Synthesized failure for a cycle skipped by the self-throttle; treated
    /// as transient by the classification.
    #[error("client-side self-throttling, skipped metrics fetch")]
    SelfThrottle,

    /// Any other provider or transport failure; transient.
    #[error("provider request failed: {reason}")]
    Request {
        /// Human-readable failure description.
        reason: String,
        /// HTTP-like status code, when the provider reported one.
        status: Option<u16>,
    },
}

impl ProviderError {
    /// HTTP-like status code associated with this failure, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ResourceGroupNotFound { .. } => Some(404),
            Self::RateLimited => Some(429),
            Self::Request { status, .. } => *status,
            Self::Timeout { .. } | Self::SelfThrottle => None,
        }
    }
}

/// Failures owned by the pipeline itself rather than the provider.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Per-cluster client construction failed; the cluster is dropped until
    /// the next feed notification.
    #[error("could not build provider client: {reason}")]
    ClientConstruction {
        /// Why construction failed.
        reason: String,
    },

    /// No constructor registered for the requested provider name.
    #[error("unknown provider: {name}")]
    UnknownProvider {
        /// The unrecognized provider name.
        name: String,
    },

    /// A provider constructor was registered twice.
    #[error("provider already registered: {name}")]
    DuplicateProvider {
        /// The duplicated provider name.
        name: String,
    },

    /// A usage event could not be serialized; the event is dropped but the
    /// instance state is still persisted.
    #[error("could not serialize usage event: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    #[test_case(ProviderError::ResourceGroupNotFound { name: "c-42".to_string() }, Some(404); "not found")]
    #[test_case(ProviderError::RateLimited, Some(429); "rate limited")]
    #[test_case(ProviderError::Request { reason: "bad gateway".to_string(), status: Some(502) }, Some(502); "request with status")]
    #[test_case(ProviderError::Request { reason: "connection reset".to_string(), status: None }, None; "request without status")]
    #[test_case(ProviderError::Timeout { limit: Duration::from_secs(120) }, None; "timeout")]
    #[test_case(ProviderError::SelfThrottle, None; "self throttle")]
    fn status_classification(error: ProviderError, status: Option<u16>) {
        assert_eq!(error.status(), status);
    }

    #[test]
    fn provider_error_display() {
        let err = ProviderError::ResourceGroupNotFound {
            name: "c-42".to_string(),
        };
        assert_eq!(err.to_string(), "resource group c-42 not found");

        let err = ProviderError::Request {
            reason: "bad gateway".to_string(),
            status: Some(502),
        };
        assert_eq!(err.to_string(), "provider request failed: bad gateway");
    }

    #[test]
    fn collector_error_display() {
        let err = CollectorError::ClientConstruction {
            reason: "missing credentials".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "could not build provider client: missing credentials"
        );

        let err = CollectorError::UnknownProvider {
            name: "gcp".to_string(),
        };
        assert_eq!(err.to_string(), "unknown provider: gcp");
    }
}
