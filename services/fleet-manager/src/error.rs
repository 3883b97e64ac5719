//! Error taxonomy for fleet operations.
//!
//! Per-instance errors are contained by the caller and logged. Backend-wide
//! and queue-wide errors surface as a degraded pass or consumer status.

use thiserror::Error;

use crate::types::BackendKind;

/// Errors produced by backends, the CI platform, the job queue and the
/// metrics exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FleetError {
    /// A create failed. Transient; recomputed on the next pass.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// The resource does not exist. A no-op for deletes.
    #[error("not found: {0}")]
    NotFound(String),

    /// The provider refused the create for quota reasons.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Backend and platform views of a runner disagree.
    #[error("registration mismatch: {0}")]
    RegistrationMismatch(String),

    /// The job queue could not be reached.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// The backend could not be reached at all.
    #[error("backend {backend} unreachable: {message}")]
    BackendUnreachable {
        backend: BackendKind,
        message: String,
    },

    /// The CI platform API could not be reached or rejected the call.
    #[error("CI platform unavailable: {0}")]
    PlatformUnavailable(String),

    /// A queued job request could not be understood.
    #[error("invalid job request: {0}")]
    InvalidJobRequest(String),

    /// Reading or writing a job outcome record failed.
    #[error("metrics exchange error: {0}")]
    Exchange(String),
}

impl FleetError {
    /// Errors that feed the per-spec quarantine counter.
    pub fn counts_toward_quarantine(&self) -> bool {
        matches!(self, FleetError::Provision(_) | FleetError::QuotaExceeded(_))
    }

    /// Errors that mean no further calls should go to this backend this pass.
    pub fn is_backend_wide(&self) -> bool {
        matches!(self, FleetError::BackendUnreachable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FleetError::NotFound(_))
    }

    pub fn unreachable(backend: BackendKind, message: impl std::fmt::Display) -> Self {
        FleetError::BackendUnreachable {
            backend,
            message: message.to_string(),
        }
    }
}

/// Result alias for fleet operations.
pub type Result<T, E = FleetError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarantine_classification() {
        assert!(FleetError::Provision("boom".into()).counts_toward_quarantine());
        assert!(FleetError::QuotaExceeded("cores".into()).counts_toward_quarantine());
        assert!(!FleetError::PlatformUnavailable("503".into()).counts_toward_quarantine());
        assert!(!FleetError::unreachable(BackendKind::Cloud, "refused").counts_toward_quarantine());
    }

    #[test]
    fn test_backend_wide() {
        let err = FleetError::unreachable(BackendKind::Local, "no socket");
        assert!(err.is_backend_wide());
        assert_eq!(err.to_string(), "backend local unreachable: no socket");
        assert!(!FleetError::NotFound("x".into()).is_backend_wide());
    }
}
