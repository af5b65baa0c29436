//! Error types for the SFU session layer

use thiserror::Error;

/// Errors reported back to the peer that issued a request.
///
/// None of these are fatal for the process; the only fatal condition (losing
/// the media engine) is delivered as an [`crate::EngineEvent::WorkerDied`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SfuError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    #[error("Engine failure: {0}")]
    EngineFailure(String),

    #[error("Duplicate resource: {0}")]
    DuplicateResource(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),
}

impl SfuError {
    /// Stable error code sent to clients
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::CapabilityMismatch(_) => "capability_mismatch",
            Self::EngineFailure(_) => "engine_failure",
            Self::DuplicateResource(_) => "duplicate_resource",
            Self::LimitExceeded(_) => "limit_exceeded",
        }
    }

    pub(crate) fn peer_not_found(peer_id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("peer {peer_id}"))
    }
}

/// Failures reported by the media engine collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("engine unavailable")]
    Unavailable,

    #[error("timed out after {0}ms")]
    Timeout(u64),
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        Self::EngineFailure(err.to_string())
    }
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, SfuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_maps_to_engine_failure() {
        let err: SfuError = EngineError::Rejected("bad dtls".to_string()).into();
        assert_eq!(err.code(), "engine_failure");
        assert_eq!(err.to_string(), "Engine failure: rejected: bad dtls");
    }
}
