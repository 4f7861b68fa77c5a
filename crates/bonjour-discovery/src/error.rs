//! Error types for the discovery engine

use crate::types::ScanFailure;
use thiserror::Error;

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors that can occur while starting or running a discovery session
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// mDNS service daemon failed to initialize
    #[error("Failed to initialize mDNS daemon: {0}")]
    MdnsInitFailed(String),

    /// Failed to browse for services
    #[error("Failed to browse for service type '{service_type}': {reason}")]
    BrowseFailed { service_type: String, reason: String },

    /// Invalid scan arguments or configuration
    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(String),

    /// Scanner was created outside of a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Outcome of a resolution attempt that did not produce an address
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No ready/failed state was reached before the deadline
    #[error("Timed out resolving '{service}' after {timeout_ms}ms")]
    Timeout { service: String, timeout_ms: u64 },

    /// The reachability probe failed
    #[error("Failed to resolve '{service}': {reason}")]
    ProbeFailed { service: String, reason: String },

    /// The probe became ready but the endpoint shape is unusable
    #[error("Failed to extract address for '{service}': {reason}")]
    ExtractionFailed { service: String, reason: String },

    /// The attempt was aborted because the session stopped
    #[error("Resolution cancelled")]
    Cancelled,
}

impl ResolveError {
    /// Failure reported to listeners, or `None` for a normal cancellation exit.
    pub fn failure_kind(&self) -> Option<ScanFailure> {
        match self {
            ResolveError::Timeout { .. } | ResolveError::ProbeFailed { .. } => {
                Some(ScanFailure::ResolveFailed)
            }
            ResolveError::ExtractionFailed { .. } => Some(ScanFailure::ExtractionFailed),
            ResolveError::Cancelled => None,
        }
    }
}
