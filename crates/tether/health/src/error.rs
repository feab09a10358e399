//! Error types for tether-health.

use tether_types::ResourceKind;
use thiserror::Error;

/// Errors that can occur while observing cluster objects.
#[derive(Debug, Error)]
pub enum HealthError {
    /// Reading one object failed.
    #[error("failed to read {kind} {namespace}/{name}: {reason}")]
    ReadFailed {
        kind: ResourceKind,
        namespace: String,
        name: String,
        reason: String,
    },
}

/// Result type for health operations.
pub type HealthResult<T> = Result<T, HealthError>;
