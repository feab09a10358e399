//! Deployment error types

use thiserror::Error;

/// Deployment errors
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("{tool} failed ({exit}): {stderr}")]
    Tool {
        tool: String,
        exit: String,
        stderr: String,
    },

    #[error("{tool} did not finish within {timeout_secs}s")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Cluster configuration error: {0}")]
    ClusterConfig(String),

    #[error("Applier rejected manifest: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for deployment operations
pub type DeploymentResult<T> = std::result::Result<T, DeploymentError>;
