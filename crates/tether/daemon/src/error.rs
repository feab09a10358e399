//! Error types for tether-daemon

use tether_channel::ChannelError;
use tether_deployment::DeploymentError;
use tether_task::TaskError;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cluster client could not be built
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Control-plane channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Upstream REST error
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Applier setup error
    #[error("Deployment error: {0}")]
    Deployment(#[from] DeploymentError),

    /// Task store error
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the upstream REST collaborator
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Endpoint could not be joined with a path
    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request failed before a response arrived
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Non-success status
    #[error("Upstream returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Result type for upstream calls
pub type UpstreamResult<T> = Result<T, UpstreamError>;
