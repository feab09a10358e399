//! Tether daemon library
//!
//! Components of the in-cluster agent:
//! - Configuration loading
//! - Upstream REST client for desired and current state
//! - Reconciler: per-app generations, apply/remove runs, state monitors
//! - Control loop: session lifecycle and reconnect backoff

pub mod backoff;
pub mod config;
pub mod control_loop;
pub mod error;
pub mod outbox;
pub mod reconciler;
pub mod upstream;

pub use backoff::Backoff;
pub use config::AgentConfig;
pub use control_loop::{build_router, Collaborators, ControlLoop};
pub use error::{DaemonError, DaemonResult, UpstreamError, UpstreamResult};
pub use outbox::{ChannelStatusSink, Outbox};
pub use reconciler::{task_id, Command, Reconciler};
pub use upstream::{
    CurrentState, DesiredStateResponse, InstalledRelease, OfferedRelease, UpstreamClient,
};
