//! # Tether Health - informer polling and status aggregation
//!
//! A [`StateMonitor`] reads the objects named by an app's informers through a
//! [`ClusterReader`], classifies each with per-kind rules and reduces them to
//! one [`AppStatus`](tether_types::AppStatus) by worst-case precedence.
//! Changed aggregates pass through a [`StatusDebouncer`] so that at most one
//! push per window reaches the [`StatusSink`].

#![deny(unsafe_code)]

pub mod classify;
pub mod debounce;
pub mod error;
pub mod monitor;
pub mod reader;

pub use classify::{classify, ObservedObject};
pub use debounce::{RecordingStatusSink, StatusDebouncer, StatusSink};
pub use error::{HealthError, HealthResult};
pub use monitor::{MonitorConfig, StateMonitor};
pub use reader::{ClusterReader, KubeClusterReader};
