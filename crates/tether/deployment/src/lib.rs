//! # Tether Deployment - weight-ordered manifest application
//!
//! [`ApplyEngine`] turns a unit set into ordered calls on an [`Applier`]:
//! ascending weight to apply, descending weight to remove, submitted order
//! kept among equal weights. By default the first failing unit stops the
//! run; units flagged `allow_failure` and [`ApplyPolicy::abort_on_failure`]
//! relax that.
//!
//! [`KubectlApplier`] is the production applier. [`RecordingApplier`]
//! records calls for tests.

#![deny(unsafe_code)]

pub mod applier;
pub mod engine;
pub mod error;
pub mod kubectl;

pub use applier::{AppliedCall, Applier, ApplierAction, RecordingApplier};
pub use engine::{apply_order, remove_order, ApplyEngine, ApplyPolicy, ApplyReport, UnitFailure};
pub use error::{DeploymentError, DeploymentResult};
pub use kubectl::{ClusterConnection, KubectlApplier};
