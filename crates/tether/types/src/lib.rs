//! Tether Types - Core types for the in-cluster delivery agent
//!
//! Tether runs inside a customer cluster and keeps it in step with a remote
//! management service: desired state arrives over a long-lived channel, is
//! applied in weight order, and the health of what was applied flows back
//! upstream.
//!
//! ## Key Concepts
//!
//! - **DeployableUnit**: One manifest with an ordering weight
//! - **DesiredState**: Everything an app should look like for one generation
//! - **Generation**: Arrival-ordered version of desired state
//! - **Informer**: Reference to one cluster object whose health is polled
//! - **AppStatus**: Sorted per-resource states plus a reduced overall state
//! - **Events**: Names and payloads exchanged with the control plane

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod ids;
pub mod informer;
pub mod status;
pub mod unit;

// Re-export main types
pub use events::{
    AppInformersRequest, DeployOutcome, DeployResult, UndeployRequest, EVENT_APP_INFORMERS,
    EVENT_APP_STATUS, EVENT_DEPLOY, EVENT_DEPLOY_RESULT, EVENT_UNDEPLOY,
};
pub use ids::{AppId, Generation};
pub use informer::{Informer, InformerParseError, ResourceKind};
pub use status::{AppStatus, ResourceState, State};
pub use unit::{DeployableUnit, DesiredState, UnitFlags, UnitKey};
