//! Event names and payloads exchanged with the control plane
//!
//! Inbound: [`EVENT_DEPLOY`] carries a [`DesiredState`](crate::DesiredState),
//! [`EVENT_UNDEPLOY`] an [`UndeployRequest`], [`EVENT_APP_INFORMERS`] an
//! [`AppInformersRequest`].
//!
//! Outbound: [`EVENT_APP_STATUS`] carries an [`AppStatus`](crate::AppStatus),
//! [`EVENT_DEPLOY_RESULT`] a [`DeployResult`].

use crate::{AppId, DeployableUnit, Generation, Informer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENT_DEPLOY: &str = "deploy";
pub const EVENT_UNDEPLOY: &str = "undeploy";
pub const EVENT_APP_INFORMERS: &str = "appInformers";
pub const EVENT_APP_STATUS: &str = "appStatus";
pub const EVENT_DEPLOY_RESULT: &str = "deployResult";

/// Request to remove every unit of an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndeployRequest {
    pub app_id: AppId,
    pub namespace: String,
    #[serde(default)]
    pub units: Vec<DeployableUnit>,
}

/// Replacement informer set for one app.
///
/// Informers travel as `[namespace/]kind/name` strings; entries that fail to
/// parse are skipped by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInformersRequest {
    pub app_id: AppId,
    pub namespace: String,
    #[serde(default)]
    pub informers: Vec<String>,
}

impl AppInformersRequest {
    /// Parse the informer strings, returning the valid ones and the rejects.
    pub fn parse_informers(&self) -> (Vec<Informer>, Vec<(String, String)>) {
        let mut valid = Vec::with_capacity(self.informers.len());
        let mut rejected = Vec::new();

        for raw in &self.informers {
            match raw.parse::<Informer>() {
                Ok(informer) => valid.push(informer),
                Err(e) => rejected.push((raw.clone(), e.to_string())),
            }
        }

        (valid, rejected)
    }
}

/// Outcome of one generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeployOutcome {
    /// Every unit applied
    Succeeded,

    /// A unit failed; later units were not applied
    Failed {
        unit: String,
        diagnostics: String,
    },

    /// A newer generation arrived before this one finished
    Superseded,
}

/// Report of one generation, sent upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub app_id: AppId,
    pub generation: Generation,
    #[serde(default)]
    pub sequence: Option<u64>,
    pub outcome: DeployOutcome,
    pub applied: Vec<String>,
    pub removed: Vec<String>,
    /// Failures of units flagged `allow_failure`
    #[serde(default)]
    pub tolerated_failures: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

impl DeployResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DeployOutcome::Succeeded)
    }
}
