//! REST client for the control plane's deploy API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_release::{ReleaseCandidate, VersionSequencer};
use tether_types::{AppId, DesiredState, Generation};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{UpstreamError, UpstreamResult};

const DESIRED_PATH: &str = "api/v1/deploy/desired";
const CURRENT_PATH: &str = "api/v1/deploy/current";

/// One release the control plane offers for an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferedRelease {
    /// Ingestion sequence
    pub sequence: u64,

    /// Published version label
    #[serde(default)]
    pub version: Option<String>,

    pub desired: DesiredState,
}

/// Body of `GET /api/v1/deploy/desired`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredStateResponse {
    /// Offered releases in ingestion order
    #[serde(default)]
    pub releases: Vec<OfferedRelease>,
}

impl DesiredStateResponse {
    /// Pick one desired state per app.
    ///
    /// Releases are grouped by app in order of first appearance; within a
    /// group the sequencer selects the release to deploy.
    pub fn resolve(&self, sequencer: &VersionSequencer) -> Vec<DesiredState> {
        let mut groups: Vec<(&AppId, Vec<&OfferedRelease>)> = Vec::new();
        for release in &self.releases {
            match groups
                .iter_mut()
                .find(|(app_id, _)| **app_id == release.desired.app_id)
            {
                Some((_, group)) => group.push(release),
                None => groups.push((&release.desired.app_id, vec![release])),
            }
        }

        groups
            .into_iter()
            .filter_map(|(app_id, group)| {
                let candidates: Vec<ReleaseCandidate> = group
                    .iter()
                    .map(|r| ReleaseCandidate::new(r.sequence, r.version.as_deref()))
                    .collect();
                let Some(chosen) = sequencer.select_desired(&candidates) else {
                    warn!(%app_id, offered = group.len(), "No selectable release");
                    return None;
                };
                group
                    .into_iter()
                    .find(|r| r.sequence == chosen.sequence)
                    .map(|r| {
                        let mut desired = r.desired.clone();
                        desired.sequence.get_or_insert(r.sequence);
                        desired
                    })
            })
            .collect()
    }
}

/// Release metadata of one installed app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledRelease {
    pub app_id: AppId,
    pub namespace: String,
    #[serde(default)]
    pub sequence: Option<u64>,
    pub generation: Generation,
    /// `namespace/identity` of every applied unit
    pub units: Vec<String>,
    pub installed_at: DateTime<Utc>,
}

/// Body of `POST /api/v1/deploy/current`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentState {
    pub releases: Vec<InstalledRelease>,
    pub reported_at: DateTime<Utc>,
}

/// Deploy API client. Authenticates with HTTP Basic, the shared token as
/// the user name and an empty password.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base: Url,
    token: String,
}

impl UpstreamClient {
    pub fn new(endpoint: &str, token: &str, timeout: Duration) -> UpstreamResult<Self> {
        let mut base = Url::parse(endpoint)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base,
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Fetch every release currently offered.
    #[instrument(skip(self))]
    pub async fn get_desired_state(&self) -> UpstreamResult<DesiredStateResponse> {
        let url = self.base.join(DESIRED_PATH)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.token, None::<&str>)
            .send()
            .await?;

        let response = check_status(response).await?;
        let body: DesiredStateResponse = response.json().await?;
        debug!(releases = body.releases.len(), "Fetched desired state");
        Ok(body)
    }

    /// Report the installed releases.
    #[instrument(skip(self, current), fields(releases = current.releases.len()))]
    pub async fn post_current_state(&self, current: &CurrentState) -> UpstreamResult<()> {
        let url = self.base.join(CURRENT_PATH)?;
        let response = self
            .http
            .post(url)
            .basic_auth(&self.token, None::<&str>)
            .json(current)
            .send()
            .await?;

        check_status(response).await?;
        debug!("Posted current state");
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> UpstreamResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body: if body.is_empty() {
            status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string()
        } else {
            body
        },
    })
}
