//! Deployable units and desired state
//!
//! A [`DesiredState`] is what the control plane wants one app to look like.
//! It is a list of [`DeployableUnit`]s, each a manifest with an integer
//! weight: lower weights are applied first and removed last.

use crate::AppId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Per-unit behaviour flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UnitFlags {
    /// Never remove this unit, neither as an orphan nor on undeploy
    pub keep_on_remove: bool,

    /// A failure of this unit is reported but does not abort the generation
    pub allow_failure: bool,
}

/// One manifest with its ordering metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployableUnit {
    /// Stable identity of the unit within its app
    pub identity: String,

    /// Target namespace
    pub namespace: String,

    /// Ordering key; ties keep their submitted order
    #[serde(default)]
    pub weight: i64,

    /// Manifest body (one or more YAML documents)
    pub manifest: String,

    /// Behaviour flags
    #[serde(default)]
    pub flags: UnitFlags,
}

impl DeployableUnit {
    pub fn new(
        identity: impl Into<String>,
        namespace: impl Into<String>,
        weight: i64,
        manifest: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            namespace: namespace.into(),
            weight,
            manifest: manifest.into(),
            flags: UnitFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: UnitFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Key used to match a unit across generations.
    pub fn key(&self) -> UnitKey {
        UnitKey {
            namespace: self.namespace.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// Identity of a unit across generations
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub namespace: String,
    pub identity: String,
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.identity)
    }
}

/// Desired state of one app as pushed by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    /// App this state belongs to
    pub app_id: AppId,

    /// Release namespace; informers default to it
    pub namespace: String,

    /// Upstream release sequence this state was rendered from
    #[serde(default)]
    pub sequence: Option<u64>,

    /// Units to apply, in submitted order
    #[serde(default)]
    pub units: Vec<DeployableUnit>,

    /// Units of the previously deployed release, used to find orphans
    #[serde(default)]
    pub previous_units: Vec<DeployableUnit>,
}

impl DesiredState {
    pub fn new(app_id: AppId, namespace: impl Into<String>) -> Self {
        Self {
            app_id,
            namespace: namespace.into(),
            sequence: None,
            units: Vec::new(),
            previous_units: Vec::new(),
        }
    }

    /// Units of the previous release that are no longer wanted.
    ///
    /// A unit is an orphan when its key is absent from the current set and
    /// it is not flagged `keep_on_remove`. Submitted order is preserved.
    pub fn orphaned_units(&self) -> Vec<DeployableUnit> {
        let current: HashSet<UnitKey> = self.units.iter().map(DeployableUnit::key).collect();

        self.previous_units
            .iter()
            .filter(|unit| !unit.flags.keep_on_remove)
            .filter(|unit| !current.contains(&unit.key()))
            .cloned()
            .collect()
    }
}
