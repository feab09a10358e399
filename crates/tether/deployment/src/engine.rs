//! Weight-ordered apply and remove.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_types::DeployableUnit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::applier::{Applier, ApplierAction};

/// Engine-wide failure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPolicy {
    /// Stop at the first failing unit that does not allow failure.
    #[serde(default = "default_abort")]
    pub abort_on_failure: bool,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        Self {
            abort_on_failure: default_abort(),
        }
    }
}

fn default_abort() -> bool {
    true
}

/// A unit the applier failed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// `namespace/identity` of the unit
    pub unit: String,
    /// Diagnostic text from the applier
    pub diagnostics: String,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit, self.diagnostics)
    }
}

/// What happened to each unit of one ordered run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Units the applier accepted, in call order
    pub completed: Vec<String>,

    /// Failures that count against the run
    pub failures: Vec<UnitFailure>,

    /// Failures of units flagged `allow_failure`
    pub tolerated: Vec<UnitFailure>,

    /// Units never attempted because the run stopped early
    pub skipped: Vec<String>,

    /// The run stopped because its cancellation token fired
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    pub fn first_failure(&self) -> Option<&UnitFailure> {
        self.failures.first()
    }
}

/// Units in apply order: ascending weight, stable on ties.
pub fn apply_order(units: &[DeployableUnit]) -> Vec<&DeployableUnit> {
    let mut ordered: Vec<&DeployableUnit> = units.iter().collect();
    ordered.sort_by_key(|unit| unit.weight);
    ordered
}

/// Units in remove order: descending weight, stable on ties.
pub fn remove_order(units: &[DeployableUnit]) -> Vec<&DeployableUnit> {
    let mut ordered: Vec<&DeployableUnit> = units.iter().collect();
    ordered.sort_by(|a, b| b.weight.cmp(&a.weight));
    ordered
}

/// Applies and removes unit sets through an [`Applier`].
#[derive(Clone)]
pub struct ApplyEngine {
    applier: Arc<dyn Applier>,
    policy: ApplyPolicy,
}

impl ApplyEngine {
    pub fn new(applier: Arc<dyn Applier>) -> Self {
        Self::with_policy(applier, ApplyPolicy::default())
    }

    pub fn with_policy(applier: Arc<dyn Applier>, policy: ApplyPolicy) -> Self {
        Self { applier, policy }
    }

    pub fn policy(&self) -> &ApplyPolicy {
        &self.policy
    }

    /// Apply `units` in ascending weight order.
    ///
    /// `cancel` is checked between units; a call in progress always
    /// completes.
    #[instrument(skip_all, fields(units = units.len(), applier = self.applier.name()))]
    pub async fn apply(&self, units: &[DeployableUnit], cancel: &CancellationToken) -> ApplyReport {
        self.run(ApplierAction::Apply, apply_order(units), cancel).await
    }

    /// Remove `units` in descending weight order.
    #[instrument(skip_all, fields(units = units.len(), applier = self.applier.name()))]
    pub async fn remove(&self, units: &[DeployableUnit], cancel: &CancellationToken) -> ApplyReport {
        self.run(ApplierAction::Remove, remove_order(units), cancel).await
    }

    async fn run(
        &self,
        action: ApplierAction,
        ordered: Vec<&DeployableUnit>,
        cancel: &CancellationToken,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        let mut remaining = ordered.into_iter();

        while let Some(unit) = remaining.next() {
            let key = unit.key().to_string();

            if cancel.is_cancelled() {
                info!(unit = %key, ?action, "Run cancelled before unit");
                report.cancelled = true;
                report.skipped.push(key);
                report
                    .skipped
                    .extend(remaining.by_ref().map(|u| u.key().to_string()));
                break;
            }

            debug!(unit = %key, weight = unit.weight, ?action, "Processing unit");
            let result = match action {
                ApplierAction::Apply => self.applier.apply(&unit.namespace, &unit.manifest).await,
                ApplierAction::Remove => self.applier.remove(&unit.namespace, &unit.manifest).await,
            };

            let error = match result {
                Ok(()) => {
                    report.completed.push(key);
                    continue;
                }
                Err(e) => e,
            };

            let failure = UnitFailure {
                unit: key,
                diagnostics: error.to_string(),
            };

            if unit.flags.allow_failure {
                warn!(unit = %failure.unit, error = %failure.diagnostics, ?action, "Unit failed, failure allowed");
                report.tolerated.push(failure);
                continue;
            }

            warn!(unit = %failure.unit, error = %failure.diagnostics, ?action, "Unit failed");
            report.failures.push(failure);

            if self.policy.abort_on_failure {
                report
                    .skipped
                    .extend(remaining.by_ref().map(|u| u.key().to_string()));
                break;
            }
        }

        info!(
            ?action,
            completed = report.completed.len(),
            failed = report.failures.len(),
            tolerated = report.tolerated.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "Run finished"
        );

        report
    }
}
