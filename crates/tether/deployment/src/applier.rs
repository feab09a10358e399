//! Applier capability and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DeploymentError, DeploymentResult};

/// Materializes manifests in a namespace.
///
/// Calls are made one at a time; implementations need not guard against
/// concurrent use.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Create or update the objects of `manifest`.
    async fn apply(&self, namespace: &str, manifest: &str) -> DeploymentResult<()>;

    /// Delete the objects of `manifest`. Absent objects are not an error.
    async fn remove(&self, namespace: &str, manifest: &str) -> DeploymentResult<()>;

    /// Name for logging
    fn name(&self) -> &str;
}

/// Which side of the contract a call used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplierAction {
    Apply,
    Remove,
}

/// One recorded applier call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCall {
    pub action: ApplierAction,
    pub namespace: String,
    pub manifest: String,
}

/// Applier that records calls instead of touching a cluster.
///
/// Calls for manifests registered with [`fail_manifest`](Self::fail_manifest)
/// fail with the given diagnostics. An optional delay makes each call take
/// time so overlap can be observed.
#[derive(Debug, Default)]
pub struct RecordingApplier {
    calls: Mutex<Vec<AppliedCall>>,
    failures: Mutex<HashMap<String, String>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Make every call for `manifest` fail.
    pub fn fail_manifest(&self, manifest: &str, diagnostics: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(manifest.to_string(), diagnostics.to_string());
        }
    }

    pub fn calls(&self) -> Vec<AppliedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Manifests passed to `action`, in call order.
    pub fn manifests(&self, action: ApplierAction) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.action == action)
            .map(|call| call.manifest)
            .collect()
    }

    /// Highest number of calls that were ever running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn record(
        &self,
        action: ApplierAction,
        namespace: &str,
        manifest: &str,
    ) -> DeploymentResult<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(AppliedCall {
                action,
                namespace: namespace.to_string(),
                manifest: manifest.to_string(),
            });
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failure = self
            .failures
            .lock()
            .ok()
            .and_then(|failures| failures.get(manifest).cloned());
        match failure {
            Some(diagnostics) => Err(DeploymentError::Rejected(diagnostics)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Applier for RecordingApplier {
    async fn apply(&self, namespace: &str, manifest: &str) -> DeploymentResult<()> {
        self.record(ApplierAction::Apply, namespace, manifest).await
    }

    async fn remove(&self, namespace: &str, manifest: &str) -> DeploymentResult<()> {
        self.record(ApplierAction::Remove, namespace, manifest).await
    }

    fn name(&self) -> &str {
        "recording"
    }
}
