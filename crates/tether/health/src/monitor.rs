//! Informer polling and aggregation for one app.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tether_types::{AppId, AppStatus, Informer, ResourceState, State};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classify::classify;
use crate::debounce::{StatusDebouncer, StatusSink};
use crate::reader::ClusterReader;

/// Timing of the poll cycle and the push debounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub debounce_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            debounce_window: Duration::from_secs(2),
        }
    }
}

/// Polls the informers of one app and pushes the aggregated status through
/// a [`StatusDebouncer`].
pub struct StateMonitor {
    app_id: AppId,
    release_namespace: String,
    informers: Vec<Informer>,
    reader: Arc<dyn ClusterReader>,
    debouncer: StatusDebouncer,
    config: MonitorConfig,
    last: Mutex<Option<AppStatus>>,
}

impl StateMonitor {
    pub fn new(
        app_id: AppId,
        release_namespace: impl Into<String>,
        informers: Vec<Informer>,
        reader: Arc<dyn ClusterReader>,
        sink: Arc<dyn StatusSink>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            app_id,
            release_namespace: release_namespace.into(),
            informers,
            reader,
            debouncer: StatusDebouncer::new(config.debounce_window, sink),
            config,
            last: Mutex::new(None),
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub fn informers(&self) -> &[Informer] {
        &self.informers
    }

    /// Read every informer concurrently and reduce to one status.
    ///
    /// A missing object counts as `Missing`; a failed read degrades only its
    /// own informer to `Unavailable`.
    pub async fn observe(&self) -> AppStatus {
        let reads = self.informers.iter().map(|informer| async move {
            let namespace = informer.resolve_namespace(&self.release_namespace);
            let state = match self
                .reader
                .read(informer.kind, namespace, &informer.name)
                .await
            {
                Ok(Some(object)) => classify(&object),
                Ok(None) => State::Missing,
                Err(e) => {
                    warn!(
                        app_id = %self.app_id,
                        informer = %informer,
                        error = %e,
                        "Informer read failed"
                    );
                    State::Unavailable
                }
            };
            ResourceState::new(informer, &self.release_namespace, state)
        });

        let states = join_all(reads).await;
        AppStatus::from_states(self.app_id.clone(), states)
    }

    /// Run one poll cycle. Returns whether the aggregate changed and was
    /// offered for push.
    #[instrument(skip(self), fields(app_id = %self.app_id))]
    pub async fn poll_once(&self) -> bool {
        let status = self.observe().await;

        let mut last = self.last.lock().await;
        if last.as_ref().is_some_and(|l| l.same_observation(&status)) {
            return false;
        }

        debug!(state = %status.state, resources = status.resource_states.len(), "Status changed");
        *last = Some(status.clone());
        drop(last);

        self.debouncer.offer(status).await;
        true
    }

    /// Most recent aggregate, changed or not.
    pub async fn last_status(&self) -> Option<AppStatus> {
        self.last.lock().await.clone()
    }

    /// Poll on the configured interval until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                app_id = %self.app_id,
                informers = self.informers.len(),
                interval_ms = self.config.poll_interval.as_millis() as u64,
                "State monitor started"
            );

            let mut interval = tokio::time::interval(self.config.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.poll_once().await;
                    }
                }
            }

            self.debouncer.cancel().await;
            info!(app_id = %self.app_id, "State monitor stopped");
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ObservedObject;
    use crate::debounce::RecordingStatusSink;
    use crate::error::{HealthError, HealthResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use tether_types::ResourceKind;

    type Entry = Result<Option<ObservedObject>, String>;

    #[derive(Default)]
    struct FakeReader {
        objects: StdMutex<HashMap<(ResourceKind, String, String), Entry>>,
    }

    impl FakeReader {
        fn set(&self, kind: ResourceKind, namespace: &str, name: &str, entry: Entry) {
            self.objects
                .lock()
                .unwrap()
                .insert((kind, namespace.to_string(), name.to_string()), entry);
        }
    }

    #[async_trait]
    impl ClusterReader for FakeReader {
        async fn read(
            &self,
            kind: ResourceKind,
            namespace: &str,
            name: &str,
        ) -> HealthResult<Option<ObservedObject>> {
            let entry = self
                .objects
                .lock()
                .unwrap()
                .get(&(kind, namespace.to_string(), name.to_string()))
                .cloned()
                .unwrap_or(Ok(None));
            entry.map_err(|reason| HealthError::ReadFailed {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                reason,
            })
        }
    }

    fn ready_workload() -> Entry {
        Ok(Some(ObservedObject::Workload {
            desired: 2,
            ready: 2,
            available: 2,
        }))
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(5),
            debounce_window: Duration::from_secs(1),
        }
    }

    fn monitor(reader: Arc<FakeReader>, sink: Arc<RecordingStatusSink>) -> StateMonitor {
        StateMonitor::new(
            AppId::new("shop"),
            "prod",
            vec![
                Informer::new(ResourceKind::Deployment, "web"),
                Informer::new(ResourceKind::Service, "web"),
                Informer::new(ResourceKind::PersistentVolumeClaim, "data").in_namespace("storage"),
            ],
            reader,
            sink,
            config(),
        )
    }

    #[tokio::test]
    async fn test_observe_aggregates_sorted_states() {
        let reader = Arc::new(FakeReader::default());
        reader.set(ResourceKind::Deployment, "prod", "web", ready_workload());
        reader.set(
            ResourceKind::Service,
            "prod",
            "web",
            Ok(Some(ObservedObject::Service {
                load_balancer: false,
                ingress_points: 0,
            })),
        );
        reader.set(
            ResourceKind::PersistentVolumeClaim,
            "storage",
            "data",
            Ok(Some(ObservedObject::Claim {
                phase: Some("Bound".into()),
            })),
        );

        let monitor = monitor(reader, Arc::new(RecordingStatusSink::new()));
        let status = monitor.observe().await;

        assert_eq!(status.state, State::Ready);
        let kinds: Vec<ResourceKind> = status.resource_states.iter().map(|r| r.kind).collect();
        let mut sorted = kinds.clone();
        sorted.sort();
        assert_eq!(kinds, sorted);

        let claim = status
            .resource_states
            .iter()
            .find(|r| r.kind == ResourceKind::PersistentVolumeClaim)
            .unwrap();
        assert_eq!(claim.namespace, "storage");
    }

    #[tokio::test]
    async fn test_read_failure_degrades_only_that_informer() {
        let reader = Arc::new(FakeReader::default());
        reader.set(ResourceKind::Deployment, "prod", "web", ready_workload());
        reader.set(
            ResourceKind::Service,
            "prod",
            "web",
            Err("connection refused".into()),
        );
        reader.set(
            ResourceKind::PersistentVolumeClaim,
            "storage",
            "data",
            Ok(Some(ObservedObject::Claim {
                phase: Some("Bound".into()),
            })),
        );

        let monitor = monitor(reader, Arc::new(RecordingStatusSink::new()));
        let status = monitor.observe().await;

        let by_kind = |kind| {
            status
                .resource_states
                .iter()
                .find(|r| r.kind == kind)
                .map(|r| r.state)
                .unwrap()
        };
        assert_eq!(by_kind(ResourceKind::Deployment), State::Ready);
        assert_eq!(by_kind(ResourceKind::Service), State::Unavailable);
        assert_eq!(by_kind(ResourceKind::PersistentVolumeClaim), State::Ready);
        assert_eq!(status.state, State::Unavailable);
    }

    #[tokio::test]
    async fn test_absent_object_is_missing() {
        let reader = Arc::new(FakeReader::default());
        reader.set(ResourceKind::Deployment, "prod", "web", ready_workload());

        let monitor = monitor(reader, Arc::new(RecordingStatusSink::new()));
        let status = monitor.observe().await;

        assert_eq!(status.state, State::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_aggregate_not_reoffered() {
        let reader = Arc::new(FakeReader::default());
        reader.set(ResourceKind::Deployment, "prod", "web", ready_workload());
        let sink = Arc::new(RecordingStatusSink::new());
        let monitor = monitor(reader.clone(), sink.clone());

        assert!(monitor.poll_once().await);
        assert!(!monitor.poll_once().await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.statuses().len(), 1);

        reader.set(
            ResourceKind::Service,
            "prod",
            "web",
            Ok(Some(ObservedObject::Service {
                load_balancer: false,
                ingress_points: 0,
            })),
        );
        assert!(monitor.poll_once().await);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.statuses().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_stops_on_cancel() {
        let reader = Arc::new(FakeReader::default());
        reader.set(ResourceKind::Deployment, "prod", "web", ready_workload());
        let sink = Arc::new(RecordingStatusSink::new());
        let monitor = Arc::new(monitor(reader, sink.clone()));

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&monitor).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(sink.statuses().len(), 1);
        assert_eq!(monitor.last_status().await.unwrap().state, State::Missing);

        cancel.cancel();
        handle.await.unwrap();
    }
}
