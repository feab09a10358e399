//! Cluster-read capability.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::Client;
use tether_types::ResourceKind;
use tracing::trace;

use crate::classify::ObservedObject;
use crate::error::{HealthError, HealthResult};

/// Reads live objects for classification.
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Observe one object; `Ok(None)` when it does not exist.
    async fn read(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> HealthResult<Option<ObservedObject>>;
}

/// Reader backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn read(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> HealthResult<Option<ObservedObject>> {
        trace!(%kind, namespace, name, "Reading object");
        let failed = |e: kube::Error| HealthError::ReadFailed {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        };
        let client = self.client.clone();

        let observed = match kind {
            ResourceKind::Deployment => Api::<Deployment>::namespaced(client, namespace)
                .get_opt(name)
                .await
                .map_err(failed)?
                .map(|o| observe_deployment(&o)),
            ResourceKind::StatefulSet => Api::<StatefulSet>::namespaced(client, namespace)
                .get_opt(name)
                .await
                .map_err(failed)?
                .map(|o| observe_stateful_set(&o)),
            ResourceKind::ReplicaSet => Api::<ReplicaSet>::namespaced(client, namespace)
                .get_opt(name)
                .await
                .map_err(failed)?
                .map(|o| observe_replica_set(&o)),
            ResourceKind::DaemonSet => Api::<DaemonSet>::namespaced(client, namespace)
                .get_opt(name)
                .await
                .map_err(failed)?
                .map(|o| observe_daemon_set(&o)),
            ResourceKind::Service => Api::<Service>::namespaced(client, namespace)
                .get_opt(name)
                .await
                .map_err(failed)?
                .map(|o| observe_service(&o)),
            ResourceKind::Ingress => Api::<Ingress>::namespaced(client, namespace)
                .get_opt(name)
                .await
                .map_err(failed)?
                .map(|o| observe_ingress(&o)),
            ResourceKind::PersistentVolumeClaim => {
                Api::<PersistentVolumeClaim>::namespaced(client, namespace)
                    .get_opt(name)
                    .await
                    .map_err(failed)?
                    .map(|o| observe_claim(&o))
            }
        };

        Ok(observed)
    }
}

// A missing replica count means the API default of one.
fn workload(desired: Option<i32>, ready: Option<i32>, available: Option<i32>) -> ObservedObject {
    ObservedObject::Workload {
        desired: desired.unwrap_or(1),
        ready: ready.unwrap_or(0),
        available: available.unwrap_or(0),
    }
}

pub fn observe_deployment(object: &Deployment) -> ObservedObject {
    let status = object.status.as_ref();
    workload(
        object.spec.as_ref().and_then(|s| s.replicas),
        status.and_then(|s| s.ready_replicas),
        status.and_then(|s| s.available_replicas),
    )
}

pub fn observe_stateful_set(object: &StatefulSet) -> ObservedObject {
    let status = object.status.as_ref();
    workload(
        object.spec.as_ref().and_then(|s| s.replicas),
        status.and_then(|s| s.ready_replicas),
        status.and_then(|s| s.available_replicas),
    )
}

pub fn observe_replica_set(object: &ReplicaSet) -> ObservedObject {
    let status = object.status.as_ref();
    workload(
        object.spec.as_ref().and_then(|s| s.replicas),
        status.and_then(|s| s.ready_replicas),
        status.and_then(|s| s.available_replicas),
    )
}

pub fn observe_daemon_set(object: &DaemonSet) -> ObservedObject {
    match object.status.as_ref() {
        Some(status) => ObservedObject::Workload {
            desired: status.desired_number_scheduled,
            ready: status.number_ready,
            available: status.number_available.unwrap_or(0),
        },
        // Not yet seen by the controller.
        None => ObservedObject::Workload {
            desired: 1,
            ready: 0,
            available: 0,
        },
    }
}

pub fn observe_service(object: &Service) -> ObservedObject {
    let load_balancer = object
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .map(|t| t == "LoadBalancer")
        .unwrap_or(false);
    let ingress_points = object
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(Vec::len)
        .unwrap_or(0);

    ObservedObject::Service {
        load_balancer,
        ingress_points,
    }
}

pub fn observe_ingress(object: &Ingress) -> ObservedObject {
    let ingress_points = object
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(Vec::len)
        .unwrap_or(0);

    ObservedObject::Ingress { ingress_points }
}

pub fn observe_claim(object: &PersistentVolumeClaim) -> ObservedObject {
    ObservedObject::Claim {
        phase: object.status.as_ref().and_then(|s| s.phase.clone()),
    }
}
