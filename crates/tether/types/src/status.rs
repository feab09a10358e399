//! Resource and application status
//!
//! Per-resource states are reduced to one overall state by worst-case
//! precedence: `Missing > Unavailable > Degraded > Ready`.

use crate::{AppId, Informer, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health classification of one resource.
///
/// Variants are declared from best to worst so that `Ord` follows the
/// reduction precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Ready,
    Degraded,
    Unavailable,
    Missing,
}

impl State {
    /// Reduce a set of states to the worst one. An empty set is `Ready`.
    pub fn worst_of<I: IntoIterator<Item = State>>(states: I) -> State {
        states.into_iter().max().unwrap_or(State::Ready)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Ready => write!(f, "ready"),
            State::Degraded => write!(f, "degraded"),
            State::Unavailable => write!(f, "unavailable"),
            State::Missing => write!(f, "missing"),
        }
    }
}

/// Observed state of one informer target
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceState {
    // Field order gives the (kind, name, namespace) sort order.
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub state: State,
}

impl ResourceState {
    pub fn new(informer: &Informer, release_namespace: &str, state: State) -> Self {
        Self {
            kind: informer.kind,
            name: informer.name.clone(),
            namespace: informer.resolve_namespace(release_namespace).to_string(),
            state,
        }
    }
}

/// Aggregated status of one app
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    pub app_id: AppId,

    /// Sorted by (kind, name, namespace)
    pub resource_states: Vec<ResourceState>,

    /// Worst state across `resource_states`
    pub state: State,

    pub updated_at: DateTime<Utc>,
}

impl AppStatus {
    /// Sort the resource states and reduce them to an overall state.
    pub fn from_states(app_id: AppId, mut resource_states: Vec<ResourceState>) -> Self {
        resource_states.sort();
        let state = State::worst_of(resource_states.iter().map(|r| r.state));

        Self {
            app_id,
            resource_states,
            state,
            updated_at: Utc::now(),
        }
    }

    /// Whether two statuses describe the same observation, ignoring time.
    pub fn same_observation(&self, other: &AppStatus) -> bool {
        self.app_id == other.app_id
            && self.state == other.state
            && self.resource_states == other.resource_states
    }
}

impl PartialEq for AppStatus {
    fn eq(&self, other: &Self) -> bool {
        self.same_observation(other)
    }
}

impl Eq for AppStatus {}

#[cfg(test)]
mod tests {
    use super::*;

    fn rs(kind: ResourceKind, name: &str, state: State) -> ResourceState {
        ResourceState {
            kind,
            name: name.to_string(),
            namespace: "default".to_string(),
            state,
        }
    }

    #[test]
    fn test_reduction_precedence() {
        assert_eq!(State::worst_of([State::Ready, State::Degraded]), State::Degraded);
        assert_eq!(State::worst_of([State::Ready, State::Missing]), State::Missing);
        assert_eq!(State::worst_of([State::Ready, State::Ready]), State::Ready);
        assert_eq!(
            State::worst_of([State::Degraded, State::Unavailable]),
            State::Unavailable
        );
        assert_eq!(State::worst_of(Vec::new()), State::Ready);
    }

    #[test]
    fn test_app_status_sorts_resources() {
        let status = AppStatus::from_states(
            AppId::new("app"),
            vec![
                rs(ResourceKind::Service, "b", State::Ready),
                rs(ResourceKind::Deployment, "z", State::Degraded),
                rs(ResourceKind::Deployment, "a", State::Ready),
            ],
        );

        let order: Vec<(&str, ResourceKind)> = status
            .resource_states
            .iter()
            .map(|r| (r.name.as_str(), r.kind))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a", ResourceKind::Deployment),
                ("z", ResourceKind::Deployment),
                ("b", ResourceKind::Service),
            ]
        );
        assert_eq!(status.state, State::Degraded);
    }

    #[test]
    fn test_resources_sort_by_kind_name() {
        let status = AppStatus::from_states(
            AppId::new("app"),
            vec![
                rs(ResourceKind::StatefulSet, "db", State::Ready),
                rs(ResourceKind::Service, "web", State::Ready),
                rs(ResourceKind::PersistentVolumeClaim, "data", State::Ready),
                rs(ResourceKind::Deployment, "web", State::Ready),
                rs(ResourceKind::DaemonSet, "agent", State::Ready),
            ],
        );

        let kinds: Vec<&str> = status
            .resource_states
            .iter()
            .map(|r| r.kind.as_str())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "daemonset",
                "deployment",
                "persistentvolumeclaim",
                "service",
                "statefulset",
            ]
        );
    }

    #[test]
    fn test_equality_ignores_timestamp() {
        let a = AppStatus::from_states(
            AppId::new("app"),
            vec![rs(ResourceKind::Deployment, "a", State::Ready)],
        );
        let mut b = a.clone();
        b.updated_at = a.updated_at + chrono::Duration::seconds(30);
        assert_eq!(a, b);
    }
}
