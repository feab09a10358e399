//! Informers: references to cluster objects whose health is polled

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kinds of object the state monitor knows how to classify
///
/// Kinds order by their wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Deployment,
    StatefulSet,
    ReplicaSet,
    DaemonSet,
    Service,
    Ingress,
    PersistentVolumeClaim,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deployment",
            ResourceKind::StatefulSet => "statefulset",
            ResourceKind::ReplicaSet => "replicaset",
            ResourceKind::DaemonSet => "daemonset",
            ResourceKind::Service => "service",
            ResourceKind::Ingress => "ingress",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaim",
        }
    }
}

impl Ord for ResourceKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialOrd for ResourceKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = InformerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Ok(ResourceKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Ok(ResourceKind::StatefulSet),
            "replicaset" | "replicasets" | "rs" => Ok(ResourceKind::ReplicaSet),
            "daemonset" | "daemonsets" | "ds" => Ok(ResourceKind::DaemonSet),
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            "ingress" | "ingresses" | "ing" => Ok(ResourceKind::Ingress),
            "persistentvolumeclaim" | "persistentvolumeclaims" | "pvc" => {
                Ok(ResourceKind::PersistentVolumeClaim)
            }
            other => Err(InformerParseError::UnsupportedKind(other.to_string())),
        }
    }
}

/// Errors from parsing an informer reference
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InformerParseError {
    #[error("unsupported resource kind: {0}")]
    UnsupportedKind(String),

    #[error("malformed informer reference '{0}', expected [namespace/]kind/name")]
    Malformed(String),
}

/// One object to poll
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Informer {
    pub kind: ResourceKind,
    pub name: String,

    /// Falls back to the release namespace when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Informer {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Namespace to read from, given the release namespace.
    pub fn resolve_namespace<'a>(&'a self, release_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(release_namespace)
    }
}

impl FromStr for Informer {
    type Err = InformerParseError;

    /// Parses `kind/name` or `namespace/kind/name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(InformerParseError::Malformed(s.to_string()));
        }

        match parts.as_slice() {
            [kind, name] => Ok(Informer::new(kind.parse()?, *name)),
            [namespace, kind, name] => {
                Ok(Informer::new(kind.parse()?, *name).in_namespace(*namespace))
            }
            _ => Err(InformerParseError::Malformed(s.to_string())),
        }
    }
}

impl fmt::Display for Informer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}
