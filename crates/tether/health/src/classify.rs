//! Per-kind health rules.

use tether_types::State;

/// Facts read from one live object, reduced to what classification needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedObject {
    /// A scalable workload. For daemon sets `desired` is the number of
    /// nodes that should run the pod.
    Workload {
        desired: i32,
        ready: i32,
        available: i32,
    },
    Service {
        load_balancer: bool,
        ingress_points: usize,
    },
    Ingress {
        ingress_points: usize,
    },
    Claim {
        phase: Option<String>,
    },
}

/// Classify an object that exists.
pub fn classify(object: &ObservedObject) -> State {
    match object {
        ObservedObject::Workload {
            desired,
            ready,
            available,
        } => {
            if *desired == 0 || available >= desired {
                State::Ready
            } else if *ready == 0 {
                State::Unavailable
            } else {
                State::Degraded
            }
        }
        ObservedObject::Service {
            load_balancer: false,
            ..
        } => State::Ready,
        ObservedObject::Service { ingress_points, .. }
        | ObservedObject::Ingress { ingress_points } => {
            if *ingress_points > 0 {
                State::Ready
            } else {
                State::Unavailable
            }
        }
        ObservedObject::Claim { phase } => match phase.as_deref() {
            Some("Bound") => State::Ready,
            Some("Lost") => State::Unavailable,
            _ => State::Degraded,
        },
    }
}
