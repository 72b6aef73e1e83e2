//! Correlation of spawned jobs and pods with the resources that own them
//!
//! The job-observer and pod-observer controllers feed every change of a
//! managed child workload into the shared [`ObserverRegistry`]. Parent
//! handlers query it for the state of their children, and parent controllers
//! subscribe to it to reconcile as soon as a child changes.

mod observers;
mod registry;

pub use observers::{JobObserver, PodObserver};
pub use registry::ObserverRegistry;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::ObjectKey;

/// Label marking workloads created by the operator
pub const LABEL_MANAGED: &str = "k8upjob";

/// Selector for workloads created by the operator
pub const MANAGED_SELECTOR: &str = "k8upjob=true";

/// Label carrying the kind of the owning resource
pub const LABEL_OWNER_KIND: &str = "k8up.syn.tools/owner-kind";

/// Label carrying the name of the owning resource
pub const LABEL_OWNER_NAME: &str = "k8up.syn.tools/owner-name";

/// Collaborators shared by every handler
///
/// Logging goes through the global `tracing` dispatcher.
#[derive(Clone)]
pub struct CommonObjects {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
}

impl CommonObjects {
    pub fn new(client: Client, config: Arc<OperatorConfig>) -> Self {
        Self { client, config }
    }
}

/// Kind of child workload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Job,
    Pod,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Job => "job",
            ChildKind::Pod => "pod",
        }
    }
}

/// Identity of a child workload
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChildKey {
    pub kind: ChildKind,
    pub namespace: String,
    pub name: String,
}

impl ChildKey {
    pub fn new(kind: ChildKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn job(job: &Job) -> Self {
        Self::from_meta(ChildKind::Job, &job.metadata)
    }

    pub fn pod(pod: &Pod) -> Self {
        Self::from_meta(ChildKind::Pod, &pod.metadata)
    }

    /// Child identity for a controller key
    pub fn from_object_key(kind: ChildKind, key: &ObjectKey) -> Self {
        Self {
            kind,
            namespace: key.namespace.clone().unwrap_or_default(),
            name: key.name.clone(),
        }
    }

    fn from_meta(
        kind: ChildKind,
        meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ) -> Self {
        Self {
            kind,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ChildKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind.as_str(), self.namespace, self.name)
    }
}

/// Identity of the resource owning a child workload
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParentRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ParentRef {
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key of the parent within its own controller
    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(&self.namespace, &self.name)
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Lifecycle phase of a child workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ChildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildPhase::Pending => "Pending",
            ChildPhase::Running => "Running",
            ChildPhase::Succeeded => "Succeeded",
            ChildPhase::Failed => "Failed",
        }
    }

    /// Phase named by a status string
    pub fn parse(phase: &str) -> Option<Self> {
        match phase {
            "Pending" => Some(ChildPhase::Pending),
            "Running" => Some(ChildPhase::Running),
            "Succeeded" => Some(ChildPhase::Succeeded),
            "Failed" => Some(ChildPhase::Failed),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ChildPhase::Succeeded | ChildPhase::Failed)
    }

    /// Phase of a job from its conditions and pod counters
    pub fn of_job(job: &Job) -> Self {
        let Some(status) = &job.status else {
            return ChildPhase::Pending;
        };

        for condition in status.conditions.iter().flatten() {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Complete" => return ChildPhase::Succeeded,
                "Failed" => return ChildPhase::Failed,
                _ => {}
            }
        }

        if status.active.unwrap_or(0) > 0 {
            ChildPhase::Running
        } else if status.succeeded.unwrap_or(0) > 0 {
            ChildPhase::Succeeded
        } else {
            ChildPhase::Pending
        }
    }

    /// Phase of a pod
    pub fn of_pod(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Running") => ChildPhase::Running,
            Some("Succeeded") => ChildPhase::Succeeded,
            Some("Failed") => ChildPhase::Failed,
            _ => ChildPhase::Pending,
        }
    }
}

/// Last observed state of a child workload
#[derive(Clone, Debug)]
pub struct ChildState {
    pub parent: ParentRef,
    pub phase: ChildPhase,
    pub updated: DateTime<Utc>,
}

/// Notification that a child of `parent` changed
#[derive(Clone, Debug)]
pub struct ChildEvent {
    pub child: ChildKey,
    pub parent: ParentRef,
    pub phase: ChildPhase,
    pub deleted: bool,
}
