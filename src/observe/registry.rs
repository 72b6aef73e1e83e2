//! Shared child-to-parent correlation state

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use futures::{future, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Api, ResourceExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{
    ChildEvent, ChildKey, ChildKind, ChildPhase, ChildState, CommonObjects, ParentRef,
    LABEL_OWNER_KIND, LABEL_OWNER_NAME,
};
use crate::controller::ObjectKey;
use crate::crd::API_GROUP;
use crate::error::{Error, Result};
use crate::metrics;

const EVENT_CAPACITY: usize = 1024;

static INSTANCE: OnceLock<Arc<ObserverRegistry>> = OnceLock::new();

/// Mapping from child workloads to their owning resources
///
/// Each entry is updated atomically, so observers and parent handlers may use
/// the registry concurrently in any order. The common objects are injected
/// once after construction and read lock-free afterwards.
pub struct ObserverRegistry {
    common: OnceLock<CommonObjects>,
    children: DashMap<ChildKey, ChildState>,
    events: broadcast::Sender<ChildEvent>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    /// Create a standalone registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            common: OnceLock::new(),
            children: DashMap::new(),
            events,
        }
    }

    /// Get the process-wide registry, creating it on first use
    pub fn instance() -> Arc<ObserverRegistry> {
        INSTANCE
            .get_or_init(|| Arc::new(ObserverRegistry::new()))
            .clone()
    }

    /// Inject the shared collaborators; may only be called once
    pub fn set_common_objects(&self, common: CommonObjects) -> Result<()> {
        self.common
            .set(common)
            .map_err(|_| Error::AlreadyInitialized("observer common objects"))
    }

    /// Shared collaborators, failing if they were never injected
    pub fn common_objects(&self) -> Result<&CommonObjects> {
        self.common
            .get()
            .ok_or(Error::NotInitialized("observer common objects"))
    }

    pub fn is_initialized(&self) -> bool {
        self.common.get().is_some()
    }

    /// Resolve the owning resource from an object's metadata
    ///
    /// A controller owner reference in the operator's API group wins over the
    /// owner labels. Returns `None` for untagged objects.
    pub fn resolve_owner(meta: &ObjectMeta) -> Option<ParentRef> {
        let namespace = meta.namespace.as_deref()?;

        let owner = meta.owner_references.iter().flatten().find(|owner| {
            owner.controller == Some(true) && api_group(&owner.api_version) == API_GROUP
        });
        if let Some(owner) = owner {
            return Some(ParentRef::new(&owner.kind, namespace, &owner.name));
        }

        let labels = meta.labels.as_ref()?;
        match (labels.get(LABEL_OWNER_KIND), labels.get(LABEL_OWNER_NAME)) {
            (Some(kind), Some(name)) if !kind.is_empty() && !name.is_empty() => {
                Some(ParentRef::new(kind, namespace, name))
            }
            _ => None,
        }
    }

    /// Record the state of a job
    ///
    /// Returns `Ok(None)` when the job has no resolvable owner.
    pub fn observe_job(&self, job: &Job) -> Result<Option<ChildEvent>> {
        self.common_objects()?;

        let child = ChildKey::job(job);
        let Some(parent) = Self::resolve_owner(&job.metadata) else {
            self.miss(&child);
            return Ok(None);
        };

        Ok(Some(self.record(child, parent, ChildPhase::of_job(job))))
    }

    /// Record the state of a pod
    ///
    /// Pods without owner metadata are attributed through their owning job,
    /// fetched from the API if it has not been observed yet.
    pub async fn observe_pod(&self, pod: &Pod) -> Result<Option<ChildEvent>> {
        let common = self.common_objects()?;

        let child = ChildKey::pod(pod);
        let parent = match Self::resolve_owner(&pod.metadata) {
            Some(parent) => Some(parent),
            None => self.owner_via_job(common, pod).await,
        };
        let Some(parent) = parent else {
            self.miss(&child);
            return Ok(None);
        };

        Ok(Some(self.record(child, parent, ChildPhase::of_pod(pod))))
    }

    async fn owner_via_job(&self, common: &CommonObjects, pod: &Pod) -> Option<ParentRef> {
        let namespace = pod.namespace()?;
        let job_name = pod
            .owner_references()
            .iter()
            .find(|owner| owner.kind == "Job")
            .map(|owner| owner.name.clone())?;

        let known = self
            .children
            .get(&ChildKey::new(ChildKind::Job, &namespace, &job_name))
            .map(|state| state.parent.clone());
        if known.is_some() {
            return known;
        }

        let api: Api<Job> = Api::namespaced(common.client.clone(), &namespace);
        match api.get_opt(&job_name).await {
            Ok(Some(job)) => Self::resolve_owner(&job.metadata),
            Ok(None) => None,
            Err(e) => {
                warn!(job = %job_name, namespace = %namespace, error = %e, "Failed to fetch owning job");
                None
            }
        }
    }

    fn record(&self, child: ChildKey, parent: ParentRef, phase: ChildPhase) -> ChildEvent {
        self.children.insert(
            child.clone(),
            ChildState {
                parent: parent.clone(),
                phase,
                updated: Utc::now(),
            },
        );

        metrics::CHILD_EVENTS
            .with_label_values(&[child.kind.as_str(), phase.as_str()])
            .inc();
        debug!(child = %child, parent = %parent, phase = phase.as_str(), "Observed child workload");

        let event = ChildEvent {
            child,
            parent,
            phase,
            deleted: false,
        };
        // No subscribers is fine
        let _ = self.events.send(event.clone());
        event
    }

    fn miss(&self, child: &ChildKey) {
        metrics::CORRELATION_MISSES
            .with_label_values(&[child.kind.as_str()])
            .inc();
        warn!(child = %child, "Dropping child event: no owner could be resolved");
    }

    /// Remove a deleted child, notifying subscribers of its parent
    pub fn forget_child(&self, child: &ChildKey) -> Option<ChildEvent> {
        let (child, state) = self.children.remove(child)?;
        debug!(child = %child, parent = %state.parent, "Child workload removed");

        let event = ChildEvent {
            child,
            parent: state.parent,
            phase: state.phase,
            deleted: true,
        };
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Last known state of one child
    pub fn child(&self, child: &ChildKey) -> Option<ChildState> {
        self.children.get(child).map(|state| state.clone())
    }

    /// Every known child of a parent
    pub fn children_of(&self, parent: &ParentRef) -> Vec<(ChildKey, ChildState)> {
        self.children
            .iter()
            .filter(|entry| &entry.value().parent == parent)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Phase of the most recently updated job owned by `parent`
    pub fn job_phase(&self, parent: &ParentRef) -> Option<ChildPhase> {
        self.children_of(parent)
            .into_iter()
            .filter(|(key, _)| key.kind == ChildKind::Job)
            .max_by_key(|(_, state)| state.updated)
            .map(|(_, state)| state.phase)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Receive every child event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChildEvent> {
        self.events.subscribe()
    }

    /// Keys of parents of `kind` whose children changed
    pub fn parent_events(&self, kind: &str) -> BoxStream<'static, ObjectKey> {
        let kind = kind.to_string();
        stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Observer subscriber lagged, relying on resync");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .filter_map(move |event| {
            future::ready((event.parent.kind == kind).then(|| event.parent.key()))
        })
        .boxed()
    }
}

fn api_group(api_version: &str) -> &str {
    api_version
        .split_once('/')
        .map(|(group, _)| group)
        .unwrap_or("")
}
