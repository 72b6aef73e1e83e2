//! Shared handling of resources executed as Kubernetes jobs

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::controller::Handler;
use crate::crd::{Backend, RunStatus, SecretKeyRef};
use crate::error::{Error, Result};
use crate::metrics;
use crate::observe::{
    ChildPhase, CommonObjects, ObserverRegistry, ParentRef, LABEL_MANAGED, LABEL_OWNER_KIND,
    LABEL_OWNER_NAME,
};

/// Field manager used for status patches
pub const FIELD_MANAGER: &str = "k8up-operator";

const MAX_NAME_LEN: usize = 63;

/// A persistent volume claim mounted into the job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeClaim {
    pub claim_name: String,
    pub mount_path: String,
}

/// A resource carried out by a single job
pub trait JobBacked:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
    /// Action passed to the job as `-<action>`
    const ACTION: &'static str;

    fn backend(&self) -> &Backend;

    fn run_status(&self) -> Option<&RunStatus>;

    /// Check the spec before any job is spawned
    fn validate(&self) -> Result<()>;

    /// Arguments after the action flag
    fn extra_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Environment beyond the repository settings
    fn extra_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn volumes(&self) -> Vec<VolumeClaim> {
        Vec::new()
    }
}

/// Handler spawning and tracking the job of a [`JobBacked`] resource
pub struct JobHandler<K> {
    common: CommonObjects,
    observer: Arc<ObserverRegistry>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: JobBacked> JobHandler<K> {
    pub fn new(common: CommonObjects, observer: Arc<ObserverRegistry>) -> Self {
        Self {
            common,
            observer,
            _kind: PhantomData,
        }
    }

    async fn update_status(
        &self,
        obj: &K,
        namespace: &str,
        phase: ChildPhase,
        message: &str,
        job_name: Option<&str>,
    ) -> Result<()> {
        let api: Api<K> = Api::namespaced(self.common.client.clone(), namespace);
        let patch = status_patch(obj, phase, message, job_name);
        api.patch_status(
            &obj.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl<K: JobBacked> Handler<K> for JobHandler<K> {
    #[instrument(skip(self, obj), fields(action = K::ACTION, name = %obj.name_any(), namespace = obj.namespace()))]
    async fn reconcile(&self, obj: Arc<K>) -> Result<()> {
        let name = obj.name_any();
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let current = obj.run_status().and_then(|s| s.phase.clone());

        if let Some(phase) = current.as_deref().and_then(ChildPhase::parse) {
            if phase.is_finished() {
                debug!(phase = phase.as_str(), "Already finished, skipping");
                return Ok(());
            }
        }

        if let Err(e) = obj.validate() {
            warn!(error = %e, "Validation failed");
            self.update_status(&obj, &namespace, ChildPhase::Failed, &e.to_string(), None)
                .await?;
            return Ok(());
        }

        let job_name = job_name(K::ACTION, &name);
        let parent = ParentRef::new(&K::kind(&()), &namespace, &name);

        match self.observer.job_phase(&parent) {
            Some(phase) => {
                if current.as_deref() != Some(phase.as_str()) {
                    info!(phase = phase.as_str(), "Job phase changed");
                    let message = format!("Job {} is {}", job_name, phase.as_str().to_lowercase());
                    self.update_status(&obj, &namespace, phase, &message, Some(&job_name))
                        .await?;
                }
            }
            None => {
                let job = build_job(obj.as_ref(), &self.common.config.job_image)?;
                let api: Api<Job> = Api::namespaced(self.common.client.clone(), &namespace);
                match api.create(&PostParams::default(), &job).await {
                    Ok(_) => {
                        metrics::JOBS_CREATED
                            .with_label_values(&[K::ACTION])
                            .inc();
                        info!(job = %job_name, "Created job");
                    }
                    Err(kube::Error::Api(response)) if response.code == 409 => {
                        debug!(job = %job_name, "Job already exists");
                    }
                    Err(e) => return Err(e.into()),
                }

                if current.is_none() {
                    self.update_status(
                        &obj,
                        &namespace,
                        ChildPhase::Pending,
                        "Job created",
                        Some(&job_name),
                    )
                    .await?;
                }
            }
        }

        Ok(())
    }
}

/// Name of the job spawned for a resource, truncated to a valid object name
pub fn job_name(action: &str, name: &str) -> String {
    let mut job_name = format!("{}-{}", action, name);
    job_name.truncate(MAX_NAME_LEN);
    job_name.trim_end_matches('-').to_string()
}

/// Build the job carrying out `obj`
///
/// The job and its pods are labelled with the owner so the observers can
/// attribute them, and the job is controlled by `obj`.
pub fn build_job<K: JobBacked>(obj: &K, image: &str) -> Result<Job> {
    let name = obj.name_any();
    let namespace = obj
        .namespace()
        .ok_or_else(|| Error::permanent(format!("{} {} has no namespace", K::kind(&()), name)))?;
    let owner = obj
        .controller_owner_ref(&())
        .ok_or_else(|| Error::permanent(format!("{} {} has no uid", K::kind(&()), name)))?;

    let labels: BTreeMap<&str, String> = BTreeMap::from([
        (LABEL_MANAGED, "true".to_string()),
        (LABEL_OWNER_KIND, K::kind(&()).to_string()),
        (LABEL_OWNER_NAME, name.clone()),
    ]);

    let mut args = vec![format!("-{}", K::ACTION)];
    args.extend(obj.extra_args());

    let mut env = backend_env(obj.backend());
    env.extend(
        obj.extra_env()
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value })),
    );

    let volumes = obj.volumes();
    let volume_specs: Vec<Value> = volumes
        .iter()
        .map(|v| json!({ "name": v.claim_name, "persistentVolumeClaim": { "claimName": v.claim_name } }))
        .collect();
    let mounts: Vec<Value> = volumes
        .iter()
        .map(|v| json!({ "name": v.claim_name, "mountPath": v.mount_path }))
        .collect();

    let job = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": job_name(K::ACTION, &name),
            "namespace": namespace,
            "labels": labels,
            "ownerReferences": [owner],
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": K::ACTION,
                        "image": image,
                        "args": args,
                        "env": env,
                        "volumeMounts": mounts,
                    }],
                    "volumes": volume_specs,
                }
            }
        }
    });

    Ok(serde_json::from_value(job)?)
}

/// Environment describing the restic repository
fn backend_env(backend: &Backend) -> Vec<Value> {
    let mut env = Vec::new();

    if let Some(s3) = &backend.s3 {
        env.push(json!({
            "name": "RESTIC_REPOSITORY",
            "value": format!("s3:{}/{}", s3.endpoint.trim_end_matches('/'), s3.bucket),
        }));
        if let Some(secret) = &s3.access_key_id_secret_ref {
            env.push(secret_env("AWS_ACCESS_KEY_ID", secret));
        }
        if let Some(secret) = &s3.secret_access_key_secret_ref {
            env.push(secret_env("AWS_SECRET_ACCESS_KEY", secret));
        }
    } else if let Some(path) = &backend.local {
        env.push(json!({ "name": "RESTIC_REPOSITORY", "value": path }));
    }

    if let Some(secret) = &backend.repo_password_secret_ref {
        env.push(secret_env("RESTIC_PASSWORD", secret));
    }

    env
}

pub(crate) fn secret_env(name: &str, secret: &SecretKeyRef) -> Value {
    json!({
        "name": name,
        "valueFrom": { "secretKeyRef": { "name": secret.name, "key": secret.key } }
    })
}

/// Merge patch moving a resource to `phase`
fn status_patch<K: JobBacked>(obj: &K, phase: ChildPhase, message: &str, job_name: Option<&str>) -> Value {
    let now = Utc::now();
    let (ready, reason) = match phase {
        ChildPhase::Succeeded => ("True", "JobSucceeded"),
        ChildPhase::Failed => ("False", "JobFailed"),
        ChildPhase::Pending | ChildPhase::Running => ("False", "JobRunning"),
    };

    let mut status = json!({
        "phase": phase.as_str(),
        "message": message,
        "observedGeneration": obj.meta().generation,
        "conditions": [{
            "type": "Completed",
            "status": ready,
            "lastTransitionTime": now,
            "reason": reason,
            "message": message,
        }]
    });

    if let Some(job_name) = job_name {
        status["jobName"] = json!(job_name);
    }
    if phase == ChildPhase::Pending {
        status["startTime"] = json!(now);
    }
    if phase.is_finished() {
        status["completionTime"] = json!(now);
    }

    json!({ "status": status })
}
