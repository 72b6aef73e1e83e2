//! Handlers of the job-observer and pod-observer controllers

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;

use super::{ChildKey, ChildKind, ObserverRegistry};
use crate::controller::{Handler, ObjectKey};
use crate::error::Result;

/// Feeds job changes into the registry
pub struct JobObserver {
    registry: Arc<ObserverRegistry>,
}

impl JobObserver {
    pub fn new(registry: Arc<ObserverRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler<Job> for JobObserver {
    async fn reconcile(&self, job: Arc<Job>) -> Result<()> {
        self.registry.observe_job(&job)?;
        Ok(())
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<()> {
        self.registry
            .forget_child(&ChildKey::from_object_key(ChildKind::Job, key));
        Ok(())
    }
}

/// Feeds pod changes into the registry
pub struct PodObserver {
    registry: Arc<ObserverRegistry>,
}

impl PodObserver {
    pub fn new(registry: Arc<ObserverRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Handler<Pod> for PodObserver {
    async fn reconcile(&self, pod: Arc<Pod>) -> Result<()> {
        self.registry.observe_pod(&pod).await?;
        Ok(())
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<()> {
        self.registry
            .forget_child(&ChildKey::from_object_key(ChildKind::Pod, key));
        Ok(())
    }
}
