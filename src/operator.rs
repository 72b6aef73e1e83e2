//! Assembly of the K8up operator
//!
//! Pairs every tracked resource kind with its configuration, list/watch
//! source and handler, injects the shared collaborators into the observer
//! registry, and builds the [`ControllerRuntime`].

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use tracing::info;

use crate::config::OperatorConfig;
use crate::controller::{ControllerBinding, KubeSource, ResourceController, Runnable};
use crate::crd::{Archive, Backup, Check, PreBackupPod, Prune, Restore, Schedule};
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::observe::{CommonObjects, JobObserver, ObserverRegistry, PodObserver, MANAGED_SELECTOR};
use crate::reconcilers::{JobBacked, JobHandler, ScheduleHandler};
use crate::runtime::{ControllerRuntime, CrdRegistration, KindRegistration, RuntimeOptions};

/// Build the runtime with every K8up controller
///
/// Fails if the observer registry was already wired by someone else.
pub async fn build(client: Client, config: OperatorConfig) -> Result<ControllerRuntime> {
    let config = Arc::new(config);

    // Bring the metrics endpoint up before any controller starts
    let metrics = MetricsRegistry::init(&config.metrics_bind);
    info!(address = %metrics.local_addr(), "Metrics endpoint ready");

    let common = CommonObjects::new(client.clone(), config.clone());
    let observer = ObserverRegistry::instance();
    observer.set_common_objects(common.clone())?;

    let controllers: Vec<Box<dyn Runnable>> = vec![
        job_controller::<Backup>(&client, &config, &common, &observer)?,
        job_controller::<Restore>(&client, &config, &common, &observer)?,
        job_controller::<Archive>(&client, &config, &common, &observer)?,
        Box::new(ResourceController::new(ControllerBinding::new(
            config.controller("schedule"),
            KubeSource::<Schedule>::all(client.clone()),
            ScheduleHandler::new(common.clone()),
        ))?),
        Box::new(ResourceController::new(ControllerBinding::new(
            config.controller("podObserver"),
            KubeSource::<Pod>::all(client.clone()).labels(MANAGED_SELECTOR),
            PodObserver::new(observer.clone()),
        ))?),
        Box::new(ResourceController::new(ControllerBinding::new(
            config.controller("jobObserver"),
            KubeSource::<Job>::all(client.clone()).labels(MANAGED_SELECTOR),
            JobObserver::new(observer.clone()),
        ))?),
        job_controller::<Check>(&client, &config, &common, &observer)?,
        job_controller::<Prune>(&client, &config, &common, &observer)?,
    ];

    let registrations: Vec<Box<dyn KindRegistration>> =
        vec![Box::new(CrdRegistration::<PreBackupPod>::new(client))];

    Ok(ControllerRuntime::new(controllers, registrations, RuntimeOptions::from(config.as_ref())).await)
}

/// Controller of a job-backed kind, re-triggered when its jobs change
fn job_controller<K>(
    client: &Client,
    config: &OperatorConfig,
    common: &CommonObjects,
    observer: &Arc<ObserverRegistry>,
) -> Result<Box<dyn Runnable>>
where
    K: JobBacked,
{
    let binding = ControllerBinding::new(
        config.controller(K::ACTION),
        KubeSource::<K>::all(client.clone()),
        JobHandler::<K>::new(common.clone(), observer.clone()),
    )
    .with_triggers(observer.parent_events(&K::kind(&())));

    Ok(Box::new(ResourceController::new(binding)?))
}
