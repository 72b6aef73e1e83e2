//! Runtime driving every resource controller of the operator
//!
//! The runtime starts all controllers together, reports each controller's
//! failure without silently stopping the others, and on stop waits for every
//! controller to drain up to a timeout. Kinds that only need registration are
//! initialized once when the runtime is built.

use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Patch, PatchParams},
    Api, Client, CustomResourceExt,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{FailurePolicy, OperatorConfig};
use crate::controller::{panic_message, Runnable};
use crate::error::{Error, Result};
use crate::metrics;

/// A resource kind that is registered once and never watched
#[async_trait]
pub trait KindRegistration: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<()>;
}

/// Registers a custom resource definition by server-side apply
pub struct CrdRegistration<K> {
    client: Client,
    name: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K: CustomResourceExt> CrdRegistration<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            name: K::crd_name().to_string(),
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<K: CustomResourceExt + 'static> KindRegistration for CrdRegistration<K> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        api.patch(
            &self.name,
            &PatchParams::apply("k8up-operator").force(),
            &Patch::Apply(K::crd()),
        )
        .await?;
        Ok(())
    }
}

/// Runtime behaviour settings
#[derive(Clone, Debug)]
pub struct RuntimeOptions {
    /// How long to wait for controllers to drain on stop
    pub shutdown_timeout: Duration,
    /// Reaction to a controller failing
    pub failure_policy: FailurePolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl From<&OperatorConfig> for RuntimeOptions {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            shutdown_timeout: config.shutdown_timeout,
            failure_policy: config.failure_policy,
        }
    }
}

/// All controllers of the operator, run as one unit
pub struct ControllerRuntime {
    controllers: Vec<Box<dyn Runnable>>,
    unavailable: Vec<String>,
    options: RuntimeOptions,
    stop: CancellationToken,
}

impl ControllerRuntime {
    /// Build the runtime, registering the non-reconciled kinds
    ///
    /// A failed registration is logged and the runtime starts without that
    /// kind.
    pub async fn new(
        controllers: Vec<Box<dyn Runnable>>,
        registrations: Vec<Box<dyn KindRegistration>>,
        options: RuntimeOptions,
    ) -> Self {
        let mut unavailable = Vec::new();
        for registration in &registrations {
            match registration.initialize().await {
                Ok(()) => info!(kind = registration.name(), "Registered resource kind"),
                Err(e) => {
                    error!(kind = registration.name(), error = %e, "Error initializing resource kind");
                    unavailable.push(registration.name().to_string());
                }
            }
        }

        Self {
            controllers,
            unavailable,
            options,
            stop: CancellationToken::new(),
        }
    }

    /// Names of the controllers in start order
    pub fn controller_names(&self) -> Vec<String> {
        self.controllers.iter().map(|c| c.name().to_string()).collect()
    }

    /// Kinds whose registration failed
    pub fn unavailable_kinds(&self) -> &[String] {
        &self.unavailable
    }

    /// Token stopping the runtime when cancelled
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Signal every controller to stop
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Run every controller until stopped
    ///
    /// Returns once the stop handle is cancelled (or, under
    /// [`FailurePolicy::ShutdownAll`], a controller failed) and all
    /// controllers drained, or the shutdown timeout elapsed. Returns an error
    /// naming every controller that failed.
    pub async fn run(self) -> Result<()> {
        let ControllerRuntime {
            controllers,
            options,
            stop,
            ..
        } = self;

        info!(controllers = controllers.len(), "Starting controllers");

        let mut tasks = JoinSet::new();
        for controller in controllers {
            let name = controller.name().to_string();
            let shutdown = stop.child_token();
            tasks.spawn(async move {
                let result = AssertUnwindSafe(controller.run(shutdown))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(panic))));
                (name, result)
            });
        }

        let mut failed = Vec::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        info!("All controllers finished");
                        break;
                    };
                    if let Some(name) = report(joined) {
                        failed.push(name);
                        if options.failure_policy == FailurePolicy::ShutdownAll {
                            warn!("Shutting down all controllers after a controller failure");
                            stop.cancel();
                            break;
                        }
                    }
                }
            }
        }

        info!("Stopping controllers");
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Some(name) = report(joined) {
                    failed.push(name);
                }
            }
        };

        let timed_out = tokio::time::timeout(options.shutdown_timeout, drain)
            .await
            .is_err();
        if timed_out {
            warn!(
                timeout_secs = options.shutdown_timeout.as_secs_f64(),
                remaining = tasks.len(),
                "Controllers did not stop in time, giving up waiting"
            );
            tasks.detach_all();
        }

        if !failed.is_empty() {
            return Err(Error::ControllersFailed(failed));
        }
        if timed_out {
            return Err(Error::ShutdownTimeout(options.shutdown_timeout));
        }

        info!("All controllers stopped");
        Ok(())
    }
}

/// Log a finished controller; returns its name if it failed
fn report(joined: std::result::Result<(String, Result<()>), tokio::task::JoinError>) -> Option<String> {
    match joined {
        Ok((name, Ok(()))) => {
            info!(controller = %name, "Controller stopped");
            None
        }
        Ok((name, Err(e))) => {
            error!(controller = %name, error = %e, "Controller failed");
            metrics::CONTROLLER_FAILURES
                .with_label_values(&[name.as_str()])
                .inc();
            Some(name)
        }
        Err(e) => {
            error!(error = %e, "Controller task did not complete");
            Some("unknown".to_string())
        }
    }
}
