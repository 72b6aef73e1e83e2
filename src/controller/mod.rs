//! Resource controllers
//!
//! A [`ResourceController`] drives one resource kind. It seeds its store from
//! an initial list, merges watch notifications, external triggers and periodic
//! resyncs into a [`WorkQueue`], and runs a fixed pool of workers that call the
//! kind's [`Handler`]. Failed items are retried up to the configured limit and
//! then dropped until the next event or resync.

mod queue;
mod source;
mod store;

pub use queue::WorkQueue;
pub use source::{KubeSource, ListWatch, WatchEvent};
pub use store::{ObjectKey, Store};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use kube::Resource;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::metrics;

/// Business logic for one resource kind
#[async_trait]
pub trait Handler<K: Send + Sync + 'static>: Send + Sync {
    /// Bring the object toward its declared state
    ///
    /// Errors for which [`Error::is_retryable`] is false are dropped without retry.
    async fn reconcile(&self, obj: Arc<K>) -> Result<()>;

    /// Called when a queued key no longer has a known record
    async fn cleanup(&self, _key: &ObjectKey) -> Result<()> {
        Ok(())
    }
}

/// Everything needed to build the controller for one resource kind
pub struct ControllerBinding<K: Send + Sync + 'static> {
    pub config: ControllerConfig,
    pub source: Box<dyn ListWatch<K>>,
    pub handler: Arc<dyn Handler<K>>,
    /// Extra keys to reconcile, e.g. parents whose child workloads changed
    pub triggers: Option<BoxStream<'static, ObjectKey>>,
}

impl<K: Send + Sync + 'static> ControllerBinding<K> {
    pub fn new(
        config: ControllerConfig,
        source: impl ListWatch<K> + 'static,
        handler: impl Handler<K> + 'static,
    ) -> Self {
        Self {
            config,
            source: Box::new(source),
            handler: Arc::new(handler),
            triggers: None,
        }
    }

    pub fn with_triggers(mut self, triggers: BoxStream<'static, ObjectKey>) -> Self {
        self.triggers = Some(triggers);
        self
    }
}

/// A controller the runtime can start without knowing its resource kind
pub trait Runnable: Send {
    fn name(&self) -> &str;

    /// Run until `shutdown` is cancelled or the controller fails
    fn run(self: Box<Self>, shutdown: CancellationToken) -> BoxFuture<'static, Result<()>>;
}

/// Reconciliation loop for one resource kind
pub struct ResourceController<K: Send + Sync + 'static> {
    shared: Shared<K>,
    source: Box<dyn ListWatch<K>>,
    triggers: Option<BoxStream<'static, ObjectKey>>,
}

/// State shared between the event loop and the workers
struct Shared<K: Send + Sync + 'static> {
    config: Arc<ControllerConfig>,
    handler: Arc<dyn Handler<K>>,
    store: Arc<Store<K>>,
    queue: Arc<WorkQueue>,
}

impl<K: Send + Sync + 'static> Clone for Shared<K> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            handler: self.handler.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<K> ResourceController<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(binding: ControllerBinding<K>) -> Result<Self> {
        binding.config.validate()?;

        Ok(Self {
            shared: Shared {
                config: Arc::new(binding.config),
                handler: binding.handler,
                store: Arc::new(Store::new()),
                queue: Arc::new(WorkQueue::new()),
            },
            source: binding.source,
            triggers: binding.triggers,
        })
    }

    pub fn name(&self) -> &str {
        self.shared.config.name()
    }

    /// Records known to this controller
    pub fn store(&self) -> Arc<Store<K>> {
        self.shared.store.clone()
    }

    /// Pending work of this controller
    pub fn queue(&self) -> Arc<WorkQueue> {
        self.shared.queue.clone()
    }

    /// Run the controller until `shutdown` is cancelled
    ///
    /// Fails only if the initial list fails. On shutdown no new work is
    /// dispatched, in-flight reconciles run to completion, then the watch
    /// is released.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let ResourceController {
            shared,
            source,
            triggers,
        } = self;
        let name = shared.config.name().to_string();

        info!(
            controller = %name,
            workers = shared.config.workers(),
            max_retries = shared.config.max_retries(),
            resync_secs = shared.config.resync_interval().as_secs_f64(),
            "Starting controller"
        );

        let objects = source.list().await.map_err(|e| Error::InitialList {
            controller: name.clone(),
            source: Box::new(e),
        })?;
        for obj in objects {
            let key = shared.store.apply(obj);
            shared.queue.add(key);
        }
        shared.update_gauges();

        let mut workers = JoinSet::new();
        for id in 0..shared.config.workers() {
            let worker = shared.clone();
            workers.spawn(async move { worker.work(id).await });
        }

        let mut watch = source.watch();
        let mut watching = true;
        let mut triggers = triggers.unwrap_or_else(|| stream::pending().boxed()).fuse();

        let period = shared.config.resync_interval();
        let mut resync = interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                // Ahead of the watch so a busy watch cannot starve it
                _ = resync.tick() => shared.resync(),
                Some(key) = triggers.next() => {
                    shared.queue.add(key);
                }
                event = watch.next(), if watching => match event {
                    Some(Ok(event)) => shared.apply_event(event),
                    Some(Err(e)) => warn!(controller = %name, error = %e, "Watch error"),
                    None => {
                        warn!(controller = %name, "Watch stream ended, relying on resync");
                        watching = false;
                    }
                },
            }
        }

        info!(controller = %name, "Stopping controller, draining workers");
        shared.queue.shut_down();
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(controller = %name, error = %e, "Worker task failed");
            }
        }
        drop(watch);

        info!(controller = %name, "Controller stopped");
        Ok(())
    }
}

impl<K> Runnable for ResourceController<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.shared.config.name()
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> BoxFuture<'static, Result<()>> {
        (*self).run(shutdown).boxed()
    }
}

impl<K> Shared<K>
where
    K: Resource + Send + Sync + 'static,
{
    fn apply_event(&self, event: WatchEvent<K>) {
        match event {
            WatchEvent::Applied(obj) => {
                self.queue.add(self.store.apply(obj));
            }
            WatchEvent::Deleted(obj) => {
                self.queue.add(self.store.delete(&obj));
            }
            WatchEvent::Restarted(objects) => {
                let keys = self.store.replace(objects);
                debug!(controller = %self.config.name(), records = self.store.len(), "Watch re-listed");
                for key in keys {
                    self.queue.add(key);
                }
            }
        }
        self.update_gauges();
    }

    /// Queue every known record once
    fn resync(&self) {
        let keys = self.store.keys();
        debug!(controller = %self.config.name(), records = keys.len(), "Resyncing");
        metrics::RESYNCS
            .with_label_values(&[self.config.name()])
            .inc();

        for key in keys {
            self.queue.add(key);
        }
        self.update_gauges();
    }

    fn update_gauges(&self) {
        let name = self.config.name();
        metrics::KNOWN_RECORDS
            .with_label_values(&[name])
            .set(self.store.len() as f64);
        metrics::QUEUE_DEPTH
            .with_label_values(&[name])
            .set(self.queue.len() as f64);
    }

    async fn work(self, id: usize) {
        debug!(controller = %self.config.name(), worker = id, "Worker started");
        while let Some(key) = self.queue.get().await {
            match self.reconcile(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => self.handle_error(&key, e),
            }
            self.queue.done(&key);
            self.update_gauges();
        }
        debug!(controller = %self.config.name(), worker = id, "Worker stopped");
    }

    /// Invoke the handler, converting a panic into an error
    async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
        let name = self.config.name();
        let _timer = metrics::RECONCILE_DURATION
            .with_label_values(&[name])
            .start_timer();
        metrics::RECONCILIATIONS.with_label_values(&[name]).inc();

        let outcome = match self.store.get(key) {
            Some(obj) => AssertUnwindSafe(self.handler.reconcile(obj))
                .catch_unwind()
                .await,
            None => AssertUnwindSafe(self.handler.cleanup(key))
                .catch_unwind()
                .await,
        };

        outcome.unwrap_or_else(|panic| {
            metrics::HANDLER_PANICS.with_label_values(&[name]).inc();
            Err(Error::Panicked(panic_message(panic)))
        })
    }

    fn handle_error(&self, key: &ObjectKey, error: Error) {
        let name = self.config.name();
        let max_retries = self.config.max_retries();
        metrics::RECONCILIATION_ERRORS
            .with_label_values(&[name])
            .inc();

        let retries = self.queue.retries(key);
        if error.is_retryable() && retries < max_retries {
            let attempt = self.queue.retry(key.clone());
            metrics::RETRIES.with_label_values(&[name]).inc();
            warn!(
                controller = %name,
                key = %key,
                error = %error,
                retry = attempt,
                max_retries = max_retries,
                "Reconciliation failed, scheduling retry"
            );
        } else {
            self.queue.forget(key);
            metrics::PERMANENT_FAILURES
                .with_label_values(&[name])
                .inc();
            error!(
                controller = %name,
                key = %key,
                error = %error,
                retries = retries,
                "Reconciliation failed permanently, dropping work item"
            );
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
