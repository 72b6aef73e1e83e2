//! Helpers shared by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;

use k8up_operator::controller::{Handler, ListWatch, ObjectKey, WatchEvent};
use k8up_operator::{Error, Result};

pub type Events = UnboundedSender<Result<WatchEvent<ConfigMap>>>;

pub fn config_map(name: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced("default", name)
}

/// In-memory list/watch source; the sender feeds the watch stream
pub struct TestSource {
    items: Vec<ConfigMap>,
    events: Mutex<Option<UnboundedReceiver<Result<WatchEvent<ConfigMap>>>>>,
    fail_list: bool,
}

impl TestSource {
    pub fn new(names: &[&str]) -> (Self, Events) {
        let (tx, rx) = unbounded();
        let source = Self {
            items: names.iter().map(|n| config_map(n)).collect(),
            events: Mutex::new(Some(rx)),
            fail_list: false,
        };
        (source, tx)
    }

    /// A source whose initial list fails
    pub fn failing() -> Self {
        Self {
            items: Vec::new(),
            events: Mutex::new(None),
            fail_list: true,
        }
    }
}

#[async_trait]
impl ListWatch<ConfigMap> for TestSource {
    async fn list(&self) -> Result<Vec<ConfigMap>> {
        if self.fail_list {
            return Err(Error::config("resource kind not installed"));
        }
        Ok(self.items.clone())
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent<ConfigMap>>> {
        match self.events.lock().take() {
            Some(rx) => rx.boxed(),
            None => stream::pending().boxed(),
        }
    }
}

/// Reconcile counts per record name
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<HashMap<String, usize>>>);

impl Calls {
    pub fn record(&self, name: &str) {
        *self.0.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, name: &str) -> usize {
        self.0.lock().get(name).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.lock().values().sum()
    }
}

/// What a [`TestHandler`] does with each record
#[derive(Clone, Copy)]
pub enum Behavior {
    Succeed,
    Fail,
    FailPermanently,
    Panic,
}

/// Handler counting invocations and acting per [`Behavior`]
pub struct TestHandler {
    pub calls: Calls,
    pub behavior: Behavior,
    pub cleanups: Arc<Mutex<Vec<ObjectKey>>>,
}

impl TestHandler {
    pub fn new(calls: Calls, behavior: Behavior) -> Self {
        Self {
            calls,
            behavior,
            cleanups: Arc::default(),
        }
    }
}

#[async_trait]
impl Handler<ConfigMap> for TestHandler {
    async fn reconcile(&self, obj: Arc<ConfigMap>) -> Result<()> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        self.calls.record(&name);
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "connection reset",
            ))),
            Behavior::FailPermanently => Err(Error::permanent("cannot be fixed by retrying")),
            Behavior::Panic => panic!("handler exploded for {}", name),
        }
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<()> {
        self.cleanups.lock().push(key.clone());
        Ok(())
    }
}

/// Poll `condition` every 10ms for up to 5s
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
